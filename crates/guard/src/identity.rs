//! Identity keys for the request-frequency store

use std::fmt;

/// Composite key naming a rate-limited subject on a given network.
///
/// The store treats keys as opaque; the class prefix keeps an address and an
/// IP with the same spelling from sharing a history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey(String);

impl IdentityKey {
    /// `addr_<address>_<network>`
    pub fn address(address: &str, network: &str) -> Self {
        Self(format!("addr_{}_{}", address, network))
    }

    /// `ip_<ip>_<network>`
    pub fn ip(ip: &str, network: &str) -> Self {
        Self(format!("ip_{}_{}", ip, network))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for IdentityKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
