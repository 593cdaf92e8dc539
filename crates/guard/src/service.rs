//! Atomic admission on top of the two stores
//!
//! The stores on their own follow a check-then-update protocol, which lets
//! two concurrent requests for one identity both pass the check. The guard
//! holds both stores behind one mutex and records the request in the same
//! critical section that checks it, so the second request sees the first.

use crate::allowance::{format_remaining_time, AllowanceStats, TokenAllowanceTracker, TokenAmounts};
use crate::config::GuardConfig;
use crate::error::GuardResult;
use crate::frequency::{RequestFrequencyLimiter, RequestStats};
use crate::identity::IdentityKey;
use faucet_guard_common::{Clock, SystemClock};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One faucet request as seen by the guard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionRequest {
    pub address: String,
    pub ip: Option<String>,
    pub network: String,
    /// Denomination -> requested amount
    pub tokens: TokenAmounts,
}

impl DistributionRequest {
    pub fn new(address: impl Into<String>, network: impl Into<String>, tokens: TokenAmounts) -> Self {
        Self {
            address: address.into(),
            ip: None,
            network: network.into(),
            tokens,
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    fn address_key(&self) -> IdentityKey {
        IdentityKey::address(&self.address, &self.network)
    }

    fn ip_key(&self) -> Option<IdentityKey> {
        self.ip.as_deref().map(|ip| IdentityKey::ip(ip, &self.network))
    }
}

/// Why a request was turned away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    AddressLimited,
    IpLimited,
    AllowanceExceeded {
        available: BTreeMap<String, BigUint>,
    },
}

/// What one granted admission wrote to the stores.
///
/// Handed back to [`DistributionGuard::release`] when the transfer fails.
/// Not `Clone`: releasing consumes it, so one grant is undone at most once.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a reservation that is dropped can no longer be released"]
pub struct Reservation {
    address: String,
    address_key: IdentityKey,
    ip_key: Option<IdentityKey>,
    denoms: Vec<String>,
    timestamp: i64,
}

impl Reservation {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Time at which the request was recorded
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

/// Result of [`DistributionGuard::admit`]
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    /// Recorded in both stores; pass `reservation` to
    /// [`DistributionGuard::release`] if the transfer fails
    Granted {
        available: BTreeMap<String, BigUint>,
        reservation: Reservation,
    },
    Denied {
        reason: Denial,
        retry_after_ms: u64,
    },
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted { .. })
    }

    pub fn reservation(self) -> Option<Reservation> {
        match self {
            Admission::Granted { reservation, .. } => Some(reservation),
            Admission::Denied { .. } => None,
        }
    }

    /// Human-readable retry hint, e.g. `"3h 12m"`
    pub fn retry_after(&self) -> Option<String> {
        match self {
            Admission::Denied { retry_after_ms, .. } => Some(format_remaining_time(*retry_after_ms)),
            Admission::Granted { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardStats {
    pub requests: RequestStats,
    pub allowances: AllowanceStats,
}

/// Both stores owned together
pub struct GuardState {
    pub limiter: RequestFrequencyLimiter,
    pub tracker: TokenAllowanceTracker,
}

pub struct DistributionGuard {
    state: Mutex<GuardState>,
}

impl DistributionGuard {
    /// Build both stores from `config`, hydrating them from disk
    pub fn new(config: &GuardConfig) -> GuardResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &GuardConfig, clock: Arc<dyn Clock>) -> GuardResult<Self> {
        let limiter = RequestFrequencyLimiter::with_clock(config.frequency_config()?, clock.clone());
        let tracker = TokenAllowanceTracker::with_clock(config.allowance_config()?, clock)?;
        Ok(Self::from_parts(limiter, tracker))
    }

    pub fn from_parts(limiter: RequestFrequencyLimiter, tracker: TokenAllowanceTracker) -> Self {
        Self {
            state: Mutex::new(GuardState { limiter, tracker }),
        }
    }

    /// Check every limit and, when all pass, record the request before
    /// releasing the lock.
    pub async fn admit(&self, request: &DistributionRequest) -> GuardResult<Admission> {
        let mut state = self.state.lock().await;
        let address_key = request.address_key();
        let ip_key = request.ip_key();

        if !state.limiter.check_address(&request.address, &request.network).await {
            let retry_after_ms = state.limiter.remaining_time_for_key(address_key.as_str());
            debug!("Denied {}: address limit", address_key);
            return Ok(Admission::Denied {
                reason: Denial::AddressLimited,
                retry_after_ms,
            });
        }

        if let (Some(ip), Some(key)) = (request.ip.as_deref(), ip_key.as_ref()) {
            if !state.limiter.check_ip(ip, &request.network).await {
                let retry_after_ms = state.limiter.remaining_time_for_key(key.as_str());
                debug!("Denied {}: ip limit", key);
                return Ok(Admission::Denied {
                    reason: Denial::IpLimited,
                    retry_after_ms,
                });
            }
        }

        let check = state.tracker.check_allowance(&request.address, &request.tokens).await?;
        if !check.allowed {
            let retry_after_ms = state.tracker.get_remaining_reset_time(&request.address);
            debug!("Denied {}: allowance exceeded", address_key);
            return Ok(Admission::Denied {
                reason: Denial::AllowanceExceeded {
                    available: check.available,
                },
                retry_after_ms,
            });
        }

        // one clock read, so every store records the same instant
        let timestamp = state.limiter.update(address_key.as_str());
        if let Some(key) = &ip_key {
            state.limiter.update_at(key.as_str(), timestamp);
        }
        state.tracker.update_allowance_at(&request.address, &request.tokens, timestamp);

        info!("Admitted distribution to {} on {}", request.address, request.network);
        Ok(Admission::Granted {
            available: check.available,
            reservation: Reservation {
                address: request.address.clone(),
                address_key,
                ip_key,
                denoms: request.tokens.keys().cloned().collect(),
                timestamp,
            },
        })
    }

    /// Undo a granted admission whose transfer did not go through.
    ///
    /// Removes exactly the entries the grant recorded. Entries already gone,
    /// e.g. compacted after expiry, are skipped and nothing else is touched.
    /// Returns whether anything was removed.
    pub async fn release(&self, reservation: Reservation) -> bool {
        let mut state = self.state.lock().await;
        let Reservation {
            address,
            address_key,
            ip_key,
            denoms,
            timestamp,
        } = reservation;

        let mut removed = state.limiter.forget(address_key.as_str(), timestamp);
        if let Some(key) = &ip_key {
            removed |= state.limiter.forget(key.as_str(), timestamp);
        }
        for denom in &denoms {
            removed |= state.tracker.forget(&address, denom, timestamp);
        }

        if removed {
            info!("Released reservation for {} at {}", address_key, timestamp);
        } else {
            debug!("Reservation for {} at {} already gone", address_key, timestamp);
        }
        removed
    }

    /// Compact both stores; returns the number of expired timestamps removed
    pub async fn cleanup(&self) -> usize {
        let mut state = self.state.lock().await;
        state.limiter.cleanup() + state.tracker.cleanup()
    }

    /// Persist both stores, logging failures
    pub async fn save(&self) {
        let state = self.state.lock().await;
        state.limiter.save_data();
        state.tracker.save_data();
    }

    pub async fn stats(&self) -> GuardStats {
        let state = self.state.lock().await;
        GuardStats {
            requests: state.limiter.get_stats(),
            allowances: state.tracker.get_stats(),
        }
    }

    pub async fn remaining_reset_time(&self, address: &str) -> u64 {
        self.state.lock().await.tracker.get_remaining_reset_time(address)
    }

    /// Direct access to the stores for read-only inspection or custom flows
    pub async fn lock(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().await
    }

    /// Periodically compact and save both stores until the handle is aborted
    pub fn spawn_maintenance(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = self.cleanup().await;
                self.save().await;
                if removed > 0 {
                    info!("Maintenance removed {} expired entries", removed);
                } else {
                    debug!("Maintenance pass complete");
                }
            }
        })
    }

    /// Final cleanup and save, for service shutdown
    pub async fn shutdown(&self) {
        let removed = self.cleanup().await;
        let state = self.state.lock().await;
        if let Err(e) = state.limiter.try_save() {
            warn!("Request limiter not saved on shutdown: {}", e);
        }
        if let Err(e) = state.tracker.try_save() {
            warn!("Allowance tracker not saved on shutdown: {}", e);
        }
        info!("Guard shut down ({} expired entries removed)", removed);
    }
}
