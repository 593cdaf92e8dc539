//! JSON snapshot persistence and rolling-window arithmetic shared by both stores.
//!
//! A snapshot is loaded once at construction and rewritten on demand. Reads
//! never fail: a missing or undecodable file yields `None` and the caller
//! starts empty. Writes go to a sibling temporary file that is synced to disk
//! before it is renamed into place.

use crate::error::GuardResult;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// On-disk location of one store's snapshot
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    /// Bind to `path`, creating its parent directory if needed.
    ///
    /// A directory that cannot be created is logged; the later save will
    /// report the same problem.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!("Cannot create storage directory {}: {}", parent.display(), e);
            }
        }
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and decode the snapshot, or `None` if absent or corrupted
    pub fn load<T: DeserializeOwned>(&self) -> Option<T> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No snapshot at {}, starting empty", self.path.display());
                return None;
            }
            Err(e) => {
                warn!("Cannot read snapshot {}: {}, starting empty", self.path.display(), e);
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(snapshot) => {
                info!("Loaded snapshot from {}", self.path.display());
                Some(snapshot)
            }
            Err(e) => {
                warn!("Corrupted snapshot {}: {}, starting empty", self.path.display(), e);
                None
            }
        }
    }

    /// Encode and write the snapshot
    pub fn save<T: Serialize>(&self, snapshot: &T) -> GuardResult<()> {
        let encoded = serde_json::to_vec_pretty(snapshot)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        if let Err(e) = write_synced(&tmp, &encoded).and_then(|_| fs::rename(&tmp, &self.path)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        self.sync_parent();

        debug!("Saved {} bytes to {}", encoded.len(), self.path.display());
        Ok(())
    }

    /// Make the rename itself durable
    #[cfg(unix)]
    fn sync_parent(&self) {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
                debug!("Cannot sync directory {}: {}", parent.display(), e);
            }
        }
    }

    #[cfg(not(unix))]
    fn sync_parent(&self) {}
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.flush()?;
    file.sync_all()
}

/// An event is valid iff `ts >= now - window`
pub fn is_within_window(timestamp: i64, now: i64, window_ms: i64) -> bool {
    timestamp >= now.saturating_sub(window_ms)
}

/// Milliseconds until `oldest` leaves the window, never negative
pub fn remaining_until_expiry(oldest: i64, now: i64, window_ms: i64) -> u64 {
    let elapsed = now.saturating_sub(oldest);
    window_ms.saturating_sub(elapsed).max(0) as u64
}

/// Serde adapter writing `BigUint` as a decimal string
pub mod amount_string {
    use num_bigint::BigUint;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use serde_json::Value;
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_str_radix(10))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigUint, D::Error> {
        let raw = String::deserialize(deserializer)?;
        BigUint::from_str(&raw).map_err(|e| D::Error::custom(format!("invalid amount {:?}: {}", raw, e)))
    }

    /// Decode a cached amount that is recomputed after load.
    ///
    /// Accepts a decimal string or a JSON integer; anything else decodes as zero
    /// instead of rejecting the surrounding snapshot.
    pub fn deserialize_lenient<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigUint, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::String(raw) => BigUint::from_str(raw.trim()).unwrap_or_default(),
            Value::Number(n) => n.as_u64().map(BigUint::from).unwrap_or_default(),
            _ => BigUint::default(),
        })
    }
}
