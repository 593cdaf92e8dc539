//! Request-frequency limiter
//!
//! Counts requests (not amounts) per identity key inside a rolling window,
//! with separate limits for address keys and IP keys.
//!
//! Checking and recording are two separate steps: [`RequestFrequencyLimiter::check_limit`]
//! never mutates state and [`RequestFrequencyLimiter::update`] never checks.
//! Two callers that both check before either updates will both be admitted.
//! Use [`crate::DistributionGuard`] when admission has to be atomic.

use crate::config::{FrequencyLimiterConfig, RateLimits};
use crate::error::GuardResult;
use crate::identity::IdentityKey;
use crate::store::{is_within_window, remaining_until_expiry, SnapshotFile};
use chrono::{DateTime, Utc};
use faucet_guard_common::{Clock, SystemClock, HOUR_MS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Persisted layout: `{ "requests": [[key, [ts, ...]], ...], "lastSaved": "..." }`
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestSnapshot {
    requests: Vec<(String, Vec<i64>)>,
    #[serde(default)]
    last_saved: Option<DateTime<Utc>>,
}

/// Diagnostic view of the limiter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStats {
    /// Keys with at least one timestamp inside the window
    pub active_entries: usize,
    /// Timestamps inside the window across all keys
    pub total_requests: usize,
    pub window_hours: f64,
    pub limits: RateLimits,
}

pub struct RequestFrequencyLimiter {
    limits: RateLimits,
    window_ms: i64,
    requests: BTreeMap<String, Vec<i64>>,
    snapshot: SnapshotFile,
    clock: Arc<dyn Clock>,
}

impl RequestFrequencyLimiter {
    /// Create a limiter on the wall clock, hydrated from `config.storage_path`
    pub fn new(config: FrequencyLimiterConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: FrequencyLimiterConfig, clock: Arc<dyn Clock>) -> Self {
        let snapshot = SnapshotFile::open(&config.storage_path);
        let requests: BTreeMap<String, Vec<i64>> = snapshot
            .load::<RequestSnapshot>()
            .map(|s| s.requests.into_iter().collect())
            .unwrap_or_default();

        info!(
            "Request limiter ready: {} keys, limits address={} ip={}",
            requests.len(),
            config.limits.address,
            config.limits.ip
        );

        Self {
            limits: config.limits,
            window_ms: config.window_ms,
            requests,
            snapshot,
            clock,
        }
    }

    pub fn limits(&self) -> RateLimits {
        self.limits
    }

    pub fn window_ms(&self) -> i64 {
        self.window_ms
    }

    /// Is the address below its request limit on `network`?
    pub async fn check_address(&self, address: &str, network: &str) -> bool {
        let key = IdentityKey::address(address, network);
        self.check_limit(key.as_str(), self.limits.address, "address")
    }

    /// Is the IP below its request limit on `network`?
    pub async fn check_ip(&self, ip: &str, network: &str) -> bool {
        let key = IdentityKey::ip(ip, network);
        self.check_limit(key.as_str(), self.limits.ip, "ip")
    }

    /// `true` while fewer than `limit` requests for `key` fall inside the window.
    ///
    /// Expired timestamps are skipped, not removed; see [`Self::cleanup`].
    pub fn check_limit(&self, key: &str, limit: u32, label: &str) -> bool {
        let now = self.clock.now_millis();
        let count = self.valid_count(key, now);
        let allowed = count < limit as usize;

        debug!(
            "{} limit check for {}: {}/{} -> {}",
            label,
            key,
            count,
            limit,
            if allowed { "allowed" } else { "blocked" }
        );
        allowed
    }

    /// Record a request for `key` at the current time; returns the timestamp stored
    pub fn update(&mut self, key: &str) -> i64 {
        let now = self.clock.now_millis();
        self.update_at(key, now);
        now
    }

    /// Record a request for `key` at `timestamp`
    pub fn update_at(&mut self, key: &str, timestamp: i64) {
        self.requests.entry(key.to_string()).or_default().push(timestamp);
    }

    /// Remove one request recorded for `key` at exactly `timestamp`.
    ///
    /// Returns `false` and leaves the history alone when no such request is stored.
    pub fn forget(&mut self, key: &str, timestamp: i64) -> bool {
        let Some(timestamps) = self.requests.get_mut(key) else {
            return false;
        };
        let Some(index) = timestamps.iter().position(|ts| *ts == timestamp) else {
            return false;
        };
        timestamps.remove(index);
        if timestamps.is_empty() {
            self.requests.remove(key);
        }
        true
    }

    /// Remove expired timestamps; keys left empty are dropped.
    ///
    /// Returns the number of timestamps removed.
    pub fn cleanup(&mut self) -> usize {
        let now = self.clock.now_millis();
        let window = self.window_ms;
        let mut removed = 0;

        self.requests.retain(|_, timestamps| {
            let before = timestamps.len();
            timestamps.retain(|ts| is_within_window(*ts, now, window));
            removed += before - timestamps.len();
            !timestamps.is_empty()
        });

        if removed > 0 {
            info!("Request limiter cleanup removed {} expired entries", removed);
        }
        removed
    }

    /// Milliseconds until the oldest valid request for the address ages out
    pub fn get_remaining_time(&self, address: &str, network: &str) -> u64 {
        let key = IdentityKey::address(address, network);
        self.remaining_time_for_key(key.as_str())
    }

    pub fn remaining_time_for_key(&self, key: &str) -> u64 {
        let now = self.clock.now_millis();
        self.requests
            .get(key)
            .and_then(|timestamps| {
                timestamps
                    .iter()
                    .copied()
                    .filter(|ts| is_within_window(*ts, now, self.window_ms))
                    .min()
            })
            .map(|oldest| remaining_until_expiry(oldest, now, self.window_ms))
            .unwrap_or(0)
    }

    pub fn get_stats(&self) -> RequestStats {
        let now = self.clock.now_millis();
        let mut active_entries = 0;
        let mut total_requests = 0;

        for key in self.requests.keys() {
            let count = self.valid_count(key, now);
            if count > 0 {
                active_entries += 1;
                total_requests += count;
            }
        }

        RequestStats {
            active_entries,
            total_requests,
            window_hours: self.window_ms as f64 / HOUR_MS as f64,
            limits: self.limits,
        }
    }

    /// Number of stored timestamps for `key`, expired ones included
    pub fn stored_count(&self, key: &str) -> usize {
        self.requests.get(key).map_or(0, Vec::len)
    }

    /// Persist the current state; failures are logged, never raised
    pub fn save_data(&self) {
        if let Err(e) = self.try_save() {
            warn!("Failed to save request limiter state to {}: {}", self.snapshot.path().display(), e);
        }
    }

    pub fn try_save(&self) -> GuardResult<()> {
        let snapshot = RequestSnapshot {
            requests: self
                .requests
                .iter()
                .map(|(key, timestamps)| (key.clone(), timestamps.clone()))
                .collect(),
            last_saved: DateTime::from_timestamp_millis(self.clock.now_millis()),
        };
        self.snapshot.save(&snapshot)
    }

    fn valid_count(&self, key: &str, now: i64) -> usize {
        self.requests.get(key).map_or(0, |timestamps| {
            timestamps
                .iter()
                .filter(|ts| is_within_window(**ts, now, self.window_ms))
                .count()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faucet_guard_common::{ManualClock, DAY_MS};
    use std::fs;
    use tempfile::TempDir;

    const START: i64 = 1_700_000_000_000;

    fn new_limiter(dir: &TempDir, limits: RateLimits, clock: &ManualClock) -> RequestFrequencyLimiter {
        let config = FrequencyLimiterConfig::new(limits, dir.path().join("limits.json"));
        RequestFrequencyLimiter::with_clock(config, Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn test_unknown_identity_is_allowed() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(START);
        let limiter = new_limiter(&dir, RateLimits::default(), &clock);

        assert!(limiter.check_address("0xabc", "evm").await);
        assert!(limiter.check_ip("10.0.0.1", "evm").await);
        assert_eq!(limiter.get_remaining_time("0xabc", "evm"), 0);
    }

    #[tokio::test]
    async fn test_blocks_after_limit() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(START);
        let mut limiter = new_limiter(&dir, RateLimits { address: 1, ip: 3 }, &clock);
        let ip_key = IdentityKey::ip("10.0.0.1", "evm");

        for _ in 0..3 {
            assert!(limiter.check_ip("10.0.0.1", "evm").await);
            limiter.update(ip_key.as_str());
            clock.advance(1_000);
        }
        assert!(!limiter.check_ip("10.0.0.1", "evm").await);
        // other network is a different identity
        assert!(limiter.check_ip("10.0.0.1", "cosmos").await);
    }

    #[tokio::test]
    async fn test_check_is_repeatable() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(START);
        let mut limiter = new_limiter(&dir, RateLimits::default(), &clock);
        limiter.update(IdentityKey::address("0xabc", "evm").as_str());

        let first = limiter.check_address("0xabc", "evm").await;
        let second = limiter.check_address("0xabc", "evm").await;
        assert_eq!(first, second);
        assert!(!first);
    }

    #[tokio::test]
    async fn test_window_boundary() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(START);
        let mut limiter = new_limiter(&dir, RateLimits::default(), &clock);
        limiter.update(IdentityKey::address("0xabc", "evm").as_str());

        clock.set(START + DAY_MS - 1);
        assert!(!limiter.check_address("0xabc", "evm").await);
        assert_eq!(limiter.get_remaining_time("0xabc", "evm"), 1);

        clock.set(START + DAY_MS + 1);
        assert!(limiter.check_address("0xabc", "evm").await);
        assert_eq!(limiter.get_remaining_time("0xabc", "evm"), 0);
    }

    #[test]
    fn test_check_does_not_prune() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(START);
        let mut limiter = new_limiter(&dir, RateLimits::default(), &clock);
        let key = IdentityKey::address("0xabc", "evm");
        limiter.update(key.as_str());

        clock.advance(2 * DAY_MS);
        assert!(limiter.check_limit(key.as_str(), 1, "address"));
        assert_eq!(limiter.stored_count(key.as_str()), 1);
    }

    #[test]
    fn test_remaining_time_uses_oldest_valid() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(START);
        let mut limiter = new_limiter(&dir, RateLimits::default(), &clock);
        let key = IdentityKey::address("0xabc", "evm");

        limiter.update(key.as_str());
        clock.advance(HOUR_MS);
        limiter.update(key.as_str());
        clock.advance(HOUR_MS);

        assert_eq!(limiter.get_remaining_time("0xabc", "evm"), (DAY_MS - 2 * HOUR_MS) as u64);

        // first one expired, second one is now the oldest valid
        clock.set(START + DAY_MS + 1);
        assert_eq!(limiter.get_remaining_time("0xabc", "evm"), (HOUR_MS - 1) as u64);
    }

    #[test]
    fn test_cleanup_drops_expired_and_empty_keys() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(START);
        let mut limiter = new_limiter(&dir, RateLimits::default(), &clock);

        limiter.update("old");
        clock.advance(DAY_MS / 2);
        limiter.update("mixed");
        clock.advance(DAY_MS / 2 + 1);
        limiter.update("mixed");
        limiter.update("fresh");

        assert_eq!(limiter.cleanup(), 1);
        assert_eq!(limiter.stored_count("old"), 0);
        assert_eq!(limiter.stored_count("mixed"), 2);

        let stats_once = limiter.get_stats();
        assert_eq!(limiter.cleanup(), 0);
        assert_eq!(limiter.get_stats(), stats_once);
        assert_eq!(stats_once.active_entries, 2);
        assert_eq!(stats_once.total_requests, 3);
    }

    #[test]
    fn test_stats_skip_expired_without_mutation() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(START);
        let mut limiter = new_limiter(&dir, RateLimits { address: 5, ip: 7 }, &clock);

        limiter.update("a");
        clock.advance(DAY_MS + 1);
        limiter.update("b");
        limiter.update("b");

        let stats = limiter.get_stats();
        assert_eq!(stats.active_entries, 1);
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.window_hours, 24.0);
        assert_eq!(stats.limits, RateLimits { address: 5, ip: 7 });
        assert_eq!(limiter.stored_count("a"), 1);
    }

    #[test]
    fn test_forget_removes_only_the_named_timestamp() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(START);
        let mut limiter = new_limiter(&dir, RateLimits::default(), &clock);

        assert!(!limiter.forget("k", START));
        let first = limiter.update("k");
        clock.advance(10);
        let second = limiter.update("k");
        assert_eq!((first, second), (START, START + 10));

        // the older request is forgotten; the newer one keeps counting
        assert!(limiter.forget("k", first));
        assert!(!limiter.forget("k", first));
        assert_eq!(limiter.get_stats().total_requests, 1);
        assert_eq!(limiter.remaining_time_for_key("k"), DAY_MS as u64);

        assert!(!limiter.forget("k", START + 5));
        assert!(limiter.forget("k", second));
        assert_eq!(limiter.stored_count("k"), 0);
    }

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(START);
        let mut limiter = new_limiter(&dir, RateLimits::default(), &clock);
        limiter.update("addr_0xabc_evm");
        limiter.update("addr_0xabc_evm");
        limiter.update("ip_10.0.0.1_evm");
        limiter.try_save().unwrap();

        let reloaded = new_limiter(&dir, RateLimits::default(), &clock);
        assert_eq!(reloaded.stored_count("addr_0xabc_evm"), 2);
        assert_eq!(reloaded.stored_count("ip_10.0.0.1_evm"), 1);
        assert_eq!(reloaded.get_stats(), limiter.get_stats());

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("limits.json")).unwrap()).unwrap();
        assert_eq!(raw["requests"][0][0], "addr_0xabc_evm");
        assert!(raw["lastSaved"].is_string());
    }

    #[test]
    fn test_last_saved_follows_clock() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(START);
        let mut limiter = new_limiter(&dir, RateLimits::default(), &clock);
        limiter.update("k");
        clock.advance(HOUR_MS);
        limiter.try_save().unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("limits.json")).unwrap()).unwrap();
        let saved: DateTime<Utc> = raw["lastSaved"].as_str().unwrap().parse().unwrap();
        assert_eq!(saved.timestamp_millis(), START + HOUR_MS);
    }

    #[tokio::test]
    async fn test_corrupted_snapshot_starts_empty() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("limits.json"), "\u{0}garbage").unwrap();
        let clock = ManualClock::new(START);

        let limiter = new_limiter(&dir, RateLimits::default(), &clock);
        assert_eq!(limiter.get_stats().active_entries, 0);
        assert!(limiter.check_address("0xabc", "evm").await);
    }

    #[test]
    fn test_save_failure_is_swallowed() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(START);
        let mut limiter = new_limiter(&dir, RateLimits::default(), &clock);
        limiter.update("k");
        fs::remove_dir_all(dir.path()).unwrap();

        limiter.save_data();
        assert!(limiter.try_save().is_err());
        assert_eq!(limiter.stored_count("k"), 1);
    }
}
