//! Token allowance tracker
//!
//! Sums distributed amounts per (address, denomination) inside a rolling
//! window. Each denomination is capped at ten single distributions.
//!
//! Amounts are `BigUint` throughout: 18-decimal tokens overflow `u64` after
//! roughly 18 whole tokens. Like the request limiter, checking and recording
//! are separate steps and the caller is expected to check first.

use crate::config::AllowanceConfig;
use crate::error::{GuardError, GuardResult};
use crate::store::{amount_string, is_within_window, remaining_until_expiry, SnapshotFile};
use chrono::{DateTime, Utc};
use faucet_guard_common::{Clock, SystemClock, HOUR_MS, MINUTE_MS};
use num_bigint::BigUint;
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Daily cap as a multiple of the single-distribution amount
pub const DAILY_LIMIT_MULTIPLIER: u32 = 10;

/// Denomination -> decimal amount string, as supplied by the request layer
pub type TokenAmounts = BTreeMap<String, String>;

/// Distributions of one denomination to one address
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AllowanceRecord {
    /// Always `timestamps.len() * single amount`; recomputed on load
    #[serde(
        default,
        serialize_with = "amount_string::serialize",
        deserialize_with = "amount_string::deserialize_lenient"
    )]
    pub amount: BigUint,
    pub timestamps: Vec<i64>,
}

/// Outcome of [`TokenAllowanceTracker::check_allowance`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowanceCheck {
    /// Every requested denomination fits its remaining allowance
    pub allowed: bool,
    /// Remaining allowance per requested denomination
    pub available: BTreeMap<String, BigUint>,
}

impl AllowanceCheck {
    /// Denominations whose request exceeded the remaining allowance
    pub fn blocked<'a>(&'a self, requested: &'a TokenAmounts) -> impl Iterator<Item = &'a str> + 'a {
        requested.iter().filter_map(move |(denom, amount)| {
            let wanted = BigUint::from_str(amount).ok()?;
            let available = self.available.get(denom)?;
            (wanted > *available).then_some(denom.as_str())
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowanceStats {
    /// Addresses with at least one distribution inside the window
    pub active_addresses: usize,
    /// Distributions inside the window across all addresses and denominations
    pub total_distributions: usize,
    pub window_hours: f64,
    /// Denomination -> daily cap, as decimal strings
    pub daily_limits: BTreeMap<String, String>,
}

/// Persisted layout:
/// `{ "allowances": [[address, [[denom, {amount, timestamps}], ...]], ...], "lastSaved": "..." }`
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AllowanceSnapshot {
    allowances: Vec<(String, Vec<(String, AllowanceRecord)>)>,
    #[serde(default)]
    last_saved: Option<DateTime<Utc>>,
}

pub struct TokenAllowanceTracker {
    single_amounts: BTreeMap<String, BigUint>,
    daily_limits: BTreeMap<String, BigUint>,
    window_ms: i64,
    allowances: BTreeMap<String, BTreeMap<String, AllowanceRecord>>,
    snapshot: SnapshotFile,
    clock: Arc<dyn Clock>,
}

impl TokenAllowanceTracker {
    /// Create a tracker on the wall clock, hydrated from `config.storage_path`.
    ///
    /// Fails only when a configured amount is not an unsigned decimal integer.
    pub fn new(config: AllowanceConfig) -> GuardResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: AllowanceConfig, clock: Arc<dyn Clock>) -> GuardResult<Self> {
        let mut single_amounts = BTreeMap::new();
        let mut daily_limits = BTreeMap::new();

        for entry in &config.distribution_amounts {
            let amount = BigUint::from_str(entry.amount.trim())
                .map_err(|_| GuardError::invalid_amount(&entry.denom, &entry.amount))?;
            daily_limits.insert(entry.denom.clone(), &amount * DAILY_LIMIT_MULTIPLIER);
            single_amounts.insert(entry.denom.clone(), amount);
        }

        let snapshot = SnapshotFile::open(&config.storage_path);
        let mut allowances: BTreeMap<String, BTreeMap<String, AllowanceRecord>> = BTreeMap::new();

        if let Some(loaded) = snapshot.load::<AllowanceSnapshot>() {
            for (address, denoms) in loaded.allowances {
                let records = allowances.entry(address).or_default();
                for (denom, mut record) in denoms {
                    // stored amount is a cache; the timestamps are authoritative
                    record.amount = single_amounts
                        .get(&denom)
                        .map(|single| single * record.timestamps.len())
                        .unwrap_or_default();
                    records.insert(denom, record);
                }
            }
        }

        let tracker = Self {
            single_amounts,
            daily_limits,
            window_ms: config.window_ms,
            allowances,
            snapshot,
            clock,
        };

        info!(
            "Allowance tracker ready: {} addresses, {} denominations configured",
            tracker.allowances.len(),
            tracker.daily_limits.len()
        );
        Ok(tracker)
    }

    pub fn window_ms(&self) -> i64 {
        self.window_ms
    }

    /// Configured single-distribution amount, zero when `denom` is unknown
    pub fn get_single_amount(&self, denom: &str) -> BigUint {
        self.single_amounts.get(denom).cloned().unwrap_or_default()
    }

    /// Daily cap for `denom`, zero when unknown
    pub fn daily_limit(&self, denom: &str) -> BigUint {
        self.daily_limits.get(denom).cloned().unwrap_or_default()
    }

    /// Check every requested denomination against its remaining allowance.
    ///
    /// A single over-quota denomination blocks the request; `available` is
    /// still reported for all of them.
    pub async fn check_allowance(&self, address: &str, requested: &TokenAmounts) -> GuardResult<AllowanceCheck> {
        let now = self.clock.now_millis();
        let mut allowed = true;
        let mut available = BTreeMap::new();

        for (denom, amount) in requested {
            let wanted = BigUint::from_str(amount.trim())
                .map_err(|_| GuardError::invalid_amount(denom, amount))?;

            let used = self.amount_for(denom, self.valid_count(address, denom, now));
            let limit = self.daily_limit(denom);
            let remaining = if limit > used { limit - &used } else { BigUint::zero() };

            if wanted > remaining {
                debug!(
                    "Allowance exceeded for {} {}: wanted {}, used {}, available {}",
                    address, denom, wanted, used, remaining
                );
                allowed = false;
            }
            available.insert(denom.clone(), remaining);
        }

        Ok(AllowanceCheck { allowed, available })
    }

    /// Record one distribution per denomination in `distributed`.
    ///
    /// Only the keys are used: every distribution counts as one single amount.
    /// Returns the timestamp stored for each of them.
    pub fn update_allowance(&mut self, address: &str, distributed: &TokenAmounts) -> i64 {
        let now = self.clock.now_millis();
        self.update_allowance_at(address, distributed, now);
        now
    }

    /// [`Self::update_allowance`] with an explicit timestamp
    pub fn update_allowance_at(&mut self, address: &str, distributed: &TokenAmounts, timestamp: i64) {
        for denom in distributed.keys() {
            let count = {
                let record = self
                    .allowances
                    .entry(address.to_string())
                    .or_default()
                    .entry(denom.clone())
                    .or_default();
                record.timestamps.push(timestamp);
                record.timestamps.len()
            };
            let amount = self.amount_for(denom, count);
            if let Some(record) = self.record_mut(address, denom) {
                record.amount = amount;
            }
        }
        debug!("Recorded distribution to {}: {:?}", address, distributed.keys().collect::<Vec<_>>());
    }

    /// Remove one distribution of `denom` to `address` recorded at exactly
    /// `timestamp`, shrinking the amount by one single distribution.
    ///
    /// Returns `false` and changes nothing when no such distribution is stored.
    pub fn forget(&mut self, address: &str, denom: &str, timestamp: i64) -> bool {
        let remaining = {
            let Some(record) = self.record_mut(address, denom) else {
                return false;
            };
            let Some(index) = record.timestamps.iter().position(|ts| *ts == timestamp) else {
                return false;
            };
            record.timestamps.remove(index);
            record.timestamps.len()
        };

        let amount = self.amount_for(denom, remaining);
        if let Some(records) = self.allowances.get_mut(address) {
            if remaining == 0 {
                records.remove(denom);
            } else if let Some(record) = records.get_mut(denom) {
                record.amount = amount;
            }
            if records.is_empty() {
                self.allowances.remove(address);
            }
        }
        true
    }

    /// Drop expired timestamps and recompute amounts; empty denominations and
    /// addresses are removed. Returns the number of timestamps removed.
    pub fn cleanup(&mut self) -> usize {
        let now = self.clock.now_millis();
        let window = self.window_ms;
        let single_amounts = &self.single_amounts;
        let mut removed = 0;

        self.allowances.retain(|_, records| {
            records.retain(|denom, record| {
                let before = record.timestamps.len();
                record.timestamps.retain(|ts| is_within_window(*ts, now, window));
                removed += before - record.timestamps.len();
                record.amount = single_amounts
                    .get(denom)
                    .map(|single| single * record.timestamps.len())
                    .unwrap_or_default();
                !record.timestamps.is_empty()
            });
            !records.is_empty()
        });

        if removed > 0 {
            info!("Allowance cleanup removed {} expired distributions", removed);
        }
        removed
    }

    /// Milliseconds until the address's oldest valid distribution, across all
    /// denominations, leaves the window
    pub fn get_remaining_reset_time(&self, address: &str) -> u64 {
        let now = self.clock.now_millis();
        self.allowances
            .get(address)
            .and_then(|records| {
                records
                    .values()
                    .flat_map(|record| record.timestamps.iter().copied())
                    .filter(|ts| is_within_window(*ts, now, self.window_ms))
                    .min()
            })
            .map(|oldest| remaining_until_expiry(oldest, now, self.window_ms))
            .unwrap_or(0)
    }

    /// See [`format_remaining_time`]
    pub fn format_remaining_time(&self, milliseconds: u64) -> String {
        format_remaining_time(milliseconds)
    }

    /// Amount distributed to `address` per denomination inside the window
    pub fn usage(&self, address: &str) -> BTreeMap<String, BigUint> {
        let now = self.clock.now_millis();
        self.allowances
            .get(address)
            .map(|records| {
                records
                    .keys()
                    .map(|denom| (denom.clone(), self.amount_for(denom, self.valid_count(address, denom, now))))
                    .filter(|(_, used)| !used.is_zero())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Stored record, expired timestamps included
    pub fn record(&self, address: &str, denom: &str) -> Option<&AllowanceRecord> {
        self.allowances.get(address)?.get(denom)
    }

    /// Every stored (address, denom, record), expired timestamps included
    pub fn records(&self) -> impl Iterator<Item = (&str, &str, &AllowanceRecord)> {
        self.allowances.iter().flat_map(|(address, records)| {
            records
                .iter()
                .map(move |(denom, record)| (address.as_str(), denom.as_str(), record))
        })
    }

    pub fn get_stats(&self) -> AllowanceStats {
        let now = self.clock.now_millis();
        let mut active_addresses = 0;
        let mut total_distributions = 0;

        for (address, records) in &self.allowances {
            let count: usize = records
                .keys()
                .map(|denom| self.valid_count(address, denom, now))
                .sum();
            if count > 0 {
                active_addresses += 1;
                total_distributions += count;
            }
        }

        AllowanceStats {
            active_addresses,
            total_distributions,
            window_hours: self.window_ms as f64 / HOUR_MS as f64,
            daily_limits: self
                .daily_limits
                .iter()
                .map(|(denom, limit)| (denom.clone(), limit.to_string()))
                .collect(),
        }
    }

    /// Persist the current state; failures are logged, never raised
    pub fn save_data(&self) {
        if let Err(e) = self.try_save() {
            warn!("Failed to save allowance state to {}: {}", self.snapshot.path().display(), e);
        }
    }

    pub fn try_save(&self) -> GuardResult<()> {
        let snapshot = AllowanceSnapshot {
            allowances: self
                .allowances
                .iter()
                .map(|(address, records)| {
                    let denoms = records
                        .iter()
                        .map(|(denom, record)| (denom.clone(), record.clone()))
                        .collect();
                    (address.clone(), denoms)
                })
                .collect(),
            last_saved: DateTime::from_timestamp_millis(self.clock.now_millis()),
        };
        self.snapshot.save(&snapshot)
    }

    fn valid_count(&self, address: &str, denom: &str, now: i64) -> usize {
        self.record(address, denom).map_or(0, |record| {
            record
                .timestamps
                .iter()
                .filter(|ts| is_within_window(**ts, now, self.window_ms))
                .count()
        })
    }

    fn amount_for(&self, denom: &str, count: usize) -> BigUint {
        self.get_single_amount(denom) * count
    }

    fn record_mut(&mut self, address: &str, denom: &str) -> Option<&mut AllowanceRecord> {
        self.allowances.get_mut(address)?.get_mut(denom)
    }
}

/// `"<H>h <M>m"` from one hour up, `"<M>m"` below; seconds are truncated
pub fn format_remaining_time(milliseconds: u64) -> String {
    let hours = milliseconds / HOUR_MS as u64;
    let minutes = (milliseconds % HOUR_MS as u64) / MINUTE_MS as u64;

    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m", minutes)
    }
}
