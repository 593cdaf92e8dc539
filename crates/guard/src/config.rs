//! Faucet guard configuration

use crate::error::{GuardError, GuardResult};
use faucet_guard_common::utils::config::load_config_with_env;
use faucet_guard_common::utils::logging::LoggingConfig;
use faucet_guard_common::{DAY_MS, HOUR_MS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default rate limits
pub const DEFAULT_ADDRESS_LIMIT: u32 = 1; // requests per window
pub const DEFAULT_IP_LIMIT: u32 = 10; // requests per window
pub const DEFAULT_WINDOW_HOURS: u64 = 24;
/// Longest accepted rolling window (one leap year)
pub const MAX_WINDOW_HOURS: u64 = 24 * 366;

/// Requests allowed per identity class within the rolling window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    #[serde(default = "default_address_limit")]
    pub address: u32,

    #[serde(default = "default_ip_limit")]
    pub ip: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS_LIMIT,
            ip: DEFAULT_IP_LIMIT,
        }
    }
}

fn default_address_limit() -> u32 { DEFAULT_ADDRESS_LIMIT }
fn default_ip_limit() -> u32 { DEFAULT_IP_LIMIT }
fn default_window_hours() -> u64 { DEFAULT_WINDOW_HOURS }
fn default_window_ms() -> i64 { DAY_MS }
fn default_maintenance_interval() -> u64 { 300 }

/// Single-distribution amount for one denomination, in base units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionAmount {
    pub denom: String,
    pub amount: String,
}

impl DistributionAmount {
    pub fn new(denom: impl Into<String>, amount: impl Into<String>) -> Self {
        Self {
            denom: denom.into(),
            amount: amount.into(),
        }
    }
}

/// Construction input for [`crate::RequestFrequencyLimiter`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrequencyLimiterConfig {
    #[serde(default)]
    pub limits: RateLimits,

    pub storage_path: PathBuf,

    #[serde(default = "default_window_ms")]
    pub window_ms: i64,
}

impl FrequencyLimiterConfig {
    pub fn new(limits: RateLimits, storage_path: impl Into<PathBuf>) -> Self {
        Self {
            limits,
            storage_path: storage_path.into(),
            window_ms: DAY_MS,
        }
    }
}

/// Construction input for [`crate::TokenAllowanceTracker`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowanceConfig {
    #[serde(default)]
    pub distribution_amounts: Vec<DistributionAmount>,

    pub storage_path: PathBuf,

    #[serde(default = "default_window_ms")]
    pub window_ms: i64,
}

impl AllowanceConfig {
    pub fn new(distribution_amounts: Vec<DistributionAmount>, storage_path: impl Into<PathBuf>) -> Self {
        Self {
            distribution_amounts,
            storage_path: storage_path.into(),
            window_ms: DAY_MS,
        }
    }
}

/// Faucet guard service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Per-identity request limits
    #[serde(default)]
    pub limits: RateLimits,

    /// Single-distribution amount per denomination; daily cap is 10x
    #[serde(default)]
    pub distribution_amounts: Vec<DistributionAmount>,

    /// Snapshot file for the request-frequency store
    pub request_storage_path: PathBuf,

    /// Snapshot file for the token-allowance store
    pub allowance_storage_path: PathBuf,

    /// Rolling window length in hours
    #[serde(default = "default_window_hours")]
    pub window_hours: u64,

    /// Cleanup + save period for the maintenance task (seconds)
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            limits: RateLimits::default(),
            distribution_amounts: Vec::new(),
            request_storage_path: PathBuf::from("./data/rate-limits.json"),
            allowance_storage_path: PathBuf::from("./data/token-allowances.json"),
            window_hours: DEFAULT_WINDOW_HOURS,
            maintenance_interval_secs: default_maintenance_interval(),
            logging: LoggingConfig::default(),
        }
    }
}

impl GuardConfig {
    /// Load from environment variables with defaults
    pub fn from_env() -> GuardResult<Self> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML/YAML/JSON file; `FAUCET_GUARD__*` variables override it
    pub fn from_file<P: AsRef<Path>>(path: P) -> GuardResult<Self> {
        let mut config: Self = load_config_with_env(path, Some("FAUCET_GUARD"))
            .map_err(|e| GuardError::Config(format!("{:#}", e)))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would disable or break the rolling window
    pub fn validate(&self) -> GuardResult<()> {
        self.window_ms().map(|_| ())
    }

    fn apply_env(&mut self) {
        if let Ok(limit) = std::env::var("FAUCET_GUARD_ADDRESS_LIMIT") {
            self.limits.address = limit.parse().unwrap_or(self.limits.address);
        }

        if let Ok(limit) = std::env::var("FAUCET_GUARD_IP_LIMIT") {
            self.limits.ip = limit.parse().unwrap_or(self.limits.ip);
        }

        if let Ok(path) = std::env::var("FAUCET_GUARD_REQUEST_STORAGE") {
            self.request_storage_path = PathBuf::from(path);
        }

        if let Ok(path) = std::env::var("FAUCET_GUARD_ALLOWANCE_STORAGE") {
            self.allowance_storage_path = PathBuf::from(path);
        }

        if let Ok(hours) = std::env::var("FAUCET_GUARD_WINDOW_HOURS") {
            self.window_hours = hours.parse().unwrap_or(self.window_hours);
        }

        if let Ok(secs) = std::env::var("FAUCET_GUARD_MAINTENANCE_INTERVAL") {
            self.maintenance_interval_secs = secs.parse().unwrap_or(self.maintenance_interval_secs);
        }

        // Format: "uatom=1000000,uosmo=500000"
        if let Ok(amounts) = std::env::var("FAUCET_GUARD_DISTRIBUTION_AMOUNTS") {
            let parsed: Vec<DistributionAmount> = amounts
                .split(',')
                .filter_map(|pair| {
                    let (denom, amount) = pair.split_once('=')?;
                    Some(DistributionAmount::new(denom.trim(), amount.trim()))
                })
                .collect();
            if !parsed.is_empty() {
                self.distribution_amounts = parsed;
            }
        }

        if let Ok(level) = std::env::var("FAUCET_GUARD_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Rolling window in milliseconds; `window_hours` must be in `1..=MAX_WINDOW_HOURS`
    pub fn window_ms(&self) -> GuardResult<i64> {
        if !(1..=MAX_WINDOW_HOURS).contains(&self.window_hours) {
            return Err(GuardError::Config(format!(
                "window_hours must be between 1 and {}, got {}",
                MAX_WINDOW_HOURS, self.window_hours
            )));
        }
        i64::try_from(self.window_hours)
            .ok()
            .and_then(|hours| hours.checked_mul(HOUR_MS))
            .ok_or_else(|| GuardError::Config(format!("window_hours {} overflows", self.window_hours)))
    }

    /// Maintenance task period
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }

    pub fn frequency_config(&self) -> GuardResult<FrequencyLimiterConfig> {
        Ok(FrequencyLimiterConfig {
            limits: self.limits,
            storage_path: self.request_storage_path.clone(),
            window_ms: self.window_ms()?,
        })
    }

    pub fn allowance_config(&self) -> GuardResult<AllowanceConfig> {
        Ok(AllowanceConfig {
            distribution_amounts: self.distribution_amounts.clone(),
            storage_path: self.allowance_storage_path.clone(),
            window_ms: self.window_ms()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_limits() {
        let config = GuardConfig::default();
        assert_eq!(config.limits.address, 1);
        assert_eq!(config.limits.ip, 10);
        assert_eq!(config.window_ms().unwrap(), DAY_MS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_limits_default() {
        let limits: RateLimits = serde_json::from_str(r#"{"ip": 3}"#).unwrap();
        assert_eq!(limits.address, DEFAULT_ADDRESS_LIMIT);
        assert_eq!(limits.ip, 3);

        let config: FrequencyLimiterConfig =
            serde_json::from_str(r#"{"storage_path": "/tmp/x.json"}"#).unwrap();
        assert_eq!(config.limits, RateLimits::default());
        assert_eq!(config.window_ms, DAY_MS);
    }

    #[test]
    fn test_projections_share_window() {
        let config = GuardConfig {
            window_hours: 2,
            distribution_amounts: vec![DistributionAmount::new("uatom", "100")],
            ..Default::default()
        };
        assert_eq!(config.frequency_config().unwrap().window_ms, 2 * HOUR_MS);
        assert_eq!(config.allowance_config().unwrap().window_ms, 2 * HOUR_MS);
        assert_eq!(config.allowance_config().unwrap().distribution_amounts.len(), 1);
    }

    #[test]
    fn test_window_hours_out_of_range() {
        for window_hours in [0, MAX_WINDOW_HOURS + 1, u64::MAX / 2, u64::MAX] {
            let config = GuardConfig {
                window_hours,
                ..Default::default()
            };
            assert!(matches!(config.window_ms(), Err(GuardError::Config(_))), "{}", window_hours);
            assert!(config.validate().is_err());
            assert!(config.frequency_config().is_err());
            assert!(config.allowance_config().is_err());
        }

        let longest = GuardConfig {
            window_hours: MAX_WINDOW_HOURS,
            ..Default::default()
        };
        assert_eq!(longest.window_ms().unwrap(), 366 * DAY_MS);
    }

    #[test]
    fn test_from_file_rejects_zero_window() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
request_storage_path = "/var/lib/faucet/requests.json"
allowance_storage_path = "/var/lib/faucet/allowances.json"
window_hours = 0
"#
        )
        .unwrap();

        assert!(matches!(GuardConfig::from_file(file.path()), Err(GuardError::Config(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
request_storage_path = "/var/lib/faucet/requests.json"
allowance_storage_path = "/var/lib/faucet/allowances.json"

[limits]
address = 2

[[distribution_amounts]]
denom = "uatom"
amount = "1000000"
"#
        )
        .unwrap();

        let config = GuardConfig::from_file(file.path()).unwrap();
        assert_eq!(config.limits.address, 2);
        assert_eq!(config.limits.ip, DEFAULT_IP_LIMIT);
        assert_eq!(config.distribution_amounts[0].amount, "1000000");
        assert_eq!(config.window_hours, DEFAULT_WINDOW_HOURS);
    }

    #[test]
    fn test_from_file_missing() {
        assert!(matches!(
            GuardConfig::from_file("/nonexistent/guard.toml"),
            Err(GuardError::Config(_))
        ));
    }
}
