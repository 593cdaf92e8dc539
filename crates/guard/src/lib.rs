//! Abuse-prevention core for a token faucet.
//!
//! Two rolling-window stores decide whether an identity may receive funds:
//! - [`RequestFrequencyLimiter`] counts requests per address / IP key
//! - [`TokenAllowanceTracker`] sums distributed amounts per address and denomination
//!
//! Both hydrate from a JSON snapshot on start and tolerate a missing or
//! corrupted file. [`DistributionGuard`] combines them behind one lock so the
//! check and the reservation happen atomically.

pub mod allowance;
pub mod config;
pub mod error;
pub mod frequency;
pub mod identity;
pub mod service;
pub mod store;

pub use allowance::{format_remaining_time, AllowanceCheck, AllowanceRecord, AllowanceStats, TokenAllowanceTracker, TokenAmounts};
pub use config::{AllowanceConfig, DistributionAmount, FrequencyLimiterConfig, GuardConfig, RateLimits};
pub use error::{GuardError, GuardResult};
pub use frequency::{RequestFrequencyLimiter, RequestStats};
pub use identity::IdentityKey;
pub use service::{Admission, Denial, DistributionGuard, DistributionRequest, GuardStats, Reservation};
pub use store::SnapshotFile;
