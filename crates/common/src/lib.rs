//! Shared plumbing for the faucet guard workspace: logging bootstrap,
//! configuration loading and the clock abstraction used by every
//! time-windowed store.

pub mod error;
pub mod utils;

pub use error::{CommonError, Result};
pub use utils::clock::{Clock, ManualClock, SystemClock, DAY_MS, HOUR_MS, MINUTE_MS};
