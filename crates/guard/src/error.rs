//! Error types for the faucet guard

use thiserror::Error;

/// Faucet guard errors
#[derive(Error, Debug)]
pub enum GuardError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid amount for {denom}: {value:?}")]
    InvalidAmount { denom: String, value: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl GuardError {
    pub fn invalid_amount(denom: &str, value: &str) -> Self {
        GuardError::InvalidAmount {
            denom: denom.to_string(),
            value: value.to_string(),
        }
    }
}

pub type GuardResult<T> = Result<T, GuardError>;
