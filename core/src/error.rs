//! Error types for the flight surety ledger

use thiserror::Error;

/// Main error type for the flight surety ledger
#[derive(Error, Debug)]
pub enum SuretyError {
    // ============ Access Errors ============
    #[error("Ledger is not operational")]
    NotOperational,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    // ============ Lookup Errors ============
    #[error("Not found: {0}")]
    NotFound(String),

    // ============ State Machine Errors ============
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid status code: {0}")]
    InvalidStatusCode(u8),

    // ============ Value Movement Errors ============
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u128, available: u128 },

    #[error("Insufficient credit")]
    InsufficientCredit,

    #[error("External transfer failed: {0}")]
    TransferFailed(String),

    // ============ State Store Errors ============
    #[error("State corruption detected: {0}")]
    StateCorruption(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Serialization failed: {0}")]
    SerializationError(String),

    #[error("Deserialization failed: {0}")]
    DeserializationError(String),

    // ============ Configuration Errors ============
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    // ============ General Errors ============
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SuretyError {
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        SuretyError::Unauthorized(reason.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        SuretyError::NotFound(what.into())
    }

    pub fn invalid_state(reason: impl Into<String>) -> Self {
        SuretyError::InvalidState(reason.into())
    }
}

impl From<std::io::Error> for SuretyError {
    fn from(err: std::io::Error) -> Self {
        SuretyError::StorageError(err.to_string())
    }
}

impl From<bincode::Error> for SuretyError {
    fn from(err: bincode::Error) -> Self {
        SuretyError::SerializationError(err.to_string())
    }
}

impl From<serde_json::Error> for SuretyError {
    fn from(err: serde_json::Error) -> Self {
        SuretyError::SerializationError(err.to_string())
    }
}
