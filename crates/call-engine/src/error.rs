//! Error types for the call engine

use rdial_event_bus::{EventBusError, StoreError};
use rdial_switch_control::SwitchError;
use thiserror::Error;

/// Result type for call engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in the call engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// The switch refused a command or the connection dropped
    #[error("Switch error: {0}")]
    Switch(#[from] SwitchError),

    /// Publishing or subscribing failed
    #[error("Event bus error: {0}")]
    Events(#[from] EventBusError),

    /// The fast ephemeral store failed
    #[error("Ephemeral store error: {0}")]
    Ephemeral(#[from] StoreError),

    /// The durable store failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// No durable or live record for the call
    #[error("Call not found: {0}")]
    CallNotFound(String),

    /// No durable record for the lead
    #[error("Lead not found: {0}")]
    LeadNotFound(String),

    /// Caller supplied a value we cannot act on
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl EngineError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create a call not found error
    pub fn call_not_found(call_id: impl Into<String>) -> Self {
        Self::CallNotFound(call_id.into())
    }

    /// Whether the caller asked for something that does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::CallNotFound(_) | Self::LeadNotFound(_))
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
