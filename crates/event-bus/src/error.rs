//! Event bus errors

use thiserror::Error;

use crate::store::StoreError;

/// Result type for event bus operations
pub type Result<T> = std::result::Result<T, EventBusError>;

#[derive(Debug, Error)]
pub enum EventBusError {
    /// The fast store failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// An event could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stream entry was missing a required field
    #[error("Malformed stream entry {id}: {reason}")]
    MalformedEntry { id: String, reason: String },
}
