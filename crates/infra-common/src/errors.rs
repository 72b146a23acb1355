//! Infrastructure error type

use thiserror::Error;

/// Result alias for infra-common operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while setting up shared infrastructure
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or missing configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// A global subscriber was already installed
    #[error("Logging already initialized: {0}")]
    LoggingInitialized(String),
}
