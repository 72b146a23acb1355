//! Error types for the switch control client

use thiserror::Error;

/// Result type for switch control operations
pub type Result<T> = std::result::Result<T, SwitchError>;

/// Errors that can occur while talking to the switch
#[derive(Debug, Error)]
pub enum SwitchError {
    /// Socket level failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The switch refused our credentials
    #[error("Authentication failed: {reply}")]
    AuthFailed { reply: String },

    /// The switch answered a command with `-ERR`
    #[error("Command '{command}' failed: {reply}")]
    CommandFailed { command: String, reply: String },

    /// Malformed frame on the wire
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// The connection closed while a reply or event was pending
    #[error("Connection closed")]
    ConnectionClosed,

    /// No connection is currently established
    #[error("Not connected to switch")]
    NotConnected,

    /// The channel hung up while we were driving it
    #[error("Channel hung up: {cause}")]
    Hangup { cause: String },

    /// A reply did not arrive in time
    #[error("Operation '{operation}' timed out after {millis} ms")]
    Timeout { operation: String, millis: u64 },
}

impl SwitchError {
    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a command failure
    pub fn command_failed(command: impl Into<String>, reply: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            reply: reply.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, duration: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            millis: duration.as_millis() as u64,
        }
    }

    /// True when the connection (or the channel behind it) is gone
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::ConnectionClosed | Self::NotConnected | Self::Hangup { .. }
        )
    }
}
