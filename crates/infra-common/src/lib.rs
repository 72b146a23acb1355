//! # rdial infra-common
//!
//! Shared infrastructure used by every rdial crate:
//!
//! - [`logging`]: subscriber setup and correlation-aware log contexts
//! - [`errors`]: the infrastructure error type
//!
//! Nothing in here knows about leads, calls or the switch; the domain crates
//! build on these pieces.

pub mod errors;
pub mod logging;

pub use errors::{Error, Result};
pub use logging::context::LogContext;
pub use logging::setup::{log_welcome, parse_log_level, setup_logging, LoggingConfig};
