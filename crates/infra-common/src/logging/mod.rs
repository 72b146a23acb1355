//! Logging setup and correlation contexts

pub mod context;
pub mod setup;
