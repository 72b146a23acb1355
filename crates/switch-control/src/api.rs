//! Trait seams between the switch client and the call logic
//!
//! The dialer and the fronter only see these traits, so tests can drive them
//! with scripted fakes instead of a live switch.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Command interface of an inbound control connection
#[async_trait]
pub trait SwitchApi: Send + Sync {
    /// Run a command synchronously and return its output
    async fn api(&self, command: &str) -> Result<String>;

    /// Run a command as a background job and return the job's result
    async fn bgapi(&self, command: &str) -> Result<String>;

    /// Whether the underlying connection is still usable
    fn is_connected(&self) -> bool;
}

/// Produces fresh control connections, used for reconnecting
#[async_trait]
pub trait SwitchConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn SwitchApi>>;

    /// Human readable target, for logs
    fn describe(&self) -> String;
}

/// Control over one answered call leg delivered to our outbound listener
#[async_trait]
pub trait CallLeg: Send {
    /// The switch's channel uuid for this leg
    fn call_id(&self) -> &str;

    /// Read a channel variable; `None` when unset
    async fn variable(&mut self, name: &str) -> Result<Option<String>>;

    /// Run a dialplan application and wait until it completes
    async fn execute(&mut self, app: &str, arg: &str) -> Result<()>;

    /// Run a dialplan application without waiting for completion
    async fn execute_detached(&mut self, app: &str, arg: &str) -> Result<()>;

    /// Start receiving key presses for this leg
    async fn subscribe_dtmf(&mut self) -> Result<mpsc::UnboundedReceiver<char>>;

    /// Give up control of the leg; never fails
    async fn release(&mut self);
}
