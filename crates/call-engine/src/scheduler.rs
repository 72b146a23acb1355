//! Cancellable delayed actions
//!
//! A [`ScheduledTask`] runs an action once after a delay unless it is
//! cancelled first. The owner of the action keeps the handle, so an event
//! that makes the action unnecessary can call it off.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

pub struct ScheduledTask {
    name: String,
    fired: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Run `action` after `delay`
    pub fn after<F>(name: impl Into<String>, delay: Duration, action: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let fired = Arc::new(AtomicBool::new(false));
        let handle = {
            let fired = fired.clone();
            let name = name.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                fired.store(true, Ordering::SeqCst);
                trace!(task = %name, "scheduled task firing");
                action.await;
            })
        };

        Self { name, fired, handle }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the delay elapsed and the action started
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Call the action off. Returns `false` if it had already started.
    pub fn cancel(&self) -> bool {
        if self.has_fired() {
            return false;
        }
        self.handle.abort();
        trace!(task = %self.name, "scheduled task cancelled");
        true
    }
}

impl Drop for ScheduledTask {
    /// Dropping the handle cancels a task that has not fired yet; a running
    /// action is left to finish.
    fn drop(&mut self) {
        if !self.has_fired() {
            self.handle.abort();
        }
    }
}
