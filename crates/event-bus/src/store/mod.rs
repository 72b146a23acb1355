//! Fast ephemeral store abstraction
//!
//! Three narrow capabilities are all the rest of the system needs from the
//! fast store: expiring keys, an append-only stream with consumer groups, and
//! fire-and-forget publish/subscribe. [`RedisStore`] backs them in
//! production, [`MemoryStore`] in tests and single-process runs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub mod memory;
pub mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors from the fast store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Store operation '{operation}' timed out")]
    Timeout { operation: String },

    #[error("Unexpected reply: {0}")]
    Decode(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }
}

/// One entry of a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Store assigned id, ordered within the stream
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Expiring string keys
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Set `key` with a time-to-live
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    async fn del(&self, key: &str) -> StoreResult<()>;

    /// Increment an integer key and (re)arm its time-to-live
    async fn incr(&self, key: &str, ttl: Duration) -> StoreResult<i64>;
}

/// Append-only log with consumer groups
#[async_trait]
pub trait StreamLog: Send + Sync {
    /// Append an entry, trimming the stream to roughly `max_len` entries
    async fn append(&self, stream: &str, fields: &[(&str, &str)], max_len: Option<usize>) -> StoreResult<String>;

    /// Create `group` from the start of the stream; existing groups are left alone
    async fn ensure_group(&self, stream: &str, group: &str) -> StoreResult<()>;

    /// Claim up to `count` never-delivered entries for `consumer`, without blocking
    async fn read_group(&self, stream: &str, group: &str, consumer: &str, count: usize) -> StoreResult<Vec<StreamEntry>>;

    /// Entries already delivered to `consumer` but not yet acknowledged
    async fn read_pending(&self, stream: &str, group: &str, consumer: &str, count: usize) -> StoreResult<Vec<StreamEntry>>;

    /// Take over entries another consumer has held unacknowledged for at least `min_idle`
    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>>;

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> StoreResult<usize>;

    /// The newest `count` entries, newest first
    async fn latest(&self, stream: &str, count: usize) -> StoreResult<Vec<StreamEntry>>;

    /// Number of delivered but unacknowledged entries in `group`
    async fn pending_count(&self, stream: &str, group: &str) -> StoreResult<usize>;
}

/// Fire-and-forget fan-out
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()>;

    /// Subscribe to the exact channel names given; no pattern matching
    async fn subscribe(&self, channels: &[String]) -> StoreResult<PubSubReceiver>;
}

/// Messages from a pub/sub subscription as `(channel, payload)` pairs.
///
/// Dropping the receiver ends the subscription.
pub struct PubSubReceiver {
    rx: mpsc::UnboundedReceiver<(String, String)>,
    task: Option<JoinHandle<()>>,
}

impl PubSubReceiver {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<(String, String)>, task: JoinHandle<()>) -> Self {
        Self { rx, task: Some(task) }
    }

    pub async fn recv(&mut self) -> Option<(String, String)> {
        self.rx.recv().await
    }
}

impl Drop for PubSubReceiver {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
