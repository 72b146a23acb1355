//! In-process store with the same observable semantics as the Redis store
//!
//! Expiry and idle times use `tokio::time::Instant`, so tests running with a
//! paused clock can advance through them deterministically.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::trace;

use super::{KeyValueStore, PubSub, PubSubReceiver, StoreError, StoreResult, StreamEntry, StreamLog};

const PUBSUB_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Pending {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct Group {
    /// Sequence number of the last entry handed out with `>`
    last_delivered: u64,
    pending: BTreeMap<u64, Pending>,
}

#[derive(Debug, Default)]
struct Stream {
    entries: BTreeMap<u64, StreamEntry>,
    next_seq: u64,
    groups: HashMap<String, Group>,
}

impl Stream {
    fn entry_for(&self, seq: u64) -> StreamEntry {
        self.entries.get(&seq).cloned().unwrap_or_else(|| StreamEntry {
            id: format!("0-{}", seq),
            fields: HashMap::new(),
        })
    }
}

#[derive(Debug)]
struct Inner {
    values: Mutex<HashMap<String, (String, Option<Instant>)>>,
    streams: Mutex<HashMap<String, Stream>>,
    channels: broadcast::Sender<(String, String)>,
    fail_next: Mutex<u32>,
}

/// Shared in-memory store; clones see the same data
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (channels, _) = broadcast::channel(PUBSUB_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                values: Mutex::new(HashMap::new()),
                streams: Mutex::new(HashMap::new()),
                channels,
                fail_next: Mutex::new(0),
            }),
        }
    }

    /// Make the next `count` operations fail as if the store were unreachable
    pub fn fail_next(&self, count: u32) {
        *self.inner.fail_next.lock() = count;
    }

    /// Number of entries currently held in `stream`
    pub fn stream_len(&self, stream: &str) -> usize {
        self.inner
            .streams
            .lock()
            .get(stream)
            .map(|s| s.entries.len())
            .unwrap_or(0)
    }

    fn check_available(&self) -> StoreResult<()> {
        let mut fail = self.inner.fail_next.lock();
        if *fail > 0 {
            *fail -= 1;
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let mut values = self.inner.values.lock();
        match values.get(key) {
            Some((_, Some(expires))) if *expires <= Instant::now() => {
                values.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_available()?;
        Ok(self.live_value(key))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.check_available()?;
        self.inner
            .values
            .lock()
            .insert(key.to_string(), (value.to_string(), Some(Instant::now() + ttl)));
        Ok(())
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        self.check_available()?;
        self.inner.values.lock().remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        self.check_available()?;
        let current = match self.live_value(key) {
            Some(value) => value
                .parse::<i64>()
                .map_err(|_| StoreError::decode(format!("value at {} is not an integer", key)))?,
            None => 0,
        };
        let next = current + 1;
        self.inner
            .values
            .lock()
            .insert(key.to_string(), (next.to_string(), Some(Instant::now() + ttl)));
        Ok(next)
    }
}

#[async_trait]
impl StreamLog for MemoryStore {
    async fn append(&self, stream: &str, fields: &[(&str, &str)], max_len: Option<usize>) -> StoreResult<String> {
        self.check_available()?;
        let mut streams = self.inner.streams.lock();
        let stream = streams.entry(stream.to_string()).or_default();

        stream.next_seq += 1;
        let seq = stream.next_seq;
        let id = format!("{}-{}", chrono::Utc::now().timestamp_millis(), seq);
        let fields = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        stream.entries.insert(seq, StreamEntry { id: id.clone(), fields });

        if let Some(max_len) = max_len {
            while stream.entries.len() > max_len {
                stream.entries.pop_first();
            }
        }
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> StoreResult<()> {
        self.check_available()?;
        let mut streams = self.inner.streams.lock();
        streams
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn read_group(&self, stream: &str, group: &str, consumer: &str, count: usize) -> StoreResult<Vec<StreamEntry>> {
        self.check_available()?;
        let mut streams = self.inner.streams.lock();
        let stream = streams
            .get_mut(stream)
            .ok_or_else(|| StoreError::Unavailable(format!("no such stream: {}", stream)))?;
        let Stream { entries, groups, .. } = stream;
        let group = groups
            .get_mut(group)
            .ok_or_else(|| StoreError::Unavailable(format!("NOGROUP {}", group)))?;

        let now = Instant::now();
        let mut out = Vec::new();
        for (seq, entry) in entries.range(group.last_delivered + 1..).take(count) {
            group.last_delivered = *seq;
            group.pending.insert(
                *seq,
                Pending {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    deliveries: 1,
                },
            );
            out.push(entry.clone());
        }
        Ok(out)
    }

    async fn read_pending(&self, stream: &str, group: &str, consumer: &str, count: usize) -> StoreResult<Vec<StreamEntry>> {
        self.check_available()?;
        let streams = self.inner.streams.lock();
        let Some(stream) = streams.get(stream) else {
            return Ok(Vec::new());
        };
        let Some(group) = stream.groups.get(group) else {
            return Ok(Vec::new());
        };
        Ok(group
            .pending
            .iter()
            .filter(|(_, p)| p.consumer == consumer)
            .take(count)
            .map(|(seq, _)| stream.entry_for(*seq))
            .collect())
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>> {
        self.check_available()?;
        let mut streams = self.inner.streams.lock();
        let Some(stream) = streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let now = Instant::now();
        let mut claimed = Vec::new();
        if let Some(group) = stream.groups.get_mut(group) {
            for (seq, pending) in group.pending.iter_mut() {
                if claimed.len() >= count {
                    break;
                }
                if now.duration_since(pending.delivered_at) >= min_idle {
                    trace!(
                        "claiming {} from {} for {} (delivery {})",
                        seq,
                        pending.consumer,
                        consumer,
                        pending.deliveries + 1
                    );
                    pending.consumer = consumer.to_string();
                    pending.delivered_at = now;
                    pending.deliveries += 1;
                    claimed.push(*seq);
                }
            }
        }
        Ok(claimed.into_iter().map(|seq| stream.entry_for(seq)).collect())
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> StoreResult<usize> {
        self.check_available()?;
        let mut streams = self.inner.streams.lock();
        let Some(stream) = streams.get_mut(stream) else {
            return Ok(0);
        };
        let Stream { entries, groups, .. } = stream;
        let Some(group) = groups.get_mut(group) else {
            return Ok(0);
        };

        let mut acked = 0;
        for id in ids {
            let seq = entries
                .iter()
                .find(|(_, e)| &e.id == id)
                .map(|(seq, _)| *seq)
                .or_else(|| id.split_once('-').and_then(|(_, s)| s.parse().ok()));
            if let Some(seq) = seq {
                if group.pending.remove(&seq).is_some() {
                    acked += 1;
                }
            }
        }
        Ok(acked)
    }

    async fn latest(&self, stream: &str, count: usize) -> StoreResult<Vec<StreamEntry>> {
        self.check_available()?;
        let streams = self.inner.streams.lock();
        Ok(streams
            .get(stream)
            .map(|s| s.entries.values().rev().take(count).cloned().collect())
            .unwrap_or_default())
    }

    async fn pending_count(&self, stream: &str, group: &str) -> StoreResult<usize> {
        self.check_available()?;
        let streams = self.inner.streams.lock();
        Ok(streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0))
    }
}

#[async_trait]
impl PubSub for MemoryStore {
    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        self.check_available()?;
        // No receivers is not an error for fire-and-forget delivery.
        let _ = self
            .inner
            .channels
            .send((channel.to_string(), message.to_string()));
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> StoreResult<PubSubReceiver> {
        self.check_available()?;
        let mut source = self.inner.channels.subscribe();
        let wanted: Vec<String> = channels.to_vec();
        let (tx, rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok((channel, message)) => {
                        if wanted.contains(&channel) && tx.send((channel, message)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        trace!("pub/sub subscriber lagged, {} messages dropped", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(PubSubReceiver::new(rx, task))
    }
}
