//! The event bus
//!
//! Every publish takes both paths: the event is appended to the stream for
//! reliable consumers and pushed to two pub/sub addresses (its specific name
//! and its `family.*` wildcard) for live listeners.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::event::{channels, Event, NewEvent};
use crate::pattern::matches_pattern;
use crate::store::{PubSub, StreamEntry, StreamLog};

/// Event bus settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Stream every event is appended to
    pub stream_key: String,
    /// Default consumer group for reliable subscriptions
    pub group: String,
    /// Entries claimed per read
    pub read_batch: usize,
    /// Pause after a read that found nothing
    pub idle_wait_ms: u64,
    /// Pause after a store error or a failed handler
    pub error_backoff_ms: u64,
    /// How long another consumer may hold an entry before we take it over
    pub stale_claim_idle_ms: u64,
    /// Approximate stream length cap; 0 keeps everything
    pub max_len: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            stream_key: "events:stream".to_string(),
            group: "event-consumers".to_string(),
            read_batch: 10,
            idle_wait_ms: 1000,
            error_backoff_ms: 1000,
            stale_claim_idle_ms: 30_000,
            max_len: 100_000,
        }
    }
}

/// Consumer of reliably delivered events.
///
/// An `Err` leaves the event unacknowledged so it is delivered again; handlers
/// must therefore be idempotent.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

#[async_trait]
impl<H: EventHandler + ?Sized> EventHandler for Arc<H> {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (**self).handle(event).await
    }
}

/// Adapter turning an async closure into an [`EventHandler`]
pub struct HandlerFn<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> EventHandler for HandlerFn<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.0)(event.clone()).await
    }
}

/// Result of a publish
#[derive(Debug, Clone)]
pub struct Published {
    /// Id the stream assigned to the entry
    pub stream_id: String,
    pub event: Event,
}

/// Handle to a running subscription.
///
/// Dropping it aborts the subscription; [`Subscription::unsubscribe`] stops
/// it between events instead.
pub struct Subscription {
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    fn spawn<F>(run: impl FnOnce(watch::Receiver<bool>) -> F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (stop, stopped) = watch::channel(false);
        let task = tokio::spawn(run(stopped));
        Self {
            stop,
            task: Some(task),
        }
    }

    /// Stop after the event in hand, then wait for the task to finish
    pub async fn unsubscribe(mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Two-path event distribution
#[derive(Clone)]
pub struct EventBus {
    streams: Arc<dyn StreamLog>,
    pubsub: Arc<dyn PubSub>,
    config: EventBusConfig,
}

impl EventBus {
    pub fn new(streams: Arc<dyn StreamLog>, pubsub: Arc<dyn PubSub>, config: EventBusConfig) -> Self {
        Self {
            streams,
            pubsub,
            config,
        }
    }

    /// Build a bus over one store providing both capabilities
    pub fn with_store<S>(store: Arc<S>, config: EventBusConfig) -> Self
    where
        S: StreamLog + PubSub + 'static,
    {
        Self::new(store.clone(), store, config)
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    /// Create the stream and the default group of every well-known channel
    pub async fn initialize(&self) -> Result<()> {
        for channel in [channels::CALL, channels::BILLING, channels::RECORDING] {
            self.streams
                .ensure_group(&self.config.stream_key, &group_key(&self.config.group, channel))
                .await?;
        }
        Ok(())
    }

    /// Stamp `event`, append it to the stream under `channel` and fan it out.
    ///
    /// Only the stream append can fail the publish; fan-out failures are
    /// logged and dropped.
    pub async fn publish(&self, channel: &str, event: NewEvent) -> Result<Published> {
        let event = Event::stamp(event);
        let payload = serde_json::to_string(&event)?;
        let max_len = (self.config.max_len > 0).then_some(self.config.max_len);

        let stream_id = self
            .streams
            .append(
                &self.config.stream_key,
                &[("channel", channel), ("payload", payload.as_str())],
                max_len,
            )
            .await?;

        for address in [event.event.clone(), event.wildcard()] {
            if let Err(e) = self.pubsub.publish(&address, &payload).await {
                debug!("real-time delivery of {} to {} dropped: {}", event.id, address, e);
            }
        }

        debug!(event = %event.event, id = %event.id, stream_id = %stream_id, "published");
        Ok(Published { stream_id, event })
    }

    /// Reliable subscription in the default consumer group
    pub async fn subscribe<H: EventHandler>(&self, channel: &str, handler: H, consumer: &str) -> Result<Subscription> {
        let group = self.config.group.clone();
        self.subscribe_in_group(&group, channel, handler, consumer).await
    }

    /// Reliable subscription in `group`.
    ///
    /// The stream-level group is scoped to the channel (see [`group_key`]),
    /// so subscribers on different channels never compete for entries and
    /// every consumer of a scoped group skips the same foreign entries.
    pub async fn subscribe_in_group<H: EventHandler>(
        &self,
        group: &str,
        channel: &str,
        handler: H,
        consumer: &str,
    ) -> Result<Subscription> {
        let group = group_key(group, channel);
        self.streams.ensure_group(&self.config.stream_key, &group).await?;

        let worker = ReliableConsumer {
            streams: self.streams.clone(),
            config: self.config.clone(),
            group,
            consumer: consumer.to_string(),
            channel: channel.to_string(),
            handler: Arc::new(handler),
        };
        info!(
            "📥 Consumer {} joined group {} for {}",
            worker.consumer, worker.group, worker.channel
        );
        Ok(Subscription::spawn(move |stop| worker.run(stop)))
    }

    /// Best-effort subscription to the given pub/sub addresses.
    ///
    /// Addresses are matched literally: `call.*` receives every call event
    /// once (through its wildcard push), `call.answered` only that event.
    pub async fn subscribe_pubsub<F>(&self, channels: &[&str], handler: F) -> Result<Subscription>
    where
        F: Fn(&str, Event) + Send + Sync + 'static,
    {
        let addresses: Vec<String> = channels.iter().map(|c| c.to_string()).collect();
        let mut receiver = self.pubsub.subscribe(&addresses).await?;

        Ok(Subscription::spawn(move |mut stop| async move {
            loop {
                tokio::select! {
                    message = receiver.recv() => match message {
                        Some((address, payload)) => match serde_json::from_str::<Event>(&payload) {
                            Ok(event) => handler(&address, event),
                            Err(e) => debug!("ignoring undecodable message on {}: {}", address, e),
                        },
                        None => break,
                    },
                    _ = stop.changed() => break,
                }
            }
        }))
    }

    /// The most recent `limit` events across all channels, oldest first
    pub async fn get_events(&self, limit: usize) -> Result<Vec<Event>> {
        let entries = self.streams.latest(&self.config.stream_key, limit).await?;
        let mut events: Vec<Event> = entries
            .iter()
            .filter_map(|entry| entry.field("payload"))
            .filter_map(|payload| serde_json::from_str(payload).ok())
            .collect();
        events.reverse();
        Ok(events)
    }

    /// Delivered but unacknowledged entries of `group` on `channel`
    pub async fn pending(&self, group: &str, channel: &str) -> Result<usize> {
        Ok(self
            .streams
            .pending_count(&self.config.stream_key, &group_key(group, channel))
            .await?)
    }
}

/// Stream-level consumer group serving `channel` on behalf of `group`
pub fn group_key(group: &str, channel: &str) -> String {
    format!("{}:{}", group, channel)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct PollStats {
    seen: usize,
    handled: usize,
    failed: usize,
}

enum Outcome {
    Handled,
    Skipped,
    Failed,
}

struct ReliableConsumer {
    streams: Arc<dyn StreamLog>,
    config: EventBusConfig,
    group: String,
    consumer: String,
    channel: String,
    handler: Arc<dyn EventHandler>,
}

impl ReliableConsumer {
    async fn run(self, mut stop: watch::Receiver<bool>) {
        let idle = Duration::from_millis(self.config.idle_wait_ms);
        let backoff = Duration::from_millis(self.config.error_backoff_ms);

        loop {
            if *stop.borrow() {
                break;
            }

            let pause = match self.poll(&stop).await {
                Ok(stats) if stats.failed > 0 => Some(backoff),
                Ok(stats) if stats.seen == 0 => Some(idle),
                Ok(stats) => {
                    debug!(
                        "consumer {} handled {} of {} entries",
                        self.consumer, stats.handled, stats.seen
                    );
                    None
                }
                Err(e) => {
                    warn!("consumer {} read failed: {}", self.consumer, e);
                    Some(backoff)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = stop.changed() => {}
                }
            }
        }
        info!("consumer {} left group {}", self.consumer, self.group);
    }

    /// One read: our own unacknowledged entries first, then entries abandoned
    /// by other consumers, then new ones
    async fn poll(&self, stop: &watch::Receiver<bool>) -> Result<PollStats> {
        let stream = &self.config.stream_key;
        let count = self.config.read_batch.max(1);

        let mut batch = self
            .streams
            .read_pending(stream, &self.group, &self.consumer, count)
            .await?;
        if batch.is_empty() {
            batch = self
                .streams
                .claim_stale(
                    stream,
                    &self.group,
                    &self.consumer,
                    Duration::from_millis(self.config.stale_claim_idle_ms),
                    count,
                )
                .await?;
        }
        if batch.is_empty() {
            batch = self
                .streams
                .read_group(stream, &self.group, &self.consumer, count)
                .await?;
        }

        let mut stats = PollStats {
            seen: batch.len(),
            ..Default::default()
        };
        for entry in batch {
            if *stop.borrow() {
                break;
            }
            match self.process(&entry).await? {
                Outcome::Handled => stats.handled += 1,
                Outcome::Failed => stats.failed += 1,
                Outcome::Skipped => {}
            }
        }
        Ok(stats)
    }

    async fn process(&self, entry: &StreamEntry) -> Result<Outcome> {
        let channel = entry.field("channel").unwrap_or_default();
        if channel != self.channel && !matches_pattern(&self.channel, channel) {
            // the group is ours alone; other channels have groups of their own
            self.ack(entry).await?;
            return Ok(Outcome::Skipped);
        }

        let event: Event = match entry.field("payload").map(serde_json::from_str) {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                warn!("acknowledging undecodable entry {}: {}", entry.id, e);
                self.ack(entry).await?;
                return Ok(Outcome::Skipped);
            }
            None => {
                warn!("acknowledging entry {} without payload", entry.id);
                self.ack(entry).await?;
                return Ok(Outcome::Skipped);
            }
        };

        match self.handler.handle(&event).await {
            Ok(()) => {
                self.ack(entry).await?;
                Ok(Outcome::Handled)
            }
            Err(e) => {
                warn!(
                    event = %event.event,
                    id = %event.id,
                    "handler failed, event left for redelivery: {:#}",
                    e
                );
                Ok(Outcome::Failed)
            }
        }
    }

    async fn ack(&self, entry: &StreamEntry) -> Result<()> {
        self.streams
            .ack(&self.config.stream_key, &self.group, std::slice::from_ref(&entry.id))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn bus(store: &Arc<MemoryStore>) -> EventBus {
        EventBus::with_store(store.clone(), EventBusConfig::default())
    }

    #[tokio::test]
    async fn test_publish_appends_once_with_channel() {
        let store = Arc::new(MemoryStore::new());
        let bus = bus(&store);

        let published = bus
            .publish("call.*", NewEvent::new("call.answered", "t1", json!({"callId": "c1"})))
            .await
            .unwrap();
        assert_eq!(store.stream_len("events:stream"), 1);

        let latest = store.latest("events:stream", 1).await.unwrap();
        assert_eq!(latest[0].field("channel"), Some("call.*"));
        assert_eq!(latest[0].id, published.stream_id);
    }

    #[tokio::test]
    async fn test_publish_fails_when_append_fails() {
        let store = Arc::new(MemoryStore::new());
        let bus = bus(&store);
        bus.publish("call.*", NewEvent::new("call.ended", "t1", json!({})))
            .await
            .unwrap();

        // The append consumes the injected failure: publish fails.
        store.fail_next(1);
        assert!(bus
            .publish("call.*", NewEvent::new("call.ended", "t1", json!({})))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_get_events_is_chronological() {
        let store = Arc::new(MemoryStore::new());
        let bus = bus(&store);
        for name in ["call.initiated", "call.answered", "call.ended"] {
            bus.publish("call.*", NewEvent::new(name, "t1", json!({})))
                .await
                .unwrap();
        }

        let names: Vec<String> = bus
            .get_events(2)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event)
            .collect();
        assert_eq!(names, vec!["call.answered", "call.ended"]);
    }
}
