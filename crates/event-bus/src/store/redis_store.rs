//! Redis backed store
//!
//! Commands go through a shared [`ConnectionManager`], which reconnects on its
//! own after a dropped connection. None of the commands used here block on
//! the server, so sharing one multiplexed connection is safe. Pub/sub
//! subscriptions get a dedicated connection each.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{Client, RedisResult, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{KeyValueStore, PubSub, PubSubReceiver, StoreError, StoreResult, StreamEntry, StreamLog};

/// Store backed by a Redis server
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    manager: ConnectionManager,
    command_timeout: Duration,
}

impl RedisStore {
    /// Connect to `url` (`redis://host:port/db`)
    pub async fn connect(url: &str, command_timeout: Duration) -> StoreResult<Self> {
        let client = Client::open(url)?;
        let manager = tokio::time::timeout(command_timeout, ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| StoreError::Timeout {
                operation: "connect".to_string(),
            })??;

        info!("✅ Connected to Redis");
        Ok(Self {
            client,
            manager,
            command_timeout,
        })
    }

    async fn timed<T, F>(&self, operation: &str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout {
                operation: operation.to_string(),
            }),
        }
    }

    async fn query<T: redis::FromRedisValue>(&self, operation: &str, cmd: &redis::Cmd) -> StoreResult<T> {
        let mut conn = self.manager.clone();
        self.timed(operation, cmd.query_async::<_, T>(&mut conn)).await
    }

    /// Flatten an `XREADGROUP` reply into entries of `stream`
    fn group_reply(stream: &str, reply: Option<Vec<(String, Vec<Value>)>>) -> StoreResult<Vec<StreamEntry>> {
        let mut entries = Vec::new();
        for (name, values) in reply.unwrap_or_default() {
            if name == stream {
                entries.extend(parse_entries(&values)?);
            }
        }
        Ok(entries)
    }
}

/// Parse `[id, [field, value, ...]]` pairs; entries deleted from the stream
/// while still pending come back with nil fields and are kept with none
fn parse_entries(values: &[Value]) -> StoreResult<Vec<StreamEntry>> {
    values
        .iter()
        .map(|value| -> StoreResult<StreamEntry> {
            let (id, flat): (String, Option<Vec<String>>) = redis::from_redis_value(value)?;
            let fields = flat
                .unwrap_or_default()
                .chunks(2)
                .filter_map(|pair| match pair {
                    [k, v] => Some((k.clone(), v.clone())),
                    _ => None,
                })
                .collect::<HashMap<_, _>>();
            Ok(StreamEntry { id, fields })
        })
        .collect()
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.query("GET", redis::cmd("GET").arg(key)).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let millis = ttl.as_millis().max(1) as u64;
        self.query("SET", redis::cmd("SET").arg(key).arg(value).arg("PX").arg(millis))
            .await
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        let _: i64 = self.query("DEL", redis::cmd("DEL").arg(key)).await?;
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        let millis = ttl.as_millis().max(1) as u64;
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(millis)
            .ignore();
        let (value,): (i64,) = self.timed("INCR", pipe.query_async(&mut conn)).await?;
        Ok(value)
    }
}

#[async_trait]
impl StreamLog for RedisStore {
    async fn append(&self, stream: &str, fields: &[(&str, &str)], max_len: Option<usize>) -> StoreResult<String> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream);
        if let Some(max_len) = max_len {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        cmd.arg("*");
        for (name, value) in fields {
            cmd.arg(*name).arg(*value);
        }
        self.query("XADD", &cmd).await
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> StoreResult<()> {
        let result: StoreResult<String> = self
            .query(
                "XGROUP CREATE",
                redis::cmd("XGROUP")
                    .arg("CREATE")
                    .arg(stream)
                    .arg(group)
                    .arg("0")
                    .arg("MKSTREAM"),
            )
            .await;

        match result {
            Ok(_) => {
                debug!("created consumer group {} on {}", group, stream);
                Ok(())
            }
            Err(StoreError::Redis(e)) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn read_group(&self, stream: &str, group: &str, consumer: &str, count: usize) -> StoreResult<Vec<StreamEntry>> {
        let reply: Option<Vec<(String, Vec<Value>)>> = self
            .query(
                "XREADGROUP",
                redis::cmd("XREADGROUP")
                    .arg("GROUP")
                    .arg(group)
                    .arg(consumer)
                    .arg("COUNT")
                    .arg(count)
                    .arg("STREAMS")
                    .arg(stream)
                    .arg(">"),
            )
            .await?;
        Self::group_reply(stream, reply)
    }

    async fn read_pending(&self, stream: &str, group: &str, consumer: &str, count: usize) -> StoreResult<Vec<StreamEntry>> {
        let reply: Option<Vec<(String, Vec<Value>)>> = self
            .query(
                "XREADGROUP",
                redis::cmd("XREADGROUP")
                    .arg("GROUP")
                    .arg(group)
                    .arg(consumer)
                    .arg("COUNT")
                    .arg(count)
                    .arg("STREAMS")
                    .arg(stream)
                    .arg("0"),
            )
            .await?;
        Self::group_reply(stream, reply)
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>> {
        // Reply: [next-cursor, [entries...], (deleted ids, 7.0+)]
        let reply: Vec<Value> = self
            .query(
                "XAUTOCLAIM",
                redis::cmd("XAUTOCLAIM")
                    .arg(stream)
                    .arg(group)
                    .arg(consumer)
                    .arg(min_idle.as_millis() as u64)
                    .arg("0-0")
                    .arg("COUNT")
                    .arg(count),
            )
            .await?;
        let claimed = reply
            .get(1)
            .ok_or_else(|| StoreError::decode("XAUTOCLAIM reply without entries"))?;
        let values: Vec<Value> = redis::from_redis_value(claimed)?;
        parse_entries(&values)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> StoreResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.query("XACK", redis::cmd("XACK").arg(stream).arg(group).arg(ids))
            .await
    }

    async fn latest(&self, stream: &str, count: usize) -> StoreResult<Vec<StreamEntry>> {
        let values: Vec<Value> = self
            .query(
                "XREVRANGE",
                redis::cmd("XREVRANGE")
                    .arg(stream)
                    .arg("+")
                    .arg("-")
                    .arg("COUNT")
                    .arg(count),
            )
            .await?;
        parse_entries(&values)
    }

    async fn pending_count(&self, stream: &str, group: &str) -> StoreResult<usize> {
        // Summary form: [count, smallest id, greatest id, [[consumer, count]...]]
        let summary: Vec<Value> = self
            .query("XPENDING", redis::cmd("XPENDING").arg(stream).arg(group))
            .await?;
        let count = summary
            .first()
            .ok_or_else(|| StoreError::decode("empty XPENDING reply"))?;
        Ok(redis::from_redis_value(count)?)
    }
}

#[async_trait]
impl PubSub for RedisStore {
    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        let _receivers: i64 = self
            .query("PUBLISH", redis::cmd("PUBLISH").arg(channel).arg(message))
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> StoreResult<PubSubReceiver> {
        let mut pubsub = self
            .timed("SUBSCRIBE", self.client.get_async_pubsub())
            .await?;
        for channel in channels {
            self.timed("SUBSCRIBE", pubsub.subscribe(channel.as_str())).await?;
        }
        debug!("subscribed to {:?}", channels);

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(message) = messages.next().await {
                let channel = message.get_channel_name().to_string();
                match message.get_payload::<String>() {
                    Ok(payload) => {
                        if tx.send((channel, payload)).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("undecodable pub/sub payload on {}: {}", channel, e),
                }
            }
            debug!("pub/sub connection closed");
        });

        Ok(PubSubReceiver::new(rx, task))
    }
}
