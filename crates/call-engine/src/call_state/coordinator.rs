//! Fast answers about active calls, backed by the durable record

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::model::{CallState, CallStateUpdate};
use super::store::CallStateStore;
use crate::error::Result;
use crate::store::CallStore;
use crate::types::CallRecord;

/// Reads and writes live call state.
///
/// The fast store holds the working set of active calls; the durable store
/// stays the system of record. Writes to the two are independent and may lag
/// one another. Writes to the live state of one call are serialized through
/// this coordinator and its clones.
#[derive(Clone)]
pub struct CallStateCoordinator {
    states: CallStateStore,
    calls: Arc<dyn CallStore>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl CallStateCoordinator {
    pub fn new(states: CallStateStore, calls: Arc<dyn CallStore>) -> Self {
        Self {
            states,
            calls,
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn states(&self) -> &CallStateStore {
        &self.states
    }

    pub fn calls(&self) -> &Arc<dyn CallStore> {
        &self.calls
    }

    pub async fn set_call_state(&self, state: &CallState) -> Result<()> {
        self.serialized(&state.id, self.states.set(state)).await
    }

    pub async fn get_call_state(&self, call_id: &str) -> Result<Option<CallState>> {
        self.states.get(call_id).await
    }

    pub async fn update_call_state(&self, call_id: &str, update: CallStateUpdate) -> Result<Option<CallState>> {
        self.serialized(call_id, self.states.update(call_id, update)).await
    }

    /// Run `write` while holding the lock of `call_id`
    async fn serialized<T>(&self, call_id: &str, write: impl Future<Output = T>) -> T {
        let lock = self.locks.entry(call_id.to_string()).or_default().clone();
        let result = {
            let _guard = lock.lock().await;
            write.await
        };
        // the map and this task hold the only references when no writer waits
        self.locks.remove_if(call_id, |_, held| Arc::strong_count(held) <= 2);
        result
    }

    pub async fn remove_call_state(&self, call_id: &str) -> Result<()> {
        self.states.remove(call_id).await
    }

    /// The live state of `call_id`.
    ///
    /// Falls back to the durable record when the fast store lost the entry
    /// but the call is still active, and caches the rebuilt state again.
    pub async fn live_state(&self, call_id: &str) -> Result<Option<CallState>> {
        if let Some(state) = self.states.get(call_id).await? {
            return Ok(Some(state));
        }

        let Some(record) = self.calls.get(call_id).await? else {
            debug!(call_id, "no live or durable record");
            return Ok(None);
        };
        if !record.status.is_active() {
            return Ok(None);
        }

        let state = CallState::from_record(&record);
        self.states.set(&state).await?;
        info!(call_id, status = %record.status, "🧹 Rebuilt live call state from durable record");
        Ok(Some(state))
    }

    /// The durable record, whether or not the call is still active
    pub async fn record(&self, call_id: &str) -> Result<Option<CallRecord>> {
        self.calls.get(call_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;
    use rdial_event_bus::MemoryStore;

    use crate::metadata::CallMetadata;
    use crate::store::MemoryCallStore;
    use crate::types::{CallDirection, CallStatus, NewCall};

    fn coordinator() -> (CallStateCoordinator, Arc<MemoryCallStore>) {
        let calls = Arc::new(MemoryCallStore::new());
        let states = CallStateStore::new(Arc::new(MemoryStore::new()), Duration::from_secs(60));
        (CallStateCoordinator::new(states, calls.clone()), calls)
    }

    fn new_call(id: &str) -> NewCall {
        NewCall {
            id: id.to_string(),
            tenant_id: "t-1".to_string(),
            call_sid: None,
            to_number: "+15551234567".to_string(),
            direction: CallDirection::Outbound,
            status: CallStatus::Initiated,
            campaign_id: None,
            created_by_id: Some("agent-1".to_string()),
            metadata: CallMetadata::new().with_agent("agent-1"),
        }
    }

    #[tokio::test]
    async fn test_live_state_rebuilds_active_call() {
        let (coordinator, calls) = coordinator();
        calls.create(new_call("c-1")).await.unwrap();
        calls.mark_answered("c-1", Utc::now()).await.unwrap();

        let state = coordinator.live_state("c-1").await.unwrap().unwrap();
        assert_eq!(state.status, CallStatus::Answered);
        assert_eq!(state.participants.len(), 2);

        // cached again
        assert!(coordinator.get_call_state("c-1").await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_keep_every_change() {
        let (coordinator, calls) = coordinator();
        let record = calls.create(new_call("c-1")).await.unwrap();
        coordinator.set_call_state(&CallState::from_record(&record)).await.unwrap();

        let writers: Vec<_> = (0..32)
            .map(|i| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    let patch = CallMetadata::new().with_extra(format!("note{}", i), serde_json::json!(i));
                    coordinator
                        .update_call_state("c-1", CallStateUpdate::metadata(patch))
                        .await
                        .unwrap();
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let state = coordinator.get_call_state("c-1").await.unwrap().unwrap();
        assert_eq!(state.metadata.extra.len(), 32);
        assert!(coordinator.locks.is_empty());
    }

    #[tokio::test]
    async fn test_ended_call_has_no_live_state() {
        let (coordinator, calls) = coordinator();
        calls.create(new_call("c-1")).await.unwrap();
        calls.mark_ended("c-1", CallStatus::Completed, Utc::now()).await.unwrap();

        assert!(coordinator.live_state("c-1").await.unwrap().is_none());
        assert!(coordinator.live_state("missing").await.unwrap().is_none());
        assert!(coordinator.record("c-1").await.unwrap().is_some());
    }
}
