//! Live call states in the fast store

use std::sync::Arc;
use std::time::Duration;

use rdial_event_bus::KeyValueStore;
use tracing::trace;

use super::model::{CallState, CallStateUpdate};
use crate::error::Result;

/// Key prefix of live call states
pub const CALL_STATE_PREFIX: &str = "call:state:";

pub fn call_state_key(call_id: &str) -> String {
    format!("{}{}", CALL_STATE_PREFIX, call_id)
}

/// One expiring entry per call id; every write refreshes the expiry
#[derive(Clone)]
pub struct CallStateStore {
    kv: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl CallStateStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn set(&self, state: &CallState) -> Result<()> {
        let value = serde_json::to_string(state)?;
        self.kv.set_ex(&call_state_key(&state.id), &value, self.ttl).await?;
        trace!(call_id = %state.id, "call state stored");
        Ok(())
    }

    /// `None` means the call is not currently active, not that it never existed
    pub async fn get(&self, call_id: &str) -> Result<Option<CallState>> {
        match self.kv.get(&call_state_key(call_id)).await? {
            Some(value) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }

    /// Read, merge and write back. Returns `None` if there is no live state.
    pub async fn update(&self, call_id: &str, update: CallStateUpdate) -> Result<Option<CallState>> {
        let Some(mut state) = self.get(call_id).await? else {
            return Ok(None);
        };
        state.apply(update);
        self.set(&state).await?;
        Ok(Some(state))
    }

    pub async fn remove(&self, call_id: &str) -> Result<()> {
        self.kv.del(&call_state_key(call_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::CallMetadata;
    use crate::types::CallStatus;
    use rdial_event_bus::MemoryStore;
    use serde_json::json;

    fn store() -> CallStateStore {
        CallStateStore::new(Arc::new(MemoryStore::new()), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_hold_update_preserves_other_metadata() {
        let states = store();
        let state = CallState::new("c-1", "t-1", CallStatus::Answered).with_metadata(
            CallMetadata::new()
                .with_agent("agent-7")
                .with_extra("crmRef", json!("A-17")),
        );
        states.set(&state).await.unwrap();

        let updated = states
            .update("c-1", CallStateUpdate::metadata(CallMetadata::new().with_hold(true)))
            .await
            .unwrap()
            .unwrap();

        assert!(updated.metadata.on_hold());
        assert_eq!(updated.metadata.agent_id.as_deref(), Some("agent-7"));
        assert_eq!(updated.metadata.extra.get("crmRef"), Some(&json!("A-17")));

        let reread = states.get("c-1").await.unwrap().unwrap();
        assert_eq!(reread.metadata, updated.metadata);
    }

    #[tokio::test]
    async fn test_update_of_missing_state_is_none() {
        let states = store();
        assert!(states
            .update("nope", CallStateUpdate::status(CallStatus::Answered))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_expires_without_writes() {
        let states = store();
        states
            .set(&CallState::new("c-1", "t-1", CallStatus::Initiated))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(45)).await;
        states
            .update("c-1", CallStateUpdate::status(CallStatus::Answered))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(states.get("c-1").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(states.get("c-1").await.unwrap().is_none());
    }
}
