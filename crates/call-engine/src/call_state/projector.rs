//! Applies call lifecycle events to both stores

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdial_event_bus::{names, Event, EventHandler};
use tracing::{debug, info, warn};

use super::coordinator::CallStateCoordinator;
use super::model::{CallState, CallStateUpdate};
use crate::error::{EngineError, Result};
use crate::metadata::{CallMetadata, TransferInfo, TransferType};
use crate::types::{CallDirection, CallStatus, NewCall};

/// Consumer group the projector reads `call.*` in
pub const PROJECTOR_GROUP: &str = "call-state-projector";

/// Reliable-path consumer keeping the durable call record and the live state
/// in step with `call.*` events.
///
/// Every step is an upsert or a conditional transition, so a redelivered
/// event converges to the same records. Events may arrive ahead of
/// `call.initiated`; the first one opens a placeholder record that
/// `call.initiated` completes later. A `call.failed` with no record is
/// acknowledged without one, since the originate never produced a call.
#[derive(Clone)]
pub struct CallStateProjector {
    coordinator: CallStateCoordinator,
}

impl CallStateProjector {
    pub fn new(coordinator: CallStateCoordinator) -> Self {
        Self { coordinator }
    }

    pub async fn apply(&self, event: &Event) -> Result<()> {
        let Some(call_id) = event.data_str("callId").map(str::to_string) else {
            debug!(event = %event.event, id = %event.id, "event has no callId, skipping");
            return Ok(());
        };

        match event.event.as_str() {
            names::CALL_INITIATED => self.initiated(&call_id, event).await,
            names::CALL_ANSWERED => self.answered(&call_id, event).await,
            names::CALL_TRANSFERRED => self.transferred(&call_id, event).await,
            names::CALL_ENDED => self.ended(&call_id, CallStatus::Completed, event).await,
            names::CALL_FAILED => self.ended(&call_id, CallStatus::Failed, event).await,
            other => {
                debug!(event = other, "not a lifecycle transition");
                Ok(())
            }
        }
    }

    async fn initiated(&self, call_id: &str, event: &Event) -> Result<()> {
        let direction = match event.data_str("direction") {
            Some(direction) => direction.parse()?,
            None => CallDirection::Outbound,
        };
        let to_number = event
            .data_str("phoneNumber")
            .or_else(|| event.data_str("toNumber"))
            .ok_or_else(|| EngineError::invalid_input(format!("call.initiated for {} has no number", call_id)))?
            .to_string();
        let agent_id = event.data_str("agentId").map(str::to_string);
        let lead_id = event.data_str("leadId").map(str::to_string);
        let campaign_id = event.data_str("campaignId").map(str::to_string);

        let mut metadata = CallMetadata::new().with_lead(lead_id.clone(), campaign_id.clone());
        metadata.agent_id = agent_id.clone();
        metadata.originated_by = Some(if lead_id.is_some() { "dialer" } else { "agent" }.to_string());

        let record = self
            .coordinator
            .calls()
            .create(NewCall {
                id: call_id.to_string(),
                tenant_id: event.tenant_id.clone(),
                call_sid: event.data_str("callSid").map(str::to_string),
                to_number,
                direction,
                status: CallStatus::Initiated,
                campaign_id,
                created_by_id: agent_id,
                metadata,
            })
            .await?;

        if self.coordinator.get_call_state(call_id).await?.is_none() && record.status.is_active() {
            let state = CallState::from_record(&record);
            self.coordinator.set_call_state(&state).await?;
        }
        info!(call_id, "🗄️ Call initiated");
        Ok(())
    }

    /// Open a placeholder record from what a later lifecycle event carries
    async fn ensure_record(&self, call_id: &str, event: &Event) -> Result<()> {
        let calls = self.coordinator.calls();
        if calls.get(call_id).await?.is_some() {
            return Ok(());
        }
        let agent_id = event.data_str("agentId").map(str::to_string);
        let campaign_id = event.data_str("campaignId").map(str::to_string);
        let metadata = CallMetadata::new().with_lead(event.data_str("leadId").map(str::to_string), campaign_id.clone());

        calls
            .create(NewCall {
                id: call_id.to_string(),
                tenant_id: event.tenant_id.clone(),
                call_sid: event.data_str("callSid").map(str::to_string),
                to_number: String::new(),
                direction: CallDirection::Outbound,
                status: CallStatus::Initiated,
                campaign_id,
                created_by_id: agent_id,
                metadata,
            })
            .await?;
        warn!(call_id, event = %event.event, "event ahead of call.initiated, opened a placeholder record");
        Ok(())
    }

    async fn answered(&self, call_id: &str, event: &Event) -> Result<()> {
        self.ensure_record(call_id, event).await?;
        if self.coordinator.calls().mark_answered(call_id, event.timestamp).await?.is_none() {
            return Err(EngineError::call_not_found(call_id));
        }
        self.coordinator
            .update_call_state(call_id, CallStateUpdate::status(CallStatus::Answered))
            .await?;
        Ok(())
    }

    async fn transferred(&self, call_id: &str, event: &Event) -> Result<()> {
        let destination = event.data_str("destination").unwrap_or_default().to_string();
        let transfer_type = match event.data_str("transferType").or_else(|| event.data_str("type")) {
            Some("warm") => TransferType::Warm,
            _ => TransferType::Blind,
        };
        let patch = CallMetadata {
            transfer: Some(TransferInfo {
                destination,
                transfer_type,
                by_agent_id: event.data_str("agentId").map(str::to_string),
                at: event.timestamp,
            }),
            ..CallMetadata::new()
        };

        self.ensure_record(call_id, event).await?;
        if self
            .coordinator
            .calls()
            .merge_metadata(call_id, patch.clone())
            .await?
            .is_none()
        {
            return Err(EngineError::call_not_found(call_id));
        }
        self.coordinator
            .update_call_state(call_id, CallStateUpdate::metadata(patch))
            .await?;
        Ok(())
    }

    async fn ended(&self, call_id: &str, status: CallStatus, event: &Event) -> Result<()> {
        let calls = self.coordinator.calls();
        let ended_at: DateTime<Utc> = event.timestamp;
        if status != CallStatus::Failed {
            self.ensure_record(call_id, event).await?;
        }
        if calls.mark_ended(call_id, status, ended_at).await?.is_none() {
            warn!(call_id, event = %event.event, "call failed before a record existed");
            return Ok(());
        }

        let disposition = event
            .data_str("disposition")
            .or_else(|| event.data_str("endReason"))
            .or_else(|| event.data_str("reason"));
        if let Some(disposition) = disposition {
            let patch = CallMetadata {
                disposition: Some(disposition.to_string()),
                ..CallMetadata::new()
            };
            calls.merge_metadata(call_id, patch).await?;
        }

        // the live state lingers until its expiry as a recently ended call
        self.coordinator
            .update_call_state(call_id, CallStateUpdate::status(status))
            .await?;
        info!(call_id, status = %status, "🧹 Call closed");
        Ok(())
    }
}

#[async_trait]
impl EventHandler for CallStateProjector {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        match self.apply(event).await {
            Ok(()) => Ok(()),
            // redelivery cannot fix a malformed payload
            Err(e @ (EngineError::InvalidInput(_) | EngineError::Serialization(_))) => {
                warn!(event = %event.event, id = %event.id, "dropping malformed event: {}", e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
