//! Call control on behalf of a human agent

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use rdial_event_bus::{channels, names, EventBus, NewEvent};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::status::{AgentStatus, AgentStatusEntry, AgentStatusStore};
use crate::call_state::{CallState, CallStateCoordinator, CallStateUpdate, Participant, ParticipantRole, ParticipantStatus};
use crate::config::AgentConfig;
use crate::error::{EngineError, Result};
use crate::metadata::{CallMetadata, TransferInfo, TransferType};
use crate::scheduler::ScheduledTask;
use crate::types::{CallDirection, CallRecord, CallStatus, NewCall};

/// The authenticated agent an operation runs for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentContext {
    pub agent_id: String,
    pub tenant_id: String,
}

impl AgentContext {
    pub fn new(agent_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            tenant_id: tenant_id.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatusView {
    pub agent_id: String,
    #[serde(flatten)]
    pub entry: AgentStatusEntry,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginateRequest {
    pub phone_number: String,
    pub caller_id: Option<String>,
    pub campaign_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginatedCall {
    pub call_id: String,
    pub call_sid: String,
    pub status: CallStatus,
    pub phone_number: String,
    pub direction: CallDirection,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnsweredCall {
    pub call_id: String,
    pub answered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndedCall {
    pub call_id: String,
    pub status: CallStatus,
    /// Seconds from answer to hangup
    pub duration: i64,
    pub ended_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldState {
    pub call_id: String,
    pub is_on_hold: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferProgress {
    /// Blind transfer handed off, the agent is free
    Transferred,
    /// Warm transfer, the agent stays on while consulting
    Consulting,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferOutcome {
    pub call_id: String,
    pub transfer_type: TransferType,
    pub destination: String,
    pub status: TransferProgress,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DtmfSent {
    pub call_id: String,
    pub digit: char,
    pub sent: bool,
}

/// Incoming-call webhook body
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCall {
    pub tenant_id: Option<String>,
    /// Carrier call id, used as the call sid
    pub call_id: Option<String>,
    pub from: Option<String>,
    pub caller_number: Option<String>,
    pub caller_name: Option<String>,
    pub screen_pop_data: Option<Value>,
    pub prospect_data: Option<Value>,
    pub queue_name: Option<String>,
    pub campaign_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingAccepted {
    pub call_id: String,
    pub call_sid: String,
    pub status: CallStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenPop {
    pub call_id: String,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallHistory {
    pub calls: Vec<CallRecord>,
    pub limit: i64,
    pub offset: i64,
    pub has_more: bool,
}

/// Performs the state transitions behind the agent phone: status changes,
/// agent-placed calls, answer/hangup/hold/transfer, incoming-call
/// notifications, screen pops and call history.
///
/// Each operation writes the durable call record, the live call state and
/// the agent's status entry, then announces itself on the bus.
#[derive(Clone)]
pub struct AgentCallService {
    inner: Arc<Inner>,
}

struct Inner {
    config: AgentConfig,
    coordinator: CallStateCoordinator,
    agents: AgentStatusStore,
    bus: EventBus,
    /// Answer fallbacks by call id
    fallbacks: DashMap<String, ScheduledTask>,
}

impl AgentCallService {
    pub fn new(config: AgentConfig, coordinator: CallStateCoordinator, agents: AgentStatusStore, bus: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                coordinator,
                agents,
                bus,
                fallbacks: DashMap::new(),
            }),
        }
    }

    pub fn coordinator(&self) -> &CallStateCoordinator {
        &self.inner.coordinator
    }

    /// Answer fallbacks not yet fired or cancelled
    pub fn pending_fallbacks(&self) -> usize {
        self.inner.fallbacks.len()
    }

    pub async fn status(&self, agent_id: &str) -> Result<AgentStatusView> {
        Ok(AgentStatusView {
            agent_id: agent_id.to_string(),
            entry: self.inner.agents.get(agent_id).await?,
        })
    }

    /// Manual status change; `on-call` is reserved for call transitions
    pub async fn set_status(&self, agent: &AgentContext, status: AgentStatus) -> Result<AgentStatusView> {
        if !status.is_manual() {
            return Err(EngineError::invalid_input(format!("status '{}' cannot be set by hand", status)));
        }

        let existing = self.inner.agents.get(&agent.agent_id).await?;
        let entry = AgentStatusEntry::now(status, existing.current_call_id);
        self.inner.agents.set(&agent.agent_id, &entry).await?;
        info!(agent_id = %agent.agent_id, %status, "Agent status changed");

        self.inner
            .publish(
                names::AGENT_STATUS_CHANGED,
                &agent.tenant_id,
                json!({ "agentId": agent.agent_id, "status": status }),
            )
            .await;

        Ok(AgentStatusView {
            agent_id: agent.agent_id.clone(),
            entry,
        })
    }

    /// Record an agent-placed outbound call
    pub async fn originate(&self, agent: &AgentContext, request: OriginateRequest) -> Result<OriginatedCall> {
        let phone_number = request.phone_number.trim().to_string();
        if phone_number.is_empty() {
            return Err(EngineError::invalid_input("phone number is required"));
        }

        let call_sid = generate_call_sid(Utc::now());
        let metadata = CallMetadata::new()
            .with_caller(request.caller_id.clone(), None)
            .with_agent(agent.agent_id.as_str())
            .with_lead(None, request.campaign_id.clone())
            .with_originated_by("agent-phone");
        let record = self
            .inner
            .coordinator
            .calls()
            .create(NewCall {
                id: Uuid::new_v4().to_string(),
                tenant_id: agent.tenant_id.clone(),
                call_sid: Some(call_sid.clone()),
                to_number: phone_number.clone(),
                direction: CallDirection::Outbound,
                status: CallStatus::Initiated,
                campaign_id: request.campaign_id.clone(),
                created_by_id: Some(agent.agent_id.clone()),
                metadata: metadata.clone(),
            })
            .await?;

        self.inner.set_on_call(&agent.agent_id, &record.id).await?;

        let state = CallState::new(record.id.as_str(), agent.tenant_id.as_str(), CallStatus::Initiated)
            .with_participant(Participant::new(
                agent.agent_id.as_str(),
                "agent",
                ParticipantRole::Agent,
                ParticipantStatus::Answered,
            ))
            .with_participant(Participant::new(
                "callee",
                phone_number.as_str(),
                ParticipantRole::Callee,
                ParticipantStatus::Ringing,
            ))
            .with_metadata(metadata);
        self.inner.coordinator.set_call_state(&state).await?;

        info!(call_id = %record.id, agent_id = %agent.agent_id, "📞 Agent call initiated");
        self.inner
            .publish(
                names::CALL_INITIATED,
                &agent.tenant_id,
                json!({
                    "callId": record.id,
                    "callSid": call_sid,
                    "direction": "outbound",
                    "agentId": agent.agent_id,
                    "phoneNumber": phone_number,
                    "callerId": request.caller_id,
                    "campaignId": request.campaign_id,
                }),
            )
            .await;

        self.schedule_answer_fallback(&record.id, &agent.tenant_id);

        Ok(OriginatedCall {
            call_id: record.id,
            call_sid,
            status: CallStatus::Initiated,
            phone_number,
            direction: CallDirection::Outbound,
            created_at: record.created_at,
        })
    }

    pub async fn answer(&self, agent: &AgentContext, call_id: &str) -> Result<AnsweredCall> {
        self.cancel_fallback(call_id);
        self.inner.require_call(call_id).await?;

        let answered_at = Utc::now();
        let record = self
            .inner
            .mark_answered(call_id, &agent.tenant_id, Some(&agent.agent_id), answered_at)
            .await?;
        self.inner.set_on_call(&agent.agent_id, call_id).await?;

        Ok(AnsweredCall {
            call_id: call_id.to_string(),
            answered_at: record.answered_at.unwrap_or(answered_at),
        })
    }

    pub async fn hangup(&self, agent: &AgentContext, call_id: &str) -> Result<EndedCall> {
        self.cancel_fallback(call_id);
        self.inner.require_call(call_id).await?;

        let ended_at = Utc::now();
        let record = self
            .inner
            .coordinator
            .calls()
            .mark_ended(call_id, CallStatus::Completed, ended_at)
            .await?
            .ok_or_else(|| EngineError::call_not_found(call_id))?;
        self.inner
            .coordinator
            .update_call_state(call_id, CallStateUpdate::status(record.status))
            .await?;
        self.inner
            .agents
            .set(&agent.agent_id, &AgentStatusEntry::now(AgentStatus::Available, None))
            .await?;

        let duration = record.duration.unwrap_or(0);
        info!(call_id, duration, "Agent hung up");
        self.inner
            .publish(
                names::CALL_ENDED,
                &agent.tenant_id,
                json!({
                    "callId": call_id,
                    "agentId": agent.agent_id,
                    "duration": duration,
                    "endReason": "agent_hangup",
                }),
            )
            .await;

        Ok(EndedCall {
            call_id: call_id.to_string(),
            status: record.status,
            duration,
            ended_at: record.ended_at.unwrap_or(ended_at),
        })
    }

    /// Flip the hold flag of a live call
    pub async fn toggle_hold(&self, agent: &AgentContext, call_id: &str) -> Result<HoldState> {
        let state = self
            .inner
            .coordinator
            .live_state(call_id)
            .await?
            .ok_or_else(|| EngineError::call_not_found(call_id))?;
        if !state.status.is_active() {
            return Err(EngineError::invalid_input(format!("call {} has ended", call_id)));
        }

        let is_on_hold = !state.metadata.on_hold();
        let participants = state
            .participants
            .iter()
            .cloned()
            .map(|mut p| {
                if p.role != ParticipantRole::Agent {
                    p.status = if is_on_hold {
                        ParticipantStatus::Held
                    } else {
                        ParticipantStatus::Answered
                    };
                }
                p
            })
            .collect();
        let update = CallStateUpdate {
            participants: Some(participants),
            metadata: Some(CallMetadata::new().with_hold(is_on_hold)),
            ..Default::default()
        };
        self.inner.coordinator.update_call_state(call_id, update).await?;
        self.inner.set_on_call(&agent.agent_id, call_id).await?;

        self.inner
            .publish(
                names::CALL_HOLD,
                &agent.tenant_id,
                json!({ "callId": call_id, "isOnHold": is_on_hold }),
            )
            .await;

        Ok(HoldState {
            call_id: call_id.to_string(),
            is_on_hold,
        })
    }

    pub async fn transfer(
        &self,
        agent: &AgentContext,
        call_id: &str,
        destination: &str,
        transfer_type: TransferType,
    ) -> Result<TransferOutcome> {
        let destination = destination.trim();
        if destination.is_empty() {
            return Err(EngineError::invalid_input("transfer destination is required"));
        }
        self.inner.require_call(call_id).await?;

        let patch = CallMetadata {
            transfer: Some(TransferInfo {
                destination: destination.to_string(),
                transfer_type,
                by_agent_id: Some(agent.agent_id.clone()),
                at: Utc::now(),
            }),
            ..CallMetadata::new()
        };
        self.inner
            .coordinator
            .calls()
            .merge_metadata(call_id, patch.clone())
            .await?;
        self.inner
            .coordinator
            .update_call_state(call_id, CallStateUpdate::metadata(patch))
            .await?;

        let status = match transfer_type {
            TransferType::Blind => {
                self.inner
                    .agents
                    .set(&agent.agent_id, &AgentStatusEntry::now(AgentStatus::Available, None))
                    .await?;
                self.inner
                    .publish(
                        names::CALL_TRANSFERRED,
                        &agent.tenant_id,
                        json!({
                            "callId": call_id,
                            "agentId": agent.agent_id,
                            "destination": destination,
                            "transferType": transfer_type,
                        }),
                    )
                    .await;
                TransferProgress::Transferred
            }
            TransferType::Warm => TransferProgress::Consulting,
        };
        info!(call_id, destination, ?transfer_type, "Transfer requested");

        Ok(TransferOutcome {
            call_id: call_id.to_string(),
            transfer_type,
            destination: destination.to_string(),
            status,
        })
    }

    /// Validate a key press sent from the agent's keypad
    pub async fn send_dtmf(&self, call_id: &str, digit: &str) -> Result<DtmfSent> {
        let mut chars = digit.chars();
        let digit = match (chars.next(), chars.next()) {
            (Some(c), None) if c.is_ascii_digit() || c == '*' || c == '#' => c,
            _ => return Err(EngineError::invalid_input(format!("invalid DTMF digit '{}'", digit))),
        };
        debug!(call_id, %digit, "DTMF sent");

        Ok(DtmfSent {
            call_id: call_id.to_string(),
            digit,
            sent: true,
        })
    }

    /// Record a ringing inbound call and notify agents
    pub async fn incoming(&self, webhook: IncomingCall) -> Result<IncomingAccepted> {
        let tenant_id = webhook
            .tenant_id
            .filter(|t| !t.is_empty())
            .ok_or_else(|| EngineError::invalid_input("tenantId is required"))?;
        let call_sid = webhook.call_id.unwrap_or_else(|| generate_call_sid(Utc::now()));
        let caller_number = webhook.from.or(webhook.caller_number).unwrap_or_default();
        let screen_pop = webhook
            .screen_pop_data
            .or(webhook.prospect_data)
            .unwrap_or_else(|| json!({}));
        let campaign_id = webhook.campaign_id.filter(|c| !c.is_empty());

        let mut metadata = CallMetadata::new()
            .with_caller(None, webhook.caller_name.clone())
            .with_screen_pop(screen_pop.clone())
            .with_originated_by("incoming-webhook");
        metadata.queue_name = webhook.queue_name.clone();
        metadata.campaign_id = campaign_id.clone();

        let record = self
            .inner
            .coordinator
            .calls()
            .create(NewCall {
                id: Uuid::new_v4().to_string(),
                tenant_id: tenant_id.clone(),
                call_sid: Some(call_sid.clone()),
                to_number: caller_number.clone(),
                direction: CallDirection::Inbound,
                status: CallStatus::Ringing,
                campaign_id: campaign_id.clone(),
                created_by_id: None,
                metadata,
            })
            .await?;
        self.inner.coordinator.set_call_state(&CallState::from_record(&record)).await?;

        info!(call_id = %record.id, caller = %caller_number, "📞 Incoming call");
        self.inner
            .publish(
                names::AGENT_CALL_INCOMING,
                &tenant_id,
                json!({
                    "callId": record.id,
                    "callSid": call_sid,
                    "callerNumber": caller_number,
                    "callerName": webhook.caller_name,
                    "queueName": webhook.queue_name,
                    "campaignId": campaign_id,
                    "screenPopData": screen_pop,
                }),
            )
            .await;

        Ok(IncomingAccepted {
            call_id: record.id,
            call_sid,
            status: CallStatus::Ringing,
        })
    }

    /// Screen-pop data from the live state, falling back to the durable record
    pub async fn screen_pop(&self, call_id: &str) -> Result<ScreenPop> {
        if let Some(data) = self
            .inner
            .coordinator
            .get_call_state(call_id)
            .await?
            .and_then(|state| state.metadata.screen_pop)
        {
            return Ok(ScreenPop {
                call_id: call_id.to_string(),
                data,
            });
        }

        let record = self.inner.require_call(call_id).await?;
        Ok(ScreenPop {
            call_id: call_id.to_string(),
            data: record.metadata.screen_pop.unwrap_or_else(|| json!({})),
        })
    }

    /// Calls the agent placed or answered, newest first
    pub async fn history(&self, agent: &AgentContext, limit: i64, offset: i64) -> Result<CallHistory> {
        if limit <= 0 || offset < 0 {
            return Err(EngineError::invalid_input("limit must be positive and offset non-negative"));
        }
        let calls = self
            .inner
            .coordinator
            .calls()
            .list_for_agent(&agent.tenant_id, &agent.agent_id, limit, offset)
            .await?;
        let has_more = calls.len() as i64 == limit;

        Ok(CallHistory {
            calls,
            limit,
            offset,
            has_more,
        })
    }

    fn schedule_answer_fallback(&self, call_id: &str, tenant_id: &str) {
        if self.inner.config.answer_fallback_ms == 0 {
            return;
        }

        let delay = Duration::from_millis(self.inner.config.answer_fallback_ms);
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let call = call_id.to_string();
        let tenant = tenant_id.to_string();
        let task = ScheduledTask::after(format!("answer-fallback:{}", call_id), delay, async move {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            debug!(call_id = %call, "answer fallback firing");
            if let Err(e) = inner.mark_answered(&call, &tenant, None, Utc::now()).await {
                warn!(call_id = %call, "answer fallback failed: {}", e);
            }
            inner.fallbacks.remove(&call);
        });
        self.inner.fallbacks.insert(call_id.to_string(), task);
    }

    fn cancel_fallback(&self, call_id: &str) {
        if let Some((_, task)) = self.inner.fallbacks.remove(call_id) {
            if task.cancel() {
                debug!(call_id, "answer fallback cancelled");
            }
        }
    }
}

impl Inner {
    async fn require_call(&self, call_id: &str) -> Result<CallRecord> {
        self.coordinator
            .calls()
            .get(call_id)
            .await?
            .ok_or_else(|| EngineError::call_not_found(call_id))
    }

    async fn set_on_call(&self, agent_id: &str, call_id: &str) -> Result<()> {
        self.agents
            .set(agent_id, &AgentStatusEntry::now(AgentStatus::OnCall, Some(call_id.to_string())))
            .await
    }

    async fn mark_answered(
        &self,
        call_id: &str,
        tenant_id: &str,
        agent_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<CallRecord> {
        let calls = self.coordinator.calls();
        let mut record = calls
            .mark_answered(call_id, at)
            .await?
            .ok_or_else(|| EngineError::call_not_found(call_id))?;
        if let Some(agent_id) = agent_id {
            let patch = CallMetadata {
                answered_by_agent_id: Some(agent_id.to_string()),
                ..CallMetadata::new()
            };
            if let Some(updated) = calls.merge_metadata(call_id, patch).await? {
                record = updated;
            }
        }
        self.coordinator
            .update_call_state(call_id, CallStateUpdate::status(CallStatus::Answered))
            .await?;

        self.publish(
            names::CALL_ANSWERED,
            tenant_id,
            json!({ "callId": call_id, "agentId": agent_id }),
        )
        .await;
        Ok(record)
    }

    async fn publish(&self, name: &str, tenant_id: &str, data: Value) {
        if let Err(e) = self.bus.publish(channels::CALL, NewEvent::new(name, tenant_id, data)).await {
            warn!("Could not publish {}: {}", name, e);
        }
    }
}

const SID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// `call_<unix millis>_<random base36>`
fn generate_call_sid(now: DateTime<Utc>) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| SID_ALPHABET[rng.gen_range(0..SID_ALPHABET.len())] as char)
        .collect();
    format!("call_{}_{}", now.timestamp_millis(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_sid_shape() {
        let sid = generate_call_sid(Utc::now());
        let parts: Vec<&str> = sid.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "call");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 6);
    }
}
