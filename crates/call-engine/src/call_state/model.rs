//! Live call state records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metadata::CallMetadata;
use crate::types::{CallDirection, CallRecord, CallStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Agent,
    Callee,
    Caller,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantStatus {
    Ringing,
    Answered,
    Held,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub number: String,
    pub role: ParticipantRole,
    pub status: ParticipantStatus,
}

impl Participant {
    pub fn new(id: impl Into<String>, number: impl Into<String>, role: ParticipantRole, status: ParticipantStatus) -> Self {
        Self {
            id: id.into(),
            number: number.into(),
            role,
            status,
        }
    }
}

/// A running timer on the call (wrap-up, hold, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallTimer {
    pub name: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// The fast-store mirror of an active call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallState {
    /// Same id as the durable call record
    pub id: String,
    pub tenant_id: String,
    pub status: CallStatus,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub timers: Vec<CallTimer>,
    #[serde(default)]
    pub metadata: CallMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CallState {
    pub fn new(id: impl Into<String>, tenant_id: impl Into<String>, status: CallStatus) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            status,
            participants: Vec::new(),
            timers: Vec::new(),
            metadata: CallMetadata::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_participant(mut self, participant: Participant) -> Self {
        self.participants.push(participant);
        self
    }

    pub fn with_metadata(mut self, metadata: CallMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Rebuild a live state from the durable record
    pub fn from_record(record: &CallRecord) -> Self {
        let (role, id) = match record.direction {
            CallDirection::Outbound => (ParticipantRole::Callee, "callee"),
            CallDirection::Inbound => (ParticipantRole::Caller, "caller"),
        };
        let remote_status = match record.status {
            CallStatus::Answered => ParticipantStatus::Answered,
            CallStatus::Completed | CallStatus::Failed => ParticipantStatus::Disconnected,
            _ => ParticipantStatus::Ringing,
        };

        let mut state = CallState::new(record.id.as_str(), record.tenant_id.as_str(), record.status)
            .with_participant(Participant::new(id, record.to_number.as_str(), role, remote_status))
            .with_metadata(record.metadata.clone());
        if let Some(agent) = record
            .metadata
            .answered_by_agent_id
            .as_deref()
            .or(record.metadata.agent_id.as_deref())
        {
            state = state.with_participant(Participant::new(
                agent,
                "agent",
                ParticipantRole::Agent,
                ParticipantStatus::Answered,
            ));
        }
        state.created_at = record.created_at;
        state
    }

    /// Apply `update`, merging metadata instead of replacing it
    pub fn apply(&mut self, update: CallStateUpdate) {
        if let Some(status) = update.status {
            self.status = status;
            if !status.is_active() {
                for participant in &mut self.participants {
                    participant.status = ParticipantStatus::Disconnected;
                }
            } else if status == CallStatus::Answered {
                for participant in &mut self.participants {
                    if participant.status == ParticipantStatus::Ringing {
                        participant.status = ParticipantStatus::Answered;
                    }
                }
            }
        }
        if let Some(participants) = update.participants {
            self.participants = participants;
        }
        if let Some(timers) = update.timers {
            self.timers = timers;
        }
        if let Some(metadata) = update.metadata {
            self.metadata.merge(metadata);
        }
        self.updated_at = Utc::now();
    }
}

/// A partial update of a [`CallState`]; unset fields are left alone
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallStateUpdate {
    pub status: Option<CallStatus>,
    pub participants: Option<Vec<Participant>>,
    pub timers: Option<Vec<CallTimer>>,
    pub metadata: Option<CallMetadata>,
}

impl CallStateUpdate {
    pub fn status(status: CallStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn metadata(metadata: CallMetadata) -> Self {
        Self {
            metadata: Some(metadata),
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, metadata: CallMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_answer_promotes_ringing_participants() {
        let mut state = CallState::new("c-1", "t-1", CallStatus::Initiated)
            .with_participant(Participant::new("callee", "+1555", ParticipantRole::Callee, ParticipantStatus::Ringing));
        state.apply(CallStateUpdate::status(CallStatus::Answered));
        assert_eq!(state.participants[0].status, ParticipantStatus::Answered);

        state.apply(CallStateUpdate::status(CallStatus::Completed));
        assert_eq!(state.participants[0].status, ParticipantStatus::Disconnected);
    }

    #[test]
    fn test_status_update_keeps_metadata() {
        let mut state = CallState::new("c-1", "t-1", CallStatus::Ringing)
            .with_metadata(CallMetadata::new().with_screen_pop(json!({ "name": "Ada" })));
        state.apply(CallStateUpdate::status(CallStatus::Answered));
        assert_eq!(state.metadata.screen_pop, Some(json!({ "name": "Ada" })));
    }

    #[test]
    fn test_serialized_shape() {
        let state = CallState::new("c-1", "t-1", CallStatus::Ringing)
            .with_participant(Participant::new("caller", "+1555", ParticipantRole::Caller, ParticipantStatus::Ringing));
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["tenantId"], json!("t-1"));
        assert_eq!(value["status"], json!("RINGING"));
        assert_eq!(value["participants"][0]["role"], json!("caller"));
    }
}
