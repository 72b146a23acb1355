//! Durable domain types: leads, campaigns and call records
//!
//! Enum values are stored in the database in SCREAMING_SNAKE_CASE, which is
//! also their serde representation.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::metadata::CallMetadata;

/// Dialing status of a lead
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeadStatus {
    New,
    Recycled,
    Dialing,
    InCall,
    Transferred,
    NotInterested,
    NoResponse,
    Failed,
    Other,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::New => "NEW",
            LeadStatus::Recycled => "RECYCLED",
            LeadStatus::Dialing => "DIALING",
            LeadStatus::InCall => "IN_CALL",
            LeadStatus::Transferred => "TRANSFERRED",
            LeadStatus::NotInterested => "NOT_INTERESTED",
            LeadStatus::NoResponse => "NO_RESPONSE",
            LeadStatus::Failed => "FAILED",
            LeadStatus::Other => "OTHER",
        }
    }

    /// NEW and RECYCLED leads may be claimed by the dialer
    pub fn is_dialable(&self) -> bool {
        matches!(self, LeadStatus::New | LeadStatus::Recycled)
    }

    /// The lead is out of the dialing cycle
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LeadStatus::Transferred
                | LeadStatus::NotInterested
                | LeadStatus::NoResponse
                | LeadStatus::Failed
                | LeadStatus::Other
        )
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeadStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(LeadStatus::New),
            "RECYCLED" => Ok(LeadStatus::Recycled),
            "DIALING" => Ok(LeadStatus::Dialing),
            "IN_CALL" => Ok(LeadStatus::InCall),
            "TRANSFERRED" => Ok(LeadStatus::Transferred),
            "NOT_INTERESTED" => Ok(LeadStatus::NotInterested),
            "NO_RESPONSE" => Ok(LeadStatus::NoResponse),
            "FAILED" => Ok(LeadStatus::Failed),
            "OTHER" => Ok(LeadStatus::Other),
            other => Err(EngineError::invalid_input(format!("unknown lead status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CampaignStatus {
    Draft,
    Active,
    Paused,
    Completed,
}

/// A campaign as far as this engine cares: its status and flow settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Campaign {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub status: CampaignStatus,
    /// Campaign-specific intro prompt, played instead of the default
    pub intro_audio: Option<String>,
}

/// A lead selected for dialing, joined with its campaign
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadToDial {
    pub id: String,
    pub phone_number: String,
    pub campaign_id: String,
    pub tenant_id: String,
    pub campaign_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

impl CallDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallDirection::Inbound => "INBOUND",
            CallDirection::Outbound => "OUTBOUND",
        }
    }
}

impl FromStr for CallDirection {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INBOUND" => Ok(CallDirection::Inbound),
            "OUTBOUND" => Ok(CallDirection::Outbound),
            other => Err(EngineError::invalid_input(format!("unknown call direction '{}'", other))),
        }
    }
}

/// Progress of a call attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallStatus {
    Initiated,
    Ringing,
    Answered,
    Completed,
    Failed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Initiated => "INITIATED",
            CallStatus::Ringing => "RINGING",
            CallStatus::Answered => "ANSWERED",
            CallStatus::Completed => "COMPLETED",
            CallStatus::Failed => "FAILED",
        }
    }

    /// The call has not ended yet
    pub fn is_active(&self) -> bool {
        matches!(self, CallStatus::Initiated | CallStatus::Ringing | CallStatus::Answered)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INITIATED" => Ok(CallStatus::Initiated),
            "RINGING" => Ok(CallStatus::Ringing),
            "ANSWERED" => Ok(CallStatus::Answered),
            "COMPLETED" => Ok(CallStatus::Completed),
            "FAILED" => Ok(CallStatus::Failed),
            other => Err(EngineError::invalid_input(format!("unknown call status '{}'", other))),
        }
    }
}

/// A call to be recorded
#[derive(Debug, Clone, PartialEq)]
pub struct NewCall {
    /// Shared with the switch leg when we originate it ourselves
    pub id: String,
    pub tenant_id: String,
    pub call_sid: Option<String>,
    /// Remote party: the callee for outbound calls, the caller for inbound
    pub to_number: String,
    pub direction: CallDirection,
    pub status: CallStatus,
    pub campaign_id: Option<String>,
    pub created_by_id: Option<String>,
    pub metadata: CallMetadata,
}

/// The durable record of a call attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: String,
    pub tenant_id: String,
    pub call_sid: Option<String>,
    pub to_number: String,
    pub direction: CallDirection,
    pub status: CallStatus,
    pub campaign_id: Option<String>,
    pub created_by_id: Option<String>,
    pub metadata: CallMetadata,
    pub created_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Seconds from answer to end; 0 for calls never answered
    pub duration: Option<i64>,
}

impl CallRecord {
    /// Build the record a freshly inserted call would have
    pub fn from_new(call: NewCall, created_at: DateTime<Utc>) -> Self {
        Self {
            id: call.id,
            tenant_id: call.tenant_id,
            call_sid: call.call_sid,
            to_number: call.to_number,
            direction: call.direction,
            status: call.status,
            campaign_id: call.campaign_id,
            created_by_id: call.created_by_id,
            metadata: call.metadata,
            created_at,
            answered_at: None,
            ended_at: None,
            duration: None,
        }
    }

    /// Complete a record that was opened before its `call.initiated` arrived.
    ///
    /// Values already stored win; `call` only fills what is missing. A blank
    /// number marks a placeholder, whose direction is taken from `call` too.
    pub fn fill_gaps(&mut self, call: NewCall) {
        if self.to_number.is_empty() && !call.to_number.is_empty() {
            self.to_number = call.to_number;
            self.direction = call.direction;
        }
        if self.call_sid.is_none() {
            self.call_sid = call.call_sid;
        }
        if self.campaign_id.is_none() {
            self.campaign_id = call.campaign_id;
        }
        if self.created_by_id.is_none() {
            self.created_by_id = call.created_by_id;
        }
        let stored = std::mem::take(&mut self.metadata);
        self.metadata = call.metadata.merged(stored);
    }
}

/// Whole seconds between answer and end, never negative
pub fn call_duration(answered_at: Option<DateTime<Utc>>, ended_at: DateTime<Utc>) -> i64 {
    answered_at
        .map(|answered| (ended_at - answered).num_seconds().max(0))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_lead_status_round_trips_through_strings() {
        for status in [LeadStatus::New, LeadStatus::InCall, LeadStatus::NotInterested] {
            assert_eq!(status.as_str().parse::<LeadStatus>().unwrap(), status);
        }
        assert!("BOGUS".parse::<LeadStatus>().is_err());
    }

    #[test]
    fn test_lead_status_classes() {
        assert!(LeadStatus::Recycled.is_dialable());
        assert!(!LeadStatus::Dialing.is_dialable());
        assert!(LeadStatus::NoResponse.is_terminal());
        assert!(!LeadStatus::InCall.is_terminal());
    }

    #[test]
    fn test_duration_counts_from_answer() {
        let answered = Utc::now();
        assert_eq!(call_duration(Some(answered), answered + Duration::seconds(42)), 42);
        assert_eq!(call_duration(None, answered), 0);
        assert_eq!(call_duration(Some(answered), answered - Duration::seconds(5)), 0);
    }
}
