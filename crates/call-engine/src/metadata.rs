//! Structured per-call metadata
//!
//! Shared by the durable call record and the live call state. Every field is
//! optional and [`CallMetadata::merge`] only touches the fields a patch sets,
//! so partial updates from different writers never erase each other.
//! Keys we do not model are kept in `extra`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current schema version written by this crate
pub const METADATA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferType {
    /// Hand the call over and leave
    Blind,
    /// Consult the destination first
    Warm,
}

/// Where and by whom a call was transferred
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferInfo {
    pub destination: String,
    #[serde(rename = "type")]
    pub transfer_type: TransferType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_agent_id: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CallMetadata {
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answered_by_agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lead_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_on_hold: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen_pop: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer: Option<TransferInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub originated_by: Option<String>,
    /// Final outcome of an automated call flow
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disposition: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for CallMetadata {
    fn default() -> Self {
        Self {
            version: METADATA_VERSION,
            caller_id: None,
            caller_name: None,
            agent_id: None,
            answered_by_agent_id: None,
            lead_id: None,
            campaign_id: None,
            queue_name: None,
            is_on_hold: None,
            screen_pop: None,
            transfer: None,
            originated_by: None,
            disposition: None,
            extra: BTreeMap::new(),
        }
    }
}

impl CallMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overlay every field set in `patch`; unset fields keep their value
    pub fn merge(&mut self, patch: CallMetadata) {
        fn overlay<T>(target: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *target = value;
            }
        }

        overlay(&mut self.caller_id, patch.caller_id);
        overlay(&mut self.caller_name, patch.caller_name);
        overlay(&mut self.agent_id, patch.agent_id);
        overlay(&mut self.answered_by_agent_id, patch.answered_by_agent_id);
        overlay(&mut self.lead_id, patch.lead_id);
        overlay(&mut self.campaign_id, patch.campaign_id);
        overlay(&mut self.queue_name, patch.queue_name);
        overlay(&mut self.is_on_hold, patch.is_on_hold);
        overlay(&mut self.screen_pop, patch.screen_pop);
        overlay(&mut self.transfer, patch.transfer);
        overlay(&mut self.originated_by, patch.originated_by);
        overlay(&mut self.disposition, patch.disposition);
        self.extra.extend(patch.extra);
        self.version = self.version.max(METADATA_VERSION);
    }

    /// `merge` returning the result
    pub fn merged(mut self, patch: CallMetadata) -> Self {
        self.merge(patch);
        self
    }

    pub fn with_caller(mut self, caller_id: Option<String>, caller_name: Option<String>) -> Self {
        self.caller_id = caller_id;
        self.caller_name = caller_name;
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_lead(mut self, lead_id: Option<String>, campaign_id: Option<String>) -> Self {
        self.lead_id = lead_id;
        self.campaign_id = campaign_id;
        self
    }

    pub fn with_hold(mut self, on_hold: bool) -> Self {
        self.is_on_hold = Some(on_hold);
        self
    }

    pub fn with_screen_pop(mut self, data: Value) -> Self {
        self.screen_pop = Some(data);
        self
    }

    pub fn with_originated_by(mut self, origin: impl Into<String>) -> Self {
        self.originated_by = Some(origin.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn on_hold(&self) -> bool {
        self.is_on_hold.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_keeps_unrelated_fields() {
        let mut existing = CallMetadata::new()
            .with_caller(Some("+15550001111".into()), None)
            .with_extra("crmRef", json!("A-17"));

        existing.merge(CallMetadata::new().with_hold(true));

        assert_eq!(existing.caller_id.as_deref(), Some("+15550001111"));
        assert_eq!(existing.extra.get("crmRef"), Some(&json!("A-17")));
        assert!(existing.on_hold());
    }

    #[test]
    fn test_merge_overwrites_set_fields_only() {
        let existing = CallMetadata::new().with_hold(true).with_agent("agent-1");
        let merged = existing.merged(CallMetadata::new().with_hold(false));
        assert_eq!(merged.is_on_hold, Some(false));
        assert_eq!(merged.agent_id.as_deref(), Some("agent-1"));
    }

    #[test]
    fn test_json_shape_is_camel_case_with_flattened_extra() {
        let metadata = CallMetadata::new()
            .with_agent("agent-1")
            .with_hold(true)
            .with_extra("source", json!("import"));
        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(
            value,
            json!({ "version": 1, "agentId": "agent-1", "isOnHold": true, "source": "import" })
        );
    }

    #[test]
    fn test_unknown_keys_survive_a_round_trip() {
        let raw = json!({ "agentId": "a-2", "legacyFlag": true });
        let metadata: CallMetadata = serde_json::from_value(raw).unwrap();
        assert_eq!(metadata.version, METADATA_VERSION);
        assert_eq!(metadata.agent_id.as_deref(), Some("a-2"));
        assert_eq!(metadata.extra.get("legacyFlag"), Some(&json!(true)));
    }
}
