//! Event envelope

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Well known channels events are published on
pub mod channels {
    pub const CALL: &str = "call.*";
    pub const BILLING: &str = "billing.*";
    pub const RECORDING: &str = "recording.*";
}

/// Canonical event names
pub mod names {
    pub const CALL_INITIATED: &str = "call.initiated";
    pub const CALL_ANSWERED: &str = "call.answered";
    pub const CALL_TRANSFERRED: &str = "call.transferred";
    pub const CALL_HOLD: &str = "call.hold";
    pub const CALL_ENDED: &str = "call.ended";
    pub const CALL_FAILED: &str = "call.failed";
    pub const AGENT_STATUS_CHANGED: &str = "agent.status.changed";
    pub const AGENT_CALL_INCOMING: &str = "agent.call.incoming";
}

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ID_SUFFIX_LEN: usize = 9;

/// A published event as stored on the stream and pushed to subscribers.
///
/// Serialized in camelCase, which is the shape external consumers read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unique id: publish time in millis plus a random suffix
    pub id: String,
    /// Specific event name, e.g. `call.answered`
    pub event: String,
    pub tenant_id: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Stamp a new event with a fresh id and the current time
    pub fn stamp(new: NewEvent) -> Self {
        let now = Utc::now();
        Self {
            id: event_id(now),
            event: new.event,
            tenant_id: new.tenant_id,
            data: new.data,
            timestamp: now,
        }
    }

    /// Coarse wildcard address of this event (`call.answered` -> `call.*`)
    pub fn wildcard(&self) -> String {
        wildcard_of(&self.event)
    }

    /// String field of the payload
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// An event before it is stamped by the bus
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event: String,
    pub tenant_id: String,
    pub data: Value,
}

impl NewEvent {
    pub fn new(event: impl Into<String>, tenant_id: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            tenant_id: tenant_id.into(),
            data,
        }
    }
}

/// `<segment before the first dot>.*`
pub fn wildcard_of(event: &str) -> String {
    let base = event.split('.').next().unwrap_or(event);
    format!("{}.*", base)
}

fn event_id(now: DateTime<Utc>) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect();
    format!("{}-{}", now.timestamp_millis(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wildcard_uses_first_segment() {
        assert_eq!(wildcard_of("call.answered"), "call.*");
        assert_eq!(wildcard_of("agent.status.changed"), "agent.*");
        assert_eq!(wildcard_of("heartbeat"), "heartbeat.*");
    }

    #[test]
    fn test_stamp_assigns_unique_ids() {
        let a = Event::stamp(NewEvent::new("call.ended", "t1", json!({})));
        let b = Event::stamp(NewEvent::new("call.ended", "t1", json!({})));
        assert_ne!(a.id, b.id);

        let (millis, suffix) = a.id.split_once('-').unwrap();
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(suffix.len(), 9);
        assert!(suffix.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn test_serializes_in_camel_case() {
        let event = Event::stamp(NewEvent::new("call.answered", "t1", json!({"callId": "c1"})));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["tenantId"], "t1");
        assert_eq!(value["data"]["callId"], "c1");
        assert_eq!(event.data_str("callId"), Some("c1"));

        let back: Event = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }
}
