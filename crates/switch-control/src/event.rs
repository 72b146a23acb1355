//! Switch events delivered in `plain` format
//!
//! Header values inside an event body are percent-encoded by the switch; they
//! are decoded once here so callers always see plain text.

use std::collections::HashMap;

use percent_encoding::percent_decode_str;

use crate::error::{Result, SwitchError};

pub const BACKGROUND_JOB: &str = "BACKGROUND_JOB";
pub const CHANNEL_EXECUTE_COMPLETE: &str = "CHANNEL_EXECUTE_COMPLETE";
pub const CHANNEL_HANGUP: &str = "CHANNEL_HANGUP";
pub const CHANNEL_HANGUP_COMPLETE: &str = "CHANNEL_HANGUP_COMPLETE";
pub const DTMF: &str = "DTMF";

/// A decoded switch event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwitchEvent {
    headers: HashMap<String, String>,
    body: Option<String>,
}

impl SwitchEvent {
    /// Create an event with just a name
    pub fn new(name: &str) -> Self {
        Self::default().with_header("Event-Name", name)
    }

    /// Builder used when synthesizing events
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Parse the body of a `text/event-plain` frame
    pub fn parse_plain(raw: &str) -> Result<Self> {
        let (head, rest) = match raw.find("\n\n") {
            Some(idx) => (&raw[..idx], Some(&raw[idx + 2..])),
            None => (raw, None),
        };

        let headers = decode_headers(head.lines())?;
        let mut event = Self {
            headers,
            body: None,
        };

        if let (Some(length), Some(rest)) = (event.header("Content-Length"), rest) {
            let length: usize = length
                .parse()
                .map_err(|_| SwitchError::protocol(format!("bad event Content-Length: {}", length)))?;
            let bytes = rest.as_bytes();
            let end = length.min(bytes.len());
            event.body = Some(String::from_utf8_lossy(&bytes[..end]).into_owned());
        }

        if event.name().is_none() {
            return Err(SwitchError::protocol("event without Event-Name"));
        }
        Ok(event)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    /// `Event-Name` header
    pub fn name(&self) -> Option<&str> {
        self.header("Event-Name")
    }

    pub fn is(&self, name: &str) -> bool {
        self.name() == Some(name)
    }

    /// Channel uuid the event belongs to
    pub fn unique_id(&self) -> Option<&str> {
        self.header("Unique-ID")
    }

    pub fn job_uuid(&self) -> Option<&str> {
        self.header("Job-UUID")
    }

    pub fn application_uuid(&self) -> Option<&str> {
        self.header("Application-UUID")
    }

    pub fn hangup_cause(&self) -> Option<&str> {
        self.header("Hangup-Cause")
    }

    /// The pressed key on a DTMF event
    pub fn dtmf_digit(&self) -> Option<char> {
        self.header("DTMF-Digit").and_then(|d| d.chars().next())
    }

    /// Channel variable carried on the event (`variable_<name>` header)
    pub fn variable(&self, name: &str) -> Option<&str> {
        self.header(&format!("variable_{}", name))
    }

    /// True for either hangup notification
    pub fn is_hangup(&self) -> bool {
        self.is(CHANNEL_HANGUP) || self.is(CHANNEL_HANGUP_COMPLETE)
    }
}

/// Decode `Name: value` lines, percent-decoding every value
pub(crate) fn decode_headers<'a, I>(lines: I) -> Result<HashMap<String, String>>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut headers = HashMap::new();
    for line in lines {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| SwitchError::protocol(format!("malformed event header: {}", line)))?;
        headers.insert(name.trim().to_string(), decode_value(value.trim()));
    }
    Ok(headers)
}

pub(crate) fn decode_value(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decodes_values() {
        let raw = "Event-Name: CHANNEL_EXECUTE_COMPLETE\nUnique-ID: 7f1e\nApplication-UUID: app-1\nvariable_rdial_lead_id: lead%2042\n\n";
        let event = SwitchEvent::parse_plain(raw).unwrap();
        assert!(event.is(CHANNEL_EXECUTE_COMPLETE));
        assert_eq!(event.unique_id(), Some("7f1e"));
        assert_eq!(event.application_uuid(), Some("app-1"));
        assert_eq!(event.variable("rdial_lead_id"), Some("lead 42"));
        assert!(event.body().is_none());
    }

    #[test]
    fn test_parse_background_job_body() {
        let raw = "Event-Name: BACKGROUND_JOB\nJob-UUID: j-1\nContent-Length: 16\n\n+OK 1234-abcd-ef";
        let event = SwitchEvent::parse_plain(raw).unwrap();
        assert_eq!(event.job_uuid(), Some("j-1"));
        assert_eq!(event.body(), Some("+OK 1234-abcd-ef"));
    }

    #[test]
    fn test_dtmf_and_hangup_helpers() {
        let dtmf = SwitchEvent::new(DTMF).with_header("DTMF-Digit", "9");
        assert_eq!(dtmf.dtmf_digit(), Some('9'));
        assert!(!dtmf.is_hangup());

        let hangup = SwitchEvent::new(CHANNEL_HANGUP).with_header("Hangup-Cause", "NORMAL_CLEARING");
        assert!(hangup.is_hangup());
        assert_eq!(hangup.hangup_cause(), Some("NORMAL_CLEARING"));
    }

    #[test]
    fn test_event_without_name_is_rejected() {
        assert!(SwitchEvent::parse_plain("Unique-ID: x\n").is_err());
    }
}
