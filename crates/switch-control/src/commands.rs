//! Builders and parsers for the command strings we send to the switch

use std::sync::OnceLock;

use regex::Regex;

/// Prefix for the channel variables that correlate a leg with our records
pub const CORRELATION_PREFIX: &str = "rdial_";

/// Name of the correlation variable for `key` (`lead_id` -> `rdial_lead_id`)
pub fn correlation_var(key: &str) -> String {
    format!("{}{}", CORRELATION_PREFIX, key)
}

/// An outbound call whose answered leg is handed back to our socket listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Originate {
    /// Channel uuid to assign, so our records and the switch agree on the id
    pub call_id: String,
    /// Dial string, e.g. `sofia/gateway/telnyx/+15551234567`
    pub dial_string: String,
    pub caller_id_number: String,
    pub caller_id_name: String,
    /// Extra channel variables, in insertion order
    pub variables: Vec<(String, String)>,
    /// `host:port` of the outbound listener
    pub socket_address: String,
}

impl Originate {
    pub fn new(call_id: impl Into<String>, dial_string: impl Into<String>, socket_address: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            dial_string: dial_string.into(),
            caller_id_number: String::new(),
            caller_id_name: String::new(),
            variables: Vec::new(),
            socket_address: socket_address.into(),
        }
    }

    pub fn caller_id(mut self, number: impl Into<String>, name: impl Into<String>) -> Self {
        self.caller_id_number = number.into();
        self.caller_id_name = name.into();
        self
    }

    pub fn variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.push((name.into(), value.into()));
        self
    }

    /// Attach a correlation variable under the shared prefix
    pub fn correlate(self, key: &str, value: impl Into<String>) -> Self {
        self.variable(correlation_var(key), value)
    }

    /// Render the `originate` command (without the `bgapi` verb)
    pub fn to_command(&self) -> String {
        let mut vars = vec![
            ("ignore_early_media".to_string(), "true".to_string()),
            ("origination_uuid".to_string(), self.call_id.clone()),
        ];
        if !self.caller_id_number.is_empty() {
            vars.push(("origination_caller_id_number".to_string(), self.caller_id_number.clone()));
        }
        if !self.caller_id_name.is_empty() {
            vars.push(("origination_caller_id_name".to_string(), self.caller_id_name.clone()));
        }
        vars.extend(self.variables.iter().cloned());

        let rendered = vars
            .iter()
            .map(|(k, v)| format!("{}={}", k, escape_value(v)))
            .collect::<Vec<_>>()
            .join(",");

        format!(
            "originate {{{}}}{} &socket({} async full)",
            rendered, self.dial_string, self.socket_address
        )
    }
}

/// Values inside `{...}` may not carry raw separators or spaces
fn escape_value(value: &str) -> String {
    let needs_quotes = value.contains(' ');
    let escaped = value.replace(',', "\\,").replace('}', "\\}");
    if needs_quotes {
        format!("'{}'", escaped.replace('\'', "\\'"))
    } else {
        escaped
    }
}

/// Parse the total out of a `show calls count` reply (`"3 total."`)
pub fn parse_calls_count(reply: &str) -> Option<u32> {
    static TOTAL: OnceLock<Option<Regex>> = OnceLock::new();
    let re = TOTAL.get_or_init(|| Regex::new(r"(\d+)\s+total").ok()).as_ref()?;
    re.captures(reply)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// `uuid_getvar <uuid> <name>`
pub fn getvar(call_id: &str, name: &str) -> String {
    format!("uuid_getvar {} {}", call_id, name)
}
