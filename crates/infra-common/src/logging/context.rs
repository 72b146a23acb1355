use std::collections::BTreeMap;
use std::fmt;
use tracing::{Level, Span};

/// Context information for logging.
///
/// Carries the component name, an optional operation and a set of
/// correlation fields (`call_id`, `lead_id`, ...). The context renders as a
/// span so every event logged inside it inherits the correlation ids.
#[derive(Debug, Clone)]
pub struct LogContext {
    /// Component that is generating the log
    pub component: String,
    /// Operation or action being performed
    pub operation: Option<String>,
    /// Correlation fields, kept sorted for stable output
    pub fields: BTreeMap<String, String>,
}

impl LogContext {
    /// Create a new log context with just the component name
    pub fn new<S: Into<String>>(component: S) -> Self {
        LogContext {
            component: component.into(),
            operation: None,
            fields: BTreeMap::new(),
        }
    }

    /// Create a new log context with component and operation
    pub fn with_operation<S: Into<String>, T: Into<String>>(component: S, operation: T) -> Self {
        LogContext {
            component: component.into(),
            operation: Some(operation.into()),
            fields: BTreeMap::new(),
        }
    }

    /// Add a field to the context
    pub fn with_field<S: Into<String>, T: Into<String>>(mut self, key: S, value: T) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Add a field only when a value is present
    pub fn with_optional_field<S: Into<String>>(self, key: S, value: Option<&str>) -> Self {
        match value {
            Some(value) => self.with_field(key, value),
            None => self,
        }
    }

    /// Correlation fields rendered as `k=v` pairs
    pub fn correlation(&self) -> String {
        self.fields
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Create a span with this context's information.
    ///
    /// `tracing` span macros need a constant level, hence the match.
    pub fn span(&self, level: Level) -> Span {
        let operation = self.operation.as_deref().unwrap_or("");
        let correlation = self.correlation();
        match level {
            Level::TRACE => tracing::trace_span!("rdial", component = %self.component, operation = %operation, ids = %correlation),
            Level::DEBUG => tracing::debug_span!("rdial", component = %self.component, operation = %operation, ids = %correlation),
            Level::INFO => tracing::info_span!("rdial", component = %self.component, operation = %operation, ids = %correlation),
            Level::WARN => tracing::warn_span!("rdial", component = %self.component, operation = %operation, ids = %correlation),
            _ => tracing::error_span!("rdial", component = %self.component, operation = %operation, ids = %correlation),
        }
    }
}

impl fmt::Display for LogContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.component)?;

        if let Some(op) = &self.operation {
            write!(f, "[{}]", op)?;
        }

        for (key, value) in &self.fields {
            write!(f, "[{}={}]", key, value)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_fields_in_order() {
        let ctx = LogContext::with_operation("fronter", "handle_leg")
            .with_field("lead_id", "lead-1")
            .with_field("call_id", "abc");
        assert_eq!(ctx.to_string(), "[fronter][handle_leg][call_id=abc][lead_id=lead-1]");
        assert_eq!(ctx.correlation(), "call_id=abc lead_id=lead-1");
    }

    #[test]
    fn test_optional_field_skips_none() {
        let ctx = LogContext::new("dialer")
            .with_optional_field("lead_id", None)
            .with_optional_field("campaign_id", Some("c-9"));
        assert_eq!(ctx.fields.len(), 1);
        assert_eq!(ctx.fields.get("campaign_id").map(String::as_str), Some("c-9"));
    }

    #[test]
    fn test_span_builds_at_every_level() {
        let ctx = LogContext::new("bus");
        for level in [Level::TRACE, Level::DEBUG, Level::INFO, Level::WARN, Level::ERROR] {
            let _span = ctx.span(level);
        }
    }
}
