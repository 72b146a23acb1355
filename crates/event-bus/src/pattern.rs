/// Whether `channel` is addressed by `pattern`.
///
/// `"X.*"` matches every channel starting with `"X."`; any other pattern
/// matches only itself.
pub fn matches_pattern(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix(".*") {
        Some(prefix) => channel
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.')),
        None => pattern == channel,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_matches_family_only() {
        assert!(matches_pattern("call.*", "call.answered"));
        assert!(matches_pattern("call.*", "call.*"));
        assert!(!matches_pattern("call.*", "billing.created"));
        assert!(!matches_pattern("call.*", "callback.created"));
        assert!(!matches_pattern("call.*", "call"));
    }

    #[test]
    fn test_exact_matches_itself_only() {
        assert!(matches_pattern("call.answered", "call.answered"));
        assert!(!matches_pattern("call.answered", "call.started"));
        assert!(!matches_pattern("call.answered", "call.*"));
    }
}
