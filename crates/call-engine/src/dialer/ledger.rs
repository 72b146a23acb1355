//! Per-lead originate failure tracking
//!
//! A failed originate puts the lead back to NEW, so without a memory of
//! failures a lead whose destination always fails would be redialed on every
//! tick. The ledger spaces retries out exponentially and gives up after a
//! fixed number of consecutive failures.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Retry spacing for failed originates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failures before giving up; 0 never gives up
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Wait before the next attempt after `failures` consecutive failures
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(20);
        self.base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// What to do with a lead after a failed originate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureVerdict {
    /// Put it back for dialing once `after` has passed
    Retry { failures: u32, after: Duration },
    /// Stop dialing it
    GiveUp { failures: u32 },
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    failures: u32,
    retry_at: Instant,
}

#[derive(Debug)]
pub struct FailureLedger {
    policy: RetryPolicy,
    entries: Mutex<HashMap<String, Entry>>,
}

impl FailureLedger {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_failure(&self, lead_id: &str) -> FailureVerdict {
        let mut entries = self.entries.lock();
        let failures = entries.get(lead_id).map_or(0, |e| e.failures) + 1;

        if self.policy.max_attempts > 0 && failures >= self.policy.max_attempts {
            entries.remove(lead_id);
            return FailureVerdict::GiveUp { failures };
        }

        let after = self.policy.backoff(failures);
        entries.insert(
            lead_id.to_string(),
            Entry {
                failures,
                retry_at: Instant::now() + after,
            },
        );
        FailureVerdict::Retry { failures, after }
    }

    /// Forget the lead's failures after a successful originate
    pub fn clear(&self, lead_id: &str) {
        self.entries.lock().remove(lead_id);
    }

    /// Leads that must not be dialed yet
    pub fn cooling_down(&self) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.retry_at > now)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn failures(&self, lead_id: &str) -> u32 {
        self.entries.lock().get(lead_id).map_or(0, |e| e.failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(250),
        }
    }

    #[test]
    fn test_backoff_doubles_up_to_the_cap() {
        let policy = policy();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(250));
        assert_eq!(policy.backoff(40), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lead_cools_down_then_becomes_dialable() {
        let ledger = FailureLedger::new(policy());
        assert_eq!(
            ledger.record_failure("l-1"),
            FailureVerdict::Retry {
                failures: 1,
                after: Duration::from_millis(100)
            }
        );
        assert_eq!(ledger.cooling_down(), vec!["l-1".to_string()]);

        tokio::time::advance(Duration::from_millis(101)).await;
        assert!(ledger.cooling_down().is_empty());
        assert_eq!(ledger.failures("l-1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let ledger = FailureLedger::new(policy());
        ledger.record_failure("l-1");
        ledger.record_failure("l-1");
        assert_eq!(ledger.record_failure("l-1"), FailureVerdict::GiveUp { failures: 3 });
        assert_eq!(ledger.failures("l-1"), 0);
        assert!(ledger.cooling_down().is_empty());
        assert!(ledger.entries.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_clears_history() {
        let ledger = FailureLedger::new(policy());
        ledger.record_failure("l-1");
        ledger.clear("l-1");
        assert!(ledger.cooling_down().is_empty());
        assert_eq!(ledger.failures("l-1"), 0);
    }

    #[test]
    fn test_zero_attempts_never_gives_up() {
        let ledger = FailureLedger::new(RetryPolicy {
            max_attempts: 0,
            ..policy()
        });
        for _ in 0..10 {
            assert!(matches!(ledger.record_failure("l-1"), FailureVerdict::Retry { .. }));
        }
    }
}
