//! Deterministic reconnect policy.

use geopresence_env::{ReconnectPolicy, RetryContext};
use parking_lot::Mutex;
use std::time::Duration;

/// Fixed delay list that records every question it is asked.
pub struct ScriptedReconnectPolicy {
    delays: Vec<Duration>,
    calls: Mutex<Vec<RetryContext>>,
}

impl ScriptedReconnectPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self {
            delays,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A policy that gives up immediately.
    pub fn never() -> Self {
        Self::new(Vec::new())
    }

    /// Every retry context seen so far.
    pub fn calls(&self) -> Vec<RetryContext> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

impl ReconnectPolicy for ScriptedReconnectPolicy {
    fn next_retry_delay(&self, retry: &RetryContext) -> Option<Duration> {
        self.calls.lock().push(retry.clone());
        self.delays.get(retry.previous_retry_count as usize).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry(count: u32) -> RetryContext {
        RetryContext {
            previous_retry_count: count,
            elapsed: Duration::ZERO,
            reason: "test".to_string(),
        }
    }

    #[test]
    fn test_scripted_policy() {
        let policy = ScriptedReconnectPolicy::new(vec![Duration::ZERO, Duration::from_secs(1)]);

        assert_eq!(policy.next_retry_delay(&retry(0)), Some(Duration::ZERO));
        assert_eq!(policy.next_retry_delay(&retry(1)), Some(Duration::from_secs(1)));
        assert_eq!(policy.next_retry_delay(&retry(2)), None);
        assert_eq!(policy.call_count(), 3);
        assert_eq!(policy.calls()[2].previous_retry_count, 2);

        assert_eq!(ScriptedReconnectPolicy::never().next_retry_delay(&retry(0)), None);
    }
}
