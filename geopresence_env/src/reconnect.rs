//! Reconnection policies.
//!
//! The connection driver never computes backoff itself: after a drop it asks
//! the policy for the next delay until the policy gives up.

use rand::Rng;
use std::time::Duration;

/// Information handed to a policy before each reconnect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryContext {
    /// Number of attempts already made in this reconnect episode
    pub previous_retry_count: u32,

    /// Time spent reconnecting so far
    pub elapsed: Duration,

    /// Why the last connection (or attempt) ended
    pub reason: String,
}

/// Decides whether and when to retry after the transport drops.
pub trait ReconnectPolicy: Send + Sync + 'static {
    /// Returns the delay before the next attempt, or `None` to give up.
    fn next_retry_delay(&self, retry: &RetryContext) -> Option<Duration>;
}

/// Fixed delay list, one entry per attempt, then give up.
///
/// The default list (0s, 2s, 10s, 30s) matches the automatic-reconnect
/// behaviour hub clients ship with.
#[derive(Debug, Clone)]
pub struct DefaultReconnectPolicy {
    delays: Vec<Duration>,
}

impl DefaultReconnectPolicy {
    /// Creates a policy with explicit delays.
    pub fn with_delays(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// Returns the configured delays.
    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

impl Default for DefaultReconnectPolicy {
    fn default() -> Self {
        Self::with_delays(vec![
            Duration::ZERO,
            Duration::from_secs(2),
            Duration::from_secs(10),
            Duration::from_secs(30),
        ])
    }
}

impl ReconnectPolicy for DefaultReconnectPolicy {
    fn next_retry_delay(&self, retry: &RetryContext) -> Option<Duration> {
        self.delays.get(retry.previous_retry_count as usize).copied()
    }
}

/// Exponential backoff with optional caps and proportional jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay before the first attempt
    pub initial_delay: Duration,

    /// Growth factor per attempt
    pub multiplier: f64,

    /// Upper bound for a single delay (before jitter)
    pub max_delay: Duration,

    /// Give up after this many attempts
    pub max_retries: Option<u32>,

    /// Give up once this much time has been spent reconnecting
    pub max_elapsed: Option<Duration>,

    /// Random extra delay as a fraction of the base delay (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_retries: Some(10),
            max_elapsed: None,
            jitter: 0.2,
        }
    }
}

impl ExponentialBackoff {
    /// Sets the retry cap.
    pub fn with_max_retries(mut self, retries: Option<u32>) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the elapsed-time cap.
    pub fn with_max_elapsed(mut self, elapsed: Option<Duration>) -> Self {
        self.max_elapsed = elapsed;
        self
    }

    /// Sets the jitter fraction.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Base delay for an attempt, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn next_retry_delay(&self, retry: &RetryContext) -> Option<Duration> {
        if let Some(max) = self.max_retries {
            if retry.previous_retry_count >= max {
                return None;
            }
        }
        if let Some(max) = self.max_elapsed {
            if retry.elapsed >= max {
                return None;
            }
        }

        let base = self.base_delay(retry.previous_retry_count);
        if self.jitter <= 0.0 {
            return Some(base);
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
        Some(base + base.mul_f64(extra))
    }
}

/// Never reconnects.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReconnect;

impl ReconnectPolicy for NoReconnect {
    fn next_retry_delay(&self, _retry: &RetryContext) -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry(count: u32, elapsed: Duration) -> RetryContext {
        RetryContext {
            previous_retry_count: count,
            elapsed,
            reason: "test".to_string(),
        }
    }

    #[test]
    fn test_default_policy_delays_then_gives_up() {
        let policy = DefaultReconnectPolicy::default();

        assert_eq!(policy.next_retry_delay(&retry(0, Duration::ZERO)), Some(Duration::ZERO));
        assert_eq!(policy.next_retry_delay(&retry(1, Duration::ZERO)), Some(Duration::from_secs(2)));
        assert_eq!(policy.next_retry_delay(&retry(2, Duration::ZERO)), Some(Duration::from_secs(10)));
        assert_eq!(policy.next_retry_delay(&retry(3, Duration::ZERO)), Some(Duration::from_secs(30)));
        assert_eq!(policy.next_retry_delay(&retry(4, Duration::ZERO)), None);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = ExponentialBackoff {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            max_retries: None,
            max_elapsed: None,
            jitter: 0.0,
        };

        assert_eq!(policy.next_retry_delay(&retry(0, Duration::ZERO)), Some(Duration::from_secs(1)));
        assert_eq!(policy.next_retry_delay(&retry(1, Duration::ZERO)), Some(Duration::from_secs(2)));
        assert_eq!(policy.next_retry_delay(&retry(2, Duration::ZERO)), Some(Duration::from_secs(4)));
        assert_eq!(policy.next_retry_delay(&retry(3, Duration::ZERO)), Some(Duration::from_secs(5)));
        assert_eq!(policy.next_retry_delay(&retry(40, Duration::ZERO)), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_backoff_limits() {
        let policy = ExponentialBackoff::default()
            .with_max_retries(Some(3))
            .with_max_elapsed(Some(Duration::from_secs(60)));

        assert!(policy.next_retry_delay(&retry(2, Duration::from_secs(1))).is_some());
        assert!(policy.next_retry_delay(&retry(3, Duration::from_secs(1))).is_none());
        assert!(policy.next_retry_delay(&retry(0, Duration::from_secs(60))).is_none());
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let policy = ExponentialBackoff::default().with_jitter(0.5);
        let base = policy.base_delay(2);

        for _ in 0..100 {
            let delay = policy.next_retry_delay(&retry(2, Duration::ZERO)).unwrap();
            assert!(delay >= base);
            assert!(delay <= base + base.mul_f64(0.5));
        }
    }

    #[test]
    fn test_no_reconnect() {
        assert_eq!(NoReconnect.next_retry_delay(&retry(0, Duration::ZERO)), None);
    }
}
