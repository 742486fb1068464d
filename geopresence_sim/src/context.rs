//! Simulation context implementing PresenceContext for deterministic testing.

use async_trait::async_trait;
use geopresence_env::PresenceContext;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::Instrument;

/// Simulation context backed by a virtual clock.
///
/// - `sleep` advances virtual time by the requested amount, records the
///   request, and yields once so other tasks can run
/// - `system_time` is a fixed epoch plus virtual time
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Current virtual time (nanoseconds since simulation start)
    virtual_time_ns: Arc<Mutex<u64>>,

    /// Every sleep requested so far, in order
    sleeps: Arc<Mutex<Vec<Duration>>>,

    /// Epoch offset (virtual time 0 maps to this wall-clock time)
    epoch: SystemTime,
}

impl SimContext {
    /// Creates a new SimContext with the given seed.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            virtual_time_ns: Arc::new(Mutex::new(0)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
            epoch: UNIX_EPOCH + Duration::from_secs(1_704_067_200), // 2024-01-01 00:00:00 UTC
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Advances virtual time by the given duration.
    pub fn advance_time(&self, duration: Duration) {
        *self.virtual_time_ns.lock() += duration.as_nanos() as u64;
    }

    /// Returns the current virtual time in nanoseconds.
    pub fn time_ns(&self) -> u64 {
        *self.virtual_time_ns.lock()
    }

    /// Sleeps requested so far.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            virtual_time_ns: Arc::clone(&self.virtual_time_ns),
            sleeps: Arc::clone(&self.sleeps),
            epoch: self.epoch,
        }
    }
}

#[async_trait]
impl PresenceContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.time_ns())
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance_time(duration);
        self.sleeps.lock().push(duration);
        tokio::task::yield_now().await;
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let span = tracing::debug_span!("sim_task", name = %name);
        tokio::spawn(future.instrument(span));
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_context_time() {
        let ctx = SimContext::new(42);
        assert_eq!(ctx.now(), Duration::ZERO);

        ctx.advance_time(Duration::from_secs(1));
        assert_eq!(ctx.now(), Duration::from_secs(1));

        ctx.advance_time(Duration::from_millis(500));
        assert_eq!(ctx.now(), Duration::from_millis(1500));
        assert_eq!(
            ctx.system_time(),
            UNIX_EPOCH + Duration::from_secs(1_704_067_200) + Duration::from_millis(1500)
        );
    }

    #[tokio::test]
    async fn test_sleep_advances_and_records() {
        let ctx = SimContext::new(7);

        ctx.sleep(Duration::from_secs(2)).await;
        ctx.sleep(Duration::ZERO).await;
        ctx.sleep(Duration::from_secs(10)).await;

        assert_eq!(ctx.now(), Duration::from_secs(12));
        assert_eq!(
            ctx.sleeps(),
            vec![Duration::from_secs(2), Duration::ZERO, Duration::from_secs(10)]
        );
        assert_eq!(ctx.seed(), 7);
    }

    #[test]
    fn test_sim_context_clone_shares_time() {
        let ctx1 = SimContext::new(42);
        let ctx2 = ctx1.clone();

        ctx1.advance_time(Duration::from_secs(5));

        assert_eq!(ctx1.now(), ctx2.now());
    }
}
