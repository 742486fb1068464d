//! Core environment context trait for the presence client.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime};

/// The central interface for environment interaction.
///
/// This trait abstracts the "real world" so that the connection manager and
/// merge store can run in both production (tokio) and simulation (virtual
/// clock) environments.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time` and the system clock
/// - **Simulation**: `SimContext` - seeded virtual clock
#[async_trait]
pub trait PresenceContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Used for keep-alive bookkeeping and reconnect elapsed time.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time.
    ///
    /// Stamps `observed_at` on ingested position updates, since the hub
    /// provides no authoritative timestamp.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances the virtual clock and yields
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    fn seed(&self) -> u64;
}
