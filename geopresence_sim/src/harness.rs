//! Wiring shared by scenarios and integration tests.

use crate::context::SimContext;
use crate::hub::SimHub;
use crate::policy::ScriptedReconnectPolicy;

use geopresence_core::{
    ConnectionEvent, ConnectionEvents, ConnectionManager, ConnectionState, HubOptions, InboundFrame,
    PresenceBridge,
};
use std::sync::Arc;
use std::time::Duration;

/// Endpoint handed to every simulated activation.
pub const SIM_ENDPOINT: &str = "https://sim.geopresence.local/locationHub";

/// Scheduler turns given to background tasks by `settle`.
const SETTLE_YIELDS: usize = 1024;

pub type SimManager = ConnectionManager<SimContext, SimHub>;
pub type SimBridge = PresenceBridge<SimContext, SimHub>;

/// One simulated world: clock, hub and reconnect policy.
pub struct Harness {
    pub context: Arc<SimContext>,
    pub hub: Arc<SimHub>,
    pub policy: Arc<ScriptedReconnectPolicy>,
}

impl Harness {
    pub fn new(seed: u64, delays: Vec<Duration>) -> Self {
        Self {
            context: SimContext::shared(seed),
            hub: SimHub::shared(),
            policy: Arc::new(ScriptedReconnectPolicy::new(delays)),
        }
    }

    /// Reconnects once, immediately.
    pub fn with_single_retry(seed: u64) -> Self {
        Self::new(seed, vec![Duration::ZERO])
    }

    pub fn manager(&self) -> (SimManager, ConnectionEvents) {
        self.manager_with(HubOptions::without_timers())
    }

    /// Manager with explicit keep-alive and timeout settings.
    pub fn manager_with(&self, options: HubOptions) -> (SimManager, ConnectionEvents) {
        ConnectionManager::new(
            Arc::clone(&self.context),
            Arc::clone(&self.hub),
            self.policy.clone(),
            options,
        )
    }

    pub fn bridge(&self) -> SimBridge {
        PresenceBridge::new(
            Arc::clone(&self.context),
            Arc::clone(&self.hub),
            self.policy.clone(),
            HubOptions::without_timers(),
        )
    }
}

/// Lets spawned tasks run until they block.
///
/// Must be awaited on a current-thread runtime.
pub async fn settle() {
    for _ in 0..SETTLE_YIELDS {
        tokio::task::yield_now().await;
    }
}

/// Everything the manager has emitted so far.
#[derive(Debug, Default)]
pub struct Drained {
    pub states: Vec<ConnectionState>,
    pub frames: Vec<InboundFrame>,
}

pub fn drain(events: &mut ConnectionEvents) -> Drained {
    let mut drained = Drained::default();
    while let Ok(event) = events.try_recv() {
        match event {
            ConnectionEvent::StateChanged(transition) => drained.states.push(transition.to),
            ConnectionEvent::Frame(frame) => drained.frames.push(frame),
        }
    }
    drained
}
