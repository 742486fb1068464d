//! Scenario runner - executes fault-injection scenarios against the client.

use crate::harness::{drain, settle, Harness, SIM_ENDPOINT};
use crate::scenarios::ScenarioId;

use geopresence_core::protocol::{self, HubMessage, RECEIVE_LAT_LON};
use geopresence_core::{ConnectionState, IngestStats, PresenceError, PresenceView};
use geopresence_env::PresenceContext;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use ConnectionState::{Connected, Connecting, Disconnected, Reconnecting};

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    /// State transitions observed
    pub transitions: usize,

    /// Connection attempts seen by the hub
    pub connect_attempts: u64,

    /// Invocations accepted by the hub
    pub invocations: usize,

    /// Frames merged into the snapshot
    pub merges: u64,

    /// Malformed frames dropped at ingest
    pub dropped_frames: u64,

    /// Sends refused without a transport call
    pub refused_sends: usize,

    /// Virtual time at the end of the run
    pub virtual_time_ms: u64,
}

impl ScenarioMetrics {
    fn collect(harness: &Harness, transitions: usize, stats: IngestStats) -> Self {
        Self {
            transitions,
            connect_attempts: harness.hub.connect_attempts(),
            invocations: harness.hub.invocation_count(),
            merges: stats.accepted,
            dropped_frames: stats.dropped,
            refused_sends: 0,
            virtual_time_ms: harness.context.now().as_millis() as u64,
        }
    }
}

type Outcome = Result<ScenarioMetrics, String>;

fn check(condition: bool, message: impl FnOnce() -> String) -> Result<(), String> {
    if condition {
        Ok(())
    } else {
        Err(message())
    }
}

fn expect_states(actual: &[ConnectionState], expected: &[ConnectionState]) -> Result<(), String> {
    check(actual == expected, || {
        format!("expected transitions {:?}, observed {:?}", expected, actual)
    })
}

fn expect_unavailable(result: Result<(), PresenceError>, state: ConnectionState) -> Result<(), String> {
    match result {
        Err(PresenceError::Unavailable { state: reported }) if reported == state => Ok(()),
        other => Err(format!("expected Unavailable while {state}, got {other:?}")),
    }
}

fn invocation(target: &str, arguments: Vec<Value>) -> String {
    protocol::encode(&HubMessage::Invocation {
        invocation_id: None,
        target: target.to_string(),
        arguments,
    })
}

/// Runs scenarios for one seed.
pub struct ScenarioRunner {
    seed: u64,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Runs a scenario on a fresh current-thread runtime.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let outcome = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
            Ok(runtime) => runtime.block_on(self.run_async(scenario)),
            Err(e) => Err(format!("failed to build runtime: {e}")),
        };

        match outcome {
            Ok(metrics) => {
                debug!(?metrics, "scenario metrics");
                ScenarioResult {
                    scenario,
                    seed: self.seed,
                    passed: true,
                    failure_reason: None,
                    metrics,
                }
            }
            Err(reason) => {
                warn!(scenario = scenario.name(), %reason, "scenario failed");
                ScenarioResult {
                    scenario,
                    seed: self.seed,
                    passed: false,
                    failure_reason: Some(reason),
                    metrics: ScenarioMetrics::default(),
                }
            }
        }
    }

    async fn run_async(&self, scenario: ScenarioId) -> Outcome {
        match scenario {
            ScenarioId::StateFidelity => self.run_state_fidelity().await,
            ScenarioId::Flapping => self.run_flapping().await,
            ScenarioId::GiveUp => self.run_give_up().await,
            ScenarioId::SendGating => self.run_send_gating().await,
            ScenarioId::TeardownRace => self.run_teardown_race().await,
            ScenarioId::MergeBurst => self.run_merge_burst().await,
            ScenarioId::ActivationCycles => self.run_activation_cycles().await,
            ScenarioId::MalformedFrames => self.run_malformed_frames().await,
        }
    }

    /// connect-success, drop, reconnect-success, manual deactivate.
    async fn run_state_fidelity(&self) -> Outcome {
        let harness = Harness::with_single_retry(self.seed);
        let (manager, mut events) = harness.manager();

        manager.activate(SIM_ENDPOINT).map_err(|e| e.to_string())?;
        settle().await;
        check(manager.state() == Connected, || format!("not connected: {}", manager.state()))?;

        harness.hub.drop_connections("transport drop");
        settle().await;
        manager.deactivate();
        settle().await;

        let drained = drain(&mut events);
        expect_states(
            &drained.states,
            &[Connecting, Connected, Reconnecting, Connected, Disconnected],
        )?;
        check(harness.hub.open_sockets() == 0, || "socket left open".to_string())?;

        Ok(ScenarioMetrics::collect(&harness, drained.states.len(), IngestStats::default()))
    }

    async fn run_flapping(&self) -> Outcome {
        const FLAPS: usize = 10;

        let harness = Harness::with_single_retry(self.seed);
        let (manager, mut events) = harness.manager();
        manager.activate(SIM_ENDPOINT).map_err(|e| e.to_string())?;
        settle().await;

        for flap in 0..FLAPS {
            let dropped = harness.hub.drop_connections("flap");
            check(dropped == 1, || format!("flap {flap}: expected one open socket, found {dropped}"))?;
            settle().await;
        }
        manager.deactivate();
        settle().await;

        let mut expected = vec![Connecting, Connected];
        for _ in 0..FLAPS {
            expected.extend([Reconnecting, Connected]);
        }
        expected.push(Disconnected);

        let drained = drain(&mut events);
        expect_states(&drained.states, &expected)?;
        check(harness.hub.connect_attempts() == (FLAPS + 1) as u64, || {
            format!("expected {} connects, hub saw {}", FLAPS + 1, harness.hub.connect_attempts())
        })?;

        Ok(ScenarioMetrics::collect(&harness, drained.states.len(), IngestStats::default()))
    }

    async fn run_give_up(&self) -> Outcome {
        let delays = vec![Duration::ZERO, Duration::from_secs(2), Duration::from_secs(10)];
        let harness = Harness::new(self.seed, delays.clone());
        let (manager, mut events) = harness.manager();

        manager.activate(SIM_ENDPOINT).map_err(|e| e.to_string())?;
        settle().await;

        harness.hub.refuse_connections(u32::MAX);
        harness.hub.drop_connections("hub restarting");
        settle().await;

        let drained = drain(&mut events);
        expect_states(&drained.states, &[Connecting, Connected, Reconnecting, Disconnected])?;
        check(harness.policy.call_count() == delays.len() + 1, || {
            format!("policy consulted {} times", harness.policy.call_count())
        })?;
        check(harness.context.sleeps() == delays, || {
            format!("unexpected backoff sleeps {:?}", harness.context.sleeps())
        })?;
        check(harness.hub.connect_attempts() == 1 + delays.len() as u64, || {
            format!("hub saw {} connects", harness.hub.connect_attempts())
        })?;

        // Manual re-activation after giving up starts a new cycle
        harness.hub.refuse_connections(0);
        manager.activate(SIM_ENDPOINT).map_err(|e| e.to_string())?;
        settle().await;
        manager.deactivate();
        settle().await;

        let resumed = drain(&mut events);
        expect_states(&resumed.states, &[Connecting, Connected, Disconnected])?;

        Ok(ScenarioMetrics::collect(
            &harness,
            drained.states.len() + resumed.states.len(),
            IngestStats::default(),
        ))
    }

    async fn run_send_gating(&self) -> Outcome {
        let harness = Harness::with_single_retry(self.seed);
        harness.hub.set_echo(true);
        let bridge = harness.bridge();
        let mut refused = 0;

        expect_unavailable(bridge.send("alice", 40.7128, -74.0060).await, ConnectionState::Idle)?;
        refused += 1;

        bridge.activate(SIM_ENDPOINT).map_err(|e| e.to_string())?;
        settle().await;
        check(bridge.state() == Connected, || format!("not connected: {}", bridge.state()))?;

        bridge
            .send("alice", 40.7128, -74.0060)
            .await
            .map_err(|e| format!("send while connected failed: {e}"))?;
        settle().await;
        check(bridge.snapshot().get("alice").is_some(), || "echo not merged".to_string())?;

        match bridge.send("   ", 40.0, -74.0).await {
            Err(PresenceError::InvalidPosition(_)) => refused += 1,
            other => return Err(format!("blank identity accepted: {other:?}")),
        }

        harness.hub.pause_connections();
        harness.hub.drop_connections("flaky uplink");
        settle().await;
        check(bridge.state() == Reconnecting, || format!("expected reconnecting, got {}", bridge.state()))?;
        expect_unavailable(bridge.send("alice", 40.71, -74.0).await, Reconnecting)?;
        refused += 1;

        harness.hub.resume_connections();
        settle().await;
        check(bridge.state() == Connected, || format!("did not reconnect: {}", bridge.state()))?;

        harness.hub.reject_invocations(Some("quota exceeded"));
        match bridge.send("alice", 40.71, -74.0).await {
            Err(PresenceError::Rejected(reason)) if reason == "quota exceeded" => {}
            other => return Err(format!("expected rejection, got {other:?}")),
        }
        harness.hub.reject_invocations(None);

        bridge.deactivate();
        expect_unavailable(bridge.send("alice", 40.71, -74.0).await, Disconnected)?;
        refused += 1;

        check(harness.hub.invocation_count() == 1, || {
            format!("hub saw {} invocations, expected 1", harness.hub.invocation_count())
        })?;

        let mut metrics = ScenarioMetrics::collect(&harness, 0, bridge.stats());
        metrics.refused_sends = refused;
        Ok(metrics)
    }

    async fn run_teardown_race(&self) -> Outcome {
        let harness = Harness::with_single_retry(self.seed);
        let bridge = harness.bridge();

        bridge.activate(SIM_ENDPOINT).map_err(|e| e.to_string())?;
        settle().await;
        harness.hub.deliver_position(40.7128, -74.0060, "alice");
        settle().await;
        check(bridge.snapshot().len() == 1, || "position not merged".to_string())?;

        let mut views = bridge.subscribe();
        bridge.deactivate();
        let final_view = views.borrow_and_update().clone();
        check(final_view == PresenceView { state: Disconnected, ..PresenceView::default() }, || {
            format!("unexpected final view {final_view:?}")
        })?;

        // The driver has not run since deactivate: its socket is still open
        let in_flight = harness.hub.deliver_position(51.5074, -0.1278, "bob");
        check(in_flight == 1, || format!("race not exercised ({in_flight} sockets)"))?;
        settle().await;

        check(!views.has_changed().unwrap_or(true), || "view changed after deactivate".to_string())?;
        check(bridge.snapshot().is_empty(), || "late frame reached the snapshot".to_string())?;
        check(bridge.stats() == IngestStats::default(), || "late frame was ingested".to_string())?;
        check(harness.hub.open_sockets() == 0, || "socket left open".to_string())?;

        Ok(ScenarioMetrics::collect(&harness, 0, bridge.stats()))
    }

    async fn run_merge_burst(&self) -> Outcome {
        const IDENTITIES: usize = 16;
        const UPDATES: usize = 500;
        // Coordinates cross the wire as JSON text
        const COORD_EPSILON: f64 = 1e-9;

        let harness = Harness::with_single_retry(self.seed);
        let bridge = harness.bridge();
        bridge.activate(SIM_ENDPOINT).map_err(|e| e.to_string())?;
        settle().await;

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let identities: Vec<String> = (0..IDENTITIES).map(|i| format!("sender-{i:02}")).collect();
        let mut expected: Vec<(String, f64, f64)> = Vec::new();

        for _ in 0..UPDATES {
            let identity = &identities[rng.gen_range(0..IDENTITIES)];
            let latitude: f64 = rng.gen_range(-90.0..=90.0);
            let longitude: f64 = rng.gen_range(-180.0..=180.0);
            harness.hub.deliver_position(latitude, longitude, identity);

            match expected.iter_mut().find(|(id, _, _)| id == identity) {
                Some(entry) => *entry = (identity.clone(), latitude, longitude),
                None => expected.push((identity.clone(), latitude, longitude)),
            }
        }
        settle().await;

        let snapshot = bridge.snapshot();
        check(snapshot.len() == expected.len(), || {
            format!("snapshot has {} entries, expected {}", snapshot.len(), expected.len())
        })?;
        for (entry, (identity, latitude, longitude)) in snapshot.iter().zip(&expected) {
            check(
                entry.identity() == identity
                    && (entry.latitude() - latitude).abs() < COORD_EPSILON
                    && (entry.longitude() - longitude).abs() < COORD_EPSILON,
                || format!("entry {entry:?} does not match ({identity}, {latitude}, {longitude})"),
            )?;
        }

        let stats = bridge.stats();
        check(stats.accepted == UPDATES as u64, || format!("accepted {} of {UPDATES}", stats.accepted))?;
        check(stats.replaced == (UPDATES - expected.len()) as u64, || {
            format!("{} in-place replacements", stats.replaced)
        })?;
        check(bridge.view().snapshot.version() == UPDATES as u64, || "view lags the store".to_string())?;

        bridge.deactivate();
        Ok(ScenarioMetrics::collect(&harness, 0, stats))
    }

    async fn run_activation_cycles(&self) -> Outcome {
        const CYCLES: usize = 50;

        let harness = Harness::with_single_retry(self.seed);
        let (manager, mut events) = harness.manager();

        // Deactivate while the connect is still pending
        harness.hub.pause_connections();
        manager.activate(SIM_ENDPOINT).map_err(|e| e.to_string())?;
        settle().await;
        manager.deactivate();
        harness.hub.resume_connections();
        settle().await;
        expect_states(&drain(&mut events).states, &[Connecting, Disconnected])?;
        check(harness.hub.connect_attempts() == 0, || "cancelled connect reached the hub".to_string())?;

        let mut sessions = HashSet::new();
        let mut transitions = 2;
        for cycle in 0..CYCLES {
            manager.activate(SIM_ENDPOINT).map_err(|e| e.to_string())?;
            // Second activate is a no-op
            manager.activate(SIM_ENDPOINT).map_err(|e| e.to_string())?;
            settle().await;
            if let Some(session) = manager.session() {
                sessions.insert(session);
            }

            manager.deactivate();
            settle().await;
            check(harness.hub.open_sockets() == 0, || format!("cycle {cycle}: socket left open"))?;

            let states = drain(&mut events).states;
            expect_states(&states, &[Connecting, Connected, Disconnected])?;
            transitions += states.len();
        }

        check(sessions.len() == CYCLES, || format!("{} distinct sessions", sessions.len()))?;
        check(harness.hub.connect_attempts() == CYCLES as u64, || {
            format!("hub saw {} connects", harness.hub.connect_attempts())
        })?;

        Ok(ScenarioMetrics::collect(&harness, transitions, IngestStats::default()))
    }

    async fn run_malformed_frames(&self) -> Outcome {
        let harness = Harness::with_single_retry(self.seed);
        let bridge = harness.bridge();
        bridge.activate(SIM_ENDPOINT).map_err(|e| e.to_string())?;
        settle().await;

        let sep = protocol::RECORD_SEPARATOR;
        harness.hub.deliver_raw(&format!("not json{sep}"));
        harness.hub.deliver_raw(&format!("{}{sep}", json!({ "type": 99 })));
        harness.hub.deliver_raw(&invocation(RECEIVE_LAT_LON, vec![json!(1.0), json!(2.0)]));
        harness.hub.deliver_raw(&invocation(RECEIVE_LAT_LON, vec![json!("north"), json!(2.0), json!("a")]));
        harness.hub.deliver_raw(&invocation(RECEIVE_LAT_LON, vec![json!(1.0), json!(2.0), json!(7)]));
        harness.hub.deliver_raw(&invocation(RECEIVE_LAT_LON, vec![json!(1.0), json!(2.0), json!(null)]));
        harness.hub.deliver_raw(&invocation("ReceiveWeather", vec![json!("sunny")]));
        harness.hub.deliver_position(40.7128, -74.0060, "alice");
        // Well-formed but off-range: kept as published
        harness.hub.deliver_position(95.0, 200.0, "carol");
        harness.hub.deliver_position(10.0, 20.0, "  ");
        settle().await;

        let stats = bridge.stats();
        check(stats.dropped == 4, || format!("dropped {} frames, expected 4", stats.dropped))?;
        check(stats.accepted == 3, || format!("accepted {} frames, expected 3", stats.accepted))?;
        check(bridge.snapshot().identities() == vec!["alice", "carol", "  "], || {
            format!("unexpected snapshot {:?}", bridge.snapshot().identities())
        })?;
        check(bridge.state() == Connected, || format!("connection disturbed: {}", bridge.state()))?;

        bridge.deactivate();
        Ok(ScenarioMetrics::collect(&harness, 0, stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_scenarios_pass() {
        let runner = ScenarioRunner::new(42);
        for scenario in ScenarioId::all() {
            let result = runner.run(scenario);
            assert!(result.passed, "{}: {:?}", scenario, result.failure_reason);
        }
    }

    #[test]
    fn test_merge_burst_is_seed_deterministic() {
        let a = ScenarioRunner::new(7).run(ScenarioId::MergeBurst);
        let b = ScenarioRunner::new(7).run(ScenarioId::MergeBurst);

        assert!(a.passed && b.passed);
        assert_eq!(a.metrics.merges, b.metrics.merges);
        assert_eq!(a.metrics.connect_attempts, 1);
    }
}
