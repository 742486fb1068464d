//! Reactive bridge: one subscribable `(state, snapshot, send)` unit.
//!
//! Wires a `ConnectionManager` to a `MergeStore`. The manager activates
//! first; inbound positions reach the store only while the connection is
//! Connected. Teardown runs in reverse: the store stops listening, then the
//! manager is deactivated.

use crate::connection::{ConnectionEvent, ConnectionEvents, ConnectionManager, HubOptions};
use crate::error::PresenceError;
use crate::protocol::{RECEIVE_LAT_LON, SEND_LAT_LON};
use crate::snapshot::{PositionUpdate, PresenceSnapshot};
use crate::state::ConnectionState;
use crate::store::{IngestStats, MergeStore};

use chrono::{DateTime, Utc};
use geopresence_env::{HubConnector, PresenceContext, ReconnectPolicy, SessionId};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, Instrument};

/// Latest value handed to consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceView {
    pub state: ConnectionState,
    pub snapshot: PresenceSnapshot,
}

impl Default for PresenceView {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            snapshot: PresenceSnapshot::empty(),
        }
    }
}

struct Live<Ctx: PresenceContext> {
    /// Bumped on every fresh session; event loops of older sessions stop.
    generation: u64,
    store: MergeStore<Ctx>,
    view: watch::Sender<PresenceView>,
}

struct Session<Ctx, C>
where
    Ctx: PresenceContext,
    C: HubConnector,
{
    manager: Arc<ConnectionManager<Ctx, C>>,
}

/// Presence client as seen by a UI.
pub struct PresenceBridge<Ctx, C>
where
    Ctx: PresenceContext,
    C: HubConnector,
{
    context: Arc<Ctx>,
    connector: Arc<C>,
    policy: Arc<dyn ReconnectPolicy>,
    options: HubOptions,
    live: Arc<Mutex<Live<Ctx>>>,
    session: Mutex<Option<Session<Ctx, C>>>,
}

impl<Ctx, C> PresenceBridge<Ctx, C>
where
    Ctx: PresenceContext,
    C: HubConnector,
{
    pub fn new(
        context: Arc<Ctx>,
        connector: Arc<C>,
        policy: Arc<dyn ReconnectPolicy>,
        options: HubOptions,
    ) -> Self {
        let (view, _) = watch::channel(PresenceView::default());
        let live = Live {
            generation: 0,
            store: MergeStore::new(Arc::clone(&context)),
            view,
        };

        Self {
            context,
            connector,
            policy,
            options,
            live: Arc::new(Mutex::new(live)),
            session: Mutex::new(None),
        }
    }

    /// Starts (or resumes) the presence session.
    ///
    /// After the connection gave up, activating again reconnects and keeps
    /// the session's snapshot. After `deactivate()`, a fresh session starts
    /// from an empty snapshot.
    pub fn activate(&self, endpoint: &str) -> Result<(), PresenceError> {
        let mut session = self.session.lock();
        if let Some(current) = session.as_ref() {
            current.manager.subscribe(RECEIVE_LAT_LON);
            return current.manager.activate(endpoint);
        }

        let (manager, events) = ConnectionManager::new(
            Arc::clone(&self.context),
            Arc::clone(&self.connector),
            Arc::clone(&self.policy),
            self.options.clone(),
        );
        manager.subscribe(RECEIVE_LAT_LON);
        manager.activate(endpoint)?;

        let generation = {
            let mut live = self.live.lock();
            live.generation += 1;
            live.generation
        };
        let span = tracing::info_span!("bridge", generation);
        self.context.spawn(
            "presence-bridge",
            run_session(events, Arc::clone(&self.live), generation).instrument(span),
        );

        *session = Some(Session {
            manager: Arc::new(manager),
        });
        Ok(())
    }

    /// Ends the session.
    ///
    /// Publishes one final view (Disconnected, empty snapshot); nothing is
    /// published afterwards, whatever the old connection still delivers.
    pub fn deactivate(&self) {
        let Some(session) = self.session.lock().take() else {
            return;
        };

        {
            let mut live = self.live.lock();
            live.generation += 1;
            live.store.reset();
            live.view.send_replace(PresenceView {
                state: ConnectionState::Disconnected,
                snapshot: PresenceSnapshot::empty(),
            });
        }

        session.manager.unsubscribe(RECEIVE_LAT_LON);
        session.manager.deactivate();
        info!("presence session ended");
    }

    /// Publishes the current `(state, snapshot)` and every later change.
    pub fn subscribe(&self) -> watch::Receiver<PresenceView> {
        self.live.lock().view.subscribe()
    }

    pub fn view(&self) -> PresenceView {
        self.live.lock().view.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.live.lock().view.borrow().state
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        self.live.lock().store.snapshot()
    }

    pub fn stats(&self) -> IngestStats {
        self.live.lock().store.stats()
    }

    /// Session id of the underlying hub connection, if one was started.
    pub fn session_id(&self) -> Option<SessionId> {
        self.session.lock().as_ref().and_then(|s| s.manager.session())
    }

    /// Sends our own position to the hub.
    ///
    /// Rejected before any transport call when the connection is not
    /// Connected (`Unavailable`, checked first) or the position is invalid.
    /// The hub echoes the position back through `ReceiveLatLon`, which is
    /// how it reaches the snapshot.
    pub async fn send(&self, identity: &str, latitude: f64, longitude: f64) -> Result<(), PresenceError> {
        let manager = self.session.lock().as_ref().map(|s| Arc::clone(&s.manager));
        let Some(manager) = manager else {
            return Err(PresenceError::Unavailable { state: self.state() });
        };
        let state = manager.state();
        if state != ConnectionState::Connected {
            return Err(PresenceError::Unavailable { state });
        }

        let observed_at = DateTime::<Utc>::from(self.context.system_time());
        let update = PositionUpdate::new(identity, latitude, longitude, observed_at)?;
        manager.send(SEND_LAT_LON, update.to_arguments()).await
    }
}

impl<Ctx, C> Drop for PresenceBridge<Ctx, C>
where
    Ctx: PresenceContext,
    C: HubConnector,
{
    fn drop(&mut self) {
        self.deactivate();
    }
}

/// Applies connection events to the store and the view.
async fn run_session<Ctx: PresenceContext>(
    mut events: ConnectionEvents,
    live: Arc<Mutex<Live<Ctx>>>,
    generation: u64,
) {
    while let Some(event) = events.recv().await {
        let mut guard = live.lock();
        let Live {
            generation: current,
            store,
            view,
        } = &mut *guard;
        if *current != generation {
            debug!("session superseded");
            return;
        }

        match event {
            ConnectionEvent::StateChanged(transition) => {
                view.send_modify(|view| view.state = transition.to);
            }
            ConnectionEvent::Frame(frame) if frame.target == RECEIVE_LAT_LON => {
                if let Some(snapshot) = store.ingest(&frame.arguments) {
                    view.send_modify(|view| view.snapshot = snapshot);
                }
            }
            ConnectionEvent::Frame(frame) => {
                debug!(event = %frame.target, "ignoring hub event");
            }
        }
    }
    debug!("connection events closed");
}
