//! Connection Manager - owns one hub connection and its lifecycle.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────┐  commands   ┌────────────────────────────┐
//! │      ConnectionManager        │────────────►│  Driver task (one/cycle)   │
//! │  activate / deactivate / send │             │  connect + handshake       │
//! │  Shared { state, cycle, subs }│◄────────────│  pump: recv / invoke / ping│
//! └───────────────┬───────────────┘ transitions │  reconnect via policy      │
//!                 │                             └────────────────────────────┘
//!                 ▼
//!        ConnectionEvents (StateChanged | Frame), in order, never coalesced
//! ```
//!
//! Every activation starts a new *cycle*. The driver publishes through a
//! cycle-stamped handle; once `deactivate()` bumps the cycle, anything the old
//! driver still produces (late frames, late connects, completions) is ignored.

use crate::config::{parse_endpoint, HUB_SCHEMES};
use crate::error::PresenceError;
use crate::protocol::{self, HubMessage};
use crate::state::{ConnectionState, StateTransition};

use geopresence_env::{
    EnvError, HubConnector, HubSocket, PresenceContext, ReconnectPolicy, RetryContext, SessionId,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn, Instrument};

/// Name used in configuration errors raised by `activate`.
const HUB_ENDPOINT: &str = "hub endpoint";

/// Keep-alive and timeout settings for one hub connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubOptions {
    /// Send a Ping when nothing was sent for this long
    pub keep_alive_interval: Option<Duration>,

    /// Treat the connection as dropped when nothing arrives for this long
    pub server_timeout: Option<Duration>,

    /// Give up on the handshake response after this long
    pub handshake_timeout: Option<Duration>,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            keep_alive_interval: Some(Duration::from_secs(15)),
            server_timeout: Some(Duration::from_secs(30)),
            handshake_timeout: Some(Duration::from_secs(15)),
        }
    }
}

impl HubOptions {
    /// No keep-alive, no timeouts (simulation).
    pub fn without_timers() -> Self {
        Self {
            keep_alive_interval: None,
            server_timeout: None,
            handshake_timeout: None,
        }
    }
}

/// One hub invocation addressed to this client.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub target: String,
    pub arguments: Vec<Value>,
}

/// Outbound notifications, delivered in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged(StateTransition),
    Frame(InboundFrame),
}

/// Receiving end of a manager's event channel.
pub type ConnectionEvents = mpsc::UnboundedReceiver<ConnectionEvent>;

type Reply = oneshot::Sender<Result<(), PresenceError>>;

struct Command {
    target: String,
    arguments: Vec<Value>,
    reply: Reply,
}

struct Shared {
    state: ConnectionState,
    cycle: u64,
    session: Option<SessionId>,
    subscriptions: HashSet<String>,
    commands: Option<mpsc::UnboundedSender<Command>>,
    cancel: Option<oneshot::Sender<()>>,
}

fn apply_transition(
    shared: &mut Shared,
    events: &mpsc::UnboundedSender<ConnectionEvent>,
    to: ConnectionState,
) -> bool {
    let from = shared.state;
    if !from.can_transition_to(to) {
        if from != to {
            warn!(%from, %to, "ignoring illegal transition");
        }
        return false;
    }
    shared.state = to;
    debug!(%from, %to, "connection state");
    let _ = events.send(ConnectionEvent::StateChanged(StateTransition { from, to }));
    true
}

/// Cycle-scoped publishing handle held by a driver task.
struct CycleHandle {
    cycle: u64,
    shared: Arc<Mutex<Shared>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl CycleHandle {
    fn transition(&self, to: ConnectionState) -> bool {
        let mut shared = self.shared.lock();
        if shared.cycle != self.cycle {
            return false;
        }
        apply_transition(&mut shared, &self.events, to)
    }

    fn deliver(&self, frame: InboundFrame) {
        let shared = self.shared.lock();
        if shared.cycle != self.cycle || shared.state != ConnectionState::Connected {
            debug!(event = %frame.target, "dropping frame from a finished cycle");
            return;
        }
        if !shared.subscriptions.contains(&frame.target) {
            debug!(event = %frame.target, "no subscriber for hub event");
            return;
        }
        let _ = self.events.send(ConnectionEvent::Frame(frame));
    }

    /// Ends the cycle from the driver side.
    fn finish(&self) {
        let mut shared = self.shared.lock();
        if shared.cycle != self.cycle {
            return;
        }
        apply_transition(&mut shared, &self.events, ConnectionState::Disconnected);
        shared.commands = None;
        shared.cancel = None;
    }
}

/// Owns one hub connection.
///
/// Generic over the context and connector, allowing the same manager to run
/// against a real hub or the simulated one.
pub struct ConnectionManager<Ctx, C>
where
    Ctx: PresenceContext,
    C: HubConnector,
{
    context: Arc<Ctx>,
    connector: Arc<C>,
    policy: Arc<dyn ReconnectPolicy>,
    options: HubOptions,
    shared: Arc<Mutex<Shared>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl<Ctx, C> ConnectionManager<Ctx, C>
where
    Ctx: PresenceContext,
    C: HubConnector,
{
    /// Creates an idle manager and the receiving end of its event channel.
    pub fn new(
        context: Arc<Ctx>,
        connector: Arc<C>,
        policy: Arc<dyn ReconnectPolicy>,
        options: HubOptions,
    ) -> (Self, ConnectionEvents) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let shared = Shared {
            state: ConnectionState::Idle,
            cycle: 0,
            session: None,
            subscriptions: HashSet::new(),
            commands: None,
            cancel: None,
        };

        let manager = Self {
            context,
            connector,
            policy,
            options,
            shared: Arc::new(Mutex::new(shared)),
            events,
        };
        (manager, events_rx)
    }

    /// Begins connection establishment.
    ///
    /// Idempotent while a cycle is running. An unusable endpoint is a
    /// configuration error and the manager stays where it was.
    pub fn activate(&self, endpoint: &str) -> Result<(), PresenceError> {
        let endpoint = parse_endpoint(HUB_ENDPOINT, endpoint, HUB_SCHEMES)?;

        let mut shared = self.shared.lock();
        if shared.state.is_active() {
            debug!(state = %shared.state, "activate ignored: already active");
            return Ok(());
        }

        shared.cycle += 1;
        // Seeded contexts get reproducible session ids
        let session = match self.context.seed() {
            0 => SessionId::new(),
            seed => SessionId::from_seed(seed.wrapping_add(shared.cycle)),
        };
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        shared.session = Some(session);
        shared.commands = Some(command_tx);
        shared.cancel = Some(cancel_tx);
        apply_transition(&mut shared, &self.events, ConnectionState::Connecting);

        let handle = CycleHandle {
            cycle: shared.cycle,
            shared: Arc::clone(&self.shared),
            events: self.events.clone(),
        };
        drop(shared);

        info!(%session, host = ?endpoint.host_str(), "activating hub connection");
        let driver = Driver {
            context: Arc::clone(&self.context),
            connector: Arc::clone(&self.connector),
            policy: Arc::clone(&self.policy),
            options: self.options.clone(),
            endpoint: endpoint.to_string(),
            handle,
            commands: command_rx,
            cancel: cancel_rx,
        };
        let span = tracing::info_span!("hub", %session);
        self.context.spawn("hub-connection", driver.run().instrument(span));
        Ok(())
    }

    /// Tears the current cycle down.
    ///
    /// Unregisters all subscriptions, moves to Disconnected, and cancels the
    /// driver, which closes and releases the socket. In-flight reconnects,
    /// pending sends and late frames of the old cycle become no-ops.
    pub fn deactivate(&self) {
        let mut shared = self.shared.lock();
        shared.subscriptions.clear();
        if !shared.state.is_active() {
            return;
        }

        shared.cycle += 1;
        apply_transition(&mut shared, &self.events, ConnectionState::Disconnected);
        shared.commands = None;
        if let Some(cancel) = shared.cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(session) = shared.session {
            info!(%session, "hub connection deactivated");
        }
    }

    /// Invokes a hub method and waits for its completion.
    ///
    /// Fails with `Unavailable` without touching the transport unless the
    /// state is Connected.
    pub async fn send(&self, target: &str, arguments: Vec<Value>) -> Result<(), PresenceError> {
        let (reply, response) = oneshot::channel();
        {
            let shared = self.shared.lock();
            let state = shared.state;
            if state != ConnectionState::Connected {
                return Err(PresenceError::Unavailable { state });
            }
            let commands = shared
                .commands
                .as_ref()
                .ok_or(PresenceError::Unavailable { state })?;
            commands
                .send(Command {
                    target: target.to_string(),
                    arguments,
                    reply,
                })
                .map_err(|_| PresenceError::Unavailable { state })?;
        }

        match response.await {
            Ok(result) => result,
            Err(_) => Err(PresenceError::Unavailable { state: self.state() }),
        }
    }

    /// Registers interest in a hub event.
    pub fn subscribe(&self, target: &str) {
        self.shared.lock().subscriptions.insert(target.to_string());
    }

    /// Removes interest in a hub event.
    pub fn unsubscribe(&self, target: &str) {
        self.shared.lock().subscriptions.remove(target);
    }

    /// Currently subscribed hub events.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut targets: Vec<String> = self.shared.lock().subscriptions.iter().cloned().collect();
        targets.sort();
        targets
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Session id of the current (or last) activation cycle.
    pub fn session(&self) -> Option<SessionId> {
        self.shared.lock().session
    }
}

impl<Ctx, C> Drop for ConnectionManager<Ctx, C>
where
    Ctx: PresenceContext,
    C: HubConnector,
{
    fn drop(&mut self) {
        self.deactivate();
    }
}

// =============================================================================
// DRIVER
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    KeepAlive,
    ServerTimeout,
}

/// Why a connected period ended.
#[derive(Debug)]
enum Exit {
    Cancelled,
    Dropped(String),
    Closed(Option<String>),
}

/// Next timer to fire, given when we last sent and last heard from the hub.
fn next_timer(
    last_sent: Duration,
    last_received: Duration,
    now: Duration,
    options: &HubOptions,
) -> Option<(Duration, Timer)> {
    let keep_alive = options
        .keep_alive_interval
        .map(|interval| ((last_sent + interval).saturating_sub(now), Timer::KeepAlive));
    let timeout = options
        .server_timeout
        .map(|limit| ((last_received + limit).saturating_sub(now), Timer::ServerTimeout));

    match (keep_alive, timeout) {
        (Some(a), Some(b)) => Some(if b.0 <= a.0 { b } else { a }),
        (a, b) => a.or(b),
    }
}

/// An open, handshaken socket plus its in-flight invocations.
struct Link<S: HubSocket> {
    socket: S,
    pending: HashMap<String, Reply>,
    next_invocation_id: u64,
    last_sent: Duration,
    last_received: Duration,
}

impl<S: HubSocket> Link<S> {
    fn new(socket: S, now: Duration) -> Self {
        Self {
            socket,
            pending: HashMap::new(),
            next_invocation_id: 0,
            last_sent: now,
            last_received: now,
        }
    }

    async fn invoke(&mut self, command: Command, now: Duration) -> Result<(), String> {
        self.next_invocation_id += 1;
        let id = self.next_invocation_id.to_string();
        let frame = protocol::encode(&HubMessage::Invocation {
            invocation_id: Some(id.clone()),
            target: command.target,
            arguments: command.arguments,
        });

        match self.socket.send(frame).await {
            Ok(()) => {
                self.last_sent = now;
                self.pending.insert(id, command.reply);
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                let _ = command.reply.send(Err(PresenceError::Transport(reason.clone())));
                Err(reason)
            }
        }
    }

    async fn ping(&mut self, now: Duration) -> Result<(), String> {
        self.socket
            .send(protocol::encode(&HubMessage::Ping))
            .await
            .map_err(|e| e.to_string())?;
        self.last_sent = now;
        Ok(())
    }

    fn dispatch(&mut self, frame: &str, handle: &CycleHandle) -> Option<Exit> {
        for message in protocol::decode(frame) {
            match message {
                Ok(HubMessage::Invocation {
                    target, arguments, ..
                }) => handle.deliver(InboundFrame { target, arguments }),
                Ok(HubMessage::Completion {
                    invocation_id,
                    error,
                    ..
                }) => match self.pending.remove(&invocation_id) {
                    Some(reply) => {
                        let _ = reply.send(match error {
                            Some(error) => Err(PresenceError::Rejected(error)),
                            None => Ok(()),
                        });
                    }
                    None => debug!(%invocation_id, "completion for unknown invocation"),
                },
                Ok(HubMessage::Ping) => {}
                Ok(HubMessage::StreamItem { invocation_id, .. }) => {
                    debug!(%invocation_id, "ignoring stream item");
                }
                Ok(HubMessage::Close {
                    error,
                    allow_reconnect,
                }) => {
                    return Some(if allow_reconnect {
                        Exit::Dropped(error.unwrap_or_else(|| "hub requested reconnect".to_string()))
                    } else {
                        Exit::Closed(error)
                    });
                }
                Err(e) => warn!(error = %e, "dropping malformed hub record"),
            }
        }
        None
    }

    fn fail_pending(&mut self, exit: &Exit) {
        for (_, reply) in self.pending.drain() {
            let error = match exit {
                Exit::Cancelled => PresenceError::Unavailable {
                    state: ConnectionState::Disconnected,
                },
                Exit::Dropped(reason) => PresenceError::Transport(format!("connection lost: {reason}")),
                Exit::Closed(reason) => PresenceError::Transport(format!(
                    "hub closed the connection: {}",
                    reason.as_deref().unwrap_or("no reason given")
                )),
            };
            let _ = reply.send(Err(error));
        }
    }
}

/// Connects and performs the protocol handshake.
async fn open<C, Ctx>(
    connector: &C,
    endpoint: &str,
    context: &Ctx,
    options: &HubOptions,
) -> Result<(C::Socket, String), PresenceError>
where
    C: HubConnector,
    Ctx: PresenceContext,
{
    let mut socket = connector.connect(endpoint).await?;
    match handshake(&mut socket, context, options).await {
        Ok(rest) => Ok((socket, rest)),
        Err(e) => {
            socket.close().await;
            Err(e)
        }
    }
}

async fn handshake<S, Ctx>(socket: &mut S, context: &Ctx, options: &HubOptions) -> Result<String, PresenceError>
where
    S: HubSocket,
    Ctx: PresenceContext,
{
    socket.send(protocol::handshake_request()).await?;

    let response = match options.handshake_timeout {
        Some(limit) => tokio::select! {
            response = socket.recv() => response,
            _ = context.sleep(limit) => {
                return Err(EnvError::Timeout(limit.as_millis() as u64).into());
            }
        },
        None => socket.recv().await,
    };

    match response {
        Some(Ok(frame)) => Ok(protocol::parse_handshake_response(&frame)?.to_string()),
        Some(Err(e)) => Err(e.into()),
        None => Err(PresenceError::Transport("closed during handshake".to_string())),
    }
}

/// Background task running one activation cycle.
struct Driver<Ctx, C>
where
    Ctx: PresenceContext,
    C: HubConnector,
{
    context: Arc<Ctx>,
    connector: Arc<C>,
    policy: Arc<dyn ReconnectPolicy>,
    options: HubOptions,
    endpoint: String,
    handle: CycleHandle,
    commands: mpsc::UnboundedReceiver<Command>,
    cancel: oneshot::Receiver<()>,
}

impl<Ctx, C> Driver<Ctx, C>
where
    Ctx: PresenceContext,
    C: HubConnector,
{
    async fn run(mut self) {
        let opened = tokio::select! {
            biased;
            _ = &mut self.cancel => {
                debug!("cancelled while connecting");
                return;
            }
            result = open(&*self.connector, &self.endpoint, &*self.context, &self.options) => result,
        };

        let (socket, mut leftover) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                warn!(error = %e, "hub connection failed");
                self.handle.finish();
                return;
            }
        };

        let mut link = Link::new(socket, self.context.now());
        if !self.handle.transition(ConnectionState::Connected) {
            link.socket.close().await;
            return;
        }
        info!("hub connected");

        loop {
            let exit = match link.dispatch(&leftover, &self.handle) {
                Some(exit) => exit,
                None => self.pump(&mut link).await,
            };
            link.fail_pending(&exit);
            link.socket.close().await;

            let reason = match exit {
                Exit::Cancelled => {
                    debug!("driver cancelled");
                    return;
                }
                Exit::Closed(error) => {
                    info!(?error, "hub closed the connection");
                    self.handle.finish();
                    return;
                }
                Exit::Dropped(reason) => reason,
            };

            warn!(%reason, "hub connection lost");
            if !self.handle.transition(ConnectionState::Reconnecting) {
                return;
            }
            let Some((socket, rest)) = self.reconnect(reason).await else {
                self.handle.finish();
                return;
            };

            link = Link::new(socket, self.context.now());
            if !self.handle.transition(ConnectionState::Connected) {
                link.socket.close().await;
                return;
            }
            info!("hub reconnected");
            leftover = rest;
        }
    }

    async fn pump(&mut self, link: &mut Link<C::Socket>) -> Exit {
        loop {
            let timer = next_timer(link.last_sent, link.last_received, self.context.now(), &self.options);
            let context = &self.context;
            let wait = async move {
                match timer {
                    Some((delay, _)) => context.sleep(delay).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                _ = &mut self.cancel => return Exit::Cancelled,
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Err(reason) = link.invoke(command, self.context.now()).await {
                            return Exit::Dropped(reason);
                        }
                    }
                    None => return Exit::Cancelled,
                },
                incoming = link.socket.recv() => match incoming {
                    Some(Ok(frame)) => {
                        link.last_received = self.context.now();
                        if let Some(exit) = link.dispatch(&frame, &self.handle) {
                            return exit;
                        }
                    }
                    Some(Err(e)) => return Exit::Dropped(e.to_string()),
                    None => return Exit::Dropped("transport closed".to_string()),
                },
                _ = wait => match timer {
                    Some((_, Timer::KeepAlive)) => {
                        if let Err(reason) = link.ping(self.context.now()).await {
                            return Exit::Dropped(reason);
                        }
                    }
                    Some((_, Timer::ServerTimeout)) => {
                        return Exit::Dropped("server timeout elapsed without a message".to_string());
                    }
                    None => {}
                },
            }
        }
    }

    async fn reconnect(&mut self, reason: String) -> Option<(C::Socket, String)> {
        let started = self.context.now();
        let mut retries = 0u32;
        let mut reason = reason;

        loop {
            self.reject_queued();
            let retry = RetryContext {
                previous_retry_count: retries,
                elapsed: self.context.now().saturating_sub(started),
                reason: reason.clone(),
            };
            let Some(delay) = self.policy.next_retry_delay(&retry) else {
                warn!(retries, %reason, "giving up on hub connection");
                return None;
            };
            info!(attempt = retries + 1, ?delay, "reconnecting");

            tokio::select! {
                biased;
                _ = &mut self.cancel => return None,
                _ = self.context.sleep(delay) => {}
            }
            let attempt = tokio::select! {
                biased;
                _ = &mut self.cancel => return None,
                result = open(&*self.connector, &self.endpoint, &*self.context, &self.options) => result,
            };

            match attempt {
                Ok(opened) => return Some(opened),
                Err(e) => {
                    warn!(error = %e, "reconnect attempt failed");
                    retries += 1;
                    reason = e.to_string();
                }
            }
        }
    }

    /// Fails sends that were queued just before the drop.
    fn reject_queued(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            let _ = command.reply.send(Err(PresenceError::Unavailable {
                state: ConnectionState::Reconnecting,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_next_timer_prefers_earliest() {
        let options = HubOptions::default();

        // Just sent and received: keep-alive (15s) comes before timeout (30s)
        assert_eq!(
            next_timer(secs(0), secs(0), secs(0), &options),
            Some((secs(15), Timer::KeepAlive))
        );

        // Sent recently, heard nothing for 25s: timeout in 5s wins
        assert_eq!(
            next_timer(secs(20), secs(0), secs(25), &options),
            Some((secs(5), Timer::ServerTimeout))
        );

        // Overdue timers fire immediately
        assert_eq!(
            next_timer(secs(0), secs(40), secs(40), &options),
            Some((Duration::ZERO, Timer::KeepAlive))
        );
    }

    #[test]
    fn test_next_timer_disabled() {
        assert_eq!(next_timer(secs(0), secs(0), secs(100), &HubOptions::without_timers()), None);

        let only_timeout = HubOptions {
            keep_alive_interval: None,
            ..HubOptions::default()
        };
        assert_eq!(
            next_timer(secs(0), secs(10), secs(10), &only_timeout),
            Some((secs(30), Timer::ServerTimeout))
        );
    }
}
