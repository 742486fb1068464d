//! Scripted in-process hub with fault injection.
//!
//! `SimHub` speaks the same record protocol as a real hub: it answers the
//! handshake, completes invocations and pushes `ReceiveLatLon` events. The
//! test side drives faults (refused connects, drops, hub Close) through the
//! same handle.

use async_trait::async_trait;
use geopresence_core::protocol::{self, HubMessage, RECEIVE_LAT_LON, RECORD_SEPARATOR, SEND_LAT_LON};
use geopresence_env::{EnvError, HubConnector, HubSocket};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// What a socket's reader sees next.
#[derive(Debug)]
enum SocketEvent {
    Frame(String),
    Fail(String),
}

struct SocketEntry {
    tx: mpsc::UnboundedSender<SocketEvent>,
    handshaken: bool,
}

#[derive(Default)]
struct HubState {
    next_socket: u64,
    sockets: BTreeMap<u64, SocketEntry>,
    refuse_next: u32,
    rejection: Option<String>,
    echo: bool,
    silent_handshake: bool,
    connect_attempts: u64,
    invocations: Vec<(String, Vec<Value>)>,
    pings: u64,
}

impl HubState {
    fn broadcast(&mut self, frame: &str) -> usize {
        let mut delivered = 0;
        for entry in self.sockets.values().filter(|entry| entry.handshaken) {
            if entry.tx.send(SocketEvent::Frame(frame.to_string())).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    fn reply(&self, socket: u64, frame: String) {
        if let Some(entry) = self.sockets.get(&socket) {
            let _ = entry.tx.send(SocketEvent::Frame(frame));
        }
    }
}

/// Handle to a simulated hub. Clones share the same hub.
#[derive(Clone)]
pub struct SimHub {
    state: Arc<Mutex<HubState>>,
    paused: Arc<watch::Sender<bool>>,
}

impl SimHub {
    /// Creates a hub that accepts connections and completes invocations.
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            state: Arc::new(Mutex::new(HubState::default())),
            paused: Arc::new(paused),
        }
    }

    /// Creates an Arc-wrapped hub for handing to a connection manager.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Refuses the next `count` connection attempts.
    pub fn refuse_connections(&self, count: u32) {
        self.state.lock().refuse_next = count;
    }

    /// Holds every connection attempt until `resume_connections`.
    pub fn pause_connections(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume_connections(&self) {
        self.paused.send_replace(false);
    }

    /// Answers every later invocation with this error (`None` accepts again).
    pub fn reject_invocations(&self, error: Option<&str>) {
        self.state.lock().rejection = error.map(str::to_string);
    }

    /// Accepts sockets but never answers their handshake.
    pub fn withhold_handshake(&self, silent: bool) {
        self.state.lock().silent_handshake = silent;
    }

    /// Rebroadcasts every accepted `SendLatLon` as `ReceiveLatLon`.
    pub fn set_echo(&self, echo: bool) {
        self.state.lock().echo = echo;
    }

    /// Fails every open socket as if the network went away.
    pub fn drop_connections(&self, reason: &str) -> usize {
        let mut state = self.state.lock();
        let sockets = std::mem::take(&mut state.sockets);
        for entry in sockets.values() {
            let _ = entry.tx.send(SocketEvent::Fail(reason.to_string()));
        }
        debug!(count = sockets.len(), %reason, "hub dropped connections");
        sockets.len()
    }

    /// Sends a Close record to every connected client.
    pub fn close_from_hub(&self, error: Option<&str>, allow_reconnect: bool) -> usize {
        let frame = protocol::encode(&HubMessage::Close {
            error: error.map(str::to_string),
            allow_reconnect,
        });
        self.state.lock().broadcast(&frame)
    }

    /// Pushes one `ReceiveLatLon` event to every connected client.
    pub fn deliver_position(&self, latitude: f64, longitude: f64, identity: &str) -> usize {
        let frame = protocol::encode(&HubMessage::Invocation {
            invocation_id: None,
            target: RECEIVE_LAT_LON.to_string(),
            arguments: vec![json!(latitude), json!(longitude), json!(identity)],
        });
        self.state.lock().broadcast(&frame)
    }

    /// Pushes an arbitrary frame to every connected client.
    pub fn deliver_raw(&self, frame: &str) -> usize {
        self.state.lock().broadcast(frame)
    }

    pub fn connect_attempts(&self) -> u64 {
        self.state.lock().connect_attempts
    }

    /// Sockets the hub still considers open.
    pub fn open_sockets(&self) -> usize {
        self.state.lock().sockets.len()
    }

    /// Invocations received so far, as `(target, arguments)`.
    pub fn invocations(&self) -> Vec<(String, Vec<Value>)> {
        self.state.lock().invocations.clone()
    }

    pub fn invocation_count(&self) -> usize {
        self.state.lock().invocations.len()
    }

    pub fn pings(&self) -> u64 {
        self.state.lock().pings
    }

    async fn wait_until_open(&self) {
        let mut gate = self.paused.subscribe();
        loop {
            let paused = *gate.borrow_and_update();
            if !paused || gate.changed().await.is_err() {
                return;
            }
        }
    }

    fn unregister(&self, socket: u64) {
        self.state.lock().sockets.remove(&socket);
    }

    fn receive(&self, socket: u64, frame: &str) -> Result<(), EnvError> {
        let mut state = self.state.lock();
        let handshaken = match state.sockets.get(&socket) {
            Some(entry) => entry.handshaken,
            None => return Err(EnvError::Closed),
        };

        if !handshaken {
            if state.silent_handshake {
                debug!(socket, "withholding handshake response");
                return Ok(());
            }
            let record = frame.trim_end_matches(RECORD_SEPARATOR);
            let request: Value = serde_json::from_str(record)
                .map_err(|e| EnvError::network(format!("bad handshake: {e}")))?;
            if request.get("protocol").and_then(Value::as_str) != Some(protocol::PROTOCOL_NAME) {
                state.reply(socket, format!("{}{RECORD_SEPARATOR}", json!({ "error": "unsupported protocol" })));
                return Ok(());
            }
            if let Some(entry) = state.sockets.get_mut(&socket) {
                entry.handshaken = true;
            }
            state.reply(socket, format!("{{}}{RECORD_SEPARATOR}"));
            return Ok(());
        }

        for message in protocol::decode(frame) {
            match message {
                Ok(HubMessage::Invocation {
                    invocation_id,
                    target,
                    arguments,
                }) => {
                    let error = state.rejection.clone();
                    if error.is_none() {
                        state.invocations.push((target.clone(), arguments.clone()));
                    }
                    if let Some(invocation_id) = invocation_id {
                        let completion = protocol::encode(&HubMessage::Completion {
                            invocation_id,
                            result: None,
                            error: error.clone(),
                        });
                        state.reply(socket, completion);
                    }
                    if error.is_none() && state.echo && target == SEND_LAT_LON {
                        let echo = protocol::encode(&HubMessage::Invocation {
                            invocation_id: None,
                            target: RECEIVE_LAT_LON.to_string(),
                            arguments,
                        });
                        state.broadcast(&echo);
                    }
                }
                Ok(HubMessage::Ping) => state.pings += 1,
                Ok(other) => debug!(kind = other.type_code(), "hub ignoring client record"),
                Err(e) => return Err(EnvError::network(format!("client sent bad record: {e}"))),
            }
        }
        Ok(())
    }
}

impl Default for SimHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HubConnector for SimHub {
    type Socket = SimSocket;

    async fn connect(&self, endpoint: &str) -> Result<SimSocket, EnvError> {
        self.wait_until_open().await;

        let mut state = self.state.lock();
        state.connect_attempts += 1;
        if state.refuse_next > 0 {
            state.refuse_next -= 1;
            return Err(EnvError::connection(format!("hub refused connection to {endpoint}")));
        }

        state.next_socket += 1;
        let id = state.next_socket;
        let (tx, rx) = mpsc::unbounded_channel();
        state.sockets.insert(id, SocketEntry { tx, handshaken: false });
        debug!(socket = id, "hub accepted connection");

        Ok(SimSocket {
            id,
            hub: self.clone(),
            inbound: rx,
            closed: false,
        })
    }
}

/// Client end of a simulated hub connection.
pub struct SimSocket {
    id: u64,
    hub: SimHub,
    inbound: mpsc::UnboundedReceiver<SocketEvent>,
    closed: bool,
}

#[async_trait]
impl HubSocket for SimSocket {
    async fn send(&mut self, frame: String) -> Result<(), EnvError> {
        if self.closed {
            return Err(EnvError::Closed);
        }
        self.hub.receive(self.id, &frame)
    }

    async fn recv(&mut self) -> Option<Result<String, EnvError>> {
        if self.closed {
            return None;
        }
        match self.inbound.recv().await {
            Some(SocketEvent::Frame(frame)) => Some(Ok(frame)),
            Some(SocketEvent::Fail(reason)) => {
                self.closed = true;
                Some(Err(EnvError::network(reason)))
            }
            None => None,
        }
    }

    async fn close(&mut self) {
        self.closed = true;
        self.hub.unregister(self.id);
    }
}

impl Drop for SimSocket {
    fn drop(&mut self) {
        self.hub.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handshake_and_completion() {
        let hub = SimHub::new();
        let mut socket = hub.connect("http://sim/hub").await.unwrap();
        assert_eq!(hub.open_sockets(), 1);

        socket.send(protocol::handshake_request()).await.unwrap();
        let response = socket.recv().await.unwrap().unwrap();
        assert_eq!(protocol::parse_handshake_response(&response), Ok(""));

        let invocation = protocol::encode(&HubMessage::Invocation {
            invocation_id: Some("1".to_string()),
            target: SEND_LAT_LON.to_string(),
            arguments: vec![json!(1.0), json!(2.0), json!("alice")],
        });
        socket.send(invocation).await.unwrap();

        let completion = socket.recv().await.unwrap().unwrap();
        assert_eq!(
            protocol::decode(&completion),
            vec![Ok(HubMessage::Completion {
                invocation_id: "1".to_string(),
                result: None,
                error: None
            })]
        );
        assert_eq!(hub.invocation_count(), 1);

        socket.close().await;
        assert_eq!(hub.open_sockets(), 0);
    }

    #[tokio::test]
    async fn test_refuse_and_drop() {
        let hub = SimHub::new();
        hub.refuse_connections(1);

        assert!(hub.connect("http://sim/hub").await.is_err());
        let mut socket = hub.connect("http://sim/hub").await.unwrap();
        assert_eq!(hub.connect_attempts(), 2);

        assert_eq!(hub.drop_connections("cable cut"), 1);
        assert!(matches!(socket.recv().await, Some(Err(EnvError::NetworkError(_)))));
        assert!(socket.recv().await.is_none());
        assert_eq!(hub.open_sockets(), 0);
    }

    #[tokio::test]
    async fn test_positions_only_reach_handshaken_sockets() {
        let hub = SimHub::new();
        let mut ready = hub.connect("http://sim/hub").await.unwrap();
        let _pending = hub.connect("http://sim/hub").await.unwrap();

        ready.send(protocol::handshake_request()).await.unwrap();
        let _ = ready.recv().await;

        assert_eq!(hub.deliver_position(40.0, -74.0, "alice"), 1);
        let frame = ready.recv().await.unwrap().unwrap();
        assert!(frame.contains(RECEIVE_LAT_LON));
        assert!(frame.contains("alice"));
    }
}
