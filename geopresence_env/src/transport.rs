//! Hub transport abstraction.

use async_trait::async_trait;
use crate::error::EnvError;

/// Opens sockets to a push-messaging hub.
///
/// # Implementations
///
/// - **Production**: `WsConnector` - negotiate + WebSocket upgrade
/// - **Simulation**: `SimHub` - scripted in-memory hub
///
/// Every call opens a *fresh* socket; reconnection is a new `connect()`.
#[async_trait]
pub trait HubConnector: Send + Sync + 'static {
    /// Socket type produced by this connector.
    type Socket: HubSocket;

    /// Opens a socket to the hub at `endpoint`.
    ///
    /// # Returns
    /// * `Ok(socket)` - Transport-level connection is open (no handshake yet)
    /// * `Err(EnvError)` - Connection could not be established
    async fn connect(&self, endpoint: &str) -> Result<Self::Socket, EnvError>;
}

/// One open text-frame socket to the hub.
///
/// A socket is owned by exactly one connection driver. Frames are opaque
/// text here; record framing and the hub protocol live in the core crate.
///
/// ```text
/// Driver                    Socket                      Hub
///   |-- send(frame) ---------->|------------------------->|
///   |                          |<-------------------------|
///   |<-- recv() -> frame ------|                          |
/// ```
#[async_trait]
pub trait HubSocket: Send + 'static {
    /// Sends one text frame.
    async fn send(&mut self, frame: String) -> Result<(), EnvError>;

    /// Receives the next text frame.
    ///
    /// # Returns
    /// * `Some(Ok(frame))` - A frame arrived
    /// * `Some(Err(_))` - The transport failed; the socket is unusable
    /// * `None` - The transport closed (drop)
    async fn recv(&mut self) -> Option<Result<String, EnvError>>;

    /// Closes the socket. Idempotent.
    async fn close(&mut self);
}
