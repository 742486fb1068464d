//! GeoPresence Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" seams that let the presence client run
//! against a real hub (tokio + WebSockets) or inside the deterministic
//! simulation harness (`geopresence_sim`).
//!
//! # Intercepted I/O
//!
//! - Time (`now()`, `system_time()`, `sleep()`)
//! - Hub transport (`HubConnector::connect()`, `HubSocket::send()/recv()`)
//! - Reconnection timing (`ReconnectPolicy::next_retry_delay()`)
//!
//! # Example
//!
//! ```ignore
//! use geopresence_env::{HubConnector, HubSocket, PresenceContext};
//!
//! async fn pump<Ctx: PresenceContext, C: HubConnector>(ctx: &Ctx, connector: &C) {
//!     let mut socket = connector.connect("https://hub.example.com/location").await?;
//!     loop {
//!         tokio::select! {
//!             frame = socket.recv() => handle_frame(frame),
//!             _ = ctx.sleep(Duration::from_secs(15)) => keep_alive(),
//!         }
//!     }
//! }
//! ```

mod context;
mod error;
mod reconnect;
mod tokio_impl;
mod transport;
mod types;
mod ws_impl;

pub use context::PresenceContext;
pub use error::EnvError;
pub use reconnect::{
    DefaultReconnectPolicy, ExponentialBackoff, NoReconnect, ReconnectPolicy, RetryContext,
};
pub use tokio_impl::TokioContext;
pub use transport::{HubConnector, HubSocket};
pub use types::SessionId;
pub use ws_impl::{NegotiateOptions, WsConnector, WsSocket};
