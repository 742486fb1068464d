//! GeoPresence Core - real-time presence synchronization client
//!
//! Keeps an identity-unique, order-stable view of the latest position of
//! every sender connected to a location hub:
//! 1. **Connection Manager**: one hub connection with an explicit lifecycle
//!    state machine and pluggable reconnect policy
//! 2. **Merge Store**: upsert-by-identity into immutable snapshots
//! 3. **Reactive Bridge**: a single `(state, snapshot, send)` subscription

pub mod bridge;
pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod protocol;
pub mod render;
pub mod snapshot;
pub mod state;
pub mod store;

// Re-export key types for convenience
pub use bridge::{PresenceBridge, PresenceView};
pub use config::{ConfigError, PresenceConfig};
pub use connection::{ConnectionEvent, ConnectionEvents, ConnectionManager, HubOptions, InboundFrame};
pub use directory::{DirectoryError, User, UserDirectory};
pub use error::PresenceError;
pub use protocol::{HubMessage, ProtocolError, RECEIVE_LAT_LON, SEND_LAT_LON};
pub use render::{drive_renderer, MapRenderer, TextRenderer};
pub use snapshot::{PositionError, PositionUpdate, PresenceSnapshot};
pub use state::{ConnectionState, StateTransition};
pub use store::{IngestStats, MergeStore};
