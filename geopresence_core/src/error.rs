//! Error types for the presence client.

use crate::config::ConfigError;
use crate::protocol::ProtocolError;
use crate::snapshot::PositionError;
use crate::state::ConnectionState;
use geopresence_env::EnvError;
use thiserror::Error;

/// Errors surfaced to callers of the presence client.
///
/// Connection failures are never returned from here; they show up as state
/// transitions. What callers see are per-call failures.
#[derive(Debug, Error)]
pub enum PresenceError {
    /// Send attempted while not connected (no transport call was made)
    #[error("Hub unavailable: connection is {state}")]
    Unavailable { state: ConnectionState },

    /// Transport failed while the call was in flight
    #[error("Transport error: {0}")]
    Transport(String),

    /// Hub answered the invocation with an error
    #[error("Hub rejected invocation: {0}")]
    Rejected(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Missing or invalid endpoint configuration
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Invalid position: {0}")]
    InvalidPosition(#[from] PositionError),
}

impl From<EnvError> for PresenceError {
    fn from(error: EnvError) -> Self {
        PresenceError::Transport(error.to_string())
    }
}

impl PresenceError {
    /// True for the "not connected" condition.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, PresenceError::Unavailable { .. })
    }
}
