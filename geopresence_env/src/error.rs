//! Error types for the GeoPresence environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Socket could not be opened (refused, DNS, TLS, upgrade rejected)
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The negotiate round-trip failed or returned an error
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Send/receive failed on an open socket
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The socket was already closed
    #[error("Connection closed")]
    Closed,

    /// Endpoint address is not a usable URL
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    /// Creates a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkError(msg.into())
    }

    /// Creates a negotiation error.
    pub fn negotiation(msg: impl Into<String>) -> Self {
        Self::NegotiationFailed(msg.into())
    }
}
