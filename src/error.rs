//! Error types for coderelay

use thiserror::Error;

/// Errors that can occur in the relay pipeline
#[derive(Debug, Error)]
pub enum RelayError {
    /// The adapter violated its protocol (e.g. never emitted a result)
    #[error("Adapter protocol error: {0}")]
    AdapterProtocol(String),

    /// The agent execution itself failed
    #[error("Execution failed: {0}")]
    Execution(String),

    /// Live connection failure (drop, handshake, send)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Durable store write or read failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Entity not found (session, request, project)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
