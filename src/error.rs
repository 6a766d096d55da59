//! Error types for MCP-over-MQTT operations
//!
//! The engine never lets a fault escape onto the wire unsynthesized: protocol
//! faults become JSON-RPC error responses and tool faults become tool-level
//! error results. This type covers the embedder-facing seams, primarily
//! transport construction.

use thiserror::Error;

/// MCP-over-MQTT error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl Error {
    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration {
            message: message.into(),
        }
    }
}

/// Convenience result type for MCP-over-MQTT operations
pub type Result<T> = std::result::Result<T, Error>;
