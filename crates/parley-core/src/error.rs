//! Client-wide error types
//!
//! A single `thiserror` taxonomy shared by the codec, transports, channel
//! and session binding. Errors are serializable so the CLI can render
//! them as JSON lines next to transcript entries.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for the messaging core
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "message")]
pub enum ChatError {
    /// A channel was opened without an authenticated identity
    #[error("Authentication required")]
    AuthRequired,

    /// The transport could not be established
    #[error("Failed to connect: {0}")]
    Connect(String),

    /// Inbound bytes were not a well-formed envelope
    #[error("Failed to decode envelope: {0}")]
    Decode(String),

    /// Outbound envelope is missing required fields
    #[error("Failed to encode envelope: {0}")]
    Encode(String),

    /// Send attempted while the channel is not open
    #[error("Channel is not connected")]
    NotConnected,

    /// The outbound writer queue is full
    #[error("Send queue is full")]
    SendQueueFull,

    /// Reconnection budget exhausted
    #[error("Connection lost after {attempts} reconnect attempts")]
    ConnectionLost { attempts: u32 },

    /// I/O failure on an established connection
    #[error("Transport error: {0}")]
    Transport(String),

    /// The authentication service rejected a request
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<ChatError> for String {
    fn from(error: ChatError) -> String {
        error.to_string()
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ChatError>;

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<toml::de::Error> for ChatError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}
