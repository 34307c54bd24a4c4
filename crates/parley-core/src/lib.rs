//! Parley Core Library
//!
//! The real-time messaging core of the Parley chat client. This crate is
//! independent of any presentation layer: it opens a session-bound
//! connection, speaks the envelope protocol and keeps the transcript.
//!
//! # Modules
//!
//! - [`envelope`] - Envelope types and the JSON wire codec
//! - [`channel`] - Connection lifecycle, delivery and reconnection
//! - [`transcript`] - Append-only, arrival-ordered message log
//! - [`session`] - Identity and the session binding that owns a channel
//! - [`transport`] - Connector seam with WebSocket and in-memory transports
//! - [`config`] - Client configuration
//! - [`error`] - Error types

pub mod channel;
pub mod config;
pub mod envelope;
pub mod error;
pub mod session;
pub mod transcript;
pub mod transport;

// Re-export commonly used types
pub use channel::{Channel, ChannelEvent, ChannelState};
pub use config::{ChannelConfig, ClientConfig, ReconnectPolicy};
pub use envelope::{decode, encode, Envelope, EnvelopeKind, Payload, TargetKind};
pub use error::{ChatError, Result};
pub use session::{Identity, SessionBinding, SessionContext};
pub use transcript::{Direction, Snapshot, TranscriptEntry, TranscriptStats, TranscriptStore};
pub use transport::{Connector, MemoryConnector, MemoryPeer, Transport};
#[cfg(feature = "websocket")]
pub use transport::WsConnector;
