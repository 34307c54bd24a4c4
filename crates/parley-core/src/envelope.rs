//! Envelope Protocol Types
//!
//! The message unit exchanged over the chat socket and its JSON codec.
//!
//! The wire shape is the server's `WSMessage`:
//!
//! ```json
//! { "event": "chat.message", "sender_id": "u1", "receiver_id": "u2",
//!   "receiver_type": "user", "data": { "text": "hi" } }
//! ```
//!
//! `sender_id` is injected by the server and absent on outbound envelopes.
//! The older `{ "to": .., "body": .. }` shape is not accepted.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ChatError, Result};

/// Wire tag for chat messages
pub const MESSAGE_EVENT: &str = "chat.message";

/// Semantic event carried by an envelope
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum EnvelopeKind {
    /// A chat message (`"chat.message"`)
    Message,
    /// No `event` field was present
    #[default]
    Unspecified,
    /// Any event this client does not understand. Must not be empty or
    /// spell a reserved tag such as [`MESSAGE_EVENT`]; `encode` rejects those.
    Other(String),
}

impl EnvelopeKind {
    /// Map a wire `event` value to a kind. Empty strings count as missing.
    pub fn from_wire(event: Option<&str>) -> Self {
        match event {
            None | Some("") => EnvelopeKind::Unspecified,
            Some(MESSAGE_EVENT) => EnvelopeKind::Message,
            Some(other) => EnvelopeKind::Other(other.to_string()),
        }
    }

    /// The wire `event` value, `None` when the field is omitted
    pub fn as_wire(&self) -> Option<&str> {
        match self {
            EnvelopeKind::Message => Some(MESSAGE_EVENT),
            EnvelopeKind::Unspecified => None,
            EnvelopeKind::Other(event) => Some(event.as_str()),
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_wire().unwrap_or("unspecified"))
    }
}

/// Addressing mode for the recipient
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    /// A single user
    #[default]
    User,
    /// A group (room) resolved server-side
    Group,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::User => write!(f, "user"),
            TargetKind::Group => write!(f, "group"),
        }
    }
}

/// Free-form envelope payload (a JSON object)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Payload(serde_json::Map<String, serde_json::Value>);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payload holding just a `text` field
    pub fn with_text(text: impl Into<String>) -> Self {
        let mut payload = Self::new();
        payload.insert("text", serde_json::Value::String(text.into()));
        payload
    }

    /// The `text` field, when present and a string
    pub fn text(&self) -> Option<&str> {
        self.0.get("text").and_then(|v| v.as_str())
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.0.insert(key.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A single message unit
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    /// Originating user; set by the server on delivery
    pub sender_id: Option<String>,
    /// Recipient user or group id
    pub target_id: String,
    pub target_kind: TargetKind,
    pub payload: Payload,
}

impl Envelope {
    /// Build an outbound chat message
    pub fn message(
        target_id: impl Into<String>,
        target_kind: TargetKind,
        text: impl Into<String>,
    ) -> Self {
        Self {
            kind: EnvelopeKind::Message,
            sender_id: None,
            target_id: target_id.into(),
            target_kind,
            payload: Payload::with_text(text),
        }
    }

    pub fn text(&self) -> Option<&str> {
        self.payload.text()
    }
}

#[derive(Serialize)]
struct WireEnvelopeRef<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sender_id: Option<&'a str>,
    receiver_id: &'a str,
    receiver_type: TargetKind,
    data: &'a Payload,
}

#[derive(Deserialize)]
struct WireEnvelope {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    sender_id: Option<String>,
    #[serde(default)]
    receiver_id: String,
    #[serde(default)]
    receiver_type: TargetKind,
    #[serde(default)]
    data: Option<Payload>,
}

/// Serialize an envelope to its JSON wire form
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    if envelope.target_id.is_empty() {
        return Err(ChatError::Encode("missing receiver_id".to_string()));
    }
    if envelope.payload.text().is_none() {
        return Err(ChatError::Encode("payload has no text field".to_string()));
    }
    if let EnvelopeKind::Other(event) = &envelope.kind {
        if event.is_empty() {
            return Err(ChatError::Encode("empty event kind".to_string()));
        }
        // Would decode as a different kind
        if EnvelopeKind::from_wire(Some(event)) != envelope.kind {
            return Err(ChatError::Encode(format!(
                "event kind {event:?} collides with a reserved kind"
            )));
        }
    }

    let wire = WireEnvelopeRef {
        event: envelope.kind.as_wire(),
        sender_id: envelope.sender_id.as_deref(),
        receiver_id: &envelope.target_id,
        receiver_type: envelope.target_kind,
        data: &envelope.payload,
    };

    serde_json::to_vec(&wire).map_err(|e| ChatError::Encode(e.to_string()))
}

/// Parse an envelope from its JSON wire form
///
/// Only malformed input fails. A missing `event` yields
/// [`EnvelopeKind::Unspecified`]; whether such envelopes are delivered is
/// the channel's decision.
pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    let wire: WireEnvelope = serde_json::from_slice(bytes)?;

    Ok(Envelope {
        kind: EnvelopeKind::from_wire(wire.event.as_deref()),
        sender_id: wire.sender_id,
        target_id: wire.receiver_id,
        target_kind: wire.receiver_type,
        payload: wire.data.unwrap_or_default(),
    })
}
