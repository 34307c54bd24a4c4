//! Terminal output for the chat session
//!
//! Prints transcript entries and channel notifications to stdout, either as
//! human-readable lines or as one JSON object per line.

use chrono::{DateTime, Local, Utc};
use parley_core::{ChannelEvent, Direction, Envelope, TargetKind, TranscriptEntry};
use serde_json::json;

/// Renders to stdout in text or JSON form
#[derive(Debug, Default, Clone, Copy)]
pub struct Renderer {
    /// Whether to print in JSON format
    pub json_output: bool,
}

impl Renderer {
    pub fn new(json_output: bool) -> Self {
        Self { json_output }
    }

    pub fn format_envelope(
        &self,
        direction: Direction,
        envelope: &Envelope,
        recorded_at: DateTime<Utc>,
    ) -> String {
        if self.json_output {
            return json!({
                "direction": direction,
                "recorded_at": recorded_at.to_rfc3339(),
                "kind": envelope.kind.to_string(),
                "sender_id": envelope.sender_id,
                "target_id": envelope.target_id,
                "target_kind": envelope.target_kind,
                "payload": envelope.payload,
            })
            .to_string();
        }

        let sender = match direction {
            Direction::Outbound => "you",
            Direction::Inbound => envelope.sender_id.as_deref().unwrap_or("?"),
        };
        let body = match envelope.text() {
            Some(text) => text.to_string(),
            None => serde_json::to_string(&envelope.payload).unwrap_or_default(),
        };

        format!(
            "[{}] {} -> {}: {}",
            format_timestamp(recorded_at),
            sender,
            format_target(envelope),
            body
        )
    }

    pub fn format_entry(&self, entry: &TranscriptEntry) -> String {
        self.format_envelope(entry.direction, &entry.envelope, entry.recorded_at)
    }

    pub fn format_event(&self, event: &ChannelEvent) -> String {
        if self.json_output {
            return serde_json::to_string(event).unwrap_or_default();
        }

        match event {
            ChannelEvent::StateChanged(state) => format!("* channel {state}"),
            ChannelEvent::Error(error) => format!("! {error}"),
        }
    }

    pub fn print_envelope(&self, direction: Direction, envelope: &Envelope) {
        println!("{}", self.format_envelope(direction, envelope, Utc::now()));
    }

    pub fn print_entry(&self, entry: &TranscriptEntry) {
        println!("{}", self.format_entry(entry));
    }

    pub fn print_event(&self, event: &ChannelEvent) {
        println!("{}", self.format_event(event));
    }

    /// Local feedback that is not part of the transcript
    pub fn notice(&self, message: &str) {
        if self.json_output {
            println!("{}", json!({ "event": "notice", "message": message }));
        } else {
            println!("* {message}");
        }
    }
}

fn format_target(envelope: &Envelope) -> String {
    match envelope.target_kind {
        TargetKind::User => envelope.target_id.clone(),
        TargetKind::Group => format!("#{}", envelope.target_id),
    }
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%H:%M:%S").to_string()
}
