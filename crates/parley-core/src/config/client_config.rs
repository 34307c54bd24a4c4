use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::defaults;
use crate::error::{ChatError, Result};

/// Client configuration
///
/// Every field has a default, so a TOML file only needs the keys it
/// overrides:
///
/// ```toml
/// ws_url = "wss://chat.example.com/api/v1/ws"
///
/// [channel.reconnect]
/// max_attempts = 10
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the HTTP authentication service
    pub api_url: String,

    /// Chat socket endpoint
    pub ws_url: String,

    /// Channel behaviour
    pub channel: ChannelConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: defaults::DEFAULT_API_URL.to_string(),
            ws_url: defaults::DEFAULT_WS_URL.to_string(),
            channel: ChannelConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ChatError::Config(format!("Failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub fn with_ws_url(mut self, ws_url: impl Into<String>) -> Self {
        self.ws_url = ws_url.into();
        self
    }

    pub fn with_channel_config(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }
}

/// Per-channel settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelConfig {
    /// Capacity of the outbound writer queue (frames)
    pub outbound_queue: usize,

    /// Bound on a single connect attempt (milliseconds)
    pub connect_timeout_ms: u64,

    /// Deliver envelopes that carry no `event` field.
    /// When false only recognized kinds reach the transcript.
    pub accept_unspecified_kind: bool,

    /// Reconnection after the transport drops
    pub reconnect: ReconnectPolicy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            outbound_queue: defaults::DEFAULT_OUTBOUND_QUEUE,
            connect_timeout_ms: defaults::DEFAULT_CONNECT_TIMEOUT_MS,
            accept_unspecified_kind: true,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ChannelConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_outbound_queue(mut self, outbound_queue: usize) -> Self {
        self.outbound_queue = outbound_queue;
        self
    }

    pub fn with_accept_unspecified_kind(mut self, accept: bool) -> Self {
        self.accept_unspecified_kind = accept;
        self
    }
}

/// Bounded exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts before the connection is declared lost.
    /// Zero disables reconnection.
    pub max_attempts: u32,

    /// Delay before the first attempt (milliseconds)
    pub base_delay_ms: u64,

    /// Ceiling on the exponential delay (milliseconds)
    pub max_delay_ms: u64,

    /// Upper bound of random jitter added to each delay (milliseconds)
    pub jitter_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::DEFAULT_MAX_RECONNECT_ATTEMPTS,
            base_delay_ms: defaults::DEFAULT_RECONNECT_BASE_DELAY_MS,
            max_delay_ms: defaults::DEFAULT_RECONNECT_MAX_DELAY_MS,
            jitter_ms: defaults::DEFAULT_RECONNECT_JITTER_MS,
        }
    }
}

impl ReconnectPolicy {
    /// A policy that never reconnects
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 0
    }

    /// Delay before `attempt` (1-based), without jitter
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Delay before `attempt` (1-based), with jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        self.base_delay_for(attempt) + Duration::from_millis(jitter)
    }
}
