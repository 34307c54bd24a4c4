//! Session-bound chat channel
//!
//! A [`Channel`] owns one live connection for one authenticated identity.
//! A dedicated task drives the connection: it writes queued outbound
//! frames, decodes inbound frames into the transcript and subscribers, and
//! reconnects with bounded exponential backoff when the transport drops.
//!
//! State transitions:
//!
//! ```text
//! Idle -> Connecting -> Open -> Closing -> Closed
//! Connecting -> Closed                      (initial connect failed)
//! Open -> Reconnecting(n) -> Open | Closed  (transport lost)
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ChannelConfig;
use crate::envelope::{self, Envelope, EnvelopeKind};
use crate::error::{ChatError, Result};
use crate::session::Identity;
use crate::transcript::{Direction, TranscriptStore};
use crate::transport::{Connector, Transport};

/// Upper bound on the orderly close of a sink during shutdown
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle state of a channel
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ChannelState {
    Idle,
    Connecting,
    Open,
    /// Waiting for or performing reconnect attempt `attempt` (1-based)
    Reconnecting { attempt: u32 },
    Closing,
    Closed,
}

impl ChannelState {
    pub fn is_open(&self) -> bool {
        matches!(self, ChannelState::Open)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ChannelState::Closed)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Idle => write!(f, "idle"),
            ChannelState::Connecting => write!(f, "connecting"),
            ChannelState::Open => write!(f, "open"),
            ChannelState::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            ChannelState::Closing => write!(f, "closing"),
            ChannelState::Closed => write!(f, "closed"),
        }
    }
}

/// Notification published by a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "detail", rename_all = "snake_case")]
pub enum ChannelEvent {
    StateChanged(ChannelState),
    Error(ChatError),
}

type MessageHandler = Arc<dyn Fn(&Arc<Envelope>) + Send + Sync>;
type StateHandler = Arc<dyn Fn(ChannelState) + Send + Sync>;
type EventHandler = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    message: Vec<MessageHandler>,
    state: Vec<StateHandler>,
    event: Vec<EventHandler>,
}

/// State shared between the channel handle and its connection task
struct Shared {
    identity: Identity,
    endpoint: String,
    config: ChannelConfig,
    transcript: TranscriptStore,
    state_tx: watch::Sender<ChannelState>,
    outbound: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    handlers: RwLock<Handlers>,
    last_error: Mutex<Option<ChatError>>,
}

impl Shared {
    fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ChannelState) {
        // Closing and Closed only move forward
        let changed = self.state_tx.send_if_modified(|current| {
            let leaving_shutdown = match *current {
                ChannelState::Closed => true,
                ChannelState::Closing => state != ChannelState::Closed,
                _ => false,
            };
            if *current == state || leaving_shutdown {
                false
            } else {
                *current = state;
                true
            }
        });
        if !changed {
            return;
        }

        info!("Channel {} -> {}: {}", self.identity.user_id(), self.endpoint, state);

        let (state_handlers, event_handlers) = {
            let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
            (handlers.state.clone(), handlers.event.clone())
        };
        for handler in state_handlers {
            handler(state);
        }
        let event = ChannelEvent::StateChanged(state);
        for handler in event_handlers {
            handler(&event);
        }
    }

    /// Record and publish an error without changing state
    fn report(&self, error: ChatError) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error.clone());

        let event_handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .event
            .clone();
        let event = ChannelEvent::Error(error);
        for handler in event_handlers {
            handler(&event);
        }
    }

    /// Terminal failure: publish the error, then close
    fn fail(&self, error: ChatError) {
        warn!("Channel {} failed: {}", self.identity.user_id(), error);
        self.report(error);
        self.set_state(ChannelState::Closed);
    }

    fn set_outbound(&self, sender: Option<mpsc::Sender<Vec<u8>>>) {
        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = sender;
    }

    fn outbound(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn clear_handlers(&self) {
        *self.handlers.write().unwrap_or_else(PoisonError::into_inner) = Handlers::default();
    }

    fn accepts(&self, kind: &EnvelopeKind) -> bool {
        match kind {
            EnvelopeKind::Message => true,
            EnvelopeKind::Unspecified => self.config.accept_unspecified_kind,
            EnvelopeKind::Other(_) => false,
        }
    }

    fn handle_inbound(&self, frame: &[u8], cancel: &CancellationToken) {
        let envelope = match envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed frame ({} bytes): {}", frame.len(), e);
                return;
            }
        };

        if !self.accepts(&envelope.kind) {
            debug!("Ignoring envelope of kind {}", envelope.kind);
            return;
        }

        let envelope = Arc::new(envelope);
        let appended = self
            .transcript
            .append_with(Direction::Inbound, envelope.clone(), || {
                if cancel.is_cancelled() {
                    Err(ChatError::NotConnected)
                } else {
                    Ok(())
                }
            });

        if appended.is_err() || cancel.is_cancelled() {
            return;
        }

        let message_handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .message
            .clone();
        for handler in message_handlers {
            handler(&envelope);
        }
    }
}

/// Why a connection stopped
enum Disconnect {
    Cancelled,
    Lost(Option<ChatError>),
}

/// Handle to a session-bound connection
///
/// Dropping the handle cancels the connection task. Call [`Channel::close`]
/// to also wait until the connection is released.
pub struct Channel {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    /// Open a channel for `identity`
    ///
    /// Returns immediately in [`ChannelState::Connecting`]; the connection
    /// is established by a spawned task, so this must be called inside a
    /// tokio runtime. A failed initial connect moves the channel to
    /// `Closed` and publishes a [`ChannelEvent::Error`].
    pub fn open(
        identity: Identity,
        endpoint: impl Into<String>,
        connector: Arc<dyn Connector>,
        transcript: TranscriptStore,
        config: ChannelConfig,
    ) -> Result<Self> {
        if !identity.is_valid() {
            return Err(ChatError::AuthRequired);
        }

        let endpoint = endpoint.into();
        info!("Opening channel for {} to {}", identity.user_id(), endpoint);

        let (state_tx, _) = watch::channel(ChannelState::Idle);
        let shared = Arc::new(Shared {
            identity,
            endpoint,
            config,
            transcript,
            state_tx,
            outbound: Mutex::new(None),
            handlers: RwLock::new(Handlers::default()),
            last_error: Mutex::new(None),
        });
        shared.set_state(ChannelState::Connecting);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(shared.clone(), connector, cancel.clone()));

        Ok(Self {
            shared,
            cancel,
            task: tokio::sync::Mutex::new(Some(task)),
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.shared.identity
    }

    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    pub fn transcript(&self) -> &TranscriptStore {
        &self.shared.transcript
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    /// Receiver that observes every state change
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state_tx.subscribe()
    }

    /// Wait until the state satisfies `predicate` and return it
    pub async fn wait_for_state<F>(&self, mut predicate: F) -> ChannelState
    where
        F: FnMut(&ChannelState) -> bool,
    {
        let mut rx = self.watch_state();
        let result = rx.wait_for(|state| predicate(state)).await.map(|state| *state);
        result.unwrap_or_else(|_| self.state())
    }

    /// Most recent error published by this channel
    pub fn last_error(&self) -> Option<ChatError> {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Called once per accepted inbound envelope, in arrival order
    ///
    /// Handlers run on the connection task and must not block.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(&Arc<Envelope>) + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .message
            .push(Arc::new(handler));
    }

    /// Called on every state transition
    pub fn on_state_change<F>(&self, handler: F)
    where
        F: Fn(ChannelState) + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .state
            .push(Arc::new(handler));
    }

    /// Called for state transitions and errors
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .event
            .push(Arc::new(handler));
    }

    /// Queue an envelope for delivery and record it in the transcript
    ///
    /// Returns once the frame is queued; there is no delivery
    /// acknowledgment.
    pub async fn send(&self, envelope: Envelope) -> Result<Arc<Envelope>> {
        if self.cancel.is_cancelled() || !self.state().is_open() {
            return Err(ChatError::NotConnected);
        }

        let frame = envelope::encode(&envelope)?;
        let envelope = Arc::new(envelope);

        // Queue under the transcript lock so wire order matches transcript
        // order and a concurrent close or clear cannot interleave.
        self.shared
            .transcript
            .append_with(Direction::Outbound, envelope.clone(), || {
                if self.cancel.is_cancelled() {
                    return Err(ChatError::NotConnected);
                }
                let sender = self.shared.outbound().ok_or(ChatError::NotConnected)?;
                sender.try_send(frame).map_err(|e| match e {
                    mpsc::error::TrySendError::Full(_) => ChatError::SendQueueFull,
                    mpsc::error::TrySendError::Closed(_) => ChatError::NotConnected,
                })
            })?;

        debug!(
            "Queued {} to {} {}",
            envelope.kind, envelope.target_kind, envelope.target_id
        );

        Ok(envelope)
    }

    /// Close without waiting for the connection task
    ///
    /// When this returns the state is `Closed`, every handler is
    /// unregistered, `send` fails with `NotConnected` and nothing further
    /// is appended. The task releases the connection on its own shortly
    /// after; use [`Channel::close`] to wait for that.
    pub fn close_now(&self) {
        self.cancel.cancel();
        self.shared.set_outbound(None);
        self.shared.set_state(ChannelState::Closing);
        self.shared.set_state(ChannelState::Closed);
        self.shared.clear_handlers();
    }

    /// Close the connection and unregister every handler
    ///
    /// Idempotent. When this returns the connection has been released and
    /// nothing further will be appended or delivered by this channel.
    pub async fn close(&self) {
        let mut task = self.task.lock().await;

        self.cancel.cancel();
        if !self.state().is_closed() {
            self.shared.set_state(ChannelState::Closing);
        }

        if let Some(handle) = task.take() {
            if let Err(e) = handle.await {
                warn!("Channel task ended abnormally: {}", e);
            }
        }

        self.shared.set_outbound(None);
        self.shared.set_state(ChannelState::Closed);
        self.shared.clear_handlers();
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("identity", &self.shared.identity)
            .field("endpoint", &self.shared.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

/// Connection loop with reconnection
async fn run(shared: Arc<Shared>, connector: Arc<dyn Connector>, cancel: CancellationToken) {
    let policy = shared.config.reconnect.clone();
    let mut attempt = 0u32;
    let mut ever_opened = false;

    loop {
        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = tokio::time::timeout(
                shared.config.connect_timeout(),
                connector.connect(&shared.endpoint, &shared.identity),
            ) => result.unwrap_or_else(|_| {
                Err(ChatError::Connect(format!(
                    "timed out after {}ms",
                    shared.config.connect_timeout_ms
                )))
            }),
        };

        match connected {
            Ok(transport) => {
                attempt = 0;
                ever_opened = true;

                let (tx, rx) = mpsc::channel(shared.config.outbound_queue.max(1));
                shared.set_outbound(Some(tx));
                shared.set_state(ChannelState::Open);

                let reason = run_connection(&shared, transport, rx, &cancel).await;
                shared.set_outbound(None);

                match reason {
                    Disconnect::Cancelled => return,
                    Disconnect::Lost(Some(error)) => {
                        warn!("Connection to {} lost: {}", shared.endpoint, error);
                        shared.report(error);
                    }
                    Disconnect::Lost(None) => {
                        info!("Connection to {} closed by server", shared.endpoint);
                    }
                }
            }
            Err(error) if !ever_opened => {
                shared.fail(error);
                return;
            }
            Err(error) => {
                warn!("Reconnect attempt {} to {} failed: {}", attempt, shared.endpoint, error);
            }
        }

        if cancel.is_cancelled() {
            return;
        }

        if attempt >= policy.max_attempts {
            shared.fail(ChatError::ConnectionLost { attempts: attempt });
            return;
        }

        attempt += 1;
        shared.set_state(ChannelState::Reconnecting { attempt });

        let delay = policy.delay_for(attempt);
        debug!("Reconnecting in {:?}", delay);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Pump one connection until it drops or the channel is cancelled
async fn run_connection(
    shared: &Shared,
    transport: Transport,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    cancel: &CancellationToken,
) -> Disconnect {
    let (mut sink, mut stream) = transport.into_split();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
                    Ok(Err(e)) => debug!("Error closing connection: {}", e),
                    Err(_) => debug!("Timed out closing connection"),
                    Ok(Ok(())) => {}
                }
                return Disconnect::Cancelled;
            }
            Some(frame) = outbound.recv() => {
                if let Err(e) = sink.send(frame).await {
                    return Disconnect::Lost(Some(e));
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(frame)) => shared.handle_inbound(&frame, cancel),
                Some(Err(e)) => return Disconnect::Lost(Some(e)),
                None => return Disconnect::Lost(None),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectPolicy;
    use crate::envelope::TargetKind;
    use crate::transport::MemoryConnector;

    fn config() -> ChannelConfig {
        ChannelConfig::default().with_reconnect(ReconnectPolicy::disabled())
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ChannelState::Open.to_string(), "open");
        assert_eq!(
            ChannelState::Reconnecting { attempt: 2 }.to_string(),
            "reconnecting (attempt 2)"
        );
    }

    #[test]
    fn test_state_serde() {
        let json = serde_json::to_string(&ChannelState::Reconnecting { attempt: 1 }).unwrap();
        assert_eq!(json, r#"{"state":"reconnecting","attempt":1}"#);
        let parsed: ChannelState = serde_json::from_str(r#"{"state":"open"}"#).unwrap();
        assert_eq!(parsed, ChannelState::Open);
    }

    #[tokio::test]
    async fn test_open_requires_identity() {
        let connector = MemoryConnector::new();
        let err = Channel::open(
            Identity::new("", ""),
            "mem://chat",
            Arc::new(connector.clone()),
            TranscriptStore::new(),
            config(),
        )
        .unwrap_err();

        assert_eq!(err, ChatError::AuthRequired);
        assert_eq!(connector.total_connections(), 0);
    }

    #[tokio::test]
    async fn test_send_while_connecting_is_not_connected() {
        let connector = MemoryConnector::new();
        let channel = Channel::open(
            Identity::new("u1", "t1"),
            "mem://chat",
            Arc::new(connector),
            TranscriptStore::new(),
            config(),
        )
        .unwrap();

        // The task has not run yet on the current-thread runtime
        assert_eq!(channel.state(), ChannelState::Connecting);
        let err = channel
            .send(Envelope::message("u2", TargetKind::User, "hi"))
            .await
            .unwrap_err();
        assert_eq!(err, ChatError::NotConnected);
        assert!(channel.transcript().is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let connector = MemoryConnector::new();
        let channel = Channel::open(
            Identity::new("u1", "t1"),
            "mem://chat",
            Arc::new(connector.clone()),
            TranscriptStore::new(),
            config(),
        )
        .unwrap();
        channel.wait_for_state(ChannelState::is_open).await;

        channel.close().await;
        channel.close().await;

        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(connector.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_drop_releases_connection() {
        let connector = MemoryConnector::new();
        let channel = Channel::open(
            Identity::new("u1", "t1"),
            "mem://chat",
            Arc::new(connector.clone()),
            TranscriptStore::new(),
            config(),
        )
        .unwrap();
        channel.wait_for_state(ChannelState::is_open).await;
        assert_eq!(connector.live_connections(), 1);

        drop(channel);
        for _ in 0..100 {
            if connector.live_connections() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(connector.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_close_now_is_immediate_and_final() {
        let connector = MemoryConnector::new();
        let channel = Channel::open(
            Identity::new("u1", "t1"),
            "mem://chat",
            Arc::new(connector.clone()),
            TranscriptStore::new(),
            config(),
        )
        .unwrap();
        channel.wait_for_state(ChannelState::is_open).await;

        let states = Arc::new(Mutex::new(Vec::new()));
        let seen = states.clone();
        channel.on_state_change(move |state| seen.lock().unwrap().push(state));

        channel.close_now();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(
            *states.lock().unwrap(),
            vec![ChannelState::Closing, ChannelState::Closed]
        );

        let err = channel
            .send(Envelope::message("u2", TargetKind::User, "hi"))
            .await
            .unwrap_err();
        assert_eq!(err, ChatError::NotConnected);
        assert!(channel.transcript().is_empty());

        // Terminal: the task winding down cannot reopen it
        channel.shared.set_state(ChannelState::Open);
        assert_eq!(channel.state(), ChannelState::Closed);

        channel.close().await;
        assert_eq!(connector.live_connections(), 0);
    }
}
