//! Session binding
//!
//! [`SessionContext`] holds the signed-in identity and is owned by whatever
//! performs authentication. [`SessionBinding`] ties a channel and its
//! transcript to that identity: a channel is only opened for a present
//! identity, and losing or replacing the identity closes the channel and
//! clears the transcript inside the same `sign_in`/`sign_out` call, so no
//! channel outlives the identity it was opened for.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::watch;
use tracing::info;

use crate::channel::{Channel, ChannelState};
use crate::config::{ChannelConfig, ClientConfig};
use crate::envelope::Envelope;
use crate::error::{ChatError, Result};
use crate::transcript::TranscriptStore;
use crate::transport::Connector;

/// An authenticated user and the bearer token that proves it
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    user_id: String,
    token: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: token.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Both the user id and the token are present
    pub fn is_valid(&self) -> bool {
        !self.user_id.is_empty() && !self.token.is_empty()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("user_id", &self.user_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Current signed-in identity, shared by reference
#[derive(Clone)]
pub struct SessionContext {
    identity: Arc<watch::Sender<Option<Identity>>>,
    bindings: Arc<Mutex<Vec<Weak<Bound>>>>,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionContext {
    pub fn new() -> Self {
        let (identity, _) = watch::channel(None);
        Self {
            identity: Arc::new(identity),
            bindings: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Record a successful login
    ///
    /// Signing in as a different identity revokes every bound channel and
    /// transcript before this returns.
    pub fn sign_in(&self, identity: Identity) -> Result<()> {
        if !identity.is_valid() {
            return Err(ChatError::AuthRequired);
        }
        info!("Signed in as {}", identity.user_id());

        let replaced = self
            .identity
            .send_replace(Some(identity.clone()))
            .map_or(false, |previous| previous != identity);
        if replaced {
            self.revoke_bindings();
        }
        Ok(())
    }

    /// Forget the identity, returning the previous one
    ///
    /// Every bound channel is `Closed` and every bound transcript is empty
    /// when this returns.
    pub fn sign_out(&self) -> Option<Identity> {
        let previous = self.identity.send_replace(None);
        if let Some(identity) = &previous {
            info!("Signed out {}", identity.user_id());
            self.revoke_bindings();
        }
        previous
    }

    pub fn current_identity(&self) -> Option<Identity> {
        self.identity.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Identity>> {
        self.identity.subscribe()
    }

    fn register(&self, bound: &Arc<Bound>) {
        let mut bindings = self.bindings.lock().unwrap_or_else(PoisonError::into_inner);
        bindings.retain(|b| b.strong_count() > 0);
        bindings.push(Arc::downgrade(bound));
    }

    fn revoke_bindings(&self) {
        // Collected first so handlers run by the revoke may touch the session
        let bound: Vec<Arc<Bound>> = {
            let mut bindings = self.bindings.lock().unwrap_or_else(PoisonError::into_inner);
            bindings.retain(|b| b.strong_count() > 0);
            bindings.iter().filter_map(Weak::upgrade).collect()
        };
        for bound in bound {
            bound.revoke();
        }
    }
}

/// Channel slot and transcript of one binding, reachable from the session
#[derive(Default)]
struct Bound {
    channel: Mutex<Option<Arc<Channel>>>,
    transcript: TranscriptStore,
}

impl Bound {
    fn slot(&self) -> MutexGuard<'_, Option<Arc<Channel>>> {
        self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> Option<Arc<Channel>> {
        self.slot().clone()
    }

    /// Synchronous teardown: close the channel and clear the transcript
    fn revoke(&self) {
        if let Some(channel) = self.current() {
            channel.close_now();
        }
        self.transcript.clear();
    }
}

/// Owns the channel and transcript for a session
pub struct SessionBinding {
    session: SessionContext,
    connector: Arc<dyn Connector>,
    endpoint: String,
    channel_config: ChannelConfig,
    bound: Arc<Bound>,
    /// Serializes connect and close so replacements never overlap
    ops: tokio::sync::Mutex<()>,
}

impl SessionBinding {
    pub fn new(session: SessionContext, connector: Arc<dyn Connector>, config: &ClientConfig) -> Self {
        let bound = Arc::new(Bound::default());
        session.register(&bound);

        Self {
            session,
            connector,
            endpoint: config.ws_url.clone(),
            channel_config: config.channel.clone(),
            bound,
            ops: tokio::sync::Mutex::new(()),
        }
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn transcript(&self) -> &TranscriptStore {
        &self.bound.transcript
    }

    /// The current channel, open or not
    pub fn channel(&self) -> Option<Arc<Channel>> {
        self.bound.current()
    }

    /// State of the current channel; `Idle` before the first connect
    pub fn channel_state(&self) -> ChannelState {
        self.bound
            .current()
            .map(|channel| channel.state())
            .unwrap_or(ChannelState::Idle)
    }

    /// Open a channel for the current identity
    ///
    /// Any previous channel is closed first, so at most one connection is
    /// live. The transcript survives a reconnect for the same identity; a
    /// different identity already cleared it when it signed in.
    pub async fn connect(&self) -> Result<Arc<Channel>> {
        let _ops = self.ops.lock().await;

        let identity = self
            .session
            .current_identity()
            .ok_or(ChatError::AuthRequired)?;

        let previous = self.bound.current();
        if let Some(previous) = previous {
            info!("Replacing channel for {}", previous.identity().user_id());
            previous.close().await;
        }

        let channel = Arc::new(Channel::open(
            identity.clone(),
            self.endpoint.clone(),
            self.connector.clone(),
            self.bound.transcript.clone(),
            self.channel_config.clone(),
        )?);
        *self.bound.slot() = Some(channel.clone());

        // A sign-out racing with this connect either saw the new channel in
        // the slot or is visible here.
        if self.session.current_identity().as_ref() != Some(&identity) {
            self.bound.revoke();
            return Err(ChatError::AuthRequired);
        }

        Ok(channel)
    }

    /// Send through the current channel
    pub async fn send(&self, envelope: Envelope) -> Result<Arc<Envelope>> {
        let channel = self.channel().ok_or(ChatError::NotConnected)?;
        channel.send(envelope).await
    }

    /// Close the current channel, keeping the identity and transcript
    pub async fn close(&self) {
        let _ops = self.ops.lock().await;
        if let Some(channel) = self.channel() {
            channel.close().await;
        }
    }

    /// Sign out and tear the session down
    ///
    /// When this returns the channel is `Closed`, its connection has been
    /// released and the transcript is empty.
    pub async fn sign_out(&self) {
        self.session.sign_out();
        self.bound.revoke();

        let _ops = self.ops.lock().await;
        if let Some(channel) = self.channel() {
            channel.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectPolicy;
    use crate::envelope::TargetKind;
    use crate::transport::MemoryConnector;

    fn binding(connector: &MemoryConnector) -> SessionBinding {
        let config = ClientConfig::new()
            .with_ws_url("mem://chat")
            .with_channel_config(ChannelConfig::default().with_reconnect(ReconnectPolicy::disabled()));
        SessionBinding::new(SessionContext::new(), Arc::new(connector.clone()), &config)
    }

    #[test]
    fn test_identity_validity_and_redaction() {
        assert!(Identity::new("u1", "t").is_valid());
        assert!(!Identity::new("", "t").is_valid());
        assert!(!Identity::new("u1", "").is_valid());

        let debug = format!("{:?}", Identity::new("u1", "secret-token"));
        assert!(debug.contains("u1"));
        assert!(!debug.contains("secret-token"));
    }

    #[test]
    fn test_session_context_sign_in_out() {
        let session = SessionContext::new();
        assert!(session.current_identity().is_none());

        assert_eq!(
            session.sign_in(Identity::new("", "t")),
            Err(ChatError::AuthRequired)
        );
        session.sign_in(Identity::new("u1", "t")).unwrap();
        assert_eq!(session.current_identity().unwrap().user_id(), "u1");

        let previous = session.sign_out().unwrap();
        assert_eq!(previous.user_id(), "u1");
        assert!(session.current_identity().is_none());
        assert!(session.sign_out().is_none());
    }

    #[tokio::test]
    async fn test_connect_without_identity() {
        let connector = MemoryConnector::new();
        let binding = binding(&connector);

        let err = binding.connect().await.unwrap_err();
        assert_eq!(err, ChatError::AuthRequired);
        assert_eq!(binding.channel_state(), ChannelState::Idle);
    }

    #[tokio::test]
    async fn test_send_without_channel() {
        let connector = MemoryConnector::new();
        let binding = binding(&connector);

        let err = binding
            .send(Envelope::message("u2", TargetKind::User, "hi"))
            .await
            .unwrap_err();
        assert_eq!(err, ChatError::NotConnected);
    }

    #[tokio::test]
    async fn test_identity_change_revokes_inline() {
        let connector = MemoryConnector::new();
        let binding = binding(&connector);
        binding.session().sign_in(Identity::new("u1", "t1")).unwrap();

        let channel = binding.connect().await.unwrap();
        channel.wait_for_state(ChannelState::is_open).await;
        binding
            .send(Envelope::message("u2", TargetKind::User, "hi"))
            .await
            .unwrap();

        // Same identity again is not a change
        binding.session().sign_in(Identity::new("u1", "t1")).unwrap();
        assert_eq!(binding.channel_state(), ChannelState::Open);
        assert_eq!(binding.transcript().len(), 1);

        binding.session().sign_in(Identity::new("u3", "t3")).unwrap();
        assert_eq!(binding.channel_state(), ChannelState::Closed);
        assert!(binding.transcript().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_binding_is_unregistered() {
        let connector = MemoryConnector::new();
        let session = SessionContext::new();
        let config = ClientConfig::new().with_ws_url("mem://chat");

        let first = SessionBinding::new(session.clone(), Arc::new(connector.clone()), &config);
        drop(first);
        let _second = SessionBinding::new(session.clone(), Arc::new(connector), &config);

        let live = session
            .bindings
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.strong_count() > 0)
            .count();
        assert_eq!(live, 1);
        assert_eq!(session.bindings.lock().unwrap().len(), 1);
    }
}
