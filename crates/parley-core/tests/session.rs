use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parley_core::{
    ChannelConfig, ChannelState, ChatError, ClientConfig, Envelope, Identity, MemoryConnector,
    ReconnectPolicy, SessionBinding, SessionContext, TargetKind,
};

async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

fn binding(connector: &MemoryConnector) -> Arc<SessionBinding> {
    let config = ClientConfig::new()
        .with_ws_url("mem://chat/api/v1/ws")
        .with_channel_config(ChannelConfig::default().with_reconnect(ReconnectPolicy::disabled()));
    Arc::new(SessionBinding::new(
        SessionContext::new(),
        Arc::new(connector.clone()),
        &config,
    ))
}

async fn connect_open(binding: &SessionBinding) {
    let channel = binding.connect().await.unwrap();
    within(channel.wait_for_state(|s| s.is_open() || s.is_closed())).await;
    assert_eq!(channel.state(), ChannelState::Open);
}

fn hi() -> Envelope {
    Envelope::message("u2", TargetKind::User, "hi")
}

#[tokio::test]
async fn connect_uses_session_identity_and_endpoint() {
    let connector = MemoryConnector::new();
    let binding = binding(&connector);
    binding.session().sign_in(Identity::new("u1", "token-u1")).unwrap();

    connect_open(&binding).await;

    let peer = within(connector.accept()).await.unwrap();
    assert_eq!(peer.endpoint, "mem://chat/api/v1/ws");
    assert_eq!(peer.identity.user_id(), "u1");
    assert_eq!(peer.identity.token(), "token-u1");
    assert_eq!(binding.channel_state(), ChannelState::Open);
}

#[tokio::test]
async fn second_connect_replaces_the_first_connection() {
    let connector = MemoryConnector::new();
    let binding = binding(&connector);
    binding.session().sign_in(Identity::new("u1", "t1")).unwrap();

    connect_open(&binding).await;
    let first = binding.channel().unwrap();
    binding.send(hi()).await.unwrap();

    connect_open(&binding).await;

    assert_eq!(first.state(), ChannelState::Closed);
    assert_eq!(connector.total_connections(), 2);
    assert_eq!(connector.live_connections(), 1);

    // Same identity, so the transcript carries over
    assert_eq!(binding.transcript().len(), 1);
}

#[tokio::test]
async fn sign_out_closes_channel_and_clears_transcript() {
    let connector = MemoryConnector::new();
    let binding = binding(&connector);
    binding.session().sign_in(Identity::new("u1", "t1")).unwrap();
    connect_open(&binding).await;

    let channel = binding.channel().unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    channel.on_message(move |e| {
        let _ = tx.send(e.clone());
    });

    binding.send(hi()).await.unwrap();
    let peer = within(connector.accept()).await.unwrap();
    let mut reply = Envelope::message("u1", TargetKind::User, "hello");
    reply.sender_id = Some("u2".to_string());
    peer.push_envelope(&reply).unwrap();

    within(rx.recv()).await.unwrap();
    assert_eq!(binding.transcript().len(), 2);

    binding.sign_out().await;

    assert!(binding.session().current_identity().is_none());
    assert_eq!(binding.channel_state(), ChannelState::Closed);
    assert!(binding.transcript().is_empty());
    assert_eq!(connector.live_connections(), 0);

    assert_eq!(binding.send(hi()).await.unwrap_err(), ChatError::NotConnected);
    assert_eq!(binding.connect().await.unwrap_err(), ChatError::AuthRequired);
}

#[tokio::test]
async fn external_sign_out_tears_down_before_returning() {
    let connector = MemoryConnector::new();
    let binding = binding(&connector);
    binding.session().sign_in(Identity::new("u1", "t1")).unwrap();
    connect_open(&binding).await;
    binding.send(hi()).await.unwrap();
    let channel = binding.channel().unwrap();

    // Signed out through the session directly, not through the binding
    binding.session().sign_out();

    assert_eq!(binding.channel_state(), ChannelState::Closed);
    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(binding.transcript().is_empty());
    assert_eq!(binding.send(hi()).await.unwrap_err(), ChatError::NotConnected);
    assert!(binding.transcript().is_empty());

    within(channel.close()).await;
    assert_eq!(connector.live_connections(), 0);
}

#[tokio::test]
async fn inbound_after_external_sign_out_is_discarded() {
    let connector = MemoryConnector::new();
    let binding = binding(&connector);
    binding.session().sign_in(Identity::new("u1", "t1")).unwrap();
    connect_open(&binding).await;
    let peer = within(connector.accept()).await.unwrap();
    let channel = binding.channel().unwrap();

    binding.session().sign_out();
    let mut late = Envelope::message("u1", TargetKind::User, "too late");
    late.sender_id = Some("u2".to_string());
    let _ = peer.push_envelope(&late).unwrap();

    within(channel.close()).await;
    assert!(binding.transcript().is_empty());
    assert!(peer.is_closed());
}

#[tokio::test]
async fn changing_identity_clears_transcript() {
    let connector = MemoryConnector::new();
    let binding = binding(&connector);
    binding.session().sign_in(Identity::new("u1", "t1")).unwrap();
    connect_open(&binding).await;
    binding.send(hi()).await.unwrap();
    assert_eq!(binding.transcript().len(), 1);

    binding.session().sign_in(Identity::new("u3", "t3")).unwrap();
    assert!(binding.transcript().is_empty());
    assert_eq!(binding.channel_state(), ChannelState::Closed);
    connect_open(&binding).await;

    assert!(binding.transcript().is_empty());
    let channel = binding.channel().unwrap();
    assert_eq!(channel.identity().user_id(), "u3");
    assert_eq!(connector.live_connections(), 1);
}

#[tokio::test]
async fn failed_connect_is_observable_through_binding() {
    let connector = MemoryConnector::new();
    connector.fail_next(1);
    let binding = binding(&connector);
    binding.session().sign_in(Identity::new("u1", "t1")).unwrap();

    let channel = binding.connect().await.unwrap();
    within(channel.wait_for_state(ChannelState::is_closed)).await;

    assert_eq!(binding.channel_state(), ChannelState::Closed);
    assert!(matches!(channel.last_error(), Some(ChatError::Connect(_))));
    assert_eq!(binding.send(hi()).await.unwrap_err(), ChatError::NotConnected);
}
