//! WebSocket transport
//!
//! Opens the chat socket with tokio-tungstenite. The identity token is sent
//! as a bearer credential on the upgrade request, which the server accepts
//! alongside its `access` cookie.

use async_trait::async_trait;
use futures_util::{future, SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info};

use super::{Connector, Transport};
use crate::error::{ChatError, Result};
use crate::session::Identity;

/// Connector for `ws://` and `wss://` endpoints
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &str, identity: &Identity) -> Result<Transport> {
        let mut request = endpoint
            .into_client_request()
            .map_err(|e| ChatError::Connect(format!("Invalid endpoint {endpoint}: {e}")))?;

        let bearer = HeaderValue::from_str(&format!("Bearer {}", identity.token()))
            .map_err(|e| ChatError::Connect(format!("Invalid token: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (socket, response) = connect_async(request)
            .await
            .map_err(|e| ChatError::Connect(e.to_string()))?;

        info!(
            "WebSocket connected to {} (status {})",
            endpoint,
            response.status()
        );

        let (write, read) = socket.split();

        let sink = write
            .with(|bytes: Vec<u8>| future::ready(Ok::<_, WsError>(frame_to_message(bytes))))
            .sink_map_err(|e| ChatError::Transport(e.to_string()));

        let stream = read.filter_map(|frame| future::ready(message_to_frame(frame)));

        Ok(Transport::new(sink, stream))
    }
}

/// Text when the frame is UTF-8 (always true for encoded envelopes)
fn frame_to_message(bytes: Vec<u8>) -> Message {
    match String::from_utf8(bytes) {
        Ok(text) => Message::Text(text),
        Err(e) => Message::Binary(e.into_bytes()),
    }
}

fn message_to_frame(message: std::result::Result<Message, WsError>) -> Option<Result<Vec<u8>>> {
    match message {
        Ok(Message::Text(text)) => Some(Ok(text.into_bytes())),
        Ok(Message::Binary(data)) => Some(Ok(data)),
        Ok(Message::Close(frame)) => {
            debug!("Server sent close frame: {:?}", frame);
            None
        }
        // Ping/pong are answered by tungstenite itself
        Ok(_) => None,
        Err(e) => Some(Err(ChatError::Transport(e.to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_to_message() {
        assert_eq!(
            frame_to_message(b"{\"a\":1}".to_vec()),
            Message::Text("{\"a\":1}".to_string())
        );
        assert_eq!(
            frame_to_message(vec![0xff, 0xfe]),
            Message::Binary(vec![0xff, 0xfe])
        );
    }

    #[test]
    fn test_message_to_frame() {
        assert_eq!(
            message_to_frame(Ok(Message::Text("hi".to_string()))),
            Some(Ok(b"hi".to_vec()))
        );
        assert_eq!(message_to_frame(Ok(Message::Binary(vec![1, 2]))), Some(Ok(vec![1, 2])));
        assert_eq!(message_to_frame(Ok(Message::Ping(vec![]))), None);
        assert_eq!(message_to_frame(Ok(Message::Close(None))), None);
        assert!(matches!(
            message_to_frame(Err(WsError::ConnectionClosed)),
            Some(Err(ChatError::Transport(_)))
        ));
    }

    #[tokio::test]
    async fn test_invalid_endpoint_is_connect_error() {
        let identity = Identity::new("u1", "token");
        let err = WsConnector::new()
            .connect("not a url", &identity)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Connect(_)));
    }
}
