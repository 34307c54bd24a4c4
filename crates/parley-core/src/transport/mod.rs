//! Transports for the chat channel
//!
//! A [`Connector`] turns an endpoint and an identity into a duplex stream of
//! byte frames. The channel only ever talks to this seam, so the WebSocket
//! client and the in-memory transport are interchangeable.

use async_trait::async_trait;
use futures_util::{Sink, Stream};
use std::fmt;
use std::pin::Pin;

use crate::error::Result;
use crate::session::Identity;

pub mod memory;
#[cfg(feature = "websocket")]
pub mod ws;

pub use memory::{MemoryConnector, MemoryPeer};
#[cfg(feature = "websocket")]
pub use ws::WsConnector;

/// Outbound half of a connection
pub type FrameSink = Pin<Box<dyn Sink<Vec<u8>, Error = crate::error::ChatError> + Send>>;

/// Inbound half of a connection. The stream ends when the remote side closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// An established connection
pub struct Transport {
    sink: FrameSink,
    stream: FrameStream,
}

impl Transport {
    pub fn new<S, T>(sink: S, stream: T) -> Self
    where
        S: Sink<Vec<u8>, Error = crate::error::ChatError> + Send + 'static,
        T: Stream<Item = Result<Vec<u8>>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }

    pub fn into_split(self) -> (FrameSink, FrameStream) {
        (self.sink, self.stream)
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Opens connections on behalf of a channel
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish one connection to `endpoint` authenticated as `identity`
    async fn connect(&self, endpoint: &str, identity: &Identity) -> Result<Transport>;
}
