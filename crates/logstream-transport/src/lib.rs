//! Push transports for logstream
//!
//! This crate defines the connection seam a stream session drives, plus a
//! WebSocket implementation and an in-process loopback used for demos and
//! tests.

mod memory;
mod websocket;

use async_trait::async_trait;

pub use logstream_types::Frame;
pub use memory::{MemoryPeer, MemoryTransport};
pub use websocket::WebSocketTransport;

/// Failures raised by a transport, at handshake time or in flight
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("token rejected by server: {0}")]
    Unauthorized(String),

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("connection lost: {0}")]
    Closed(String),

    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),
}

impl TransportError {
    /// Whether the server rejected the credentials
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }

    /// Whether retrying the same handshake cannot succeed
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Unauthorized(_) | Self::InvalidEndpoint(_))
    }
}

/// Control messages the client sends upstream
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlMessage {
    Pause,
    Resume,
}

impl ControlMessage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
        }
    }

    /// Frame representation (no payload)
    pub fn to_frame(self) -> Frame {
        Frame::new(self.as_str(), serde_json::Value::Null)
    }
}

/// One established connection
#[async_trait]
pub trait Connection: Send {
    /// Next inbound frame
    ///
    /// `Ok(None)` means the peer closed the connection. Must be cancel-safe.
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError>;

    /// Send a control message upstream
    async fn send(&mut self, message: ControlMessage) -> Result<(), TransportError>;
}

/// Factory for connections, authenticated with a bearer token
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, token: &str) -> Result<Box<dyn Connection>, TransportError>;

    /// Human-readable endpoint, used in logs
    fn endpoint(&self) -> String;
}
