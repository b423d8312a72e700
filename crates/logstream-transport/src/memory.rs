use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{Connection, ControlMessage, Frame, Transport, TransportError};

/// In-process loopback transport
///
/// Every accepted connection hands its server end to whoever holds the
/// transport, via [`MemoryTransport::accept`].
#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

struct Shared {
    /// Token the fake server accepts (None = any non-empty token)
    required_token: Mutex<Option<String>>,

    /// Handshake failures to return before accepting again
    scripted: Mutex<VecDeque<TransportError>>,

    /// Refuse every handshake while set
    refusing: Mutex<Option<TransportError>>,

    attempts: AtomicUsize,

    peers_tx: mpsc::UnboundedSender<MemoryPeer>,
    peers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryPeer>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                required_token: Mutex::new(None),
                scripted: Mutex::new(VecDeque::new()),
                refusing: Mutex::new(None),
                attempts: AtomicUsize::new(0),
                peers_tx,
                peers_rx: tokio::sync::Mutex::new(peers_rx),
            }),
        }
    }

    /// Only accept handshakes presenting this token
    pub fn require_token(&self, token: impl Into<String>) {
        *self.shared.required_token.lock() = Some(token.into());
    }

    /// Fail the next handshake with `error` (queued in order)
    pub fn fail_next(&self, error: TransportError) {
        self.shared.scripted.lock().push_back(error);
    }

    /// Refuse all handshakes with `error` until [`MemoryTransport::accept_all`]
    pub fn refuse_all(&self, error: TransportError) {
        *self.shared.refusing.lock() = Some(error);
    }

    pub fn accept_all(&self) {
        *self.shared.refusing.lock() = None;
    }

    /// Number of handshakes attempted so far
    pub fn attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Wait for the server end of the next accepted connection
    pub async fn accept(&self) -> Option<MemoryPeer> {
        self.shared.peers_rx.lock().await.recv().await
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, token: &str) -> Result<Box<dyn Connection>, TransportError> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(required) = self.shared.required_token.lock().as_deref() {
            if required != token {
                return Err(TransportError::Unauthorized("invalid token".into()));
            }
        }
        if let Some(error) = self.shared.scripted.lock().pop_front() {
            return Err(error);
        }
        if let Some(error) = self.shared.refusing.lock().clone() {
            return Err(error);
        }

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (controls_tx, controls_rx) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            frames: frames_tx,
            controls: controls_rx,
        };
        if self.shared.peers_tx.send(peer).is_err() {
            return Err(TransportError::Refused("loopback server is gone".into()));
        }

        Ok(Box::new(MemoryConnection {
            frames: frames_rx,
            controls: controls_tx,
        }))
    }

    fn endpoint(&self) -> String {
        "memory://loopback".to_string()
    }
}

/// Server end of a loopback connection
///
/// Dropping the peer closes the connection from the server side.
pub struct MemoryPeer {
    frames: mpsc::UnboundedSender<Frame>,
    controls: mpsc::UnboundedReceiver<ControlMessage>,
}

impl MemoryPeer {
    /// Push a frame to the client; false once the client has gone away
    pub fn emit(&self, frame: Frame) -> bool {
        self.frames.send(frame).is_ok()
    }

    /// Next control message sent by the client
    pub async fn next_control(&mut self) -> Option<ControlMessage> {
        self.controls.recv().await
    }

    /// Control message already sent by the client, without waiting
    pub fn try_control(&mut self) -> Option<ControlMessage> {
        self.controls.try_recv().ok()
    }

    pub fn is_closed(&self) -> bool {
        self.frames.is_closed()
    }
}

struct MemoryConnection {
    frames: mpsc::UnboundedReceiver<Frame>,
    controls: mpsc::UnboundedSender<ControlMessage>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        Ok(self.frames.recv().await)
    }

    async fn send(&mut self, message: ControlMessage) -> Result<(), TransportError> {
        self.controls
            .send(message)
            .map_err(|_| TransportError::Closed("loopback peer dropped".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_loopback_round_trip() {
        let transport = MemoryTransport::new();
        let mut conn = transport.connect("t").await.unwrap();
        let mut peer = transport.accept().await.unwrap();

        assert!(peer.emit(Frame::new("log:new", json!({"id": "1"}))));
        let frame = conn.recv().await.unwrap().unwrap();
        assert_eq!(frame.name, "log:new");

        conn.send(ControlMessage::Pause).await.unwrap();
        assert_eq!(peer.next_control().await, Some(ControlMessage::Pause));

        drop(peer);
        assert_eq!(conn.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_required_token() {
        let transport = MemoryTransport::new();
        transport.require_token("secret");

        let err = transport.connect("wrong").await.err().unwrap();
        assert!(err.is_auth());
        assert!(transport.connect("secret").await.is_ok());
        assert_eq!(transport.attempts(), 2);
    }

    #[tokio::test]
    async fn test_scripted_failures_then_accept() {
        let transport = MemoryTransport::new();
        transport.fail_next(TransportError::Refused("down".into()));

        assert!(transport.connect("t").await.is_err());
        assert!(transport.connect("t").await.is_ok());
    }

    #[tokio::test]
    async fn test_refuse_all_until_accept_all() {
        let transport = MemoryTransport::new();
        transport.refuse_all(TransportError::Handshake("503".into()));
        assert!(transport.connect("t").await.is_err());
        assert!(transport.connect("t").await.is_err());
        transport.accept_all();
        assert!(transport.connect("t").await.is_ok());
    }
}
