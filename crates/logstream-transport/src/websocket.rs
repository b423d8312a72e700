use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::{Connection, ControlMessage, Frame, Transport, TransportError};

/// WebSocket transport carrying JSON text frames
#[derive(Clone, Debug)]
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    /// Create a transport for a `ws://` endpoint
    ///
    /// `wss://` is refused up front: this build has no TLS backend.
    pub fn new(url: impl Into<String>) -> Result<Self, TransportError> {
        let url = url.into();
        if url.starts_with("wss://") {
            return Err(TransportError::InvalidEndpoint(format!(
                "{url}: TLS endpoints are not supported by this build"
            )));
        }
        if !url.starts_with("ws://") {
            return Err(TransportError::InvalidEndpoint(url));
        }
        Ok(Self { url })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, token: &str) -> Result<Box<dyn Connection>, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|_| TransportError::InvalidEndpoint(self.url.clone()))?;

        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| TransportError::Unauthorized("token is not a valid header value".into()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(handshake_error)?;
        debug!(url = %self.url, status = %response.status(), "websocket handshake complete");

        Ok(Box::new(WebSocketConnection { stream }))
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }
}

/// Map a handshake failure, separating credential rejection from the rest
fn handshake_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Http(response) => status_error(response.status()),
        tungstenite::Error::Io(e) => TransportError::Refused(e.to_string()),
        tungstenite::Error::Url(e) => TransportError::InvalidEndpoint(e.to_string()),
        other => TransportError::Handshake(other.to_string()),
    }
}

/// Map a non-101 handshake answer
fn status_error(status: StatusCode) -> TransportError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        TransportError::Unauthorized(format!("server answered {status}"))
    } else {
        TransportError::Handshake(format!("server answered {status}"))
    }
}

struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            let message = match self.stream.next().await {
                None => return Ok(None),
                Some(Err(
                    tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed,
                )) => return Ok(None),
                Some(Err(e)) => return Err(TransportError::Closed(e.to_string())),
                Some(Ok(message)) => message,
            };

            let text = match &message {
                Message::Text(text) => text.as_str(),
                Message::Binary(bytes) => match std::str::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!("dropping non-UTF-8 binary frame");
                        continue;
                    }
                },
                Message::Close(_) => return Ok(None),
                // tungstenite answers pings itself
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };

            match Frame::from_json(text) {
                Ok(frame) => return Ok(Some(frame)),
                Err(e) => warn!(error = %e, "dropping undecodable frame"),
            }
        }
    }

    async fn send(&mut self, message: ControlMessage) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(message.to_frame().to_json().into()))
            .await
            .map_err(|e| TransportError::Closed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    #[test]
    fn test_rejects_non_websocket_url() {
        assert!(matches!(
            WebSocketTransport::new("http://localhost:4000"),
            Err(TransportError::InvalidEndpoint(_))
        ));
        assert!(WebSocketTransport::new("ws://localhost:4000/stream").is_ok());
    }

    #[test]
    fn test_rejects_tls_url_without_tls_backend() {
        let err = WebSocketTransport::new("wss://logs.example.com/stream").unwrap_err();
        assert!(matches!(err, TransportError::InvalidEndpoint(_)));
        assert!(err.is_permanent());
    }

    #[test]
    fn test_status_mapping() {
        assert!(status_error(StatusCode::UNAUTHORIZED).is_auth());
        assert!(status_error(StatusCode::FORBIDDEN).is_auth());
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY),
            TransportError::Handshake(_)
        ));
    }

    /// Answer the first HTTP request on a fresh listener with `status_line`
    async fn http_server(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    return;
                }
                request.extend_from_slice(&chunk[..n]);
            }
            let response = format!("{status_line}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("ws://{addr}/stream")
    }

    #[tokio::test]
    async fn test_handshake_error_maps_unauthorized() {
        for status_line in ["HTTP/1.1 401 Unauthorized", "HTTP/1.1 403 Forbidden"] {
            let url = http_server(status_line).await;
            let err = WebSocketTransport::new(url)
                .unwrap()
                .connect("expired")
                .await
                .err()
                .unwrap();
            assert!(err.is_auth(), "{status_line} mapped to {err:?}");
        }

        let url = http_server("HTTP/1.1 503 Service Unavailable").await;
        let err = WebSocketTransport::new(url)
            .unwrap()
            .connect("token")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Handshake(_)));
    }

    #[tokio::test]
    async fn test_connect_refused_maps_to_refused() {
        // Port 9 (discard) is essentially never listening on loopback
        let transport = WebSocketTransport::new("ws://127.0.0.1:9/stream").unwrap();
        let err = transport.connect("token").await.err().unwrap();
        assert!(matches!(err, TransportError::Refused(_)));
    }

    #[tokio::test]
    async fn test_frames_pings_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen_auth = Arc::new(Mutex::new(None));

        let server = {
            let seen_auth = Arc::clone(&seen_auth);
            tokio::spawn(async move {
                let (socket, _) = listener.accept().await.unwrap();
                let record_auth = move |request: &Request, response: Response| {
                    *seen_auth.lock() = request
                        .headers()
                        .get(AUTHORIZATION)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    Ok::<_, ErrorResponse>(response)
                };
                let mut ws = tokio_tungstenite::accept_hdr_async(socket, record_auth)
                    .await
                    .unwrap();

                let log = r#"{"event":"log:new","data":{"id":"1"}}"#;
                ws.send(Message::Text(log.to_string().into())).await.unwrap();
                ws.send(Message::Ping(vec![1, 2, 3].into())).await.unwrap();
                ws.send(Message::Text("not json".to_string().into())).await.unwrap();
                ws.send(Message::Binary(r#"{"event":"alert:new"}"#.as_bytes().to_vec().into()))
                    .await
                    .unwrap();

                // Wait for the client's pause before closing
                let mut control = None;
                while let Some(Ok(message)) = ws.next().await {
                    if let Message::Text(text) = message {
                        control = Some(text.as_str().to_string());
                        break;
                    }
                }
                ws.send(Message::Close(None)).await.unwrap();
                while let Some(Ok(_)) = ws.next().await {}
                control
            })
        };

        let transport = WebSocketTransport::new(format!("ws://{addr}/stream")).unwrap();
        let mut connection = transport.connect("secret").await.unwrap();

        let first = connection.recv().await.unwrap().unwrap();
        assert_eq!(first.name, "log:new");
        // Ping and the undecodable text frame are skipped
        let second = connection.recv().await.unwrap().unwrap();
        assert_eq!(second.name, "alert:new");

        connection.send(ControlMessage::Pause).await.unwrap();
        assert!(connection.recv().await.unwrap().is_none());
        drop(connection);

        let control = server.await.unwrap();
        assert_eq!(control.as_deref(), Some(r#"{"event":"pause","data":null}"#));
        assert_eq!(seen_auth.lock().as_deref(), Some("Bearer secret"));
    }

    #[test]
    fn test_control_frame_shape() {
        assert_eq!(ControlMessage::Pause.to_frame().to_json(), r#"{"event":"pause","data":null}"#);
    }
}
