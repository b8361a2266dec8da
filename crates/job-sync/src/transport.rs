/// Transport seam between the connection manager and the wire
use async_trait::async_trait;
use futures::StreamExt;
use std::fmt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::{Result, SyncError};

/// Bearer credential presented on the handshake
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    token: String,
}

impl Credentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").field("token", &"<redacted>").finish()
    }
}

/// One open connection delivering text frames in arrival order
#[async_trait]
pub trait EventStream: Send {
    /// Next frame; `None` once the peer has gone away
    async fn next_frame(&mut self) -> Option<Result<String>>;

    /// Release the connection. Safe to call more than once.
    async fn close(&mut self);
}

/// Opens authenticated event-stream connections
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, credentials: &Credentials) -> Result<Box<dyn EventStream>>;
}

/// Event stream over a WebSocket
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, credentials: &Credentials) -> Result<Box<dyn EventStream>> {
        let mut request = self.url.as_str().into_client_request()?;
        if !credentials.token().is_empty() {
            let value = HeaderValue::from_str(&credentials.authorization_header())
                .map_err(|e| SyncError::Auth(format!("invalid credential: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (socket, response) = tokio_tungstenite::connect_async(request).await?;
        debug!(url = %self.url, status = %response.status(), "websocket handshake complete");

        Ok(Box::new(WsEventStream {
            socket,
            closed: false,
        }))
    }
}

struct WsEventStream {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    closed: bool,
}

#[async_trait]
impl EventStream for WsEventStream {
    async fn next_frame(&mut self) -> Option<Result<String>> {
        if self.closed {
            return None;
        }

        while let Some(message) = self.socket.next().await {
            match message {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => {
                    return Some(String::from_utf8(bytes).map_err(|e| {
                        SyncError::Protocol(format!("binary frame is not UTF-8: {e}"))
                    }))
                }
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "server closed event stream");
                    return None;
                }
                // Ping/pong are answered by tungstenite
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }

        None
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Err(e) = self.socket.close(None).await {
            debug!(error = %e, "websocket close handshake failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_are_redacted() {
        let credentials = Credentials::bearer("secret-token");
        assert_eq!(credentials.authorization_header(), "Bearer secret-token");
        assert!(!format!("{credentials:?}").contains("secret-token"));
    }

    #[tokio::test]
    async fn test_invalid_url_is_transport_error() {
        let transport = WebSocketTransport::new("not a url");
        let err = match transport.open(&Credentials::bearer("t")).await {
            Ok(_) => panic!("expected failure"),
            Err(e) => e,
        };
        assert!(matches!(err, SyncError::Transport(_)), "got {err:?}");
    }
}
