//! Event session transport.
//!
//! The push pipeline only needs text frames in and a way to close, so the
//! websocket is hidden behind [`EventTransport`] and [`Dialer`]. Tests plug
//! in channel-backed fakes.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// Default event session endpoint.
pub const DEFAULT_ENDPOINT: &str = "wss://eventsub.wss.twitch.tv/ws";

/// Time allowed for TCP + TLS + websocket handshake.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("dial timed out after {0:?}")]
    DialTimeout(Duration),

    #[error("no frame within read deadline of {0:?}")]
    ReadTimeout(Duration),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("non-UTF-8 binary frame")]
    InvalidFrame,
}

/// An open event session connection.
#[async_trait]
pub trait EventTransport: Send {
    /// Waits up to `deadline` for the next text frame.
    ///
    /// Returns `Ok(None)` when the remote side closed the connection.
    async fn next_frame(&mut self, deadline: Duration) -> Result<Option<String>, TransportError>;

    /// Closes the connection. Errors are ignored.
    async fn close(&mut self);
}

/// Opens event session connections.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, url: &str) -> Result<Box<dyn EventTransport>, TransportError>;
}

// ============================================================================
// WebSocket implementation
// ============================================================================

/// Dials websocket connections with a handshake timeout.
#[derive(Debug, Clone)]
pub struct WsDialer {
    dial_timeout: Duration,
}

impl WsDialer {
    pub fn new() -> Self {
        Self {
            dial_timeout: DIAL_TIMEOUT,
        }
    }
}

impl Default for WsDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self, url: &str) -> Result<Box<dyn EventTransport>, TransportError> {
        let (stream, response) = timeout(self.dial_timeout, connect_async(url))
            .await
            .map_err(|_| TransportError::DialTimeout(self.dial_timeout))??;

        debug!(url, status = %response.status(), "Websocket connected");
        Ok(Box::new(WsTransport { stream }))
    }
}

pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl EventTransport for WsTransport {
    async fn next_frame(&mut self, deadline: Duration) -> Result<Option<String>, TransportError> {
        loop {
            let next = timeout(deadline, self.stream.next())
                .await
                .map_err(|_| TransportError::ReadTimeout(deadline))?;

            match next {
                None => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_owned())),
                Some(Ok(Message::Binary(bin))) => {
                    return String::from_utf8(bin.to_vec())
                        .map(Some)
                        .map_err(|_| TransportError::InvalidFrame);
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Websocket close frame received");
                    return Ok(None);
                }
                // Pings are answered by tungstenite on the next read
                Some(Ok(_)) => {}
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "Websocket close failed");
        }
    }
}
