//! Push transport seam.
//!
//! The channel only needs text frames in both directions plus a way to tell a
//! clean close from a dropped stream. [`WsTransport`] provides that over
//! `tokio-tungstenite`; tests plug in their own.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace};

use crate::config::install_rustls_provider;
use crate::error::{ClientError, Result};

/// A frame received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Text(String),
    /// The server closed the connection with a close frame.
    Close(Option<String>),
    /// Control or binary frames the channel does not interpret.
    Other,
}

#[async_trait]
pub trait PushConnection: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Next frame. `None` means the stream ended without a close frame.
    ///
    /// Must be cancel safe.
    async fn next(&mut self) -> Option<Result<Incoming>>;

    /// Keep-alive ping.
    async fn ping(&mut self) -> Result<()>;

    /// Close cleanly.
    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn PushConnection>>;
}

/// WebSocket transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsTransport;

#[async_trait]
impl PushTransport for WsTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn PushConnection>> {
        install_rustls_provider();
        let (stream, response) = connect_async(url)
            .await
            .map_err(|e| ClientError::websocket(format!("connect {url}: {e}")))?;
        debug!(status = %response.status(), "WebSocket upgraded");
        Ok(Box::new(WsConnection { stream }))
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl PushConnection for WsConnection {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.stream
            .send(Message::text(text))
            .await
            .map_err(|e| ClientError::websocket(e.to_string()))
    }

    async fn next(&mut self) -> Option<Result<Incoming>> {
        let message = match self.stream.next().await? {
            Ok(message) => message,
            Err(e) => return Some(Err(ClientError::websocket(e.to_string()))),
        };

        let incoming = match message {
            Message::Text(text) => Incoming::Text(text.as_str().to_owned()),
            Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                Ok(text) => Incoming::Text(text),
                Err(_) => Incoming::Other,
            },
            Message::Close(frame) => {
                Incoming::Close(frame.map(|f| f.reason.as_str().to_owned()))
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {
                trace!("Control frame");
                Incoming::Other
            }
        };
        Some(Ok(incoming))
    }

    async fn ping(&mut self) -> Result<()> {
        self.stream
            .send(Message::Ping(Default::default()))
            .await
            .map_err(|e| ClientError::websocket(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.stream
            .close(None)
            .await
            .map_err(|e| ClientError::websocket(e.to_string()))
    }
}
