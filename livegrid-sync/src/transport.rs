//! Connection seam shared by every resilient subscription.
//!
//! A [`Connector`] produces fresh [`Connection`]s; a connection yields
//! inbound payloads until it fails or closes. The WebSocket implementation
//! is used by the client feed and the relay transport; tests script their
//! own.

use futures_util::future::{BoxFuture, FutureExt};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("WebSocket error: {0}")]
    WebSocket(String),
    #[error("Connection closed")]
    Closed,
}

impl From<tungstenite::Error> for TransportError {
    fn from(e: tungstenite::Error) -> Self {
        TransportError::WebSocket(e.to_string())
    }
}

/// An established, receive-side connection.
pub trait Connection: Send {
    /// Next inbound payload. `None` means the peer closed the connection.
    fn recv(&mut self) -> BoxFuture<'_, Option<Result<Vec<u8>, TransportError>>>;

    /// Unsubscribe (if the protocol has such a step) and release the connection.
    fn close(self: Box<Self>) -> BoxFuture<'static, ()>;
}

/// Factory for connections, invoked on every (re)connect attempt.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn Connection>, TransportError>>;
}

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket connection, optionally sending a farewell frame before closing.
pub struct WsConnection {
    stream: WsStream,
    goodbye: Option<Message>,
}

impl WsConnection {
    pub async fn open(url: &str) -> Result<Self, TransportError> {
        let (stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(Self {
            stream,
            goodbye: None,
        })
    }

    pub fn with_goodbye(mut self, goodbye: Message) -> Self {
        self.goodbye = Some(goodbye);
        self
    }

    pub async fn send(&mut self, msg: Message) -> Result<(), TransportError> {
        self.stream.send(msg).await?;
        Ok(())
    }
}

impl Connection for WsConnection {
    fn recv(&mut self) -> BoxFuture<'_, Option<Result<Vec<u8>, TransportError>>> {
        async move {
            loop {
                match self.stream.next().await? {
                    Ok(Message::Text(text)) => return Some(Ok(text.as_bytes().to_vec())),
                    Ok(Message::Binary(data)) => return Some(Ok(data.to_vec())),
                    Ok(Message::Close(_)) => return None,
                    // Ping/pong are answered by tungstenite itself
                    Ok(_) => continue,
                    Err(e) => return Some(Err(e.into())),
                }
            }
        }
        .boxed()
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        let WsConnection {
            mut stream,
            goodbye,
        } = *self;
        async move {
            if let Some(goodbye) = goodbye {
                if let Err(e) = stream.send(goodbye).await {
                    log::debug!("Failed to send goodbye frame: {e}");
                }
            }
            let _ = stream.close(None).await;
        }
        .boxed()
    }
}

/// Opens a [`WsConnection`] per attempt, sending `hello` right after the
/// handshake and `goodbye` on close.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    hello: Option<Message>,
    goodbye: Option<Message>,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            hello: None,
            goodbye: None,
        }
    }

    pub fn with_handshake(mut self, hello: Message, goodbye: Message) -> Self {
        self.hello = Some(hello);
        self.goodbye = Some(goodbye);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WsConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn Connection>, TransportError>> {
        async move {
            let mut conn = WsConnection::open(&self.url).await?;
            if let Some(hello) = self.hello.clone() {
                conn.send(hello).await?;
            }
            if let Some(goodbye) = self.goodbye.clone() {
                conn = conn.with_goodbye(goodbye);
            }
            Ok(Box::new(conn) as Box<dyn Connection>)
        }
        .boxed()
    }
}
