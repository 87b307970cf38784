//! Relay transport talking to a [`RelayServer`](super::RelayServer) over
//! WebSocket.
//!
//! Publishing uses one lazily opened connection owned by a writer task;
//! when it dies the next publish opens a new one. Each listener connection
//! sends `Listen` right after the handshake and `Unlisten` before closing.

use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;

use super::{RelayError, RelayTransport};
use crate::protocol::RelayFrame;
use crate::transport::{Connection, Connector, TransportError, WsConnector};

pub struct WsRelayTransport {
    url: String,
    publisher: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

impl WsRelayTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            publisher: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn open_publisher(&self) -> Result<mpsc::UnboundedSender<Message>, TransportError> {
        let (mut ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let url = self.url.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = rx.recv() => match outgoing {
                        Some(msg) => {
                            if let Err(e) = ws.send(msg).await {
                                log::warn!("Relay publisher to {url} failed: {e}");
                                break;
                            }
                        }
                        None => {
                            let _ = ws.close(None).await;
                            break;
                        }
                    },
                    incoming = ws.next() => match incoming {
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::warn!("Relay publisher to {url} lost: {e}");
                            break;
                        }
                        None => break,
                    },
                }
            }
            log::debug!("Relay publisher to {url} closed");
        });

        log::info!("Relay publisher connected to {}", self.url);
        Ok(tx)
    }
}

impl RelayTransport for WsRelayTransport {
    fn listener(&self, channel: &str) -> Arc<dyn Connector> {
        Arc::new(WsListenConnector {
            url: self.url.clone(),
            channel: channel.to_string(),
        })
    }

    fn publish(&self, _channel: &str, frame: Vec<u8>) -> BoxFuture<'_, Result<(), RelayError>> {
        async move {
            let mut publisher = self.publisher.lock().await;
            let mut msg = Message::Binary(frame.into());
            if let Some(tx) = publisher.as_ref() {
                match tx.send(msg) {
                    Ok(()) => return Ok(()),
                    // Writer task gone; reconnect below
                    Err(mpsc::error::SendError(returned)) => msg = returned,
                }
            }

            let tx = self.open_publisher().await?;
            tx.send(msg).map_err(|_| TransportError::Closed)?;
            *publisher = Some(tx);
            Ok(())
        }
        .boxed()
    }
}

struct WsListenConnector {
    url: String,
    channel: String,
}

impl Connector for WsListenConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn Connection>, TransportError>> {
        async move {
            let encode = |frame: RelayFrame| {
                frame
                    .encode()
                    .map(|bytes| Message::Binary(bytes.into()))
                    .map_err(|e| TransportError::Connect(e.to_string()))
            };
            let listen = encode(RelayFrame::listen(&self.channel))?;
            let unlisten = encode(RelayFrame::unlisten(&self.channel))?;

            let connector = WsConnector::new(self.url.as_str()).with_handshake(listen, unlisten);
            connector.connect().await
        }
        .boxed()
    }
}
