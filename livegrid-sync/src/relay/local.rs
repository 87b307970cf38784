//! In-process relay medium for nodes sharing one process (tests, embedded
//! multi-node setups).
//!
//! `sever()` drops every open listener connection and `set_available(false)`
//! refuses new ones, which lets the reconnect path be exercised without
//! sockets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::{BoxFuture, FutureExt};
use tokio::sync::{broadcast, watch};

use super::{RelayError, RelayTransport};
use crate::transport::{Connection, Connector, TransportError};

type Frame = Arc<Vec<u8>>;

struct BusInner {
    channels: Mutex<HashMap<String, broadcast::Sender<Frame>>>,
    capacity: usize,
    epoch: watch::Sender<u64>,
    available: AtomicBool,
}

impl BusInner {
    fn sender(&self, channel: &str) -> broadcast::Sender<Frame> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

#[derive(Clone)]
pub struct LocalBus {
    inner: Arc<BusInner>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            inner: Arc::new(BusInner {
                channels: Mutex::new(HashMap::new()),
                capacity: capacity.max(1),
                epoch,
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Break every open listener connection.
    pub fn sever(&self) {
        self.inner.epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Accept (`true`) or refuse (`false`) new connections and publishes.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    pub fn listener_count(&self, channel: &str) -> usize {
        self.inner.sender(channel).receiver_count()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl RelayTransport for LocalBus {
    fn listener(&self, channel: &str) -> Arc<dyn Connector> {
        Arc::new(LocalListener {
            inner: self.inner.clone(),
            channel: channel.to_string(),
        })
    }

    fn publish(&self, channel: &str, frame: Vec<u8>) -> BoxFuture<'_, Result<(), RelayError>> {
        let result = if self.inner.available.load(Ordering::SeqCst) {
            // No listeners is not an error
            let _ = self.inner.sender(channel).send(Arc::new(frame));
            Ok(())
        } else {
            Err(TransportError::Closed.into())
        };
        futures_util::future::ready(result).boxed()
    }
}

struct LocalListener {
    inner: Arc<BusInner>,
    channel: String,
}

impl Connector for LocalListener {
    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn Connection>, TransportError>> {
        let result = if self.inner.available.load(Ordering::SeqCst) {
            Ok(Box::new(LocalConnection {
                rx: self.inner.sender(&self.channel).subscribe(),
                epoch: self.inner.epoch.subscribe(),
            }) as Box<dyn Connection>)
        } else {
            Err(TransportError::Connect("local bus unavailable".into()))
        };
        futures_util::future::ready(result).boxed()
    }
}

struct LocalConnection {
    rx: broadcast::Receiver<Frame>,
    epoch: watch::Receiver<u64>,
}

impl Connection for LocalConnection {
    fn recv(&mut self) -> BoxFuture<'_, Option<Result<Vec<u8>, TransportError>>> {
        async move {
            loop {
                tokio::select! {
                    _ = self.epoch.changed() => return Some(Err(TransportError::Closed)),
                    frame = self.rx.recv() => match frame {
                        Ok(frame) => return Some(Ok(frame.as_ref().clone())),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Local relay listener lagged by {n} frames");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    },
                }
            }
        }
        .boxed()
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        futures_util::future::ready(()).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_publish_reaches_every_listener() {
        let bus = LocalBus::default();
        let mut a = bus.listener("items").connect().await.unwrap();
        let mut b = bus.listener("items").connect().await.unwrap();
        let mut other = bus.listener("orders").connect().await.unwrap();
        assert_eq!(bus.listener_count("items"), 2);

        bus.publish("items", vec![1, 2, 3]).await.unwrap();

        assert_eq!(a.recv().await.unwrap().unwrap(), vec![1, 2, 3]);
        assert_eq!(b.recv().await.unwrap().unwrap(), vec![1, 2, 3]);
        assert!(timeout(Duration::from_millis(50), other.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_sever_breaks_connections() {
        let bus = LocalBus::default();
        let mut conn = bus.listener("items").connect().await.unwrap();
        bus.sever();
        assert_eq!(
            conn.recv().await.unwrap().unwrap_err(),
            TransportError::Closed
        );

        // Connections made after the sever are unaffected
        let mut fresh = bus.listener("items").connect().await.unwrap();
        bus.publish("items", vec![9]).await.unwrap();
        assert_eq!(fresh.recv().await.unwrap().unwrap(), vec![9]);
    }

    #[tokio::test]
    async fn test_unavailable_bus_refuses() {
        let bus = LocalBus::default();
        bus.set_available(false);
        assert!(bus.listener("items").connect().await.is_err());
        assert!(bus.publish("items", vec![1]).await.is_err());

        bus.set_available(true);
        assert!(bus.listener("items").connect().await.is_ok());
    }
}
