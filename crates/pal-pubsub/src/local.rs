//! In-process transport backed by a broadcast channel.
//!
//! Used by tests and by the agent's loopback mode, where the webhook
//! bridge and the updaters share one process. Delivery is in publish
//! order per client; a client that cannot keep up drops its subscription
//! and observes `Disconnected`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, Notify};
use tracing::warn;

use crate::{
    ClientOptions, ConnectionEvent, ObserverRegistry, PubSubClient, PubSubTransport, Publisher,
    Subscriptions, TransportError,
};

#[derive(Debug, Clone)]
struct Message {
    topic: String,
    payload: Option<Value>,
}

/// Single-process broker. Cloning shares the underlying channel.
#[derive(Clone)]
pub struct LocalBroker {
    tx: broadcast::Sender<Message>,
    reject_status: Option<u16>,
}

impl LocalBroker {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            tx,
            reject_status: None,
        }
    }

    /// Broker that refuses every handshake with `status`. Test hook for
    /// the fatal-startup path.
    pub fn rejecting(status: u16) -> Self {
        let mut broker = Self::new(8);
        broker.reject_status = Some(status);
        broker
    }
}

struct LocalClient {
    shutdown: Arc<Notify>,
    observers: ObserverRegistry,
    disconnected: Arc<tokio::sync::Mutex<bool>>,
}

#[async_trait]
impl PubSubTransport for LocalBroker {
    async fn connect(
        &self,
        _options: ClientOptions,
        subscriptions: Subscriptions,
        observers: ObserverRegistry,
    ) -> Result<Box<dyn PubSubClient>, TransportError> {
        if let Some(status) = self.reject_status {
            return Err(TransportError::HandshakeRejected { status });
        }

        let mut rx = self.tx.subscribe();
        let shutdown = Arc::new(Notify::new());
        let pump_shutdown = shutdown.clone();
        // Handlers for one client run one at a time, in arrival order.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_shutdown.notified() => break,
                    msg = rx.recv() => match msg {
                        Ok(msg) => subscriptions.dispatch(&msg.topic, msg.payload.as_ref()).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "local broker subscriber lagged; notifications dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        observers.fire(ConnectionEvent::Connected).await;
        Ok(Box::new(LocalClient {
            shutdown,
            observers,
            disconnected: Arc::new(tokio::sync::Mutex::new(false)),
        }))
    }
}

#[async_trait]
impl PubSubClient for LocalClient {
    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut done = self.disconnected.lock().await;
        if *done {
            return Ok(());
        }
        *done = true;
        // notify_one stores a permit, so the pump sees the shutdown even
        // if it is mid-dispatch when we fire.
        self.shutdown.notify_one();
        self.observers.fire(ConnectionEvent::Disconnected).await;
        Ok(())
    }
}

#[async_trait]
impl Publisher for LocalBroker {
    async fn publish(&self, topic: &str, payload: Option<Value>) -> Result<(), TransportError> {
        self.tx
            .send(Message {
                topic: topic.to_string(),
                payload,
            })
            .map(|_| ())
            .map_err(|_| TransportError::ConnectionClosed)
    }
}
