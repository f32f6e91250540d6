//! Observable surface of the pub/sub transport.
//!
//! The wire protocol and reconnection mechanics live in concrete
//! transports; this crate pins down the contract the sync engine relies
//! on: topic subscriptions are fixed at connect time, connection edges are
//! delivered through an ordered observer registry, and handshake failures
//! are distinguishable from recoverable transport errors.

mod local;

pub use local::LocalBroker;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The server refused the initial handshake. This is fatal: it will
    /// not self-heal and must be escalated rather than retried.
    #[error("handshake rejected by server (status {status})")]
    HandshakeRejected { status: u16 },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("transport failure: {0}")]
    Transport(String),
}

impl TransportError {
    /// Fatal errors indicate a configuration or authorization problem the
    /// client cannot recover from on its own.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::HandshakeRejected { .. })
    }
}

/// Connection parameters handed to a transport at connect time.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_url: String,
    /// Optional bearer token; `None` means no authorization header is sent.
    pub auth_token: Option<String>,
    /// Keep-alive interval for the transport to honor on the wire.
    pub keep_alive: Duration,
}

impl ClientOptions {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            auth_token: None,
            keep_alive: Duration::from_secs(0),
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }

    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive = interval;
        self
    }
}

/// Async callback invoked with the topic and an optional payload.
pub type NotificationHandler =
    Arc<dyn Fn(String, Option<Value>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Async callback invoked on a connection edge.
pub type EventObserver = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`NotificationHandler`].
pub fn handler<F, Fut>(f: F) -> NotificationHandler
where
    F: Fn(String, Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |topic, payload| Box::pin(f(topic, payload)))
}

/// Wrap an async closure as an [`EventObserver`].
pub fn observer<F, Fut>(f: F) -> EventObserver
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
}

/// Ordered registry of connection-edge observers.
///
/// Observers fire sequentially in registration order, one event at a
/// time; an observer's future completes before the next one starts.
#[derive(Clone, Default)]
pub struct ObserverRegistry {
    on_connect: Vec<EventObserver>,
    on_disconnect: Vec<EventObserver>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connect(&mut self, obs: EventObserver) -> &mut Self {
        self.on_connect.push(obs);
        self
    }

    pub fn on_disconnect(&mut self, obs: EventObserver) -> &mut Self {
        self.on_disconnect.push(obs);
        self
    }

    pub async fn fire(&self, event: ConnectionEvent) {
        let list = match event {
            ConnectionEvent::Connected => &self.on_connect,
            ConnectionEvent::Disconnected => &self.on_disconnect,
        };
        for obs in list {
            obs().await;
        }
    }
}

/// Fixed topic-to-handler map, set once per client and immutable for its
/// lifetime. Registration order is preserved; when several handlers are
/// registered for one topic they run sequentially in that order.
#[derive(Clone, Default)]
pub struct Subscriptions {
    entries: Vec<(String, NotificationHandler)>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, topic: impl Into<String>, handler: NotificationHandler) -> &mut Self {
        self.entries.push((topic.into(), handler));
        self
    }

    pub fn topics(&self) -> Vec<&str> {
        self.entries.iter().map(|(t, _)| t.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deliver one notification to every handler registered for `topic`.
    pub async fn dispatch(&self, topic: &str, payload: Option<&Value>) {
        for (t, h) in &self.entries {
            if t == topic {
                h(topic.to_string(), payload.cloned()).await;
            }
        }
    }
}

/// Builds one live client per call. Transports own reconnection; every
/// successful (re)connection must fire the `Connected` observers.
#[async_trait]
pub trait PubSubTransport: Send + Sync + 'static {
    async fn connect(
        &self,
        options: ClientOptions,
        subscriptions: Subscriptions,
        observers: ObserverRegistry,
    ) -> Result<Box<dyn PubSubClient>, TransportError>;
}

/// Handle to one live connection.
#[async_trait]
pub trait PubSubClient: Send + Sync {
    /// Close the connection, firing the `Disconnected` observers. Safe to
    /// call more than once.
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Publishing side of the contract, used by the webhook bridge.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Option<Value>) -> Result<(), TransportError>;
}
