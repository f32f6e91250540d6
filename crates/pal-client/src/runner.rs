//! Subscription runner: one pub/sub client on one dedicated event loop.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tracing::{error, info, warn};

use pal_pubsub::{
    handler, observer, ClientOptions, NotificationHandler, ObserverRegistry, PubSubClient,
    PubSubTransport, Subscriptions,
};
use pal_topics::{directories_to_topics, topic_to_directory, TOPIC_WEBHOOK};

use crate::reconcile::Reconcile;
use crate::worker::LoopThread;
use crate::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

impl RunnerState {
    fn as_str(&self) -> &'static str {
        match self {
            RunnerState::NotStarted => "not started",
            RunnerState::Running => "running",
            RunnerState::Stopping => "stopping",
            RunnerState::Stopped => "stopped",
        }
    }
}

/// How notification topics map to refresh targets.
#[derive(Debug, Clone, Copy)]
pub enum TopicRouting {
    /// Resolve directory-derived topics to a targeted reconcile; the
    /// control topic and anything unrecognized falls back to a full one.
    Directories,
    /// Every notification triggers a full refresh (data topics).
    RefreshAll,
}

/// A long-running background process the orchestrator can sequence.
#[async_trait]
pub trait BackgroundRunner: Send + Sync {
    fn name(&self) -> &'static str;
    async fn start(&self) -> Result<(), ClientError>;
    async fn stop(&self) -> Result<(), ClientError>;
}

/// Owns exactly one transport client bound to one [`LoopThread`] and one
/// fixed topic set. Not reusable once stopped.
pub struct SubscriptionRunner {
    name: &'static str,
    transport: Arc<dyn PubSubTransport>,
    options: ClientOptions,
    topics: Vec<String>,
    routing: TopicRouting,
    reconciler: Arc<dyn Reconcile>,
    loop_thread: LoopThread,
    client: Arc<tokio::sync::Mutex<Option<Box<dyn PubSubClient>>>>,
    state: StdMutex<RunnerState>,
}

impl SubscriptionRunner {
    pub fn new(
        name: &'static str,
        transport: Arc<dyn PubSubTransport>,
        options: ClientOptions,
        topics: Vec<String>,
        routing: TopicRouting,
        reconciler: Arc<dyn Reconcile>,
    ) -> std::io::Result<Self> {
        Ok(Self {
            name,
            transport,
            options,
            topics,
            routing,
            reconciler,
            loop_thread: LoopThread::spawn(name)?,
            client: Arc::new(tokio::sync::Mutex::new(None)),
            state: StdMutex::new(RunnerState::NotStarted),
        })
    }

    /// Policy updater: subscribes to one topic per watched directory plus
    /// the webhook control topic.
    pub fn policy(
        transport: Arc<dyn PubSubTransport>,
        options: ClientOptions,
        directories: &[String],
        reconciler: Arc<dyn Reconcile>,
    ) -> std::io::Result<Self> {
        let mut topics = directories_to_topics(directories);
        topics.push(TOPIC_WEBHOOK.to_string());
        Self::new(
            "policy-updater",
            transport,
            options,
            topics,
            TopicRouting::Directories,
            reconciler,
        )
    }

    /// Data updater: subscribes to the configured raw data topics.
    pub fn data(
        transport: Arc<dyn PubSubTransport>,
        options: ClientOptions,
        data_topics: Vec<String>,
        reconciler: Arc<dyn Reconcile>,
    ) -> std::io::Result<Self> {
        Self::new(
            "data-updater",
            transport,
            options,
            data_topics,
            TopicRouting::RefreshAll,
            reconciler,
        )
    }

    pub fn state(&self) -> RunnerState {
        *self.state.lock().expect("runner state poisoned")
    }

    fn transition(
        &self,
        op: &'static str,
        from: RunnerState,
        to: RunnerState,
    ) -> Result<(), ClientError> {
        let mut state = self.state.lock().expect("runner state poisoned");
        if *state != from {
            return Err(ClientError::InvalidState {
                op,
                state: state.as_str(),
            });
        }
        *state = to;
        Ok(())
    }

    fn set_state(&self, to: RunnerState) {
        *self.state.lock().expect("runner state poisoned") = to;
    }

    fn notification_handler(&self) -> NotificationHandler {
        let name = self.name;
        let routing = self.routing;
        let reconciler = self.reconciler.clone();
        handler(move |topic, _payload| {
            let reconciler = reconciler.clone();
            async move {
                let directories = match routing {
                    TopicRouting::RefreshAll => None,
                    TopicRouting::Directories => {
                        if topic == TOPIC_WEBHOOK {
                            info!(updater = name, "webhook event; refreshing all directories");
                            None
                        } else if let Some(dir) = topic_to_directory(&topic) {
                            Some(vec![dir.to_string()])
                        } else {
                            // Never drop a notification we cannot place.
                            warn!(
                                updater = name,
                                %topic,
                                "notification on unrecognized topic; refreshing all directories"
                            );
                            None
                        }
                    }
                };
                if let Err(err) = reconciler.reconcile(directories.as_deref()).await {
                    error!(updater = name, %err, "reconcile failed; staying subscribed");
                }
            }
        })
    }

    fn observers(&self) -> ObserverRegistry {
        let mut observers = ObserverRegistry::new();
        let name = self.name;
        let reconciler = self.reconciler.clone();
        // Every (re)connection implies missed updates; resync everything.
        observers.on_connect(observer(move || {
            let reconciler = reconciler.clone();
            async move {
                info!(updater = name, "connected to server; running full resync");
                if let Err(err) = reconciler.reconcile(None).await {
                    error!(updater = name, %err, "full resync on connect failed");
                }
            }
        }));
        observers.on_disconnect(observer(move || async move {
            info!(updater = name, "disconnected from server");
        }));
        observers
    }
}

#[async_trait]
impl BackgroundRunner for SubscriptionRunner {
    fn name(&self) -> &'static str {
        self.name
    }

    /// Connect on the dedicated loop and wait until the subscription is
    /// live (including the initial full resync fired on connect).
    async fn start(&self) -> Result<(), ClientError> {
        self.transition("start", RunnerState::NotStarted, RunnerState::Running)?;

        let mut subscriptions = Subscriptions::new();
        let on_notification = self.notification_handler();
        for topic in &self.topics {
            subscriptions.subscribe(topic.clone(), on_notification.clone());
        }
        info!(updater = self.name, topics = ?self.topics, "subscribing to topics");

        let transport = self.transport.clone();
        let options = self.options.clone();
        let observers = self.observers();
        let client_slot = self.client.clone();
        let connected = self
            .loop_thread
            .run(async move {
                let client = transport.connect(options, subscriptions, observers).await?;
                *client_slot.lock().await = Some(client);
                Ok::<(), pal_pubsub::TransportError>(())
            })
            .await?;
        // A failed start leaves the runner in Running so stop() can still
        // reclaim the loop thread.
        connected.map_err(ClientError::from)
    }

    /// Disconnect the client on the loop, then tear the loop down. The
    /// ordering is load-bearing: tearing the loop down first could leave
    /// the disconnect suspended in a context nothing services anymore.
    async fn stop(&self) -> Result<(), ClientError> {
        self.transition("stop", RunnerState::Running, RunnerState::Stopping)?;
        info!(updater = self.name, "stopping updater");

        let name = self.name;
        let client_slot = self.client.clone();
        let disconnected = self.loop_thread.submit(async move {
            if let Some(client) = client_slot.lock().await.take() {
                if let Err(err) = client.disconnect().await {
                    warn!(updater = name, %err, "disconnect failed");
                }
            }
        });
        match disconnected {
            Ok(rx) => {
                let _ = rx.await;
            }
            Err(_) => warn!(updater = name, "loop already gone before disconnect"),
        }

        self.loop_thread.stop().await;
        self.set_state(RunnerState::Stopped);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pal_pubsub::LocalBroker;
    use pal_pubsub::Publisher;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingReconciler {
        calls: StdMutex<Vec<Option<Vec<String>>>>,
        fail: AtomicBool,
    }

    impl RecordingReconciler {
        fn calls(&self) -> Vec<Option<Vec<String>>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Reconcile for RecordingReconciler {
        async fn reconcile(&self, directories: Option<&[String]>) -> Result<(), ClientError> {
            self.calls
                .lock()
                .unwrap()
                .push(directories.map(|d| d.to_vec()));
            if self.fail.load(Ordering::SeqCst) {
                return Err(ClientError::WorkerGone);
            }
            Ok(())
        }
    }

    async fn wait_for_calls(rec: &RecordingReconciler, n: usize) {
        for _ in 0..100 {
            if rec.calls().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {n} reconcile calls, saw {:?}", rec.calls());
    }

    fn policy_runner(
        broker: &LocalBroker,
        reconciler: Arc<RecordingReconciler>,
    ) -> SubscriptionRunner {
        SubscriptionRunner::policy(
            Arc::new(broker.clone()),
            ClientOptions::new("local://"),
            &["authz".to_string(), "rbac".to_string()],
            reconciler,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn connect_triggers_exactly_one_full_resync() {
        let broker = LocalBroker::new(16);
        let rec = Arc::new(RecordingReconciler::default());
        let runner = policy_runner(&broker, rec.clone());

        runner.start().await.unwrap();
        assert_eq!(runner.state(), RunnerState::Running);
        wait_for_calls(&rec, 1).await;
        assert_eq!(rec.calls(), vec![None]);
        runner.stop().await.unwrap();
    }

    #[tokio::test]
    async fn directory_topic_reconciles_only_that_directory() {
        let broker = LocalBroker::new(16);
        let rec = Arc::new(RecordingReconciler::default());
        let runner = policy_runner(&broker, rec.clone());
        runner.start().await.unwrap();
        wait_for_calls(&rec, 1).await;

        broker.publish("policy:authz", None).await.unwrap();
        wait_for_calls(&rec, 2).await;
        assert_eq!(rec.calls()[1], Some(vec!["authz".to_string()]));
        runner.stop().await.unwrap();
    }

    #[tokio::test]
    async fn webhook_control_topic_triggers_full_resync() {
        let broker = LocalBroker::new(16);
        let rec = Arc::new(RecordingReconciler::default());
        let runner = policy_runner(&broker, rec.clone());
        runner.start().await.unwrap();
        wait_for_calls(&rec, 1).await;

        broker.publish(TOPIC_WEBHOOK, None).await.unwrap();
        wait_for_calls(&rec, 2).await;
        assert_eq!(rec.calls()[1], None);
        runner.stop().await.unwrap();
    }

    #[tokio::test]
    async fn unrecognized_topic_falls_back_to_full_resync() {
        let broker = LocalBroker::new(16);
        let rec = Arc::new(RecordingReconciler::default());
        // Subscribe to a topic outside the policy namespace on purpose.
        let runner = SubscriptionRunner::new(
            "policy-updater",
            Arc::new(broker.clone()),
            ClientOptions::new("local://"),
            vec!["data:misrouted".to_string()],
            TopicRouting::Directories,
            rec.clone(),
        )
        .unwrap();
        runner.start().await.unwrap();
        wait_for_calls(&rec, 1).await;

        broker.publish("data:misrouted", None).await.unwrap();
        wait_for_calls(&rec, 2).await;
        assert_eq!(rec.calls()[1], None);
        runner.stop().await.unwrap();
    }

    #[tokio::test]
    async fn reconcile_failure_keeps_the_runner_subscribed() {
        let broker = LocalBroker::new(16);
        let rec = Arc::new(RecordingReconciler::default());
        let runner = policy_runner(&broker, rec.clone());
        runner.start().await.unwrap();
        wait_for_calls(&rec, 1).await;

        rec.fail.store(true, Ordering::SeqCst);
        broker.publish("policy:authz", None).await.unwrap();
        wait_for_calls(&rec, 2).await;

        rec.fail.store(false, Ordering::SeqCst);
        broker.publish("policy:rbac", None).await.unwrap();
        wait_for_calls(&rec, 3).await;
        assert_eq!(runner.state(), RunnerState::Running);
        runner.stop().await.unwrap();
    }

    #[tokio::test]
    async fn data_runner_refreshes_everything_on_any_notification() {
        let broker = LocalBroker::new(16);
        let rec = Arc::new(RecordingReconciler::default());
        let runner = SubscriptionRunner::data(
            Arc::new(broker.clone()),
            ClientOptions::new("local://"),
            vec!["policy_data".to_string()],
            rec.clone(),
        )
        .unwrap();
        runner.start().await.unwrap();
        wait_for_calls(&rec, 1).await;

        broker
            .publish("policy_data", Some(serde_json::json!({"reason": "update"})))
            .await
            .unwrap();
        wait_for_calls(&rec, 2).await;
        assert_eq!(rec.calls(), vec![None, None]);
        runner.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_disconnects_before_tearing_down_the_loop() {
        struct SlowDisconnectClient {
            disconnected: Arc<AtomicBool>,
        }

        #[async_trait]
        impl pal_pubsub::PubSubClient for SlowDisconnectClient {
            async fn disconnect(&self) -> Result<(), pal_pubsub::TransportError> {
                tokio::time::sleep(Duration::from_millis(100)).await;
                self.disconnected.store(true, Ordering::SeqCst);
                Ok(())
            }
        }

        struct SlowDisconnectTransport {
            disconnected: Arc<AtomicBool>,
        }

        #[async_trait]
        impl PubSubTransport for SlowDisconnectTransport {
            async fn connect(
                &self,
                _options: ClientOptions,
                _subscriptions: Subscriptions,
                _observers: ObserverRegistry,
            ) -> Result<Box<dyn pal_pubsub::PubSubClient>, pal_pubsub::TransportError> {
                Ok(Box::new(SlowDisconnectClient {
                    disconnected: self.disconnected.clone(),
                }))
            }
        }

        let disconnected = Arc::new(AtomicBool::new(false));
        let rec = Arc::new(RecordingReconciler::default());
        let runner = SubscriptionRunner::new(
            "policy-updater",
            Arc::new(SlowDisconnectTransport {
                disconnected: disconnected.clone(),
            }),
            ClientOptions::new("local://"),
            vec!["policy:authz".to_string()],
            TopicRouting::Directories,
            rec,
        )
        .unwrap();
        runner.start().await.unwrap();

        runner.stop().await.unwrap();
        // The slow disconnect finished before the loop was torn down and
        // the runner reported stopped.
        assert!(disconnected.load(Ordering::SeqCst));
        assert_eq!(runner.state(), RunnerState::Stopped);
    }

    #[tokio::test]
    async fn stopped_runner_is_not_reusable() {
        let broker = LocalBroker::new(16);
        let rec = Arc::new(RecordingReconciler::default());
        let runner = policy_runner(&broker, rec.clone());
        runner.start().await.unwrap();
        runner.stop().await.unwrap();
        assert_eq!(runner.state(), RunnerState::Stopped);

        assert!(matches!(
            runner.start().await,
            Err(ClientError::InvalidState { op: "start", .. })
        ));
        assert!(matches!(
            runner.stop().await,
            Err(ClientError::InvalidState { op: "stop", .. })
        ));
    }

    #[tokio::test]
    async fn failed_start_still_allows_stop_to_reclaim_the_loop() {
        let broker = LocalBroker::rejecting(401);
        let rec = Arc::new(RecordingReconciler::default());
        let runner = policy_runner(&broker, rec.clone());
        let err = runner.start().await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(runner.state(), RunnerState::Running);
        runner.stop().await.unwrap();
        assert_eq!(runner.state(), RunnerState::Stopped);
    }
}
