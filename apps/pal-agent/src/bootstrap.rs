//! Wires config, store, fetcher, transport, and the orchestrator.

use std::sync::Arc;

use tracing::{error, warn};

use pal_client::engine::initial_start_callback;
use pal_client::fetcher::HttpPolicyFetcher;
use pal_client::reconcile::{DataReconciler, PolicyReconciler, Reconcile};
use pal_client::runner::BackgroundRunner;
use pal_client::{FatalSignal, Orchestrator, PalConfig, SubscriptionRunner};
use pal_pubsub::{ClientOptions, LocalBroker, PubSubTransport, Publisher};
use pal_store::{MemoryStore, PolicyStore};

#[derive(Clone)]
pub(crate) struct AppState {
    pub publisher: Arc<dyn Publisher>,
    pub webhook_secret: Option<String>,
    pub policy_repo_url: Option<String>,
}

pub(crate) struct BootstrapOutput {
    pub state: AppState,
    pub orchestrator: Orchestrator,
    pub fatal: FatalSignal,
}

pub(crate) fn build(config: &PalConfig) -> anyhow::Result<BootstrapOutput> {
    // Loopback broker: the webhook bridge publishes into the same process
    // the updaters subscribe in. A networked deployment swaps in a real
    // transport behind the same contract.
    let broker = LocalBroker::new(64);
    let transport: Arc<dyn PubSubTransport> = Arc::new(broker.clone());

    let store: Arc<dyn PolicyStore> = Arc::new(MemoryStore::new());
    let fetcher = Arc::new(HttpPolicyFetcher::new(
        config.server_url.clone(),
        config.client_token.clone(),
    ));

    let policy_reconciler = Arc::new(PolicyReconciler::new(
        fetcher.clone(),
        store.clone(),
        config.all_directories(),
    ));
    let data_reconciler = Arc::new(DataReconciler::new(
        fetcher,
        store,
        config.data_root.clone(),
    ));

    let options = ClientOptions::new(config.server_url.clone())
        .with_token(config.client_token.clone())
        .with_keep_alive(config.keep_alive);

    let runners: Vec<Arc<dyn BackgroundRunner>> = vec![
        Arc::new(SubscriptionRunner::policy(
            transport.clone(),
            options.clone(),
            &config.all_directories(),
            policy_reconciler.clone(),
        )?),
        Arc::new(SubscriptionRunner::data(
            transport,
            options,
            config.data_topics.clone(),
            data_reconciler.clone(),
        )?),
    ];

    if config.inline_engine {
        warn!("inline engine requested but no engine runner is built in; store is managed externally");
    }

    let rehydration_callbacks = vec![
        rehydration("policy resync", policy_reconciler),
        rehydration("base data refresh", data_reconciler),
    ];
    let (orchestrator, fatal) = Orchestrator::new(
        runners,
        None,
        rehydration_callbacks,
        config.shutdown_timeout,
    );

    Ok(BootstrapOutput {
        state: AppState {
            publisher: Arc::new(broker),
            webhook_secret: env_string("PAL_WEBHOOK_SECRET"),
            policy_repo_url: env_string("PAL_POLICY_REPO_URL"),
        },
        orchestrator,
        fatal,
    })
}

fn rehydration(
    what: &'static str,
    reconciler: Arc<dyn Reconcile>,
) -> pal_client::engine::InitialStartCallback {
    initial_start_callback(move || {
        let reconciler = reconciler.clone();
        async move {
            if let Err(err) = reconciler.reconcile(None).await {
                error!(%err, "engine rehydration {what} failed");
            }
        }
    })
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
