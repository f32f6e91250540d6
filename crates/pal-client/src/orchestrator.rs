//! Background task orchestration: dependency-ordered startup, bounded
//! graceful shutdown, and fatal-failure escalation.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::engine::{EngineRunner, InitialStartCallback};
use crate::runner::BackgroundRunner;
use crate::ClientError;

/// Resolves when the orchestrator declares the process unrecoverable.
///
/// This replaces self-delivered termination signals: the host selects on
/// it next to SIGINT/SIGTERM and runs the normal shutdown path, then
/// exits nonzero so the supervisor restarts the process.
pub struct FatalSignal {
    rx: watch::Receiver<Option<String>>,
}

impl FatalSignal {
    /// Wait for a fatal condition; never resolves if none occurs.
    pub async fn wait(mut self) -> String {
        loop {
            if let Some(reason) = self.rx.borrow().clone() {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                // Orchestrator dropped without declaring a failure.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Composes the updaters and an optional inline engine runner.
pub struct Orchestrator {
    engine: Option<Arc<dyn EngineRunner>>,
    rehydration_callbacks: Vec<InitialStartCallback>,
    runners: Vec<Arc<dyn BackgroundRunner>>,
    shutdown_timeout: Duration,
    fatal_tx: watch::Sender<Option<String>>,
}

impl Orchestrator {
    pub fn new(
        runners: Vec<Arc<dyn BackgroundRunner>>,
        engine: Option<Arc<dyn EngineRunner>>,
        rehydration_callbacks: Vec<InitialStartCallback>,
        shutdown_timeout: Duration,
    ) -> (Self, FatalSignal) {
        let (fatal_tx, fatal_rx) = watch::channel(None);
        (
            Self {
                engine,
                rehydration_callbacks,
                runners,
                shutdown_timeout,
                fatal_tx,
            },
            FatalSignal { rx: fatal_rx },
        )
    }

    /// Launch the background processes.
    ///
    /// With an inline engine the updaters wait for its readiness gate;
    /// without one the store is managed externally and they launch
    /// immediately. Runners start concurrently; the first error is
    /// surfaced. A fatal startup error (initial handshake rejected) is
    /// additionally escalated through the [`FatalSignal`] — a client that
    /// cannot establish its very first connection has a configuration or
    /// authorization problem a supervised restart must fix.
    pub async fn start(&self) -> Result<(), ClientError> {
        if let Some(engine) = &self.engine {
            for callback in &self.rehydration_callbacks {
                engine.register_initial_start_callback(callback.clone());
            }
            info!("starting inline engine runner");
            engine.start().await?;
            engine.wait_ready().await?;
            info!("inline engine ready; launching updaters");
        }

        let launches = self.runners.iter().map(|runner| async move {
            let outcome = runner.start().await;
            (runner.name(), outcome)
        });
        let mut first_error: Option<ClientError> = None;
        for (name, outcome) in join_all(launches).await {
            if let Err(err) = outcome {
                error!(runner = name, %err, "failed to launch background runner");
                if err.is_fatal() {
                    self.fatal_tx.send_replace(Some(format!("{name}: {err}")));
                }
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => {
                info!(runners = self.runners.len(), "background runners launched");
                Ok(())
            }
        }
    }

    /// Stop everything, best-effort, bounded by the shutdown timeout. A
    /// hung disconnect must never keep the supervisor from reclaiming the
    /// process, so on timeout we log and let the process exit anyway.
    pub async fn shutdown(&self) {
        info!("stopping background tasks");
        if let Some(engine) = &self.engine {
            if let Err(err) = engine.stop().await {
                warn!(%err, "inline engine stop failed");
            }
        }

        let stops = join_all(self.runners.iter().map(|runner| async move {
            if let Err(err) = runner.stop().await {
                warn!(runner = runner.name(), %err, "runner stop failed");
            }
        }));
        if tokio::time::timeout(self.shutdown_timeout, stops)
            .await
            .is_err()
        {
            warn!(
                timeout_secs = self.shutdown_timeout.as_secs(),
                "timed out waiting for updaters to disconnect; exiting anyway"
            );
        }
    }
}
