//! Inline engine-runner contract.
//!
//! When the policy engine runs inside the same deployment unit, the
//! orchestrator gates updater startup on the engine reporting ready and
//! wires rehydration callbacks into its first successful start. How the
//! engine process is launched and health-probed is the implementation's
//! business; the engine implementation must invoke the registered
//! callbacks, in registration order, every time the store comes up empty
//! (first start and every restart).

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::ClientError;

/// Callback fired after the engine's first successful (re)start,
/// typically a forced policy resync or a base-data refresh.
pub type InitialStartCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as an [`InitialStartCallback`].
pub fn initial_start_callback<F, Fut>(f: F) -> InitialStartCallback
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

#[async_trait]
pub trait EngineRunner: Send + Sync {
    /// Register a rehydration callback. Must be called before `start`.
    fn register_initial_start_callback(&self, callback: InitialStartCallback);

    async fn start(&self) -> Result<(), ClientError>;

    /// Resolve once the engine accepts queries. Dependent runners are
    /// only launched after this returns.
    async fn wait_ready(&self) -> Result<(), ClientError>;

    async fn stop(&self) -> Result<(), ClientError>;
}
