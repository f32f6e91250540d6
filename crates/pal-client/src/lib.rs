//! Update-propagation and lifecycle-orchestration engine.
//!
//! Keeps a local policy store synchronized with a central distribution
//! server: each updater owns one persistent pub/sub subscription on a
//! dedicated event loop, reconciles the store on notifications, and falls
//! back to a full resync on every (re)connection. The orchestrator
//! sequences startup and bounded graceful shutdown of the updaters and an
//! optional inline engine runner.

pub mod config;
pub mod engine;
pub mod fetcher;
pub mod orchestrator;
pub mod reconcile;
pub mod runner;
pub mod worker;

mod error;

pub use config::PalConfig;
pub use error::ClientError;
pub use orchestrator::{FatalSignal, Orchestrator};
pub use runner::{BackgroundRunner, SubscriptionRunner};
