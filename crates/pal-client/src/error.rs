use pal_pubsub::TransportError;
use pal_store::StoreError;

use crate::fetcher::FetchError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid runner state: {op} while {state}")]
    InvalidState { op: &'static str, state: &'static str },
    #[error("worker loop terminated")]
    WorkerGone,
    #[error("engine runner failed: {0}")]
    Engine(String),
}

impl ClientError {
    /// Fatal errors must be escalated to process termination instead of
    /// being retried; everything else is recoverable in place.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClientError::Transport(err) if err.is_fatal())
    }
}
