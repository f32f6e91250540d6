//! Dedicated event loop on its own OS thread.
//!
//! Each subscription runner owns one [`LoopThread`] so a stalled pub/sub
//! operation can never starve the host runtime, and vice versa. Work is
//! handed across threads through a channel into the loop; nothing ever
//! calls into the loop's tasks directly from a foreign thread.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::ClientError;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A single-threaded tokio runtime driven by a dedicated thread.
///
/// Futures submitted with [`submit`](LoopThread::submit) are spawned onto
/// the loop and run concurrently there. [`stop`](LoopThread::stop) closes
/// the intake and joins the thread; tasks still pending at that point are
/// dropped with the runtime.
pub struct LoopThread {
    name: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    join: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl LoopThread {
    pub fn spawn(name: impl Into<String>) -> std::io::Result<Self> {
        let name = name.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let thread_name = name.clone();
        let join = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(err) => {
                        error!(loop_thread = %thread_name, %err, "failed to build loop runtime");
                        return;
                    }
                };
                rt.block_on(async move {
                    while let Some(job) = rx.recv().await {
                        tokio::spawn(job);
                    }
                });
                debug!(loop_thread = %thread_name, "loop drained; runtime shutting down");
            })?;
        Ok(Self {
            name,
            tx: Mutex::new(Some(tx)),
            join: Mutex::new(Some(join)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schedule `fut` onto the loop; the returned receiver resolves with
    /// its output (or errs if the loop goes away first).
    pub fn submit<F, T>(&self, fut: F) -> Result<oneshot::Receiver<T>, ClientError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let _ = done_tx.send(fut.await);
        });
        let tx = self.tx.lock().expect("loop intake poisoned");
        match tx.as_ref() {
            Some(tx) => tx.send(job).map_err(|_| ClientError::WorkerGone)?,
            None => return Err(ClientError::WorkerGone),
        }
        Ok(done_rx)
    }

    /// Submit and await completion on the caller's runtime.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, ClientError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(fut)?.await.map_err(|_| ClientError::WorkerGone)
    }

    /// Close the intake and join the thread off the async path. Idempotent.
    pub async fn stop(&self) {
        // Dropping the sender ends the receive loop on the thread.
        let _ = self.tx.lock().expect("loop intake poisoned").take();
        let handle = self.join.lock().expect("loop join poisoned").take();
        if let Some(handle) = handle {
            let name = self.name.clone();
            let _ = tokio::task::spawn_blocking(move || {
                if handle.join().is_err() {
                    error!(loop_thread = %name, "loop thread panicked");
                }
            })
            .await;
        }
    }
}
