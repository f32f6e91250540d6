use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use pal_client::{FatalSignal, PalConfig};

mod bootstrap;
mod router;
mod webhook;

pub(crate) use bootstrap::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();

    let config = PalConfig::from_env();
    let bootstrap::BootstrapOutput {
        state,
        orchestrator,
        fatal,
    } = bootstrap::build(&config)?;

    let addr = bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, server_url = %config.server_url, "pal-agent listening");

    let orchestrator = Arc::new(orchestrator);
    let starter = orchestrator.clone();
    tokio::spawn(async move {
        if let Err(err) = starter.start().await {
            error!(%err, "background startup failed");
        }
    });

    let fatal_hit = Arc::new(AtomicBool::new(false));
    let app = router::build_router().with_state(state);
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(fatal, fatal_hit.clone()));
    if let Err(err) = server.await {
        error!(%err, "http server exited with error");
    }

    orchestrator.shutdown().await;

    if fatal_hit.load(Ordering::SeqCst) {
        // Nonzero exit so the supervisor restarts us with fresh config.
        std::process::exit(1);
    }
    Ok(())
}

fn bind_addr() -> anyhow::Result<SocketAddr> {
    let bind = std::env::var("PAL_BIND").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("PAL_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(7000);
    Ok(format!("{bind}:{port}").parse()?)
}

async fn shutdown_signal(fatal: FatalSignal, fatal_hit: Arc<AtomicBool>) {
    let fatal = async move {
        let reason = fatal.wait().await;
        error!(%reason, "unrecoverable startup failure; requesting shutdown");
        fatal_hit.store(true, Ordering::SeqCst);
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
            _ = fatal => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = fatal => {},
        }
    }

    info!("shutdown signal received");
}
