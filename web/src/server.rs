//! Process lifecycle for the service binaries.
//!
//! 1. [`init_tracing`] before anything logs
//! 2. [`serve`] until Ctrl+C or SIGTERM
//! 3. broadcast shutdown to background tasks
//! 4. [`drain`] their handles, each bounded by the shutdown timeout

use axum::Router;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber: `RUST_LOG` if set, otherwise `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Serve `app` on `listener` until a shutdown signal, then notify `shutdown`.
///
/// # Errors
///
/// Returns the I/O error that stopped the server.
pub async fn serve(listener: TcpListener, app: Router, shutdown: &broadcast::Sender<()>) -> std::io::Result<()> {
    if let Ok(address) = listener.local_addr() {
        tracing::info!(%address, "HTTP server listening");
    }

    let result = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await;

    tracing::info!("HTTP server stopped, initiating graceful shutdown");
    let _ = shutdown.send(());
    result
}

/// Wait for each background task, at most `timeout` per task.
pub async fn drain(handles: Vec<JoinHandle<()>>, timeout: Duration) {
    for (idx, handle) in handles.into_iter().enumerate() {
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => tracing::debug!(task = idx, "Background task stopped"),
            Ok(Err(e)) => tracing::warn!(task = idx, error = %e, "Background task failed"),
            Err(_) => tracing::warn!(task = idx, "Background task shutdown timed out"),
        }
    }
    tracing::info!("Graceful shutdown complete");
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_tolerates_cancelled_and_stuck_tasks() {
        let quick = tokio::spawn(async {});
        let cancelled = tokio::spawn(std::future::pending::<()>());
        cancelled.abort();
        let stuck = tokio::spawn(std::future::pending::<()>());

        let started = std::time::Instant::now();
        drain(vec![quick, cancelled, stuck], Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
