//! HTTP request layer over the collaboration store.

mod body;
mod caller;
mod error;
mod routes;
mod tail;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use trellis_core::App;

pub use self::tail::TailShutdown;

pub fn router(app: Arc<App>, shutdown: TailShutdown) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/status", get(routes::status))
        .route("/reconcile", post(routes::reconcile))
        .route(
            "/collections/{kind}",
            get(routes::list_collection).post(routes::create_item),
        )
        .route(
            "/collections/{kind}/{id}",
            get(routes::get_item).patch(routes::patch_item),
        )
        .route(
            "/collections/{kind}/{id}/transition",
            post(routes::transition_task),
        )
        .route("/leases", get(routes::list_leases))
        .route("/leases/acquire", post(routes::acquire_lease))
        .route("/leases/sweep", post(routes::sweep_leases))
        .route("/leases/{lock_id}", get(routes::get_lease))
        .route("/leases/{lock_id}/release", post(routes::release_lease))
        .route("/leases/{lock_id}/heartbeat", post(routes::heartbeat_lease))
        .route("/leases/{lock_id}/reclaim", post(routes::reclaim_lease))
        .route(
            "/events",
            get(routes::read_events).post(routes::append_event),
        )
        .route("/events/tail", get(tail::tail_events))
        .layer(axum::Extension(shutdown))
        .with_state(app)
}

/// Serve until Ctrl+C or SIGTERM. Open tails are closed before the server
/// drains.
pub async fn serve(app: Arc<App>, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    info!(%addr, "trellis listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    axum::serve(listener, router(app, TailShutdown::new(shutdown_rx)))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("HTTP server failed")?;

    info!("trellis server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
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
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
