//! Health and metrics over HTTP.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use eig_core::metrics::GatewayMetrics;

use crate::error::ServerError;

fn router(metrics: Arc<GatewayMetrics>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(render_metrics))
        .fallback(not_found)
        .with_state(metrics)
}

async fn healthz() -> &'static str {
    "ok\n"
}

// Always ready post-init: models load lazily, so a reachable gateway
// can take traffic.
async fn readyz() -> &'static str {
    "ready\n"
}

async fn render_metrics(State(metrics): State<Arc<GatewayMetrics>>) -> String {
    metrics.render()
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Binds the observability listener.
pub async fn bind_http(port: u16) -> Result<TcpListener, ServerError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    if let Ok(local) = listener.local_addr() {
        info!(addr = %local, "http endpoint listening");
    }
    Ok(listener)
}

/// Serves `/healthz`, `/readyz`, and `/metrics` until `shutdown` fires.
pub async fn serve_http(
    listener: TcpListener,
    metrics: Arc<GatewayMetrics>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}
