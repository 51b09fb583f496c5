//! Health & metrics HTTP surface.
//!
//! This is intentionally the entire HTTP surface the engine exposes: the
//! business API (deposit notifications, withdrawal requests) is an external
//! collaborator that calls into [`crate::Engine`] directly, not a route on
//! this router.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use eyre::Result;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tokio::net::TcpListener;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    chains: Vec<String>,
}

#[derive(Clone)]
struct ApiState {
    chains: Arc<Vec<String>>,
}

pub async fn serve(addr: &str, chains: Vec<String>) -> Result<()> {
    let addr: SocketAddr = addr.parse()?;
    let state = ApiState {
        chains: Arc::new(chains),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "health/metrics server listening");
    crate::metrics::UP.set(1.0);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health(axum::extract::State(state): axum::extract::State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        chains: state.chains.as_ref().clone(),
    })
}

async fn metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).ok();
    String::from_utf8(buffer).unwrap_or_default()
}
