//! HTTP front end: `/metrics` runs every registered collector on each request.

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use exporter_core::metrics::{self, Registry};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/metrics", get(metrics_handler))
        .with_state(registry)
}

async fn index() -> &'static str {
    "clamav-exporter\n\nmetrics are served at /metrics\n"
}

async fn metrics_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let started = Instant::now();
    let samples = registry.gather().await;
    debug!(samples = samples.len(), elapsed_ms = started.elapsed().as_millis() as u64, "scrape finished");
    (StatusCode::OK, [(header::CONTENT_TYPE, metrics::CONTENT_TYPE)], metrics::render(&samples))
}

pub async fn serve(listen: &str, registry: Registry) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to listen at {:?}", listen))?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, router(Arc::new(registry)))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "failed to listen for shutdown signal");
            }
            info!("shutting down");
        })
        .await
        .context("failed to serve")?;
    Ok(())
}
