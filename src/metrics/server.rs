//! Prometheus metrics infrastructure for rivulet.
//!
//! Runs are short-lived, so the endpoint is opt-in. When enabled it exposes
//! the counters and histograms of the current process and a health check.

use axum::{Extension, Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use snafu::prelude::*;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{MetricsError, PrometheusInitSnafu};

/// Install the Prometheus recorder and serve it on `addr`.
///
/// Exposes:
/// - `/metrics` - Prometheus metrics in text format
/// - `/health` - returns 200 OK
///
/// The server lives as long as the process, so values recorded after the last
/// scrape of a finished run are not exported.
pub fn init(addr: SocketAddr) -> Result<(), MetricsError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context(PrometheusInitSnafu)?;

    tokio::spawn(run_server(addr, handle));

    Ok(())
}

fn router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(Extension(handle))
}

async fn run_server(addr: SocketAddr, handle: PrometheusHandle) {
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind metrics server to {}: {}", addr, e);
            return;
        }
    };

    info!(%addr, "Serving metrics");
    if let Err(e) = axum::serve(listener, router(handle)).await {
        error!("Metrics server error: {}", e);
    }
}

async fn metrics_handler(Extension(handle): Extension<PrometheusHandle>) -> String {
    handle.render()
}

async fn health_handler() -> &'static str {
    "ok\n"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_handler() {
        assert_eq!(health_handler().await, "ok\n");
    }

    #[tokio::test]
    async fn test_metrics_handler_renders_recorder() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _router = router(handle.clone());

        let body = metrics_handler(Extension(handle)).await;
        assert!(body.is_empty() || body.ends_with('\n'));
    }
}
