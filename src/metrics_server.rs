//! Loopback-only Prometheus `/metrics` endpoint (SPEC_FULL.md §9
//! resolution). Observability surface only — nothing routed through this
//! server participates in dispatch.

use crate::metrics::Metrics;
use poem::endpoint::PrometheusExporter;
use poem::listener::TcpListener;
use poem::{handler, Route};
use std::net::SocketAddr;
use tracing::{info, warn};

#[handler]
fn healthz() -> &'static str {
    "ok"
}

/// Spawns the metrics HTTP server on its own task. Binding failure is
/// logged and the task simply exits; a dead `/metrics` endpoint must
/// never take the dispatcher down with it.
pub fn spawn(metrics: Metrics, bind_address: SocketAddr) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = Route::new()
            .at("/healthz", healthz)
            .nest("/metrics", PrometheusExporter::new(metrics.registry.clone()));

        info!(%bind_address, "metrics endpoint listening");
        if let Err(e) = poem::Server::new(TcpListener::bind(bind_address)).run(app).await {
            warn!(error = %e, "metrics server exited");
        }
    })
}
