//! Prometheus wiring for the fabric binaries.
//!
//! The recorder is installed once per process; job counters
//! (`fabric_jobs_*`, `fabric_notifications_*`) and the worker saturation
//! gauge are emitted where the work happens, this module only owns the
//! exporter, the duration buckets, and the ops router's own request
//! accounting.

use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Buckets for `*_duration_seconds` histograms, sized for job handlers:
/// sub-second notification sends up to multi-minute exports.
const DURATION_SECONDS_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0,
];

/// Bind a `TcpListener` on `bind` and serve the ops router on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await
}

/// Install the process-wide Prometheus recorder.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_owned()),
            DURATION_SECONDS_BUCKETS,
        )
        .expect("failed to configure duration buckets")
        .install_recorder()
        .expect("failed to install metrics recorder")
}

/// Mount `/metrics` on the ops router and account for the router's own
/// traffic.
pub fn attach_ops_metrics(router: Router) -> Router {
    let handle = install_recorder();

    router
        .route(
            "/metrics",
            get(move || std::future::ready(handle.render())),
        )
        .layer(axum::middleware::from_fn(track_ops_requests))
}

/// The ops surface is probes and scrapes, all GETs; a route and status
/// label pair is enough to spot a flapping probe.
async fn track_ops_requests(req: Request<Body>, next: Next) -> impl IntoResponse {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_owned())
        .unwrap_or_else(|| req.uri().path().to_owned());

    let started = Instant::now();
    let response = next.run(req).await;

    let labels = [
        ("route", route),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!("fabric_ops_requests_total", &labels).increment(1);
    metrics::histogram!("fabric_ops_request_duration_seconds", &labels)
        .record(started.elapsed().as_secs_f64());

    response
}
