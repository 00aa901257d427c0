//! Prometheus plumbing shared by both binaries: the recorder, the
//! `/metrics` route, and per-request tracking. Job, cache, gate and worker
//! counters are emitted at their call sites; this module only hosts the
//! export surface.

use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// Device commands run over SSH and routinely take whole seconds, and sync
// submissions wait for them, so the histogram reaches well past the usual
// HTTP latency range.
const LATENCY_BUCKETS_SECONDS: &[f64] = &[
    0.005, 0.025, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
];

/// Bind and serve a router, typically one that went through
/// `setup_metrics_routes` first.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Install the process-wide recorder, expose it on `/metrics`, and apply
/// request tracking to every route already on the router.
pub fn setup_metrics_routes(router: Router) -> Router {
    let recorder_handle = setup_metrics_recorder();

    router
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_requests))
}

pub fn setup_metrics_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets(LATENCY_BUCKETS_SECONDS)
        .expect("bucket list is non-empty")
        .install_recorder()
        .expect("recorder is installed once per process")
}

/// Count and time each request, labelled by the matched route pattern.
/// Labelling by raw path would explode cardinality across device names and
/// job ids.
pub async fn track_requests(req: Request<Body>, next: Next) -> impl IntoResponse {
    let started = Instant::now();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_owned())
        .unwrap_or_else(|| req.uri().path().to_owned());
    let method = req.method().clone();

    let response = next.run(req).await;

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels)
        .record(started.elapsed().as_secs_f64());

    response
}
