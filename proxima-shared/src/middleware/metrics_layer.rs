use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Instant;

const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

/// Route label for a request. Socket.IO transport requests (long-polling
/// and the websocket upgrade) share one label so they do not fan out into a
/// series per session id.
fn route_label(matched: Option<&MatchedPath>, uri_path: &str) -> String {
    if uri_path.starts_with("/socket.io") {
        return "/socket.io".to_string();
    }
    match matched {
        Some(path) => path.as_str().to_string(),
        None => "unmatched".to_string(),
    }
}

pub async fn metrics_middleware(
    matched_path: Option<MatchedPath>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let route = route_label(matched_path.as_ref(), req.uri().path());

    let response = next.run(req).await;

    let labels = [
        ("method", method),
        ("route", route),
        ("status", response.status().as_u16().to_string()),
    ];
    counter!("http_requests_total", &labels).increment(1);
    histogram!("http_request_duration_seconds", &labels).record(start.elapsed().as_secs_f64());

    response
}

/// Installs the global Prometheus recorder and describes the backend's
/// domain counters.
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full("http_request_duration_seconds".to_string()), LATENCY_BUCKETS)?
        .install_recorder()?;

    describe_counter!("http_requests_total", "HTTP requests by method, route and status");
    describe_histogram!("http_request_duration_seconds", Unit::Seconds, "HTTP request latency");
    describe_counter!("location_updates_total", "Accepted position updates");
    describe_counter!("likes_total", "Like calls that reached the store");
    describe_counter!("matches_total", "Mutual matches completed");
    describe_counter!("messages_sent_total", "Chat messages persisted and broadcast");

    Ok(handle)
}
