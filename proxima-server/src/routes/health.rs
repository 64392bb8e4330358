use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;

use proxima_shared::types::{HealthCheck, HealthResponse, HealthStatus};

use crate::AppState;

/// Liveness plus a probe of the backing store. A transient store failure
/// reports degraded; anything else reports unhealthy with a 503.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Response {
    let store = match state.identity.ping().await {
        Ok(()) => HealthCheck::new("store", HealthStatus::Healthy, None),
        Err(e) => {
            let status = if e.is_transient() { HealthStatus::Degraded } else { HealthStatus::Unhealthy };
            HealthCheck::new("store", status, Some(e.public_message()))
        }
    };
    let chat = HealthCheck::new(
        "chat",
        HealthStatus::Healthy,
        Some(format!("{} active rooms", state.chat.active_rooms())),
    );

    let response =
        HealthResponse::healthy("proxima-server", env!("CARGO_PKG_VERSION")).with_checks(vec![store, chat]);
    let status = if response.status.is_serving() { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    (status, Json(response)).into_response()
}

/// Returns Prometheus metrics.
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics_handle {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
