//! # Health & Observability Endpoints
//!
//! | Endpoint | Purpose |
//! |----------|---------|
//! | `GET /healthz` | Liveness, the process is serving HTTP |
//! | `GET /readyz` | Readiness, the store answers within 2 seconds |
//! | `GET /metrics` | Prometheus scraping endpoint |

use super::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use std::sync::Arc;

pub(super) async fn handler_healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// 503 while the store is unreachable, so the load balancer stops routing
/// trigger and report traffic here.
pub(super) async fn handler_readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let check =
        tokio::time::timeout(std::time::Duration::from_secs(2), state.store.health_check()).await;

    match check {
        Ok(Ok(())) => (StatusCode::OK, "ok"),
        Ok(Err(_)) => (StatusCode::SERVICE_UNAVAILABLE, "database unreachable"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "database timeout"),
    }
}

pub(super) async fn handler_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [(
            "content-type",
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        body,
    )
}
