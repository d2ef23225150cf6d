//! Unauthenticated operational endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use super::AppState;
use crate::guard::CircuitState;

/// Liveness plus dependency status. Returns 503 when the database is
/// configured but unreachable.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let (database, healthy) = match &state.database {
        Some(db) => match db.check_connectivity().await {
            Ok(latency) => (
                json!({ "status": "up", "latency_ms": latency.as_millis() as u64, "pool": db.pool_metrics() }),
                true,
            ),
            Err(e) => (json!({ "status": "down", "error": e.user_message() }), false),
        },
        None => (json!({ "status": "not_configured" }), true),
    };

    let circuit = state
        .guard
        .evaluator()
        .breaker()
        .map(|b| match b.state() {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        })
        .unwrap_or("disabled");

    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(json!({
            "status": if healthy { "healthy" } else { "degraded" },
            "version": env!("CARGO_PKG_VERSION"),
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "checks": {
                "database": database,
                "circuit_breaker": circuit,
            }
        })),
    )
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
