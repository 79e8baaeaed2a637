//! Health check endpoint for load balancers and monitoring.
//!
//! Returns the full [`HealthSnapshot`](shared::api::HealthSnapshot). The
//! status code is 200 while the service can take traffic (healthy or
//! degraded) and 503 once the database is unreachable.

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use shared::api::SystemStatus;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(health_check))
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.health.perform_health_check().await;

    let status = match snapshot.status {
        SystemStatus::Healthy | SystemStatus::Degraded => StatusCode::OK,
        SystemStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status, Json(snapshot))
}
