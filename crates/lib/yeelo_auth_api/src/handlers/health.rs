//! Liveness probe.

use axum::Json;
use chrono::Utc;

use crate::models::HealthResponse;

/// `GET /health`: answers without touching the store.
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "auth-service",
        timestamp: Utc::now(),
    })
}
