//! Liveness endpoint for load balancers.

use axum::{routing::get, Json, Router};
use serde::Serialize;

/// Health check response
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Create the health router
pub fn health_routes() -> Router {
    Router::new().route("/health", get(health_check))
}
