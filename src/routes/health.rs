//! Service health endpoint used for readiness checks and tests.

use crate::import::ImportServices;
use rocket::State;
use rocket::serde::json::Json;
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::openapi;
use serde::{Deserialize, Serialize};

/// Basic response payload describing API health.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct HealthResponse {
    /// Static status string reporting application readiness.
    pub status: String,
    /// Import jobs currently running in this process.
    pub active_imports: usize,
}

/// Health check endpoint.
#[openapi(tag = "Health")]
#[get("/health")]
pub fn health_check(services: &State<ImportServices>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_imports: services.registry.running_count(),
    })
}
