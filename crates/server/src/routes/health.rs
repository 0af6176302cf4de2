use axum::{Router, extract::State, response::Json as ResponseJson, routing::get};
use serde::Serialize;
use tracing::warn;
use ts_rs::TS;
use utils::response::ApiResponse;

use crate::DeploymentImpl;

#[derive(Debug, Serialize, TS)]
pub struct HealthStatus {
    pub status: String,
    pub database: bool,
    pub version: String,
}

/// GET /health
pub async fn health(State(deployment): State<DeploymentImpl>) -> ResponseJson<ApiResponse<HealthStatus>> {
    let database = match deployment.db().ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!("Health check: database unreachable: {}", e);
            false
        }
    };
    ResponseJson(ApiResponse::success(HealthStatus {
        status: if database { "ok" } else { "degraded" }.to_string(),
        database,
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}

pub fn router() -> Router<DeploymentImpl> {
    Router::new().route("/health", get(health))
}
