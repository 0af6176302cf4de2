use axum::{
    Router,
    extract::State,
    http::{HeaderMap, header},
    response::Json as ResponseJson,
    routing::get,
};
use serde::Serialize;
use services::services::config::Environment;
use ts_rs::TS;
use utils::response::ApiResponse;

use crate::DeploymentImpl;

#[derive(Debug, Serialize, TS)]
pub struct ClientConfig {
    pub environment: Environment,
    /// Environment implied by the calling frontend's host.
    pub client_environment: Environment,
    pub api_base_url: String,
}

/// GET /api/v1/config
pub async fn get_config(
    State(deployment): State<DeploymentImpl>,
    headers: HeaderMap,
) -> ResponseJson<ApiResponse<ClientConfig>> {
    let client_environment = client_host(&headers)
        .map(Environment::from_hostname)
        .unwrap_or(deployment.config().environment);

    ResponseJson(ApiResponse::success(ClientConfig {
        environment: deployment.config().environment,
        client_environment,
        api_base_url: deployment.config().public_api_url.clone(),
    }))
}

/// The frontend's host, from `Origin` when present, else `Host`.
fn client_host(headers: &HeaderMap) -> Option<&str> {
    if let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) {
        let host = origin.split_once("://").map_or(origin, |(_, rest)| rest);
        return Some(host.split('/').next().unwrap_or(host));
    }
    headers.get(header::HOST).and_then(|v| v.to_str().ok())
}

pub fn router() -> Router<DeploymentImpl> {
    Router::new().route("/config", get(get_config))
}
