use axum::{
    Router,
    extract::State,
    response::Json as ResponseJson,
    routing::{get, post},
};
use db::models::user::User;
use serde::Serialize;
use services::services::{
    auth::{LoginRequest, LoginResponse},
    config::Environment,
};
use tracing::info;
use ts_rs::TS;
use utils::response::ApiResponse;

use crate::{DeploymentImpl, error::ApiError, middleware::auth::AuthUser};

#[derive(Debug, Serialize, TS)]
pub struct AuthStatus {
    pub environment: Environment,
    pub emergency_login: bool,
}

/// POST /api/v1/auth/login
pub async fn login(
    State(deployment): State<DeploymentImpl>,
    axum::Json(payload): axum::Json<LoginRequest>,
) -> Result<ResponseJson<ApiResponse<LoginResponse>>, ApiError> {
    let response = deployment.auth().login(&payload).await?;
    Ok(ResponseJson(ApiResponse::success_with_message(
        response,
        "Login successful",
    )))
}

/// POST /api/v1/auth/logout
pub async fn logout(
    State(deployment): State<DeploymentImpl>,
    auth: AuthUser,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    if deployment.auth().logout(&auth.token).await? {
        info!(user_id = %auth.user.id, "User logged out");
    }
    Ok(ResponseJson(ApiResponse::success(())))
}

/// GET /api/v1/auth/verify
pub async fn verify(auth: AuthUser) -> ResponseJson<ApiResponse<User>> {
    ResponseJson(ApiResponse::success(auth.user))
}

/// GET /api/v1/auth/status
pub async fn status(State(deployment): State<DeploymentImpl>) -> ResponseJson<ApiResponse<AuthStatus>> {
    ResponseJson(ApiResponse::success(AuthStatus {
        environment: deployment.config().environment,
        emergency_login: deployment.auth().emergency_login_enabled(),
    }))
}

pub fn router() -> Router<DeploymentImpl> {
    Router::new().nest(
        "/auth",
        Router::new()
            .route("/login", post(login))
            .route("/logout", post(logout))
            .route("/verify", get(verify))
            .route("/status", get(status)),
    )
}
