use axum::{
    Router,
    extract::{Path, State},
    response::Json as ResponseJson,
    routing::get,
};
use db::models::user::{CreateUser, UpdateUser, User, UserStatus};
use tracing::info;
use uuid::Uuid;
use utils::{phone::normalize_phone, response::ApiResponse};

use crate::{DeploymentImpl, error::ApiError, middleware::auth::AuthUser};

async fn load_user(deployment: &DeploymentImpl, id: Uuid) -> Result<User, ApiError> {
    User::find_by_id(&deployment.db().pool, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("user {} not found", id)))
}

/// GET /api/v1/users/me
pub async fn me(auth: AuthUser) -> ResponseJson<ApiResponse<User>> {
    ResponseJson(ApiResponse::success(auth.user))
}

/// GET /api/v1/users
pub async fn list_users(
    State(deployment): State<DeploymentImpl>,
    auth: AuthUser,
) -> Result<ResponseJson<ApiResponse<Vec<User>>>, ApiError> {
    auth.require_admin()?;
    let users = User::find_all(&deployment.db().pool).await?;
    Ok(ResponseJson(ApiResponse::success(users)))
}

/// POST /api/v1/users
/// New accounts start pending; the first login activates them.
pub async fn create_user(
    State(deployment): State<DeploymentImpl>,
    auth: AuthUser,
    axum::Json(mut payload): axum::Json<CreateUser>,
) -> Result<ResponseJson<ApiResponse<User>>, ApiError> {
    auth.require_admin()?;
    payload.phone = normalize_phone(&payload.phone)
        .ok_or_else(|| ApiError::BadRequest("invalid phone number".to_string()))?;
    if payload.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name is required".to_string()));
    }

    let pool = &deployment.db().pool;
    if User::find_by_phone(pool, &payload.phone).await?.is_some() {
        return Err(ApiError::Conflict("phone number already registered".to_string()));
    }
    let user = User::create(pool, &payload, Uuid::new_v4()).await?;
    info!(user_id = %user.id, role = %user.global_role, "User created");
    Ok(ResponseJson(ApiResponse::success(user)))
}

/// GET /api/v1/users/{id}
pub async fn get_user(
    State(deployment): State<DeploymentImpl>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<User>>, ApiError> {
    if auth.user.id != id {
        auth.require_admin()?;
    }
    Ok(ResponseJson(ApiResponse::success(
        load_user(&deployment, id).await?,
    )))
}

/// PUT /api/v1/users/{id}
pub async fn update_user(
    State(deployment): State<DeploymentImpl>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    axum::Json(payload): axum::Json<UpdateUser>,
) -> Result<ResponseJson<ApiResponse<User>>, ApiError> {
    auth.require_admin()?;
    let user = User::update(&deployment.db().pool, id, &payload)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("user {} not found", id)))?;

    if user.status == UserStatus::Suspended {
        deployment.auth().revoke_sessions(id).await?;
    }
    info!(user_id = %id, by = %auth.user.id, "User updated");
    Ok(ResponseJson(ApiResponse::success(user)))
}

/// DELETE /api/v1/users/{id}
/// Suspends the account and ends its sessions; the row is kept.
pub async fn deactivate_user(
    State(deployment): State<DeploymentImpl>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<User>>, ApiError> {
    auth.require_admin()?;
    if auth.user.id == id {
        return Err(ApiError::BadRequest("cannot deactivate yourself".to_string()));
    }

    let update = UpdateUser {
        status: Some(UserStatus::Suspended),
        ..Default::default()
    };
    let user = User::update(&deployment.db().pool, id, &update)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("user {} not found", id)))?;
    let revoked = deployment.auth().revoke_sessions(id).await?;

    info!(user_id = %id, revoked, by = %auth.user.id, "User deactivated");
    Ok(ResponseJson(ApiResponse::success_with_message(
        user,
        "User deactivated",
    )))
}

pub fn router() -> Router<DeploymentImpl> {
    Router::new().nest(
        "/users",
        Router::new()
            .route("/", get(list_users).post(create_user))
            .route("/me", get(me))
            .route(
                "/{id}",
                get(get_user).put(update_user).delete(deactivate_user),
            ),
    )
}
