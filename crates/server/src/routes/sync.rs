use axum::{
    Router,
    extract::{Path, Query, State},
    response::Json as ResponseJson,
    routing::{get, post},
};
use db::models::sync_queue::{SyncQueueItem, SyncStats, SyncStatus};
use serde::{Deserialize, Serialize};
use services::services::{site_import::SiteImportReport, sync_queue::SyncBatchReport};
use tracing::info;
use ts_rs::TS;
use uuid::Uuid;
use utils::response::ApiResponse;

use crate::{DeploymentImpl, error::ApiError, middleware::auth::AuthUser};

const DEFAULT_ITEM_LIMIT: i64 = 50;
const MAX_ITEM_LIMIT: i64 = 200;

#[derive(Debug, Default, Deserialize, TS)]
pub struct SyncItemsQuery {
    pub status: Option<SyncStatus>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, TS)]
pub struct CleanupResult {
    pub removed: u64,
}

/// GET /api/v1/sync/status
/// Queue counts for the last 24 hours.
pub async fn sync_status(
    State(deployment): State<DeploymentImpl>,
    _auth: AuthUser,
) -> Result<ResponseJson<ApiResponse<SyncStats>>, ApiError> {
    let stats = deployment.sync().get_sync_stats().await?;
    Ok(ResponseJson(ApiResponse::success(stats)))
}

/// GET /api/v1/sync/items
pub async fn sync_items(
    State(deployment): State<DeploymentImpl>,
    auth: AuthUser,
    Query(query): Query<SyncItemsQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<SyncQueueItem>>>, ApiError> {
    auth.require_admin()?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_ITEM_LIMIT)
        .clamp(1, MAX_ITEM_LIMIT);
    let items = deployment.sync().list_items(query.status, limit).await?;
    Ok(ResponseJson(ApiResponse::success(items)))
}

/// POST /api/v1/sync/process
/// Runs one poll now instead of waiting for the worker's next tick.
pub async fn process_now(
    State(deployment): State<DeploymentImpl>,
    auth: AuthUser,
) -> Result<ResponseJson<ApiResponse<SyncBatchReport>>, ApiError> {
    auth.require_admin()?;
    let report = deployment.sync().process_sync_queue().await?;
    Ok(ResponseJson(ApiResponse::success(report)))
}

/// POST /api/v1/sync/retry
pub async fn retry_failed(
    State(deployment): State<DeploymentImpl>,
    auth: AuthUser,
) -> Result<ResponseJson<ApiResponse<SyncBatchReport>>, ApiError> {
    auth.require_admin()?;
    let report = deployment.sync().retry_failed_syncs().await?;
    Ok(ResponseJson(ApiResponse::success(report)))
}

/// POST /api/v1/sync/cleanup
pub async fn cleanup(
    State(deployment): State<DeploymentImpl>,
    auth: AuthUser,
) -> Result<ResponseJson<ApiResponse<CleanupResult>>, ApiError> {
    auth.require_admin()?;
    let removed = deployment.sync().cleanup_completed_syncs().await?;
    Ok(ResponseJson(ApiResponse::success(CleanupResult { removed })))
}

/// POST /api/v1/sync/pull/{project_id}
/// Imports the project's sites from the CRM.
pub async fn pull_project_sites(
    State(deployment): State<DeploymentImpl>,
    auth: AuthUser,
    Path(project_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<SiteImportReport>>, ApiError> {
    auth.require_admin()?;
    let report = deployment.importer().pull_project_sites(project_id).await?;
    info!(project_id = %project_id, imported = report.imported, "Manual site pull");
    Ok(ResponseJson(ApiResponse::success(report)))
}

pub fn router() -> Router<DeploymentImpl> {
    Router::new().nest(
        "/sync",
        Router::new()
            .route("/status", get(sync_status))
            .route("/items", get(sync_items))
            .route("/process", post(process_now))
            .route("/retry", post(retry_failed))
            .route("/cleanup", post(cleanup))
            .route("/pull/{project_id}", post(pull_project_sites)),
    )
}
