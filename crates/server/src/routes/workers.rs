use axum::{
    Router,
    extract::{Path, Query, State},
    response::Json as ResponseJson,
    routing::get,
};
use db::models::{
    sync_queue::SyncOperation,
    worker::{CreateWorker, LifeStatus, UpdateWorker, Worker, WorkerSyncStatus},
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};
use ts_rs::TS;
use uuid::Uuid;
use utils::response::ApiResponse;

use crate::{DeploymentImpl, error::ApiError, middleware::auth::AuthUser};

#[derive(Debug, Default, Deserialize, TS)]
pub struct WorkerQuery {
    pub team_id: Option<String>,
}

async fn load_worker(deployment: &DeploymentImpl, id: Uuid) -> Result<Worker, ApiError> {
    Worker::find_by_id(&deployment.db().pool, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("worker {} not found", id)))
}

/// Queues a worker change for the CRM. Workers that only exist locally have
/// nothing to push to.
async fn queue_crm_sync(
    deployment: &DeploymentImpl,
    worker: &Worker,
    changes: &Value,
    operation: SyncOperation,
) -> Result<(), ApiError> {
    let Some(crm_id) = worker.crm_id.as_deref() else {
        debug!(worker_id = %worker.id, "Worker has no CRM id, not syncing");
        return Ok(());
    };
    // Pending must be written before the enqueue wakes the sync worker,
    // otherwise this write can land after its Synced/Failed result.
    let pool = &deployment.db().pool;
    Worker::set_sync_status(pool, worker.id, WorkerSyncStatus::Pending).await?;
    if let Err(e) = deployment
        .sync()
        .mark_worker_for_sync(crm_id, changes, operation)
        .await
    {
        Worker::set_sync_status(pool, worker.id, worker.sync_status).await?;
        return Err(e.into());
    }
    Ok(())
}

/// GET /api/v1/workers
pub async fn list_workers(
    State(deployment): State<DeploymentImpl>,
    _auth: AuthUser,
    Query(query): Query<WorkerQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<Worker>>>, ApiError> {
    let workers = Worker::find_all(&deployment.db().pool, query.team_id.as_deref()).await?;
    Ok(ResponseJson(ApiResponse::success(workers)))
}

/// POST /api/v1/workers
pub async fn create_worker(
    State(deployment): State<DeploymentImpl>,
    auth: AuthUser,
    axum::Json(payload): axum::Json<CreateWorker>,
) -> Result<ResponseJson<ApiResponse<Worker>>, ApiError> {
    auth.require_admin()?;
    if payload.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name is required".to_string()));
    }
    let worker = Worker::create(&deployment.db().pool, &payload, Uuid::new_v4()).await?;
    info!(worker_id = %worker.id, crm_id = ?worker.crm_id, "Worker created");
    Ok(ResponseJson(ApiResponse::success(worker)))
}

/// GET /api/v1/workers/{id}
pub async fn get_worker(
    State(deployment): State<DeploymentImpl>,
    _auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Worker>>, ApiError> {
    Ok(ResponseJson(ApiResponse::success(
        load_worker(&deployment, id).await?,
    )))
}

/// PATCH /api/v1/workers/{id}
pub async fn update_worker(
    State(deployment): State<DeploymentImpl>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    axum::Json(payload): axum::Json<UpdateWorker>,
) -> Result<ResponseJson<ApiResponse<Worker>>, ApiError> {
    auth.require_admin()?;
    let existing = load_worker(&deployment, id).await?;
    if existing.life_status == LifeStatus::Void {
        return Err(ApiError::Conflict(format!("worker {} is void", id)));
    }

    Worker::update(&deployment.db().pool, id, &payload)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("worker {} not found", id)))?;
    let changes =
        serde_json::to_value(&payload).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    queue_crm_sync(&deployment, &existing, &changes, SyncOperation::Update).await?;

    let worker = load_worker(&deployment, id).await?;
    info!(worker_id = %id, user_id = %auth.user.id, "Worker updated");
    Ok(ResponseJson(ApiResponse::success(worker)))
}

/// DELETE /api/v1/workers/{id}
/// Voids the worker locally and in the CRM.
pub async fn delete_worker(
    State(deployment): State<DeploymentImpl>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    auth.require_admin()?;
    let worker = load_worker(&deployment, id).await?;
    if Worker::mark_void(&deployment.db().pool, id).await? == 0 {
        return Ok(ResponseJson(ApiResponse::success_with_message(
            (),
            "Worker already void",
        )));
    }
    queue_crm_sync(&deployment, &worker, &serde_json::json!({}), SyncOperation::Delete).await?;

    info!(worker_id = %id, user_id = %auth.user.id, "Worker voided");
    Ok(ResponseJson(ApiResponse::success(())))
}

pub fn router() -> Router<DeploymentImpl> {
    Router::new().nest(
        "/workers",
        Router::new()
            .route("/", get(list_workers).post(create_worker))
            .route(
                "/{id}",
                get(get_worker).patch(update_worker).delete(delete_worker),
            ),
    )
}
