use axum::{
    Router,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    response::Json as ResponseJson,
    routing::{get, post},
};
use db::models::{
    file_record::FileRecord,
    project::Project,
    site::{CreateSite, Site, SiteFilter, SiteStats, UpdateSite},
    sync_queue::SyncOperation,
    user::User,
};
use serde::{Deserialize, Serialize};
use services::services::access;
use strum_macros::EnumString;
use tracing::{info, warn};
use ts_rs::TS;
use uuid::Uuid;
use utils::response::ApiResponse;

use crate::{
    DeploymentImpl,
    error::ApiError,
    middleware::auth::AuthUser,
    routes::files::{MULTIPART_OVERHEAD_BYTES, content_type_for},
};

#[derive(Debug, Default, Deserialize, TS)]
pub struct SiteQuery {
    pub project_id: Option<Uuid>,
    pub opportunity_id: Option<String>,
    pub search: Option<String>,
    pub building: Option<String>,
    pub completed: Option<bool>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Resolves `project_id` / `opportunity_id` to the opportunity the request
/// is scoped to. Non-admins must always name one they belong to.
async fn scoped_opportunity(
    deployment: &DeploymentImpl,
    user: &User,
    project_id: Option<Uuid>,
    opportunity_id: Option<String>,
) -> Result<Option<String>, ApiError> {
    let pool = &deployment.db().pool;
    let opportunity_id = match (project_id, opportunity_id) {
        (Some(project_id), _) => Some(
            Project::find_by_id(pool, project_id)
                .await?
                .ok_or_else(|| ApiError::NotFound(format!("project {} not found", project_id)))?
                .opportunity_id,
        ),
        (None, opportunity_id) => opportunity_id,
    };

    if let Some(opp) = &opportunity_id {
        if !access::can_view_sites(pool, user, opp).await? {
            return Err(ApiError::Forbidden("not a member of this project".to_string()));
        }
    } else if !user.is_admin() {
        return Err(ApiError::BadRequest(
            "project_id or opportunity_id is required".to_string(),
        ));
    }
    Ok(opportunity_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum PhotoKind {
    Before,
    After,
}

#[derive(Debug, Serialize, TS)]
pub struct SitePhoto {
    pub url: String,
    pub file: FileRecord,
    pub site: Site,
}

async fn load_site(deployment: &DeploymentImpl, id: &str) -> Result<Site, ApiError> {
    Site::find_by_id(&deployment.db().pool, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("site {} not found", id)))
}

async fn ensure_can_edit(
    deployment: &DeploymentImpl,
    user: &User,
    opportunity_id: &str,
) -> Result<(), ApiError> {
    if access::can_edit_site(&deployment.db().pool, user, opportunity_id).await? {
        Ok(())
    } else {
        Err(ApiError::Forbidden("not allowed to edit sites of this project".to_string()))
    }
}

/// Keeps the project's cached progress in step with its sites.
async fn refresh_project_stats(deployment: &DeploymentImpl, opportunity_id: &str) {
    let pool = &deployment.db().pool;
    let result = match Project::find_by_opportunity_id(pool, opportunity_id).await {
        Ok(Some(project)) => Project::refresh_stats(pool, project.id).await.map(|_| ()),
        Ok(None) => Ok(()),
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        warn!(opportunity_id = %opportunity_id, "Failed to refresh project stats: {}", e);
    }
}

/// GET /api/v1/sites
pub async fn list_sites(
    State(deployment): State<DeploymentImpl>,
    auth: AuthUser,
    Query(query): Query<SiteQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<Site>>>, ApiError> {
    let opportunity_id =
        scoped_opportunity(&deployment, &auth.user, query.project_id, query.opportunity_id)
            .await?;
    let filter = SiteFilter {
        opportunity_id,
        search: query.search,
        building: query.building,
        completed: query.completed,
        limit: query.limit,
        offset: query.offset,
    };
    let sites = Site::find_filtered(&deployment.db().pool, &filter).await?;
    Ok(ResponseJson(ApiResponse::success(sites)))
}

/// POST /api/v1/sites
/// Without a CRM `id` the site is created local-only and never synced.
pub async fn create_site(
    State(deployment): State<DeploymentImpl>,
    auth: AuthUser,
    axum::Json(payload): axum::Json<CreateSite>,
) -> Result<ResponseJson<ApiResponse<Site>>, ApiError> {
    if payload.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name is required".to_string()));
    }
    let pool = &deployment.db().pool;
    if Project::find_by_opportunity_id(pool, &payload.opportunity_id)
        .await?
        .is_none()
    {
        return Err(ApiError::NotFound(format!(
            "no project for opportunity {}",
            payload.opportunity_id
        )));
    }
    ensure_can_edit(&deployment, &auth.user, &payload.opportunity_id).await?;

    let site = Site::create(pool, &payload).await?;
    refresh_project_stats(&deployment, &site.opportunity_id).await;
    info!(
        site_id = %site.id,
        opportunity_id = %site.opportunity_id,
        local_only = site.local_only,
        "Site created"
    );
    Ok(ResponseJson(ApiResponse::success(site)))
}

/// GET /api/v1/sites/stats
pub async fn site_stats(
    State(deployment): State<DeploymentImpl>,
    auth: AuthUser,
    Query(query): Query<SiteQuery>,
) -> Result<ResponseJson<ApiResponse<SiteStats>>, ApiError> {
    let opportunity_id =
        scoped_opportunity(&deployment, &auth.user, query.project_id, query.opportunity_id)
            .await?;
    let stats = Site::stats(&deployment.db().pool, opportunity_id.as_deref()).await?;
    Ok(ResponseJson(ApiResponse::success(stats)))
}

/// GET /api/v1/sites/{id}
pub async fn get_site(
    State(deployment): State<DeploymentImpl>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> Result<ResponseJson<ApiResponse<Site>>, ApiError> {
    let site = load_site(&deployment, &id).await?;
    if !access::can_view_sites(&deployment.db().pool, &auth.user, &site.opportunity_id).await? {
        return Err(ApiError::Forbidden("not a member of this project".to_string()));
    }
    Ok(ResponseJson(ApiResponse::success(site)))
}

/// PATCH /api/v1/sites/{id}
/// Saves the change locally and queues it for the CRM.
pub async fn update_site(
    State(deployment): State<DeploymentImpl>,
    auth: AuthUser,
    Path(id): Path<String>,
    axum::Json(payload): axum::Json<UpdateSite>,
) -> Result<ResponseJson<ApiResponse<Site>>, ApiError> {
    if payload.is_empty() {
        return Err(ApiError::BadRequest("no fields to update".to_string()));
    }
    let existing = load_site(&deployment, &id).await?;
    ensure_can_edit(&deployment, &auth.user, &existing.opportunity_id).await?;

    let site = Site::update(&deployment.db().pool, &id, &payload)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("site {} not found", id)))?;

    if payload.completed.is_some() {
        refresh_project_stats(&deployment, &site.opportunity_id).await;
    }

    let message = match queue_site_change(&deployment, &site, &payload).await? {
        Some(item_id) => {
            info!(
                site_id = %site.id,
                user_id = %auth.user.id,
                sync_item_id = item_id,
                "Site updated"
            );
            "Site updated, CRM sync queued"
        }
        None => {
            info!(site_id = %site.id, user_id = %auth.user.id, "Local site updated");
            "Site updated"
        }
    };
    Ok(ResponseJson(ApiResponse::success_with_message(site, message)))
}

/// Queues a saved change for the CRM and returns the queue row id.
/// Local-only sites have no CRM record, so nothing is queued.
async fn queue_site_change(
    deployment: &DeploymentImpl,
    site: &Site,
    changes: &UpdateSite,
) -> Result<Option<i64>, ApiError> {
    if site.local_only {
        return Ok(None);
    }
    let changes =
        serde_json::to_value(changes).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let queued = deployment
        .sync()
        .mark_site_for_sync(&site.id, &changes, SyncOperation::Update)
        .await?;
    Ok(Some(queued.id))
}

/// POST /api/v1/sites/{id}/photo
/// Multipart form with a `photo` file and `type` (`before` or `after`).
/// Stores the photo and points the site's matching photo URL at it.
pub async fn upload_site_photo(
    State(deployment): State<DeploymentImpl>,
    auth: AuthUser,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> Result<ResponseJson<ApiResponse<SitePhoto>>, ApiError> {
    let site = load_site(&deployment, &id).await?;
    ensure_can_edit(&deployment, &auth.user, &site.opportunity_id).await?;

    let mut photo = None;
    let mut kind = None;
    while let Some(field) = multipart.next_field().await? {
        match field.name() {
            Some("photo") => {
                let file_name = field.file_name().unwrap_or("photo").to_string();
                let content_type = content_type_for(field.content_type(), &file_name);
                photo = Some((file_name, content_type, field.bytes().await?));
            }
            Some("type") => {
                let value = field.text().await?;
                kind = Some(value.trim().parse::<PhotoKind>().map_err(|_| {
                    ApiError::BadRequest(format!("photo type must be before or after, got {}", value))
                })?);
            }
            _ => {}
        }
    }
    let (file_name, content_type, bytes) =
        photo.ok_or_else(|| ApiError::BadRequest("missing `photo` field".to_string()))?;
    let kind = kind.ok_or_else(|| ApiError::BadRequest("missing `type` field".to_string()))?;
    if !content_type.starts_with("image/") {
        return Err(ApiError::BadRequest(format!("not an image: {}", content_type)));
    }

    let file = deployment
        .storage()
        .store(&auth.user, &file_name, &content_type, &bytes)
        .await?;
    let url = format!(
        "{}/api/v1/files/{}",
        deployment.config().public_api_url.trim_end_matches('/'),
        file.id
    );
    let changes = match kind {
        PhotoKind::Before => UpdateSite {
            before_photo_url: Some(url.clone()),
            ..Default::default()
        },
        PhotoKind::After => UpdateSite {
            after_photo_url: Some(url.clone()),
            ..Default::default()
        },
    };
    let site = Site::update(&deployment.db().pool, &id, &changes)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("site {} not found", id)))?;
    let queued = queue_site_change(&deployment, &site, &changes).await?;

    info!(
        site_id = %site.id,
        file_id = %file.id,
        photo = ?kind,
        sync_item_id = ?queued,
        "Site photo attached"
    );
    Ok(ResponseJson(ApiResponse::success(SitePhoto { url, file, site })))
}

/// DELETE /api/v1/sites/{id}
pub async fn delete_site(
    State(deployment): State<DeploymentImpl>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    auth.require_admin()?;
    let site = load_site(&deployment, &id).await?;

    Site::delete(&deployment.db().pool, &id).await?;
    if !site.local_only {
        deployment
            .sync()
            .mark_site_for_sync(&id, &serde_json::json!({}), SyncOperation::Delete)
            .await?;
    }
    refresh_project_stats(&deployment, &site.opportunity_id).await;

    info!(site_id = %id, user_id = %auth.user.id, "Site deleted");
    Ok(ResponseJson(ApiResponse::success(())))
}

pub fn router(deployment: &DeploymentImpl) -> Router<DeploymentImpl> {
    let body_limit = deployment.storage().max_bytes() + MULTIPART_OVERHEAD_BYTES;
    Router::new().nest(
        "/sites",
        Router::new()
            .route("/", get(list_sites).post(create_site))
            .route("/stats", get(site_stats))
            .route("/{id}", get(get_site).patch(update_site).delete(delete_site))
            .route(
                "/{id}/photo",
                post(upload_site_photo).layer(DefaultBodyLimit::max(body_limit)),
            ),
    )
}
