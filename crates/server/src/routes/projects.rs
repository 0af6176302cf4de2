use axum::{
    Router,
    extract::{Path, Query, State},
    response::Json as ResponseJson,
    routing::{delete, get},
};
use db::models::{
    project::{CreateProject, Project, ProjectCounts, ProjectFilter, UpdateProject},
    project_member::{AddProjectMember, ProjectMember, ProjectMemberWithUser},
    site::{Site, SiteFilter},
    user::User,
};
use serde::Serialize;
use services::services::access;
use tracing::info;
use ts_rs::TS;
use uuid::Uuid;
use utils::response::ApiResponse;

use crate::{DeploymentImpl, error::ApiError, middleware::auth::AuthUser};

/// A project with its sites and members, as shown on the project page.
#[derive(Debug, Serialize, TS)]
pub struct ProjectDetail {
    #[serde(flatten)]
    #[ts(flatten)]
    pub project: Project,
    pub sites: Vec<Site>,
    pub members: Vec<ProjectMemberWithUser>,
}

async fn load_project(deployment: &DeploymentImpl, id: Uuid) -> Result<Project, ApiError> {
    Project::find_by_id(&deployment.db().pool, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("project {} not found", id)))
}

async fn ensure_can_view(
    deployment: &DeploymentImpl,
    user: &User,
    project_id: Uuid,
) -> Result<(), ApiError> {
    if access::can_view_project(&deployment.db().pool, user, project_id).await? {
        Ok(())
    } else {
        Err(ApiError::Forbidden("not a member of this project".to_string()))
    }
}

async fn ensure_can_edit(
    deployment: &DeploymentImpl,
    user: &User,
    project_id: Uuid,
) -> Result<(), ApiError> {
    if access::can_edit_project(&deployment.db().pool, user, project_id).await? {
        Ok(())
    } else {
        Err(ApiError::Forbidden("not allowed to edit this project".to_string()))
    }
}

/// GET /api/v1/projects
pub async fn list_projects(
    State(deployment): State<DeploymentImpl>,
    auth: AuthUser,
    Query(filter): Query<ProjectFilter>,
) -> Result<ResponseJson<ApiResponse<Vec<Project>>>, ApiError> {
    let member_id = (!auth.user.is_admin()).then_some(auth.user.id);
    let projects = Project::find_filtered(&deployment.db().pool, &filter, member_id).await?;
    Ok(ResponseJson(ApiResponse::success(projects)))
}

/// POST /api/v1/projects
pub async fn create_project(
    State(deployment): State<DeploymentImpl>,
    auth: AuthUser,
    axum::Json(payload): axum::Json<CreateProject>,
) -> Result<ResponseJson<ApiResponse<Project>>, ApiError> {
    auth.require_admin()?;
    if payload.opportunity_id.trim().is_empty() || payload.name.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "opportunity_id and name are required".to_string(),
        ));
    }
    let pool = &deployment.db().pool;
    if Project::find_by_opportunity_id(pool, &payload.opportunity_id)
        .await?
        .is_some()
    {
        return Err(ApiError::Conflict(format!(
            "a project for opportunity {} already exists",
            payload.opportunity_id
        )));
    }

    let creator = (!auth.user.id.is_nil()).then_some(auth.user.id);
    let project = Project::create(pool, &payload, Uuid::new_v4(), creator).await?;
    info!(project_id = %project.id, opportunity_id = %project.opportunity_id, "Project created");
    Ok(ResponseJson(ApiResponse::success(project)))
}

/// GET /api/v1/projects/stats
pub async fn project_stats(
    State(deployment): State<DeploymentImpl>,
    _auth: AuthUser,
) -> Result<ResponseJson<ApiResponse<ProjectCounts>>, ApiError> {
    let counts = Project::counts(&deployment.db().pool).await?;
    Ok(ResponseJson(ApiResponse::success(counts)))
}

/// GET /api/v1/projects/{id}
pub async fn get_project(
    State(deployment): State<DeploymentImpl>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<ProjectDetail>>, ApiError> {
    let project = load_project(&deployment, id).await?;
    ensure_can_view(&deployment, &auth.user, id).await?;

    let pool = &deployment.db().pool;
    let sites = Site::find_filtered(
        pool,
        &SiteFilter {
            opportunity_id: Some(project.opportunity_id.clone()),
            ..Default::default()
        },
    )
    .await?;
    let members = ProjectMember::find_for_project(pool, id).await?;

    Ok(ResponseJson(ApiResponse::success(ProjectDetail {
        project,
        sites,
        members,
    })))
}

/// PUT /api/v1/projects/{id}
pub async fn update_project(
    State(deployment): State<DeploymentImpl>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    axum::Json(payload): axum::Json<UpdateProject>,
) -> Result<ResponseJson<ApiResponse<Project>>, ApiError> {
    load_project(&deployment, id).await?;
    ensure_can_edit(&deployment, &auth.user, id).await?;

    let project = Project::update(&deployment.db().pool, id, &payload)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("project {} not found", id)))?;
    info!(project_id = %id, user_id = %auth.user.id, "Project updated");
    Ok(ResponseJson(ApiResponse::success(project)))
}

/// DELETE /api/v1/projects/{id}
/// Archives the project; its sites and members stay.
pub async fn archive_project(
    State(deployment): State<DeploymentImpl>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    auth.require_admin()?;
    load_project(&deployment, id).await?;
    if Project::archive(&deployment.db().pool, id).await? > 0 {
        info!(project_id = %id, "Project archived");
    }
    Ok(ResponseJson(ApiResponse::success_with_message((), "Project archived")))
}

/// GET /api/v1/projects/{id}/members
pub async fn list_members(
    State(deployment): State<DeploymentImpl>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Vec<ProjectMemberWithUser>>>, ApiError> {
    load_project(&deployment, id).await?;
    ensure_can_view(&deployment, &auth.user, id).await?;
    let members = ProjectMember::find_for_project(&deployment.db().pool, id).await?;
    Ok(ResponseJson(ApiResponse::success(members)))
}

/// POST /api/v1/projects/{id}/members
pub async fn add_member(
    State(deployment): State<DeploymentImpl>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    axum::Json(payload): axum::Json<AddProjectMember>,
) -> Result<ResponseJson<ApiResponse<ProjectMember>>, ApiError> {
    load_project(&deployment, id).await?;
    ensure_can_edit(&deployment, &auth.user, id).await?;

    let pool = &deployment.db().pool;
    if User::find_by_id(pool, payload.user_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("user {} not found", payload.user_id)));
    }
    let member = ProjectMember::upsert(pool, id, &payload).await?;
    info!(project_id = %id, user_id = %member.user_id, role = %member.role, "Project member added");
    Ok(ResponseJson(ApiResponse::success(member)))
}

/// DELETE /api/v1/projects/{id}/members/{user_id}
pub async fn remove_member(
    State(deployment): State<DeploymentImpl>,
    auth: AuthUser,
    Path((id, user_id)): Path<(Uuid, Uuid)>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    ensure_can_edit(&deployment, &auth.user, id).await?;
    if ProjectMember::remove(&deployment.db().pool, id, user_id).await? == 0 {
        return Err(ApiError::NotFound("membership not found".to_string()));
    }
    info!(project_id = %id, user_id = %user_id, "Project member removed");
    Ok(ResponseJson(ApiResponse::success(())))
}

pub fn router() -> Router<DeploymentImpl> {
    Router::new().nest(
        "/projects",
        Router::new()
            .route("/", get(list_projects).post(create_project))
            .route("/stats", get(project_stats))
            .route(
                "/{id}",
                get(get_project).put(update_project).delete(archive_project),
            )
            .route("/{id}/members", get(list_members).post(add_member))
            .route("/{id}/members/{user_id}", delete(remove_member)),
    )
}
