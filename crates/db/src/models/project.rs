use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, SqlitePool, Type, types::Json};
use strum_macros::{Display, EnumString};
use ts_rs::TS;
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS, EnumString, Display, Default,
)]
#[sqlx(type_name = "project_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProjectStatus {
    #[default]
    Active,
    Archived,
}

/// A construction project, keyed to one CRM opportunity.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct Project {
    pub id: Uuid,
    pub opportunity_id: String,
    pub name: String,
    pub spc_engineering: Value,
    pub cabinet_engineering: Value,
    pub permissions: Value,
    /// Cached site progress, refreshed by [`Project::refresh_stats`].
    pub stats: Value,
    pub status: ProjectStatus,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, TS)]
pub struct CreateProject {
    pub opportunity_id: String,
    pub name: String,
    pub spc_engineering: Option<Value>,
    pub cabinet_engineering: Option<Value>,
    pub permissions: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize, TS)]
pub struct UpdateProject {
    pub name: Option<String>,
    pub spc_engineering: Option<Value>,
    pub cabinet_engineering: Option<Value>,
    pub permissions: Option<Value>,
    pub status: Option<ProjectStatus>,
}

#[derive(Debug, Clone, Default, Deserialize, TS)]
pub struct ProjectFilter {
    pub status: Option<ProjectStatus>,
    pub search: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Default, FromRow, Serialize, Deserialize, TS)]
pub struct ProjectCounts {
    pub total: i64,
    pub active: i64,
    pub archived: i64,
}

impl Project {
    pub const DEFAULT_PAGE_SIZE: i64 = 50;

    /// Lists projects matching `filter`. With `member_id` set, only projects
    /// that user belongs to are returned.
    pub async fn find_filtered(
        pool: &SqlitePool,
        filter: &ProjectFilter,
        member_id: Option<Uuid>,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Project>(
            r#"SELECT p.id, p.opportunity_id, p.name, p.spc_engineering, p.cabinet_engineering,
                      p.permissions, p.stats, p.status, p.created_by, p.created_at, p.updated_at
               FROM projects p
               WHERE ($1 IS NULL OR p.status = $1)
                 AND ($2 IS NULL OR p.name LIKE '%' || $2 || '%' OR p.opportunity_id LIKE '%' || $2 || '%')
                 AND ($3 IS NULL OR EXISTS (
                        SELECT 1 FROM project_members m
                        WHERE m.project_id = p.id AND m.user_id = $3))
               ORDER BY p.updated_at DESC
               LIMIT $4 OFFSET $5"#,
        )
        .bind(filter.status)
        .bind(&filter.search)
        .bind(member_id)
        .bind(filter.limit.unwrap_or(Self::DEFAULT_PAGE_SIZE))
        .bind(filter.offset.unwrap_or(0))
        .fetch_all(pool)
        .await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Project>(
            r#"SELECT id, opportunity_id, name, spc_engineering, cabinet_engineering,
                      permissions, stats, status, created_by, created_at, updated_at
               FROM projects
               WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_by_opportunity_id(
        pool: &SqlitePool,
        opportunity_id: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Project>(
            r#"SELECT id, opportunity_id, name, spc_engineering, cabinet_engineering,
                      permissions, stats, status, created_by, created_at, updated_at
               FROM projects
               WHERE opportunity_id = $1"#,
        )
        .bind(opportunity_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn create(
        pool: &SqlitePool,
        data: &CreateProject,
        project_id: Uuid,
        created_by: Option<Uuid>,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Project>(
            r#"INSERT INTO projects (id, opportunity_id, name, spc_engineering,
                                     cabinet_engineering, permissions, created_by)
               VALUES ($1, $2, $3,
                       COALESCE($4, '{"enabled":false}'),
                       COALESCE($5, '{"enabled":false}'),
                       COALESCE($6, '{}'),
                       $7)
               RETURNING id, opportunity_id, name, spc_engineering, cabinet_engineering,
                         permissions, stats, status, created_by, created_at, updated_at"#,
        )
        .bind(project_id)
        .bind(&data.opportunity_id)
        .bind(&data.name)
        .bind(data.spc_engineering.as_ref().map(Json))
        .bind(data.cabinet_engineering.as_ref().map(Json))
        .bind(data.permissions.as_ref().map(Json))
        .bind(created_by)
        .fetch_one(pool)
        .await
    }

    pub async fn update(
        pool: &SqlitePool,
        id: Uuid,
        data: &UpdateProject,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Project>(
            r#"UPDATE projects
               SET name = COALESCE($2, name),
                   spc_engineering = COALESCE($3, spc_engineering),
                   cabinet_engineering = COALESCE($4, cabinet_engineering),
                   permissions = COALESCE($5, permissions),
                   status = COALESCE($6, status),
                   updated_at = datetime('now', 'subsec')
               WHERE id = $1
               RETURNING id, opportunity_id, name, spc_engineering, cabinet_engineering,
                         permissions, stats, status, created_by, created_at, updated_at"#,
        )
        .bind(id)
        .bind(&data.name)
        .bind(data.spc_engineering.as_ref().map(Json))
        .bind(data.cabinet_engineering.as_ref().map(Json))
        .bind(data.permissions.as_ref().map(Json))
        .bind(data.status)
        .fetch_optional(pool)
        .await
    }

    /// Soft delete. Projects are never removed from the table.
    pub async fn archive(pool: &SqlitePool, id: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"UPDATE projects
               SET status = 'archived', updated_at = datetime('now', 'subsec')
               WHERE id = $1 AND status != 'archived'"#,
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Recomputes the cached `stats` blob from the project's sites.
    pub async fn refresh_stats(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Project>(
            r#"UPDATE projects
               SET stats = (
                       SELECT json_object(
                           'total', COUNT(*),
                           'completed', COALESCE(SUM(s.completed), 0),
                           'progress', CASE
                               WHEN COUNT(*) = 0 THEN 0
                               ELSE CAST(ROUND(SUM(s.completed) * 100.0 / COUNT(*)) AS INTEGER)
                           END)
                       FROM sites s
                       WHERE s.opportunity_id = projects.opportunity_id),
                   updated_at = datetime('now', 'subsec')
               WHERE id = $1
               RETURNING id, opportunity_id, name, spc_engineering, cabinet_engineering,
                         permissions, stats, status, created_by, created_at, updated_at"#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    pub async fn counts(pool: &SqlitePool) -> Result<ProjectCounts, sqlx::Error> {
        sqlx::query_as::<_, ProjectCounts>(
            r#"SELECT COUNT(*) AS total,
                      COALESCE(SUM(status = 'active'), 0) AS active,
                      COALESCE(SUM(status = 'archived'), 0) AS archived
               FROM projects"#,
        )
        .fetch_one(pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::DBService;

    fn new_project(opportunity_id: &str, name: &str) -> CreateProject {
        CreateProject {
            opportunity_id: opportunity_id.to_string(),
            name: name.to_string(),
            spc_engineering: Some(json!({ "enabled": true, "types": ["floor"] })),
            cabinet_engineering: None,
            permissions: None,
        }
    }

    #[tokio::test]
    async fn create_applies_engineering_defaults() {
        let db = DBService::new_in_memory().await.unwrap();
        let project = Project::create(&db.pool, &new_project("opp-1", "興安華城"), Uuid::new_v4(), None)
            .await
            .unwrap();

        assert_eq!(project.status, ProjectStatus::Active);
        assert_eq!(project.spc_engineering["enabled"], true);
        assert_eq!(project.cabinet_engineering, json!({ "enabled": false }));
        assert_eq!(project.permissions, json!({}));
    }

    #[tokio::test]
    async fn archive_is_a_soft_delete() {
        let db = DBService::new_in_memory().await.unwrap();
        let project = Project::create(&db.pool, &new_project("opp-2", "勝興-興安西"), Uuid::new_v4(), None)
            .await
            .unwrap();

        assert_eq!(Project::archive(&db.pool, project.id).await.unwrap(), 1);
        assert_eq!(Project::archive(&db.pool, project.id).await.unwrap(), 0);

        let archived = Project::find_by_id(&db.pool, project.id).await.unwrap().unwrap();
        assert_eq!(archived.status, ProjectStatus::Archived);

        let counts = Project::counts(&db.pool).await.unwrap();
        assert_eq!(counts.total, 1);
        assert_eq!(counts.archived, 1);
    }

    #[tokio::test]
    async fn filter_by_search_and_status() {
        let db = DBService::new_in_memory().await.unwrap();
        Project::create(&db.pool, &new_project("opp-a", "樂田仁愛"), Uuid::new_v4(), None)
            .await
            .unwrap();
        let other = Project::create(&db.pool, &new_project("opp-b", "富田新城"), Uuid::new_v4(), None)
            .await
            .unwrap();
        Project::archive(&db.pool, other.id).await.unwrap();

        let filter = ProjectFilter {
            search: Some("樂田".to_string()),
            ..Default::default()
        };
        let found = Project::find_filtered(&db.pool, &filter, None).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].opportunity_id, "opp-a");

        let filter = ProjectFilter {
            status: Some(ProjectStatus::Archived),
            ..Default::default()
        };
        let found = Project::find_filtered(&db.pool, &filter, None).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, other.id);
    }
}
