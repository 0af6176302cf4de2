use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use strum_macros::{Display, EnumString};
use ts_rs::TS;
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS, EnumString, Display, Default,
)]
#[sqlx(type_name = "life_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LifeStatus {
    #[default]
    Normal,
    Void,
}

/// How the local worker row relates to its CRM copy.
#[derive(
    Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS, EnumString, Display, Default,
)]
#[sqlx(type_name = "worker_sync_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WorkerSyncStatus {
    #[default]
    LocalOnly,
    Pending,
    Synced,
    Failed,
}

/// A tradesperson (工地師父) who can be assigned to sites.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct Worker {
    pub id: Uuid,
    pub crm_id: Option<String>,
    pub name: String,
    pub phone: Option<String>,
    pub abbreviation: Option<String>,
    pub team_id: Option<String>,
    pub line_user_id: Option<String>,
    pub life_status: LifeStatus,
    pub sync_status: WorkerSyncStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, TS)]
pub struct CreateWorker {
    pub crm_id: Option<String>,
    pub name: String,
    pub phone: Option<String>,
    pub abbreviation: Option<String>,
    pub team_id: Option<String>,
    pub line_user_id: Option<String>,
}

/// Partial worker update; serializes to the set fields only.
#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
pub struct UpdateWorker {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abbreviation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_user_id: Option<String>,
}

impl Worker {
    pub async fn find_all(pool: &SqlitePool, team_id: Option<&str>) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Worker>(
            r#"SELECT id, crm_id, name, phone, abbreviation, team_id, line_user_id,
                      life_status, sync_status, created_at, updated_at
               FROM workers
               WHERE life_status = 'normal'
                 AND ($1 IS NULL OR team_id = $1)
               ORDER BY name ASC"#,
        )
        .bind(team_id)
        .fetch_all(pool)
        .await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Worker>(
            r#"SELECT id, crm_id, name, phone, abbreviation, team_id, line_user_id,
                      life_status, sync_status, created_at, updated_at
               FROM workers
               WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    pub async fn create(
        pool: &SqlitePool,
        data: &CreateWorker,
        worker_id: Uuid,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Worker>(
            r#"INSERT INTO workers (id, crm_id, name, phone, abbreviation, team_id, line_user_id,
                                    sync_status)
               VALUES ($1, $2, $3, $4, $5, $6, $7,
                       CASE WHEN $2 IS NULL THEN 'local_only' ELSE 'synced' END)
               RETURNING id, crm_id, name, phone, abbreviation, team_id, line_user_id,
                         life_status, sync_status, created_at, updated_at"#,
        )
        .bind(worker_id)
        .bind(&data.crm_id)
        .bind(&data.name)
        .bind(&data.phone)
        .bind(&data.abbreviation)
        .bind(&data.team_id)
        .bind(&data.line_user_id)
        .fetch_one(pool)
        .await
    }

    pub async fn update(
        pool: &SqlitePool,
        id: Uuid,
        data: &UpdateWorker,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Worker>(
            r#"UPDATE workers
               SET name = COALESCE($2, name),
                   phone = COALESCE($3, phone),
                   abbreviation = COALESCE($4, abbreviation),
                   team_id = COALESCE($5, team_id),
                   line_user_id = COALESCE($6, line_user_id),
                   updated_at = datetime('now', 'subsec')
               WHERE id = $1
               RETURNING id, crm_id, name, phone, abbreviation, team_id, line_user_id,
                         life_status, sync_status, created_at, updated_at"#,
        )
        .bind(id)
        .bind(&data.name)
        .bind(&data.phone)
        .bind(&data.abbreviation)
        .bind(&data.team_id)
        .bind(&data.line_user_id)
        .fetch_optional(pool)
        .await
    }

    /// Marks the worker void. Rows stay for history, like the CRM does.
    pub async fn mark_void(pool: &SqlitePool, id: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"UPDATE workers
               SET life_status = 'void', updated_at = datetime('now', 'subsec')
               WHERE id = $1 AND life_status != 'void'"#,
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn set_sync_status(
        pool: &SqlitePool,
        id: Uuid,
        status: WorkerSyncStatus,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"UPDATE workers
               SET sync_status = $2, updated_at = datetime('now', 'subsec')
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(status)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Sync results arrive keyed by CRM id.
    pub async fn set_sync_status_by_crm_id(
        pool: &SqlitePool,
        crm_id: &str,
        status: WorkerSyncStatus,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"UPDATE workers
               SET sync_status = $2, updated_at = datetime('now', 'subsec')
               WHERE crm_id = $1"#,
        )
        .bind(crm_id)
        .bind(status)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}
