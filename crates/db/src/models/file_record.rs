use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use ts_rs::TS;
use uuid::Uuid;

/// Metadata for an uploaded blob. The bytes live in file storage under
/// `storage_key`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct FileRecord {
    pub id: Uuid,
    pub original_name: String,
    pub storage_key: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub uploaded_by: Uuid,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateFileRecord {
    pub original_name: String,
    pub storage_key: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub uploaded_by: Uuid,
}

impl FileRecord {
    pub async fn create(
        pool: &SqlitePool,
        data: &CreateFileRecord,
        file_id: Uuid,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, FileRecord>(
            r#"INSERT INTO files (id, original_name, storage_key, content_type, size_bytes, uploaded_by)
               VALUES ($1, $2, $3, $4, $5, $6)
               RETURNING id, original_name, storage_key, content_type, size_bytes, uploaded_by, uploaded_at"#,
        )
        .bind(file_id)
        .bind(&data.original_name)
        .bind(&data.storage_key)
        .bind(&data.content_type)
        .bind(data.size_bytes)
        .bind(data.uploaded_by)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, FileRecord>(
            r#"SELECT id, original_name, storage_key, content_type, size_bytes, uploaded_by, uploaded_at
               FROM files
               WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    /// Newest first; `uploaded_by = None` lists every file.
    pub async fn find_all(
        pool: &SqlitePool,
        uploaded_by: Option<Uuid>,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, FileRecord>(
            r#"SELECT id, original_name, storage_key, content_type, size_bytes, uploaded_by, uploaded_at
               FROM files
               WHERE ($1 IS NULL OR uploaded_by = $1)
               ORDER BY uploaded_at DESC"#,
        )
        .bind(uploaded_by)
        .fetch_all(pool)
        .await
    }

    pub async fn delete(pool: &SqlitePool, id: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM files WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}
