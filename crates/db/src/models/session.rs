use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

/// Bearer-token session backing the `Authorization` header.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub async fn create(
        pool: &SqlitePool,
        token: &str,
        user_id: Uuid,
        ttl_days: i64,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Session>(
            r#"INSERT INTO sessions (token, user_id, expires_at)
               VALUES ($1, $2, datetime('now', $3))
               RETURNING token, user_id, expires_at, created_at"#,
        )
        .bind(token)
        .bind(user_id)
        .bind(format!("+{} days", ttl_days))
        .fetch_one(pool)
        .await
    }

    /// Returns the session only while it has not expired.
    pub async fn find_active(pool: &SqlitePool, token: &str) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Session>(
            r#"SELECT token, user_id, expires_at, created_at
               FROM sessions
               WHERE token = $1
                 AND datetime(expires_at) > datetime('now')"#,
        )
        .bind(token)
        .fetch_optional(pool)
        .await
    }

    pub async fn delete(pool: &SqlitePool, token: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM sessions WHERE token = $1")
            .bind(token)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_for_user(pool: &SqlitePool, user_id: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM sessions WHERE user_id = $1")
            .bind(user_id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_expired(pool: &SqlitePool) -> Result<u64, sqlx::Error> {
        let result =
            sqlx::query("DELETE FROM sessions WHERE datetime(expires_at) <= datetime('now')")
                .execute(pool)
                .await?;
        Ok(result.rows_affected())
    }
}
