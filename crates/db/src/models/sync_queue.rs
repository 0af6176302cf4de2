//! Outbox of local changes waiting to be pushed to the CRM.
//!
//! Rows move `pending -> in_flight -> completed | pending (retry) | failed`.
//! Only the transition into `in_flight` is contended, and [`SyncQueueItem::claim`]
//! makes it atomic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, SqlitePool, Type, types::Json};
use strum_macros::{Display, EnumString};
use ts_rs::TS;

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS, EnumString, Display)]
#[sqlx(type_name = "sync_object_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SyncObjectType {
    Site,
    Worker,
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS, EnumString, Display)]
#[sqlx(type_name = "sync_operation", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SyncOperation {
    Update,
    Delete,
}

#[derive(
    Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS, EnumString, Display, Default,
)]
#[sqlx(type_name = "sync_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Pending,
    InFlight,
    Completed,
    Failed,
}

/// Where an item sits in its lifecycle. `Retrying` is a pending row that
/// has already failed at least once.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncState {
    Pending,
    InFlight,
    Retrying { attempt: i64 },
    Completed,
    Failed,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct SyncQueueItem {
    pub id: i64,
    pub object_type: SyncObjectType,
    pub object_id: String,
    pub operation: SyncOperation,
    pub payload: Value,
    pub status: SyncStatus,
    pub retry_count: i64,
    pub error_message: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Per-status counts over a time window.
#[derive(Debug, Clone, Default, FromRow, Serialize, Deserialize, TS)]
pub struct SyncStats {
    pub total: i64,
    pub pending: i64,
    pub in_flight: i64,
    pub completed: i64,
    pub failed: i64,
}

impl SyncQueueItem {
    pub fn state(&self) -> SyncState {
        match self.status {
            SyncStatus::Pending if self.retry_count > 0 => SyncState::Retrying {
                attempt: self.retry_count,
            },
            SyncStatus::Pending => SyncState::Pending,
            SyncStatus::InFlight => SyncState::InFlight,
            SyncStatus::Completed => SyncState::Completed,
            SyncStatus::Failed => SyncState::Failed,
        }
    }

    /// Queues a change. A still-pending row for the same object absorbs it:
    /// updates merge into the queued payload (newer keys win), anything else
    /// replaces operation and payload. Either way the retry budget restarts.
    pub async fn enqueue(
        pool: &SqlitePool,
        object_type: SyncObjectType,
        object_id: &str,
        operation: SyncOperation,
        payload: &Value,
    ) -> Result<Self, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let coalesced = sqlx::query_as::<_, SyncQueueItem>(
            r#"UPDATE sync_queue
               SET payload = CASE
                       WHEN operation = 'update' AND $3 = 'update' THEN json_patch(payload, $4)
                       ELSE $4
                   END,
                   operation = $3,
                   retry_count = 0,
                   error_message = NULL,
                   next_retry_at = NULL,
                   updated_at = datetime('now', 'subsec')
               WHERE id = (
                   SELECT id FROM sync_queue
                   WHERE object_type = $1 AND object_id = $2 AND status = 'pending'
                   ORDER BY id DESC
                   LIMIT 1)
               RETURNING id, object_type, object_id, operation, payload, status, retry_count,
                         error_message, next_retry_at, created_at, updated_at, completed_at"#,
        )
        .bind(object_type)
        .bind(object_id)
        .bind(operation)
        .bind(Json(payload))
        .fetch_optional(&mut *tx)
        .await?;

        let item = match coalesced {
            Some(item) => item,
            None => {
                sqlx::query_as::<_, SyncQueueItem>(
                    r#"INSERT INTO sync_queue (object_type, object_id, operation, payload)
                       VALUES ($1, $2, $3, $4)
                       RETURNING id, object_type, object_id, operation, payload, status,
                                 retry_count, error_message, next_retry_at, created_at,
                                 updated_at, completed_at"#,
                )
                .bind(object_type)
                .bind(object_id)
                .bind(operation)
                .bind(Json(payload))
                .fetch_one(&mut *tx)
                .await?
            }
        };

        tx.commit().await?;
        Ok(item)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: i64) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, SyncQueueItem>(
            r#"SELECT id, object_type, object_id, operation, payload, status, retry_count,
                      error_message, next_retry_at, created_at, updated_at, completed_at
               FROM sync_queue
               WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    /// Oldest-first batch of rows eligible for processing: pending rows plus
    /// failed rows that still have retry budget. With `honor_schedule`, rows
    /// whose `next_retry_at` lies in the future are held back.
    pub async fn find_ready(
        pool: &SqlitePool,
        max_retries: i64,
        limit: i64,
        honor_schedule: bool,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, SyncQueueItem>(
            r#"SELECT id, object_type, object_id, operation, payload, status, retry_count,
                      error_message, next_retry_at, created_at, updated_at, completed_at
               FROM sync_queue
               WHERE (status = 'pending' OR (status = 'failed' AND retry_count < $1))
                 AND ($3 = 0
                      OR next_retry_at IS NULL
                      OR datetime(next_retry_at) <= datetime('now'))
               ORDER BY created_at ASC, id ASC
               LIMIT $2"#,
        )
        .bind(max_retries)
        .bind(limit)
        .bind(honor_schedule)
        .fetch_all(pool)
        .await
    }

    pub async fn find_recent(
        pool: &SqlitePool,
        status: Option<SyncStatus>,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, SyncQueueItem>(
            r#"SELECT id, object_type, object_id, operation, payload, status, retry_count,
                      error_message, next_retry_at, created_at, updated_at, completed_at
               FROM sync_queue
               WHERE ($1 IS NULL OR status = $1)
               ORDER BY id DESC
               LIMIT $2"#,
        )
        .bind(status)
        .bind(limit)
        .fetch_all(pool)
        .await
    }

    /// Moves the row to `in_flight` and returns it as claimed. `None` means
    /// another poll got there first or the row is no longer eligible.
    pub async fn claim(
        pool: &SqlitePool,
        id: i64,
        max_retries: i64,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, SyncQueueItem>(
            r#"UPDATE sync_queue
               SET status = 'in_flight', updated_at = datetime('now', 'subsec')
               WHERE id = $1
                 AND (status = 'pending' OR (status = 'failed' AND retry_count < $2))
               RETURNING id, object_type, object_id, operation, payload, status, retry_count,
                         error_message, next_retry_at, created_at, updated_at, completed_at"#,
        )
        .bind(id)
        .bind(max_retries)
        .fetch_optional(pool)
        .await
    }

    pub async fn mark_completed(pool: &SqlitePool, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE sync_queue
               SET status = 'completed',
                   error_message = NULL,
                   next_retry_at = NULL,
                   completed_at = datetime('now', 'subsec'),
                   updated_at = datetime('now', 'subsec')
               WHERE id = $1"#,
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Puts a failed attempt back in line, due again after `delay_secs`.
    pub async fn schedule_retry(
        pool: &SqlitePool,
        id: i64,
        retry_count: i64,
        error: &str,
        delay_secs: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE sync_queue
               SET status = 'pending',
                   retry_count = $2,
                   error_message = $3,
                   next_retry_at = datetime('now', $4),
                   updated_at = datetime('now', 'subsec')
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(retry_count)
        .bind(error)
        .bind(format!("+{} seconds", delay_secs))
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(
        pool: &SqlitePool,
        id: i64,
        retry_count: i64,
        error: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE sync_queue
               SET status = 'failed',
                   retry_count = $2,
                   error_message = $3,
                   next_retry_at = NULL,
                   updated_at = datetime('now', 'subsec')
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(retry_count)
        .bind(error)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Gives every failed row a fresh retry budget.
    pub async fn reset_failed(pool: &SqlitePool) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"UPDATE sync_queue
               SET status = 'pending',
                   retry_count = 0,
                   error_message = NULL,
                   next_retry_at = NULL,
                   updated_at = datetime('now', 'subsec')
               WHERE status = 'failed'"#,
        )
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Returns rows left `in_flight` by an interrupted process to `pending`.
    pub async fn release_in_flight(pool: &SqlitePool) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"UPDATE sync_queue
               SET status = 'pending', updated_at = datetime('now', 'subsec')
               WHERE status = 'in_flight'"#,
        )
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Hands a claimed row back to the queue after its result could not be
    /// recorded.
    pub async fn release_claim(pool: &SqlitePool, id: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"UPDATE sync_queue
               SET status = 'pending', updated_at = datetime('now', 'subsec')
               WHERE id = $1 AND status = 'in_flight'"#,
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Requeues rows whose claim is older than `lease_secs`. A claim stamps
    /// `updated_at` and nothing else touches an in-flight row, so that is
    /// the claim time.
    pub async fn release_stale_claims(pool: &SqlitePool, lease_secs: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"UPDATE sync_queue
               SET status = 'pending', updated_at = datetime('now', 'subsec')
               WHERE status = 'in_flight'
                 AND datetime(updated_at) < datetime('now', $1)"#,
        )
        .bind(format!("-{} seconds", lease_secs))
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Whether the object still has a change waiting or being pushed.
    pub async fn has_open(
        pool: &SqlitePool,
        object_type: SyncObjectType,
        object_id: &str,
    ) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar::<_, bool>(
            r#"SELECT EXISTS(
                   SELECT 1 FROM sync_queue
                   WHERE object_type = $1 AND object_id = $2
                     AND status IN ('pending', 'in_flight'))"#,
        )
        .bind(object_type)
        .bind(object_id)
        .fetch_one(pool)
        .await
    }

    pub async fn delete_completed_older_than(
        pool: &SqlitePool,
        days: i64,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"DELETE FROM sync_queue
               WHERE status = 'completed'
                 AND completed_at IS NOT NULL
                 AND datetime(completed_at) < datetime('now', $1)"#,
        )
        .bind(format!("-{} days", days))
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn stats_since_hours(pool: &SqlitePool, hours: i64) -> Result<SyncStats, sqlx::Error> {
        sqlx::query_as::<_, SyncStats>(
            r#"SELECT COUNT(*) AS total,
                      COALESCE(SUM(status = 'pending'), 0) AS pending,
                      COALESCE(SUM(status = 'in_flight'), 0) AS in_flight,
                      COALESCE(SUM(status = 'completed'), 0) AS completed,
                      COALESCE(SUM(status = 'failed'), 0) AS failed
               FROM sync_queue
               WHERE datetime(created_at) > datetime('now', $1)"#,
        )
        .bind(format!("-{} hours", hours))
        .fetch_one(pool)
        .await
    }
}
