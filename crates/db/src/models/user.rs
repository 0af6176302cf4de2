use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use strum_macros::{Display, EnumString};
use ts_rs::TS;
use utils::phone::password_suffix;
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS, EnumString, Display, Default,
)]
#[sqlx(type_name = "user_role", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum UserRole {
    Admin,
    Owner,
    #[default]
    Worker,
    Foreman,
}

#[derive(
    Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS, EnumString, Display, Default,
)]
#[sqlx(type_name = "user_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum UserStatus {
    #[default]
    Pending,
    Active,
    Suspended,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct User {
    pub id: Uuid,
    pub phone: String,
    pub name: String,
    pub email: Option<String>,
    #[serde(skip_serializing, default)]
    #[ts(skip)]
    pub password_suffix: String,
    pub global_role: UserRole,
    pub status: UserStatus,
    pub failed_login_count: i64,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_login: Option<DateTime<Utc>>,
    pub login_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, TS)]
pub struct CreateUser {
    /// Must already be normalized to the `09xxxxxxxx` form.
    pub phone: String,
    pub name: String,
    pub email: Option<String>,
    pub global_role: Option<UserRole>,
}

#[derive(Debug, Clone, Default, Deserialize, TS)]
pub struct UpdateUser {
    pub name: Option<String>,
    pub email: Option<String>,
    pub global_role: Option<UserRole>,
    pub status: Option<UserStatus>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.global_role == UserRole::Admin
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"SELECT id, phone, name, email, password_suffix, global_role, status,
                      failed_login_count, locked_until, last_login, login_count,
                      created_at, updated_at
               FROM users
               WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_by_phone(pool: &SqlitePool, phone: &str) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"SELECT id, phone, name, email, password_suffix, global_role, status,
                      failed_login_count, locked_until, last_login, login_count,
                      created_at, updated_at
               FROM users
               WHERE phone = $1"#,
        )
        .bind(phone)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_all(pool: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"SELECT id, phone, name, email, password_suffix, global_role, status,
                      failed_login_count, locked_until, last_login, login_count,
                      created_at, updated_at
               FROM users
               ORDER BY created_at ASC"#,
        )
        .fetch_all(pool)
        .await
    }

    pub async fn create(
        pool: &SqlitePool,
        data: &CreateUser,
        user_id: Uuid,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"INSERT INTO users (id, phone, name, email, password_suffix, global_role)
               VALUES ($1, $2, $3, $4, $5, $6)
               RETURNING id, phone, name, email, password_suffix, global_role, status,
                         failed_login_count, locked_until, last_login, login_count,
                         created_at, updated_at"#,
        )
        .bind(user_id)
        .bind(&data.phone)
        .bind(&data.name)
        .bind(&data.email)
        .bind(password_suffix(&data.phone))
        .bind(data.global_role.unwrap_or_default())
        .fetch_one(pool)
        .await
    }

    pub async fn update(
        pool: &SqlitePool,
        id: Uuid,
        data: &UpdateUser,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"UPDATE users
               SET name = COALESCE($2, name),
                   email = COALESCE($3, email),
                   global_role = COALESCE($4, global_role),
                   status = COALESCE($5, status),
                   updated_at = datetime('now', 'subsec')
               WHERE id = $1
               RETURNING id, phone, name, email, password_suffix, global_role, status,
                         failed_login_count, locked_until, last_login, login_count,
                         created_at, updated_at"#,
        )
        .bind(id)
        .bind(&data.name)
        .bind(&data.email)
        .bind(data.global_role)
        .bind(data.status)
        .fetch_optional(pool)
        .await
    }

    /// Counts a failed password attempt. Once the count reaches
    /// `max_attempts` the account is locked for `lock_minutes`.
    pub async fn record_failed_login(
        pool: &SqlitePool,
        id: Uuid,
        max_attempts: i64,
        lock_minutes: i64,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"UPDATE users
               SET failed_login_count = failed_login_count + 1,
                   locked_until = CASE
                       WHEN failed_login_count + 1 >= $2 THEN datetime('now', $3)
                       ELSE locked_until
                   END,
                   updated_at = datetime('now', 'subsec')
               WHERE id = $1
               RETURNING id, phone, name, email, password_suffix, global_role, status,
                         failed_login_count, locked_until, last_login, login_count,
                         created_at, updated_at"#,
        )
        .bind(id)
        .bind(max_attempts)
        .bind(format!("+{} minutes", lock_minutes))
        .fetch_one(pool)
        .await
    }

    /// Clears the lockout counters and activates a pending account.
    pub async fn record_successful_login(pool: &SqlitePool, id: Uuid) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"UPDATE users
               SET failed_login_count = 0,
                   locked_until = NULL,
                   last_login = datetime('now', 'subsec'),
                   login_count = login_count + 1,
                   status = CASE WHEN status = 'pending' THEN 'active' ELSE status END,
                   updated_at = datetime('now', 'subsec')
               WHERE id = $1
               RETURNING id, phone, name, email, password_suffix, global_role, status,
                         failed_login_count, locked_until, last_login, login_count,
                         created_at, updated_at"#,
        )
        .bind(id)
        .fetch_one(pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DBService;

    fn new_user(phone: &str) -> CreateUser {
        CreateUser {
            phone: phone.to_string(),
            name: "王小明".to_string(),
            email: None,
            global_role: None,
        }
    }

    #[tokio::test]
    async fn create_derives_password_suffix_and_defaults() {
        let db = DBService::new_in_memory().await.unwrap();
        let user = User::create(&db.pool, &new_user("0912345678"), Uuid::new_v4())
            .await
            .unwrap();

        assert_eq!(user.password_suffix, "678");
        assert_eq!(user.global_role, UserRole::Worker);
        assert_eq!(user.status, UserStatus::Pending);
        assert!(!user.is_locked(Utc::now()));
    }

    #[tokio::test]
    async fn failed_logins_lock_at_threshold() {
        let db = DBService::new_in_memory().await.unwrap();
        let user = User::create(&db.pool, &new_user("0987654321"), Uuid::new_v4())
            .await
            .unwrap();

        let mut latest = user.clone();
        for _ in 0..4 {
            latest = User::record_failed_login(&db.pool, user.id, 5, 30).await.unwrap();
        }
        assert_eq!(latest.failed_login_count, 4);
        assert!(latest.locked_until.is_none());

        latest = User::record_failed_login(&db.pool, user.id, 5, 30).await.unwrap();
        assert!(latest.is_locked(Utc::now()));

        let cleared = User::record_successful_login(&db.pool, user.id).await.unwrap();
        assert_eq!(cleared.failed_login_count, 0);
        assert_eq!(cleared.login_count, 1);
        assert_eq!(cleared.status, UserStatus::Active);
        assert!(cleared.locked_until.is_none());
    }
}
