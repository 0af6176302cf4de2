//! Phone + password login backed by bearer-token sessions.

use chrono::{DateTime, Utc};
use db::{
    DBService,
    models::{
        session::Session,
        user::{User, UserRole, UserStatus},
    },
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use ts_rs::TS;
use utils::phone::normalize_phone;
use uuid::Uuid;

use super::config::AuthConfig;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid phone number")]
    InvalidPhone,
    #[error("user not found")]
    UserNotFound,
    #[error("account locked until {0}")]
    Locked(DateTime<Utc>),
    #[error("account suspended")]
    Suspended,
    #[error("wrong password, {remaining_attempts} attempts left")]
    InvalidPassword { remaining_attempts: i64 },
    #[error("invalid or expired token")]
    InvalidToken,
}

#[derive(Debug, Deserialize, TS)]
pub struct LoginRequest {
    pub phone: String,
    pub password: String,
}

#[derive(Debug, Serialize, TS)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub user: User,
}

pub struct AuthService {
    db: DBService,
    session_ttl_days: i64,
    max_failed_logins: i64,
    lockout_minutes: i64,
    emergency_token: Option<SecretString>,
}

impl AuthService {
    pub fn new(db: DBService, config: &AuthConfig) -> Self {
        let emergency_token = if config.emergency_login {
            config
                .dev_token
                .as_ref()
                .map(|token| SecretString::from(token.expose_secret().to_string()))
        } else {
            None
        };
        Self {
            db,
            session_ttl_days: config.session_ttl_days,
            max_failed_logins: config.max_failed_logins,
            lockout_minutes: config.lockout_minutes,
            emergency_token,
        }
    }

    pub fn emergency_login_enabled(&self) -> bool {
        self.emergency_token.is_some()
    }

    pub async fn login(&self, request: &LoginRequest) -> Result<LoginResponse, AuthError> {
        let phone = normalize_phone(&request.phone).ok_or(AuthError::InvalidPhone)?;
        let user = User::find_by_phone(&self.db.pool, &phone)
            .await?
            .ok_or(AuthError::UserNotFound)?;

        let now = Utc::now();
        if let Some(until) = user.locked_until.filter(|until| *until > now) {
            warn!(user_id = %user.id, "Login attempt on locked account");
            return Err(AuthError::Locked(until));
        }
        if user.status == UserStatus::Suspended {
            return Err(AuthError::Suspended);
        }

        if request.password.trim() != user.password_suffix {
            let updated = User::record_failed_login(
                &self.db.pool,
                user.id,
                self.max_failed_logins,
                self.lockout_minutes,
            )
            .await?;
            warn!(
                user_id = %user.id,
                failed_login_count = updated.failed_login_count,
                "Login failed: wrong password"
            );
            if let Some(until) = updated.locked_until.filter(|until| *until > now) {
                return Err(AuthError::Locked(until));
            }
            return Err(AuthError::InvalidPassword {
                remaining_attempts: (self.max_failed_logins - updated.failed_login_count).max(0),
            });
        }

        let user = User::record_successful_login(&self.db.pool, user.id).await?;
        let token = new_session_token();
        let session = Session::create(&self.db.pool, &token, user.id, self.session_ttl_days).await?;

        let purged = Session::delete_expired(&self.db.pool).await?;
        if purged > 0 {
            debug!(purged, "Purged expired sessions");
        }

        info!(user_id = %user.id, role = %user.global_role, "User logged in");
        Ok(LoginResponse {
            token,
            expires_at: session.expires_at,
            user,
        })
    }

    /// Resolves a bearer token to its user. Suspended users are rejected even
    /// with a live session.
    pub async fn authenticate(&self, token: &str) -> Result<User, AuthError> {
        let is_emergency = self.emergency_token.as_ref().is_some_and(|emergency| {
            let emergency = emergency.expose_secret();
            !emergency.is_empty() && token == emergency
        });
        if is_emergency {
            warn!("Emergency token used");
            return Ok(emergency_admin());
        }

        let session = Session::find_active(&self.db.pool, token)
            .await?
            .ok_or(AuthError::InvalidToken)?;
        let user = User::find_by_id(&self.db.pool, session.user_id)
            .await?
            .ok_or(AuthError::InvalidToken)?;

        if user.status == UserStatus::Suspended {
            return Err(AuthError::Suspended);
        }
        Ok(user)
    }

    pub async fn logout(&self, token: &str) -> Result<bool, AuthError> {
        Ok(Session::delete(&self.db.pool, token).await? > 0)
    }

    /// Ends every session of a user, e.g. after suspension.
    pub async fn revoke_sessions(&self, user_id: Uuid) -> Result<u64, AuthError> {
        Ok(Session::delete_for_user(&self.db.pool, user_id).await?)
    }
}

fn new_session_token() -> String {
    format!("token_{}_{}", Utc::now().timestamp_millis(), Uuid::new_v4())
}

fn emergency_admin() -> User {
    let now = Utc::now();
    User {
        id: Uuid::nil(),
        phone: "0900000000".to_string(),
        name: "Emergency Admin".to_string(),
        email: None,
        password_suffix: String::new(),
        global_role: UserRole::Admin,
        status: UserStatus::Active,
        failed_login_count: 0,
        locked_until: None,
        last_login: None,
        login_count: 0,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use db::models::user::CreateUser;

    use super::*;
    use crate::services::config::Config;

    async fn setup(emergency: bool) -> (AuthService, User) {
        let db = DBService::new_in_memory().await.unwrap();
        let user = User::create(
            &db.pool,
            &CreateUser {
                phone: "0912345678".to_string(),
                name: "張工頭".to_string(),
                email: None,
                global_role: Some(UserRole::Foreman),
            },
            Uuid::new_v4(),
        )
        .await
        .unwrap();

        let vars = [
            ("ENABLE_EMERGENCY_LOGIN", if emergency { "true" } else { "false" }),
            ("DEV_TOKEN", "dev-secret"),
        ];
        let config = Config::from_lookup(|key| {
            vars.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        })
        .unwrap();
        (AuthService::new(db, &config.auth), user)
    }

    fn login(phone: &str, password: &str) -> LoginRequest {
        LoginRequest {
            phone: phone.to_string(),
            password: password.to_string(),
        }
    }

    #[tokio::test]
    async fn login_issues_session_token() {
        let (auth, user) = setup(false).await;
        let res = auth.login(&login("+886 912-345-678", "678")).await.unwrap();

        assert!(res.token.starts_with("token_"));
        assert_eq!(res.user.id, user.id);
        assert_eq!(res.user.status, UserStatus::Active);
        assert!(res.expires_at > Utc::now() + chrono::Duration::days(29));

        let resolved = auth.authenticate(&res.token).await.unwrap();
        assert_eq!(resolved.id, user.id);

        assert!(auth.logout(&res.token).await.unwrap());
        assert!(matches!(
            auth.authenticate(&res.token).await,
            Err(AuthError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn five_wrong_passwords_lock_the_account() {
        let (auth, _) = setup(false).await;
        for attempt in 1..=4 {
            match auth.login(&login("0912345678", "000")).await {
                Err(AuthError::InvalidPassword { remaining_attempts }) => {
                    assert_eq!(remaining_attempts, 5 - attempt)
                }
                other => panic!("unexpected result: {:?}", other.map(|r| r.token)),
            }
        }
        assert!(matches!(
            auth.login(&login("0912345678", "000")).await,
            Err(AuthError::Locked(_))
        ));
        // Correct password does not bypass the lock.
        assert!(matches!(
            auth.login(&login("0912345678", "678")).await,
            Err(AuthError::Locked(_))
        ));
    }

    #[tokio::test]
    async fn rejects_bad_phone_and_unknown_user() {
        let (auth, _) = setup(false).await;
        assert!(matches!(
            auth.login(&login("12345", "345")).await,
            Err(AuthError::InvalidPhone)
        ));
        assert!(matches!(
            auth.login(&login("0999999999", "999")).await,
            Err(AuthError::UserNotFound)
        ));
    }

    #[tokio::test]
    async fn suspended_users_cannot_log_in() {
        let (auth, user) = setup(false).await;
        User::update(
            &auth.db.pool,
            user.id,
            &db::models::user::UpdateUser {
                status: Some(UserStatus::Suspended),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(matches!(
            auth.login(&login("0912345678", "678")).await,
            Err(AuthError::Suspended)
        ));
    }

    #[tokio::test]
    async fn emergency_token_only_when_enabled() {
        let (disabled, _) = setup(false).await;
        assert!(disabled.authenticate("dev-secret").await.is_err());

        let (enabled, _) = setup(true).await;
        let admin = enabled.authenticate("dev-secret").await.unwrap();
        assert!(admin.is_admin());
    }
}
