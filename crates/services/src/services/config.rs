//! Runtime configuration, read from environment variables (a `.env` file is
//! loaded first when present).

use std::{path::PathBuf, str::FromStr, time::Duration};

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use thiserror::Error;
use tracing::debug;
use ts_rs::TS;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, TS, EnumString, Display, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    /// Picks the environment a frontend host belongs to. Unknown hosts are
    /// treated as development.
    pub fn from_hostname(hostname: &str) -> Self {
        let host = hostname.split(':').next().unwrap_or(hostname);
        if host.contains("construction-management-frontend-prod.pages.dev")
            || host == "cm-prod.pages.dev"
        {
            Self::Production
        } else {
            Self::Development
        }
    }
}

#[derive(Debug)]
pub struct CrmConfig {
    pub base_url: String,
    pub api_token: SecretString,
    pub request_timeout: Duration,
}

#[derive(Debug)]
pub struct AuthConfig {
    pub session_ttl_days: i64,
    pub max_failed_logins: i64,
    pub lockout_minutes: i64,
    pub emergency_login: bool,
    pub dev_token: Option<SecretString>,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub poll_interval: Duration,
    pub cleanup_interval: Duration,
    pub batch_size: i64,
    pub max_retries: i64,
    pub base_retry_delay_secs: i64,
    pub retention_days: i64,
    /// When set, retrying rows wait for `next_retry_at` instead of being
    /// picked up by the next poll.
    pub honor_retry_schedule: bool,
    /// How long a claimed row may stay in flight before a poll takes it back.
    pub claim_lease: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(3600),
            batch_size: 10,
            max_retries: 3,
            base_retry_delay_secs: 1,
            retention_days: 7,
            honor_retry_schedule: false,
            claim_lease: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
pub struct Config {
    pub environment: Environment,
    pub database_url: String,
    pub bind_addr: String,
    /// Public base URL of this API, reported to frontends.
    pub public_api_url: String,
    pub storage_dir: PathBuf,
    pub max_upload_bytes: usize,
    pub crm: CrmConfig,
    pub auth: AuthConfig,
    pub sync: SyncConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "Loaded .env");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset keys fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let sync_defaults = SyncConfig::default();

        let bind_addr = get("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8787".to_string());
        Ok(Self {
            environment: parse_or(&get, "ENVIRONMENT", Environment::Development)?,
            database_url: get("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://data/construction.db".to_string()),
            public_api_url: get("PUBLIC_API_URL").unwrap_or_else(|| format!("http://{}", bind_addr)),
            bind_addr,
            storage_dir: get("STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/files")),
            max_upload_bytes: parse_or(&get, "MAX_UPLOAD_BYTES", 10 * 1024 * 1024)?,
            crm: CrmConfig {
                base_url: get("CRM_API_URL")
                    .unwrap_or_else(|| "https://fx-d1-rest-api.lai-jameslai.workers.dev".to_string())
                    .trim_end_matches('/')
                    .to_string(),
                api_token: SecretString::from(get("CRM_API_TOKEN").unwrap_or_default()),
                request_timeout: Duration::from_secs(parse_or(&get, "CRM_TIMEOUT_SECS", 30)?),
            },
            auth: AuthConfig {
                session_ttl_days: parse_or(&get, "SESSION_TTL_DAYS", 30)?,
                max_failed_logins: parse_or(&get, "MAX_FAILED_LOGINS", 5)?,
                lockout_minutes: parse_or(&get, "LOCKOUT_MINUTES", 30)?,
                emergency_login: parse_or(&get, "ENABLE_EMERGENCY_LOGIN", false)?,
                dev_token: get("DEV_TOKEN").map(SecretString::from),
            },
            sync: SyncConfig {
                poll_interval: Duration::from_secs(parse_or(
                    &get,
                    "SYNC_POLL_INTERVAL_SECS",
                    sync_defaults.poll_interval.as_secs(),
                )?),
                cleanup_interval: Duration::from_secs(parse_or(
                    &get,
                    "SYNC_CLEANUP_INTERVAL_SECS",
                    sync_defaults.cleanup_interval.as_secs(),
                )?),
                honor_retry_schedule: parse_or(
                    &get,
                    "SYNC_HONOR_RETRY_SCHEDULE",
                    sync_defaults.honor_retry_schedule,
                )?,
                claim_lease: Duration::from_secs(parse_or(
                    &get,
                    "SYNC_CLAIM_LEASE_SECS",
                    sync_defaults.claim_lease.as_secs(),
                )?),
                ..sync_defaults
            },
        })
    }
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.sync.poll_interval, Duration::from_secs(30));
        assert_eq!(config.sync.max_retries, 3);
        assert!(!config.sync.honor_retry_schedule);
        assert_eq!(config.auth.session_ttl_days, 30);
        assert_eq!(config.max_upload_bytes, 10 * 1024 * 1024);
        assert!(config.auth.dev_token.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config_from(&[
            ("ENVIRONMENT", "Production"),
            ("CRM_API_URL", "https://crm.example.test/"),
            ("CRM_API_TOKEN", "secret"),
            ("SYNC_HONOR_RETRY_SCHEDULE", "true"),
            ("SYNC_CLAIM_LEASE_SECS", "60"),
            ("DEV_TOKEN", "dev-123"),
        ])
        .unwrap();
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.crm.base_url, "https://crm.example.test");
        assert_eq!(config.crm.api_token.expose_secret(), "secret");
        assert!(config.sync.honor_retry_schedule);
        assert_eq!(config.sync.claim_lease, Duration::from_secs(60));
        assert_eq!(
            config.auth.dev_token.as_ref().map(|t| t.expose_secret()),
            Some("dev-123")
        );
    }

    #[test]
    fn bad_numbers_are_rejected() {
        let err = config_from(&[("SYNC_POLL_INTERVAL_SECS", "soon")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "SYNC_POLL_INTERVAL_SECS", .. }));
    }

    #[test]
    fn environment_from_hostname() {
        assert_eq!(
            Environment::from_hostname("construction-management-frontend-prod.pages.dev"),
            Environment::Production
        );
        assert_eq!(Environment::from_hostname("cm-prod.pages.dev:443"), Environment::Production);
        assert_eq!(Environment::from_hostname("localhost:8080"), Environment::Development);
    }
}
