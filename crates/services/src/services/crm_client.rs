//! Client for the CRM REST proxy that fronts the site and worker objects.

use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use super::config::CrmConfig;

const SITE_OBJECT: &str = "object_8W9cb__c";
const WORKER_OBJECT: &str = "object_50HJ8__c";
/// Site field holding the owning opportunity id.
pub const SITE_OPPORTUNITY_FIELD: &str = "field_1P96q__c";
/// `life_status` value the CRM uses for voided records.
pub const VOID_LIFE_STATUS: &str = "作废";

/// Local site column -> CRM field.
pub const SITE_FIELD_MAP: &[(&str, &str)] = &[
    ("name", "name"),
    ("building", "field_WD7k1__c"),
    ("floor", "field_Q6Svh__c"),
    ("unit", "field_XuJP2__c"),
    ("team_name", "shift_time__c"),
    ("worker_name", "field_u1wpv__c"),
    ("construction_date", "field_23pFq__c"),
    ("construction_area", "field_B2gh1__c"),
    ("completed", "construction_completed__c"),
    ("before_notes", "field_sF6fn__c"),
    ("completion_notes", "work_shift_completion_note__c"),
    ("before_photo_url", "field_V3d91__c"),
    ("after_photo_url", "field_3Fqof__c"),
    ("stage", "field_z9H6O__c"),
];

/// Local worker column -> CRM field.
pub const WORKER_FIELD_MAP: &[(&str, &str)] = &[
    ("name", "name"),
    ("phone", "phone_number__c"),
    ("abbreviation", "abbreviation__c"),
    ("team_id", "field_D1087__c"),
    ("line_user_id", "LINE_user_id__c"),
];

#[derive(Debug, Clone, Error)]
pub enum CrmError {
    #[error("network error: {0}")]
    Transport(String),
    #[error("timeout")]
    Timeout,
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("rate limited")]
    RateLimited,
    #[error("crm rejected the api token")]
    Unauthorized,
    #[error("crm record not found: {0}")]
    NotFound(String),
    #[error("json error: {0}")]
    Serde(String),
}

impl CrmError {
    /// Returns true if the error is transient and should be retried.
    pub fn should_retry(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout | Self::RateLimited => true,
            Self::Http { status, .. } => (500..=599).contains(status),
            _ => false,
        }
    }
}

/// Renames local keys to CRM field names. Keys without a mapping are dropped.
pub fn to_crm_fields(map: &[(&str, &str)], local: &Value) -> Map<String, Value> {
    let Some(object) = local.as_object() else {
        return Map::new();
    };
    map.iter()
        .filter_map(|(local_key, crm_key)| {
            object
                .get(*local_key)
                .map(|value| (crm_key.to_string(), value.clone()))
        })
        .collect()
}

/// Inverse of [`to_crm_fields`].
pub fn from_crm_fields(map: &[(&str, &str)], crm: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .filter_map(|(local_key, crm_key)| {
            crm.get(*crm_key)
                .filter(|value| !value.is_null())
                .map(|value| (local_key.to_string(), value.clone()))
        })
        .collect()
}

/// A site record as returned by the proxy. Field names stay CRM-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrmRecord {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<CrmRecord>,
}

/// The operations the rest of the system needs from the CRM.
#[async_trait]
pub trait CrmGateway: Send + Sync {
    async fn list_sites(&self, opportunity_id: &str, limit: u32) -> Result<Vec<CrmRecord>, CrmError>;

    async fn get_site(&self, site_id: &str) -> Result<CrmRecord, CrmError>;

    /// `fields` are already CRM field names.
    async fn update_site(&self, site_id: &str, fields: Map<String, Value>) -> Result<(), CrmError>;

    /// The CRM never hard-deletes; records are voided.
    async fn delete_site(&self, site_id: &str) -> Result<(), CrmError>;

    async fn update_worker(&self, worker_id: &str, fields: Map<String, Value>) -> Result<(), CrmError>;

    async fn delete_worker(&self, worker_id: &str) -> Result<(), CrmError>;
}

#[derive(Debug)]
pub struct CrmClient {
    http: Client,
    base_url: String,
    api_token: SecretString,
}

impl CrmClient {
    pub fn new(config: &CrmConfig) -> Result<Self, CrmError> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("construction-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CrmError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            api_token: SecretString::from(config.api_token.expose_secret().to_string()),
        })
    }

    fn object_url(&self, object: &str) -> String {
        format!("{}/rest/{}", self.base_url, object)
    }

    fn retry_policy() -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(30))
            .with_max_times(3)
            .with_jitter()
    }

    /// Reads are idempotent, so transient failures are retried here. Writes
    /// are retried by the sync queue instead.
    async fn query(&self, object: &str, params: &[(&str, String)]) -> Result<Vec<CrmRecord>, CrmError> {
        (|| async { self.send_query(object, params).await })
            .retry(Self::retry_policy())
            .when(|e: &CrmError| e.should_retry())
            .notify(|e, dur| {
                warn!(
                    "CRM query failed, retrying after {:.2}s: {}",
                    dur.as_secs_f64(),
                    e
                )
            })
            .await
    }

    async fn send_query(&self, object: &str, params: &[(&str, String)]) -> Result<Vec<CrmRecord>, CrmError> {
        let res = self
            .http
            .get(self.object_url(object))
            .bearer_auth(self.api_token.expose_secret())
            .query(params)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let res = check_status(res).await?;
        res.json::<QueryResponse>()
            .await
            .map(|body| body.results)
            .map_err(|e| CrmError::Serde(e.to_string()))
    }

    async fn patch(&self, object: &str, id: &str, fields: Map<String, Value>) -> Result<(), CrmError> {
        debug!(object = object, record_id = %id, fields = fields.len(), "CRM patch");
        let res = self
            .http
            .patch(format!("{}/{}", self.object_url(object), id))
            .bearer_auth(self.api_token.expose_secret())
            .json(&fields)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        check_status(res).await.map(|_| ()).map_err(|e| match e {
            CrmError::Http { status: 404, .. } => CrmError::NotFound(id.to_string()),
            other => other,
        })
    }
}

#[async_trait]
impl CrmGateway for CrmClient {
    async fn list_sites(&self, opportunity_id: &str, limit: u32) -> Result<Vec<CrmRecord>, CrmError> {
        self.query(
            SITE_OBJECT,
            &[
                (SITE_OPPORTUNITY_FIELD, opportunity_id.to_string()),
                ("limit", limit.to_string()),
            ],
        )
        .await
    }

    async fn get_site(&self, site_id: &str) -> Result<CrmRecord, CrmError> {
        self.query(SITE_OBJECT, &[("_id", site_id.to_string())])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CrmError::NotFound(site_id.to_string()))
    }

    async fn update_site(&self, site_id: &str, fields: Map<String, Value>) -> Result<(), CrmError> {
        self.patch(SITE_OBJECT, site_id, fields).await
    }

    async fn delete_site(&self, site_id: &str) -> Result<(), CrmError> {
        self.patch(SITE_OBJECT, site_id, void_fields()).await
    }

    async fn update_worker(&self, worker_id: &str, fields: Map<String, Value>) -> Result<(), CrmError> {
        self.patch(WORKER_OBJECT, worker_id, fields).await
    }

    async fn delete_worker(&self, worker_id: &str) -> Result<(), CrmError> {
        self.patch(WORKER_OBJECT, worker_id, void_fields()).await
    }
}

fn void_fields() -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert(
        "life_status".to_string(),
        Value::String(VOID_LIFE_STATUS.to_string()),
    );
    fields
}

async fn check_status(res: reqwest::Response) -> Result<reqwest::Response, CrmError> {
    match res.status() {
        s if s.is_success() => Ok(res),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(CrmError::Unauthorized),
        StatusCode::TOO_MANY_REQUESTS => Err(CrmError::RateLimited),
        s => {
            let status = s.as_u16();
            let body = res.text().await.unwrap_or_default();
            Err(CrmError::Http { status, body })
        }
    }
}

fn map_reqwest_error(e: reqwest::Error) -> CrmError {
    if e.is_timeout() {
        CrmError::Timeout
    } else {
        CrmError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn site_fields_map_to_crm_names() {
        let local = json!({
            "building": "A",
            "completed": true,
            "completion_notes": "完工",
            "team_id": "ignored",
            "unknown": 1,
        });
        let crm = to_crm_fields(SITE_FIELD_MAP, &local);

        assert_eq!(crm.len(), 3);
        assert_eq!(crm["field_WD7k1__c"], "A");
        assert_eq!(crm["construction_completed__c"], true);
        assert_eq!(crm["work_shift_completion_note__c"], "完工");
    }

    #[test]
    fn crm_fields_map_back_skipping_nulls() {
        let record: CrmRecord = serde_json::from_value(json!({
            "_id": "site-1",
            "name": "A棟-3F-A1",
            "field_Q6Svh__c": "3F",
            "field_XuJP2__c": null,
            "field_1P96q__c": "opp-1",
        }))
        .unwrap();
        let local = from_crm_fields(SITE_FIELD_MAP, &record.fields);

        assert_eq!(record.id, "site-1");
        assert_eq!(local["name"], "A棟-3F-A1");
        assert_eq!(local["floor"], "3F");
        assert!(!local.contains_key("unit"));
    }

    #[test]
    fn non_object_payload_maps_to_nothing() {
        assert!(to_crm_fields(WORKER_FIELD_MAP, &json!(null)).is_empty());
    }

    #[test]
    fn only_transient_errors_retry() {
        assert!(CrmError::Timeout.should_retry());
        assert!(CrmError::Http { status: 502, body: String::new() }.should_retry());
        assert!(!CrmError::Http { status: 400, body: String::new() }.should_retry());
        assert!(!CrmError::Unauthorized.should_retry());
        assert!(!CrmError::NotFound("x".into()).should_retry());
    }
}
