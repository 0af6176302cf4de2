//! In-memory [`CrmGateway`] for tests.

use std::sync::{
    Mutex,
    atomic::{AtomicU32, Ordering},
};

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::crm_client::{CrmError, CrmGateway, CrmRecord, SITE_OPPORTUNITY_FIELD};

#[derive(Debug, Clone, PartialEq)]
pub enum CrmCall {
    UpdateSite { id: String, fields: Map<String, Value> },
    DeleteSite { id: String },
    UpdateWorker { id: String, fields: Map<String, Value> },
    DeleteWorker { id: String },
}

/// Records every write. The first `failures` writes fail with a 503.
#[derive(Debug, Default)]
pub struct MockCrm {
    failures: AtomicU32,
    calls: Mutex<Vec<CrmCall>>,
    sites: Mutex<Vec<CrmRecord>>,
}

impl MockCrm {
    pub fn failing_times(failures: u32) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            ..Default::default()
        }
    }

    pub fn always_failing() -> Self {
        Self::failing_times(u32::MAX)
    }

    pub fn with_sites(sites: Vec<CrmRecord>) -> Self {
        Self {
            sites: Mutex::new(sites),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<CrmCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: CrmCall) -> Result<(), CrmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n == u32::MAX {
                    Some(n)
                } else {
                    n.checked_sub(1)
                }
            })
            .is_ok();
        if failing {
            Err(CrmError::Http {
                status: 503,
                body: "crm unavailable".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CrmGateway for MockCrm {
    async fn list_sites(&self, opportunity_id: &str, limit: u32) -> Result<Vec<CrmRecord>, CrmError> {
        let sites = self.sites.lock().map(|s| s.clone()).unwrap_or_default();
        Ok(sites
            .into_iter()
            .filter(|site| {
                site.fields.get(SITE_OPPORTUNITY_FIELD).and_then(Value::as_str)
                    == Some(opportunity_id)
            })
            .take(limit as usize)
            .collect())
    }

    async fn get_site(&self, site_id: &str) -> Result<CrmRecord, CrmError> {
        self.sites
            .lock()
            .ok()
            .and_then(|sites| sites.iter().find(|s| s.id == site_id).cloned())
            .ok_or_else(|| CrmError::NotFound(site_id.to_string()))
    }

    async fn update_site(&self, site_id: &str, fields: Map<String, Value>) -> Result<(), CrmError> {
        self.record(CrmCall::UpdateSite {
            id: site_id.to_string(),
            fields,
        })
    }

    async fn delete_site(&self, site_id: &str) -> Result<(), CrmError> {
        self.record(CrmCall::DeleteSite {
            id: site_id.to_string(),
        })
    }

    async fn update_worker(&self, worker_id: &str, fields: Map<String, Value>) -> Result<(), CrmError> {
        self.record(CrmCall::UpdateWorker {
            id: worker_id.to_string(),
            fields,
        })
    }

    async fn delete_worker(&self, worker_id: &str) -> Result<(), CrmError> {
        self.record(CrmCall::DeleteWorker {
            id: worker_id.to_string(),
        })
    }
}
