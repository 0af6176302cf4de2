//! Pulls site records for a project out of the CRM into the local table.

use std::sync::Arc;

use db::{
    DBService,
    models::{
        project::Project,
        site::{CreateSite, Site},
    },
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};
use ts_rs::TS;
use uuid::Uuid;

use super::crm_client::{CrmError, CrmGateway, CrmRecord, SITE_FIELD_MAP, from_crm_fields};

#[derive(Debug, Error)]
pub enum SiteImportError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("crm error: {0}")]
    Crm(#[from] CrmError),
    #[error("project not found: {0}")]
    ProjectNotFound(Uuid),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
pub struct SiteImportReport {
    pub fetched: usize,
    pub imported: usize,
    pub skipped: usize,
}

#[derive(Clone)]
pub struct SiteImporter {
    db: DBService,
    crm: Arc<dyn CrmGateway>,
}

impl SiteImporter {
    const PAGE_LIMIT: u32 = 500;

    pub fn new(db: DBService, crm: Arc<dyn CrmGateway>) -> Self {
        Self { db, crm }
    }

    pub async fn pull_project_sites(
        &self,
        project_id: Uuid,
    ) -> Result<SiteImportReport, SiteImportError> {
        let project = Project::find_by_id(&self.db.pool, project_id)
            .await?
            .ok_or(SiteImportError::ProjectNotFound(project_id))?;

        let records = self
            .crm
            .list_sites(&project.opportunity_id, Self::PAGE_LIMIT)
            .await?;

        let mut report = SiteImportReport {
            fetched: records.len(),
            ..Default::default()
        };
        for record in &records {
            let site = site_from_record(record, &project.opportunity_id);
            match Site::upsert_from_crm(&self.db.pool, &site).await {
                Ok(_) => report.imported += 1,
                Err(e) => {
                    warn!(site_id = %record.id, error = %e, "Site import: skipping record");
                    report.skipped += 1;
                }
            }
        }

        Project::refresh_stats(&self.db.pool, project.id).await?;
        info!(
            project_id = %project.id,
            opportunity_id = %project.opportunity_id,
            fetched = report.fetched,
            imported = report.imported,
            skipped = report.skipped,
            "Site import finished"
        );
        Ok(report)
    }
}

fn site_from_record(record: &CrmRecord, opportunity_id: &str) -> CreateSite {
    let local = from_crm_fields(SITE_FIELD_MAP, &record.fields);
    CreateSite {
        id: Some(record.id.clone()),
        opportunity_id: opportunity_id.to_string(),
        name: text(&local, "name").unwrap_or_else(|| record.id.clone()),
        building: text(&local, "building"),
        floor: text(&local, "floor"),
        unit: text(&local, "unit"),
        team_id: None,
        team_name: text(&local, "team_name"),
        worker_name: text(&local, "worker_name"),
        construction_date: text(&local, "construction_date"),
        construction_area: number(&local, "construction_area"),
        completed: flag(&local, "completed"),
        before_notes: text(&local, "before_notes"),
        completion_notes: text(&local, "completion_notes"),
        before_photo_url: text(&local, "before_photo_url"),
        after_photo_url: text(&local, "after_photo_url"),
        stage: text(&local, "stage"),
    }
}

// CRM values arrive loosely typed: numbers as strings, flags as strings.

fn text(fields: &Map<String, Value>, key: &str) -> Option<String> {
    match fields.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn number(fields: &Map<String, Value>, key: &str) -> Option<f64> {
    match fields.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn flag(fields: &Map<String, Value>, key: &str) -> bool {
    match fields.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.as_str(), "true" | "1" | "是"),
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use db::models::{project::CreateProject, site::UpdateSite};
    use serde_json::json;

    use super::*;
    use crate::services::crm_mock::MockCrm;

    fn record(value: Value) -> CrmRecord {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn loose_crm_values_are_coerced() {
        let site = site_from_record(
            &record(json!({
                "_id": "s-1",
                "field_B2gh1__c": "12.5",
                "construction_completed__c": "true",
                "field_Q6Svh__c": 3,
            })),
            "opp-1",
        );
        assert_eq!(site.name, "s-1");
        assert_eq!(site.construction_area, Some(12.5));
        assert!(site.completed);
        assert_eq!(site.floor.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn pull_upserts_sites_and_refreshes_stats() {
        let db = DBService::new_in_memory().await.unwrap();
        let project = Project::create(
            &db.pool,
            &CreateProject {
                opportunity_id: "opp-1".to_string(),
                name: "樂田仁愛".to_string(),
                spc_engineering: None,
                cabinet_engineering: None,
                permissions: None,
            },
            Uuid::new_v4(),
            None,
        )
        .await
        .unwrap();

        let crm = Arc::new(MockCrm::with_sites(vec![
            record(json!({
                "_id": "s-1", "name": "A棟-1F-A1", "field_1P96q__c": "opp-1",
                "field_WD7k1__c": "A", "construction_completed__c": true,
            })),
            record(json!({
                "_id": "s-2", "name": "A棟-1F-A2", "field_1P96q__c": "opp-1",
                "field_WD7k1__c": "A",
            })),
            record(json!({ "_id": "s-3", "name": "other", "field_1P96q__c": "opp-2" })),
        ]));
        let importer = SiteImporter::new(db.clone(), crm);

        let report = importer.pull_project_sites(project.id).await.unwrap();
        assert_eq!(report.fetched, 2);
        assert_eq!(report.imported, 2);

        // Re-import is idempotent.
        importer.pull_project_sites(project.id).await.unwrap();
        let stats = Site::stats(&db.pool, Some("opp-1")).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.progress, 50);

        let refreshed = Project::find_by_id(&db.pool, project.id).await.unwrap().unwrap();
        assert_eq!(refreshed.stats["completed"], 1);
    }

    #[tokio::test]
    async fn repeated_pull_keeps_team_assignment() {
        let db = DBService::new_in_memory().await.unwrap();
        let project = Project::create(
            &db.pool,
            &CreateProject {
                opportunity_id: "opp-1".to_string(),
                name: "樂田仁愛".to_string(),
                spc_engineering: None,
                cabinet_engineering: None,
                permissions: None,
            },
            Uuid::new_v4(),
            None,
        )
        .await
        .unwrap();
        let crm = Arc::new(MockCrm::with_sites(vec![record(json!({
            "_id": "s-1", "name": "A棟-1F-A1", "field_1P96q__c": "opp-1",
        }))]));
        let importer = SiteImporter::new(db.clone(), crm);

        importer.pull_project_sites(project.id).await.unwrap();
        let assign = UpdateSite {
            team_id: Some("team-a".to_string()),
            ..Default::default()
        };
        Site::update(&db.pool, "s-1", &assign).await.unwrap();
        importer.pull_project_sites(project.id).await.unwrap();

        let site = Site::find_by_id(&db.pool, "s-1").await.unwrap().unwrap();
        assert_eq!(site.team_id.as_deref(), Some("team-a"));
    }

    #[tokio::test]
    async fn unknown_project_is_reported() {
        let db = DBService::new_in_memory().await.unwrap();
        let importer = SiteImporter::new(db, Arc::new(MockCrm::default()));
        let err = importer.pull_project_sites(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, SiteImportError::ProjectNotFound(_)));
    }
}
