use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use ts_rs::TS;
use uuid::Uuid;

/// A construction site (案場): one unit of work inside a project, mirrored
/// from the CRM site object.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct Site {
    pub id: String,
    pub opportunity_id: String,
    pub name: String,
    pub building: Option<String>,
    pub floor: Option<String>,
    pub unit: Option<String>,
    pub team_id: Option<String>,
    pub team_name: Option<String>,
    pub worker_name: Option<String>,
    pub construction_date: Option<String>,
    pub construction_area: Option<f64>,
    pub completed: bool,
    pub before_notes: Option<String>,
    pub completion_notes: Option<String>,
    pub before_photo_url: Option<String>,
    pub after_photo_url: Option<String>,
    pub stage: Option<String>,
    /// Created here and never seen by the CRM, so changes are not synced.
    pub local_only: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
pub struct CreateSite {
    /// CRM record id. Sites created without one get a local id and are
    /// kept out of CRM sync.
    pub id: Option<String>,
    pub opportunity_id: String,
    pub name: String,
    pub building: Option<String>,
    pub floor: Option<String>,
    pub unit: Option<String>,
    pub team_id: Option<String>,
    pub team_name: Option<String>,
    pub worker_name: Option<String>,
    pub construction_date: Option<String>,
    pub construction_area: Option<f64>,
    #[serde(default)]
    pub completed: bool,
    pub before_notes: Option<String>,
    pub completion_notes: Option<String>,
    pub before_photo_url: Option<String>,
    pub after_photo_url: Option<String>,
    pub stage: Option<String>,
}

/// Partial site update. Serializes to exactly the fields that were set,
/// which is also the payload queued for the CRM.
#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
pub struct UpdateSite {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub building: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub floor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub construction_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub construction_area: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_photo_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_photo_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

impl UpdateSite {
    pub fn is_empty(&self) -> bool {
        serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_object().map(|o| o.is_empty()))
            .unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default, Deserialize, TS)]
pub struct SiteFilter {
    pub opportunity_id: Option<String>,
    pub search: Option<String>,
    pub building: Option<String>,
    pub completed: Option<bool>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct BuildingStats {
    pub building: Option<String>,
    pub total: i64,
    pub completed: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct SiteStats {
    pub total: i64,
    pub completed: i64,
    /// Percentage of completed sites, rounded.
    pub progress: i64,
    pub by_building: Vec<BuildingStats>,
}

impl Site {
    pub const DEFAULT_PAGE_SIZE: i64 = 500;

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Site>(
            r#"SELECT id, opportunity_id, name, building, floor, unit, team_id, team_name,
                      worker_name, construction_date, construction_area, completed,
                      before_notes, completion_notes, before_photo_url, after_photo_url,
                      stage, local_only, created_at, updated_at
               FROM sites
               WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_filtered(
        pool: &SqlitePool,
        filter: &SiteFilter,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Site>(
            r#"SELECT id, opportunity_id, name, building, floor, unit, team_id, team_name,
                      worker_name, construction_date, construction_area, completed,
                      before_notes, completion_notes, before_photo_url, after_photo_url,
                      stage, local_only, created_at, updated_at
               FROM sites
               WHERE ($1 IS NULL OR opportunity_id = $1)
                 AND ($2 IS NULL OR name LIKE '%' || $2 || '%' OR worker_name LIKE '%' || $2 || '%')
                 AND ($3 IS NULL OR building = $3)
                 AND ($4 IS NULL OR completed = $4)
               ORDER BY building ASC, floor ASC, unit ASC, name ASC
               LIMIT $5 OFFSET $6"#,
        )
        .bind(&filter.opportunity_id)
        .bind(&filter.search)
        .bind(&filter.building)
        .bind(filter.completed)
        .bind(filter.limit.unwrap_or(Self::DEFAULT_PAGE_SIZE))
        .bind(filter.offset.unwrap_or(0))
        .fetch_all(pool)
        .await
    }

    pub async fn create(pool: &SqlitePool, data: &CreateSite) -> Result<Self, sqlx::Error> {
        let local_only = data.id.is_none();
        let id = data
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        sqlx::query_as::<_, Site>(
            r#"INSERT INTO sites (id, opportunity_id, name, building, floor, unit, team_id,
                                  team_name, worker_name, construction_date, construction_area,
                                  completed, before_notes, completion_notes, before_photo_url,
                                  after_photo_url, stage, local_only)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                       $18)
               RETURNING id, opportunity_id, name, building, floor, unit, team_id, team_name,
                         worker_name, construction_date, construction_area, completed,
                         before_notes, completion_notes, before_photo_url, after_photo_url,
                         stage, local_only, created_at, updated_at"#,
        )
        .bind(id)
        .bind(&data.opportunity_id)
        .bind(&data.name)
        .bind(&data.building)
        .bind(&data.floor)
        .bind(&data.unit)
        .bind(&data.team_id)
        .bind(&data.team_name)
        .bind(&data.worker_name)
        .bind(&data.construction_date)
        .bind(data.construction_area)
        .bind(data.completed)
        .bind(&data.before_notes)
        .bind(&data.completion_notes)
        .bind(&data.before_photo_url)
        .bind(&data.after_photo_url)
        .bind(&data.stage)
        .bind(local_only)
        .fetch_one(pool)
        .await
    }

    /// Inserts or refreshes a site pulled from the CRM. The CRM copy wins for
    /// every column it carries; `team_id` is local-only data and survives a
    /// pull that does not supply one.
    pub async fn upsert_from_crm(pool: &SqlitePool, data: &CreateSite) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Site>(
            r#"INSERT INTO sites (id, opportunity_id, name, building, floor, unit, team_id,
                                  team_name, worker_name, construction_date, construction_area,
                                  completed, before_notes, completion_notes, before_photo_url,
                                  after_photo_url, stage)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
               ON CONFLICT(id) DO UPDATE SET
                   opportunity_id = excluded.opportunity_id,
                   name = excluded.name,
                   building = excluded.building,
                   floor = excluded.floor,
                   unit = excluded.unit,
                   team_id = COALESCE(excluded.team_id, sites.team_id),
                   team_name = excluded.team_name,
                   worker_name = excluded.worker_name,
                   construction_date = excluded.construction_date,
                   construction_area = excluded.construction_area,
                   completed = excluded.completed,
                   before_notes = excluded.before_notes,
                   completion_notes = excluded.completion_notes,
                   before_photo_url = excluded.before_photo_url,
                   after_photo_url = excluded.after_photo_url,
                   stage = excluded.stage,
                   local_only = 0,
                   updated_at = datetime('now', 'subsec')
               RETURNING id, opportunity_id, name, building, floor, unit, team_id, team_name,
                         worker_name, construction_date, construction_area, completed,
                         before_notes, completion_notes, before_photo_url, after_photo_url,
                         stage, local_only, created_at, updated_at"#,
        )
        .bind(&data.id)
        .bind(&data.opportunity_id)
        .bind(&data.name)
        .bind(&data.building)
        .bind(&data.floor)
        .bind(&data.unit)
        .bind(&data.team_id)
        .bind(&data.team_name)
        .bind(&data.worker_name)
        .bind(&data.construction_date)
        .bind(data.construction_area)
        .bind(data.completed)
        .bind(&data.before_notes)
        .bind(&data.completion_notes)
        .bind(&data.before_photo_url)
        .bind(&data.after_photo_url)
        .bind(&data.stage)
        .fetch_one(pool)
        .await
    }

    pub async fn update(
        pool: &SqlitePool,
        id: &str,
        data: &UpdateSite,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Site>(
            r#"UPDATE sites
               SET name = COALESCE($2, name),
                   building = COALESCE($3, building),
                   floor = COALESCE($4, floor),
                   unit = COALESCE($5, unit),
                   team_id = COALESCE($6, team_id),
                   team_name = COALESCE($7, team_name),
                   worker_name = COALESCE($8, worker_name),
                   construction_date = COALESCE($9, construction_date),
                   construction_area = COALESCE($10, construction_area),
                   completed = COALESCE($11, completed),
                   before_notes = COALESCE($12, before_notes),
                   completion_notes = COALESCE($13, completion_notes),
                   before_photo_url = COALESCE($14, before_photo_url),
                   after_photo_url = COALESCE($15, after_photo_url),
                   stage = COALESCE($16, stage),
                   updated_at = datetime('now', 'subsec')
               WHERE id = $1
               RETURNING id, opportunity_id, name, building, floor, unit, team_id, team_name,
                         worker_name, construction_date, construction_area, completed,
                         before_notes, completion_notes, before_photo_url, after_photo_url,
                         stage, local_only, created_at, updated_at"#,
        )
        .bind(id)
        .bind(&data.name)
        .bind(&data.building)
        .bind(&data.floor)
        .bind(&data.unit)
        .bind(&data.team_id)
        .bind(&data.team_name)
        .bind(&data.worker_name)
        .bind(&data.construction_date)
        .bind(data.construction_area)
        .bind(data.completed)
        .bind(&data.before_notes)
        .bind(&data.completion_notes)
        .bind(&data.before_photo_url)
        .bind(&data.after_photo_url)
        .bind(&data.stage)
        .fetch_optional(pool)
        .await
    }

    pub async fn delete(pool: &SqlitePool, id: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM sites WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Completion numbers across all sites, or only those of one opportunity.
    pub async fn stats(
        pool: &SqlitePool,
        opportunity_id: Option<&str>,
    ) -> Result<SiteStats, sqlx::Error> {
        let by_building = sqlx::query_as::<_, BuildingStats>(
            r#"SELECT building,
                      COUNT(*) AS total,
                      COALESCE(SUM(completed), 0) AS completed
               FROM sites
               WHERE ($1 IS NULL OR opportunity_id = $1)
               GROUP BY building
               ORDER BY building ASC"#,
        )
        .bind(opportunity_id)
        .fetch_all(pool)
        .await?;

        let total: i64 = by_building.iter().map(|b| b.total).sum();
        let completed: i64 = by_building.iter().map(|b| b.completed).sum();

        Ok(SiteStats {
            total,
            completed,
            progress: progress_percent(completed, total),
            by_building,
        })
    }
}

fn progress_percent(completed: i64, total: i64) -> i64 {
    if total == 0 {
        return 0;
    }
    ((completed as f64 / total as f64) * 100.0).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        DBService,
        models::project::{CreateProject, Project},
    };

    async fn seeded() -> DBService {
        let db = DBService::new_in_memory().await.unwrap();
        Project::create(
            &db.pool,
            &CreateProject {
                opportunity_id: "opp-1".to_string(),
                name: "勝興-興安西-2024".to_string(),
                spc_engineering: None,
                cabinet_engineering: None,
                permissions: None,
            },
            Uuid::new_v4(),
            None,
        )
        .await
        .unwrap();
        for (id, building, completed) in [("s1", "A", true), ("s2", "A", false), ("s3", "B", true)] {
            Site::create(
                &db.pool,
                &CreateSite {
                    id: Some(id.to_string()),
                    opportunity_id: "opp-1".to_string(),
                    name: format!("{}棟-{}", building, id),
                    building: Some(building.to_string()),
                    completed,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        }
        db
    }

    #[tokio::test]
    async fn stats_round_progress_and_group_by_building() {
        let db = seeded().await;
        let stats = Site::stats(&db.pool, Some("opp-1")).await.unwrap();

        assert_eq!(stats.total, 3);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.progress, 67);
        assert_eq!(stats.by_building.len(), 2);
        assert_eq!(stats.by_building[0].building.as_deref(), Some("A"));
        assert_eq!(stats.by_building[0].completed, 1);

        let project = Project::find_by_opportunity_id(&db.pool, "opp-1")
            .await
            .unwrap()
            .unwrap();
        let refreshed = Project::refresh_stats(&db.pool, project.id).await.unwrap().unwrap();
        assert_eq!(refreshed.stats["progress"], 67);
    }

    #[tokio::test]
    async fn update_only_touches_given_fields() {
        let db = seeded().await;
        let update = UpdateSite {
            completed: Some(true),
            completion_notes: Some("完工".to_string()),
            ..Default::default()
        };
        let site = Site::update(&db.pool, "s2", &update).await.unwrap().unwrap();

        assert!(site.completed);
        assert_eq!(site.building.as_deref(), Some("A"));
        assert_eq!(site.completion_notes.as_deref(), Some("完工"));
        assert!(Site::update(&db.pool, "missing", &update).await.unwrap().is_none());
    }

    #[test]
    fn update_payload_contains_only_set_fields() {
        let update = UpdateSite {
            floor: Some("3F".to_string()),
            ..Default::default()
        };
        let payload = serde_json::to_value(&update).unwrap();
        assert_eq!(payload, serde_json::json!({ "floor": "3F" }));
        assert!(UpdateSite::default().is_empty());
    }

    #[tokio::test]
    async fn sites_without_crm_id_are_local_only() {
        let db = seeded().await;
        assert!(!Site::find_by_id(&db.pool, "s1").await.unwrap().unwrap().local_only);

        let local = Site::create(
            &db.pool,
            &CreateSite {
                opportunity_id: "opp-1".to_string(),
                name: "臨時".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(local.local_only);
        assert!(Uuid::parse_str(&local.id).is_ok());
    }

    #[tokio::test]
    async fn crm_upsert_keeps_local_team_assignment() {
        let db = seeded().await;
        let assign = UpdateSite {
            team_id: Some("team-a".to_string()),
            ..Default::default()
        };
        Site::update(&db.pool, "s2", &assign).await.unwrap();

        let from_crm = CreateSite {
            id: Some("s2".to_string()),
            opportunity_id: "opp-1".to_string(),
            name: "A棟-s2".to_string(),
            floor: Some("5F".to_string()),
            ..Default::default()
        };
        let site = Site::upsert_from_crm(&db.pool, &from_crm).await.unwrap();
        assert_eq!(site.team_id.as_deref(), Some("team-a"));
        assert_eq!(site.floor.as_deref(), Some("5F"));
        assert!(!site.local_only);
    }

    #[tokio::test]
    async fn site_requires_existing_project() {
        let db = DBService::new_in_memory().await.unwrap();
        let result = Site::create(
            &db.pool,
            &CreateSite {
                opportunity_id: "nope".to_string(),
                name: "orphan".to_string(),
                ..Default::default()
            },
        )
        .await;
        assert!(result.is_err());
    }
}
