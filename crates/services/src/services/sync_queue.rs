//! Background worker that drains the sync outbox into the CRM.
//!
//! Request handlers only enqueue and wake the worker; all CRM writes happen
//! on the worker task. Each row is claimed before it is pushed, so a manual
//! trigger racing the poll loop cannot send the same change twice.

use std::sync::Arc;

use db::{
    DBService,
    models::{
        sync_queue::{SyncObjectType, SyncOperation, SyncQueueItem, SyncStats, SyncStatus},
        worker::{Worker, WorkerSyncStatus},
    },
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::{
    sync::Notify,
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, error, info, warn};
use ts_rs::TS;

use super::{
    config::SyncConfig,
    crm_client::{CrmError, CrmGateway, SITE_FIELD_MAP, WORKER_FIELD_MAP, to_crm_fields},
};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// What happened to one queue row during a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    Completed,
    Retrying { attempt: i64, delay_secs: i64 },
    Failed,
    /// Another poll claimed the row first.
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct SyncBatchReport {
    pub selected: usize,
    pub completed: usize,
    pub retrying: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl SyncBatchReport {
    fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Completed => self.completed += 1,
            ItemOutcome::Retrying { .. } => self.retrying += 1,
            ItemOutcome::Failed => self.failed += 1,
            ItemOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Outbox processor for CRM writes
#[derive(Clone)]
pub struct BackgroundSyncService {
    db: DBService,
    crm: Arc<dyn CrmGateway>,
    config: SyncConfig,
    wake: Arc<Notify>,
}

impl BackgroundSyncService {
    pub fn new(db: DBService, crm: Arc<dyn CrmGateway>, config: SyncConfig) -> Self {
        Self {
            db,
            crm,
            config,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Spawn the worker loop. Handles to this service stay usable for
    /// enqueueing and manual triggers.
    pub fn spawn(&self) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            service.start().await;
        })
    }

    async fn start(&self) {
        info!(
            "Starting background sync service with poll interval {:?}, cleanup interval {:?}, honor retry schedule: {}",
            self.config.poll_interval, self.config.cleanup_interval, self.config.honor_retry_schedule
        );

        match SyncQueueItem::release_in_flight(&self.db.pool).await {
            Ok(0) => {}
            Ok(released) => warn!(released, "Sync: requeued rows left in flight by a previous run"),
            Err(e) => error!("Error releasing in-flight sync rows: {}", e),
        }

        let mut poll = interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup = interval(self.config.cleanup_interval);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = poll.tick() => {}
                _ = cleanup.tick() => {
                    if let Err(e) = self.cleanup_completed_syncs().await {
                        error!("Error cleaning up completed syncs: {}", e);
                    }
                    continue;
                }
            }

            if let Err(e) = self.process_sync_queue().await {
                error!("Error processing sync queue: {}", e);
            }
        }
    }

    /// Wakes the worker loop without waiting for it.
    pub fn trigger(&self) {
        self.wake.notify_one();
    }

    pub async fn mark_site_for_sync(
        &self,
        site_id: &str,
        data: &Value,
        operation: SyncOperation,
    ) -> Result<SyncQueueItem, SyncError> {
        self.enqueue(SyncObjectType::Site, site_id, data, operation).await
    }

    /// `worker_id` is the worker's CRM id.
    pub async fn mark_worker_for_sync(
        &self,
        worker_id: &str,
        data: &Value,
        operation: SyncOperation,
    ) -> Result<SyncQueueItem, SyncError> {
        self.enqueue(SyncObjectType::Worker, worker_id, data, operation).await
    }

    async fn enqueue(
        &self,
        object_type: SyncObjectType,
        object_id: &str,
        data: &Value,
        operation: SyncOperation,
    ) -> Result<SyncQueueItem, SyncError> {
        let item =
            SyncQueueItem::enqueue(&self.db.pool, object_type, object_id, operation, data).await?;
        info!(
            item_id = item.id,
            object_type = %object_type,
            object_id = %object_id,
            operation = %operation,
            "Sync: queued change"
        );
        self.trigger();
        Ok(item)
    }

    /// Processes one batch of ready rows, oldest first, one at a time.
    pub async fn process_sync_queue(&self) -> Result<SyncBatchReport, SyncError> {
        let lease_secs = i64::try_from(self.config.claim_lease.as_secs()).unwrap_or(i64::MAX);
        let released = SyncQueueItem::release_stale_claims(&self.db.pool, lease_secs).await?;
        if released > 0 {
            warn!(released, "Sync: requeued rows whose claim expired");
        }

        let items = SyncQueueItem::find_ready(
            &self.db.pool,
            self.config.max_retries,
            self.config.batch_size,
            self.config.honor_retry_schedule,
        )
        .await?;

        let mut report = SyncBatchReport {
            selected: items.len(),
            ..Default::default()
        };
        if items.is_empty() {
            debug!("Sync: queue empty");
            return Ok(report);
        }

        for item in &items {
            match self.process_sync_item(item).await {
                Ok(outcome) => report.record(outcome),
                Err(e) => warn!(item_id = item.id, error = %e, "Sync: error processing item"),
            }
        }

        info!(
            selected = report.selected,
            completed = report.completed,
            retrying = report.retrying,
            failed = report.failed,
            skipped = report.skipped,
            "Sync: batch finished"
        );
        Ok(report)
    }

    /// Claims the row, pushes it to the CRM and records the result.
    pub async fn process_sync_item(&self, item: &SyncQueueItem) -> Result<ItemOutcome, SyncError> {
        let Some(item) =
            SyncQueueItem::claim(&self.db.pool, item.id, self.config.max_retries).await?
        else {
            debug!(item_id = item.id, "Sync: item claimed elsewhere, skipping");
            return Ok(ItemOutcome::Skipped);
        };

        match self.settle(&item).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                match SyncQueueItem::release_claim(&self.db.pool, item.id).await {
                    Ok(_) => warn!(
                        item_id = item.id,
                        error = %e,
                        "Sync: result not recorded, claim released"
                    ),
                    Err(release_err) => error!(
                        item_id = item.id,
                        error = %release_err,
                        "Sync: could not release claim, lease expiry will requeue it"
                    ),
                }
                Err(e)
            }
        }
    }

    /// Pushes a claimed row and records the outcome.
    async fn settle(&self, item: &SyncQueueItem) -> Result<ItemOutcome, SyncError> {
        match self.push_to_crm(item).await {
            Ok(()) => {
                SyncQueueItem::mark_completed(&self.db.pool, item.id).await?;
                self.record_worker_result(item, WorkerSyncStatus::Synced).await?;
                info!(
                    item_id = item.id,
                    object_type = %item.object_type,
                    object_id = %item.object_id,
                    "Sync: completed"
                );
                Ok(ItemOutcome::Completed)
            }
            Err(e) => self.handle_failure(item, &e).await,
        }
    }

    async fn handle_failure(
        &self,
        item: &SyncQueueItem,
        err: &CrmError,
    ) -> Result<ItemOutcome, SyncError> {
        let retry_count = item.retry_count + 1;
        let message = err.to_string();

        if retry_count >= self.config.max_retries {
            SyncQueueItem::mark_failed(&self.db.pool, item.id, retry_count, &message).await?;
            self.record_worker_result(item, WorkerSyncStatus::Failed).await?;
            error!(
                item_id = item.id,
                object_type = %item.object_type,
                object_id = %item.object_id,
                retry_count,
                error = %message,
                "Sync: giving up after max retries"
            );
            return Ok(ItemOutcome::Failed);
        }

        let delay_secs = backoff_secs(self.config.base_retry_delay_secs, retry_count);
        SyncQueueItem::schedule_retry(&self.db.pool, item.id, retry_count, &message, delay_secs)
            .await?;
        warn!(
            item_id = item.id,
            object_type = %item.object_type,
            object_id = %item.object_id,
            retry_count,
            delay_secs,
            error = %message,
            "Sync: push failed, will retry"
        );
        Ok(ItemOutcome::Retrying {
            attempt: retry_count,
            delay_secs,
        })
    }

    async fn push_to_crm(&self, item: &SyncQueueItem) -> Result<(), CrmError> {
        match (item.object_type, item.operation) {
            (SyncObjectType::Site, SyncOperation::Update) => {
                let fields = to_crm_fields(SITE_FIELD_MAP, &item.payload);
                if fields.is_empty() {
                    debug!(item_id = item.id, "Sync: no CRM fields in site payload");
                    return Ok(());
                }
                self.crm.update_site(&item.object_id, fields).await
            }
            (SyncObjectType::Site, SyncOperation::Delete) => {
                self.crm.delete_site(&item.object_id).await
            }
            (SyncObjectType::Worker, SyncOperation::Update) => {
                let fields = to_crm_fields(WORKER_FIELD_MAP, &item.payload);
                if fields.is_empty() {
                    debug!(item_id = item.id, "Sync: no CRM fields in worker payload");
                    return Ok(());
                }
                self.crm.update_worker(&item.object_id, fields).await
            }
            (SyncObjectType::Worker, SyncOperation::Delete) => {
                self.crm.delete_worker(&item.object_id).await
            }
        }
    }

    async fn record_worker_result(
        &self,
        item: &SyncQueueItem,
        status: WorkerSyncStatus,
    ) -> Result<(), SyncError> {
        if item.object_type != SyncObjectType::Worker {
            return Ok(());
        }
        // A newer queued change keeps the worker pending until it lands.
        if status == WorkerSyncStatus::Synced
            && SyncQueueItem::has_open(&self.db.pool, item.object_type, &item.object_id).await?
        {
            debug!(item_id = item.id, "Sync: newer change queued, worker stays pending");
            return Ok(());
        }
        Worker::set_sync_status_by_crm_id(&self.db.pool, &item.object_id, status).await?;
        Ok(())
    }

    /// Deletes completed rows past the retention window.
    pub async fn cleanup_completed_syncs(&self) -> Result<u64, SyncError> {
        let removed =
            SyncQueueItem::delete_completed_older_than(&self.db.pool, self.config.retention_days)
                .await?;
        if removed > 0 {
            info!(removed, "Sync: cleaned up completed rows");
        }
        Ok(removed)
    }

    /// Status counts for rows created in the last 24 hours.
    pub async fn get_sync_stats(&self) -> Result<SyncStats, SyncError> {
        Ok(SyncQueueItem::stats_since_hours(&self.db.pool, 24).await?)
    }

    /// Gives failed rows a fresh retry budget and processes a batch right away.
    pub async fn retry_failed_syncs(&self) -> Result<SyncBatchReport, SyncError> {
        let reset = SyncQueueItem::reset_failed(&self.db.pool).await?;
        info!(reset, "Sync: retrying failed rows");
        self.process_sync_queue().await
    }

    pub async fn list_items(
        &self,
        status: Option<SyncStatus>,
        limit: i64,
    ) -> Result<Vec<SyncQueueItem>, SyncError> {
        Ok(SyncQueueItem::find_recent(&self.db.pool, status, limit).await?)
    }
}

/// `base * 2^retry_count` seconds.
fn backoff_secs(base: i64, retry_count: i64) -> i64 {
    let exponent = u32::try_from(retry_count.clamp(0, 16)).unwrap_or(16);
    base.saturating_mul(1_i64 << exponent)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use db::models::{
        sync_queue::SyncState,
        worker::{CreateWorker, Worker},
    };
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::services::crm_mock::{CrmCall, MockCrm};

    async fn service_with(crm: Arc<MockCrm>, config: SyncConfig) -> BackgroundSyncService {
        let db = DBService::new_in_memory().await.unwrap();
        BackgroundSyncService::new(db, crm, config)
    }

    async fn reload(service: &BackgroundSyncService, id: i64) -> SyncQueueItem {
        SyncQueueItem::find_by_id(&service.db.pool, id)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn always_failing_crm_fails_after_three_polls() {
        let crm = Arc::new(MockCrm::always_failing());
        let service = service_with(crm.clone(), SyncConfig::default()).await;
        let item = service
            .mark_site_for_sync("site-1", &json!({ "completed": true }), SyncOperation::Update)
            .await
            .unwrap();

        let mut states = Vec::new();
        for _ in 0..3 {
            service.process_sync_queue().await.unwrap();
            let row = reload(&service, item.id).await;
            assert!(row.retry_count <= 3);
            states.push(row.state());
        }
        assert_eq!(
            states,
            vec![
                SyncState::Retrying { attempt: 1 },
                SyncState::Retrying { attempt: 2 },
                SyncState::Failed,
            ]
        );

        let failed = reload(&service, item.id).await;
        assert_eq!(failed.retry_count, 3);
        assert!(failed.error_message.is_some());

        let report = service.process_sync_queue().await.unwrap();
        assert_eq!(report.selected, 0);
        assert_eq!(crm.calls().len(), 3);
    }

    #[tokio::test]
    async fn success_on_second_attempt_keeps_retry_count() {
        let crm = Arc::new(MockCrm::failing_times(1));
        let service = service_with(crm.clone(), SyncConfig::default()).await;
        let item = service
            .mark_site_for_sync("site-1", &json!({ "floor": "3F" }), SyncOperation::Update)
            .await
            .unwrap();

        let first = service.process_sync_queue().await.unwrap();
        assert_eq!(first.retrying, 1);
        let second = service.process_sync_queue().await.unwrap();
        assert_eq!(second.completed, 1);

        let done = reload(&service, item.id).await;
        assert_eq!(done.status, SyncStatus::Completed);
        assert_eq!(done.retry_count, 1);
        assert!(done.completed_at.is_some());
        assert!(done.error_message.is_none());
    }

    #[tokio::test]
    async fn completed_items_are_never_reprocessed() {
        let crm = Arc::new(MockCrm::default());
        let service = service_with(crm.clone(), SyncConfig::default()).await;
        service
            .mark_site_for_sync("site-1", &json!({ "stage": "done" }), SyncOperation::Update)
            .await
            .unwrap();

        service.process_sync_queue().await.unwrap();
        let again = service.process_sync_queue().await.unwrap();

        assert_eq!(again.selected, 0);
        assert_eq!(crm.calls().len(), 1);
    }

    #[tokio::test]
    async fn site_payload_is_sent_with_crm_field_names() {
        let crm = Arc::new(MockCrm::default());
        let service = service_with(crm.clone(), SyncConfig::default()).await;
        service
            .mark_site_for_sync(
                "site-9",
                &json!({ "completed": true, "completion_notes": "ok", "team_id": "t1" }),
                SyncOperation::Update,
            )
            .await
            .unwrap();
        service.process_sync_queue().await.unwrap();

        match crm.calls().as_slice() {
            [CrmCall::UpdateSite { id, fields }] => {
                assert_eq!(id, "site-9");
                assert_eq!(fields.len(), 2);
                assert_eq!(fields["construction_completed__c"], true);
                assert_eq!(fields["work_shift_completion_note__c"], "ok");
            }
            other => panic!("unexpected calls: {:?}", other),
        }
    }

    #[tokio::test]
    async fn lost_claim_is_skipped() {
        let crm = Arc::new(MockCrm::default());
        let service = service_with(crm.clone(), SyncConfig::default()).await;
        let item = service
            .mark_site_for_sync("site-1", &json!({ "floor": "1F" }), SyncOperation::Update)
            .await
            .unwrap();

        SyncQueueItem::claim(&service.db.pool, item.id, 3).await.unwrap();
        let outcome = service.process_sync_item(&item).await.unwrap();

        assert_eq!(outcome, ItemOutcome::Skipped);
        assert!(crm.calls().is_empty());
    }

    #[tokio::test]
    async fn unrecorded_result_releases_the_claim() {
        let crm = Arc::new(MockCrm::default());
        let service = service_with(crm.clone(), SyncConfig::default()).await;
        let item = service
            .mark_site_for_sync("site-1", &json!({ "floor": "4F" }), SyncOperation::Update)
            .await
            .unwrap();
        sqlx::query(
            "CREATE TRIGGER reject_completion BEFORE UPDATE OF status ON sync_queue
             WHEN NEW.status = 'completed'
             BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END",
        )
        .execute(&service.db.pool)
        .await
        .unwrap();

        let report = service.process_sync_queue().await.unwrap();
        assert_eq!(report.completed, 0);
        let row = reload(&service, item.id).await;
        assert_eq!(row.status, SyncStatus::Pending);
        assert_eq!(row.retry_count, 0);

        sqlx::query("DROP TRIGGER reject_completion")
            .execute(&service.db.pool)
            .await
            .unwrap();
        let report = service.process_sync_queue().await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(reload(&service, item.id).await.status, SyncStatus::Completed);
    }

    #[tokio::test]
    async fn expired_claim_is_picked_up_again() {
        let crm = Arc::new(MockCrm::default());
        let service = service_with(crm.clone(), SyncConfig::default()).await;
        let item = service
            .mark_site_for_sync("site-1", &json!({ "stage": "1" }), SyncOperation::Update)
            .await
            .unwrap();
        SyncQueueItem::claim(&service.db.pool, item.id, 3).await.unwrap();

        let held = service.process_sync_queue().await.unwrap();
        assert_eq!(held.selected, 0);

        sqlx::query("UPDATE sync_queue SET updated_at = datetime('now', '-1 hour') WHERE id = $1")
            .bind(item.id)
            .execute(&service.db.pool)
            .await
            .unwrap();
        let report = service.process_sync_queue().await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(crm.calls().len(), 1);
    }

    #[tokio::test]
    async fn worker_stays_pending_while_newer_change_is_queued() {
        let crm = Arc::new(MockCrm::default());
        let service = service_with(crm.clone(), SyncConfig::default()).await;
        let worker = Worker::create(
            &service.db.pool,
            &CreateWorker {
                crm_id: Some("crm-w2".to_string()),
                name: "李師傅".to_string(),
                phone: None,
                abbreviation: None,
                team_id: None,
                line_user_id: None,
            },
            Uuid::new_v4(),
        )
        .await
        .unwrap();
        Worker::set_sync_status(&service.db.pool, worker.id, WorkerSyncStatus::Pending)
            .await
            .unwrap();

        let first = service
            .mark_worker_for_sync("crm-w2", &json!({ "phone": "0933111222" }), SyncOperation::Update)
            .await
            .unwrap();
        let claimed = SyncQueueItem::claim(&service.db.pool, first.id, 3).await.unwrap().unwrap();
        service
            .mark_worker_for_sync("crm-w2", &json!({ "name": "李大師" }), SyncOperation::Update)
            .await
            .unwrap();

        SyncQueueItem::mark_completed(&service.db.pool, claimed.id).await.unwrap();
        service
            .record_worker_result(&claimed, WorkerSyncStatus::Synced)
            .await
            .unwrap();
        let reloaded = Worker::find_by_id(&service.db.pool, worker.id).await.unwrap().unwrap();
        assert_eq!(reloaded.sync_status, WorkerSyncStatus::Pending);

        service.process_sync_queue().await.unwrap();
        let reloaded = Worker::find_by_id(&service.db.pool, worker.id).await.unwrap().unwrap();
        assert_eq!(reloaded.sync_status, WorkerSyncStatus::Synced);
    }

    #[tokio::test]
    async fn retry_failed_resets_budget_and_processes() {
        let crm = Arc::new(MockCrm::failing_times(3));
        let service = service_with(crm.clone(), SyncConfig::default()).await;
        let item = service
            .mark_site_for_sync("site-1", &json!({ "unit": "B2" }), SyncOperation::Update)
            .await
            .unwrap();
        for _ in 0..3 {
            service.process_sync_queue().await.unwrap();
        }
        assert_eq!(reload(&service, item.id).await.status, SyncStatus::Failed);

        let report = service.retry_failed_syncs().await.unwrap();
        assert_eq!(report.completed, 1);

        let done = reload(&service, item.id).await;
        assert_eq!(done.status, SyncStatus::Completed);
        assert_eq!(done.retry_count, 0);
    }

    #[tokio::test]
    async fn honored_schedule_holds_back_retries() {
        let crm = Arc::new(MockCrm::always_failing());
        let config = SyncConfig {
            honor_retry_schedule: true,
            ..SyncConfig::default()
        };
        let service = service_with(crm.clone(), config).await;
        let item = service
            .mark_site_for_sync("site-1", &json!({ "floor": "2F" }), SyncOperation::Update)
            .await
            .unwrap();

        let first = service.process_sync_queue().await.unwrap();
        assert_eq!(first.retrying, 1);
        let second = service.process_sync_queue().await.unwrap();
        assert_eq!(second.selected, 0);

        let row = reload(&service, item.id).await;
        assert!(row.next_retry_at.is_some());
        assert_eq!(row.state(), SyncState::Retrying { attempt: 1 });
    }

    #[tokio::test]
    async fn worker_delete_voids_in_crm_and_records_result() {
        let crm = Arc::new(MockCrm::default());
        let service = service_with(crm.clone(), SyncConfig::default()).await;
        let worker = Worker::create(
            &service.db.pool,
            &CreateWorker {
                crm_id: Some("crm-w1".to_string()),
                name: "陳師傅".to_string(),
                phone: None,
                abbreviation: None,
                team_id: None,
                line_user_id: None,
            },
            Uuid::new_v4(),
        )
        .await
        .unwrap();
        Worker::set_sync_status(&service.db.pool, worker.id, WorkerSyncStatus::Pending)
            .await
            .unwrap();

        service
            .mark_worker_for_sync("crm-w1", &json!({}), SyncOperation::Delete)
            .await
            .unwrap();
        service.process_sync_queue().await.unwrap();

        assert!(matches!(
            crm.calls().as_slice(),
            [CrmCall::DeleteWorker { id }] if id == "crm-w1"
        ));
        let reloaded = Worker::find_by_id(&service.db.pool, worker.id).await.unwrap().unwrap();
        assert_eq!(reloaded.sync_status, WorkerSyncStatus::Synced);
    }

    #[tokio::test]
    async fn spawned_worker_wakes_on_enqueue() {
        let crm = Arc::new(MockCrm::default());
        let config = SyncConfig {
            poll_interval: Duration::from_secs(3600),
            ..SyncConfig::default()
        };
        let service = service_with(crm.clone(), config).await;
        let handle = service.spawn();

        let item = service
            .mark_site_for_sync("site-1", &json!({ "stage": "3" }), SyncOperation::Update)
            .await
            .unwrap();

        let mut status = SyncStatus::Pending;
        for _ in 0..100 {
            status = reload(&service, item.id).await.status;
            if status == SyncStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.abort();
        assert_eq!(status, SyncStatus::Completed);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let delays: Vec<i64> = (1..=3).map(|n| backoff_secs(1, n)).collect();
        assert_eq!(delays, vec![2, 4, 8]);
        assert_eq!(backoff_secs(1, 1000), 1 << 16);
    }
}
