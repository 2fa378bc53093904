//! Retention of scheduled artifacts and the garbage collector that deletes them.

pub mod policy;
pub mod storage;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::artifact::{Artifact, ArtifactState};
use crate::config::RetentionConfig;
use crate::error::RetentionError;
use crate::store::Database;

pub use policy::{RetentionBudget, select_for_deletion};
pub use storage::FsArtifactStorage;

/// Backend holding artifact contents (object store, filesystem).
#[async_trait]
pub trait ArtifactStorage: Send + Sync {
    /// Remove the artifact's contents. Must tolerate contents already gone.
    async fn delete(&self, artifact: &Artifact) -> Result<(), RetentionError>;
}

/// What happened to one artifact handed to [`RetentionManager::delete_artifact`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// Already deleted or being deleted. Nothing was done.
    Unchanged,
    /// Still being produced; refused.
    Refused,
    /// Storage failed; the artifact is now `FailedToDelete`.
    Failed(String),
    /// No such artifact.
    Missing,
}

/// Summary of one retention pass or collector sweep.
#[derive(Debug, Clone, Default)]
pub struct RetentionReport {
    /// Candidates considered.
    pub candidates: usize,
    pub deleted: Vec<Uuid>,
    pub failed: Vec<Uuid>,
    pub unchanged: Vec<Uuid>,
}

/// Applies the retention policy and deletes artifacts through the storage.
pub struct RetentionManager {
    store: Arc<dyn Database>,
    storage: Arc<dyn ArtifactStorage>,
    config: RetentionConfig,
}

impl RetentionManager {
    pub fn new(
        store: Arc<dyn Database>,
        storage: Arc<dyn ArtifactStorage>,
        config: RetentionConfig,
    ) -> Self {
        Self {
            store,
            storage,
            config,
        }
    }

    /// Delete expired artifacts that the per-schedule minimum allows to go.
    pub async fn run_retention(
        &self,
        now: DateTime<Utc>,
    ) -> Result<RetentionReport, RetentionError> {
        let expired = self.store.list_expired_artifacts(now).await?;
        if expired.is_empty() {
            return Ok(RetentionReport::default());
        }

        let mut budgets = HashMap::new();
        for schedule_id in expired.iter().filter_map(|a| a.schedule_id) {
            if budgets.contains_key(&schedule_id) {
                continue;
            }
            let min_to_retain = match self.store.get_schedule(schedule_id).await? {
                Some(schedule) => schedule
                    .min_to_retain
                    .unwrap_or(self.config.default_min_to_retain),
                None => self.config.default_min_to_retain,
            };
            let total = self.store.count_live_artifacts(schedule_id).await?;
            budgets.insert(
                schedule_id,
                RetentionBudget {
                    total,
                    min_to_retain,
                },
            );
        }

        let selected = select_for_deletion(&expired, &budgets);
        tracing::info!(
            expired = expired.len(),
            selected = selected.len(),
            "Retention pass"
        );
        Ok(self.delete_batch(selected.iter().map(|a| a.id)).await)
    }

    /// Delete every artifact queued for deletion or left over by a failed delete.
    pub async fn collect_garbage(&self) -> Result<RetentionReport, RetentionError> {
        let queued = self
            .store
            .list_artifacts_in_states(&[
                ArtifactState::QueuedForDeletion,
                ArtifactState::FailedToDelete,
            ])
            .await?;
        if !queued.is_empty() {
            tracing::info!(count = queued.len(), "Garbage collecting artifacts");
        }
        Ok(self.delete_batch(queued.iter().map(|a| a.id)).await)
    }

    /// Delete one artifact. Deleting one that is mid-deletion or deleted is a no-op.
    pub async fn delete_artifact(&self, id: Uuid) -> Result<DeleteOutcome, RetentionError> {
        let Some(artifact) = self.store.get_artifact(id).await? else {
            return Ok(DeleteOutcome::Missing);
        };

        match artifact.state {
            ArtifactState::DeleteInProgress | ArtifactState::Deleted => {
                return Ok(DeleteOutcome::Unchanged);
            }
            ArtifactState::InProgress => {
                tracing::warn!(artifact_id = %id, "Refusing to delete an artifact still in progress");
                return Ok(DeleteOutcome::Refused);
            }
            _ => {}
        }

        // The retention pass and the GC sweep may race for the same artifact.
        if !self.store.claim_artifact_for_deletion(id).await? {
            tracing::debug!(artifact_id = %id, "Artifact already claimed for deletion");
            return Ok(DeleteOutcome::Unchanged);
        }

        match self.storage.delete(&artifact).await {
            Ok(()) => {
                self.store
                    .update_artifact_state(id, ArtifactState::Deleted)
                    .await?;
                tracing::info!(artifact_id = %id, location = %artifact.location, "Artifact deleted");
                Ok(DeleteOutcome::Deleted)
            }
            Err(e) => {
                tracing::warn!(artifact_id = %id, "Failed to delete artifact: {e}");
                self.store
                    .update_artifact_state(id, ArtifactState::FailedToDelete)
                    .await?;
                Ok(DeleteOutcome::Failed(e.to_string()))
            }
        }
    }

    /// Delete each artifact in turn. A failure never stops the batch.
    async fn delete_batch(&self, ids: impl Iterator<Item = Uuid>) -> RetentionReport {
        let mut report = RetentionReport::default();
        for id in ids {
            report.candidates += 1;
            match self.delete_artifact(id).await {
                Ok(DeleteOutcome::Deleted) => report.deleted.push(id),
                Ok(DeleteOutcome::Failed(_)) => report.failed.push(id),
                Ok(_) => report.unchanged.push(id),
                Err(e) => {
                    tracing::error!(artifact_id = %id, "Error deleting artifact: {e}");
                    report.failed.push(id);
                }
            }
        }
        report
    }
}

/// Spawn the garbage collector loop.
pub fn spawn_gc_sweeper(
    manager: Arc<RetentionManager>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = manager.collect_garbage().await {
                tracing::error!("Garbage collection failed: {e}");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::scheduler::schedule::Schedule;
    use crate::store::LibSqlBackend;

    /// Storage that records deletions and fails for chosen locations.
    #[derive(Default)]
    struct FakeStorage {
        failing: HashSet<String>,
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ArtifactStorage for FakeStorage {
        async fn delete(&self, artifact: &Artifact) -> Result<(), RetentionError> {
            if self.failing.contains(&artifact.location) {
                return Err(RetentionError::Storage {
                    artifact: artifact.id,
                    reason: "bucket unavailable".to_string(),
                });
            }
            self.deleted.lock().unwrap().push(artifact.location.clone());
            Ok(())
        }
    }

    async fn setup(storage: FakeStorage) -> (Arc<LibSqlBackend>, Arc<FakeStorage>, RetentionManager) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let storage = Arc::new(storage);
        let manager = RetentionManager::new(
            db.clone(),
            storage.clone(),
            RetentionConfig::default(),
        );
        (db, storage, manager)
    }

    #[tokio::test]
    async fn retention_deletes_oldest_beyond_minimum() {
        let (db, storage, manager) = setup(FakeStorage::default()).await;
        let schedule = Schedule::new("backups", "ops", "noop", serde_json::json!({}))
            .with_min_to_retain(2);
        db.create_schedule(&schedule).await.unwrap();

        let now = Utc::now();
        let mut ids = Vec::new();
        for i in 0..5 {
            let artifact = Artifact::new(Some(schedule.id), "ops", format!("b{i}"))
                .with_created_at(now - ChronoDuration::days(10 - i))
                .with_expiry(now - ChronoDuration::minutes(1));
            db.insert_artifact(&artifact).await.unwrap();
            ids.push(artifact.id);
        }

        let report = manager.run_retention(now).await.unwrap();
        assert_eq!(report.deleted, ids[..3].to_vec());
        assert_eq!(*storage.deleted.lock().unwrap(), vec!["b0", "b1", "b2"]);

        for id in &ids[3..] {
            let kept = db.get_artifact(*id).await.unwrap().unwrap();
            assert_eq!(kept.state, ArtifactState::Completed);
        }

        // A second pass finds 2 expired but only 2 live: nothing more goes.
        let report = manager.run_retention(now).await.unwrap();
        assert!(report.deleted.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_deletes_reach_storage_once() {
        let (db, storage, manager) = setup(FakeStorage::default()).await;
        let artifact = Artifact::new(None, "ops", "shared.tar");
        db.insert_artifact(&artifact).await.unwrap();

        let manager = Arc::new(manager);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.delete_artifact(artifact.id).await })
            })
            .collect();

        let mut deleted = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                DeleteOutcome::Deleted => deleted += 1,
                DeleteOutcome::Unchanged => {}
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(deleted, 1);
        assert_eq!(*storage.deleted.lock().unwrap(), vec!["shared.tar"]);
    }

    #[tokio::test]
    async fn default_minimum_applies_without_override() {
        let (db, _storage, manager) = setup(FakeStorage::default()).await;
        let schedule = Schedule::new("backups", "ops", "noop", serde_json::json!({}));
        db.create_schedule(&schedule).await.unwrap();

        let now = Utc::now();
        for i in 0..6 {
            let artifact = Artifact::new(Some(schedule.id), "ops", format!("b{i}"))
                .with_created_at(now - ChronoDuration::days(10 - i))
                .with_expiry(now - ChronoDuration::minutes(1));
            db.insert_artifact(&artifact).await.unwrap();
        }

        let report = manager.run_retention(now).await.unwrap();
        assert_eq!(report.deleted.len(), 1);
    }

    #[tokio::test]
    async fn orphans_are_deleted_and_failures_do_not_stop_the_batch() {
        let storage = FakeStorage {
            failing: HashSet::from(["broken".to_string()]),
            ..Default::default()
        };
        let (db, storage, manager) = setup(storage).await;
        let now = Utc::now();

        let broken = Artifact::new(None, "ops", "broken")
            .with_created_at(now - ChronoDuration::days(3))
            .with_expiry(now - ChronoDuration::minutes(1));
        let fine = Artifact::new(None, "ops", "fine")
            .with_created_at(now - ChronoDuration::days(2))
            .with_expiry(now - ChronoDuration::minutes(1));
        db.insert_artifact(&broken).await.unwrap();
        db.insert_artifact(&fine).await.unwrap();

        let report = manager.run_retention(now).await.unwrap();
        assert_eq!(report.failed, vec![broken.id]);
        assert_eq!(report.deleted, vec![fine.id]);
        assert_eq!(*storage.deleted.lock().unwrap(), vec!["fine"]);

        let broken = db.get_artifact(broken.id).await.unwrap().unwrap();
        assert_eq!(broken.state, ArtifactState::FailedToDelete);
    }

    #[tokio::test]
    async fn delete_is_a_noop_when_already_deleting_or_deleted() {
        let (db, storage, manager) = setup(FakeStorage::default()).await;
        let deleting = Artifact::new(None, "ops", "x").with_state(ArtifactState::DeleteInProgress);
        let deleted = Artifact::new(None, "ops", "y").with_state(ArtifactState::Deleted);
        db.insert_artifact(&deleting).await.unwrap();
        db.insert_artifact(&deleted).await.unwrap();

        assert_eq!(
            manager.delete_artifact(deleting.id).await.unwrap(),
            DeleteOutcome::Unchanged
        );
        assert_eq!(
            manager.delete_artifact(deleted.id).await.unwrap(),
            DeleteOutcome::Unchanged
        );
        assert_eq!(
            manager.delete_artifact(Uuid::new_v4()).await.unwrap(),
            DeleteOutcome::Missing
        );
        assert!(storage.deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn in_progress_artifacts_are_refused() {
        let (db, _storage, manager) = setup(FakeStorage::default()).await;
        let running = Artifact::new(None, "ops", "z").with_state(ArtifactState::InProgress);
        db.insert_artifact(&running).await.unwrap();
        assert_eq!(
            manager.delete_artifact(running.id).await.unwrap(),
            DeleteOutcome::Refused
        );
    }

    #[tokio::test]
    async fn garbage_collector_retries_failed_and_queued() {
        let (db, storage, manager) = setup(FakeStorage::default()).await;
        let queued = Artifact::new(None, "ops", "q").with_state(ArtifactState::QueuedForDeletion);
        let retry = Artifact::new(None, "ops", "r").with_state(ArtifactState::FailedToDelete);
        let kept = Artifact::new(None, "ops", "k");
        for a in [&queued, &retry, &kept] {
            db.insert_artifact(a).await.unwrap();
        }

        let report = manager.collect_garbage().await.unwrap();
        assert_eq!(report.deleted.len(), 2);
        assert_eq!(storage.deleted.lock().unwrap().len(), 2);
        let kept = db.get_artifact(kept.id).await.unwrap().unwrap();
        assert_eq!(kept.state, ArtifactState::Completed);
    }
}
