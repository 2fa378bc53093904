//! Unified `Database` trait: single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::artifact::{Artifact, ArtifactState};
use crate::error::DatabaseError;
use crate::executor::progress::ProgressRecord;
use crate::scheduler::schedule::{Schedule, ScheduleStatus, ScheduleTask};

/// Backend-agnostic database trait covering progress records, schedules and artifacts.
#[async_trait]
pub trait Database: Send + Sync {
    // ── Progress records ────────────────────────────────────────────

    /// Insert a new progress record.
    async fn insert_progress_record(&self, record: &ProgressRecord) -> Result<(), DatabaseError>;

    /// Overwrite state, details and `updated_at` of an existing record.
    async fn update_progress_record(&self, record: &ProgressRecord) -> Result<(), DatabaseError>;

    async fn get_progress_record(&self, id: Uuid) -> Result<Option<ProgressRecord>, DatabaseError>;

    /// Children of `parent_id`, ordered by position then creation time.
    async fn list_subtask_records(
        &self,
        parent_id: Uuid,
    ) -> Result<Vec<ProgressRecord>, DatabaseError>;

    /// Every record still `created` or `running`, roots first.
    async fn list_incomplete_progress_records(&self)
    -> Result<Vec<ProgressRecord>, DatabaseError>;

    // ── Schedules ───────────────────────────────────────────────────

    async fn create_schedule(&self, schedule: &Schedule) -> Result<(), DatabaseError>;

    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>, DatabaseError>;

    /// Schedules with status `active`, ordered by creation time.
    async fn list_active_schedules(&self) -> Result<Vec<Schedule>, DatabaseError>;

    async fn set_schedule_status(
        &self,
        id: Uuid,
        status: ScheduleStatus,
    ) -> Result<(), DatabaseError>;

    /// Compare-and-set on `running_state`. Returns `true` when the stored
    /// value was `expected` and has been replaced by `running`.
    async fn set_schedule_running(
        &self,
        id: Uuid,
        expected: bool,
        running: bool,
    ) -> Result<bool, DatabaseError>;

    /// Clear every `running_state` flag. Returns how many were set.
    async fn reset_schedule_running_states(&self) -> Result<u64, DatabaseError>;

    // ── Schedule tasks ──────────────────────────────────────────────

    async fn record_schedule_task(&self, task: &ScheduleTask) -> Result<(), DatabaseError>;

    /// Most recently scheduled task of a schedule.
    async fn last_schedule_task(
        &self,
        schedule_id: Uuid,
    ) -> Result<Option<ScheduleTask>, DatabaseError>;

    /// Set `completed_at` on the schedule task of `task_id`, if it is still open.
    async fn complete_schedule_task(
        &self,
        task_id: Uuid,
        completed_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    // ── Artifacts ───────────────────────────────────────────────────

    async fn insert_artifact(&self, artifact: &Artifact) -> Result<(), DatabaseError>;

    async fn get_artifact(&self, id: Uuid) -> Result<Option<Artifact>, DatabaseError>;

    /// Completed or failed artifacts whose expiry is at or before `now`.
    async fn list_expired_artifacts(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Artifact>, DatabaseError>;

    /// Artifacts of a schedule not deleted nor on their way to deletion.
    async fn count_live_artifacts(&self, schedule_id: Uuid) -> Result<u64, DatabaseError>;

    async fn list_artifacts_in_states(
        &self,
        states: &[ArtifactState],
    ) -> Result<Vec<Artifact>, DatabaseError>;

    async fn update_artifact_state(
        &self,
        id: Uuid,
        state: ArtifactState,
    ) -> Result<(), DatabaseError>;

    /// Move an artifact to `DeleteInProgress` unless it is still in progress,
    /// already being deleted, or deleted. Returns `true` when this call
    /// claimed it.
    async fn claim_artifact_for_deletion(&self, id: Uuid) -> Result<bool, DatabaseError>;
}
