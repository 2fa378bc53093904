//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;
use uuid::Uuid;

use crate::artifact::{Artifact, ArtifactState};
use crate::error::DatabaseError;
use crate::executor::progress::ProgressRecord;
use crate::scheduler::schedule::{Schedule, ScheduleStatus, ScheduleTask};
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::init_schema(self.conn()).await
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format. Fixed precision keeps text ordering equal to
/// time ordering, which the expiry and ordering queries rely on.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn optional_datetime_value(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(format_datetime(&dt)),
        None => libsql::Value::Null,
    }
}

fn optional_uuid_value(id: Option<Uuid>) -> libsql::Value {
    match id {
        Some(id) => libsql::Value::Text(id.to_string()),
        None => libsql::Value::Null,
    }
}

fn parse_uuid(s: &str, column: &str) -> Result<Uuid, DatabaseError> {
    s.parse()
        .map_err(|e| DatabaseError::Serialization(format!("invalid {column} '{s}': {e}")))
}

fn to_json_text(value: &serde_json::Value) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

const PROGRESS_COLUMNS: &str =
    "id, parent_id, position, task_name, state, details, owner, created_at, updated_at";

const SCHEDULE_COLUMNS: &str = "id, name, owner, task_type, frequency_secs, cron_expression, params, status, running_state, min_to_retain, created_at, updated_at";

const SCHEDULE_TASK_COLUMNS: &str = "task_id, schedule_id, scheduled_at, completed_at";

const ARTIFACT_COLUMNS: &str =
    "id, schedule_id, owner, location, state, created_at, expires_at";

fn row_to_progress_record(row: &libsql::Row) -> Result<ProgressRecord, DatabaseError> {
    let id: String = row.get(0).unwrap_or_default();
    let parent_id: Option<String> = row.get(1).ok();
    let state_str: String = row.get(4).unwrap_or_default();
    let details_str: String = row.get(5).unwrap_or_else(|_| "null".to_string());
    let created_str: String = row.get(7).unwrap_or_default();
    let updated_str: String = row.get(8).unwrap_or_default();

    Ok(ProgressRecord {
        id: parse_uuid(&id, "task_progress.id")?,
        parent_id: parent_id
            .map(|p| parse_uuid(&p, "task_progress.parent_id"))
            .transpose()?,
        position: row.get::<i64>(2).unwrap_or(0) as u32,
        task_name: row.get(3).unwrap_or_default(),
        state: state_str.parse().map_err(DatabaseError::Serialization)?,
        details: serde_json::from_str(&details_str).unwrap_or(serde_json::Value::Null),
        owner: row.get(6).unwrap_or_default(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_schedule(row: &libsql::Row) -> Result<Schedule, DatabaseError> {
    let id: String = row.get(0).unwrap_or_default();
    let frequency_secs: Option<i64> = row.get::<i64>(4).ok();
    let params_str: String = row.get(6).unwrap_or_else(|_| "{}".to_string());
    let status_str: String = row.get(7).unwrap_or_default();
    let min_to_retain: Option<i64> = row.get::<i64>(9).ok();
    let created_str: String = row.get(10).unwrap_or_default();
    let updated_str: String = row.get(11).unwrap_or_default();

    Ok(Schedule {
        id: parse_uuid(&id, "schedules.id")?,
        name: row.get(1).unwrap_or_default(),
        owner: row.get(2).unwrap_or_default(),
        task_type: row.get(3).unwrap_or_default(),
        frequency: frequency_secs.map(|s| Duration::from_secs(s.max(0) as u64)),
        cron_expression: row.get::<String>(5).ok(),
        params: serde_json::from_str(&params_str).unwrap_or(serde_json::json!({})),
        status: status_str.parse().map_err(DatabaseError::Serialization)?,
        running_state: row.get::<i64>(8).unwrap_or(0) != 0,
        min_to_retain: min_to_retain.map(|m| m.max(0) as u32),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_schedule_task(row: &libsql::Row) -> Result<ScheduleTask, DatabaseError> {
    let task_id: String = row.get(0).unwrap_or_default();
    let schedule_id: String = row.get(1).unwrap_or_default();
    let scheduled_str: String = row.get(2).unwrap_or_default();
    let completed_str: Option<String> = row.get(3).ok();

    Ok(ScheduleTask {
        task_id: parse_uuid(&task_id, "schedule_tasks.task_id")?,
        schedule_id: parse_uuid(&schedule_id, "schedule_tasks.schedule_id")?,
        scheduled_at: parse_datetime(&scheduled_str),
        completed_at: parse_optional_datetime(&completed_str),
    })
}

fn row_to_artifact(row: &libsql::Row) -> Result<Artifact, DatabaseError> {
    let id: String = row.get(0).unwrap_or_default();
    let schedule_id: Option<String> = row.get(1).ok();
    let state_str: String = row.get(4).unwrap_or_default();
    let created_str: String = row.get(5).unwrap_or_default();
    let expires_str: Option<String> = row.get(6).ok();

    Ok(Artifact {
        id: parse_uuid(&id, "artifacts.id")?,
        schedule_id: schedule_id
            .map(|s| parse_uuid(&s, "artifacts.schedule_id"))
            .transpose()?,
        owner: row.get(2).unwrap_or_default(),
        location: row.get(3).unwrap_or_default(),
        state: state_str.parse().map_err(DatabaseError::Serialization)?,
        created_at: parse_datetime(&created_str),
        expires_at: parse_optional_datetime(&expires_str),
    })
}

async fn collect_rows<T>(
    rows: &mut libsql::Rows,
    context: &str,
    convert: fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Result<Vec<T>, DatabaseError> {
    let mut out = Vec::new();
    loop {
        match rows.next().await {
            Ok(Some(row)) => match convert(&row) {
                Ok(item) => out.push(item),
                Err(e) => tracing::warn!("Skipping {context} row: {e}"),
            },
            Ok(None) => break,
            Err(e) => return Err(DatabaseError::Query(format!("{context}: {e}"))),
        }
    }
    Ok(out)
}

#[async_trait]
impl Database for LibSqlBackend {
    // ── Progress records ────────────────────────────────────────────

    async fn insert_progress_record(&self, record: &ProgressRecord) -> Result<(), DatabaseError> {
        let details = to_json_text(&record.details)?;
        self.conn()
            .execute(
                "INSERT INTO task_progress (id, parent_id, position, task_name, state, details, owner, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.id.to_string(),
                    optional_uuid_value(record.parent_id),
                    record.position as i64,
                    record.task_name.clone(),
                    record.state.as_str(),
                    details,
                    record.owner.clone(),
                    format_datetime(&record.created_at),
                    format_datetime(&record.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_progress_record: {e}")))?;
        Ok(())
    }

    async fn update_progress_record(&self, record: &ProgressRecord) -> Result<(), DatabaseError> {
        let details = to_json_text(&record.details)?;
        let affected = self
            .conn()
            .execute(
                "UPDATE task_progress SET state = ?2, details = ?3, updated_at = ?4 WHERE id = ?1",
                params![
                    record.id.to_string(),
                    record.state.as_str(),
                    details,
                    format_datetime(&record.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_progress_record: {e}")))?;

        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "task_progress".to_string(),
                id: record.id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_progress_record(&self, id: Uuid) -> Result<Option<ProgressRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {PROGRESS_COLUMNS} FROM task_progress WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_progress_record: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_progress_record(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_progress_record: {e}"))),
        }
    }

    async fn list_subtask_records(
        &self,
        parent_id: Uuid,
    ) -> Result<Vec<ProgressRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {PROGRESS_COLUMNS} FROM task_progress WHERE parent_id = ?1 ORDER BY position, created_at"
                ),
                params![parent_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_subtask_records: {e}")))?;

        collect_rows(&mut rows, "list_subtask_records", row_to_progress_record).await
    }

    async fn list_incomplete_progress_records(
        &self,
    ) -> Result<Vec<ProgressRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {PROGRESS_COLUMNS} FROM task_progress WHERE state IN ('created', 'running') ORDER BY parent_id IS NOT NULL, created_at"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_incomplete_progress_records: {e}")))?;

        collect_rows(&mut rows, "list_incomplete_progress_records", row_to_progress_record).await
    }

    // ── Schedules ───────────────────────────────────────────────────

    async fn create_schedule(&self, schedule: &Schedule) -> Result<(), DatabaseError> {
        let params_json = to_json_text(&schedule.params)?;
        let frequency: libsql::Value = match schedule.frequency {
            Some(d) => libsql::Value::Integer(d.as_secs() as i64),
            None => libsql::Value::Null,
        };
        let cron_expression: libsql::Value = match &schedule.cron_expression {
            Some(expr) => libsql::Value::Text(expr.clone()),
            None => libsql::Value::Null,
        };
        let min_to_retain: libsql::Value = match schedule.min_to_retain {
            Some(m) => libsql::Value::Integer(m as i64),
            None => libsql::Value::Null,
        };

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO schedules ({SCHEDULE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    schedule.id.to_string(),
                    schedule.name.clone(),
                    schedule.owner.clone(),
                    schedule.task_type.clone(),
                    frequency,
                    cron_expression,
                    params_json,
                    schedule.status.as_str(),
                    schedule.running_state as i64,
                    min_to_retain,
                    format_datetime(&schedule.created_at),
                    format_datetime(&schedule.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_schedule: {e}")))?;
        Ok(())
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_schedule: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_schedule(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_schedule: {e}"))),
        }
    }

    async fn list_active_schedules(&self) -> Result<Vec<Schedule>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE status = 'active' ORDER BY created_at"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_active_schedules: {e}")))?;

        collect_rows(&mut rows, "list_active_schedules", row_to_schedule).await
    }

    async fn set_schedule_status(
        &self,
        id: Uuid,
        status: ScheduleStatus,
    ) -> Result<(), DatabaseError> {
        let now = format_datetime(&Utc::now());
        self.conn()
            .execute(
                "UPDATE schedules SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), status.as_str(), now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_schedule_status: {e}")))?;
        Ok(())
    }

    async fn set_schedule_running(
        &self,
        id: Uuid,
        expected: bool,
        running: bool,
    ) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE schedules SET running_state = ?3 WHERE id = ?1 AND running_state = ?2",
                params![id.to_string(), expected as i64, running as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_schedule_running: {e}")))?;
        Ok(affected == 1)
    }

    async fn reset_schedule_running_states(&self) -> Result<u64, DatabaseError> {
        self.conn()
            .execute(
                "UPDATE schedules SET running_state = 0 WHERE running_state = 1",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reset_schedule_running_states: {e}")))
    }

    // ── Schedule tasks ──────────────────────────────────────────────

    async fn record_schedule_task(&self, task: &ScheduleTask) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT INTO schedule_tasks ({SCHEDULE_TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4)"),
                params![
                    task.task_id.to_string(),
                    task.schedule_id.to_string(),
                    format_datetime(&task.scheduled_at),
                    optional_datetime_value(task.completed_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_schedule_task: {e}")))?;
        Ok(())
    }

    async fn last_schedule_task(
        &self,
        schedule_id: Uuid,
    ) -> Result<Option<ScheduleTask>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SCHEDULE_TASK_COLUMNS} FROM schedule_tasks WHERE schedule_id = ?1 ORDER BY scheduled_at DESC LIMIT 1"
                ),
                params![schedule_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("last_schedule_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_schedule_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("last_schedule_task: {e}"))),
        }
    }

    async fn complete_schedule_task(
        &self,
        task_id: Uuid,
        completed_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE schedule_tasks SET completed_at = ?2 WHERE task_id = ?1 AND completed_at IS NULL",
                params![task_id.to_string(), format_datetime(&completed_at)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_schedule_task: {e}")))?;
        Ok(())
    }

    // ── Artifacts ───────────────────────────────────────────────────

    async fn insert_artifact(&self, artifact: &Artifact) -> Result<(), DatabaseError> {
        let now = format_datetime(&Utc::now());
        self.conn()
            .execute(
                "INSERT INTO artifacts (id, schedule_id, owner, location, state, created_at, expires_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    artifact.id.to_string(),
                    optional_uuid_value(artifact.schedule_id),
                    artifact.owner.clone(),
                    artifact.location.clone(),
                    artifact.state.as_str(),
                    format_datetime(&artifact.created_at),
                    optional_datetime_value(artifact.expires_at),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_artifact: {e}")))?;
        Ok(())
    }

    async fn get_artifact(&self, id: Uuid) -> Result<Option<Artifact>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_artifact: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_artifact(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_artifact: {e}"))),
        }
    }

    async fn list_expired_artifacts(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Artifact>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE state IN ('completed', 'failed') AND expires_at IS NOT NULL AND expires_at <= ?1 ORDER BY created_at"
                ),
                params![format_datetime(&now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_expired_artifacts: {e}")))?;

        collect_rows(&mut rows, "list_expired_artifacts", row_to_artifact).await
    }

    async fn count_live_artifacts(&self, schedule_id: Uuid) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM artifacts WHERE schedule_id = ?1 AND state NOT IN ('queued_for_deletion', 'delete_in_progress', 'deleted')",
                params![schedule_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_live_artifacts: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0).max(0) as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_live_artifacts: {e}"))),
        }
    }

    async fn list_artifacts_in_states(
        &self,
        states: &[ArtifactState],
    ) -> Result<Vec<Artifact>, DatabaseError> {
        if states.is_empty() {
            return Ok(Vec::new());
        }
        // States are a closed enum, so inlining their tags is safe.
        let tags = states
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE state IN ({tags}) ORDER BY created_at"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_artifacts_in_states: {e}")))?;

        collect_rows(&mut rows, "list_artifacts_in_states", row_to_artifact).await
    }

    async fn update_artifact_state(
        &self,
        id: Uuid,
        state: ArtifactState,
    ) -> Result<(), DatabaseError> {
        let now = format_datetime(&Utc::now());
        let affected = self
            .conn()
            .execute(
                "UPDATE artifacts SET state = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), state.as_str(), now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_artifact_state: {e}")))?;

        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "artifact".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn claim_artifact_for_deletion(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let now = format_datetime(&Utc::now());
        let affected = self
            .conn()
            .execute(
                "UPDATE artifacts SET state = ?2, updated_at = ?3 \
                 WHERE id = ?1 AND state NOT IN ('in_progress', 'delete_in_progress', 'deleted')",
                params![id.to_string(), ArtifactState::DeleteInProgress.as_str(), now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_artifact_for_deletion: {e}")))?;
        Ok(affected == 1)
    }
}
