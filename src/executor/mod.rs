//! Task executor: accepts runs, drives them, and answers progress queries.

pub mod group;
pub mod listener;
pub mod progress;
pub mod runnable;

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::ExecutorConfig;
use crate::error::ExecutorError;
use crate::store::Database;
use crate::task::Task;

pub use group::{GroupType, TaskGroup, WorkerPool};
pub use listener::{HookOutcome, LoggingListener, TaskExecutionListener};
pub use progress::{ProgressRecord, ProgressTree, TaskState};
pub use runnable::RunnableTask;

/// Error recorded on runs left unfinished by a previous process.
pub const RESTART_ERROR: &str = "Process restarted before the task finished";

/// Runs submitted tasks and tracks the live ones.
pub struct TaskExecutor {
    store: Arc<dyn Database>,
    default_pool: WorkerPool,
    /// Live runs, inserted on submit and removed once terminal.
    runs: Arc<RwLock<HashMap<Uuid, Arc<RunnableTask>>>>,
}

impl TaskExecutor {
    pub fn new(store: Arc<dyn Database>, config: &ExecutorConfig) -> Self {
        Self {
            store,
            default_pool: WorkerPool::new("default", config.default_pool_size),
            runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Arc<dyn Database> {
        &self.store
    }

    /// Validate `task` and persist its root record. The run is not started.
    pub async fn create_runnable_task(
        &self,
        task: Arc<dyn Task>,
        owner: impl Into<String>,
    ) -> Result<Arc<RunnableTask>, ExecutorError> {
        RunnableTask::create(task, owner, Arc::clone(&self.store)).await
    }

    /// Start a created run in the background and return its id.
    ///
    /// Sub-tasks run on the group's own pool when it has one, otherwise on
    /// `pool`, otherwise on the executor's default pool.
    pub async fn submit(
        &self,
        run: Arc<RunnableTask>,
        pool: Option<WorkerPool>,
    ) -> Result<Uuid, ExecutorError> {
        let id = run.id();
        let task_name = run.task().name().to_string();
        run.bind_pool(pool.unwrap_or_else(|| self.default_pool.clone()))?;
        self.runs.write().await.insert(id, Arc::clone(&run));

        let runs = Arc::clone(&self.runs);
        tokio::spawn(async move {
            if AssertUnwindSafe(Arc::clone(&run).execute())
                .catch_unwind()
                .await
                .is_err()
            {
                tracing::error!(run_id = %id, "Run driver panicked");
            }
            runs.write().await.remove(&id);
            run.finish();
        });

        tracing::info!(run_id = %id, task = %task_name, "Run submitted");
        Ok(id)
    }

    /// `create_runnable_task` followed by `submit`.
    pub async fn submit_task(
        &self,
        task: Arc<dyn Task>,
        owner: impl Into<String>,
        pool: Option<WorkerPool>,
    ) -> Result<Uuid, ExecutorError> {
        let run = self.create_runnable_task(task, owner).await?;
        self.submit(run, pool).await
    }

    pub async fn get_runnable_task(&self, id: Uuid) -> Option<Arc<RunnableTask>> {
        self.runs.read().await.get(&id).cloned()
    }

    pub async fn is_task_running(&self, id: Uuid) -> bool {
        self.runs.read().await.contains_key(&id)
    }

    /// Ids of every live run.
    pub async fn live_runs(&self) -> Vec<Uuid> {
        self.runs.read().await.keys().copied().collect()
    }

    /// Request a cooperative abort of a live run.
    ///
    /// Fails with `InvalidState` when the task is not abortable or the run is
    /// already terminal, and with `NotFound` for an unknown id. Repeating the
    /// request on an in-flight run succeeds without further effect.
    pub async fn abort(&self, id: Uuid) -> Result<(), ExecutorError> {
        let Some(run) = self.get_runnable_task(id).await else {
            return match self.store.get_progress_record(id).await? {
                Some(record) if record.state.is_terminal() => Err(ExecutorError::InvalidState {
                    id,
                    reason: format!("run is already {}", record.state),
                }),
                Some(_) => Err(ExecutorError::InvalidState {
                    id,
                    reason: "run has not been submitted".to_string(),
                }),
                None => Err(ExecutorError::NotFound { id }),
            };
        };

        if !run.task().is_abortable() {
            return Err(ExecutorError::InvalidState {
                id,
                reason: format!("task {} is not abortable", run.task().name()),
            });
        }
        let state = run.state().await;
        if state.is_terminal() {
            return Err(ExecutorError::InvalidState {
                id,
                reason: format!("run is already {state}"),
            });
        }

        if !run.is_abort_requested() {
            run.request_abort();
            tracing::info!(run_id = %id, "Abort requested");
        }
        Ok(())
    }

    /// Wait for a run to finish and return the root's final state.
    pub async fn wait_for_task(&self, id: Uuid) -> Result<TaskState, ExecutorError> {
        if let Some(run) = self.get_runnable_task(id).await {
            run.wait().await;
        }
        match self.store.get_progress_record(id).await? {
            Some(record) => Ok(record.state),
            None => Err(ExecutorError::NotFound { id }),
        }
    }

    /// Root record and sub-task records of a run.
    pub async fn get_progress(&self, id: Uuid) -> Result<ProgressTree, ExecutorError> {
        let root = self
            .store
            .get_progress_record(id)
            .await?
            .ok_or(ExecutorError::NotFound { id })?;
        let subtasks = self.store.list_subtask_records(id).await?;
        Ok(ProgressTree { root, subtasks })
    }

    /// Close records left open by a previous process: `running` ones fail,
    /// `created` ones are aborted, and their schedule tasks are completed.
    ///
    /// Meant for startup, before any run is submitted. Records of runs live
    /// in this executor are left alone.
    pub async fn fail_pending_tasks(&self) -> Result<usize, ExecutorError> {
        let live: HashSet<Uuid> = self.runs.read().await.keys().copied().collect();
        let records = self.store.list_incomplete_progress_records().await?;
        let mut closed = 0;

        for mut record in records {
            let run_id = record.parent_id.unwrap_or(record.id);
            if live.contains(&run_id) {
                continue;
            }

            let (to, error) = match record.state {
                TaskState::Running => (TaskState::Failure, Some(RESTART_ERROR)),
                _ => (TaskState::Aborted, None),
            };
            record
                .transition_to(to, error)
                .map_err(|reason| ExecutorError::InvalidState {
                    id: record.id,
                    reason,
                })?;
            self.store.update_progress_record(&record).await?;
            if record.parent_id.is_none() {
                self.store
                    .complete_schedule_task(record.id, Utc::now())
                    .await?;
            }
            closed += 1;
        }

        if closed > 0 {
            tracing::warn!(closed, "Closed task records left open by a previous run");
        }
        Ok(closed)
    }
}
