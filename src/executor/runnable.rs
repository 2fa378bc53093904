//! Execution context of one submitted run.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use futures::FutureExt;
use futures::future::join_all;
use tokio::sync::{Mutex, watch};
use uuid::Uuid;

use crate::error::{ExecutorError, TaskError};
use crate::executor::group::{GroupType, TaskGroup, WorkerPool};
use crate::executor::listener::{HookOutcome, TaskExecutionListener};
use crate::executor::progress::{ProgressRecord, TaskState};
use crate::store::Database;
use crate::task::{Task, TaskContext};

/// A sub-task with its persisted record.
#[derive(Clone)]
struct PlannedMember {
    task: Arc<dyn Task>,
    record_id: Uuid,
}

#[derive(Clone)]
struct PlannedGroup {
    description: String,
    group_type: GroupType,
    position: u32,
    pool: Option<WorkerPool>,
    members: Vec<PlannedMember>,
}

/// Groups appended but not started yet.
struct Plan {
    pending: VecDeque<PlannedGroup>,
    next_position: u32,
}

/// Result of one sub-task after the barrier.
struct MemberOutcome {
    name: String,
    state: TaskState,
    error: Option<String>,
}

/// One run: a root task, the groups it appends, and the records of both.
///
/// Every record write of the run goes through `records`, so transitions of
/// concurrent members are serialised and validated against the last
/// persisted state. The in-memory copy is only updated after the store
/// accepted the write.
pub struct RunnableTask {
    id: Uuid,
    task: Arc<dyn Task>,
    owner: String,
    store: Arc<dyn Database>,
    records: Mutex<HashMap<Uuid, ProgressRecord>>,
    plan: Mutex<Plan>,
    abort_requested: AtomicBool,
    listener: OnceLock<Arc<dyn TaskExecutionListener>>,
    pool: OnceLock<WorkerPool>,
    done: watch::Sender<bool>,
}

impl RunnableTask {
    /// Validate the task and persist its root record.
    pub(crate) async fn create(
        task: Arc<dyn Task>,
        owner: impl Into<String>,
        store: Arc<dyn Database>,
    ) -> Result<Arc<Self>, ExecutorError> {
        task.validate_params()?;

        let owner = owner.into();
        let root = ProgressRecord::new(None, 0, task.name(), task.details(), owner.clone());
        store.insert_progress_record(&root).await?;

        let id = root.id;
        let (done, _) = watch::channel(false);
        Ok(Arc::new(Self {
            id,
            task,
            owner,
            store,
            records: Mutex::new(HashMap::from([(id, root)])),
            plan: Mutex::new(Plan {
                pending: VecDeque::new(),
                next_position: 1,
            }),
            abort_requested: AtomicBool::new(false),
            listener: OnceLock::new(),
            pool: OnceLock::new(),
            done,
        }))
    }

    /// Run id, equal to the root record id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn task(&self) -> &Arc<dyn Task> {
        &self.task
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Attach the run's listener. Must happen before submission.
    pub fn set_listener(
        &self,
        listener: Arc<dyn TaskExecutionListener>,
    ) -> Result<(), ExecutorError> {
        if self.pool.get().is_some() {
            return Err(ExecutorError::InvalidState {
                id: self.id,
                reason: "listener must be set before submission".to_string(),
            });
        }
        self.listener
            .set(listener)
            .map_err(|_| ExecutorError::InvalidState {
                id: self.id,
                reason: "listener already set".to_string(),
            })
    }

    /// Current state of the root record.
    pub async fn state(&self) -> TaskState {
        self.records
            .lock()
            .await
            .get(&self.id)
            .map(|r| r.state)
            .unwrap_or(TaskState::Created)
    }

    /// Snapshot of one record of this run.
    pub async fn record(&self, record_id: Uuid) -> Option<ProgressRecord> {
        self.records.lock().await.get(&record_id).cloned()
    }

    pub fn is_abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::Acquire)
    }

    pub(crate) fn request_abort(&self) {
        self.abort_requested.store(true, Ordering::Release);
    }

    /// Whether the run has finished and left the executor's registry.
    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    /// Wait until the run has finished.
    pub async fn wait(&self) {
        let mut rx = self.done.subscribe();
        // The sender lives as long as `self`, so this only fails on a dropped run.
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Bind the submission pool. Fails when the run was already submitted.
    pub(crate) fn bind_pool(&self, pool: WorkerPool) -> Result<(), ExecutorError> {
        self.pool
            .set(pool)
            .map_err(|_| ExecutorError::AlreadySubmitted { id: self.id })
    }

    pub(crate) fn finish(&self) {
        self.done.send_replace(true);
    }

    // ── Planning ────────────────────────────────────────────────────

    /// Append a group, persisting a `created` record per member.
    pub(crate) async fn add_group(&self, group: TaskGroup) -> Result<u32, TaskError> {
        for member in group.members() {
            member.validate_params()?;
        }

        let mut plan = self.plan.lock().await;
        let position = plan.next_position;
        let mut members = Vec::with_capacity(group.len());
        for task in group.members() {
            let record = ProgressRecord::new(
                Some(self.id),
                position,
                task.name(),
                task.details(),
                self.owner.clone(),
            );
            self.store
                .insert_progress_record(&record)
                .await
                .map_err(|e| {
                    TaskError::execution(task.name(), format!("failed to record sub-task: {e}"))
                })?;
            let record_id = record.id;
            self.records.lock().await.insert(record_id, record);
            members.push(PlannedMember {
                task: Arc::clone(task),
                record_id,
            });
        }

        plan.next_position += 1;
        tracing::debug!(
            run_id = %self.id,
            position,
            group = %group.description(),
            members = members.len(),
            "Task group added"
        );
        plan.pending.push_back(PlannedGroup {
            description: group.description().to_string(),
            group_type: group.group_type(),
            position,
            pool: group.pool().cloned(),
            members,
        });
        Ok(position)
    }

    // ── Execution ───────────────────────────────────────────────────

    /// Drive the run from `created` to a terminal root state.
    pub(crate) async fn execute(self: Arc<Self>) {
        let name = self.task.name().to_string();

        if self.is_abort_requested() {
            self.skip_pending_groups().await;
            self.close_open_records().await;
            self.set_state(self.id, TaskState::Aborted, None).await;
            tracing::warn!(run_id = %self.id, task = %name, "Run aborted before start");
            return;
        }

        let Some(running) = self.set_state(self.id, TaskState::Running, None).await else {
            self.close_open_records().await;
            return;
        };
        tracing::info!(run_id = %self.id, task = %name, "Run started");

        let result = match self.before_hook(&running) {
            HookOutcome::Proceed => {
                let ctx = TaskContext::new(Arc::clone(&self), self.id, 0, name.as_str());
                match invoke(self.task.as_ref(), &ctx).await {
                    Ok(()) => self.run_sub_tasks().await,
                    Err(e) => Err(e),
                }
            }
            HookOutcome::Abort => {
                self.request_abort();
                Err(TaskError::Aborted { name: name.clone() })
            }
            HookOutcome::Fail(reason) => Err(TaskError::execution(&name, reason)),
        };

        if result.is_err() {
            self.skip_pending_groups().await;
        }
        self.close_open_records().await;

        let (state, error) = outcome_state(&result);
        if let Some(finished) = self.set_state(self.id, state, error.as_deref()).await {
            self.after_hook(&finished);
        }

        match state {
            TaskState::Success => tracing::info!(run_id = %self.id, task = %name, "Run succeeded"),
            TaskState::Aborted => tracing::warn!(run_id = %self.id, task = %name, "Run aborted"),
            _ => tracing::error!(
                run_id = %self.id,
                task = %name,
                error = error.as_deref().unwrap_or(""),
                "Run failed"
            ),
        }
    }

    /// Run pending groups in order until none is left, one barrier per group.
    pub(crate) async fn run_sub_tasks(self: &Arc<Self>) -> Result<(), TaskError> {
        loop {
            let Some(group) = self.plan.lock().await.pending.pop_front() else {
                return Ok(());
            };

            if self.is_abort_requested() {
                self.abort_members(&group).await;
                self.skip_pending_groups().await;
                return Err(TaskError::Aborted {
                    name: self.task.name().to_string(),
                });
            }

            let outcomes = self.run_group(group).await;

            if let Some(failed) = outcomes.iter().find(|o| o.state == TaskState::Failure) {
                self.skip_pending_groups().await;
                return Err(TaskError::execution(
                    self.task.name(),
                    format!(
                        "Failed to execute task {}: {}",
                        failed.name,
                        failed.error.as_deref().unwrap_or("unknown error")
                    ),
                ));
            }
            if outcomes.iter().any(|o| o.state == TaskState::Aborted) {
                self.skip_pending_groups().await;
                return Err(TaskError::Aborted {
                    name: self.task.name().to_string(),
                });
            }
        }
    }

    /// Dispatch every member of `group` and wait for all of them.
    async fn run_group(self: &Arc<Self>, group: PlannedGroup) -> Vec<MemberOutcome> {
        tracing::info!(
            run_id = %self.id,
            position = group.position,
            group = %group.description,
            group_type = ?group.group_type,
            members = group.members.len(),
            "Running task group"
        );

        let position = group.position;
        let pool = group.pool.clone().or_else(|| self.pool.get().cloned());
        let names: Vec<String> = group
            .members
            .iter()
            .map(|m| m.task.name().to_string())
            .collect();
        let handles = group.members.into_iter().map(|member| {
            let run = Arc::clone(self);
            let pool = pool.clone();
            tokio::spawn(run.run_member(member, position, pool))
        });

        join_all(handles)
            .await
            .into_iter()
            .zip(names)
            .map(|(joined, name)| match joined {
                Ok(outcome) => outcome,
                // Left `running` in the store; `close_open_records` fails it.
                Err(e) => MemberOutcome {
                    name,
                    state: TaskState::Failure,
                    error: Some(format!("task did not complete: {e}")),
                },
            })
            .collect()
    }

    async fn run_member(
        self: Arc<Self>,
        member: PlannedMember,
        position: u32,
        pool: Option<WorkerPool>,
    ) -> MemberOutcome {
        let name = member.task.name().to_string();
        let _permit = match &pool {
            Some(pool) => pool.acquire().await,
            None => None,
        };

        if self.is_abort_requested() {
            self.set_state(member.record_id, TaskState::Aborted, None)
                .await;
            return MemberOutcome {
                name,
                state: TaskState::Aborted,
                error: None,
            };
        }

        let Some(running) = self
            .set_state(member.record_id, TaskState::Running, None)
            .await
        else {
            return MemberOutcome {
                name,
                state: TaskState::Failure,
                error: Some("failed to record task start".to_string()),
            };
        };

        let result = match self.before_hook(&running) {
            HookOutcome::Proceed => {
                let ctx = TaskContext::new(Arc::clone(&self), member.record_id, position, name.as_str());
                invoke(member.task.as_ref(), &ctx).await
            }
            HookOutcome::Abort => {
                tracing::info!(run_id = %self.id, position, task = %name, "Listener aborted run");
                self.request_abort();
                Err(TaskError::Aborted { name: name.clone() })
            }
            HookOutcome::Fail(reason) => Err(TaskError::execution(&name, reason)),
        };

        let (state, error) = outcome_state(&result);
        if state == TaskState::Failure {
            // Members still waiting for a permit end aborted.
            self.request_abort();
        }
        if let Some(finished) = self.set_state(member.record_id, state, error.as_deref()).await {
            self.after_hook(&finished);
        }
        if let Some(message) = &error {
            tracing::warn!(run_id = %self.id, position, task = %name, "Sub-task failed: {message}");
        }

        MemberOutcome { name, state, error }
    }

    // ── Record bookkeeping ──────────────────────────────────────────

    /// Validate and persist a transition of one record of this run.
    async fn transition(
        &self,
        record_id: Uuid,
        to: TaskState,
        error: Option<&str>,
    ) -> Result<ProgressRecord, ExecutorError> {
        let mut records = self.records.lock().await;
        let current = records
            .get(&record_id)
            .ok_or_else(|| ExecutorError::NotFound { id: record_id })?;

        let mut next = current.clone();
        next.transition_to(to, error)
            .map_err(|reason| ExecutorError::InvalidState {
                id: record_id,
                reason,
            })?;
        self.store.update_progress_record(&next).await?;
        records.insert(record_id, next.clone());
        Ok(next)
    }

    /// `transition`, logging instead of propagating failures.
    async fn set_state(
        &self,
        record_id: Uuid,
        to: TaskState,
        error: Option<&str>,
    ) -> Option<ProgressRecord> {
        match self.transition(record_id, to, error).await {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::error!(
                    run_id = %self.id,
                    record_id = %record_id,
                    "Failed to move task to {to}: {e}"
                );
                None
            }
        }
    }

    async fn abort_members(&self, group: &PlannedGroup) {
        for member in &group.members {
            self.set_state(member.record_id, TaskState::Aborted, None)
                .await;
        }
    }

    /// Close every group that has not started as aborted.
    async fn skip_pending_groups(&self) {
        let pending: Vec<PlannedGroup> = self.plan.lock().await.pending.drain(..).collect();
        for group in &pending {
            self.abort_members(group).await;
        }
    }

    /// Sub-task records still open once the root is about to finish:
    /// `created` ones never started and `running` ones lost their task.
    async fn close_open_records(&self) {
        let open: Vec<(Uuid, TaskState)> = self
            .records
            .lock()
            .await
            .values()
            .filter(|r| r.id != self.id && !r.state.is_terminal())
            .map(|r| (r.id, r.state))
            .collect();

        for (record_id, state) in open {
            match state {
                TaskState::Created => {
                    self.set_state(record_id, TaskState::Aborted, None).await;
                }
                _ => {
                    self.set_state(record_id, TaskState::Failure, Some("Task did not finish"))
                        .await;
                }
            }
        }
    }

    fn before_hook(&self, record: &ProgressRecord) -> HookOutcome {
        match self.listener.get() {
            Some(listener) => listener.before_task(record),
            None => HookOutcome::Proceed,
        }
    }

    fn after_hook(&self, record: &ProgressRecord) {
        if let Some(listener) = self.listener.get() {
            listener.after_task(record);
        }
    }
}

/// Run a task body, turning a panic into an execution error.
async fn invoke(task: &dyn Task, ctx: &TaskContext) -> Result<(), TaskError> {
    match AssertUnwindSafe(task.run(ctx)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(TaskError::execution(
            task.name(),
            format!("task panicked: {}", panic_message(panic.as_ref())),
        )),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Terminal state and recorded error for a body result.
fn outcome_state(result: &Result<(), TaskError>) -> (TaskState, Option<String>) {
    match result {
        Ok(()) => (TaskState::Success, None),
        Err(e) if e.is_aborted() => (TaskState::Aborted, None),
        Err(e) => (TaskState::Failure, Some(e.to_string())),
    }
}
