//! Task abstraction: the unit of work the executor runs.

pub mod builtin;
pub mod registry;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::TaskError;
use crate::executor::group::TaskGroup;
use crate::executor::runnable::RunnableTask;

pub use registry::TaskRegistry;

/// A unit of work with typed parameters.
///
/// Abort is cooperative: a running body is never interrupted, it observes
/// the abort through [`TaskContext::check_abort`] or [`TaskContext::wait_for`]
/// and returns [`TaskError::Aborted`].
#[async_trait]
pub trait Task: Send + Sync {
    /// Display name recorded in the progress record.
    fn name(&self) -> &str;

    /// Parameters recorded in the progress record details.
    fn details(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Check parameters before anything is persisted.
    fn validate_params(&self) -> Result<(), TaskError> {
        Ok(())
    }

    /// Whether an in-flight run of this task may be aborted.
    fn is_abortable(&self) -> bool {
        false
    }

    async fn run(&self, ctx: &TaskContext) -> Result<(), TaskError>;
}

/// Handle given to a task body while it runs.
pub struct TaskContext {
    run: Arc<RunnableTask>,
    record_id: Uuid,
    position: u32,
    task_name: String,
}

impl TaskContext {
    pub(crate) fn new(
        run: Arc<RunnableTask>,
        record_id: Uuid,
        position: u32,
        task_name: impl Into<String>,
    ) -> Self {
        Self {
            run,
            record_id,
            position,
            task_name: task_name.into(),
        }
    }

    /// Id of the run, equal to the root record id.
    pub fn run_id(&self) -> Uuid {
        self.run.id()
    }

    /// Id of this task's own progress record.
    pub fn record_id(&self) -> Uuid {
        self.record_id
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    /// Whether this is the root task of the run.
    pub fn is_root(&self) -> bool {
        self.record_id == self.run.id()
    }

    pub fn is_abort_requested(&self) -> bool {
        self.run.is_abort_requested()
    }

    /// Checkpoint: fail with [`TaskError::Aborted`] once an abort was requested.
    pub fn check_abort(&self) -> Result<(), TaskError> {
        if self.is_abort_requested() {
            return Err(TaskError::Aborted {
                name: self.task_name.clone(),
            });
        }
        Ok(())
    }

    /// Append a group of sub-tasks to the run. Returns the group's position.
    ///
    /// Only the root task may plan groups.
    pub async fn add_group(&self, group: TaskGroup) -> Result<u32, TaskError> {
        self.require_root("add_group")?;
        self.run.add_group(group).await
    }

    /// Run every pending group in order, one barrier per group.
    ///
    /// Returns [`TaskError::Aborted`] when the run was aborted and an
    /// execution error naming the failed sub-task when a group failed. In both
    /// cases the remaining groups have been closed as aborted. A failed
    /// sub-task also flags the run for abort, so groups added afterwards are
    /// closed as aborted too.
    pub async fn run_sub_tasks(&self) -> Result<(), TaskError> {
        self.require_root("run_sub_tasks")?;
        self.run.run_sub_tasks().await
    }

    /// Poll `condition` every `interval` until it returns `true`.
    ///
    /// Sleeps in bounded steps and re-checks the abort flag on every
    /// iteration. Fails once `timeout` has elapsed.
    pub async fn wait_for<F, Fut>(
        &self,
        timeout: Duration,
        interval: Duration,
        mut condition: F,
    ) -> Result<(), TaskError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<bool, TaskError>> + Send,
    {
        let deadline = Instant::now() + timeout;
        let step = interval.max(Duration::from_millis(1));
        loop {
            self.check_abort()?;
            if condition().await? {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TaskError::execution(
                    &self.task_name,
                    format!("timed out after {timeout:?}"),
                ));
            }
            tokio::time::sleep(step.min(deadline - now)).await;
        }
    }

    fn require_root(&self, operation: &str) -> Result<(), TaskError> {
        if self.is_root() {
            Ok(())
        } else {
            Err(TaskError::execution(
                &self.task_name,
                format!("{operation} is only available to the root task"),
            ))
        }
    }
}
