//! Hooks invoked around every task execution of a run.

use crate::executor::progress::ProgressRecord;

/// Decision returned by a before-hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    /// Run the task.
    Proceed,
    /// Do not run the task; mark it aborted and abort the whole run.
    Abort,
    /// Do not run the task; mark it failed with the given message.
    Fail(String),
}

/// Observer attached to a single run.
///
/// `before_task` sees the record after its transition to `running`, once for
/// the root and once per dispatched sub-task. Sub-tasks skipped because the
/// run was already aborted are not reported.
pub trait TaskExecutionListener: Send + Sync {
    fn before_task(&self, record: &ProgressRecord) -> HookOutcome;

    /// Called with the terminal record.
    fn after_task(&self, _record: &ProgressRecord) {}
}

/// Listener that only logs.
pub struct LoggingListener;

impl TaskExecutionListener for LoggingListener {
    fn before_task(&self, record: &ProgressRecord) -> HookOutcome {
        tracing::debug!(
            record_id = %record.id,
            position = record.position,
            task = %record.task_name,
            "Task starting"
        );
        HookOutcome::Proceed
    }

    fn after_task(&self, record: &ProgressRecord) {
        tracing::debug!(
            record_id = %record.id,
            task = %record.task_name,
            state = %record.state,
            "Task finished"
        );
    }
}
