//! Task groups and the worker pools their members run on.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::task::Task;

/// Display tag for a group. Has no effect on execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupType {
    Configure,
    Provision,
    Verify,
    Backup,
    Cleanup,
    Other,
}

/// Bounded pool of concurrent task executions.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: String,
    size: usize,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    /// Create a pool running at most `size` tasks at once (at least one).
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        let size = size.max(1);
        Self {
            name: name.into(),
            size,
            permits: Arc::new(Semaphore::new(size)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a slot. The slot is released when the permit drops.
    pub(crate) async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.permits).acquire_owned().await.ok()
    }
}

/// Ordered batch of sibling tasks sharing one position in the run.
///
/// Members run concurrently; the next group starts only when every member
/// has reached a terminal state.
pub struct TaskGroup {
    description: String,
    group_type: GroupType,
    members: Vec<Arc<dyn Task>>,
    pool: Option<WorkerPool>,
}

impl TaskGroup {
    pub fn new(description: impl Into<String>, group_type: GroupType) -> Self {
        Self {
            description: description.into(),
            group_type,
            members: Vec::new(),
            pool: None,
        }
    }

    /// Append a member.
    pub fn with_task(mut self, task: Arc<dyn Task>) -> Self {
        self.members.push(task);
        self
    }

    pub fn add_task(&mut self, task: Arc<dyn Task>) {
        self.members.push(task);
    }

    /// Run members on a dedicated pool instead of the run's pool.
    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn group_type(&self) -> GroupType {
        self.group_type
    }

    pub fn members(&self) -> &[Arc<dyn Task>] {
        &self.members
    }

    pub fn pool(&self) -> Option<&WorkerPool> {
        self.pool.as_ref()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
