//! Built-in task types available to every deployment.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::TaskError;
use crate::task::{Task, TaskContext, TaskRegistry};

/// Register the built-in task types.
pub async fn register_builtin_tasks(registry: &TaskRegistry) {
    registry
        .register("noop", |params: &serde_json::Value| {
            Ok(Arc::new(NoopTask::from_params(params)) as Arc<dyn Task>)
        })
        .await;
    registry
        .register("sleep", |params: &serde_json::Value| {
            Ok(Arc::new(SleepTask::from_params(params)?) as Arc<dyn Task>)
        })
        .await;
}

/// Does nothing. Useful for exercising schedules end to end.
pub struct NoopTask {
    name: String,
    params: serde_json::Value,
}

impl NoopTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: serde_json::Value::Null,
        }
    }

    fn from_params(params: &serde_json::Value) -> Self {
        let name = params
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("Noop")
            .to_string();
        Self {
            name,
            params: params.clone(),
        }
    }
}

#[async_trait]
impl Task for NoopTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn details(&self) -> serde_json::Value {
        self.params.clone()
    }

    async fn run(&self, _ctx: &TaskContext) -> Result<(), TaskError> {
        Ok(())
    }
}

/// Waits for a fixed duration, observing aborts while it waits.
pub struct SleepTask {
    duration: Duration,
    poll_interval: Duration,
}

impl SleepTask {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            poll_interval: Duration::from_millis(100).min(duration.max(Duration::from_millis(1))),
        }
    }

    fn from_params(params: &serde_json::Value) -> Result<Self, TaskError> {
        let millis = params
            .get("millis")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| TaskError::Validation {
                name: "Sleep".to_string(),
                reason: "'millis' must be a non-negative integer".to_string(),
            })?;
        Ok(Self::new(Duration::from_millis(millis)))
    }
}

#[async_trait]
impl Task for SleepTask {
    fn name(&self) -> &str {
        "Sleep"
    }

    fn details(&self) -> serde_json::Value {
        serde_json::json!({ "millis": self.duration.as_millis() as u64 })
    }

    fn is_abortable(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        let until = Instant::now() + self.duration;
        // The condition decides completion; the timeout only guards against a stalled clock.
        ctx.wait_for(self.duration * 2 + Duration::from_secs(1), self.poll_interval, || async move {
            Ok(Instant::now() >= until)
        })
        .await
    }
}
