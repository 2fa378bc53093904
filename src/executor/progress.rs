//! Progress records and their state machine.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// State of one task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Record exists, the task has not been started.
    Created,
    /// Task body is executing.
    Running,
    /// Task body returned successfully.
    Success,
    /// Task body (or one of its groups) failed.
    Failure,
    /// Task was cancelled before or while running.
    Aborted,
}

impl TaskState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskState) -> bool {
        use TaskState::*;

        matches!(
            (self, target),
            (Created, Running) | (Created, Aborted) |
            (Running, Success) | (Running, Failure) | (Running, Aborted)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "aborted" => Ok(Self::Aborted),
            other => Err(format!("unknown task state: {other}")),
        }
    }
}

/// Durable record of one task execution inside a run.
///
/// The root of a run has no parent and position 0. Members of the k-th group
/// appended to the run share position k.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub position: u32,
    pub task_name: String,
    pub state: TaskState,
    /// Task parameters, plus an `error` key once the task has failed.
    pub details: serde_json::Value,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressRecord {
    /// Create a record in the `Created` state.
    pub fn new(
        parent_id: Option<Uuid>,
        position: u32,
        task_name: impl Into<String>,
        details: serde_json::Value,
        owner: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            parent_id,
            position,
            task_name: task_name.into(),
            state: TaskState::Created,
            details,
            owner: owner.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `to`, attaching `error` to the details when given.
    pub fn transition_to(&mut self, to: TaskState, error: Option<&str>) -> Result<(), String> {
        if !self.state.can_transition_to(to) {
            return Err(format!("Cannot transition from {} to {}", self.state, to));
        }
        self.state = to;
        self.updated_at = Utc::now();
        if let Some(message) = error {
            self.set_error(message);
        }
        Ok(())
    }

    /// Error message recorded on failure, if any.
    pub fn error(&self) -> Option<&str> {
        self.details.get("error").and_then(|v| v.as_str())
    }

    fn set_error(&mut self, message: &str) {
        match self.details {
            serde_json::Value::Object(ref mut map) => {
                map.insert("error".to_string(), serde_json::Value::from(message));
            }
            serde_json::Value::Null => {
                self.details = serde_json::json!({ "error": message });
            }
            ref other => {
                self.details = serde_json::json!({ "params": other.clone(), "error": message });
            }
        }
    }
}

/// Root record of a run together with its sub-task records, ordered by position.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressTree {
    pub root: ProgressRecord,
    pub subtasks: Vec<ProgressRecord>,
}

impl ProgressTree {
    /// Sub-task records at `position`.
    pub fn at_position(&self, position: u32) -> Vec<&ProgressRecord> {
        self.subtasks
            .iter()
            .filter(|r| r.position == position)
            .collect()
    }

    /// Number of finished sub-tasks over total, for progress display.
    pub fn percent_complete(&self) -> f64 {
        if self.subtasks.is_empty() {
            return if self.root.state.is_terminal() { 100.0 } else { 0.0 };
        }
        let done = self
            .subtasks
            .iter()
            .filter(|r| r.state.is_terminal())
            .count();
        done as f64 * 100.0 / self.subtasks.len() as f64
    }
}
