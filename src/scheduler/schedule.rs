//! Schedule definitions and the bookkeeping of runs they submitted.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Administrative status of a schedule. Only `Active` schedules are ticked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Active,
    Paused,
    Stopped,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ScheduleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("unknown schedule status: {other}")),
        }
    }
}

/// A recurring job definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub name: String,
    pub owner: String,
    /// Type tag resolved through the task registry.
    pub task_type: String,
    /// Fixed period between runs. Takes precedence over `cron_expression`.
    pub frequency: Option<Duration>,
    /// UNIX 5-field or seconds-first 6/7-field cron expression, in UTC.
    pub cron_expression: Option<String>,
    /// Parameters handed to the task factory.
    pub params: serde_json::Value,
    pub status: ScheduleStatus,
    /// Set while a tick is evaluating this schedule.
    pub running_state: bool,
    /// Overrides the configured number of artifacts kept by retention.
    pub min_to_retain: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// Create an active schedule with no recurrence set.
    pub fn new(
        name: impl Into<String>,
        owner: impl Into<String>,
        task_type: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            owner: owner.into(),
            task_type: task_type.into(),
            frequency: None,
            cron_expression: None,
            params,
            status: ScheduleStatus::Active,
            running_state: false,
            min_to_retain: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_frequency(mut self, frequency: Duration) -> Self {
        self.frequency = Some(frequency);
        self
    }

    pub fn with_cron(mut self, expression: impl Into<String>) -> Self {
        self.cron_expression = Some(expression.into());
        self
    }

    pub fn with_min_to_retain(mut self, min: u32) -> Self {
        self.min_to_retain = Some(min);
        self
    }
}

/// A run submitted on behalf of a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleTask {
    /// Id of the submitted run (equal to its root progress record id).
    pub task_id: Uuid,
    pub schedule_id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    /// Set once the run reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl ScheduleTask {
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}
