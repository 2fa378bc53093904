//! Artifacts produced by scheduled runs (backups, snapshots) and their
//! deletion lifecycle.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactState {
    /// Still being produced.
    InProgress,
    Completed,
    Failed,
    /// Marked for the garbage collector.
    QueuedForDeletion,
    DeleteInProgress,
    FailedToDelete,
    Deleted,
}

impl ArtifactState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::QueuedForDeletion => "queued_for_deletion",
            Self::DeleteInProgress => "delete_in_progress",
            Self::FailedToDelete => "failed_to_delete",
            Self::Deleted => "deleted",
        }
    }

    /// Whether the artifact counts toward its schedule's retained total.
    pub fn is_live(&self) -> bool {
        !matches!(
            self,
            Self::QueuedForDeletion | Self::DeleteInProgress | Self::Deleted
        )
    }

    /// Whether the retention policy may consider the artifact once it expires.
    pub fn is_expirable(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for ArtifactState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ArtifactState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "queued_for_deletion" => Ok(Self::QueuedForDeletion),
            "delete_in_progress" => Ok(Self::DeleteInProgress),
            "failed_to_delete" => Ok(Self::FailedToDelete),
            "deleted" => Ok(Self::Deleted),
            other => Err(format!("unknown artifact state: {other}")),
        }
    }
}

/// An artifact owned by a schedule, or an orphan when `schedule_id` is `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub schedule_id: Option<Uuid>,
    pub owner: String,
    /// Backend-specific location, handed to the storage on deletion.
    pub location: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub state: ArtifactState,
}

impl Artifact {
    pub fn new(
        schedule_id: Option<Uuid>,
        owner: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            schedule_id,
            owner: owner.into(),
            location: location.into(),
            created_at: Utc::now(),
            expires_at: None,
            state: ArtifactState::Completed,
        }
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_state(mut self, state: ArtifactState) -> Self {
        self.state = state;
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.state.is_expirable() && self.expires_at.is_some_and(|at| at <= now)
    }
}
