//! Error types for the ops engine.

use uuid::Uuid;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised by task bodies and their parameter validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("Invalid parameters for task {name}: {reason}")]
    Validation { name: String, reason: String },

    #[error("{reason}")]
    Execution { name: String, reason: String },

    #[error("Task {name} was aborted")]
    Aborted { name: String },

    /// The entity the task operates on no longer exists.
    #[error("Target of task {name} no longer exists: {target}")]
    TargetMissing { name: String, target: String },
}

impl TaskError {
    pub fn execution(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Execution {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}

/// Errors from the task executor's public operations.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Run {id} is in an invalid state: {reason}")]
    InvalidState { id: Uuid, reason: String },

    #[error("Run {id} not found")]
    NotFound { id: Uuid },

    #[error("Run {id} was already submitted")]
    AlreadySubmitted { id: Uuid },

    #[error("Validation failed: {0}")]
    Validation(#[from] TaskError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Errors raised while evaluating a single schedule during a tick.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Schedule {name} has neither a frequency nor a cron expression")]
    MissingRecurrence { name: String },

    #[error("Schedule {name} has an invalid cron expression '{expression}': {reason}")]
    InvalidCron {
        name: String,
        expression: String,
        reason: String,
    },

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Errors raised while deleting an artifact.
#[derive(Debug, thiserror::Error)]
pub enum RetentionError {
    #[error("Failed to delete artifact {artifact} from storage: {reason}")]
    Storage { artifact: Uuid, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}
