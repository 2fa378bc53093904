//! Task-type registry: maps a type tag to the factory building its tasks.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::TaskError;
use crate::task::Task;

/// Builds a task from its JSON parameters.
pub type TaskFactory =
    Arc<dyn Fn(&serde_json::Value) -> Result<Arc<dyn Task>, TaskError> + Send + Sync>;

/// Registry of task types, populated at startup.
pub struct TaskRegistry {
    factories: RwLock<HashMap<String, TaskFactory>>,
}

impl TaskRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Register a factory for `task_type`, replacing any previous one.
    pub async fn register<F>(&self, task_type: impl Into<String>, factory: F)
    where
        F: Fn(&serde_json::Value) -> Result<Arc<dyn Task>, TaskError> + Send + Sync + 'static,
    {
        let task_type = task_type.into();
        let previous = self
            .factories
            .write()
            .await
            .insert(task_type.clone(), Arc::new(factory));
        if previous.is_some() {
            tracing::warn!(task_type = %task_type, "Replaced task factory");
        } else {
            tracing::debug!("Registered task type: {}", task_type);
        }
    }

    /// Build a task of `task_type` from `params`.
    pub async fn create(
        &self,
        task_type: &str,
        params: &serde_json::Value,
    ) -> Result<Arc<dyn Task>, TaskError> {
        let factory = self.factories.read().await.get(task_type).cloned();
        match factory {
            Some(factory) => factory(params),
            None => Err(TaskError::Validation {
                name: task_type.to_string(),
                reason: "no task registered for this type".to_string(),
            }),
        }
    }

    /// Check if a task type exists.
    pub async fn has(&self, task_type: &str) -> bool {
        self.factories.read().await.contains_key(task_type)
    }

    /// List all registered task types.
    pub async fn list(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.read().await.keys().cloned().collect();
        types.sort();
        types
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskContext;
    use async_trait::async_trait;

    struct MockTask {
        name: String,
    }

    #[async_trait]
    impl Task for MockTask {
        fn name(&self) -> &str {
            &self.name
        }
        async fn run(&self, _ctx: &TaskContext) -> Result<(), TaskError> {
            Ok(())
        }
    }

    fn mock_factory(params: &serde_json::Value) -> Result<Arc<dyn Task>, TaskError> {
        let name = params
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TaskError::Validation {
                name: "mock".to_string(),
                reason: "missing name".to_string(),
            })?;
        Ok(Arc::new(MockTask {
            name: name.to_string(),
        }))
    }

    #[tokio::test]
    async fn register_and_create() {
        let registry = TaskRegistry::new();
        registry.register("mock", mock_factory).await;

        assert!(registry.has("mock").await);
        assert!(!registry.has("other").await);

        let task = registry
            .create("mock", &serde_json::json!({ "name": "Backup" }))
            .await
            .unwrap();
        assert_eq!(task.name(), "Backup");
    }

    #[tokio::test]
    async fn factory_errors_propagate() {
        let registry = TaskRegistry::new();
        registry.register("mock", mock_factory).await;

        let err = registry
            .create("mock", &serde_json::json!({}))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TaskError::Validation { .. }));
    }

    #[tokio::test]
    async fn unknown_type_is_validation_error() {
        let registry = TaskRegistry::new();
        let err = registry
            .create("missing", &serde_json::json!({}))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("no task registered"));
    }

    #[tokio::test]
    async fn list_is_sorted() {
        let registry = TaskRegistry::new();
        registry.register("b", mock_factory).await;
        registry.register("a", mock_factory).await;
        assert_eq!(registry.list().await, vec!["a", "b"]);
    }
}
