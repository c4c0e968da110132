//! Job handler seam — concrete work is injected at startup, never imported here.

use async_trait::async_trait;
use futures::future::BoxFuture;
use nudgebot_core::error::Result;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::tasks::{TaskRecord, TaskType};

/// Work performed when a trigger fires.
///
/// `Ok(metadata)` closes the occurrence COMPLETED with `metadata` merged in;
/// `Err(e)` closes it FAILED with `e.to_string()` as `error_message`.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, record: &TaskRecord) -> Result<serde_json::Value>;
}

/// Adapter so plain async closures can be registered as handlers.
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F> JobHandler for FnHandler<F>
where
    F: Fn(TaskRecord) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync,
{
    async fn run(&self, record: &TaskRecord) -> Result<serde_json::Value> {
        (self.f)(record.clone()).await
    }
}

/// Wrap an async closure: `handler_fn(|rec| Box::pin(async move { ... }))`.
pub fn handler_fn<F>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(TaskRecord) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync + 'static,
{
    Arc::new(FnHandler { f })
}

/// Handlers by task type, used to re-arm persisted triggers after a restart.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<TaskType, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub fn register(&self, task_type: TaskType, handler: Arc<dyn JobHandler>) {
        if let Ok(mut map) = self.handlers.write() {
            map.insert(task_type, handler);
        }
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .ok()
            .and_then(|map| map.get(&task_type).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{JobSpec, TargetType};
    use chrono::Utc;

    #[tokio::test]
    async fn test_fn_handler_and_registry() {
        let registry = HandlerRegistry::default();
        registry.register(
            TaskType::Cleanup,
            handler_fn(|rec| Box::pin(async move { Ok(serde_json::json!({"target": rec.target_id})) })),
        );
        assert!(registry.get(TaskType::RecurringDm).is_none());

        let handler = registry.get(TaskType::Cleanup).unwrap();
        let spec = JobSpec::new(TaskType::Cleanup, TargetType::System, "system");
        let rec = TaskRecord::recurring("cleanup", &spec, Utc::now(), Utc::now());
        let out = handler.run(&rec).await.unwrap();
        assert_eq!(out["target"], "system");
    }
}
