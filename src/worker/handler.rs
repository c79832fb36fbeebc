//! Task handlers — the pluggable per-type execution capability.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::HandlerError;
use crate::store::TaskStore;
use crate::tasks::{Payload, Task, TaskStatus, TaskType};

/// Work performed for one task type.
///
/// Handlers run under the task's timeout. Long-running handlers should call
/// [`TaskContext::report_progress`] regularly; it doubles as the cancellation
/// checkpoint.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn task_type(&self) -> TaskType;

    async fn handle(&self, ctx: TaskContext) -> Result<Value, HandlerError>;
}

/// What a handler sees of the task it is running.
#[derive(Clone)]
pub struct TaskContext {
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub partition_id: String,
    pub payload: Payload,
    /// 0 on the first attempt.
    pub attempt: u32,
    pub worker_id: String,
    store: Arc<dyn TaskStore>,
}

impl TaskContext {
    pub fn new(task: &Task, worker_id: impl Into<String>, store: Arc<dyn TaskStore>) -> Self {
        Self {
            task_id: task.id,
            task_type: task.task_type,
            partition_id: task.partition_id.clone(),
            payload: task.payload.clone(),
            attempt: task.retry_count,
            worker_id: worker_id.into(),
            store,
        }
    }

    /// Record progress (0–100) and an optional diagnostic message.
    ///
    /// Fails with [`HandlerError::Canceled`] once the task is no longer
    /// processing under this worker, so the handler can stop early.
    pub async fn report_progress(
        &self,
        progress: u8,
        message: Option<&str>,
    ) -> Result<(), HandlerError> {
        match self
            .store
            .update_progress(self.task_id, &self.worker_id, progress.min(100), message)
            .await
        {
            Ok(true) => Ok(()),
            Ok(false) => Err(HandlerError::Canceled { id: self.task_id }),
            Err(e) => Err(HandlerError::Failed(format!("progress write failed: {e}"))),
        }
    }

    /// Whether the task was canceled or reclaimed away from this worker.
    pub async fn is_canceled(&self) -> bool {
        match self.store.get_task(self.task_id).await {
            Ok(Some(task)) => {
                task.status != TaskStatus::Processing
                    || task.worker_id.as_deref() != Some(self.worker_id.as_str())
            }
            Ok(None) => true,
            // Unknown; keep working and let the terminal write decide.
            Err(_) => false,
        }
    }

    /// Deserialize the payload into a typed struct.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(Value::Object(self.payload.clone()))
            .map_err(|e| HandlerError::InvalidPayload(e.to_string()))
    }
}

/// Registry mapping each task type to its handler.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<TaskType, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with the built-in handlers installed.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register_sync(Arc::new(HealthCheckHandler));
        registry
    }

    /// Register a handler, replacing any previous one for the same type.
    pub async fn register(&self, handler: Arc<dyn TaskHandler>) {
        let task_type = handler.task_type();
        if self
            .handlers
            .write()
            .await
            .insert(task_type, handler)
            .is_some()
        {
            tracing::warn!(%task_type, "Replaced existing task handler");
        }
        tracing::debug!(%task_type, "Registered task handler");
    }

    /// Register a handler (sync version for startup).
    pub fn register_sync(&self, handler: Arc<dyn TaskHandler>) {
        let task_type = handler.task_type();
        if let Ok(mut handlers) = self.handlers.try_write() {
            handlers.insert(task_type, handler);
            tracing::debug!(%task_type, "Registered task handler");
        }
    }

    pub async fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().await.get(&task_type).cloned()
    }

    pub async fn has(&self, task_type: TaskType) -> bool {
        self.handlers.read().await.contains_key(&task_type)
    }

    pub async fn task_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.handlers.read().await.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Built-in `health_check` handler.
pub struct HealthCheckHandler;

#[async_trait]
impl TaskHandler for HealthCheckHandler {
    fn task_type(&self) -> TaskType {
        TaskType::HealthCheck
    }

    async fn handle(&self, ctx: TaskContext) -> Result<Value, HandlerError> {
        ctx.report_progress(100, None).await?;
        Ok(serde_json::json!({ "status": "ok" }))
    }
}
