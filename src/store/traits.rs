//! `TaskStore` trait — the durable source of truth for task records.
//!
//! Every status-changing method is a conditional write: it only applies when
//! the record is in the expected state (and, for worker writes, still held by
//! the calling worker). A `None`/`false` return means the precondition did not
//! hold, which callers use to detect cancel/complete races and stale workers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::tasks::{ListOptions, Task, TaskFilter, TaskPriority, TaskStatus, TaskType};

/// One row of a grouped count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskCount {
    pub status: TaskStatus,
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub count: u64,
}

/// Backend-agnostic task persistence.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    /// Cheap round-trip used by health checks.
    async fn ping(&self) -> Result<(), DatabaseError>;

    /// Insert a new task record.
    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Physically remove a record. Only used to roll back a failed creation.
    async fn delete_task(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Get a task by ID.
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// Filtered, sorted, paginated listing. Returns the page and the total match count.
    async fn list_tasks(
        &self,
        filter: &TaskFilter,
        options: &ListOptions,
    ) -> Result<(Vec<Task>, u64), DatabaseError>;

    /// Changed tasks in `(updated_at, id)` order, starting at `since`.
    ///
    /// With `after`, resumes strictly past the key `(since, after)`, so callers
    /// page by passing back the last row's `updated_at` and `id`.
    async fn list_updated_since(
        &self,
        since: DateTime<Utc>,
        after: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<Task>, DatabaseError>;

    /// Grouped counts by status, type and priority.
    async fn task_counts(&self, filter: &TaskFilter) -> Result<Vec<TaskCount>, DatabaseError>;

    /// `Queued → Processing` under `worker_id`. Resets progress and stamps `started_at`.
    async fn mark_processing(&self, id: Uuid, worker_id: &str)
    -> Result<Option<Task>, DatabaseError>;

    /// Record progress while `Processing` under `worker_id`. Progress never decreases.
    async fn update_progress(
        &self,
        id: Uuid,
        worker_id: &str,
        progress: u8,
        message: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    /// `Processing → Completed` under `worker_id`, storing the handler result.
    async fn complete_task(
        &self,
        id: Uuid,
        worker_id: &str,
        result: &serde_json::Value,
    ) -> Result<Option<Task>, DatabaseError>;

    /// `Processing → Failed` under `worker_id`.
    async fn fail_task(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
    ) -> Result<Option<Task>, DatabaseError>;

    /// `Queued | Processing → Canceled`.
    async fn cancel_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// `Failed → Queued` when `retry_count < max_retries`; bumps `retry_count`
    /// and clears attempt state.
    async fn retry_task(
        &self,
        id: Uuid,
        scheduled_for: DateTime<Utc>,
    ) -> Result<Option<Task>, DatabaseError>;

    /// `Processing → Queued` for a lease abandoned by `worker_id`.
    async fn requeue_task(&self, id: Uuid, worker_id: &str)
    -> Result<Option<Task>, DatabaseError>;
}
