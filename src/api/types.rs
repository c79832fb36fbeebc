//! Request and response bodies of the task API.
//!
//! Enum-valued fields arrive as plain strings and are validated by the
//! service, so an unknown type or priority is an `invalid_argument` error
//! rather than a body-parse rejection.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::queue::{QueueInfo, WorkerHeartbeat};
use crate::tasks::{Payload, Task, TaskPriority, TaskStatus, TaskType};
use crate::worker::TypeLimit;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitTaskRequest {
    pub task_type: String,
    #[serde(rename = "kb_id", alias = "partition_id")]
    pub partition_id: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub payload: Option<Payload>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Execution budget in seconds.
    #[serde(default, alias = "timeout_secs")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitTaskResponse {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub estimated_completion: DateTime<Utc>,
    pub queue_name: String,
    /// 1-based tier position; 0 while delayed.
    pub queue_position: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchSubmitRequest {
    /// Generated when absent.
    #[serde(default)]
    pub batch_id: Option<String>,
    pub tasks: Vec<SubmitTaskRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub index: usize,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<SubmitTaskResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSubmitResponse {
    pub batch_id: String,
    pub results: Vec<BatchItemResult>,
    pub submitted_count: usize,
    pub failed_count: usize,
}

/// A task as shown to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub kb_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub scheduled_for: DateTime<Utc>,
}

impl From<Task> for TaskView {
    fn from(task: Task) -> Self {
        Self {
            task_id: task.id,
            task_type: task.task_type,
            status: task.status,
            priority: task.priority,
            kb_id: task.partition_id,
            batch_id: task.batch_id,
            progress: task.progress,
            message: task.error_message,
            result: task.result,
            retry_count: task.retry_count,
            max_retries: task.max_retries,
            timeout: task.timeout_secs,
            worker_id: task.worker_id,
            payload: task.payload,
            created_at: task.created_at,
            updated_at: task.updated_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
            scheduled_for: task.scheduled_for,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListTasksQuery {
    pub kb_id: Option<String>,
    pub batch_id: Option<String>,
    pub status: Option<String>,
    pub task_type: Option<String>,
    pub priority: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub sort_by: Option<String>,
    pub order: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListTasksResponse {
    pub tasks: Vec<TaskView>,
    pub total_count: u64,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelResponse {
    pub success: bool,
    pub task_id: Uuid,
    pub canceled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryResponse {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub queue_name: String,
    pub queue_position: u64,
}

/// Long-poll query. List-valued parameters are comma separated.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PollQuery {
    pub task_ids: Option<String>,
    pub kb_ids: Option<String>,
    pub task_types: Option<String>,
    pub batch_ids: Option<String>,
    pub since: Option<DateTime<Utc>>,
    /// Seconds.
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskStatsQuery {
    pub kb_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kb_id: Option<String>,
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
    pub by_type: BTreeMap<String, u64>,
    pub by_priority: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub node_id: String,
    pub pool_size: usize,
    pub running_tasks: Vec<Uuid>,
    pub queues: QueueInfo,
    pub workers: Vec<WorkerHeartbeat>,
    pub subscribers: usize,
    pub type_limits: Vec<TypeLimit>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueInfoQuery {
    pub task_type: Option<String>,
    pub priority: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueInfoResponse {
    #[serde(flatten)]
    pub info: QueueInfo,
    /// Queued tasks in the record store matching the query.
    pub queued_tasks: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrainResponse {
    pub queue_name: String,
    pub drained: usize,
    pub canceled: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `ok` or `degraded`.
    pub status: String,
    pub database: String,
    pub queue: String,
    pub timestamp: DateTime<Utc>,
}
