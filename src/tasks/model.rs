//! Task data model — the entity, its closed enums, and query types.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque caller-supplied payload, handed to the handler untouched.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// The kind of work a task represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    DocumentProcessing,
    BatchProcessing,
    Indexing,
    EmbeddingGeneration,
    VectorStorage,
    HealthCheck,
    RemoteFetchProcessing,
}

impl TaskType {
    pub const ALL: [TaskType; 7] = [
        TaskType::DocumentProcessing,
        TaskType::BatchProcessing,
        TaskType::Indexing,
        TaskType::EmbeddingGeneration,
        TaskType::VectorStorage,
        TaskType::HealthCheck,
        TaskType::RemoteFetchProcessing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DocumentProcessing => "document_processing",
            Self::BatchProcessing => "batch_processing",
            Self::Indexing => "indexing",
            Self::EmbeddingGeneration => "embedding_generation",
            Self::VectorStorage => "vector_storage",
            Self::HealthCheck => "health_check",
            Self::RemoteFetchProcessing => "remote_fetch_processing",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown task type '{s}'"))
    }
}

/// Lifecycle status. See [`crate::tasks::state`] for the legal transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Queued,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown task status '{s}'"))
    }
}

/// Priority tier. Ordering follows urgency: `Low < Normal < High < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    /// Tiers in dequeue order, most urgent first.
    pub const DEQUEUE_ORDER: [TaskPriority; 4] = [
        TaskPriority::Critical,
        TaskPriority::High,
        TaskPriority::Normal,
        TaskPriority::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Numeric rank stored in the record store so `ORDER BY priority` sorts by urgency.
    pub fn rank(&self) -> i64 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }

    pub fn from_rank(rank: i64) -> Self {
        match rank {
            3 => Self::Critical,
            2 => Self::High,
            0 => Self::Low,
            _ => Self::Normal,
        }
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::DEQUEUE_ORDER
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown priority '{s}'"))
    }
}

/// One unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    /// Business grouping key (e.g. knowledge base id).
    pub partition_id: String,
    /// Set when the task was submitted as part of a batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    pub payload: Payload,
    /// Handler result, present once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// 0–100, only meaningful while processing.
    pub progress: u8,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Wall-clock execution budget in seconds.
    pub timeout_secs: u64,
    /// Executor holding (or last holding) the lease.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub scheduled_for: DateTime<Utc>,
}

/// Current time at the precision the record store keeps (microseconds), so an
/// in-memory timestamp compares equal to its stored form.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

impl Task {
    /// Create a queued task with sensible defaults.
    pub fn new(task_type: TaskType, partition_id: impl Into<String>) -> Self {
        let now = now();
        Self {
            id: Uuid::new_v4(),
            task_type,
            status: TaskStatus::Queued,
            priority: TaskPriority::Normal,
            partition_id: partition_id.into(),
            batch_id: None,
            payload: Payload::new(),
            result: None,
            progress: 0,
            retry_count: 0,
            max_retries: 3,
            timeout_secs: 300,
            worker_id: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            scheduled_for: now,
        }
    }

    /// Builder: set priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: set payload.
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Builder: set retry bound.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Builder: set execution budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Builder: delay eligibility.
    pub fn with_scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = at;
        self
    }

    /// Builder: attach to a batch.
    pub fn with_batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Whether the retry policy still allows another attempt.
    pub fn retry_eligible(&self) -> bool {
        self.status == TaskStatus::Failed && self.retry_count < self.max_retries
    }

    /// No further transition can happen without outside intervention.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            TaskStatus::Completed | TaskStatus::Canceled => true,
            TaskStatus::Failed => self.retry_count >= self.max_retries,
            TaskStatus::Queued | TaskStatus::Processing => false,
        }
    }
}

/// Filters accepted by `ListTasks`. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub partition_id: Option<String>,
    pub batch_id: Option<String>,
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
    pub priority: Option<TaskPriority>,
}

/// Sortable (indexed) columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    CreatedAt,
    UpdatedAt,
    Priority,
    Status,
    TaskType,
}

impl SortField {
    pub fn column(&self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
            Self::Priority => "priority",
            Self::Status => "status",
            Self::TaskType => "task_type",
        }
    }
}

impl FromStr for SortField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created_at" => Ok(Self::CreatedAt),
            "updated_at" => Ok(Self::UpdatedAt),
            "priority" => Ok(Self::Priority),
            "status" => Ok(Self::Status),
            "task_type" => Ok(Self::TaskType),
            other => Err(format!("cannot sort by '{other}'")),
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            other => Err(format!("unknown sort order '{other}'")),
        }
    }
}

/// Sort and pagination for `ListTasks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListOptions {
    pub sort_by: SortField,
    pub order: SortOrder,
    pub limit: u32,
    pub offset: u32,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            sort_by: SortField::CreatedAt,
            order: SortOrder::Desc,
            limit: 50,
            offset: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_defaults() {
        let task = Task::new(TaskType::Indexing, "kb-1");
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.priority, TaskPriority::Normal);
        assert_eq!(task.progress, 0);
        assert!(task.worker_id.is_none());
        assert!(task.started_at.is_none());
        assert_eq!(task.scheduled_for, task.created_at);
    }

    #[test]
    fn closed_enums_reject_unknown_values() {
        assert_eq!(
            "document_processing".parse::<TaskType>().unwrap(),
            TaskType::DocumentProcessing
        );
        assert!("teleport".parse::<TaskType>().is_err());
        assert_eq!("critical".parse::<TaskPriority>().unwrap(), TaskPriority::Critical);
        assert!("urgent".parse::<TaskPriority>().is_err());
        assert!("done".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn priority_rank_round_trips_and_orders() {
        for p in TaskPriority::DEQUEUE_ORDER {
            assert_eq!(TaskPriority::from_rank(p.rank()), p);
        }
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::Normal > TaskPriority::Low);
    }

    #[test]
    fn failed_is_terminal_only_when_retries_exhausted() {
        let mut task = Task::new(TaskType::Indexing, "kb").with_max_retries(1);
        task.status = TaskStatus::Failed;
        assert!(!task.is_terminal());
        assert!(task.retry_eligible());

        task.retry_count = 1;
        assert!(task.is_terminal());
        assert!(!task.retry_eligible());
    }

    #[test]
    fn serializes_with_snake_case_enums() {
        let task = Task::new(TaskType::RemoteFetchProcessing, "kb").with_priority(TaskPriority::High);
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["task_type"], "remote_fetch_processing");
        assert_eq!(json["priority"], "high");
        assert_eq!(json["status"], "queued");
        assert!(json.get("worker_id").is_none());
    }
}
