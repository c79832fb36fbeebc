//! Error types for taskq.

use std::time::Duration;

use uuid::Uuid;

/// Error type for the worker coordinator's store and queue plumbing.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Record store errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Queue store errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue backend error: {0}")]
    Backend(String),

    #[error("Queue {queue} is full ({max} entries)")]
    Full { queue: String, max: u64 },

    #[error("Malformed queue entry: {0}")]
    Malformed(String),
}

impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        QueueError::Backend(e.to_string())
    }
}

/// Errors returned by task handlers. Always recovered locally by the worker.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    #[error("No handler registered for task type {task_type}")]
    NotRegistered { task_type: String },

    #[error("Handler failed: {0}")]
    Failed(String),

    #[error("Task timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Task {id} was canceled")]
    Canceled { id: Uuid },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

/// Caller-facing error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Task {0} not found")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),
}

impl ApiError {
    /// Stable machine-readable code for the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::Internal(_) => "internal",
            Self::DeadlineExceeded(_) => "deadline_exceeded",
        }
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ApiError {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        ApiError::DeadlineExceeded(e.to_string())
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Full { .. } => ApiError::ResourceExhausted(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_full_maps_to_resource_exhausted() {
        let err: ApiError = QueueError::Full {
            queue: "taskq:queue:low".into(),
            max: 10,
        }
        .into();
        assert_eq!(err.code(), "resource_exhausted");
    }

    #[tokio::test]
    async fn elapsed_maps_to_deadline_exceeded() {
        let elapsed = tokio::time::timeout(Duration::ZERO, std::future::pending::<()>())
            .await
            .unwrap_err();
        let err: ApiError = elapsed.into();
        assert_eq!(err.code(), "deadline_exceeded");
    }

    #[test]
    fn store_failures_map_to_internal() {
        let err: ApiError = DatabaseError::Query("boom".into()).into();
        assert_eq!(err.code(), "internal");
        let err: ApiError = QueueError::Backend("down".into()).into();
        assert_eq!(err.code(), "internal");
    }
}
