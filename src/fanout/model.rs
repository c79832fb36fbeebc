//! Fan-out data types — subscription filters, status updates, push-stream messages.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tasks::{Task, TaskStatus, TaskType};

/// What a subscriber wants to hear about.
///
/// An update matches when it hits *any* of the listed ids, partitions, types
/// or batches. An empty filter matches nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    #[serde(default)]
    pub task_ids: HashSet<Uuid>,
    #[serde(default, rename = "kb_ids", alias = "partition_ids")]
    pub partition_ids: HashSet<String>,
    #[serde(default)]
    pub task_types: HashSet<TaskType>,
    #[serde(default)]
    pub batch_ids: HashSet<String>,
}

impl SubscriptionFilter {
    pub fn for_task(id: Uuid) -> Self {
        Self {
            task_ids: HashSet::from([id]),
            ..Self::default()
        }
    }

    pub fn for_batch(batch_id: impl Into<String>) -> Self {
        Self {
            batch_ids: HashSet::from([batch_id.into()]),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.task_ids.is_empty()
            && self.partition_ids.is_empty()
            && self.task_types.is_empty()
            && self.batch_ids.is_empty()
    }

    pub fn matches(&self, update: &StatusUpdate) -> bool {
        self.task_ids.contains(&update.task_id)
            || self.partition_ids.contains(&update.partition_id)
            || self.task_types.contains(&update.task_type)
            || update
                .batch_id
                .as_ref()
                .is_some_and(|b| self.batch_ids.contains(b))
    }
}

/// One observed state of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub task_id: Uuid,
    pub task_type: TaskType,
    #[serde(rename = "kb_id")]
    pub partition_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    pub status: TaskStatus,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// The task's `updated_at` at observation time.
    pub timestamp: DateTime<Utc>,
    /// No further transition will follow.
    pub terminal: bool,
}

impl From<&Task> for StatusUpdate {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            task_type: task.task_type,
            partition_id: task.partition_id.clone(),
            batch_id: task.batch_id.clone(),
            status: task.status,
            progress: task.progress,
            message: task.error_message.clone(),
            timestamp: task.updated_at,
            terminal: task.is_terminal(),
        }
    }
}

/// Client → server push-stream control messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Replace the connection's filter.
    Subscribe {
        #[serde(flatten)]
        filter: SubscriptionFilter,
    },
    /// Clear the filter but keep the connection.
    Unsubscribe,
    Ping,
}

/// Server → client push-stream messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected { connection_id: Uuid },
    Subscribed { filter: SubscriptionFilter },
    Unsubscribed,
    StatusUpdate(StatusUpdate),
    /// Keepalive.
    Ping { timestamp: DateTime<Utc> },
    Pong,
    Error { message: String },
}
