//! Server-streaming transport — watch one task or one batch until it settles.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;

use super::model::{StatusUpdate, SubscriptionFilter};
use super::registry::StatusHub;
use crate::error::DatabaseError;

/// What a watch stream follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchTarget {
    Task(Uuid),
    Batch(String),
}

impl WatchTarget {
    fn filter(&self) -> SubscriptionFilter {
        match self {
            Self::Task(id) => SubscriptionFilter::for_task(*id),
            Self::Batch(batch_id) => SubscriptionFilter::for_batch(batch_id.clone()),
        }
    }
}

/// Tracks the last delivered state per task and decides when the watch ends.
#[derive(Default)]
struct WatchState {
    last_seen: HashMap<Uuid, DateTime<Utc>>,
    terminal: HashMap<Uuid, bool>,
}

impl WatchState {
    /// Whether the update is newer than anything delivered for its task.
    fn accept(&mut self, update: &StatusUpdate) -> bool {
        if self
            .last_seen
            .get(&update.task_id)
            .is_some_and(|seen| *seen >= update.timestamp)
        {
            return false;
        }
        self.last_seen.insert(update.task_id, update.timestamp);
        self.terminal.insert(update.task_id, update.terminal);
        true
    }

    fn settled(&self) -> bool {
        !self.terminal.is_empty() && self.terminal.values().all(|t| *t)
    }
}

/// Start a watch. The stream yields the current state of every tracked task
/// first, then each change, and ends once every tracked task is terminal or
/// the consumer drops it.
pub async fn watch(
    hub: Arc<StatusHub>,
    target: WatchTarget,
) -> Result<ReceiverStream<StatusUpdate>, DatabaseError> {
    let filter = target.filter();
    let (subscriber_id, mut updates) = hub.subscribe(filter.clone()).await;

    let snapshot = match hub.snapshot(&filter).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            hub.unsubscribe(subscriber_id).await;
            return Err(e);
        }
    };

    let (tx, rx) = mpsc::channel(hub.config().subscriber_buffer.max(1));
    tokio::spawn(async move {
        debug!(%subscriber_id, ?target, "Watch stream started");
        let mut state = WatchState::default();

        'watch: {
            for update in snapshot {
                if state.accept(&update) && tx.send(update).await.is_err() {
                    break 'watch;
                }
            }
            if state.settled() {
                break 'watch;
            }

            loop {
                tokio::select! {
                    update = updates.recv() => {
                        let Some(update) = update else { break };
                        if !state.accept(&update) {
                            continue;
                        }
                        if tx.send(update).await.is_err() {
                            break;
                        }
                        if state.settled() {
                            break;
                        }
                    }
                    _ = tx.closed() => break,
                }
            }
        }

        if !hub.unsubscribe(subscriber_id).await {
            warn!(%subscriber_id, "Watch subscriber already removed");
        }
        debug!(%subscriber_id, "Watch stream finished");
    });

    Ok(ReceiverStream::new(rx))
}
