//! Long-poll transport.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::model::{StatusUpdate, SubscriptionFilter};
use super::registry::StatusHub;
use crate::error::DatabaseError;

/// Most updates returned from one catch-up read.
const CATCH_UP_LIMIT: usize = 1_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollResponse {
    pub updates: Vec<StatusUpdate>,
    /// Pass back as `since` on the next poll.
    pub timestamp: DateTime<Utc>,
    pub has_updates: bool,
}

impl PollResponse {
    fn new(updates: Vec<StatusUpdate>, since: DateTime<Utc>) -> Self {
        let timestamp = updates
            .iter()
            .map(|u| u.timestamp)
            .max()
            .map_or(since, |latest| latest.max(since));
        Self {
            has_updates: !updates.is_empty(),
            updates,
            timestamp,
        }
    }
}

/// Wait until at least one matching change newer than `since` exists, or
/// until `timeout` (capped at the configured maximum) elapses.
///
/// Without `since`, only changes after the call count. An empty result after
/// the timeout is a normal outcome.
pub async fn long_poll(
    hub: &StatusHub,
    filter: SubscriptionFilter,
    since: Option<DateTime<Utc>>,
    timeout: Duration,
) -> Result<PollResponse, DatabaseError> {
    let since = since.unwrap_or_else(crate::tasks::now);
    let timeout = timeout.min(hub.config().long_poll_max);

    // Subscribe before catching up so nothing slips between the two.
    let (id, mut rx) = hub.subscribe(filter.clone()).await;
    let result: Result<PollResponse, DatabaseError> = async {
        let mut caught_up = hub
            .store_updates_since(since, &filter, CATCH_UP_LIMIT)
            .await?;
        caught_up.retain(|u| u.timestamp > since);
        if !caught_up.is_empty() {
            return Ok(PollResponse::new(caught_up, since));
        }

        let mut updates = Vec::new();
        if let Ok(Some(first)) = tokio::time::timeout(timeout, rx.recv()).await {
            updates.push(first);
            while let Ok(next) = rx.try_recv() {
                updates.push(next);
            }
        }
        updates.retain(|u| u.timestamp > since);
        debug!(subscriber_id = %id, count = updates.len(), "Long poll finished");
        Ok(PollResponse::new(updates, since))
    }
    .await;

    hub.unsubscribe(id).await;
    result
}
