//! Status hub — subscriber registry plus the diff-poll ticker that feeds it.
//!
//! One ticker polls the task store for rows changed since its watermark and
//! pushes each change to every subscriber whose filter matches. Subscribers
//! never touch the store themselves. Each subscriber has a bounded channel;
//! when it is full the update is dropped for that subscriber only.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{StatusUpdate, SubscriptionFilter};
use crate::config::FanoutConfig;
use crate::error::DatabaseError;
use crate::store::TaskStore;
use crate::tasks::{ListOptions, SortField, SortOrder, TaskFilter};

/// How far behind the watermark each poll re-reads, to catch writes whose
/// timestamp was taken before a previous poll but committed after it.
const OVERLAP_MS: i64 = 2_000;

/// Rows per keyset page when reading changes from the store.
const PAGE_SIZE: u32 = 500;

/// Maximum tasks returned for one batch snapshot.
const BATCH_SNAPSHOT_LIMIT: u32 = 10_000;

struct Subscriber {
    filter: SubscriptionFilter,
    tx: mpsc::Sender<StatusUpdate>,
}

/// Diff cursor over `updated_at`.
struct Cursor {
    watermark: DateTime<Utc>,
    /// Last delivered `updated_at` per task, for rows inside the overlap window.
    delivered: HashMap<Uuid, DateTime<Utc>>,
}

/// Registry of live subscribers shared by every transport.
pub struct StatusHub {
    store: Arc<dyn TaskStore>,
    config: FanoutConfig,
    subscribers: RwLock<HashMap<Uuid, Subscriber>>,
    cursor: Mutex<Cursor>,
}

impl StatusHub {
    pub fn new(store: Arc<dyn TaskStore>, config: FanoutConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            subscribers: RwLock::new(HashMap::new()),
            cursor: Mutex::new(Cursor {
                watermark: Utc::now(),
                delivered: HashMap::new(),
            }),
        })
    }

    pub fn config(&self) -> &FanoutConfig {
        &self.config
    }

    /// Register a subscriber. The receiver yields matching updates.
    pub async fn subscribe(
        &self,
        filter: SubscriptionFilter,
    ) -> (Uuid, mpsc::Receiver<StatusUpdate>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer.max(1));
        self.subscribers
            .write()
            .await
            .insert(id, Subscriber { filter, tx });
        debug!(subscriber_id = %id, "Subscriber registered");
        (id, rx)
    }

    /// Replace a subscriber's filter in place.
    pub async fn update_filter(&self, id: Uuid, filter: SubscriptionFilter) -> bool {
        match self.subscribers.write().await.get_mut(&id) {
            Some(sub) => {
                sub.filter = filter;
                true
            }
            None => false,
        }
    }

    pub async fn unsubscribe(&self, id: Uuid) -> bool {
        let removed = self.subscribers.write().await.remove(&id).is_some();
        if removed {
            debug!(subscriber_id = %id, "Subscriber removed");
        }
        removed
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Current state of every task the filter names explicitly (by id or batch).
    pub async fn snapshot(
        &self,
        filter: &SubscriptionFilter,
    ) -> Result<Vec<StatusUpdate>, DatabaseError> {
        let mut updates = Vec::new();
        for id in &filter.task_ids {
            if let Some(task) = self.store.get_task(*id).await? {
                updates.push(StatusUpdate::from(&task));
            }
        }
        for batch_id in &filter.batch_ids {
            let (tasks, _) = self
                .store
                .list_tasks(
                    &TaskFilter {
                        batch_id: Some(batch_id.clone()),
                        ..TaskFilter::default()
                    },
                    &ListOptions {
                        sort_by: SortField::CreatedAt,
                        order: SortOrder::Asc,
                        limit: BATCH_SNAPSHOT_LIMIT,
                        offset: 0,
                    },
                )
                .await?;
            updates.extend(
                tasks
                    .iter()
                    .filter(|t| !filter.task_ids.contains(&t.id))
                    .map(StatusUpdate::from),
            );
        }
        Ok(updates)
    }

    /// Changes recorded at or after `since` that match `filter`, oldest first,
    /// up to `max` of them.
    pub async fn store_updates_since(
        &self,
        since: DateTime<Utc>,
        filter: &SubscriptionFilter,
        max: usize,
    ) -> Result<Vec<StatusUpdate>, DatabaseError> {
        self.read_changes(since, |u| filter.matches(u), max).await
    }

    /// Walk the store's change log from `since` in `(updated_at, id)` pages,
    /// keeping updates `keep` accepts until `max` are kept or the rows run out.
    async fn read_changes(
        &self,
        since: DateTime<Utc>,
        mut keep: impl FnMut(&StatusUpdate) -> bool + Send,
        max: usize,
    ) -> Result<Vec<StatusUpdate>, DatabaseError> {
        let mut kept = Vec::new();
        let (mut from, mut after) = (since, None);
        loop {
            let page = self.store.list_updated_since(from, after, PAGE_SIZE).await?;
            let exhausted = (page.len() as u32) < PAGE_SIZE;
            if let Some(last) = page.last() {
                (from, after) = (last.updated_at, Some(last.id));
            }
            for task in &page {
                let update = StatusUpdate::from(task);
                if keep(&update) {
                    kept.push(update);
                    if kept.len() >= max {
                        return Ok(kept);
                    }
                }
            }
            if exhausted {
                return Ok(kept);
            }
        }
    }

    /// Deliver updates to every matching subscriber without waiting on any.
    /// Returns the number of deliveries made.
    pub async fn publish(&self, updates: &[StatusUpdate]) -> usize {
        if updates.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        let mut closed = Vec::new();
        {
            let subscribers = self.subscribers.read().await;
            for (id, sub) in subscribers.iter() {
                for update in updates.iter().filter(|u| sub.filter.matches(u)) {
                    match sub.tx.try_send(update.clone()) {
                        Ok(()) => delivered += 1,
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            debug!(subscriber_id = %id, task_id = %update.task_id, "Subscriber full, update dropped");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            closed.push(*id);
                            break;
                        }
                    }
                }
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in closed {
                subscribers.remove(&id);
                debug!(subscriber_id = %id, "Pruned closed subscriber");
            }
        }
        delivered
    }

    /// One diff-poll: read every row changed since the watermark (less the
    /// overlap), skip what was already delivered, publish the rest.
    /// Returns the number of changed tasks observed.
    pub async fn tick(&self) -> Result<usize, DatabaseError> {
        let mut guard = self.cursor.lock().await;
        let cursor = &mut *guard;
        let since = cursor.watermark - chrono::Duration::milliseconds(OVERLAP_MS);

        let updates = self
            .read_changes(
                since,
                |update| {
                    if cursor
                        .delivered
                        .get(&update.task_id)
                        .is_some_and(|seen| *seen >= update.timestamp)
                    {
                        return false;
                    }
                    cursor.delivered.insert(update.task_id, update.timestamp);
                    if update.timestamp > cursor.watermark {
                        cursor.watermark = update.timestamp;
                    }
                    true
                },
                usize::MAX,
            )
            .await?;

        let floor = cursor.watermark - chrono::Duration::milliseconds(OVERLAP_MS);
        cursor.delivered.retain(|_, seen| *seen >= floor);
        drop(guard);

        self.publish(&updates).await;
        Ok(updates.len())
    }

    /// Background loop running `tick` every poll interval until shutdown.
    pub fn spawn_ticker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_ms = self.config.poll_interval.as_millis() as u64,
                "Status fan-out ticker started"
            );
            let mut ticker = tokio::time::interval(self.config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick().await {
                            warn!(error = %e, "Status poll failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Status fan-out ticker stopped");
        })
    }
}
