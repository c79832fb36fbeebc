//! Queue manager — priority tiers, delayed set, leases, heartbeats and locks.
//!
//! Key layout under the configured prefix:
//!
//! | Key | Type | Holds |
//! |-----|------|-------|
//! | `{p}:queue:{priority}` | list | task ids, FIFO |
//! | `{p}:delayed` | sorted set | `{priority}|{id}` scored by due time (epoch ms) |
//! | `{p}:processing:{worker}` | hash | `task id -> leased_at` (epoch ms) |
//! | `{p}:worker:{worker}` | hash, TTL | heartbeat metadata |
//! | `{p}:lock:{name}` | string, TTL | admin lock holder token |

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backend::{PushOutcome, QueueBackend};
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::tasks::TaskPriority;

/// Where an enqueued task landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Enqueued {
    pub queue_name: String,
    /// 1-based position in the tier; 0 while waiting in the delayed set.
    pub position: u64,
    pub delayed: bool,
}

/// A task handed to a worker by `dequeue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leased {
    pub task_id: Uuid,
    pub priority: TaskPriority,
    pub worker_id: String,
    pub leased_at: DateTime<Utc>,
}

/// One entry of a worker's processing record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub worker_id: String,
    pub task_id: Uuid,
    pub leased_at: DateTime<Utc>,
}

/// Liveness record written by each executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub node_id: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task: Option<Uuid>,
    pub processed: u64,
}

impl WorkerHeartbeat {
    fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("worker_id".into(), self.worker_id.clone()),
            ("node_id".into(), self.node_id.clone()),
            ("started_at".into(), self.started_at.to_rfc3339()),
            ("last_heartbeat".into(), self.last_heartbeat.to_rfc3339()),
            (
                "current_task".into(),
                self.current_task.map(|id| id.to_string()).unwrap_or_default(),
            ),
            ("processed".into(), self.processed.to_string()),
        ]
    }

    fn from_fields(fields: &std::collections::HashMap<String, String>) -> Option<Self> {
        let ts = |name: &str| {
            fields
                .get(name)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc))
        };
        Some(Self {
            worker_id: fields.get("worker_id")?.clone(),
            node_id: fields.get("node_id").cloned().unwrap_or_default(),
            started_at: ts("started_at")?,
            last_heartbeat: ts("last_heartbeat")?,
            current_task: fields
                .get("current_task")
                .and_then(|s| Uuid::parse_str(s).ok()),
            processed: fields
                .get("processed")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
        })
    }
}

/// Depth of one tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierInfo {
    pub priority: TaskPriority,
    pub queue_name: String,
    pub length: u64,
    /// Entries of this tier still waiting in the delayed set.
    pub delayed: u64,
}

/// Snapshot of every tier plus the delayed set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueInfo {
    pub tiers: Vec<TierInfo>,
    pub delayed: u64,
    pub total: u64,
}

impl QueueInfo {
    /// Totals over the given tiers only.
    pub fn from_tiers(tiers: Vec<TierInfo>) -> Self {
        let delayed = tiers.iter().map(|t| t.delayed).sum::<u64>();
        let total = tiers.iter().map(|t| t.length).sum::<u64>() + delayed;
        Self {
            tiers,
            delayed,
            total,
        }
    }
}

fn epoch_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Owns all queue mutation. Every operation is one atomic backend primitive.
pub struct QueueManager {
    backend: Arc<dyn QueueBackend>,
    config: QueueConfig,
    /// Wakes local executors blocked in `dequeue_blocking`.
    ready: Notify,
}

impl QueueManager {
    pub fn new(backend: Arc<dyn QueueBackend>, config: QueueConfig) -> Arc<Self> {
        Arc::new(Self {
            backend,
            config,
            ready: Notify::new(),
        })
    }

    // ── Key naming ──────────────────────────────────────────────────

    fn list_prefix(&self) -> String {
        format!("{}:queue:", self.config.key_prefix)
    }

    pub fn queue_name(&self, priority: TaskPriority) -> String {
        format!("{}{}", self.list_prefix(), priority.as_str())
    }

    fn delayed_key(&self) -> String {
        format!("{}:delayed", self.config.key_prefix)
    }

    fn lease_prefix(&self) -> String {
        format!("{}:processing:", self.config.key_prefix)
    }

    fn lease_key(&self, worker_id: &str) -> String {
        format!("{}{worker_id}", self.lease_prefix())
    }

    fn worker_prefix(&self) -> String {
        format!("{}:worker:", self.config.key_prefix)
    }

    fn worker_key(&self, worker_id: &str) -> String {
        format!("{}{worker_id}", self.worker_prefix())
    }

    fn lock_key(&self, name: &str) -> String {
        format!("{}:lock:{name}", self.config.key_prefix)
    }

    fn delayed_member(priority: TaskPriority, id: Uuid) -> String {
        format!("{}|{id}", priority.as_str())
    }

    // ── Enqueue / dequeue ───────────────────────────────────────────

    pub async fn ping(&self) -> Result<(), QueueError> {
        self.backend.ping().await
    }

    fn full(&self, queue: String) -> QueueError {
        warn!(queue = %queue, "Queue full, rejecting task");
        QueueError::Full {
            queue,
            max: self.config.max_queue_length,
        }
    }

    /// Append to the tier's tail, or park in the delayed set when
    /// `scheduled_for` is in the future. Enqueuing an id already in its tier
    /// is a no-op that reports the existing position.
    ///
    /// A delayed entry counts against its tier's capacity when admitted, and
    /// is only promoted once the tier has room.
    pub async fn enqueue(
        &self,
        id: Uuid,
        priority: TaskPriority,
        scheduled_for: DateTime<Utc>,
    ) -> Result<Enqueued, QueueError> {
        if scheduled_for > Utc::now() {
            let delayed = self.delayed_key();
            let member = Self::delayed_member(priority, id);
            let parked = self.backend.scheduled(&delayed).await?;
            if !parked.iter().any(|(m, _)| *m == member) {
                let tier = format!("{}|", priority.as_str());
                let parked_in_tier = parked.iter().filter(|(m, _)| m.starts_with(&tier)).count();
                let ready = self.backend.len(&self.queue_name(priority)).await?;
                if ready + parked_in_tier as u64 >= self.config.max_queue_length {
                    return Err(self.full(self.queue_name(priority)));
                }
            }
            self.backend
                .schedule(&delayed, &member, epoch_millis(scheduled_for))
                .await?;
            debug!(task_id = %id, %priority, %scheduled_for, "Task parked in delayed set");
            return Ok(Enqueued {
                queue_name: delayed,
                position: 0,
                delayed: true,
            });
        }

        let queue = self.queue_name(priority);
        let outcome = self
            .backend
            .push_unique(&queue, &id.to_string(), self.config.max_queue_length)
            .await?;
        let position = match outcome {
            PushOutcome::Added(position) | PushOutcome::Present(position) => position,
            PushOutcome::Full => return Err(self.full(queue)),
        };

        self.ready.notify_one();
        debug!(task_id = %id, queue = %queue, position, "Task enqueued");
        Ok(Enqueued {
            queue_name: queue,
            position,
            delayed: false,
        })
    }

    /// Pop the most urgent task and lease it to `worker_id`.
    ///
    /// Tiers are scanned Critical → Low; within a tier the head is taken.
    pub async fn dequeue(&self, worker_id: &str) -> Result<Option<Leased>, QueueError> {
        let lists: Vec<String> = TaskPriority::DEQUEUE_ORDER
            .iter()
            .map(|p| self.queue_name(*p))
            .collect();
        let now = Utc::now();

        let Some((idx, member)) = self
            .backend
            .pop_and_lease(&lists, &self.lease_key(worker_id), epoch_millis(now))
            .await?
        else {
            return Ok(None);
        };

        let task_id = Uuid::parse_str(&member).map_err(|e| {
            QueueError::Malformed(format!("{} held '{member}': {e}", lists[idx]))
        });
        let task_id = match task_id {
            Ok(id) => id,
            Err(e) => {
                // Drop the garbage lease so the reaper does not trip on it.
                self.backend
                    .release(&self.lease_key(worker_id), &member)
                    .await?;
                return Err(e);
            }
        };

        let priority = TaskPriority::DEQUEUE_ORDER[idx];
        debug!(task_id = %task_id, worker_id, %priority, "Task leased");
        Ok(Some(Leased {
            task_id,
            priority,
            worker_id: worker_id.to_string(),
            leased_at: now,
        }))
    }

    /// `dequeue`, waiting up to `timeout` for work to appear.
    ///
    /// Local enqueues wake the waiter immediately; work enqueued by other
    /// nodes is picked up on the next poll interval.
    pub async fn dequeue_blocking(
        &self,
        worker_id: &str,
        timeout: Duration,
    ) -> Result<Option<Leased>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leased) = self.dequeue(worker_id).await? {
                return Ok(Some(leased));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = (deadline - now).min(self.config.dequeue_poll_interval);
            tokio::select! {
                _ = self.ready.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Best-effort removal from every tier and the delayed set.
    pub async fn remove(&self, id: Uuid) -> Result<bool, QueueError> {
        let member = id.to_string();
        let delayed = self.delayed_key();
        let mut removed = false;
        for priority in TaskPriority::DEQUEUE_ORDER {
            removed |= self
                .backend
                .remove(&self.queue_name(priority), &member)
                .await?;
            removed |= self
                .backend
                .unschedule(&delayed, &Self::delayed_member(priority, id))
                .await?;
        }
        if removed {
            debug!(task_id = %id, "Task removed from queues");
        }
        Ok(removed)
    }

    /// 1-based position in the tier, found by a linear scan.
    pub async fn position(
        &self,
        id: Uuid,
        priority: TaskPriority,
    ) -> Result<Option<u64>, QueueError> {
        let member = id.to_string();
        let entries = self.backend.range(&self.queue_name(priority)).await?;
        Ok(entries
            .iter()
            .position(|m| *m == member)
            .map(|idx| idx as u64 + 1))
    }

    /// Whether the id sits in its tier or the delayed set.
    pub async fn contains(&self, id: Uuid, priority: TaskPriority) -> Result<bool, QueueError> {
        if self.position(id, priority).await?.is_some() {
            return Ok(true);
        }
        let member = Self::delayed_member(priority, id);
        Ok(self
            .backend
            .scheduled(&self.delayed_key())
            .await?
            .iter()
            .any(|(m, _)| *m == member))
    }

    // ── Delayed promotion ───────────────────────────────────────────

    /// Move every due delayed entry to the tail of its tier. Entries whose
    /// tier is full stay parked until a later pass finds room.
    pub async fn promote_due(&self) -> Result<usize, QueueError> {
        let moved = self
            .backend
            .promote_due(
                &self.delayed_key(),
                epoch_millis(Utc::now()),
                &self.list_prefix(),
                self.config.max_queue_length,
            )
            .await?;
        if !moved.is_empty() {
            debug!(count = moved.len(), "Promoted delayed tasks");
            self.ready.notify_waiters();
        }
        Ok(moved.len())
    }

    /// Background loop promoting due delayed entries until shutdown.
    pub fn spawn_promoter(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let period = self.config.promote_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.promote_due().await {
                            warn!(error = %e, "Delayed promotion failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Promoter stopped");
        })
    }

    // ── Leases ──────────────────────────────────────────────────────

    /// Drop a lease. Only one caller ever gets `true` for a given lease.
    pub async fn release(&self, worker_id: &str, id: Uuid) -> Result<bool, QueueError> {
        self.backend
            .release(&self.lease_key(worker_id), &id.to_string())
            .await
    }

    /// Every outstanding lease across all workers.
    pub async fn leases(&self) -> Result<Vec<Lease>, QueueError> {
        let prefix = self.lease_prefix();
        let mut leases = Vec::new();
        for key in self.backend.scan_prefix(&prefix).await? {
            let Some(worker_id) = key.strip_prefix(&prefix) else {
                continue;
            };
            for (field, leased_at) in self.backend.lease_entries(&key).await? {
                match Uuid::parse_str(&field) {
                    Ok(task_id) => leases.push(Lease {
                        worker_id: worker_id.to_string(),
                        task_id,
                        leased_at: from_millis(leased_at),
                    }),
                    Err(_) => {
                        warn!(key = %key, field = %field, "Dropping malformed lease");
                        self.backend.release(&key, &field).await?;
                    }
                }
            }
        }
        Ok(leases)
    }

    // ── Heartbeats ──────────────────────────────────────────────────

    pub async fn heartbeat(
        &self,
        heartbeat: &WorkerHeartbeat,
        ttl: Duration,
    ) -> Result<(), QueueError> {
        self.backend
            .put_hash(
                &self.worker_key(&heartbeat.worker_id),
                &heartbeat.to_fields(),
                ttl,
            )
            .await
    }

    pub async fn worker(&self, worker_id: &str) -> Result<Option<WorkerHeartbeat>, QueueError> {
        let fields = self.backend.get_hash(&self.worker_key(worker_id)).await?;
        Ok(WorkerHeartbeat::from_fields(&fields))
    }

    /// A worker is alive while its heartbeat record has not expired.
    pub async fn is_alive(&self, worker_id: &str) -> Result<bool, QueueError> {
        Ok(self.worker(worker_id).await?.is_some())
    }

    /// Every worker with a live heartbeat, across all nodes.
    pub async fn active_workers(&self) -> Result<Vec<WorkerHeartbeat>, QueueError> {
        let prefix = self.worker_prefix();
        let mut workers = Vec::new();
        for key in self.backend.scan_prefix(&prefix).await? {
            let fields = self.backend.get_hash(&key).await?;
            if let Some(hb) = WorkerHeartbeat::from_fields(&fields) {
                workers.push(hb);
            }
        }
        Ok(workers)
    }

    // ── Admin locks ─────────────────────────────────────────────────

    /// Take a cluster-wide lock. Returns the holder token on success.
    pub async fn try_lock(&self, name: &str, ttl: Duration) -> Result<Option<String>, QueueError> {
        let token = Uuid::new_v4().to_string();
        if self.backend.set_nx(&self.lock_key(name), &token, ttl).await? {
            debug!(lock = name, "Lock acquired");
            Ok(Some(token))
        } else {
            Ok(None)
        }
    }

    /// Release a lock, but only if `token` still holds it.
    pub async fn unlock(&self, name: &str, token: &str) -> Result<bool, QueueError> {
        self.backend
            .delete_if_equals(&self.lock_key(name), token)
            .await
    }

    // ── Admin / introspection ───────────────────────────────────────

    /// Remove every id from one tier (and its delayed entries) and return them.
    ///
    /// Entries are removed one by one so concurrent enqueues are never lost.
    pub async fn drain(&self, priority: TaskPriority) -> Result<Vec<Uuid>, QueueError> {
        let queue = self.queue_name(priority);
        let mut drained = Vec::new();
        for member in self.backend.range(&queue).await? {
            if self.backend.remove(&queue, &member).await? {
                match Uuid::parse_str(&member) {
                    Ok(id) => drained.push(id),
                    Err(_) => warn!(queue = %queue, member = %member, "Dropped malformed entry"),
                }
            }
        }

        let delayed = self.delayed_key();
        let tier = format!("{}|", priority.as_str());
        for (member, _) in self.backend.scheduled(&delayed).await? {
            let Some(id) = member.strip_prefix(&tier) else {
                continue;
            };
            let Ok(id) = Uuid::parse_str(id) else {
                continue;
            };
            if self.backend.unschedule(&delayed, &member).await? {
                drained.push(id);
            }
        }

        info!(queue = %queue, count = drained.len(), "Queue drained");
        Ok(drained)
    }

    pub async fn info(&self) -> Result<QueueInfo, QueueError> {
        let parked = self.backend.scheduled(&self.delayed_key()).await?;
        let mut tiers = Vec::with_capacity(TaskPriority::DEQUEUE_ORDER.len());
        for priority in TaskPriority::DEQUEUE_ORDER {
            let queue_name = self.queue_name(priority);
            let length = self.backend.len(&queue_name).await?;
            let tier = format!("{}|", priority.as_str());
            let delayed = parked.iter().filter(|(m, _)| m.starts_with(&tier)).count() as u64;
            tiers.push(TierInfo {
                priority,
                queue_name,
                length,
                delayed,
            });
        }
        Ok(QueueInfo::from_tiers(tiers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryBackend;

    fn manager() -> Arc<QueueManager> {
        QueueManager::new(Arc::new(MemoryBackend::new()), QueueConfig::default())
    }

    fn small_manager(max: u64) -> Arc<QueueManager> {
        QueueManager::new(
            Arc::new(MemoryBackend::new()),
            QueueConfig {
                max_queue_length: max,
                ..QueueConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn strict_priority_then_fifo() {
        let qm = manager();
        let low = Uuid::new_v4();
        let normal = Uuid::new_v4();
        let critical = Uuid::new_v4();
        let normal2 = Uuid::new_v4();
        let now = Utc::now();
        qm.enqueue(low, TaskPriority::Low, now).await.unwrap();
        qm.enqueue(normal, TaskPriority::Normal, now).await.unwrap();
        qm.enqueue(critical, TaskPriority::Critical, now).await.unwrap();
        qm.enqueue(normal2, TaskPriority::Normal, now).await.unwrap();

        let mut order = Vec::new();
        while let Some(leased) = qm.dequeue("w-1").await.unwrap() {
            order.push(leased.task_id);
        }
        assert_eq!(order, vec![critical, normal, normal2, low]);
    }

    #[tokio::test]
    async fn enqueue_reports_position_and_name() {
        let qm = manager();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let first = qm.enqueue(a, TaskPriority::High, Utc::now()).await.unwrap();
        assert_eq!(first.position, 1);
        assert_eq!(first.queue_name, "taskq:queue:high");
        let second = qm.enqueue(b, TaskPriority::High, Utc::now()).await.unwrap();
        assert_eq!(second.position, 2);

        // Re-enqueue is idempotent.
        let again = qm.enqueue(a, TaskPriority::High, Utc::now()).await.unwrap();
        assert_eq!(again.position, 1);
        assert_eq!(qm.position(b, TaskPriority::High).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn full_tier_is_rejected() {
        let qm = small_manager(1);
        qm.enqueue(Uuid::new_v4(), TaskPriority::Low, Utc::now())
            .await
            .unwrap();
        let err = qm
            .enqueue(Uuid::new_v4(), TaskPriority::Low, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Full { max: 1, .. }));
        // Other tiers are unaffected.
        qm.enqueue(Uuid::new_v4(), TaskPriority::High, Utc::now())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dequeue_creates_a_lease() {
        let qm = manager();
        let id = Uuid::new_v4();
        qm.enqueue(id, TaskPriority::Normal, Utc::now()).await.unwrap();
        let leased = qm.dequeue("w-7").await.unwrap().unwrap();
        assert_eq!(leased.task_id, id);

        let leases = qm.leases().await.unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].worker_id, "w-7");
        assert_eq!(leases[0].task_id, id);

        assert!(qm.release("w-7", id).await.unwrap());
        assert!(qm.leases().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_covers_tiers_and_delayed_set() {
        let qm = manager();
        let queued = Uuid::new_v4();
        let delayed = Uuid::new_v4();
        qm.enqueue(queued, TaskPriority::Low, Utc::now()).await.unwrap();
        qm.enqueue(
            delayed,
            TaskPriority::High,
            Utc::now() + chrono::Duration::hours(1),
        )
        .await
        .unwrap();

        assert!(qm.remove(queued).await.unwrap());
        assert!(qm.remove(delayed).await.unwrap());
        assert!(!qm.remove(queued).await.unwrap());
        assert_eq!(qm.info().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn delayed_tasks_promote_when_due() {
        let qm = manager();
        let id = Uuid::new_v4();
        let parked = qm
            .enqueue(
                id,
                TaskPriority::Critical,
                Utc::now() + chrono::Duration::milliseconds(30),
            )
            .await
            .unwrap();
        assert!(parked.delayed);
        assert!(qm.dequeue("w-1").await.unwrap().is_none());
        assert!(qm.contains(id, TaskPriority::Critical).await.unwrap());

        assert_eq!(qm.promote_due().await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(qm.promote_due().await.unwrap(), 1);
        assert_eq!(qm.position(id, TaskPriority::Critical).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn delayed_path_respects_tier_capacity() {
        let qm = small_manager(2);
        let later = Utc::now() + chrono::Duration::milliseconds(30);
        qm.enqueue(Uuid::new_v4(), TaskPriority::Low, Utc::now())
            .await
            .unwrap();
        let parked = Uuid::new_v4();
        qm.enqueue(parked, TaskPriority::Low, later).await.unwrap();

        // One ready plus one parked fills the tier.
        let err = qm
            .enqueue(Uuid::new_v4(), TaskPriority::Low, later)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Full { max: 2, .. }));
        // Rescheduling an entry already parked is not a new admission.
        qm.enqueue(parked, TaskPriority::Low, later).await.unwrap();

        // A ready push fills the list while the entry is parked; promotion waits for room.
        qm.enqueue(Uuid::new_v4(), TaskPriority::Low, Utc::now())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(qm.promote_due().await.unwrap(), 0);
        assert!(qm.contains(parked, TaskPriority::Low).await.unwrap());
        assert_eq!(qm.position(parked, TaskPriority::Low).await.unwrap(), None);

        qm.dequeue("w-1").await.unwrap().unwrap();
        assert_eq!(qm.promote_due().await.unwrap(), 1);
        assert_eq!(qm.position(parked, TaskPriority::Low).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn info_counts_delayed_entries_per_tier() {
        let qm = manager();
        let later = Utc::now() + chrono::Duration::hours(1);
        qm.enqueue(Uuid::new_v4(), TaskPriority::High, Utc::now())
            .await
            .unwrap();
        qm.enqueue(Uuid::new_v4(), TaskPriority::High, later).await.unwrap();
        qm.enqueue(Uuid::new_v4(), TaskPriority::Low, later).await.unwrap();

        let info = qm.info().await.unwrap();
        assert_eq!(info.delayed, 2);
        assert_eq!(info.total, 3);
        let high = info
            .tiers
            .iter()
            .find(|t| t.priority == TaskPriority::High)
            .unwrap();
        assert_eq!((high.length, high.delayed), (1, 1));
    }

    #[tokio::test]
    async fn blocking_dequeue_wakes_on_enqueue() {
        let qm = manager();
        let waiter = {
            let qm = qm.clone();
            tokio::spawn(async move { qm.dequeue_blocking("w-1", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let id = Uuid::new_v4();
        qm.enqueue(id, TaskPriority::Low, Utc::now()).await.unwrap();

        let leased = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(leased.task_id, id);
    }

    #[tokio::test]
    async fn blocking_dequeue_times_out_empty() {
        let qm = manager();
        let got = qm
            .dequeue_blocking("w-1", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn heartbeats_register_workers() {
        let qm = manager();
        let hb = WorkerHeartbeat {
            worker_id: "node-a-0".into(),
            node_id: "node-a".into(),
            started_at: Utc::now(),
            last_heartbeat: Utc::now(),
            current_task: Some(Uuid::new_v4()),
            processed: 3,
        };
        qm.heartbeat(&hb, Duration::from_millis(30)).await.unwrap();
        assert!(qm.is_alive("node-a-0").await.unwrap());
        let workers = qm.active_workers().await.unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].processed, 3);
        assert_eq!(workers[0].current_task, hb.current_task);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!qm.is_alive("node-a-0").await.unwrap());
    }

    #[tokio::test]
    async fn drain_empties_one_tier() {
        let qm = manager();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let keep = Uuid::new_v4();
        qm.enqueue(a, TaskPriority::Low, Utc::now()).await.unwrap();
        qm.enqueue(b, TaskPriority::Low, Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        qm.enqueue(keep, TaskPriority::High, Utc::now()).await.unwrap();

        let drained = qm.drain(TaskPriority::Low).await.unwrap();
        assert_eq!(drained.len(), 2);
        assert!(drained.contains(&a) && drained.contains(&b));
        assert_eq!(qm.info().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn lock_round_trip() {
        let qm = manager();
        let token = qm
            .try_lock("drain", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert!(qm.try_lock("drain", Duration::from_secs(5)).await.unwrap().is_none());
        assert!(qm.unlock("drain", &token).await.unwrap());
        assert!(qm.try_lock("drain", Duration::from_secs(5)).await.unwrap().is_some());
    }
}
