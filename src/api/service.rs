//! Task service — validates requests and drives store, queue and fan-out.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::*;
use crate::config::TaskDefaults;
use crate::error::ApiError;
use crate::fanout::{self, PollResponse, StatusHub, StatusUpdate, SubscriptionFilter, WatchTarget};
use crate::queue::{QueueInfo, QueueManager};
use crate::store::TaskStore;
use crate::tasks::{ListOptions, Task, TaskFilter, TaskPriority, TaskStatus, TaskType};
use crate::worker::WorkerCoordinator;

/// Largest page `list` hands out.
const MAX_PAGE: u32 = 1_000;

/// Default long-poll wait when the caller gives none.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// Slack past the poll timeout before a long-poll is reported as stuck.
const LONG_POLL_GRACE: Duration = Duration::from_secs(5);

/// TTL of the administrative drain lock.
const DRAIN_LOCK_TTL: Duration = Duration::from_secs(60);

/// Page size used when scanning for tasks to recover.
const RECOVERY_PAGE: u32 = 500;

/// Shared components behind every route.
pub struct TaskService {
    store: Arc<dyn TaskStore>,
    queue: Arc<QueueManager>,
    hub: Arc<StatusHub>,
    coordinator: Arc<WorkerCoordinator>,
    defaults: TaskDefaults,
}

impl TaskService {
    pub fn new(
        store: Arc<dyn TaskStore>,
        queue: Arc<QueueManager>,
        hub: Arc<StatusHub>,
        coordinator: Arc<WorkerCoordinator>,
        defaults: TaskDefaults,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            queue,
            hub,
            coordinator,
            defaults,
        })
    }

    pub fn hub(&self) -> &Arc<StatusHub> {
        &self.hub
    }

    // ── Submission ──────────────────────────────────────────────────

    /// Validate a request and turn it into a queued task. Nothing is written.
    fn build_task(
        &self,
        req: SubmitTaskRequest,
        batch_id: Option<&str>,
    ) -> Result<Task, ApiError> {
        let task_type: TaskType = req.task_type.trim().parse().map_err(ApiError::InvalidArgument)?;

        let partition_id = req.partition_id.trim();
        if partition_id.is_empty() {
            return Err(ApiError::InvalidArgument("kb_id must not be empty".into()));
        }

        let priority = match req.priority.as_deref().map(str::trim) {
            Some(p) if !p.is_empty() => p.parse().map_err(ApiError::InvalidArgument)?,
            _ => self.defaults.default_priority,
        };

        let max_retries = req.max_retries.unwrap_or(self.defaults.default_max_retries);
        if max_retries > self.defaults.max_retries_limit {
            return Err(ApiError::InvalidArgument(format!(
                "max_retries must be at most {}",
                self.defaults.max_retries_limit
            )));
        }

        let timeout = match req.timeout {
            Some(0) => {
                return Err(ApiError::InvalidArgument(
                    "timeout must be at least 1 second".into(),
                ));
            }
            Some(secs) => Duration::from_secs(secs),
            None => self.defaults.default_timeout,
        };
        if timeout > self.defaults.max_timeout {
            return Err(ApiError::InvalidArgument(format!(
                "timeout must be at most {}s",
                self.defaults.max_timeout.as_secs()
            )));
        }

        let mut task = Task::new(task_type, partition_id)
            .with_priority(priority)
            .with_payload(req.payload.unwrap_or_default())
            .with_max_retries(max_retries)
            .with_timeout(timeout);
        if let Some(at) = req.scheduled_for {
            task = task.with_scheduled_for(at);
        }
        if let Some(batch_id) = batch_id {
            task = task.with_batch(batch_id);
        }
        Ok(task)
    }

    /// Insert then enqueue. A failed enqueue removes the record again.
    async fn create(&self, task: Task) -> Result<SubmitTaskResponse, ApiError> {
        self.store.insert_task(&task).await?;

        let enqueued = match self
            .queue
            .enqueue(task.id, task.priority, task.scheduled_for)
            .await
        {
            Ok(enqueued) => enqueued,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Enqueue failed, rolling back task");
                if let Err(rollback) = self.store.delete_task(task.id).await {
                    warn!(task_id = %task.id, error = %rollback, "Rollback delete failed");
                }
                return Err(e.into());
            }
        };

        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            priority = %task.priority,
            queue = %enqueued.queue_name,
            position = enqueued.position,
            "Task submitted"
        );

        Ok(SubmitTaskResponse {
            task_id: task.id,
            status: task.status,
            created_at: task.created_at,
            estimated_completion: self.estimate_completion(&task, enqueued.position),
            queue_name: enqueued.queue_name,
            queue_position: enqueued.position,
        })
    }

    fn estimate_completion(&self, task: &Task, position: u64) -> DateTime<Utc> {
        let start = task.scheduled_for.max(Utc::now());
        let ahead = u32::try_from(position.max(1)).unwrap_or(u32::MAX);
        chrono::Duration::from_std(self.defaults.estimated_task_duration.saturating_mul(ahead))
            .ok()
            .and_then(|d| start.checked_add_signed(d))
            .unwrap_or(start)
    }

    pub async fn submit(&self, req: SubmitTaskRequest) -> Result<SubmitTaskResponse, ApiError> {
        let task = self.build_task(req, None)?;
        self.create(task).await
    }

    /// Submit each item independently; one bad item never sinks the batch.
    pub async fn submit_batch(
        &self,
        req: BatchSubmitRequest,
    ) -> Result<BatchSubmitResponse, ApiError> {
        if req.tasks.is_empty() {
            return Err(ApiError::InvalidArgument("batch has no tasks".into()));
        }
        if req.tasks.len() > self.defaults.max_batch_size {
            return Err(ApiError::ResourceExhausted(format!(
                "batch of {} exceeds the limit of {}",
                req.tasks.len(),
                self.defaults.max_batch_size
            )));
        }

        let batch_id = req
            .batch_id
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut results = Vec::with_capacity(req.tasks.len());
        for (index, item) in req.tasks.into_iter().enumerate() {
            let outcome = match self.build_task(item, Some(&batch_id)) {
                Ok(task) => self.create(task).await,
                Err(e) => Err(e),
            };
            results.push(match outcome {
                Ok(task) => BatchItemResult {
                    index,
                    success: true,
                    task: Some(task),
                    error: None,
                },
                Err(e) => BatchItemResult {
                    index,
                    success: false,
                    task: None,
                    error: Some(ErrorBody {
                        code: e.code().to_string(),
                        message: e.to_string(),
                    }),
                },
            });
        }

        let submitted_count = results.iter().filter(|r| r.success).count();
        let failed_count = results.len() - submitted_count;
        info!(batch_id = %batch_id, submitted_count, failed_count, "Batch submitted");

        Ok(BatchSubmitResponse {
            batch_id,
            results,
            submitted_count,
            failed_count,
        })
    }

    // ── Queries ─────────────────────────────────────────────────────

    async fn load(&self, id: Uuid) -> Result<Task, ApiError> {
        self.store
            .get_task(id)
            .await?
            .ok_or_else(|| ApiError::NotFound(id.to_string()))
    }

    pub async fn get(&self, id: Uuid) -> Result<TaskView, ApiError> {
        self.load(id).await.map(TaskView::from)
    }

    pub async fn list(&self, query: ListTasksQuery) -> Result<ListTasksResponse, ApiError> {
        let filter = TaskFilter {
            partition_id: query.kb_id.filter(|s| !s.is_empty()),
            batch_id: query.batch_id.filter(|s| !s.is_empty()),
            status: parse_opt(query.status.as_deref())?,
            task_type: parse_opt(query.task_type.as_deref())?,
            priority: parse_opt(query.priority.as_deref())?,
        };

        let defaults = ListOptions::default();
        let limit = query.limit.unwrap_or(defaults.limit);
        if limit == 0 || limit > MAX_PAGE {
            return Err(ApiError::InvalidArgument(format!(
                "limit must be between 1 and {MAX_PAGE}"
            )));
        }
        let options = ListOptions {
            sort_by: parse_opt(query.sort_by.as_deref())?.unwrap_or(defaults.sort_by),
            order: parse_opt(query.order.as_deref())?.unwrap_or(defaults.order),
            limit,
            offset: query.offset.unwrap_or(0),
        };

        let (tasks, total_count) = self.store.list_tasks(&filter, &options).await?;
        let has_more = u64::from(options.offset) + (tasks.len() as u64) < total_count;
        Ok(ListTasksResponse {
            tasks: tasks.into_iter().map(TaskView::from).collect(),
            total_count,
            has_more,
        })
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    pub async fn cancel(&self, id: Uuid) -> Result<CancelResponse, ApiError> {
        let task = self.load(id).await?;
        if !task.status.is_cancelable() {
            return Err(ApiError::Conflict(format!(
                "task {id} is {} and cannot be canceled",
                task.status
            )));
        }

        let Some(canceled) = self.store.cancel_task(id).await? else {
            // Lost a race with a terminal write.
            let current = self.load(id).await?;
            return Err(ApiError::Conflict(format!(
                "task {id} is {} and cannot be canceled",
                current.status
            )));
        };

        if let Err(e) = self.queue.remove(id).await {
            // Executors skip leased tasks that are no longer queued.
            warn!(task_id = %id, error = %e, "Failed to remove canceled task from queue");
        }

        info!(task_id = %id, previous = %task.status, "Task canceled");
        Ok(CancelResponse {
            success: true,
            task_id: id,
            canceled_at: canceled.completed_at.unwrap_or(canceled.updated_at),
        })
    }

    pub async fn retry(&self, id: Uuid) -> Result<RetryResponse, ApiError> {
        let task = self.load(id).await?;
        if !task.retry_eligible() {
            let reason = if task.status == TaskStatus::Failed {
                format!(
                    "task {id} has used all {} retries",
                    task.max_retries
                )
            } else {
                format!("task {id} is {} and cannot be retried", task.status)
            };
            return Err(ApiError::Conflict(reason));
        }

        let Some(retried) = self.store.retry_task(id, Utc::now()).await? else {
            return Err(ApiError::Conflict(format!(
                "task {id} changed state and cannot be retried"
            )));
        };

        let enqueued = self
            .queue
            .enqueue(retried.id, retried.priority, retried.scheduled_for)
            .await
            .inspect_err(|e| {
                warn!(task_id = %id, error = %e, "Retry enqueue failed; startup recovery will requeue")
            })?;

        info!(task_id = %id, retry_count = retried.retry_count, "Task retried");
        Ok(RetryResponse {
            task_id: id,
            status: retried.status,
            retry_count: retried.retry_count,
            queue_name: enqueued.queue_name,
            queue_position: enqueued.position,
        })
    }

    // ── Status fan-out ──────────────────────────────────────────────

    /// Server stream for one task or batch. Fails with `NotFound` when the
    /// target does not exist.
    pub async fn watch(
        &self,
        target: WatchTarget,
    ) -> Result<ReceiverStream<StatusUpdate>, ApiError> {
        match &target {
            WatchTarget::Task(id) => {
                self.load(*id).await?;
            }
            WatchTarget::Batch(batch_id) => {
                let (_, total) = self
                    .store
                    .list_tasks(
                        &TaskFilter {
                            batch_id: Some(batch_id.clone()),
                            ..TaskFilter::default()
                        },
                        &ListOptions {
                            limit: 1,
                            ..ListOptions::default()
                        },
                    )
                    .await?;
                if total == 0 {
                    return Err(ApiError::NotFound(format!("batch {batch_id}")));
                }
            }
        }
        Ok(fanout::watch(self.hub.clone(), target).await?)
    }

    pub async fn long_poll(&self, query: PollQuery) -> Result<PollResponse, ApiError> {
        let filter = SubscriptionFilter {
            task_ids: split_list(query.task_ids.as_deref())
                .map(|s| {
                    Uuid::parse_str(s)
                        .map_err(|e| ApiError::InvalidArgument(format!("task_ids: '{s}': {e}")))
                })
                .collect::<Result<HashSet<_>, _>>()?,
            partition_ids: split_list(query.kb_ids.as_deref())
                .map(str::to_string)
                .collect(),
            task_types: split_list(query.task_types.as_deref())
                .map(|s| s.parse().map_err(ApiError::InvalidArgument))
                .collect::<Result<HashSet<TaskType>, _>>()?,
            batch_ids: split_list(query.batch_ids.as_deref())
                .map(str::to_string)
                .collect(),
        };
        if filter.is_empty() {
            return Err(ApiError::InvalidArgument(
                "at least one of task_ids, kb_ids, task_types or batch_ids is required".into(),
            ));
        }

        let timeout = query
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_POLL_TIMEOUT)
            .min(self.hub.config().long_poll_max);
        // An empty result at `timeout` is normal; a catch-up read stuck past
        // the grace period is not.
        let deadline = timeout + LONG_POLL_GRACE;
        Ok(tokio::time::timeout(
            deadline,
            fanout::long_poll(&self.hub, filter, query.since, timeout),
        )
        .await??)
    }

    // ── Stats & administration ──────────────────────────────────────

    pub async fn stats_tasks(&self, query: TaskStatsQuery) -> Result<TaskStats, ApiError> {
        let kb_id = query.kb_id.filter(|s| !s.is_empty());
        let counts = self
            .store
            .task_counts(&TaskFilter {
                partition_id: kb_id.clone(),
                ..TaskFilter::default()
            })
            .await?;

        let mut stats = TaskStats {
            kb_id,
            total: 0,
            by_status: TaskStatus::ALL
                .iter()
                .map(|s| (s.as_str().to_string(), 0))
                .collect(),
            by_type: BTreeMap::new(),
            by_priority: BTreeMap::new(),
        };
        for count in counts {
            stats.total += count.count;
            *stats
                .by_status
                .entry(count.status.as_str().to_string())
                .or_default() += count.count;
            *stats
                .by_type
                .entry(count.task_type.as_str().to_string())
                .or_default() += count.count;
            *stats
                .by_priority
                .entry(count.priority.as_str().to_string())
                .or_default() += count.count;
        }
        Ok(stats)
    }

    pub async fn stats_system(&self) -> Result<SystemStats, ApiError> {
        Ok(SystemStats {
            node_id: self.coordinator.node_id().to_string(),
            pool_size: self.coordinator.pool_size(),
            running_tasks: self.coordinator.running_tasks().await,
            queues: self.queue.info().await?,
            workers: self.queue.active_workers().await?,
            subscribers: self.hub.subscriber_count().await,
            type_limits: self.coordinator.type_limits(),
            timestamp: Utc::now(),
        })
    }

    pub async fn queue_info(&self, query: QueueInfoQuery) -> Result<QueueInfoResponse, ApiError> {
        let priority: Option<TaskPriority> = parse_opt(query.priority.as_deref())?;
        let task_type: Option<TaskType> = parse_opt(query.task_type.as_deref())?;

        let mut info = self.queue.info().await?;
        if let Some(priority) = priority {
            info.tiers.retain(|t| t.priority == priority);
            info = QueueInfo::from_tiers(info.tiers);
        }

        let queued_tasks = self
            .store
            .task_counts(&TaskFilter {
                status: Some(TaskStatus::Queued),
                task_type,
                priority,
                ..TaskFilter::default()
            })
            .await?
            .iter()
            .map(|c| c.count)
            .sum();

        Ok(QueueInfoResponse { info, queued_tasks })
    }

    /// Empty one tier under the cluster-wide drain lock and cancel what was in it.
    pub async fn drain(&self, priority: &str) -> Result<DrainResponse, ApiError> {
        let priority: TaskPriority = priority.parse().map_err(ApiError::InvalidArgument)?;
        let Some(token) = self.queue.try_lock("drain", DRAIN_LOCK_TTL).await? else {
            return Err(ApiError::Conflict("a drain is already in progress".into()));
        };

        let outcome = self.drain_locked(priority).await;
        if let Err(e) = self.queue.unlock("drain", &token).await {
            warn!(error = %e, "Failed to release drain lock");
        }
        outcome
    }

    async fn drain_locked(&self, priority: TaskPriority) -> Result<DrainResponse, ApiError> {
        let drained = self.queue.drain(priority).await?;
        let mut canceled = 0;
        for id in &drained {
            if self.store.cancel_task(*id).await?.is_some() {
                canceled += 1;
            }
        }
        info!(%priority, drained = drained.len(), canceled, "Tier drained");
        Ok(DrainResponse {
            queue_name: self.queue.queue_name(priority),
            drained: drained.len(),
            canceled,
        })
    }

    pub async fn health(&self) -> HealthResponse {
        let database = match self.store.ping().await {
            Ok(()) => "ok".to_string(),
            Err(e) => {
                warn!(error = %e, "Record store health check failed");
                format!("error: {e}")
            }
        };
        let queue = match self.queue.ping().await {
            Ok(()) => "ok".to_string(),
            Err(e) => {
                warn!(error = %e, "Queue store health check failed");
                format!("error: {e}")
            }
        };
        let status = if database == "ok" && queue == "ok" {
            "ok"
        } else {
            "degraded"
        };
        HealthResponse {
            status: status.to_string(),
            database,
            queue,
            timestamp: Utc::now(),
        }
    }

    /// Re-enqueue queued tasks that no tier, delayed set or lease holds.
    /// Returns how many were recovered.
    pub async fn recover_on_startup(&self) -> Result<usize, ApiError> {
        let leased: HashSet<Uuid> = self
            .queue
            .leases()
            .await?
            .into_iter()
            .map(|l| l.task_id)
            .collect();

        let filter = TaskFilter {
            status: Some(TaskStatus::Queued),
            ..TaskFilter::default()
        };
        let mut options = ListOptions {
            sort_by: crate::tasks::SortField::CreatedAt,
            order: crate::tasks::SortOrder::Asc,
            limit: RECOVERY_PAGE,
            offset: 0,
        };

        let mut orphans = Vec::new();
        loop {
            let (page, _) = self.store.list_tasks(&filter, &options).await?;
            let fetched = page.len() as u32;
            for task in page {
                if leased.contains(&task.id) {
                    continue;
                }
                if !self.queue.contains(task.id, task.priority).await? {
                    orphans.push(task);
                }
            }
            if fetched < options.limit {
                break;
            }
            options.offset += fetched;
        }

        for task in &orphans {
            self.queue
                .enqueue(task.id, task.priority, task.scheduled_for)
                .await?;
            debug!(task_id = %task.id, "Recovered orphaned queued task");
        }
        if !orphans.is_empty() {
            info!(count = orphans.len(), "Re-enqueued orphaned tasks");
        }
        Ok(orphans.len())
    }
}

fn parse_opt<T>(raw: Option<&str>) -> Result<Option<T>, ApiError>
where
    T: std::str::FromStr<Err = String>,
{
    match raw.map(str::trim) {
        Some(s) if !s.is_empty() => s.parse().map(Some).map_err(ApiError::InvalidArgument),
        _ => Ok(None),
    }
}

fn split_list(raw: Option<&str>) -> impl Iterator<Item = &str> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
