//! Worker coordinator — executor pool, heartbeats and the lease reaper.
//!
//! Each executor loops: lease a task → admit it under its type's concurrency
//! ceiling → `Queued → Processing` → run the handler under the task timeout →
//! conditional terminal write → release the lease. Terminal writes only land
//! while the task is still processing under this executor, so a result that
//! arrives after a cancel or a reclaim is discarded.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::handler::{HandlerRegistry, TaskContext};
use super::retry::RetryPolicy;
use crate::config::WorkerConfig;
use crate::error::{Error, HandlerError};
use crate::queue::{Lease, Leased, QueueManager, WorkerHeartbeat};
use crate::store::TaskStore;
use crate::tasks::{Task, TaskStatus, TaskType};

/// Per-executor bookkeeping published through heartbeats.
struct ExecutorState {
    worker_id: String,
    started_at: DateTime<Utc>,
    current_task: RwLock<Option<Uuid>>,
    processed: AtomicU64,
}

impl ExecutorState {
    fn new(worker_id: String) -> Arc<Self> {
        Arc::new(Self {
            worker_id,
            started_at: Utc::now(),
            current_task: RwLock::new(None),
            processed: AtomicU64::new(0),
        })
    }

    async fn snapshot(&self, node_id: &str) -> WorkerHeartbeat {
        WorkerHeartbeat {
            worker_id: self.worker_id.clone(),
            node_id: node_id.to_string(),
            started_at: self.started_at,
            last_heartbeat: Utc::now(),
            current_task: *self.current_task.read().await,
            processed: self.processed.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of asking for a type slot.
enum Admission {
    Unlimited,
    Permit(OwnedSemaphorePermit),
    Busy,
}

/// Concurrency ceiling for one task type, as reported in system stats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeLimit {
    pub task_type: TaskType,
    pub limit: usize,
    pub running: usize,
}

/// Shared dependencies for the coordinator.
#[derive(Clone)]
pub struct CoordinatorDeps {
    pub store: Arc<dyn TaskStore>,
    pub queue: Arc<QueueManager>,
    pub handlers: Arc<HandlerRegistry>,
    pub retry: RetryPolicy,
    pub config: WorkerConfig,
    /// How long one blocking dequeue waits before re-checking shutdown.
    pub dequeue_timeout: Duration,
}

/// Bounded pool of executors sharing one queue and one store.
pub struct WorkerCoordinator {
    deps: CoordinatorDeps,
    type_limits: HashMap<TaskType, (usize, Arc<Semaphore>)>,
    executors: RwLock<Vec<Arc<ExecutorState>>>,
}

impl WorkerCoordinator {
    pub fn new(deps: CoordinatorDeps) -> Arc<Self> {
        let type_limits = deps
            .config
            .type_limits
            .iter()
            .map(|(t, limit)| (*t, (*limit, Arc::new(Semaphore::new(*limit)))))
            .collect();
        Arc::new(Self {
            deps,
            type_limits,
            executors: RwLock::new(Vec::new()),
        })
    }

    fn store(&self) -> &Arc<dyn TaskStore> {
        &self.deps.store
    }

    fn queue(&self) -> &Arc<QueueManager> {
        &self.deps.queue
    }

    fn config(&self) -> &WorkerConfig {
        &self.deps.config
    }

    pub fn node_id(&self) -> &str {
        &self.deps.config.node_id
    }

    pub fn pool_size(&self) -> usize {
        self.deps.config.workers
    }

    pub fn type_limits(&self) -> Vec<TypeLimit> {
        let mut limits: Vec<TypeLimit> = self
            .type_limits
            .iter()
            .map(|(task_type, (limit, sem))| TypeLimit {
                task_type: *task_type,
                limit: *limit,
                running: limit.saturating_sub(sem.available_permits()),
            })
            .collect();
        limits.sort_by_key(|l| l.task_type.as_str());
        limits
    }

    /// Ids of tasks currently executing in this process.
    pub async fn running_tasks(&self) -> Vec<Uuid> {
        let mut running = Vec::new();
        for executor in self.executors.read().await.iter() {
            if let Some(id) = *executor.current_task.read().await {
                running.push(id);
            }
        }
        running
    }

    /// Start the executors, their heartbeats and the reaper.
    ///
    /// Heartbeats are written once before any executor leases work so the
    /// reaper never mistakes a fresh executor for a dead one.
    pub async fn start(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>, Error> {
        let mut handles = Vec::new();
        for n in 0..self.config().workers.max(1) {
            let state = ExecutorState::new(format!("{}-{n}", self.node_id()));
            self.queue()
                .heartbeat(
                    &state.snapshot(self.node_id()).await,
                    self.config().heartbeat_ttl,
                )
                .await?;
            self.executors.write().await.push(state.clone());

            handles.push(self.clone().spawn_heartbeat(state.clone(), shutdown.clone()));
            handles.push(self.clone().spawn_executor(state, shutdown.clone()));
        }
        handles.push(self.clone().spawn_reaper(shutdown));

        info!(
            node_id = %self.node_id(),
            workers = self.config().workers.max(1),
            "Worker coordinator started"
        );
        Ok(handles)
    }

    // ── Executor loop ───────────────────────────────────────────────

    fn spawn_executor(
        self: Arc<Self>,
        state: Arc<ExecutorState>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!(worker_id = %state.worker_id, "Executor started");
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let leased = tokio::select! {
                    leased = self.queue().dequeue_blocking(&state.worker_id, self.deps.dequeue_timeout) => leased,
                    _ = shutdown.changed() => break,
                };
                match leased {
                    Ok(Some(leased)) => self.process(&state, leased).await,
                    Ok(None) => {}
                    Err(e) => {
                        warn!(worker_id = %state.worker_id, error = %e, "Dequeue failed");
                        tokio::time::sleep(self.deps.dequeue_timeout).await;
                    }
                }
            }
            debug!(worker_id = %state.worker_id, "Executor stopped");
        })
    }

    /// Run one leased task to a terminal write and release the lease.
    async fn process(&self, state: &ExecutorState, leased: Leased) {
        let worker_id = state.worker_id.as_str();
        let id = leased.task_id;

        let task = match self.store().get_task(id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!(task_id = %id, "Leased task has no record, dropping");
                self.release(worker_id, id).await;
                return;
            }
            Err(e) => {
                warn!(task_id = %id, error = %e, "Could not load leased task, returning it");
                self.put_back(&leased).await;
                return;
            }
        };
        if task.status != TaskStatus::Queued {
            debug!(task_id = %id, status = %task.status, "Leased task no longer queued, dropping");
            self.release(worker_id, id).await;
            return;
        }

        let permit = match self.admit(task.task_type).await {
            Admission::Busy => {
                debug!(task_id = %id, task_type = %task.task_type, "Type at capacity, returning task");
                self.put_back(&leased).await;
                return;
            }
            Admission::Permit(permit) => Some(permit),
            Admission::Unlimited => None,
        };

        let task = match self.store().mark_processing(id, worker_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                debug!(task_id = %id, "Task left Queued before start, dropping");
                self.release(worker_id, id).await;
                return;
            }
            Err(e) => {
                warn!(task_id = %id, error = %e, "Could not start task, returning it");
                self.put_back(&leased).await;
                return;
            }
        };

        *state.current_task.write().await = Some(id);
        info!(
            task_id = %id,
            worker_id,
            task_type = %task.task_type,
            attempt = task.retry_count,
            "Task started"
        );

        let outcome = self.execute(&task, worker_id).await;
        drop(permit);

        match outcome {
            Ok(result) => self.finish_success(&task, worker_id, &result).await,
            Err(e) => self.finish_failure(&task, worker_id, &e).await,
        }

        self.release(worker_id, id).await;
        *state.current_task.write().await = None;
        state.processed.fetch_add(1, Ordering::Relaxed);
    }

    async fn admit(&self, task_type: TaskType) -> Admission {
        let Some((_, sem)) = self.type_limits.get(&task_type) else {
            return Admission::Unlimited;
        };
        match tokio::time::timeout(self.deps.dequeue_timeout, sem.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Admission::Permit(permit),
            _ => Admission::Busy,
        }
    }

    /// Invoke the handler under the task's deadline. Panics become failures.
    async fn execute(&self, task: &Task, worker_id: &str) -> Result<Value, HandlerError> {
        let Some(handler) = self.deps.handlers.get(task.task_type).await else {
            return Err(HandlerError::NotRegistered {
                task_type: task.task_type.to_string(),
            });
        };

        let ctx = TaskContext::new(task, worker_id, self.store().clone());
        let timeout = task.timeout();
        let mut run = tokio::spawn(async move { handler.handle(ctx).await });

        match tokio::time::timeout(timeout, &mut run).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(HandlerError::Failed(format!("handler panicked: {join_err}"))),
            Err(_) => {
                run.abort();
                Err(HandlerError::Timeout { timeout })
            }
        }
    }

    async fn finish_success(&self, task: &Task, worker_id: &str, result: &Value) {
        match self.store().complete_task(task.id, worker_id, result).await {
            Ok(Some(_)) => info!(task_id = %task.id, worker_id, "Task completed"),
            Ok(None) => info!(
                task_id = %task.id,
                worker_id,
                "Discarding result, task no longer held by this worker"
            ),
            Err(e) => error!(task_id = %task.id, error = %e, "Failed to record completion"),
        }
    }

    async fn finish_failure(&self, task: &Task, worker_id: &str, err: &HandlerError) {
        let failed = match self.store().fail_task(task.id, worker_id, &err.to_string()).await {
            Ok(Some(failed)) => failed,
            Ok(None) => {
                info!(
                    task_id = %task.id,
                    worker_id,
                    error = %err,
                    "Discarding failure, task no longer held by this worker"
                );
                return;
            }
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Failed to record failure");
                return;
            }
        };
        warn!(
            task_id = %task.id,
            worker_id,
            error = %err,
            retry_count = failed.retry_count,
            max_retries = failed.max_retries,
            "Task failed"
        );

        if self.config().auto_retry && self.deps.retry.eligible(&failed) {
            self.schedule_retry(&failed).await;
        }
    }

    /// `Failed → Queued` with the backoff applied through the delayed set.
    async fn schedule_retry(&self, failed: &Task) {
        let delay = self.deps.retry.backoff_delay(failed.retry_count);
        let due = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or_else(Utc::now);

        let task = match self.store().retry_task(failed.id, due).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                debug!(task_id = %failed.id, "Retry already taken or no longer eligible");
                return;
            }
            Err(e) => {
                error!(task_id = %failed.id, error = %e, "Failed to schedule retry");
                return;
            }
        };

        match self
            .queue()
            .enqueue(task.id, task.priority, task.scheduled_for)
            .await
        {
            Ok(_) => info!(
                task_id = %task.id,
                retry_count = task.retry_count,
                delay_ms = delay.as_millis() as u64,
                "Retry scheduled"
            ),
            // The record is Queued; startup recovery re-enqueues it.
            Err(e) => error!(task_id = %task.id, error = %e, "Failed to enqueue retry"),
        }
    }

    /// Return a leased-but-unstarted task to its tier, then drop the lease.
    async fn put_back(&self, leased: &Leased) {
        if let Err(e) = self
            .queue()
            .enqueue(leased.task_id, leased.priority, Utc::now())
            .await
        {
            // Keep the lease; the reaper will retry once it expires.
            warn!(task_id = %leased.task_id, error = %e, "Could not return task to queue");
            return;
        }
        self.release(&leased.worker_id, leased.task_id).await;
    }

    async fn release(&self, worker_id: &str, id: Uuid) {
        if let Err(e) = self.queue().release(worker_id, id).await {
            warn!(task_id = %id, worker_id, error = %e, "Failed to release lease");
        }
    }

    // ── Heartbeats ──────────────────────────────────────────────────

    fn spawn_heartbeat(
        self: Arc<Self>,
        state: Arc<ExecutorState>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config().heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let hb = state.snapshot(self.node_id()).await;
                        if let Err(e) = self.queue().heartbeat(&hb, self.config().heartbeat_ttl).await {
                            warn!(worker_id = %state.worker_id, error = %e, "Heartbeat failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    // ── Reaper ──────────────────────────────────────────────────────

    fn spawn_reaper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config().reaper_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.reap().await {
                            Ok(0) => {}
                            Ok(n) => info!(reclaimed = n, "Reaper reclaimed tasks"),
                            Err(e) => warn!(error = %e, "Reaper pass failed"),
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// Whether a lease has outlived what its task could legitimately need.
    fn lease_expired(&self, lease: &Lease, task: Option<&Task>, now: DateTime<Utc>) -> bool {
        let grace = chrono::Duration::from_std(self.config().lease_grace)
            .unwrap_or(chrono::Duration::MAX);
        match task {
            Some(t)
                if t.status == TaskStatus::Processing
                    && t.worker_id.as_deref() == Some(lease.worker_id.as_str()) =>
            {
                let budget = chrono::Duration::from_std(t.timeout())
                    .unwrap_or(chrono::Duration::MAX)
                    .checked_add(&grace)
                    .unwrap_or(chrono::Duration::MAX);
                let started = t.started_at.unwrap_or(lease.leased_at);
                started
                    .checked_add_signed(budget)
                    .is_none_or(|deadline| deadline < now)
            }
            Some(t) if t.status == TaskStatus::Queued => lease
                .leased_at
                .checked_add_signed(grace)
                .is_none_or(|deadline| deadline < now),
            // Terminal, missing, or now held by someone else.
            _ => true,
        }
    }

    /// One reaper pass. Returns how many tasks went back to a queue.
    ///
    /// A lease is reclaimed when its worker's heartbeat expired or the lease
    /// outlived the task's timeout plus grace. The lease release is the
    /// arbitration point: only the reaper that wins it touches the task.
    pub async fn reap(&self) -> Result<usize, Error> {
        let now = Utc::now();
        let mut reclaimed = 0;

        for lease in self.queue().leases().await? {
            let alive = self.queue().is_alive(&lease.worker_id).await?;
            let task = self.store().get_task(lease.task_id).await?;
            if alive && !self.lease_expired(&lease, task.as_ref(), now) {
                continue;
            }
            if !self.queue().release(&lease.worker_id, lease.task_id).await? {
                continue;
            }

            let Some(task) = task else {
                continue;
            };
            let requeued = match task.status {
                TaskStatus::Processing
                    if task.worker_id.as_deref() == Some(lease.worker_id.as_str()) =>
                {
                    self.store()
                        .requeue_task(task.id, &lease.worker_id)
                        .await?
                }
                TaskStatus::Queued => Some(task),
                _ => None,
            };
            let Some(task) = requeued else {
                debug!(task_id = %lease.task_id, worker_id = %lease.worker_id, "Dropped stale lease");
                continue;
            };

            // The record is Queued again; startup recovery covers a failed push.
            if let Err(e) = self
                .queue()
                .enqueue(task.id, task.priority, Utc::now())
                .await
            {
                warn!(task_id = %task.id, error = %e, "Could not requeue reclaimed task");
                continue;
            }
            reclaimed += 1;
            warn!(
                task_id = %task.id,
                worker_id = %lease.worker_id,
                worker_alive = alive,
                "Reclaimed abandoned lease"
            );
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::queue::MemoryBackend;
    use crate::store::LibSqlBackend;

    async fn deps(config: WorkerConfig) -> CoordinatorDeps {
        let store: Arc<dyn TaskStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = QueueManager::new(Arc::new(MemoryBackend::new()), QueueConfig::default());
        CoordinatorDeps {
            store,
            queue,
            handlers: Arc::new(HandlerRegistry::with_builtins()),
            retry: RetryPolicy::default(),
            config,
            dequeue_timeout: Duration::from_millis(50),
        }
    }

    async fn submit(deps: &CoordinatorDeps, task: &Task) {
        deps.store.insert_task(task).await.unwrap();
        deps.queue
            .enqueue(task.id, task.priority, task.scheduled_for)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reaper_reclaims_dead_worker_lease() {
        let deps = deps(WorkerConfig::default()).await;
        let coordinator = WorkerCoordinator::new(deps.clone());
        let task = Task::new(TaskType::Indexing, "kb");
        submit(&deps, &task).await;

        // A worker that never heartbeats leases and starts the task, then dies.
        let leased = deps.queue.dequeue("ghost-0").await.unwrap().unwrap();
        deps.store
            .mark_processing(leased.task_id, "ghost-0")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(coordinator.reap().await.unwrap(), 1);
        let back = deps.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(back.status, TaskStatus::Queued);
        assert!(back.worker_id.is_none());
        assert_eq!(back.retry_count, 0);
        assert_eq!(
            deps.queue.position(task.id, task.priority).await.unwrap(),
            Some(1)
        );

        // Second pass finds nothing.
        assert_eq!(coordinator.reap().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reaper_keeps_going_when_a_requeue_is_rejected() {
        let deps = CoordinatorDeps {
            queue: QueueManager::new(
                Arc::new(MemoryBackend::new()),
                QueueConfig {
                    max_queue_length: 1,
                    ..QueueConfig::default()
                },
            ),
            ..deps(WorkerConfig::default()).await
        };
        let coordinator = WorkerCoordinator::new(deps.clone());

        let mut tasks = Vec::new();
        for ghost in ["ghost-a", "ghost-b"] {
            let task = Task::new(TaskType::Indexing, "kb");
            submit(&deps, &task).await;
            deps.queue.dequeue(ghost).await.unwrap().unwrap();
            deps.store.mark_processing(task.id, ghost).await.unwrap().unwrap();
            tasks.push(task);
        }

        // The tier has room for one; the other push fails without aborting the pass.
        assert_eq!(coordinator.reap().await.unwrap(), 1);
        assert!(deps.queue.leases().await.unwrap().is_empty());
        for task in &tasks {
            let back = deps.store.get_task(task.id).await.unwrap().unwrap();
            assert_eq!(back.status, TaskStatus::Queued);
        }
        assert_eq!(deps.queue.info().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn reaper_leaves_live_leases_alone() {
        let config = WorkerConfig::default();
        let deps = deps(config.clone()).await;
        let coordinator = WorkerCoordinator::new(deps.clone());
        let task = Task::new(TaskType::Indexing, "kb");
        submit(&deps, &task).await;

        deps.queue
            .heartbeat(
                &WorkerHeartbeat {
                    worker_id: "live-0".into(),
                    node_id: "live".into(),
                    started_at: Utc::now(),
                    last_heartbeat: Utc::now(),
                    current_task: None,
                    processed: 0,
                },
                config.heartbeat_ttl,
            )
            .await
            .unwrap();
        deps.queue.dequeue("live-0").await.unwrap().unwrap();
        deps.store.mark_processing(task.id, "live-0").await.unwrap();

        assert_eq!(coordinator.reap().await.unwrap(), 0);
        assert_eq!(deps.queue.leases().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reaper_requeues_leased_but_unstarted_task() {
        let deps = deps(WorkerConfig::default()).await;
        let coordinator = WorkerCoordinator::new(deps.clone());
        let task = Task::new(TaskType::Indexing, "kb");
        submit(&deps, &task).await;

        deps.queue.dequeue("ghost-1").await.unwrap().unwrap();
        assert_eq!(coordinator.reap().await.unwrap(), 1);
        assert!(deps.queue.contains(task.id, task.priority).await.unwrap());
    }

    #[tokio::test]
    async fn reaper_drops_lease_of_terminal_task() {
        let deps = deps(WorkerConfig::default()).await;
        let coordinator = WorkerCoordinator::new(deps.clone());
        let task = Task::new(TaskType::Indexing, "kb");
        submit(&deps, &task).await;

        deps.queue.dequeue("ghost-2").await.unwrap().unwrap();
        deps.store.cancel_task(task.id).await.unwrap().unwrap();

        assert_eq!(coordinator.reap().await.unwrap(), 0);
        assert!(deps.queue.leases().await.unwrap().is_empty());
        assert!(!deps.queue.contains(task.id, task.priority).await.unwrap());
    }

    #[tokio::test]
    async fn lease_expiry_uses_task_timeout_plus_grace() {
        let config = WorkerConfig {
            lease_grace: Duration::from_secs(1),
            ..WorkerConfig::default()
        };
        let deps = deps(config).await;
        let coordinator = WorkerCoordinator::new(deps);

        let mut task = Task::new(TaskType::Indexing, "kb").with_timeout(Duration::from_secs(10));
        task.status = TaskStatus::Processing;
        task.worker_id = Some("w-0".into());
        let started = Utc::now();
        task.started_at = Some(started);
        let lease = Lease {
            worker_id: "w-0".into(),
            task_id: task.id,
            leased_at: started,
        };

        assert!(!coordinator.lease_expired(&lease, Some(&task), started + chrono::Duration::seconds(10)));
        assert!(coordinator.lease_expired(&lease, Some(&task), started + chrono::Duration::seconds(12)));
        assert!(coordinator.lease_expired(&lease, None, started));
    }

    #[tokio::test]
    async fn executors_run_health_checks_end_to_end() {
        let config = WorkerConfig {
            workers: 2,
            node_id: "test-node".into(),
            ..WorkerConfig::default()
        };
        let deps = deps(config).await;
        let coordinator = WorkerCoordinator::new(deps.clone());
        let (tx, rx) = watch::channel(false);
        let handles = coordinator.start(rx).await.unwrap();

        let task = Task::new(TaskType::HealthCheck, "kb");
        submit(&deps, &task).await;

        let done = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let t = deps.store.get_task(task.id).await.unwrap().unwrap();
                if t.status == TaskStatus::Completed {
                    return t;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(done.result, Some(serde_json::json!({ "status": "ok" })));
        assert!(done.worker_id.unwrap().starts_with("test-node-"));

        let workers = deps.queue.active_workers().await.unwrap();
        assert_eq!(workers.len(), 2);

        tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn missing_handler_fails_task() {
        let config = WorkerConfig {
            workers: 1,
            auto_retry: false,
            ..WorkerConfig::default()
        };
        let deps = deps(config).await;
        let coordinator = WorkerCoordinator::new(deps.clone());
        let (tx, rx) = watch::channel(false);
        coordinator.start(rx).await.unwrap();

        let task = Task::new(TaskType::VectorStorage, "kb");
        submit(&deps, &task).await;

        let failed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let t = deps.store.get_task(task.id).await.unwrap().unwrap();
                if t.status == TaskStatus::Failed {
                    return t;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert!(failed.error_message.unwrap().contains("vector_storage"));
        tx.send(true).unwrap();
    }

    /// Holds every call open until the gate opens.
    struct GatedStorage {
        gate: watch::Receiver<bool>,
    }

    #[async_trait::async_trait]
    impl crate::worker::TaskHandler for GatedStorage {
        fn task_type(&self) -> TaskType {
            TaskType::VectorStorage
        }

        async fn handle(&self, _ctx: TaskContext) -> Result<Value, HandlerError> {
            let mut gate = self.gate.clone();
            let _ = gate.wait_for(|open| *open).await;
            Ok(serde_json::json!({ "stored": true }))
        }
    }

    /// Never returns on its own.
    struct Hanging;

    #[async_trait::async_trait]
    impl crate::worker::TaskHandler for Hanging {
        fn task_type(&self) -> TaskType {
            TaskType::Indexing
        }

        async fn handle(&self, _ctx: TaskContext) -> Result<Value, HandlerError> {
            std::future::pending().await
        }
    }

    async fn wait_for_status(deps: &CoordinatorDeps, id: Uuid, status: TaskStatus) -> Task {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let t = deps.store.get_task(id).await.unwrap().unwrap();
                if t.status == status {
                    return t;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn type_ceiling_returns_excess_tasks_to_the_queue() {
        let mut config = WorkerConfig {
            workers: 2,
            auto_retry: false,
            ..WorkerConfig::default()
        };
        config.type_limits.insert(TaskType::VectorStorage, 1);
        let (open_tx, open_rx) = watch::channel(false);
        let handlers = HandlerRegistry::new();
        handlers.register(Arc::new(GatedStorage { gate: open_rx })).await;
        let deps = CoordinatorDeps {
            handlers: Arc::new(handlers),
            ..deps(config).await
        };
        let coordinator = WorkerCoordinator::new(deps.clone());
        let (tx, rx) = watch::channel(false);
        coordinator.start(rx).await.unwrap();

        let first = Task::new(TaskType::VectorStorage, "kb");
        let second = Task::new(TaskType::VectorStorage, "kb");
        submit(&deps, &first).await;
        wait_for_status(&deps, first.id, TaskStatus::Processing).await;
        submit(&deps, &second).await;

        // The second executor keeps bouncing off the ceiling.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let waiting = deps.store.get_task(second.id).await.unwrap().unwrap();
        assert_eq!(waiting.status, TaskStatus::Queued);
        assert_eq!(coordinator.running_tasks().await, vec![first.id]);
        assert_eq!(coordinator.type_limits()[0].running, 1);

        open_tx.send(true).unwrap();
        wait_for_status(&deps, first.id, TaskStatus::Completed).await;
        wait_for_status(&deps, second.id, TaskStatus::Completed).await;
        tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn handler_past_its_deadline_fails_the_task() {
        let config = WorkerConfig {
            workers: 1,
            auto_retry: false,
            ..WorkerConfig::default()
        };
        let handlers = HandlerRegistry::new();
        handlers.register(Arc::new(Hanging)).await;
        let deps = CoordinatorDeps {
            handlers: Arc::new(handlers),
            ..deps(config).await
        };
        let coordinator = WorkerCoordinator::new(deps.clone());
        let (tx, rx) = watch::channel(false);
        coordinator.start(rx).await.unwrap();

        let task = Task::new(TaskType::Indexing, "kb").with_timeout(Duration::from_secs(1));
        submit(&deps, &task).await;

        let failed = wait_for_status(&deps, task.id, TaskStatus::Failed).await;
        let expected = HandlerError::Timeout {
            timeout: Duration::from_secs(1),
        }
        .to_string();
        assert_eq!(failed.error_message.as_deref(), Some(expected.as_str()));
        assert!(failed.result.is_none());
        tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn type_limits_are_reported() {
        let mut config = WorkerConfig::default();
        config.type_limits.insert(TaskType::EmbeddingGeneration, 2);
        let coordinator = WorkerCoordinator::new(deps(config).await);
        let limits = coordinator.type_limits();
        assert_eq!(limits.len(), 1);
        assert_eq!(limits[0].limit, 2);
        assert_eq!(limits[0].running, 0);
    }
}
