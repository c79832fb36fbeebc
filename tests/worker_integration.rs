//! End-to-end worker scenarios: ordering, retries, cancel races and crash
//! recovery, driven through the task service with real executors.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::{Notify, watch};
use tokio::time::timeout;
use uuid::Uuid;

use taskq::api::TaskService;
use taskq::api::types::SubmitTaskRequest;
use taskq::config::{FanoutConfig, QueueConfig, TaskDefaults, WorkerConfig};
use taskq::error::HandlerError;
use taskq::fanout::StatusHub;
use taskq::queue::{MemoryBackend, QueueManager, WorkerHeartbeat};
use taskq::store::{LibSqlBackend, TaskStore};
use taskq::tasks::{Task, TaskPriority, TaskStatus, TaskType};
use taskq::worker::{
    CoordinatorDeps, HandlerRegistry, RetryPolicy, TaskContext, TaskHandler, WorkerCoordinator,
};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

struct Harness {
    service: Arc<TaskService>,
    store: Arc<dyn TaskStore>,
    queue: Arc<QueueManager>,
    coordinator: Arc<WorkerCoordinator>,
    shutdown: watch::Sender<bool>,
}

impl Harness {
    async fn new(handlers: HandlerRegistry, worker: WorkerConfig) -> Self {
        let store: Arc<dyn TaskStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = QueueManager::new(
            Arc::new(MemoryBackend::new()),
            QueueConfig {
                promote_interval: Duration::from_millis(20),
                dequeue_poll_interval: Duration::from_millis(20),
                ..QueueConfig::default()
            },
        );
        let hub = StatusHub::new(store.clone(), FanoutConfig::default());
        let coordinator = WorkerCoordinator::new(CoordinatorDeps {
            store: store.clone(),
            queue: queue.clone(),
            handlers: Arc::new(handlers),
            retry: RetryPolicy {
                base: Duration::from_millis(10),
                max_backoff: Duration::from_millis(50),
            },
            config: worker,
            dequeue_timeout: Duration::from_millis(50),
        });
        let service = TaskService::new(
            store.clone(),
            queue.clone(),
            hub,
            coordinator.clone(),
            TaskDefaults::default(),
        );
        let (shutdown, _) = watch::channel(false);
        Self {
            service,
            store,
            queue,
            coordinator,
            shutdown,
        }
    }

    async fn start(&self) {
        self.queue.clone().spawn_promoter(self.shutdown.subscribe());
        self.coordinator
            .start(self.shutdown.subscribe())
            .await
            .unwrap();
    }

    async fn submit(&self, task_type: &str, priority: &str, max_retries: Option<u32>) -> Uuid {
        self.service
            .submit(SubmitTaskRequest {
                task_type: task_type.into(),
                partition_id: "kb-1".into(),
                priority: Some(priority.into()),
                max_retries,
                ..SubmitTaskRequest::default()
            })
            .await
            .unwrap()
            .task_id
    }

    /// Poll the store until the predicate holds.
    async fn wait_for(&self, id: Uuid, pred: impl Fn(&Task) -> bool) -> Task {
        loop {
            let task = self.store.get_task(id).await.unwrap().unwrap();
            if pred(&task) {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

fn worker_config(workers: usize) -> WorkerConfig {
    WorkerConfig {
        workers,
        node_id: "it".into(),
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_ttl: Duration::from_millis(500),
        lease_grace: Duration::from_millis(200),
        reaper_interval: Duration::from_millis(50),
        auto_retry: false,
        ..WorkerConfig::default()
    }
}

/// Always fails.
struct Failing {
    calls: AtomicU32,
}

#[async_trait]
impl TaskHandler for Failing {
    fn task_type(&self) -> TaskType {
        TaskType::Indexing
    }

    async fn handle(&self, _ctx: TaskContext) -> Result<Value, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::Failed("index unavailable".into()))
    }
}

/// Blocks until released, then reports success.
struct Gated {
    started: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl TaskHandler for Gated {
    fn task_type(&self) -> TaskType {
        TaskType::VectorStorage
    }

    async fn handle(&self, _ctx: TaskContext) -> Result<Value, HandlerError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(json!({"stored": 3}))
    }
}

#[tokio::test]
async fn dequeue_follows_priority_not_arrival() {
    timeout(TEST_TIMEOUT, async {
        let h = Harness::new(HandlerRegistry::new(), worker_config(1)).await;
        let low = h.submit("indexing", "low", None).await;
        let normal = h.submit("indexing", "normal", None).await;
        let critical = h.submit("indexing", "critical", None).await;

        let order: Vec<Uuid> = [
            h.queue.dequeue("w").await.unwrap().unwrap(),
            h.queue.dequeue("w").await.unwrap().unwrap(),
            h.queue.dequeue("w").await.unwrap().unwrap(),
        ]
        .iter()
        .map(|l| l.task_id)
        .collect();
        assert_eq!(order, vec![critical, normal, low]);
        assert!(h.queue.dequeue("w").await.unwrap().is_none());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn manual_retry_is_bounded() {
    timeout(TEST_TIMEOUT, async {
        let failing = Arc::new(Failing {
            calls: AtomicU32::new(0),
        });
        let handlers = HandlerRegistry::new();
        handlers.register(failing.clone()).await;
        let h = Harness::new(handlers, worker_config(1)).await;
        h.start().await;

        let id = h.submit("indexing", "normal", Some(1)).await;
        let failed = h.wait_for(id, |t| t.status == TaskStatus::Failed).await;
        assert_eq!(failed.error_message.as_deref(), Some("Handler failed: index unavailable"));
        assert!(failed.worker_id.is_some());

        let retried = h.service.retry(id).await.unwrap();
        assert_eq!(retried.retry_count, 1);

        let failed = h
            .wait_for(id, |t| t.status == TaskStatus::Failed && t.retry_count == 1)
            .await;
        assert!(failed.is_terminal());
        assert_eq!(failed_calls(&failing), 2);

        let err = h.service.retry(id).await.unwrap_err();
        assert_eq!(err.code(), "conflict");
    })
    .await
    .expect("test timed out");
}

fn failed_calls(handler: &Failing) -> u32 {
    handler.calls.load(Ordering::SeqCst)
}

#[tokio::test]
async fn automatic_retry_runs_until_exhausted() {
    timeout(TEST_TIMEOUT, async {
        let failing = Arc::new(Failing {
            calls: AtomicU32::new(0),
        });
        let handlers = HandlerRegistry::new();
        handlers.register(failing.clone()).await;
        let h = Harness::new(
            handlers,
            WorkerConfig {
                auto_retry: true,
                ..worker_config(1)
            },
        )
        .await;
        h.start().await;

        let id = h.submit("indexing", "high", Some(2)).await;
        let task = h
            .wait_for(id, |t| t.status == TaskStatus::Failed && t.retry_count == 2)
            .await;
        assert!(task.is_terminal());
        assert_eq!(failed_calls(&failing), 3);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn cancel_wins_over_late_completion() {
    timeout(TEST_TIMEOUT, async {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let handlers = HandlerRegistry::new();
        handlers
            .register(Arc::new(Gated {
                started: started.clone(),
                release: release.clone(),
            }))
            .await;
        let h = Harness::new(handlers, worker_config(1)).await;
        h.start().await;

        let id = h.submit("vector_storage", "normal", None).await;
        started.notified().await;
        h.wait_for(id, |t| t.status == TaskStatus::Processing).await;

        let canceled = h.service.cancel(id).await.unwrap();
        assert!(canceled.success);
        release.notify_one();

        // The executor finishes and frees itself; the late result is dropped.
        loop {
            if h.coordinator.running_tasks().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let task = h.store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);
        assert!(task.result.is_none());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn completed_task_keeps_its_result() {
    timeout(TEST_TIMEOUT, async {
        let h = Harness::new(HandlerRegistry::with_builtins(), worker_config(2)).await;
        h.start().await;

        let id = h.submit("health_check", "critical", None).await;
        let task = h.wait_for(id, |t| t.status == TaskStatus::Completed).await;
        assert_eq!(task.result, Some(json!({"status": "ok"})));
        assert_eq!(task.progress, 100);
        assert!(task.completed_at.is_some());
        assert!(h.service.cancel(id).await.is_err());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn abandoned_lease_returns_to_queue() {
    timeout(TEST_TIMEOUT, async {
        // No handler for indexing is needed: the task never reaches a live executor.
        let h = Harness::new(HandlerRegistry::new(), worker_config(1)).await;
        let id = h.submit("indexing", "normal", None).await;

        // A worker on another node leases and starts the task, heartbeats once, then dies.
        let leased = h.queue.dequeue("crashed-0").await.unwrap().unwrap();
        assert_eq!(leased.task_id, id);
        h.store.mark_processing(id, "crashed-0").await.unwrap().unwrap();
        h.queue
            .heartbeat(
                &WorkerHeartbeat {
                    worker_id: "crashed-0".into(),
                    node_id: "elsewhere".into(),
                    started_at: Utc::now(),
                    last_heartbeat: Utc::now(),
                    current_task: Some(id),
                    processed: 0,
                },
                Duration::from_millis(100),
            )
            .await
            .unwrap();

        // While the heartbeat is fresh the lease stands.
        assert_eq!(h.coordinator.reap().await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!h.queue.is_alive("crashed-0").await.unwrap());
        assert_eq!(h.coordinator.reap().await.unwrap(), 1);

        let task = h.store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.worker_id.is_none());
        assert_eq!(h.queue.position(id, TaskPriority::Normal).await.unwrap(), Some(1));
    })
    .await
    .expect("test timed out");
}
