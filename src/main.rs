use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use taskq::api::{self, TaskService};
use taskq::config::AppConfig;
use taskq::fanout::StatusHub;
use taskq::queue::{MemoryBackend, QueueBackend, QueueManager, RedisBackend};
use taskq::store::{LibSqlBackend, TaskStore};
use taskq::worker::{CoordinatorDeps, HandlerRegistry, RetryPolicy, WorkerCoordinator};

/// Stderr logging, plus a daily-rolling file when a log directory is configured.
fn init_tracing(log_dir: Option<&str>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer().with_target(false);

    match log_dir {
        Some(dir) => {
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "taskq.log"));
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(
                    fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("Invalid configuration")?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("taskq v{}", env!("CARGO_PKG_VERSION"));

    // ── Record store ────────────────────────────────────────────────────
    let store: Arc<dyn TaskStore> = if config.db_path == ":memory:" {
        Arc::new(LibSqlBackend::new_memory().await?)
    } else {
        Arc::new(
            LibSqlBackend::new_local(Path::new(&config.db_path))
                .await
                .with_context(|| format!("Failed to open database at {}", config.db_path))?,
        )
    };
    eprintln!("   Database: {}", config.db_path);

    // ── Queue store ─────────────────────────────────────────────────────
    let backend: Arc<dyn QueueBackend> = match &config.redis_url {
        Some(url) => Arc::new(
            RedisBackend::new(url)
                .await
                .context("Failed to connect to Redis")?,
        ),
        None => {
            tracing::warn!("TASKQ_REDIS_URL not set, using the in-memory queue (single process only)");
            Arc::new(MemoryBackend::new())
        }
    };
    eprintln!(
        "   Queue: {}",
        if config.redis_url.is_some() { "redis" } else { "memory" }
    );
    let queue = QueueManager::new(backend, config.queue.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    // ── Fan-out ─────────────────────────────────────────────────────────
    let hub = StatusHub::new(store.clone(), config.fanout.clone());
    handles.push(hub.clone().spawn_ticker(shutdown_rx.clone()));
    handles.push(queue.clone().spawn_promoter(shutdown_rx.clone()));

    // ── Workers ─────────────────────────────────────────────────────────
    let handlers = Arc::new(HandlerRegistry::with_builtins());
    let coordinator = WorkerCoordinator::new(CoordinatorDeps {
        store: store.clone(),
        queue: queue.clone(),
        handlers: handlers.clone(),
        retry: RetryPolicy::new(&config.retry),
        config: config.worker.clone(),
        dequeue_timeout: config.queue.dequeue_timeout,
    });

    let service = TaskService::new(
        store.clone(),
        queue.clone(),
        hub.clone(),
        coordinator.clone(),
        config.tasks.clone(),
    );

    // Recover before executors start leasing.
    let recovered = service
        .recover_on_startup()
        .await
        .context("Startup recovery failed")?;
    if recovered > 0 {
        eprintln!("   Recovered {recovered} queued tasks");
    }

    handles.extend(coordinator.start(shutdown_rx.clone()).await?);
    eprintln!(
        "   Workers: {} on node {} (handlers: {})",
        coordinator.pool_size(),
        coordinator.node_id(),
        handlers
            .task_types()
            .await
            .iter()
            .map(|t| t.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    // ── HTTP ────────────────────────────────────────────────────────────
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    eprintln!("   API: http://{addr}");
    eprintln!("   Push stream: ws://{addr}/ws/status\n");
    tracing::info!(%addr, "taskq listening");

    axum::serve(listener, api::router(service))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown requested");
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("HTTP server failed")?;

    for handle in handles {
        let _ = handle.await;
    }
    tracing::info!("taskq stopped");
    Ok(())
}
