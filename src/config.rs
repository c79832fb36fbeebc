//! Configuration types.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::tasks::model::{TaskPriority, TaskType};

/// Full service configuration.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub server: ServerConfig,
    /// Path of the libSQL database file.
    pub db_path: String,
    /// Redis URL for the shared queue store. `None` selects the in-memory backend.
    pub redis_url: Option<SecretString>,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    pub tasks: TaskDefaults,
    pub fanout: FanoutConfig,
    /// Directory for rolling log files (stderr only when unset).
    pub log_dir: Option<String>,
}

/// HTTP listener settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Queue manager settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Prefix for every key in the queue store.
    pub key_prefix: String,
    /// Maximum entries per priority tier.
    pub max_queue_length: u64,
    /// How often the delayed set is checked for due entries.
    pub promote_interval: Duration,
    /// How long a blocking dequeue waits before giving up.
    pub dequeue_timeout: Duration,
    /// Re-check interval for blocking dequeue when no local wakeup arrives.
    pub dequeue_poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            key_prefix: "taskq".to_string(),
            max_queue_length: 10_000,
            promote_interval: Duration::from_secs(1),
            dequeue_timeout: Duration::from_secs(2),
            dequeue_poll_interval: Duration::from_millis(100),
        }
    }
}

/// Worker coordinator settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of executors in this process.
    pub workers: usize,
    /// Identity of this process; executor ids are `{node_id}-{n}`.
    pub node_id: String,
    /// Per-type concurrency ceilings.
    pub type_limits: HashMap<TaskType, usize>,
    pub heartbeat_interval: Duration,
    /// Liveness record TTL. Must exceed `heartbeat_interval`.
    pub heartbeat_ttl: Duration,
    /// Extra time past a task's own timeout before its lease counts as expired.
    pub lease_grace: Duration,
    pub reaper_interval: Duration,
    /// Schedule a delayed retry automatically after a failure.
    pub auto_retry: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            node_id: format!("node-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
            type_limits: HashMap::new(),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_ttl: Duration::from_secs(15),
            lease_grace: Duration::from_secs(30),
            reaper_interval: Duration::from_secs(10),
            auto_retry: true,
        }
    }
}

/// Exponential backoff bounds.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
        }
    }
}

/// Defaults and limits applied to submitted tasks.
#[derive(Debug, Clone)]
pub struct TaskDefaults {
    pub default_priority: TaskPriority,
    pub default_max_retries: u32,
    pub max_retries_limit: u32,
    pub default_timeout: Duration,
    pub max_timeout: Duration,
    pub max_batch_size: usize,
    /// Rough per-task duration used for `estimated_completion`.
    pub estimated_task_duration: Duration,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            default_priority: TaskPriority::Normal,
            default_max_retries: 3,
            max_retries_limit: 10,
            default_timeout: Duration::from_secs(300),
            max_timeout: Duration::from_secs(3600),
            max_batch_size: 100,
            estimated_task_duration: Duration::from_secs(30),
        }
    }
}

/// Status fan-out settings.
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Diff-poll interval against the task store.
    pub poll_interval: Duration,
    /// Bounded outbound buffer per subscriber.
    pub subscriber_buffer: usize,
    /// Push-stream keep-alive ping interval.
    pub keepalive_interval: Duration,
    /// Upper bound for caller-supplied long-poll timeouts.
    pub long_poll_max: Duration,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            subscriber_buffer: 64,
            keepalive_interval: Duration::from_secs(30),
            long_poll_max: Duration::from_secs(60),
        }
    }
}

impl AppConfig {
    /// Build configuration from `TASKQ_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self {
            db_path: "./data/taskq.db".to_string(),
            ..Self::default()
        };

        if let Ok(host) = std::env::var("TASKQ_HOST") {
            config.server.host = host;
        }
        config.server.port = env_or("TASKQ_PORT", config.server.port)?;
        if let Ok(path) = std::env::var("TASKQ_DB_PATH") {
            config.db_path = path;
        }
        config.redis_url = std::env::var("TASKQ_REDIS_URL")
            .ok()
            .filter(|s| !s.is_empty())
            .map(SecretString::from);
        config.log_dir = std::env::var("TASKQ_LOG_DIR").ok().filter(|s| !s.is_empty());

        let queue = &mut config.queue;
        if let Ok(prefix) = std::env::var("TASKQ_KEY_PREFIX") {
            queue.key_prefix = prefix;
        }
        queue.max_queue_length = env_or("TASKQ_MAX_QUEUE_LENGTH", queue.max_queue_length)?;
        queue.promote_interval = env_millis("TASKQ_PROMOTE_INTERVAL_MS", queue.promote_interval)?;
        queue.dequeue_timeout = env_millis("TASKQ_DEQUEUE_TIMEOUT_MS", queue.dequeue_timeout)?;
        queue.dequeue_poll_interval =
            env_millis("TASKQ_DEQUEUE_POLL_MS", queue.dequeue_poll_interval)?;

        let worker = &mut config.worker;
        worker.workers = env_or("TASKQ_WORKERS", worker.workers)?;
        if let Ok(node_id) = std::env::var("TASKQ_NODE_ID") {
            worker.node_id = node_id;
        }
        if let Ok(limits) = std::env::var("TASKQ_TYPE_LIMITS") {
            worker.type_limits = parse_type_limits(&limits)?;
        }
        worker.heartbeat_interval =
            env_secs("TASKQ_HEARTBEAT_INTERVAL_SECS", worker.heartbeat_interval)?;
        worker.heartbeat_ttl = env_secs("TASKQ_HEARTBEAT_TTL_SECS", worker.heartbeat_ttl)?;
        worker.lease_grace = env_secs("TASKQ_LEASE_GRACE_SECS", worker.lease_grace)?;
        worker.reaper_interval = env_secs("TASKQ_REAPER_INTERVAL_SECS", worker.reaper_interval)?;
        worker.auto_retry = env_or("TASKQ_AUTO_RETRY", worker.auto_retry)?;
        if worker.heartbeat_ttl <= worker.heartbeat_interval {
            return Err(ConfigError::InvalidValue {
                key: "TASKQ_HEARTBEAT_TTL_SECS".to_string(),
                message: "must be greater than the heartbeat interval".to_string(),
            });
        }

        config.retry.base = env_millis("TASKQ_RETRY_BASE_MS", config.retry.base)?;
        config.retry.max_backoff =
            env_secs("TASKQ_RETRY_MAX_BACKOFF_SECS", config.retry.max_backoff)?;

        let tasks = &mut config.tasks;
        tasks.default_priority = env_or("TASKQ_DEFAULT_PRIORITY", tasks.default_priority)?;
        tasks.default_max_retries = env_or("TASKQ_DEFAULT_MAX_RETRIES", tasks.default_max_retries)?;
        tasks.max_retries_limit = env_or("TASKQ_MAX_RETRIES_LIMIT", tasks.max_retries_limit)?;
        tasks.default_timeout = env_secs("TASKQ_DEFAULT_TIMEOUT_SECS", tasks.default_timeout)?;
        tasks.max_timeout = env_secs("TASKQ_MAX_TIMEOUT_SECS", tasks.max_timeout)?;
        tasks.max_batch_size = env_or("TASKQ_MAX_BATCH_SIZE", tasks.max_batch_size)?;
        tasks.estimated_task_duration =
            env_secs("TASKQ_ESTIMATED_TASK_SECS", tasks.estimated_task_duration)?;

        let fanout = &mut config.fanout;
        fanout.poll_interval = env_millis("TASKQ_FANOUT_INTERVAL_MS", fanout.poll_interval)?;
        fanout.subscriber_buffer = env_or("TASKQ_SUBSCRIBER_BUFFER", fanout.subscriber_buffer)?;
        fanout.keepalive_interval = env_secs("TASKQ_KEEPALIVE_SECS", fanout.keepalive_interval)?;
        fanout.long_poll_max = env_secs("TASKQ_LONG_POLL_MAX_SECS", fanout.long_poll_max)?;

        Ok(config)
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
        }
        _ => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_or(key, default.as_secs()).map(Duration::from_secs)
}

fn env_millis(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_or(key, default.as_millis() as u64).map(Duration::from_millis)
}

/// Parse `embedding_generation=2,indexing=4`.
pub fn parse_type_limits(raw: &str) -> Result<HashMap<TaskType, usize>, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidValue {
        key: "TASKQ_TYPE_LIMITS".to_string(),
        message,
    };

    let mut limits = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (name, limit) = entry
            .split_once('=')
            .ok_or_else(|| invalid(format!("expected type=limit, got '{entry}'")))?;
        let task_type: TaskType = name.trim().parse().map_err(invalid)?;
        let limit: usize = limit
            .trim()
            .parse()
            .map_err(|e| invalid(format!("{name}: {e}")))?;
        if limit == 0 {
            return Err(invalid(format!("{name}: limit must be at least 1")));
        }
        limits.insert(task_type, limit);
    }
    Ok(limits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_type_limits() {
        let limits = parse_type_limits("embedding_generation=2, indexing=4").unwrap();
        assert_eq!(limits[&TaskType::EmbeddingGeneration], 2);
        assert_eq!(limits[&TaskType::Indexing], 4);
    }

    #[test]
    fn rejects_unknown_type_in_limits() {
        assert!(parse_type_limits("teleportation=1").is_err());
        assert!(parse_type_limits("indexing=0").is_err());
        assert!(parse_type_limits("indexing").is_err());
    }

    #[test]
    fn defaults_are_consistent() {
        let worker = WorkerConfig::default();
        assert!(worker.heartbeat_ttl > worker.heartbeat_interval);
        assert!(worker.node_id.starts_with("node-"));
        let tasks = TaskDefaults::default();
        assert!(tasks.default_timeout <= tasks.max_timeout);
        assert!(tasks.default_max_retries <= tasks.max_retries_limit);
    }
}
