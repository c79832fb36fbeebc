//! libSQL backend — async `TaskStore` implementation.
//!
//! Supports local file and in-memory databases. Status transitions are single
//! `UPDATE ... WHERE <precondition> RETURNING` statements so concurrent writers
//! (API cancel vs. worker completion, two reapers) resolve to exactly one winner.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{TaskCount, TaskStore};
use crate::tasks::{
    ListOptions, Payload, SortOrder, Task, TaskFilter, TaskPriority, TaskStatus, TaskType,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Task database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run a single-row `... RETURNING {TASK_COLUMNS}` statement.
    async fn query_one(
        &self,
        op: &str,
        sql: &str,
        args: impl libsql::params::IntoParams,
    ) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, args)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("{op} row: {e}"))),
        }
    }

    async fn query_many(
        &self,
        op: &str,
        sql: &str,
        args: impl libsql::params::IntoParams,
    ) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, args)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut tasks = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => tasks.push(row_to_task(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{op} row: {e}"))),
            }
        }
        Ok(tasks)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339 so lexicographic order in SQL matches time order.
pub(crate) fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.filter(|s| !s.is_empty()).map(|s| parse_datetime(&s))
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Build `WHERE ...` and its positional arguments from a filter.
fn filter_clause(filter: &TaskFilter) -> (String, Vec<libsql::Value>) {
    let mut clauses = Vec::new();
    let mut args = Vec::new();

    if let Some(ref partition_id) = filter.partition_id {
        args.push(libsql::Value::Text(partition_id.clone()));
        clauses.push(format!("partition_id = ?{}", args.len()));
    }
    if let Some(ref batch_id) = filter.batch_id {
        args.push(libsql::Value::Text(batch_id.clone()));
        clauses.push(format!("batch_id = ?{}", args.len()));
    }
    if let Some(status) = filter.status {
        args.push(libsql::Value::Text(status.as_str().to_string()));
        clauses.push(format!("status = ?{}", args.len()));
    }
    if let Some(task_type) = filter.task_type {
        args.push(libsql::Value::Text(task_type.as_str().to_string()));
        clauses.push(format!("task_type = ?{}", args.len()));
    }
    if let Some(priority) = filter.priority {
        args.push(libsql::Value::Integer(priority.rank()));
        clauses.push(format!("priority = ?{}", args.len()));
    }

    if clauses.is_empty() {
        (String::new(), args)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), args)
    }
}

/// Map a libsql Row to a Task.
///
/// Column order matches TASK_COLUMNS.
fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let id_str: String = row.get(0).map_err(|e| DatabaseError::Query(format!("task.id: {e}")))?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("task.id parse: {e}")))?;

    let type_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("task.task_type: {e}")))?;
    let task_type: TaskType = type_str.parse().map_err(DatabaseError::Serialization)?;

    let status_str: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("task.status: {e}")))?;
    let status: TaskStatus = status_str.parse().map_err(DatabaseError::Serialization)?;

    let priority = TaskPriority::from_rank(row.get::<i64>(3).unwrap_or(1));
    let partition_id: String = row.get(4).unwrap_or_default();
    let batch_id: Option<String> = row.get::<String>(5).ok();

    let payload_str: String = row.get(6).unwrap_or_else(|_| "{}".to_string());
    let payload: Payload = serde_json::from_str(&payload_str)
        .map_err(|e| DatabaseError::Serialization(format!("task.payload: {e}")))?;

    let result = row
        .get::<String>(7)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok());

    let created_str: String = row.get(14).unwrap_or_default();
    let updated_str: String = row.get(15).unwrap_or_default();
    let scheduled_str: String = row.get(18).unwrap_or_default();

    Ok(Task {
        id,
        task_type,
        status,
        priority,
        partition_id,
        batch_id,
        payload,
        result,
        progress: row.get::<i64>(8).unwrap_or(0).clamp(0, 100) as u8,
        retry_count: row.get::<i64>(9).unwrap_or(0).max(0) as u32,
        max_retries: row.get::<i64>(10).unwrap_or(0).max(0) as u32,
        timeout_secs: row.get::<i64>(11).unwrap_or(0).max(0) as u64,
        worker_id: row.get::<String>(12).ok().filter(|s| !s.is_empty()),
        error_message: row.get::<String>(13).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
        started_at: parse_optional_datetime(row.get::<String>(16).ok()),
        completed_at: parse_optional_datetime(row.get::<String>(17).ok()),
        scheduled_for: parse_datetime(&scheduled_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

const TASK_COLUMNS: &str = "id, task_type, status, priority, partition_id, batch_id, payload, result, progress, retry_count, max_retries, timeout_secs, worker_id, error_message, created_at, updated_at, started_at, completed_at, scheduled_for";

#[async_trait]
impl TaskStore for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn ping(&self) -> Result<(), DatabaseError> {
        self.conn()
            .query("SELECT 1", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("ping: {e}")))?;
        Ok(())
    }

    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let payload = serde_json::to_string(&task.payload)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let result = match task.result {
            Some(ref v) => Some(
                serde_json::to_string(v)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
            ),
            None => None,
        };

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"
                ),
                params![
                    task.id.to_string(),
                    task.task_type.as_str(),
                    task.status.as_str(),
                    task.priority.rank(),
                    task.partition_id.as_str(),
                    opt_text(task.batch_id.as_deref()),
                    payload,
                    result,
                    task.progress as i64,
                    task.retry_count as i64,
                    task.max_retries as i64,
                    task.timeout_secs as i64,
                    opt_text(task.worker_id.as_deref()),
                    opt_text(task.error_message.as_deref()),
                    fmt_ts(task.created_at),
                    fmt_ts(task.updated_at),
                    task.started_at.map(fmt_ts),
                    task.completed_at.map(fmt_ts),
                    fmt_ts(task.scheduled_for),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_task: {e}")))?;

        debug!(task_id = %task.id, task_type = %task.task_type, "Task inserted");
        Ok(())
    }

    async fn delete_task(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute("DELETE FROM tasks WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_task: {e}")))?;
        Ok(count > 0)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        self.query_one(
            "get_task",
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![id.to_string()],
        )
        .await
    }

    async fn list_tasks(
        &self,
        filter: &TaskFilter,
        options: &ListOptions,
    ) -> Result<(Vec<Task>, u64), DatabaseError> {
        let (where_clause, args) = filter_clause(filter);

        let mut rows = self
            .conn()
            .query(
                &format!("SELECT COUNT(*) FROM tasks{where_clause}"),
                libsql::params::Params::Positional(args.clone()),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks count: {e}")))?;
        let total = match rows.next().await {
            Ok(Some(row)) => row.get::<i64>(0).unwrap_or(0).max(0) as u64,
            Ok(None) => 0,
            Err(e) => return Err(DatabaseError::Query(format!("list_tasks count row: {e}"))),
        };

        let direction = match options.order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        let mut page_args = args;
        page_args.push(libsql::Value::Integer(options.limit as i64));
        page_args.push(libsql::Value::Integer(options.offset as i64));
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks{where_clause} ORDER BY {} {direction}, id {direction} LIMIT ?{} OFFSET ?{}",
            options.sort_by.column(),
            page_args.len() - 1,
            page_args.len(),
        );

        let tasks = self
            .query_many("list_tasks", &sql, libsql::params::Params::Positional(page_args))
            .await?;
        Ok((tasks, total))
    }

    async fn list_updated_since(
        &self,
        since: DateTime<Utc>,
        after: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<Task>, DatabaseError> {
        // Every id sorts after '', so no `after` means `updated_at >= since`.
        let after = after.map(|id| id.to_string()).unwrap_or_default();
        self.query_many(
            "list_updated_since",
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks \
                 WHERE updated_at > ?1 OR (updated_at = ?1 AND id > ?2) \
                 ORDER BY updated_at ASC, id ASC LIMIT ?3"
            ),
            params![fmt_ts(since), after, limit as i64],
        )
        .await
    }

    async fn task_counts(&self, filter: &TaskFilter) -> Result<Vec<TaskCount>, DatabaseError> {
        let (where_clause, args) = filter_clause(filter);
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT status, task_type, priority, COUNT(*) FROM tasks{where_clause} GROUP BY status, task_type, priority"
                ),
                libsql::params::Params::Positional(args),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("task_counts: {e}")))?;

        let mut counts = Vec::new();
        loop {
            let row = match rows.next().await {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("task_counts row: {e}"))),
            };
            let status: String = row.get(0).unwrap_or_default();
            let task_type: String = row.get(1).unwrap_or_default();
            let (Ok(status), Ok(task_type)) = (status.parse(), task_type.parse()) else {
                tracing::warn!("Skipping unparsable task count row");
                continue;
            };
            counts.push(TaskCount {
                status,
                task_type,
                priority: TaskPriority::from_rank(row.get::<i64>(2).unwrap_or(1)),
                count: row.get::<i64>(3).unwrap_or(0).max(0) as u64,
            });
        }
        Ok(counts)
    }

    async fn mark_processing(
        &self,
        id: Uuid,
        worker_id: &str,
    ) -> Result<Option<Task>, DatabaseError> {
        let now = fmt_ts(Utc::now());
        self.query_one(
            "mark_processing",
            &format!(
                "UPDATE tasks SET status = 'processing', worker_id = ?1, progress = 0, started_at = ?2, updated_at = ?2 \
                 WHERE id = ?3 AND status = 'queued' RETURNING {TASK_COLUMNS}"
            ),
            params![worker_id, now, id.to_string()],
        )
        .await
    }

    async fn update_progress(
        &self,
        id: Uuid,
        worker_id: &str,
        progress: u8,
        message: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let now = fmt_ts(Utc::now());
        let count = self
            .conn()
            .execute(
                "UPDATE tasks SET progress = MAX(progress, ?1), error_message = COALESCE(?2, error_message), updated_at = ?3 \
                 WHERE id = ?4 AND status = 'processing' AND worker_id = ?5",
                params![
                    progress.min(100) as i64,
                    opt_text(message),
                    now,
                    id.to_string(),
                    worker_id
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_progress: {e}")))?;
        Ok(count > 0)
    }

    async fn complete_task(
        &self,
        id: Uuid,
        worker_id: &str,
        result: &serde_json::Value,
    ) -> Result<Option<Task>, DatabaseError> {
        let result = serde_json::to_string(result)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let now = fmt_ts(Utc::now());
        self.query_one(
            "complete_task",
            &format!(
                "UPDATE tasks SET status = 'completed', progress = 100, result = ?1, completed_at = ?2, updated_at = ?2 \
                 WHERE id = ?3 AND status = 'processing' AND worker_id = ?4 RETURNING {TASK_COLUMNS}"
            ),
            params![result, now, id.to_string(), worker_id],
        )
        .await
    }

    async fn fail_task(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
    ) -> Result<Option<Task>, DatabaseError> {
        let now = fmt_ts(Utc::now());
        self.query_one(
            "fail_task",
            &format!(
                "UPDATE tasks SET status = 'failed', error_message = ?1, completed_at = ?2, updated_at = ?2 \
                 WHERE id = ?3 AND status = 'processing' AND worker_id = ?4 RETURNING {TASK_COLUMNS}"
            ),
            params![error, now, id.to_string(), worker_id],
        )
        .await
    }

    async fn cancel_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let now = fmt_ts(Utc::now());
        self.query_one(
            "cancel_task",
            &format!(
                "UPDATE tasks SET status = 'canceled', completed_at = ?1, updated_at = ?1 \
                 WHERE id = ?2 AND status IN ('queued', 'processing') RETURNING {TASK_COLUMNS}"
            ),
            params![now, id.to_string()],
        )
        .await
    }

    async fn retry_task(
        &self,
        id: Uuid,
        scheduled_for: DateTime<Utc>,
    ) -> Result<Option<Task>, DatabaseError> {
        let now = fmt_ts(Utc::now());
        self.query_one(
            "retry_task",
            &format!(
                "UPDATE tasks SET status = 'queued', retry_count = retry_count + 1, progress = 0, \
                 started_at = NULL, completed_at = NULL, error_message = NULL, worker_id = NULL, result = NULL, \
                 scheduled_for = ?1, updated_at = ?2 \
                 WHERE id = ?3 AND status = 'failed' AND retry_count < max_retries RETURNING {TASK_COLUMNS}"
            ),
            params![fmt_ts(scheduled_for), now, id.to_string()],
        )
        .await
    }

    async fn requeue_task(
        &self,
        id: Uuid,
        worker_id: &str,
    ) -> Result<Option<Task>, DatabaseError> {
        let now = fmt_ts(Utc::now());
        self.query_one(
            "requeue_task",
            &format!(
                "UPDATE tasks SET status = 'queued', worker_id = NULL, progress = 0, started_at = NULL, \
                 scheduled_for = ?1, updated_at = ?1 \
                 WHERE id = ?2 AND status = 'processing' AND worker_id = ?3 RETURNING {TASK_COLUMNS}"
            ),
            params![now, id.to_string(), worker_id],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_task(partition: &str) -> Task {
        let mut payload = Payload::new();
        payload.insert("file".into(), serde_json::json!("a.pdf"));
        Task::new(TaskType::DocumentProcessing, partition)
            .with_priority(TaskPriority::High)
            .with_payload(payload)
            .with_max_retries(1)
    }

    #[tokio::test]
    async fn insert_and_get_round_trip() {
        let db = test_db().await;
        let task = make_task("kb-1");
        db.insert_task(&task).await.unwrap();

        let fetched = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.task_type, TaskType::DocumentProcessing);
        assert_eq!(fetched.priority, TaskPriority::High);
        assert_eq!(fetched.payload, task.payload);
        assert_eq!(fetched.status, TaskStatus::Queued);
        assert!(fetched.started_at.is_none());
        assert!(fetched.worker_id.is_none());
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let db = test_db().await;
        assert!(db.get_task(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_rolls_back_insert() {
        let db = test_db().await;
        let task = make_task("kb-1");
        db.insert_task(&task).await.unwrap();
        assert!(db.delete_task(task.id).await.unwrap());
        assert!(db.get_task(task.id).await.unwrap().is_none());
        assert!(!db.delete_task(task.id).await.unwrap());
    }

    #[tokio::test]
    async fn processing_lifecycle() {
        let db = test_db().await;
        let task = make_task("kb-1");
        db.insert_task(&task).await.unwrap();

        let running = db.mark_processing(task.id, "w-1").await.unwrap().unwrap();
        assert_eq!(running.status, TaskStatus::Processing);
        assert_eq!(running.worker_id.as_deref(), Some("w-1"));
        assert!(running.started_at.is_some());

        // A second lease attempt must not win.
        assert!(db.mark_processing(task.id, "w-2").await.unwrap().is_none());

        assert!(db.update_progress(task.id, "w-1", 40, Some("parsing")).await.unwrap());
        // Progress never goes backwards.
        assert!(db.update_progress(task.id, "w-1", 10, None).await.unwrap());
        let mid = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(mid.progress, 40);
        assert_eq!(mid.error_message.as_deref(), Some("parsing"));

        // Stale worker is rejected.
        assert!(!db.update_progress(task.id, "w-2", 90, None).await.unwrap());
        assert!(
            db.complete_task(task.id, "w-2", &serde_json::json!({}))
                .await
                .unwrap()
                .is_none()
        );

        let done = db
            .complete_task(task.id, "w-1", &serde_json::json!({"chunks": 3}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.progress, 100);
        assert_eq!(done.result, Some(serde_json::json!({"chunks": 3})));
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn cancel_only_from_active_states() {
        let db = test_db().await;
        let task = make_task("kb-1");
        db.insert_task(&task).await.unwrap();

        let canceled = db.cancel_task(task.id).await.unwrap().unwrap();
        assert_eq!(canceled.status, TaskStatus::Canceled);
        assert!(canceled.completed_at.is_some());
        assert!(db.cancel_task(task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_beats_late_completion() {
        let db = test_db().await;
        let task = make_task("kb-1");
        db.insert_task(&task).await.unwrap();
        db.mark_processing(task.id, "w-1").await.unwrap().unwrap();

        db.cancel_task(task.id).await.unwrap().unwrap();
        let late = db
            .complete_task(task.id, "w-1", &serde_json::json!({"ok": true}))
            .await
            .unwrap();
        assert!(late.is_none());
        let fetched = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::Canceled);
    }

    #[tokio::test]
    async fn retry_respects_bound_and_resets_attempt() {
        let db = test_db().await;
        let task = make_task("kb-1");
        db.insert_task(&task).await.unwrap();

        db.mark_processing(task.id, "w-1").await.unwrap().unwrap();
        db.update_progress(task.id, "w-1", 55, None).await.unwrap();
        db.fail_task(task.id, "w-1", "boom").await.unwrap().unwrap();

        let retried = db.retry_task(task.id, Utc::now()).await.unwrap().unwrap();
        assert_eq!(retried.status, TaskStatus::Queued);
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.progress, 0);
        assert!(retried.error_message.is_none());
        assert!(retried.worker_id.is_none());
        assert!(retried.started_at.is_none());
        assert!(retried.completed_at.is_none());

        db.mark_processing(task.id, "w-1").await.unwrap().unwrap();
        db.fail_task(task.id, "w-1", "boom again").await.unwrap().unwrap();
        assert!(db.retry_task(task.id, Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn requeue_requires_matching_worker() {
        let db = test_db().await;
        let task = make_task("kb-1");
        db.insert_task(&task).await.unwrap();
        db.mark_processing(task.id, "w-1").await.unwrap().unwrap();

        assert!(db.requeue_task(task.id, "w-2").await.unwrap().is_none());
        let requeued = db.requeue_task(task.id, "w-1").await.unwrap().unwrap();
        assert_eq!(requeued.status, TaskStatus::Queued);
        assert!(requeued.worker_id.is_none());
        assert!(requeued.started_at.is_none());
    }

    #[tokio::test]
    async fn list_filters_sorts_and_paginates() {
        let db = test_db().await;
        for i in 0..5 {
            let mut task = make_task(if i % 2 == 0 { "kb-a" } else { "kb-b" });
            task.created_at = Utc::now() + chrono::Duration::milliseconds(i);
            if i == 4 {
                task.priority = TaskPriority::Critical;
            }
            db.insert_task(&task).await.unwrap();
        }

        let filter = TaskFilter {
            partition_id: Some("kb-a".into()),
            ..Default::default()
        };
        let (page, total) = db
            .list_tasks(
                &filter,
                &ListOptions {
                    limit: 2,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(total, 3);
        assert_eq!(page.len(), 2);
        assert!(page[0].created_at >= page[1].created_at);

        let (by_priority, _) = db
            .list_tasks(
                &TaskFilter::default(),
                &ListOptions {
                    sort_by: crate::tasks::SortField::Priority,
                    order: SortOrder::Desc,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(by_priority[0].priority, TaskPriority::Critical);
    }

    #[tokio::test]
    async fn updated_since_sees_new_writes() {
        let db = test_db().await;
        let task = make_task("kb-1");
        db.insert_task(&task).await.unwrap();

        let mark = Utc::now();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(db.list_updated_since(mark, None, 100).await.unwrap().is_empty());

        db.cancel_task(task.id).await.unwrap();
        let changed = db.list_updated_since(mark, None, 100).await.unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].status, TaskStatus::Canceled);
    }

    #[tokio::test]
    async fn updated_since_pages_through_equal_timestamps() {
        let db = test_db().await;
        let stamp = crate::tasks::now();
        for _ in 0..5 {
            let mut task = make_task("kb-1");
            task.updated_at = stamp;
            db.insert_task(&task).await.unwrap();
        }

        let mut seen = Vec::new();
        let mut cursor = (stamp, None);
        loop {
            let page = db.list_updated_since(cursor.0, cursor.1, 2).await.unwrap();
            if let Some(last) = page.last() {
                cursor = (last.updated_at, Some(last.id));
            }
            let done = page.len() < 2;
            seen.extend(page.into_iter().map(|t| t.id));
            if done {
                break;
            }
        }
        assert_eq!(seen.len(), 5);
        let mut unique = seen.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 5);
    }

    #[tokio::test]
    async fn timestamps_survive_the_store_unchanged() {
        let db = test_db().await;
        let task = make_task("kb-1");
        db.insert_task(&task).await.unwrap();
        let stored = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.created_at, task.created_at);
        assert_eq!(stored.updated_at, task.updated_at);
    }

    #[tokio::test]
    async fn counts_group_by_status_and_type() {
        let db = test_db().await;
        let a = make_task("kb-1");
        let b = make_task("kb-1");
        let c = make_task("kb-2");
        for t in [&a, &b, &c] {
            db.insert_task(t).await.unwrap();
        }
        db.cancel_task(b.id).await.unwrap();

        let counts = db
            .task_counts(&TaskFilter {
                partition_id: Some("kb-1".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let total: u64 = counts.iter().map(|c| c.count).sum();
        assert_eq!(total, 2);
        assert!(
            counts
                .iter()
                .any(|c| c.status == TaskStatus::Canceled && c.count == 1)
        );
    }

    #[tokio::test]
    async fn file_database_creates_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("taskq.db");
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        db.ping().await.unwrap();
        assert!(path.exists());
    }
}
