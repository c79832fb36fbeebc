//! HTTP surface — REST, long poll, WebSocket push stream and SSE watch.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
        ws::WebSocketUpgrade,
    },
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::StreamExt;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

use super::service::TaskService;
use super::types::*;
use crate::error::ApiError;
use crate::fanout::{self, WatchTarget};

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!(error = %self, "Request failed");
        }
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

/// Build the full router.
pub fn router(service: Arc<TaskService>) -> Router {
    Router::new()
        .route("/tasks", post(submit_task).get(list_tasks))
        .route("/tasks/batch", post(submit_batch))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/cancel", post(cancel_task))
        .route("/tasks/{id}/retry", post(retry_task))
        .route("/tasks/{id}/watch", get(watch_task))
        .route("/batches/{id}/watch", get(watch_batch))
        .route("/polling/status", get(poll_status))
        .route("/ws/status", get(ws_handler))
        .route("/stats/tasks", get(task_stats))
        .route("/stats/system", get(system_stats))
        .route("/queues/info", get(queue_info))
        .route("/queues/{priority}/drain", post(drain_queue))
        .route("/health", get(health))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(service)
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|e| ApiError::InvalidArgument(format!("invalid task id '{raw}': {e}")))
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(v)| v)
        .map_err(|e| ApiError::InvalidArgument(e.body_text()))
}

fn query<T>(query: Result<Query<T>, QueryRejection>) -> Result<T, ApiError> {
    query
        .map(|Query(v)| v)
        .map_err(|e| ApiError::InvalidArgument(e.body_text()))
}

// ── Tasks ───────────────────────────────────────────────────────────

async fn submit_task(
    State(service): State<Arc<TaskService>>,
    body: Result<Json<SubmitTaskRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitTaskResponse>), ApiError> {
    let resp = service.submit(json_body(body)?).await?;
    Ok((StatusCode::CREATED, Json(resp)))
}

async fn submit_batch(
    State(service): State<Arc<TaskService>>,
    body: Result<Json<BatchSubmitRequest>, JsonRejection>,
) -> Result<Json<BatchSubmitResponse>, ApiError> {
    Ok(Json(service.submit_batch(json_body(body)?).await?))
}

async fn list_tasks(
    State(service): State<Arc<TaskService>>,
    params: Result<Query<ListTasksQuery>, QueryRejection>,
) -> Result<Json<ListTasksResponse>, ApiError> {
    Ok(Json(service.list(query(params)?).await?))
}

async fn get_task(
    State(service): State<Arc<TaskService>>,
    Path(id): Path<String>,
) -> Result<Json<TaskView>, ApiError> {
    Ok(Json(service.get(parse_id(&id)?).await?))
}

async fn cancel_task(
    State(service): State<Arc<TaskService>>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    Ok(Json(service.cancel(parse_id(&id)?).await?))
}

async fn retry_task(
    State(service): State<Arc<TaskService>>,
    Path(id): Path<String>,
) -> Result<Json<RetryResponse>, ApiError> {
    Ok(Json(service.retry(parse_id(&id)?).await?))
}

// ── Status fan-out ──────────────────────────────────────────────────

async fn watch_task(
    State(service): State<Arc<TaskService>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    watch(service, WatchTarget::Task(parse_id(&id)?)).await
}

async fn watch_batch(
    State(service): State<Arc<TaskService>>,
    Path(batch_id): Path<String>,
) -> Result<Response, ApiError> {
    watch(service, WatchTarget::Batch(batch_id)).await
}

async fn watch(service: Arc<TaskService>, target: WatchTarget) -> Result<Response, ApiError> {
    let keepalive = service.hub().config().keepalive_interval;
    let updates = service.watch(target).await?;
    let events = updates.map(|update| Event::default().event("status_update").json_data(update));
    Ok(Sse::new(events)
        .keep_alive(KeepAlive::new().interval(keepalive))
        .into_response())
}

async fn poll_status(
    State(service): State<Arc<TaskService>>,
    params: Result<Query<PollQuery>, QueryRejection>,
) -> Result<Json<fanout::PollResponse>, ApiError> {
    Ok(Json(service.long_poll(query(params)?).await?))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(service): State<Arc<TaskService>>,
) -> impl IntoResponse {
    info!("Status stream client connecting");
    let hub = service.hub().clone();
    ws.on_upgrade(move |socket| fanout::serve_socket(socket, hub))
}

// ── Stats & administration ──────────────────────────────────────────

async fn task_stats(
    State(service): State<Arc<TaskService>>,
    params: Result<Query<TaskStatsQuery>, QueryRejection>,
) -> Result<Json<TaskStats>, ApiError> {
    Ok(Json(service.stats_tasks(query(params)?).await?))
}

async fn system_stats(
    State(service): State<Arc<TaskService>>,
) -> Result<Json<SystemStats>, ApiError> {
    Ok(Json(service.stats_system().await?))
}

async fn queue_info(
    State(service): State<Arc<TaskService>>,
    params: Result<Query<QueueInfoQuery>, QueryRejection>,
) -> Result<Json<QueueInfoResponse>, ApiError> {
    Ok(Json(service.queue_info(query(params)?).await?))
}

async fn drain_queue(
    State(service): State<Arc<TaskService>>,
    Path(priority): Path<String>,
) -> Result<Json<DrainResponse>, ApiError> {
    Ok(Json(service.drain(&priority).await?))
}

async fn health(State(service): State<Arc<TaskService>>) -> (StatusCode, Json<HealthResponse>) {
    let health = service.health().await;
    let status = if health.status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}
