//! HTTP API (axum) implementing the document/task model of spec §6
//! "Inbound API": a document-ingestion endpoint, an explicit
//! graph-construction trigger, an entity-unification trigger, and a
//! streaming progress interface keyed by task id.

use std::convert::Infallible;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::app_state::AppState;
use crate::config::UnificationMode;
use crate::domain::{Document, PropertyMap, Task, TaskStatus};
use crate::errors::{CoreError, ErrorKind};
use crate::pipeline::RagPipelineInput;

type ApiError = (StatusCode, Json<serde_json::Value>);

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/documents/upload", post(upload_document_handler))
        .route("/api/documents/text", post(ingest_text_handler))
        .route("/api/documents/:id", get(get_document_handler))
        .route("/api/documents/:id/graph", post(trigger_graph_handler))
        .route("/api/documents/:id/unify", post(trigger_unification_handler))
        .route("/api/tasks", get(list_tasks_handler))
        .route("/api/tasks/:id", get(get_task_handler))
        .route("/api/tasks/:id/cancel", post(cancel_task_handler))
        .route("/api/tasks/:id/stream", get(stream_task_handler))
        .with_state(state)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
}

#[derive(Serialize)]
struct IngestResponse {
    document: Document,
    task: Task,
}

#[derive(Deserialize)]
struct IngestTextPayload {
    owner_id: i64,
    display_name: String,
    text: String,
    #[serde(default)]
    metadata: PropertyMap,
}

#[derive(Deserialize)]
struct TriggerGraphPayload {
    owner_id: i64,
}

#[derive(Deserialize)]
struct TriggerUnificationPayload {
    owner_id: i64,
    #[serde(default = "default_unification_mode")]
    mode: String,
}

fn default_unification_mode() -> String {
    "incremental".to_string()
}

#[derive(Deserialize)]
struct ListTasksQuery {
    owner_id: i64,
    #[serde(default)]
    offset: usize,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

async fn upload_document_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    let mut owner_id: Option<i64> = None;
    let mut display_name: Option<String> = None;
    let mut content_type = "application/octet-stream".to_string();
    let mut bytes: Option<Vec<u8>> = None;
    let mut metadata = PropertyMap::new();

    while let Some(field) = multipart.next_field().await.map_err(|e| bad_request(e.to_string()))? {
        match field.name().unwrap_or_default().to_string().as_str() {
            "owner_id" => {
                let text = field.text().await.map_err(|e| bad_request(e.to_string()))?;
                owner_id = text.parse().ok();
            }
            "metadata" => {
                let text = field.text().await.map_err(|e| bad_request(e.to_string()))?;
                metadata = serde_json::from_str(&text).map_err(|e| bad_request(format!("invalid metadata JSON: {e}")))?;
            }
            "file" => {
                display_name = field.file_name().map(|s| s.to_string());
                if let Some(ct) = field.content_type() {
                    content_type = ct.to_string();
                }
                let data = field.bytes().await.map_err(|e| bad_request(e.to_string()))?;
                bytes = Some(data.to_vec());
            }
            other => {
                warn!(field = other, "ignoring unrecognized multipart field");
            }
        }
    }

    let owner_id = owner_id.ok_or_else(|| bad_request("owner_id is required".into()))?;
    let display_name = display_name.unwrap_or_else(|| "upload".to_string());
    let bytes = bytes.ok_or_else(|| bad_request("a file field is required".into()))?;

    start_ingest(&state, owner_id, display_name, content_type, bytes, metadata).await.map(|r| (StatusCode::ACCEPTED, Json(r))).map_err(error_response)
}

async fn ingest_text_handler(
    State(state): State<AppState>,
    Json(payload): Json<IngestTextPayload>,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    start_ingest(&state, payload.owner_id, payload.display_name, "text/plain".to_string(), payload.text.into_bytes(), payload.metadata)
        .await
        .map(|r| (StatusCode::ACCEPTED, Json(r)))
        .map_err(error_response)
}

async fn start_ingest(
    state: &AppState,
    owner_id: i64,
    display_name: String,
    content_type: String,
    bytes: Vec<u8>,
    metadata: PropertyMap,
) -> Result<IngestResponse, CoreError> {
    let document_id = state.next_document_id();
    let mut document = Document::new(document_id, owner_id, display_name.clone(), content_type.clone());
    document.metadata = metadata.clone();
    state.metadata_store.create_document(document.clone()).await?;

    let input = RagPipelineInput { document_id, owner_id, display_name, content_type, bytes, metadata };
    let task = state.task_service.start_rag(owner_id, input).await?;
    Ok(IngestResponse { document, task })
}

async fn get_document_handler(Path(id): Path<i64>, State(state): State<AppState>) -> Result<Json<Document>, ApiError> {
    state.metadata_store.get_document(id).await.map_err(error_response)?.map(Json).ok_or_else(|| not_found(format!("document {id} not found")))
}

async fn trigger_graph_handler(
    Path(document_id): Path<i64>,
    State(state): State<AppState>,
    Json(payload): Json<TriggerGraphPayload>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let task = state.task_service.start_graph(payload.owner_id, document_id).await.map_err(error_response)?;
    Ok((StatusCode::ACCEPTED, Json(task)))
}

async fn trigger_unification_handler(
    Path(document_id): Path<i64>,
    State(state): State<AppState>,
    Json(payload): Json<TriggerUnificationPayload>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let mode = UnificationMode::from_str(&payload.mode).map_err(|e| bad_request(e.to_string()))?;
    let task = state.task_service.start_unification(payload.owner_id, Some(document_id), mode).await.map_err(error_response)?;
    Ok((StatusCode::ACCEPTED, Json(task)))
}

async fn list_tasks_handler(Query(q): Query<ListTasksQuery>, State(state): State<AppState>) -> Result<Json<Vec<Task>>, ApiError> {
    let tasks = state.task_service.list_by_owner(q.owner_id, q.offset, q.limit).await.map_err(error_response)?;
    Ok(Json(tasks))
}

async fn get_task_handler(Path(task_id): Path<String>, State(state): State<AppState>) -> Result<Json<Task>, ApiError> {
    state.task_service.get(&task_id).await.map_err(error_response)?.map(Json).ok_or_else(|| not_found(format!("task {task_id} not found")))
}

async fn cancel_task_handler(Path(task_id): Path<String>, State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    if state.task_service.cancel(&task_id) {
        Ok(StatusCode::OK)
    } else {
        Err(not_found(format!("task {task_id} not found or already finished")))
    }
}

/// Streams every update for one task as server-sent events (spec §6 "A
/// streaming progress interface accepts a task id and emits a sequence of
/// task-update events"). Emits the current snapshot first so a client that
/// connects after the task already finished still sees its final state.
async fn stream_task_handler(
    Path(task_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let current = state.task_service.get(&task_id).await.map_err(error_response)?.ok_or_else(|| not_found(format!("task {task_id} not found")))?;

    let receiver = state.task_service.subscribe();
    let filter_id = task_id.clone();
    let snapshot = futures::stream::once(async move { current });
    let live = BroadcastStream::new(receiver).filter_map(|r| async move { r.ok() }).filter(move |task| {
        let keep = task.id == filter_id;
        async move { keep }
    });

    let events = snapshot.chain(live).map(|task| {
        let payload = serde_json::to_string(&task).unwrap_or_else(|_| "{}".to_string());
        Ok::<_, Infallible>(Event::default().event("task_update").data(payload))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn bad_request(message: String) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn not_found(message: String) -> ApiError {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message })))
}

fn error_response(err: CoreError) -> ApiError {
    let status = match err.kind() {
        ErrorKind::InputInvalid => StatusCode::BAD_REQUEST,
        ErrorKind::ExternalTransient => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::ExternalPermanent => StatusCode::BAD_GATEWAY,
        ErrorKind::Logic => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::Capacity => StatusCode::TOO_MANY_REQUESTS,
    };
    (status, Json(json!({ "error": err.to_string() })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DocumentStatus;

    #[tokio::test]
    async fn start_ingest_creates_a_pending_document_and_a_task() {
        let state = AppState::for_tests();
        let result = start_ingest(&state, 1, "notes.txt".into(), "text/plain".into(), b"Grace Hopper wrote COBOL tooling.".to_vec(), PropertyMap::new())
            .await
            .unwrap();

        assert_eq!(result.document.owner_id, 1);
        assert_eq!(result.document.status, DocumentStatus::Pending);
        assert_eq!(result.task.status, TaskStatus::Pending);

        let stored = state.metadata_store.get_document(result.document.id).await.unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn get_document_handler_returns_404_for_unknown_id() {
        let state = AppState::for_tests();
        let err = get_document_handler(Path(999), State(state)).await.unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }
}
