//! Dashboard HTTP + WebSocket server.
//!
//! REST endpoints under `/api/*` read the event store, builder registry,
//! and session aggregator; `/ws/events` streams every broadcast envelope.

pub mod logger;
pub mod ws;

pub use logger::{ConversationEntry, ConversationLogger, ConversationRole};
pub use ws::ConnectionManager;

use crate::builder::BuilderRegistry;
use crate::config::ParleyConfig;
use crate::relay::SessionState;
use crate::sse::SessionAggregator;
use crate::store::{EventStore, EventType, InboxSeverity, TaskStatus};
use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: EventStore,
    pub logger: Arc<ConversationLogger>,
    pub ws: Arc<ConnectionManager>,
    pub aggregator: Arc<SessionAggregator>,
    pub builders: Arc<BuilderRegistry>,
    pub session_state: Arc<SessionState>,
    pub config: Arc<ParleyConfig>,
    pub started_at: Instant,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: EventStore,
        logger: Arc<ConversationLogger>,
        ws: Arc<ConnectionManager>,
        aggregator: Arc<SessionAggregator>,
        builders: Arc<BuilderRegistry>,
        session_state: Arc<SessionState>,
        config: Arc<ParleyConfig>,
    ) -> Self {
        // Every committed event fans out to the dashboard.
        let ws_for_events = ws.clone();
        store.add_event_listener(Box::new(move |event| {
            ws_for_events.broadcast(
                "task_event",
                json!({
                    "event_id": event.event_id,
                    "type": event.event_type.as_str(),
                    "task_id": event.task_id,
                    "timestamp": event.time.to_rfc3339(),
                    "payload": event.payload,
                }),
            );
        }));
        logger.attach_ws(ws.clone());

        Self {
            store,
            logger,
            ws,
            aggregator,
            builders,
            session_state,
            config,
            started_at: Instant::now(),
        }
    }
}

/// Create the dashboard router.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/:id", get(get_task))
        .route("/api/tasks/:id/events", get(get_task_events))
        .route("/api/inbox", get(get_inbox))
        .route("/api/inbox/acknowledge", post(acknowledge_inbox))
        .route("/api/builders", get(get_builders))
        .route("/api/events", get(get_events))
        .route("/api/events/conversation", get(get_conversation))
        .route("/api/system/health", get(system_health))
        .route("/api/sessions", get(get_sessions))
        .route("/ws/events", get(ws_events))
        .layer(cors)
        .with_state(state)
}

// ==================== Error handling ====================

#[derive(Debug)]
enum AppError {
    NotFound(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            AppError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<crate::store::StoreError> for AppError {
    fn from(e: crate::store::StoreError) -> Self {
        AppError::Internal(e.to_string())
    }
}

// ==================== Handlers ====================

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "parley-dashboard" }))
}

#[derive(Deserialize)]
struct TasksQuery {
    status: Option<String>,
    #[serde(default)]
    all: bool,
    limit: Option<usize>,
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<TasksQuery>,
) -> Result<Json<Value>, AppError> {
    let tasks = if let Some(status) = &query.status {
        state
            .store
            .get_tasks(Some(TaskStatus::parse(status)), query.limit.unwrap_or(100))?
    } else if query.all {
        state.store.get_tasks(None, query.limit.unwrap_or(100))?
    } else {
        state.store.get_active_tasks()?
    };
    Ok(Json(json!({ "count": tasks.len(), "tasks": tasks })))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let task = state
        .store
        .get_task(&id)?
        .ok_or_else(|| AppError::NotFound(format!("Task not found: {id}")))?;
    Ok(Json(serde_json::to_value(task).unwrap_or(Value::Null)))
}

async fn get_task_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let events = state.store.get_events(Some(&id), None, 0)?;
    Ok(Json(json!({ "count": events.len(), "events": events })))
}

#[derive(Deserialize)]
struct InboxQuery {
    #[serde(default)]
    unread_only: bool,
    severity: Option<String>,
    limit: Option<usize>,
}

async fn get_inbox(
    State(state): State<AppState>,
    Query(query): Query<InboxQuery>,
) -> Result<Json<Value>, AppError> {
    let severity = query.severity.as_deref().map(InboxSeverity::parse);
    let items = state
        .store
        .get_inbox(query.unread_only, severity, query.limit.unwrap_or(50))?;
    let unread = items.iter().filter(|i| i.is_unread()).count();
    Ok(Json(json!({ "count": items.len(), "unread": unread, "items": items })))
}

#[derive(Deserialize)]
struct AcknowledgeRequest {
    #[serde(default)]
    inbox_ids: Vec<String>,
}

async fn acknowledge_inbox(
    State(state): State<AppState>,
    Json(request): Json<AcknowledgeRequest>,
) -> Result<Json<Value>, AppError> {
    let count = if request.inbox_ids.is_empty() {
        state.store.acknowledge_all_inbox()?
    } else {
        for id in &request.inbox_ids {
            state.store.acknowledge_inbox(id)?;
        }
        request.inbox_ids.len()
    };
    Ok(Json(json!({ "acknowledged": count })))
}

async fn get_builders(State(state): State<AppState>) -> Json<Value> {
    let health = state.builders.health_check_all().await;
    let builders: Vec<Value> = state
        .builders
        .all()
        .into_iter()
        .map(|b| {
            json!({
                "name": b.name,
                "base_url": b.base_url(),
                "model": b.model(),
                "healthy": health.get(&b.name).copied().unwrap_or(false),
            })
        })
        .collect();
    Json(json!({ "builders": builders }))
}

#[derive(Deserialize)]
struct EventsQuery {
    task_id: Option<String>,
    #[serde(rename = "type")]
    event_type: Option<String>,
    #[serde(default)]
    after_id: i64,
}

async fn get_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Value>, AppError> {
    let event_type = query.event_type.as_deref().and_then(EventType::parse);
    let events = state
        .store
        .get_events(query.task_id.as_deref(), event_type, query.after_id)?;
    Ok(Json(json!({ "count": events.len(), "events": events })))
}

#[derive(Deserialize)]
struct ConversationQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn get_conversation(
    State(state): State<AppState>,
    Query(query): Query<ConversationQuery>,
) -> Json<Value> {
    let entries = state
        .logger
        .get_entries(query.limit.unwrap_or(100), query.offset.unwrap_or(0));
    Json(json!({ "count": entries.len(), "entries": entries }))
}

async fn system_health(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let active_tasks = state.store.get_active_tasks()?.len();
    let unread = state.store.get_inbox(true, None, 1000)?.len();
    Ok(Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "active_tasks": active_tasks,
        "unread_inbox": unread,
        "thread_count": state.session_state.thread_count(),
        "ws_clients": state.ws.connection_count(),
        "sources": state.aggregator.connection_status(),
        "root_project_dir": state.config.root_project_dir,
    })))
}

async fn get_sessions(State(state): State<AppState>) -> Json<Value> {
    let sessions = state.aggregator.get_aggregated_sessions();
    Json(json!({ "count": sessions.len(), "sessions": sessions }))
}

async fn ws_events(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| async move {
        state.ws.serve_socket(socket).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> AppState {
        AppState::new(
            EventStore::open_in_memory().unwrap(),
            Arc::new(ConversationLogger::new()),
            Arc::new(ConnectionManager::new()),
            Arc::new(SessionAggregator::new(Arc::new(ConnectionManager::new()))),
            Arc::new(BuilderRegistry::new()),
            Arc::new(SessionState::new()),
            Arc::new(ParleyConfig::default()),
        )
    }

    #[tokio::test]
    async fn test_store_events_fan_out_to_ws() {
        let state = test_state();
        let mut rx = state.ws.subscribe();

        state.store.create_task("Fan-out", None, None).unwrap();

        let frame = rx.try_recv().unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "task_event");
        assert_eq!(value["data"]["type"], "TaskCreated");
    }

    #[tokio::test]
    async fn test_acknowledge_endpoint_all_and_specific() {
        let state = test_state();
        let item = crate::store::InboxItem::new(InboxSeverity::Info, "one", json!({}));
        state.store.add_inbox_item(&item).unwrap();
        state
            .store
            .add_inbox_item(&crate::store::InboxItem::new(InboxSeverity::Error, "two", json!({})))
            .unwrap();

        let Json(specific) = acknowledge_inbox(
            State(state.clone()),
            Json(AcknowledgeRequest { inbox_ids: vec![item.inbox_id.clone()] }),
        )
        .await
        .unwrap();
        assert_eq!(specific["acknowledged"], 1);

        let Json(all) = acknowledge_inbox(
            State(state.clone()),
            Json(AcknowledgeRequest { inbox_ids: vec![] }),
        )
        .await
        .unwrap();
        assert_eq!(all["acknowledged"], 1);
    }

    #[tokio::test]
    async fn test_list_tasks_defaults_to_active() {
        let state = test_state();
        let task = state.store.create_task("Active one", None, None).unwrap();
        state.store.cancel_task(&task.task_id, "test").unwrap();
        state.store.create_task("Active two", None, None).unwrap();

        let Json(body) = list_tasks(
            State(state.clone()),
            Query(TasksQuery { status: None, all: false, limit: None }),
        )
        .await
        .unwrap();
        assert_eq!(body["count"], 1);

        let Json(everything) = list_tasks(
            State(state),
            Query(TasksQuery { status: None, all: true, limit: None }),
        )
        .await
        .unwrap();
        assert_eq!(everything["count"], 2);
    }
}
