//! HTTP surface: one SSE stream per task execution.

use axum::{
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::contract::TaskRequest;
use super::conversation::ConversationStore;
use super::session::session_key;
use super::sinks::{ChannelSink, ProgressEvent};
use super::task_handler::TaskHandler;

pub struct ServerState {
    handler: TaskHandler,
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ServerState {
    pub fn new(handler: TaskHandler) -> Self {
        Self {
            handler,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Requests for the same session run one after another so that each
    /// sees the history the previous one saved. `key` must come from
    /// [`session_key`] so it matches the history key.
    async fn session_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.session_locks
            .lock()
            .await
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Hands back a lock from [`Self::session_lock`]; the entry is dropped
    /// once no other request holds or waits on it.
    async fn release_session_lock(&self, key: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.session_locks.lock().await;
        let idle = locks
            .get(key)
            .is_some_and(|entry| Arc::ptr_eq(entry, &lock) && Arc::strong_count(entry) == 2);
        if idle {
            locks.remove(key);
        }
    }

    async fn forget_idle_lock(&self, key: &str) {
        let mut locks = self.session_locks.lock().await;
        if locks
            .get(key)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(key);
        }
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        };
        (status, Json(ErrorResponse { message })).into_response()
    }
}

pub fn create_router(state: Arc<ServerState>) -> Router {
    let api_routes = Router::new()
        .route("/tasks/execute", post(execute_task))
        .route("/sessions/{id}", delete(evict_session));

    Router::new()
        .nest("/api/v0", api_routes)
        .route("/health", get(health))
        .with_state(state)
        .layer(middleware::from_fn(request_logging_middleware))
        .layer(TraceLayer::new_for_http())
}

async fn request_logging_middleware(request: Request, next: Next) -> Result<Response, StatusCode> {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start_time = Instant::now();

    let response = next.run(request).await;

    info!(
        method = %method,
        path = %uri.path(),
        status = %response.status().as_u16(),
        duration_ms = %start_time.elapsed().as_millis(),
        "Handled request"
    );
    Ok(response)
}

async fn execute_task(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<TaskRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    request
        .context
        .validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let TaskRequest { context, operators } = request;
        let key = session_key(context.session_id.as_deref());
        let lock = state.session_lock(&key).await;
        let outcome = {
            let _guard = lock.lock().await;
            let sink = ChannelSink::new(tx.clone());
            state.handler.execute(&context, &operators, &sink).await
        };
        state.release_session_lock(&key, lock).await;

        if tx
            .send(ProgressEvent::Result {
                result: outcome.to_result_value(),
            })
            .is_err()
        {
            warn!("Client disconnected before the result was delivered");
        }
    });

    Ok(Sse::new(event_stream(rx)).keep_alive(KeepAlive::default()))
}

fn event_stream(
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
) -> impl Stream<Item = Result<Event, axum::Error>> {
    stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        let sse = Event::default().event(event.kind()).json_data(&event);
        Some((sse, rx))
    })
}

async fn evict_session(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let key = session_key(Some(&id));
    state.forget_idle_lock(&key).await;
    if state.handler.store().evict(&key).await {
        info!("Evicted conversation history for session {}", id);
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Session '{}' not found", id)))
    }
}

async fn health(State(state): State<Arc<ServerState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.handler.store().session_count().await
    }))
}
