//! HTTP and WebSocket surface
//!
//! REST endpoints submit instructions and serve the durable record (message
//! backfill, active session, open requests); the WebSocket endpoint attaches
//! a live per-project event feed. REST reads always reflect committed state
//! only, so a client can reconcile after a reconnect by merging backfill
//! with the live feed.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::broadcast::Broadcaster;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::runner::{ExecutionRunner, SubmitRequest};
use crate::store::ProjectStore;
use crate::types::{EventEnvelope, RequestType};

/// Shared state handed to every handler
pub struct AppState {
    pub store: Arc<dyn ProjectStore>,
    pub broadcaster: Arc<Broadcaster>,
    pub runner: Arc<ExecutionRunner>,
    pub config: RelayConfig,
}

/// Build the full application router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/projects/:project_id/act", post(submit_act))
        .route("/api/projects/:project_id/chat", post(submit_chat))
        .route("/api/projects/:project_id/messages", get(list_messages))
        .route(
            "/api/projects/:project_id/sessions/active",
            get(active_session),
        )
        .route(
            "/api/projects/:project_id/requests/active",
            get(active_requests),
        )
        .route("/ws/projects/:project_id", get(ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Error mapping
// ============================================================================

struct ApiError(RelayError);

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
            RelayError::Config(_) => StatusCode::BAD_REQUEST,
            RelayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

// ============================================================================
// REST handlers
// ============================================================================

#[derive(Debug, Deserialize)]
struct SubmitBody {
    instruction: String,
    #[serde(default)]
    project_dir: Option<PathBuf>,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    attachments: Vec<PathBuf>,
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    match state.store.health_check().await {
        Ok(()) => Json(json!({
            "status": "ok",
            "store": state.store.backend_name(),
        }))
        .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn submit_act(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Json(body): Json<SubmitBody>,
) -> Result<Response, ApiError> {
    submit(state, project_id, RequestType::Act, body).await
}

async fn submit_chat(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Json(body): Json<SubmitBody>,
) -> Result<Response, ApiError> {
    submit(state, project_id, RequestType::Chat, body).await
}

async fn submit(
    state: Arc<AppState>,
    project_id: String,
    request_type: RequestType,
    body: SubmitBody,
) -> Result<Response, ApiError> {
    if body.instruction.trim().is_empty() {
        return Err(ApiError(RelayError::Config(
            "instruction must not be empty".to_string(),
        )));
    }

    let outcome = state
        .runner
        .submit(SubmitRequest {
            project_id,
            project_dir: body
                .project_dir
                .unwrap_or_else(|| state.config.data_dir.clone()),
            instruction: body.instruction,
            request_type,
            conversation_id: body.conversation_id,
            attachments: body.attachments,
        })
        .await?;

    Ok((StatusCode::ACCEPTED, Json(outcome)).into_response())
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    #[serde(default)]
    conversation_id: Option<String>,
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<Response, ApiError> {
    let messages = state
        .store
        .list_messages(&project_id, query.conversation_id.as_deref())
        .await?;
    Ok(Json(messages).into_response())
}

async fn active_session(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Result<Response, ApiError> {
    let session = state.runner.ledger().active_session(&project_id).await?;
    Ok(Json(session).into_response())
}

async fn active_requests(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Result<Response, ApiError> {
    let summary = state.runner.ledger().request_summary(&project_id).await?;
    Ok(Json(summary).into_response())
}

// ============================================================================
// WebSocket feed
// ============================================================================

async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| serve_feed(socket, state, project_id))
}

/// One attached live-feed connection
///
/// Subscribes before the greeting is sent so no event published after the
/// upgrade is missed. Liveness is server-driven: a ping every heartbeat
/// interval, and the connection closes when no pong (or any other frame)
/// arrives within the heartbeat timeout.
async fn serve_feed(socket: WebSocket, state: Arc<AppState>, project_id: String) {
    let (subscriber_id, mut events) = state.broadcaster.subscribe(&project_id).await;
    tracing::info!(project = %project_id, subscriber = subscriber_id, "live feed attached");

    let (mut sink, mut stream) = socket.split();

    let greeting = EventEnvelope::project_status("connected", None);
    if send_envelope(&mut sink, &greeting).await.is_err() {
        state.broadcaster.unsubscribe(&project_id, subscriber_id).await;
        return;
    }

    let mut heartbeat = interval(state.config.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await; // first tick fires immediately
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(envelope) = event else { break };
                if send_envelope(&mut sink, &envelope).await.is_err() {
                    break;
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => last_seen = Instant::now(),
                    Some(Err(e)) => {
                        tracing::debug!(project = %project_id, error = %e, "feed socket error");
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if last_seen.elapsed() > state.config.heartbeat_timeout() {
                    tracing::info!(
                        project = %project_id,
                        subscriber = subscriber_id,
                        "closing silent feed connection"
                    );
                    break;
                }
                if sink.send(WsMessage::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.broadcaster.unsubscribe(&project_id, subscriber_id).await;
    tracing::info!(project = %project_id, subscriber = subscriber_id, "live feed detached");
}

async fn send_envelope(
    sink: &mut (impl futures::Sink<WsMessage, Error = axum::Error> + Unpin),
    envelope: &EventEnvelope,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(envelope).map_err(axum::Error::new)?;
    sink.send(WsMessage::Text(text)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterEvent, AdapterInvocation, AgentAdapter};
    use crate::error::Result as RelayResult;
    use crate::store::MemoryProjectStore;
    use crate::types::{Message, MessageRole, MessageType};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    struct NoopAdapter;

    #[async_trait]
    impl AgentAdapter for NoopAdapter {
        async fn execute(
            &self,
            _invocation: AdapterInvocation,
        ) -> RelayResult<mpsc::Receiver<AdapterEvent>> {
            let (tx, rx) = mpsc::channel(4);
            tokio::spawn(async move {
                let _ = tx
                    .send(AdapterEvent::Result {
                        success: true,
                        error: None,
                    })
                    .await;
            });
            Ok(rx)
        }

        fn cli_type(&self) -> &str {
            "noop"
        }
    }

    fn app() -> (Router, Arc<AppState>) {
        let store: Arc<dyn ProjectStore> = Arc::new(MemoryProjectStore::new());
        let broadcaster = Arc::new(Broadcaster::new());
        let config = RelayConfig::default();
        let runner = Arc::new(ExecutionRunner::new(
            store.clone(),
            broadcaster.clone(),
            Arc::new(NoopAdapter),
            config.clone(),
        ));
        let state = Arc::new(AppState {
            store,
            broadcaster,
            runner,
            config,
        });
        (router(state.clone()), state)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["store"], "memory");
    }

    #[tokio::test]
    async fn test_submit_act_accepted() {
        let (app, _) = app();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/projects/proj-1/act")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"instruction": "add a test"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json = body_json(response).await;
        assert!(json["session_id"].as_str().unwrap().starts_with("sess-"));
        assert!(json["request_id"].as_str().unwrap().starts_with("req-"));
        assert_eq!(json["status"], "active");
    }

    #[tokio::test]
    async fn test_submit_rejects_empty_instruction() {
        let (app, _) = app();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/projects/proj-1/chat")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"instruction": "   "}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_list_messages_backfill() {
        let (app, state) = app();
        let message = Message::new("proj-1", MessageRole::Assistant, MessageType::Chat, "hi")
            .with_conversation("conv-1");
        state.store.append_message(&message).await.unwrap();
        let other = Message::new("proj-1", MessageRole::Assistant, MessageType::Chat, "other")
            .with_conversation("conv-2");
        state.store.append_message(&other).await.unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/projects/proj-1/messages?conversation_id=conv-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let messages = json.as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["content"], "hi");
    }

    #[tokio::test]
    async fn test_active_session_none() {
        let (app, _) = app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/projects/proj-1/sessions/active")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_active_requests_summary() {
        let (app, _) = app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/projects/proj-1/requests/active")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["has_active_requests"], false);
        assert_eq!(json["active_count"], 0);
    }
}
