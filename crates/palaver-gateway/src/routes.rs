//! HTTP routes: chat streaming plus the admin surface.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use palaver_core::{SessionId, TurnId};
use palaver_session::SessionError;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::state::AppState;

pub fn build_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(chat))
        .route("/api/sessions/:id", delete(delete_session))
        .route("/api/admin/circuit-breaker", get(circuit_breaker_stats))
        .route("/api/admin/circuit-breaker/reset", post(circuit_breaker_reset))
        .route("/api/admin/sessions", get(session_count))
        .route("/api/admin/sessions/sweep", post(sweep_sessions))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub text: String,
    #[serde(default)]
    pub session_id: Option<SessionId>,
}

/// One streamed fragment, in the shape the browser client consumes.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FragmentEvent {
    id: TurnId,
    session_id: SessionId,
    chunk: String,
    is_complete: bool,
}

#[derive(Debug, Serialize)]
struct ErrorEvent {
    message: String,
}

#[derive(Debug, Deserialize)]
pub struct SweepRequest {
    pub max_age_minutes: u64,
}

/// Error shape for non-streaming responses.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let status = match &err {
            SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            SessionError::Busy(_) => StatusCode::CONFLICT,
            SessionError::Pipeline(_) => StatusCode::BAD_GATEWAY,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": crate::GATEWAY_VERSION }))
}

/// Submit a user turn and stream the completion back as SSE.
///
/// Each fragment becomes an event `{id, sessionId, chunk, isComplete}`;
/// the final fragment carries an empty chunk with `isComplete: true`. A
/// pipeline failure becomes a terminal `error` event instead.
async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let submission = state
        .orchestrator
        .submit(&request.text, request.session_id)
        .await?;

    let id = submission.assistant_turn_id;
    let session_id = submission.session_id;

    let events = submission.fragments.map(move |item| {
        let event = match item {
            Ok(fragment) => {
                let payload = FragmentEvent {
                    id,
                    session_id,
                    chunk: fragment.text,
                    is_complete: fragment.is_final,
                };
                Event::default().data(serde_json::to_string(&payload).unwrap_or_default())
            }
            Err(err) => {
                let payload = ErrorEvent {
                    message: err.to_string(),
                };
                Event::default()
                    .event("error")
                    .data(serde_json::to_string(&payload).unwrap_or_default())
            }
        };
        Ok(event)
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.orchestrator.delete_session(id).await?;
    Ok(Json(json!({ "deleted": id })))
}

async fn circuit_breaker_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stats = state.orchestrator.circuit_breaker_stats();
    Json(json!(stats))
}

async fn circuit_breaker_reset(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.orchestrator.reset_circuit_breaker();
    Json(json!(state.orchestrator.circuit_breaker_stats()))
}

async fn session_count(State(state): State<AppState>) -> Json<serde_json::Value> {
    let active = state.orchestrator.active_session_count().await;
    Json(json!({ "active": active }))
}

async fn sweep_sessions(
    State(state): State<AppState>,
    Json(request): Json<SweepRequest>,
) -> Json<serde_json::Value> {
    let max_age = Duration::from_secs(request.max_age_minutes * 60);
    let removed = state.orchestrator.clear_older_than(max_age).await;
    Json(json!({ "removed": removed }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use palaver_context::ContextWindow;
    use palaver_pipeline::{CompletionPipeline, PipelineConfig};
    use palaver_resilience::CircuitBreaker;
    use palaver_runtime::{CompletionClient, MockClient};
    use palaver_session::SessionOrchestrator;
    use tower::ServiceExt;

    use super::*;

    fn test_state(client: Arc<MockClient>) -> AppState {
        let breaker = Arc::new(CircuitBreaker::default());
        let pipeline = Arc::new(CompletionPipeline::new(
            client as Arc<dyn CompletionClient>,
            breaker,
            PipelineConfig::default(),
        ));
        let orchestrator = Arc::new(SessionOrchestrator::new(
            pipeline,
            ContextWindow::new(4096, "test persona"),
        ));
        AppState::new(orchestrator)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = build_routes(test_state(Arc::new(MockClient::new())));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn circuit_breaker_stats_route_serializes_state() {
        let app = build_routes(test_state(Arc::new(MockClient::new())));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/admin/circuit-breaker")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["state"], "closed");
        assert_eq!(body["consecutive_failures"], 0);
    }

    #[tokio::test]
    async fn chat_streams_fragments_as_sse() {
        let client = Arc::new(MockClient::new());
        client.enqueue_reply("hello world");
        let app = build_routes(test_state(client));

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/api/chat")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"text":"hi"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(content_type.starts_with("text/event-stream"));

        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let body = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(body.contains("\"chunk\":\"hello \""));
        assert!(body.contains("\"isComplete\":true"));
    }

    #[tokio::test]
    async fn delete_of_unknown_session_is_404() {
        let app = build_routes(test_state(Arc::new(MockClient::new())));

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::DELETE)
                    .uri(format!("/api/sessions/{}", SessionId::new()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sweep_route_reports_removed_count() {
        let app = build_routes(test_state(Arc::new(MockClient::new())));

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/api/admin/sessions/sweep")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"max_age_minutes":60}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["removed"], 0);
    }
}
