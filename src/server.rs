//! HTTP API
//!
//! | Method | Path | |
//! |---|---|---|
//! | `POST` | `/api/generations` | start a session, `202` |
//! | `POST` | `/api/generations/cancel` | cancel a session, `202` |
//! | `GET` | `/api/topics/:workspace/:project/events` | SSE stream of topic events |
//! | `GET` | `/api/projects/:project/content` | stored document |
//! | `POST` | `/api/projects/:project/content` | create the document, `201` |
//! | `PUT` | `/api/projects/:project/chapters/:order` | manual chapter edit |
//! | `GET` | `/health` | liveness |
//!
//! Errors are JSON `{"error": ..., "kind": ...}` with a status derived from
//! the [`RelayError`] category.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::error::{RelayError, Result};
use crate::events::{StreamEvent, Topic};
use crate::merge::ManualEdit;
use crate::relay::Relay;
use crate::request::GenerationRequest;
use crate::session::{CancelAck, CancelRequest};
use crate::storage::{Chapter, ProjectContent};

/// Shared handler state
#[derive(Debug, Clone)]
pub struct AppState {
    relay: Relay,
    shutdown: CancellationToken,
}

impl AppState {
    /// `shutdown` ends open event streams when cancelled
    pub fn new(relay: Relay, shutdown: CancellationToken) -> Self {
        Self { relay, shutdown }
    }
}

/// Error response wrapper
#[derive(Debug)]
pub struct ApiError(anyhow::Error);

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match self.0.downcast_ref::<RelayError>() {
            Some(e) => (status_for(e), e.kind()),
            None => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        (
            status,
            Json(json!({ "error": self.0.to_string(), "kind": kind })),
        )
            .into_response()
    }
}

fn status_for(error: &RelayError) -> StatusCode {
    match error {
        RelayError::Conflict { .. }
        | RelayError::VersionConflict { .. }
        | RelayError::DocumentExists(_) => StatusCode::CONFLICT,
        RelayError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
        RelayError::DocumentNotFound(_) | RelayError::ChapterNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        RelayError::Serialization(_) => StatusCode::BAD_REQUEST,
        RelayError::Connection(_) | RelayError::Provider(_) => StatusCode::BAD_GATEWAY,
        RelayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Body of a successful start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartResponse {
    pub session_id: String,
    /// Topic the session's events are published on
    pub topic: String,
}

/// Body of a document creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDocument {
    pub chapters: Vec<Chapter>,
    pub editor: String,
}

/// Body of a manual chapter edit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterEdit {
    /// Workspace whose topic receives the update
    pub workspace_id: String,
    pub editor: String,
    #[serde(flatten)]
    pub edit: ManualEdit,
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/generations", post(start_generation))
        .route("/api/generations/cancel", post(cancel_generation))
        .route(
            "/api/topics/:workspace_id/:project_id/events",
            get(topic_events),
        )
        .route(
            "/api/projects/:project_id/content",
            get(get_content).post(create_content),
        )
        .route(
            "/api/projects/:project_id/chapters/:order",
            put(edit_chapter),
        )
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn start_generation(
    State(state): State<AppState>,
    Json(request): Json<GenerationRequest>,
) -> ApiResult<(StatusCode, Json<StartResponse>)> {
    let topic = Topic::new(&request.caller.workspace_id, &request.caller.project_id);
    let session_id = state.relay.coordinator.start(request)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(StartResponse {
            session_id,
            topic: topic.name(),
        }),
    ))
}

async fn cancel_generation(
    State(state): State<AppState>,
    Json(request): Json<CancelRequest>,
) -> (StatusCode, Json<CancelAck>) {
    let ack = state.relay.coordinator.cancel_request(&request);
    (StatusCode::ACCEPTED, Json(ack))
}

async fn topic_events(
    State(state): State<AppState>,
    Path((workspace_id, project_id)): Path<(String, String)>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let topic = Topic::new(workspace_id, project_id);
    tracing::debug!(topic = %topic, "Subscriber connected");

    let events = state
        .relay
        .bus
        .subscribe(&topic)
        .filter_map(|event| async move { to_sse(&event) })
        .map(Ok)
        .take_until(state.shutdown.clone().cancelled_owned());

    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn to_sse(event: &StreamEvent) -> Option<Event> {
    match Event::default().event(event.name()).json_data(event) {
        Ok(sse) => Some(sse),
        Err(e) => {
            tracing::warn!(event = event.name(), error = %e, "Dropping unserializable event");
            None
        }
    }
}

async fn get_content(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<ProjectContent>> {
    Ok(Json(state.relay.store.require(&project_id)?))
}

async fn create_content(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(body): Json<CreateDocument>,
) -> ApiResult<(StatusCode, Json<ProjectContent>)> {
    let doc = state
        .relay
        .store
        .create(&project_id, body.chapters, &body.editor)?;
    Ok((StatusCode::CREATED, Json(doc)))
}

async fn edit_chapter(
    State(state): State<AppState>,
    Path((project_id, order)): Path<(String, u32)>,
    Json(body): Json<ChapterEdit>,
) -> ApiResult<Json<ProjectContent>> {
    let topic = Topic::new(body.workspace_id, project_id);
    let doc = state
        .relay
        .merger
        .apply_manual_edit(&topic, order, &body.edit, &body.editor)?;
    Ok(Json(doc))
}

/// Serve the API until Ctrl-C
///
/// On shutdown every live session is cancelled and open event streams are
/// closed before the listener stops.
pub async fn serve(relay: Relay, bind: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|e| RelayError::Config(format!("cannot bind {}: {}", bind, e)))?;
    tracing::info!(addr = %bind, "Listening");

    let shutdown = CancellationToken::new();
    let coordinator = relay.coordinator.clone();
    let app = router(AppState::new(relay, shutdown.clone()));

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                return;
            }
            let cancelled = coordinator.cancel_all();
            tracing::info!(cancelled, "Shutting down");
            shutdown.cancel();
        })
        .await?;

    Ok(())
}
