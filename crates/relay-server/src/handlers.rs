use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use relay_core::events::Event;
use relay_core::ids::SessionId;
use relay_core::messages::RunInput;
use relay_core::provider::ChatProvider;
use relay_engine::{AdaptiveAgent, AdaptiveState, HeartbeatMerger, SessionStore, StateArchive, StreamManager};

use crate::error::ApiError;

/// Header naming the adaptive session of a run.
pub const SESSION_HEADER: &str = "x-session-id";

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionStore>,
    pub provider: Arc<dyn ChatProvider>,
    pub heartbeat: HeartbeatMerger,
    pub archive: Option<Arc<StateArchive>>,
    pub system_prompt: Option<String>,
}

impl AppState {
    pub fn new(sessions: Arc<SessionStore>, provider: Arc<dyn ChatProvider>, heartbeat: HeartbeatMerger) -> Self {
        Self {
            sessions,
            provider,
            heartbeat,
            archive: None,
            system_prompt: None,
        }
    }

    pub fn with_archive(mut self, archive: Arc<StateArchive>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Live state, else the archived one.
    async fn lookup_state(&self, session_id: &SessionId) -> Result<Option<AdaptiveState>, ApiError> {
        if let Some(state) = self.sessions.state(session_id).await {
            return Ok(Some(state));
        }
        match &self.archive {
            Some(archive) => Ok(archive.load(session_id).await?),
            None => Ok(None),
        }
    }

    /// Bring an archived session back into memory before its first run.
    async fn revive(&self, session_id: &SessionId) {
        let Some(archive) = &self.archive else {
            return;
        };
        if self.sessions.get(session_id).is_some() {
            return;
        }
        match archive.load(session_id).await {
            Ok(Some(state)) => {
                self.sessions.restore(session_id, state);
            }
            Ok(None) => {}
            Err(e) => warn!(%session_id, error = %e, "could not load archived session"),
        }
    }
}

/// Body of `POST /v1/runs`: a run input plus an optional session id.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    #[serde(default, alias = "session_id")]
    pub session_id: Option<SessionId>,
    #[serde(flatten)]
    pub input: RunInput,
}

impl RunRequest {
    /// Header first, then body, then the thread id.
    fn session_id(&self, headers: &HeaderMap) -> SessionId {
        headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(SessionId::from_raw)
            .or_else(|| self.session_id.clone())
            .unwrap_or_else(|| SessionId::from_raw(self.input.thread_id.as_str()))
    }
}

/// `POST /v1/runs`: stream the run's events as SSE `data:` frames.
///
/// Production continues to completion if the client disconnects.
pub async fn create_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RunRequest>,
) -> impl IntoResponse {
    let session_id = request.session_id(&headers);
    let input = request.input;
    info!(
        %session_id,
        thread_id = %input.thread_id,
        run_id = %input.run_id,
        messages = input.messages.len(),
        "run requested"
    );

    state.revive(&session_id).await;
    let controller = state.sessions.get_or_create(&session_id);
    let provider = Arc::clone(&state.provider);
    let heartbeat = state.heartbeat;
    let system_prompt = state.system_prompt.clone();
    let archive = state.archive.clone();

    let manager = StreamManager::new(move || {
        let agent = AdaptiveAgent::new(Arc::clone(&controller), Arc::clone(&provider), heartbeat)
            .with_system_prompt(system_prompt.clone());
        match &archive {
            Some(archive) => agent.with_archive(Arc::clone(archive), session_id.clone()),
            None => agent,
        }
    });

    Sse::new(sse_frames(manager.run(input)))
}

fn sse_frames(
    events: impl Stream<Item = Event> + Send + 'static,
) -> impl Stream<Item = Result<SseEvent, Infallible>> + Send + 'static {
    events.filter_map(|event| async move {
        match SseEvent::default().json_data(&event) {
            Ok(frame) => Some(Ok(frame)),
            Err(e) => {
                warn!(event_type = event.event_type(), error = %e, "dropping unserializable event");
                None
            }
        }
    })
}

/// `GET /v1/adaptive-state/{session_id}`
pub async fn get_adaptive_state(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
) -> Result<Json<AdaptiveState>, ApiError> {
    state
        .lookup_state(&session_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("session {session_id}")))
}

/// `DELETE /v1/adaptive-state/{session_id}`: forget one session.
pub async fn delete_adaptive_state(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
) -> Result<Json<Value>, ApiError> {
    let mut existed = state.sessions.remove(&session_id);
    if let Some(archive) = &state.archive {
        existed |= archive.delete(&session_id).await?;
    }
    info!(%session_id, existed, "adaptive session reset");
    Ok(Json(json!({
        "status": "reset",
        "sessionId": session_id,
        "existed": existed,
        "state": state.sessions.initial_state(),
    })))
}

/// `DELETE /v1/adaptive-state`: forget every session.
pub async fn reset_adaptive_state(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let live = state.sessions.len();
    state.sessions.reset();
    let archived = match &state.archive {
        Some(archive) => archive.clear().await?,
        None => 0,
    };
    info!(live, archived, "all adaptive sessions reset");
    Ok(Json(json!({ "status": "reset", "sessions": live, "archived": archived })))
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "provider": state.provider.name(),
        "sessions": state.sessions.len(),
        "archive": state.archive.is_some(),
    }))
}
