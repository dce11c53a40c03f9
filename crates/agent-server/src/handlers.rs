//! HTTP/SSE/WebSocket Handlers

use axum::{
    Json,
    extract::{State, WebSocketUpgrade, ws::Message},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::stream::{self, BoxStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;

use agent_core::{AgentError, SessionId, TurnEvent, TurnRequest};
use agent_runtime::{AdapterFactory, Advisory, ModelEntry};

use crate::state::AppState;

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub models: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Base64-encoded JPEG images attached to the message
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    /// Restrict the turn to these tools
    #[serde(default)]
    pub tools: Option<Vec<String>>,
}

impl ChatRequest {
    fn turn(&self) -> TurnRequest {
        let mut turn = TurnRequest::new(self.message.clone());
        if let Some(id) = &self.session_id {
            turn = turn.session(SessionId::from_string(id.clone()));
        }
        if let Some(username) = &self.username {
            turn = turn.username(username.clone());
        }
        for image in &self.images {
            turn = turn.image(image.clone());
        }
        turn
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Errors surfaced before a turn starts streaming
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("message must not be empty")]
    EmptyMessage,

    #[error(transparent)]
    Agent(#[from] AgentError),
}

impl ApiError {
    const fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::EmptyMessage => (StatusCode::BAD_REQUEST, "EMPTY_MESSAGE"),
            Self::Agent(AgentError::Config(_)) => (StatusCode::BAD_REQUEST, "INVALID_CONFIG"),
            Self::Agent(_) => (StatusCode::INTERNAL_SERVER_ERROR, "AGENT_ERROR"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Chat request failed");
        } else {
            tracing::warn!(error = %self, "Chat request rejected");
        }
        let error = match &self {
            Self::Agent(e) if status.is_server_error() => e.user_message(),
            _ => self.to_string(),
        };
        let body = ErrorResponse {
            error,
            code: code.into(),
        };
        (status, Json(body)).into_response()
    }
}

/// One message pushed to a streaming client
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Outbound {
    Advisory { advisory: Advisory },
    Turn(TurnEvent),
}

impl Outbound {
    const fn name(&self) -> &'static str {
        match self {
            Self::Advisory { .. } => "advisory",
            Self::Turn(TurnEvent::Started { .. }) => "started",
            Self::Turn(TurnEvent::Delta { .. }) => "delta",
            Self::Turn(
                TurnEvent::ToolInvoked { .. }
                | TurnEvent::ToolProgress { .. }
                | TurnEvent::ToolResult { .. },
            ) => "tool",
            Self::Turn(TurnEvent::Retry { .. }) => "retry",
            Self::Turn(TurnEvent::Finished(_)) => "finished",
        }
    }
}

/// Validate the request and start its turn
fn start_turn(state: &AppState, request: &ChatRequest) -> Result<BoxStream<'static, Outbound>, ApiError> {
    if request.message.trim().is_empty() {
        return Err(ApiError::EmptyMessage);
    }

    let (orchestrator, advisory) = state
        .context
        .orchestrator(request.model.as_deref(), request.tools.as_deref())?;
    tracing::info!(
        model = request.model.as_deref().unwrap_or(&state.context.config().default_model),
        session = ?request.session_id,
        images = request.images.len(),
        "Chat turn"
    );

    let advisory = stream::iter(advisory.map(|advisory| Outbound::Advisory { advisory }));
    let turn = orchestrator.chat(request.turn()).map(Outbound::Turn);
    Ok(advisory.chain(turn).boxed())
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        models: AdapterFactory::entries().count(),
    })
}

/// Model catalogue, current models first
pub async fn list_models() -> Json<Vec<&'static ModelEntry>> {
    Json(AdapterFactory::entries().collect())
}

/// Chat endpoint streaming turn events as Server-Sent Events
pub async fn chat_handler(
    State(state): State<AppState>,
    Json(payload): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let events = start_turn(&state, &payload)?.map(|outbound| {
        let event = Event::default().event(outbound.name());
        Ok(event.json_data(&outbound).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Could not encode event");
            Event::default().event("error").data(e.to_string())
        }))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// WebSocket streaming chat: one JSON `ChatRequest` per text frame
pub async fn chat_stream_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| {
        let (sender, receiver) = socket.split();
        handle_stream(sender, receiver, state)
    })
}

/// Serve turns until the client closes or a frame cannot be delivered
async fn handle_stream<S, R, E>(mut sender: S, mut receiver: R, state: AppState)
where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::error!("WebSocket error: {}", e);
                break;
            }
            _ => continue,
        };

        let started = serde_json::from_str::<ChatRequest>(msg.as_str())
            .map_err(|e| e.to_string())
            .and_then(|request| start_turn(&state, &request).map_err(|e| e.to_string()));

        let mut events = match started {
            Ok(events) => events,
            Err(error) => {
                let error = serde_json::json!({"type": "error", "error": error});
                if sender.send(Message::Text(error.to_string().into())).await.is_err() {
                    return;
                }
                continue;
            }
        };

        while let Some(outbound) = events.next().await {
            let Ok(text) = serde_json::to_string(&outbound) else {
                continue;
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
    }
}
