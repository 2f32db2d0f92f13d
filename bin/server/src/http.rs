use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;

use chat_core::{ConversationCore, CoreError, ImagePayload, ProcessMessageRequest};

type SharedCore = Arc<ConversationCore>;

/// Local wrapper so `IntoResponse` can be implemented for `chat-core`'s
/// error type without running afoul of the orphan rule.
struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_client_error() {
            StatusCode::BAD_REQUEST
        } else if matches!(self.0, CoreError::NotFound) {
            StatusCode::NOT_FOUND
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        let message = self.0.to_string();
        (status, Json(json!({ "error": message, "details": message }))).into_response()
    }
}

pub fn create_router(core: SharedCore) -> Router {
    Router::new()
        .route("/api/process-message", post(process_message))
        .route("/api/stream-events/:streaming_session_id", get(stream_events))
        .route("/api/conversation-config/:chatbot_id", get(conversation_config))
        .route("/api/upload-image", post(upload_image))
        .route("/api/conversation-health", get(health))
        .route(
            "/api/conversation-sessions/:user_id/:chatbot_id",
            get(conversation_sessions),
        )
        .with_state(core)
}

async fn health(State(core): State<SharedCore>) -> Json<Value> {
    Json(core.health().await)
}

#[derive(Debug, Deserialize)]
struct ProcessMessageBody {
    user_id: String,
    chatbot_id: String,
    message_text: String,
    image_data: Option<String>,
    #[serde(default)]
    image_filename: Option<String>,
    #[serde(default)]
    image_mime: Option<String>,
    #[serde(default)]
    image_size: Option<i64>,
    #[serde(default)]
    image_is_file: bool,
    #[serde(default)]
    configuration: Option<Value>,
}

async fn process_message(
    State(core): State<SharedCore>,
    Json(body): Json<ProcessMessageBody>,
) -> Result<Json<Value>, ApiError> {
    let image = body.image_data.map(|data| ImagePayload {
        data,
        filename: body.image_filename,
        mime: body.image_mime,
        size: body.image_size,
        is_file: body.image_is_file,
    });

    let response = core
        .process_message(ProcessMessageRequest {
            user_id: body.user_id,
            chatbot_id: body.chatbot_id,
            message_text: body.message_text,
            image,
            configuration: body.configuration,
        })
        .await?;

    Ok(Json(json!({
        "success": true,
        "session_id": response.session_id,
        "streaming_session_id": response.streaming_session_id,
        "flow_type": response.flow_type,
        "order_details": response.order_details,
        "streaming_url": response.streaming_url,
    })))
}

async fn stream_events(
    State(core): State<SharedCore>,
    Path(streaming_session_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let last_event_id: i64 = params
        .get("lastEventId")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let (events, status, new_last_id) = core.poll_events(&streaming_session_id, last_event_id).await?;

    let events_json: Vec<Value> = events
        .into_iter()
        .map(|e| {
            json!({
                "id": e.id,
                "event_type": e.event_type,
                "event_data": e.event_data,
            })
        })
        .collect();

    Ok(Json(json!({
        "events": events_json,
        "session_status": status,
        "last_event_id": new_last_id,
        "has_more": matches!(status, chat_core::StreamingStatus::Active),
    })))
}

async fn conversation_config(
    State(core): State<SharedCore>,
    Path(chatbot_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let settings = core.conversation_config(&chatbot_id).await?;
    Ok(Json(json!({
        "first_message": settings.first_message,
        "feature_flags": settings.feature_flags,
        "ui_labels": settings.ui_labels,
    })))
}

#[derive(Debug, Deserialize)]
struct UploadImageBody {
    chatbot_id: String,
    image_data: String,
    message_text: Option<String>,
}

/// Synchronous image-to-text conversion via the tenant's configured
/// upstream endpoint — unlike `process-message`, this does not open a
/// streaming session; it waits on a single non-streaming upstream call.
async fn upload_image(
    State(core): State<SharedCore>,
    Json(body): Json<UploadImageBody>,
) -> Result<Json<Value>, ApiError> {
    let settings = core.conversation_config(&body.chatbot_id).await?;

    let client = reqwest::Client::new();
    let response = client
        .post(&settings.upstream_url)
        .json(&json!({
            "question": body.message_text.unwrap_or_default(),
            "image": body.image_data,
            "streaming": false,
        }))
        .send()
        .await
        .map_err(|e| CoreError::UpstreamConnectFailed(e.to_string()))?;

    let body: Value = response
        .error_for_status()
        .map_err(|e| CoreError::UpstreamConnectFailed(e.to_string()))?
        .json()
        .await
        .map_err(|e| CoreError::UpstreamConnectFailed(e.to_string()))?;

    let text = body
        .get("text")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Ok(Json(json!({ "text": text })))
}

/// `GET /api/conversation-sessions/:user_id/:chatbot_id` — diagnostic
/// listing, supplemented from the teacher's equivalent session-listing
/// endpoints (§4.8).
async fn conversation_sessions(
    State(core): State<SharedCore>,
    Path((user_id, chatbot_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let sessions = core.recent_sessions(&user_id, &chatbot_id).await?;
    Ok(Json(json!({ "sessions": sessions })))
}
