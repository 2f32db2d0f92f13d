pub mod db;
pub mod error;
pub mod events;
pub mod markers;
pub mod persistence;
pub mod session;
pub mod settings;
pub mod upstream;

#[cfg(test)]
mod test_support;

use serde_json::{json, Value};
use sqlx::any::Any;
use sqlx::{Pool, Row};

pub use error::CoreError;
pub use events::{EventKind, StreamingEvent};
pub use session::{ConversationSession, ImagePayload, StreamingStatus};
pub use settings::ChatbotSettings;

use events::EventLog;
use persistence::PersistenceService;
use session::SessionRegistry;
use settings::SettingsStore;
use upstream::UpstreamClient;

/// Wires together the six components from the system overview and exposes
/// the operations the HTTP surface needs. Constructed once at startup from
/// an explicit pool, following the ambient-singleton-free redesign in the
/// design notes.
#[derive(Clone)]
pub struct ConversationCore {
    pool: Pool<Any>,
    settings: SettingsStore,
    sessions: SessionRegistry,
    events: EventLog,
    upstream: UpstreamClient,
}

pub struct ProcessMessageRequest {
    pub user_id: String,
    pub chatbot_id: String,
    pub message_text: String,
    pub image: Option<ImagePayload>,
    pub configuration: Option<Value>,
}

pub struct ProcessMessageResponse {
    pub session_id: String,
    pub streaming_session_id: String,
    /// Which upstream flow this turn was routed to. Order-lookup and
    /// ticketing proxies are out of scope (§1 Non-goals), so this core only
    /// ever distinguishes the image-preprocessing flow from the plain text
    /// flow; `order_details` always stays `None`.
    pub flow_type: String,
    pub order_details: Option<Value>,
    pub streaming_url: String,
}

impl ConversationCore {
    pub fn new(pool: Pool<Any>, http: reqwest::Client, bearer_token: Option<String>) -> Self {
        let settings = SettingsStore::new(pool.clone());
        let sessions = SessionRegistry::new(pool.clone());
        let events = EventLog::new(pool.clone());
        let persistence = PersistenceService::new(pool.clone(), http.clone());
        let upstream = UpstreamClient::new(http, bearer_token, events.clone(), sessions.clone(), persistence);

        Self {
            pool,
            settings,
            sessions,
            events,
            upstream,
        }
    }

    pub fn pool(&self) -> &Pool<Any> {
        &self.pool
    }

    /// `POST /api/process-message`: validates the request, opens a
    /// `conversation_session`/`streaming_session` pair, and launches the
    /// upstream consumer in the background. Returns as soon as the sessions
    /// are created — it never waits on the stream itself.
    pub async fn process_message(
        &self,
        req: ProcessMessageRequest,
    ) -> Result<ProcessMessageResponse, CoreError> {
        let settings = self.settings.load(&req.chatbot_id).await?;

        let session_id = self
            .sessions
            .create_conversation_session(
                &req.user_id,
                &req.chatbot_id,
                &req.message_text,
                req.image.clone(),
                req.configuration.clone(),
            )
            .await?;

        let streaming_session_id = self
            .sessions
            .create_streaming_session(&session_id, &settings.upstream_url)
            .await?;

        let session = self.sessions.get_conversation_session(&session_id).await?;
        let request_body = build_upstream_request(&session, &settings);
        let flow_type = if session.image.is_some() { "image" } else { "text" }.to_string();

        self.upstream.start(
            streaming_session_id.clone(),
            settings.upstream_url.clone(),
            request_body,
            settings,
            session,
        );

        Ok(ProcessMessageResponse {
            session_id,
            streaming_session_id: streaming_session_id.clone(),
            flow_type,
            order_details: None,
            streaming_url: format!("/api/stream-events/{streaming_session_id}"),
        })
    }

    /// `GET /api/stream-events/:id?lastEventId=N`.
    pub async fn poll_events(
        &self,
        streaming_session_id: &str,
        last_event_id: i64,
    ) -> Result<(Vec<StreamingEvent>, StreamingStatus, i64), CoreError> {
        let events = self.events.since(streaming_session_id, last_event_id).await?;
        let status = self.sessions.get_status(streaming_session_id).await?;
        let new_last_id = events.last().map(|e| e.id).unwrap_or(last_event_id);
        Ok((events, status.status, new_last_id))
    }

    pub async fn conversation_config(&self, chatbot_id: &str) -> Result<ChatbotSettings, CoreError> {
        self.settings.load(chatbot_id).await
    }

    pub async fn health(&self) -> Value {
        let reachable = db::is_reachable(&self.pool).await;
        let active_last_hour = sqlx::query(
            "SELECT COUNT(*) as c FROM streaming_sessions WHERE status = 'active' AND created_at > $1",
        )
        .bind(chrono::Utc::now().timestamp() - 3600)
        .fetch_one(&self.pool)
        .await
        .ok()
        .and_then(|row| row.try_get::<i64, _>("c").ok())
        .unwrap_or(0);

        json!({
            "db_reachable": reachable,
            "active_streaming_sessions_last_hour": active_last_hour,
        })
    }

    pub async fn recent_sessions(
        &self,
        user_id: &str,
        chatbot_id: &str,
    ) -> Result<Vec<ConversationSession>, CoreError> {
        self.sessions.list_recent_sessions(user_id, chatbot_id, 50).await
    }

    /// Background maintenance: §3's 1h event / 24h session retention.
    pub async fn purge_expired(&self) -> (u64, u64) {
        let events_purged = self.events.purge(3600).await.unwrap_or(0);
        let sessions_purged = self.sessions.purge_expired_sessions(24 * 3600).await.unwrap_or(0);
        (events_purged, sessions_purged)
    }
}

fn build_upstream_request(session: &ConversationSession, settings: &ChatbotSettings) -> Value {
    json!({
        "question": session.message_text,
        "streaming": true,
        "overrideConfig": settings.flow_keys,
        "history": [],
    })
}
