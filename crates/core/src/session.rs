use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::any::Any;
use sqlx::{FromRow, Pool, Row};
use uuid::Uuid;

use crate::error::CoreError;

/// An optional image attached to a user turn. Images never leave the
/// process as anything but data URLs — object storage is out of scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagePayload {
    pub data: String,
    pub filename: Option<String>,
    pub mime: Option<String>,
    pub size: Option<i64>,
    /// Whether this attachment came from an actual file upload (vs. e.g. an
    /// upstream-generated inline image with no backing file) — §4.6 step 4.
    #[serde(default)]
    pub is_file: bool,
}

/// Immutable snapshot of one incoming request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSession {
    pub session_id: String,
    pub user_id: String,
    pub chatbot_id: String,
    pub message_text: String,
    pub image: Option<ImagePayload>,
    pub configuration: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamingStatus {
    Active,
    Completed,
    Failed,
}

impl StreamingStatus {
    fn parse(s: &str) -> Self {
        match s {
            "completed" => StreamingStatus::Completed,
            "failed" => StreamingStatus::Failed,
            _ => StreamingStatus::Active,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingSessionStatus {
    pub status: StreamingStatus,
    pub error_message: Option<String>,
    pub final_result: Option<Value>,
    pub completed_at: Option<DateTime<Utc>>,
}

struct StreamingSessionRow {
    status: String,
    error_message: Option<String>,
    final_result: Option<String>,
    completed_at: Option<i64>,
}

impl<'r> FromRow<'r, sqlx::any::AnyRow> for StreamingSessionRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            status: row.try_get("status")?,
            error_message: row.try_get("error_message").ok(),
            final_result: row.try_get("final_result").ok(),
            completed_at: row.try_get("completed_at").ok(),
        })
    }
}

/// Backs the poll-based delivery channel: `conversation_session`s describing
/// in-flight requests, and the `streaming_session`s created per upstream
/// call. The registry does not serialize sessions against each other — any
/// number of tenants, or a single tenant, may have sessions active at once.
#[derive(Clone)]
pub struct SessionRegistry {
    pool: Pool<Any>,
}

impl SessionRegistry {
    pub fn new(pool: Pool<Any>) -> Self {
        Self { pool }
    }

    pub async fn create_conversation_session(
        &self,
        user_id: &str,
        chatbot_id: &str,
        message_text: &str,
        image: Option<ImagePayload>,
        configuration: Option<Value>,
    ) -> Result<String, CoreError> {
        if user_id.is_empty() || chatbot_id.is_empty() || message_text.is_empty() {
            return Err(CoreError::BadRequest(
                "user_id, chatbot_id, and message_text are required".to_string(),
            ));
        }
        let session_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO conversation_sessions \
             (session_id, user_id, chatbot_id, message_text, image_data, image_filename, image_mime, image_size, image_is_file, configuration, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(&session_id)
        .bind(user_id)
        .bind(chatbot_id)
        .bind(message_text)
        .bind(image.as_ref().map(|i| i.data.clone()))
        .bind(image.as_ref().and_then(|i| i.filename.clone()))
        .bind(image.as_ref().and_then(|i| i.mime.clone()))
        .bind(image.as_ref().and_then(|i| i.size))
        .bind(image.as_ref().map(|i| i.is_file).unwrap_or(false))
        .bind(configuration.map(|c| c.to_string()))
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(session_id)
    }

    pub async fn create_streaming_session(
        &self,
        conversation_session_id: &str,
        upstream_url: &str,
    ) -> Result<String, CoreError> {
        let streaming_session_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO streaming_sessions \
             (streaming_session_id, conversation_session_id, upstream_url, status, created_at) \
             VALUES ($1, $2, $3, 'active', $4)",
        )
        .bind(&streaming_session_id)
        .bind(conversation_session_id)
        .bind(upstream_url)
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(streaming_session_id)
    }

    /// Terminal transition to `completed`. A session already in a terminal
    /// state silently absorbs the call: the first terminal status and first
    /// error message are never overwritten (§8 property 7).
    pub async fn mark_completed(
        &self,
        streaming_session_id: &str,
        final_result: Option<Value>,
    ) -> Result<(), CoreError> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE streaming_sessions SET status = 'completed', final_result = $1, completed_at = $2 \
             WHERE streaming_session_id = $3 AND status = 'active'",
        )
        .bind(final_result.map(|v| v.to_string()))
        .bind(now.timestamp())
        .bind(streaming_session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, streaming_session_id: &str, error: &str) -> Result<(), CoreError> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE streaming_sessions SET status = 'failed', error_message = $1, completed_at = $2 \
             WHERE streaming_session_id = $3 AND status = 'active'",
        )
        .bind(error)
        .bind(now.timestamp())
        .bind(streaming_session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_status(
        &self,
        streaming_session_id: &str,
    ) -> Result<StreamingSessionStatus, CoreError> {
        let row = sqlx::query_as::<_, StreamingSessionRow>(
            "SELECT status, error_message, final_result, completed_at \
             FROM streaming_sessions WHERE streaming_session_id = $1",
        )
        .bind(streaming_session_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(CoreError::NotFound)?;

        Ok(StreamingSessionStatus {
            status: StreamingStatus::parse(&row.status),
            error_message: row.error_message,
            final_result: row
                .final_result
                .and_then(|s| serde_json::from_str(&s).ok()),
            completed_at: row
                .completed_at
                .and_then(|ts| DateTime::from_timestamp(ts, 0)),
        })
    }

    pub async fn get_conversation_session(
        &self,
        session_id: &str,
    ) -> Result<ConversationSession, CoreError> {
        let row = sqlx::query(
            "SELECT session_id, user_id, chatbot_id, message_text, image_data, image_filename, \
                    image_mime, image_size, image_is_file, configuration, created_at \
             FROM conversation_sessions WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(CoreError::NotFound)?;

        let image_data: Option<String> = row.try_get("image_data").ok();
        let image = image_data.map(|data| ImagePayload {
            data,
            filename: row.try_get("image_filename").ok(),
            mime: row.try_get("image_mime").ok(),
            size: row.try_get("image_size").ok(),
            is_file: row.try_get("image_is_file").unwrap_or(false),
        });
        let configuration: Option<String> = row.try_get("configuration").ok();
        let created_at: i64 = row.try_get("created_at")?;

        Ok(ConversationSession {
            session_id: row.try_get("session_id")?,
            user_id: row.try_get("user_id")?,
            chatbot_id: row.try_get("chatbot_id")?,
            message_text: row.try_get("message_text")?,
            image,
            configuration: configuration.and_then(|c| serde_json::from_str(&c).ok()),
            created_at: DateTime::from_timestamp(created_at, 0).unwrap_or_else(Utc::now),
        })
    }

    /// Diagnostic listing for `GET /api/conversation-sessions/:user_id/:chatbot_id` (§4.8).
    pub async fn list_recent_sessions(
        &self,
        user_id: &str,
        chatbot_id: &str,
        limit: i64,
    ) -> Result<Vec<ConversationSession>, CoreError> {
        let rows = sqlx::query(
            "SELECT session_id, user_id, chatbot_id, message_text, image_data, image_filename, \
                    image_mime, image_size, image_is_file, configuration, created_at \
             FROM conversation_sessions WHERE user_id = $1 AND chatbot_id = $2 \
             ORDER BY created_at DESC LIMIT $3",
        )
        .bind(user_id)
        .bind(chatbot_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut sessions = Vec::with_capacity(rows.len());
        for row in rows {
            let image_data: Option<String> = row.try_get("image_data").ok();
            let image = image_data.map(|data| ImagePayload {
                data,
                filename: row.try_get("image_filename").ok(),
                mime: row.try_get("image_mime").ok(),
                size: row.try_get("image_size").ok(),
                is_file: row.try_get("image_is_file").unwrap_or(false),
            });
            let configuration: Option<String> = row.try_get("configuration").ok();
            let created_at: i64 = row.try_get("created_at")?;
            sessions.push(ConversationSession {
                session_id: row.try_get("session_id")?,
                user_id: row.try_get("user_id")?,
                chatbot_id: row.try_get("chatbot_id")?,
                message_text: row.try_get("message_text")?,
                image,
                configuration: configuration.and_then(|c| serde_json::from_str(&c).ok()),
                created_at: DateTime::from_timestamp(created_at, 0).unwrap_or_else(Utc::now),
            });
        }
        Ok(sessions)
    }

    /// Background maintenance: drop `conversation_session`s older than 24h.
    pub async fn purge_expired_sessions(&self, older_than_seconds: i64) -> Result<u64, CoreError> {
        let cutoff = Utc::now().timestamp() - older_than_seconds;
        let result = sqlx::query("DELETE FROM conversation_sessions WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_pool;

    #[tokio::test]
    async fn create_conversation_session_requires_fields() {
        let registry = SessionRegistry::new(test_pool().await);
        let err = registry
            .create_conversation_session("", "bot", "hi", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::BadRequest(_)));
    }

    #[tokio::test]
    async fn streaming_session_lifecycle() {
        let registry = SessionRegistry::new(test_pool().await);
        let session_id = registry
            .create_conversation_session("u1", "bot", "hello", None, None)
            .await
            .unwrap();
        let streaming_id = registry
            .create_streaming_session(&session_id, "https://upstream.example")
            .await
            .unwrap();

        let status = registry.get_status(&streaming_id).await.unwrap();
        assert_eq!(status.status, StreamingStatus::Active);

        registry.mark_completed(&streaming_id, None).await.unwrap();
        let status = registry.get_status(&streaming_id).await.unwrap();
        assert_eq!(status.status, StreamingStatus::Completed);
    }

    #[tokio::test]
    async fn terminal_idempotence() {
        let registry = SessionRegistry::new(test_pool().await);
        let session_id = registry
            .create_conversation_session("u1", "bot", "hello", None, None)
            .await
            .unwrap();
        let streaming_id = registry
            .create_streaming_session(&session_id, "https://upstream.example")
            .await
            .unwrap();

        registry.mark_completed(&streaming_id, None).await.unwrap();
        registry.mark_failed(&streaming_id, "boom").await.unwrap();

        let status = registry.get_status(&streaming_id).await.unwrap();
        assert_eq!(status.status, StreamingStatus::Completed);
        assert_eq!(status.error_message, None);
    }

    #[tokio::test]
    async fn get_status_missing_is_not_found() {
        let registry = SessionRegistry::new(test_pool().await);
        let err = registry.get_status("nope").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound));
    }
}
