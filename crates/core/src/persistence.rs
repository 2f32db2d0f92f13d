use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::any::Any;
use sqlx::{Pool, Row};
use tracing::warn;

use crate::error::CoreError;
use crate::session::{ConversationSession, ImagePayload};
use crate::settings::ChatbotSettings;

/// One turn in the rolling conversation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub text: String,
    #[serde(rename = "isUser")]
    pub is_user: bool,
    #[serde(rename = "textWithMarkers", skip_serializing_if = "Option::is_none")]
    pub text_with_markers: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<ImagePayload>,
}

/// Derived analytics fields, each `None` meaning "no opinion" — the COALESCE
/// upsert leaves the existing value untouched for any field left `None`.
#[derive(Debug, Clone, Default)]
pub struct DerivedFields {
    pub emne: Option<String>,
    pub score: Option<String>,
    pub customer_rating: Option<String>,
    pub lacking_info: Option<bool>,
    pub bug_status: Option<String>,
    pub purchase_tracking_enabled: Option<bool>,
    pub is_livechat: Option<bool>,
    pub fallback: Option<bool>,
}

struct ExistingConversation {
    messages: Vec<ConversationMessage>,
}

/// Runs the post-stream persistence and analytics pipeline (§4.6). Triggered
/// by a successful `end`; runs asynchronously after the streaming response
/// has already been delivered to the browser.
#[derive(Clone)]
pub struct PersistenceService {
    pool: Pool<Any>,
    http: reqwest::Client,
}

impl PersistenceService {
    pub fn new(pool: Pool<Any>, http: reqwest::Client) -> Self {
        Self { pool, http }
    }

    pub async fn persist_turn(
        &self,
        session: &ConversationSession,
        settings: &ChatbotSettings,
        assistant_text: &str,
        assistant_text_with_markers: &str,
        assistant_image: Option<ImagePayload>,
        context_chunks: &[Value],
    ) -> Result<(), CoreError> {
        let existing = self
            .load_conversation(&session.user_id, &session.chatbot_id)
            .await?;

        let mut messages = match &existing {
            Some(e) => e.messages.clone(),
            None => settings
                .first_message
                .as_ref()
                .map(|first| {
                    vec![ConversationMessage {
                        text: first.clone(),
                        is_user: false,
                        text_with_markers: None,
                        image: None,
                    }]
                })
                .unwrap_or_default(),
        };

        messages.push(ConversationMessage {
            text: session.message_text.clone(),
            is_user: true,
            text_with_markers: None,
            image: session.image.clone(),
        });

        let ai_message_index = messages.len();
        messages.push(ConversationMessage {
            text: assistant_text.to_string(),
            is_user: false,
            text_with_markers: Some(assistant_text_with_markers.to_string()),
            image: assistant_image,
        });

        let conversation_id = self
            .upsert_conversation(
                &session.user_id,
                &session.chatbot_id,
                &messages,
                &DerivedFields::default(),
            )
            .await?;

        if let Err(err) = self
            .replace_context_chunks(conversation_id, ai_message_index as i64, context_chunks)
            .await
        {
            warn!(%err, "context chunk write failed; ignoring per partial-failure policy");
        }

        if let Some(classification_url) = settings.classification_url.clone() {
            let conversation_text = messages
                .iter()
                .map(|m| m.text.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            match self.classify(&classification_url, &conversation_text).await {
                Ok(derived) => {
                    if let Err(err) = self
                        .upsert_conversation(&session.user_id, &session.chatbot_id, &messages, &derived)
                        .await
                    {
                        warn!(%err, "classification upsert failed");
                    }
                }
                Err(err) => {
                    warn!(%err, "classification call failed; derived fields left null");
                }
            }
        }

        Ok(())
    }

    async fn load_conversation(
        &self,
        user_id: &str,
        chatbot_id: &str,
    ) -> Result<Option<ExistingConversation>, CoreError> {
        let row = sqlx::query(
            "SELECT CAST(conversation_data AS TEXT) as conversation_data \
             FROM conversations WHERE user_id = $1 AND chatbot_id = $2",
        )
        .bind(user_id)
        .bind(chatbot_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let raw: String = row.try_get("conversation_data")?;
        let messages: Vec<ConversationMessage> = serde_json::from_str(&raw).unwrap_or_default();
        Ok(Some(ExistingConversation { messages }))
    }

    async fn upsert_conversation(
        &self,
        user_id: &str,
        chatbot_id: &str,
        messages: &[ConversationMessage],
        derived: &DerivedFields,
    ) -> Result<i64, CoreError> {
        let conversation_data = serde_json::to_string(messages).unwrap_or_else(|_| "[]".to_string());
        let now = Utc::now().timestamp();

        sqlx::query(
            "INSERT INTO conversations \
             (user_id, chatbot_id, conversation_data, emne, score, customer_rating, lacking_info, \
              bug_status, purchase_tracking_enabled, is_livechat, fallback, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (user_id, chatbot_id) DO UPDATE SET \
                conversation_data = excluded.conversation_data, \
                created_at = excluded.created_at, \
                emne = COALESCE(excluded.emne, conversations.emne), \
                score = COALESCE(excluded.score, conversations.score), \
                customer_rating = COALESCE(excluded.customer_rating, conversations.customer_rating), \
                lacking_info = COALESCE(excluded.lacking_info, conversations.lacking_info), \
                bug_status = COALESCE(excluded.bug_status, conversations.bug_status), \
                purchase_tracking_enabled = COALESCE(excluded.purchase_tracking_enabled, conversations.purchase_tracking_enabled), \
                is_livechat = COALESCE(excluded.is_livechat, conversations.is_livechat), \
                fallback = COALESCE(excluded.fallback, conversations.fallback)",
        )
        .bind(user_id)
        .bind(chatbot_id)
        .bind(conversation_data)
        .bind(derived.emne.clone())
        .bind(derived.score.clone())
        .bind(derived.customer_rating.clone())
        .bind(derived.lacking_info)
        .bind(derived.bug_status.clone())
        .bind(derived.purchase_tracking_enabled)
        .bind(derived.is_livechat)
        .bind(derived.fallback)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT id FROM conversations WHERE user_id = $1 AND chatbot_id = $2")
            .bind(user_id)
            .bind(chatbot_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("id")?)
    }

    /// Delete-then-insert within one transaction: §8 property 5, writing N
    /// chunks for `(conversation_id, message_index)` leaves exactly N rows.
    async fn replace_context_chunks(
        &self,
        conversation_id: i64,
        message_index: i64,
        chunks: &[Value],
    ) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM message_context_chunks WHERE conversation_id = $1 AND message_index = $2")
            .bind(conversation_id)
            .bind(message_index)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            let content = chunk
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let metadata = chunk.get("metadata").cloned().unwrap_or(Value::Null);
            let similarity = chunk.get("similarityScore").and_then(Value::as_f64);
            sqlx::query(
                "INSERT INTO message_context_chunks (conversation_id, message_index, content, metadata, similarity_score) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(conversation_id)
            .bind(message_index)
            .bind(content)
            .bind(metadata.to_string())
            .bind(similarity)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Step 8: optional classification call. Parses
    /// `Emne(<topic>) Happy(<score>) info(<yes|no>) fallback(<yes|no>)`;
    /// any field absent from the response stays `None` (ClassificationFailed
    /// policy: derived fields null, main turn still persisted).
    async fn classify(&self, url: &str, conversation_text: &str) -> Result<DerivedFields, CoreError> {
        let response = self
            .http
            .post(url)
            .json(&json!({ "text": conversation_text }))
            .send()
            .await
            .map_err(|e| CoreError::ClassificationFailed(e.to_string()))?;

        let body = response
            .error_for_status()
            .map_err(|e| CoreError::ClassificationFailed(e.to_string()))?
            .text()
            .await
            .map_err(|e| CoreError::ClassificationFailed(e.to_string()))?;

        Ok(DerivedFields {
            emne: parse_field(&body, "Emne"),
            score: parse_field(&body, "Happy"),
            customer_rating: None,
            lacking_info: parse_field(&body, "info").map(|v| v.eq_ignore_ascii_case("no")),
            bug_status: None,
            purchase_tracking_enabled: None,
            is_livechat: None,
            fallback: parse_field(&body, "fallback").map(|v| v.eq_ignore_ascii_case("yes")),
        })
    }
}

/// Extracts the content of `key(...)` from a classification response body.
fn parse_field(text: &str, key: &str) -> Option<String> {
    let marker = format!("{key}(");
    let start = text.find(&marker)? + marker.len();
    let end = text[start..].find(')')? + start;
    Some(text[start..end].to_string())
}
