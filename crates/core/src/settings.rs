use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::any::Any;
use sqlx::{FromRow, Pool, Row};

use crate::error::CoreError;

/// Per-tenant configuration. The core never writes to this table; it is a
/// read-through view over data ingested by an external collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatbotSettings {
    pub chatbot_id: String,
    pub upstream_url: String,
    pub flow_keys: Value,
    pub first_message: Option<String>,
    pub feature_flags: Value,
    pub ui_labels: Value,
    pub classification_url: Option<String>,
}

impl<'r> FromRow<'r, sqlx::any::AnyRow> for ChatbotSettings {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let flow_keys_raw: String = row.try_get("flow_keys").unwrap_or_default();
        let feature_flags_raw: String = row.try_get("feature_flags").unwrap_or_default();
        let ui_labels_raw: String = row.try_get("ui_labels").unwrap_or_default();
        Ok(Self {
            chatbot_id: row.try_get("chatbot_id")?,
            upstream_url: row.try_get("upstream_url")?,
            flow_keys: serde_json::from_str(&flow_keys_raw).unwrap_or(Value::Null),
            first_message: row.try_get("first_message").ok(),
            feature_flags: serde_json::from_str(&feature_flags_raw).unwrap_or(Value::Null),
            ui_labels: serde_json::from_str(&ui_labels_raw).unwrap_or(Value::Null),
            classification_url: row.try_get("classification_url").ok(),
        })
    }
}

/// The settings store: a single read operation, no caching, no writes.
#[derive(Clone)]
pub struct SettingsStore {
    pool: Pool<Any>,
}

impl SettingsStore {
    pub fn new(pool: Pool<Any>) -> Self {
        Self { pool }
    }

    /// `load(chatbot_id) -> Settings | NotFound`. An absent row means the
    /// tenant is unknown; callers translate that into `TenantUnknown`.
    pub async fn load(&self, chatbot_id: &str) -> Result<ChatbotSettings, CoreError> {
        let row = sqlx::query_as::<_, ChatbotSettings>(
            "SELECT chatbot_id, upstream_url, \
                    CAST(flow_keys AS TEXT) as flow_keys, \
                    first_message, \
                    CAST(feature_flags AS TEXT) as feature_flags, \
                    CAST(ui_labels AS TEXT) as ui_labels, \
                    classification_url \
             FROM chatbot_settings WHERE chatbot_id = $1",
        )
        .bind(chatbot_id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| CoreError::TenantUnknown(chatbot_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{seed_settings, test_pool};

    #[tokio::test]
    async fn load_missing_tenant_is_tenant_unknown() {
        let pool = test_pool().await;
        let store = SettingsStore::new(pool);
        let err = store.load("nope").await.unwrap_err();
        assert!(matches!(err, CoreError::TenantUnknown(_)));
    }

    #[tokio::test]
    async fn load_existing_tenant() {
        let pool = test_pool().await;
        seed_settings(&pool, "bot-1", "https://upstream.example/chat").await;
        let store = SettingsStore::new(pool);
        let settings = store.load("bot-1").await.unwrap();
        assert_eq!(settings.upstream_url, "https://upstream.example/chat");
    }
}
