use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::any::Any;
use sqlx::{FromRow, Pool, Row};

use crate::error::CoreError;
use crate::markers::MarkerFlags;

/// The five event kinds produced by the upstream streaming client (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Start,
    Context,
    Token,
    End,
    Error,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::Context => "context",
            EventKind::Token => "token",
            EventKind::End => "end",
            EventKind::Error => "error",
        }
    }
}

/// Tagged-variant payload shapes, one per event kind, replacing the mixed
/// object/string/primitive shapes the adopted design note (§9) flags.
/// Construct these with the helper functions below rather than building
/// `Value`s by hand.
pub fn start_payload() -> Value {
    json!({ "message": "Stream started" })
}

pub fn context_payload(chunks: Value) -> Value {
    json!({ "chunks": chunks })
}

pub fn token_payload(text: &str, markers: MarkerFlags) -> Value {
    json!({ "text": text, "markers": markers })
}

pub fn end_payload(final_text: &str, context_chunks: Value) -> Value {
    json!({ "finalText": final_text, "contextChunks": context_chunks })
}

pub fn error_payload(message: &str) -> Value {
    json!({ "message": message })
}

/// Wraps non-object payloads as `{value: ...}` so `event_data` is always a
/// JSON object on the wire, per §4.3's tolerant encoder. Constructing
/// `event_data` through `serde_json::Value` means serialization itself
/// cannot fail; a payload that somehow produces `Value::Null` still records
/// a diagnostic rather than silently dropping the event.
fn encode_payload(value: Value) -> Value {
    match value {
        Value::Object(_) => value,
        Value::Null => json!({ "diagnostic": "event payload could not be encoded" }),
        other => json!({ "value": other }),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingEvent {
    pub id: i64,
    pub streaming_session_id: String,
    pub event_type: String,
    pub event_data: Value,
    pub created_at: DateTime<Utc>,
}

struct EventRow {
    id: i64,
    streaming_session_id: String,
    event_type: String,
    event_data: String,
    created_at: i64,
}

impl<'r> FromRow<'r, sqlx::any::AnyRow> for EventRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            streaming_session_id: row.try_get("streaming_session_id")?,
            event_type: row.try_get("event_type")?,
            event_data: row.try_get("event_data")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl From<EventRow> for StreamingEvent {
    fn from(row: EventRow) -> Self {
        StreamingEvent {
            id: row.id,
            streaming_session_id: row.streaming_session_id,
            event_type: row.event_type,
            event_data: serde_json::from_str(&row.event_data)
                .unwrap_or_else(|_| json!({ "diagnostic": "event_data failed to deserialize" })),
            created_at: DateTime::from_timestamp(row.created_at, 0).unwrap_or_else(Utc::now),
        }
    }
}

/// Append-only, per-streaming-session ordered event sequence. The sole
/// transport between the upstream consumer and the browser poller.
#[derive(Clone)]
pub struct EventLog {
    pool: Pool<Any>,
}

impl EventLog {
    pub fn new(pool: Pool<Any>) -> Self {
        Self { pool }
    }

    pub async fn append(
        &self,
        streaming_session_id: &str,
        kind: EventKind,
        event_data: Value,
    ) -> Result<i64, CoreError> {
        let encoded = encode_payload(event_data);
        let now = Utc::now();
        // `AnyQueryResult::last_insert_id()` is unsupported for the `sqlite`
        // driver under `sqlx::Any` (always `None`), so the id comes back via
        // `RETURNING` instead — supported by both Postgres and SQLite.
        let row = sqlx::query(
            "INSERT INTO streaming_events (streaming_session_id, event_type, event_data, created_at) \
             VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(streaming_session_id)
        .bind(kind.as_str())
        .bind(encoded.to_string())
        .bind(now.timestamp())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    /// `since(streaming_session_id, last_event_id) -> events with id > last_event_id`,
    /// in append order. Repeated calls with increasing `last_event_id` see
    /// every event exactly once (§8 property 1).
    pub async fn since(
        &self,
        streaming_session_id: &str,
        last_event_id: i64,
    ) -> Result<Vec<StreamingEvent>, CoreError> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT id, streaming_session_id, event_type, event_data, created_at \
             FROM streaming_events WHERE streaming_session_id = $1 AND id > $2 ORDER BY id ASC",
        )
        .bind(streaming_session_id)
        .bind(last_event_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(StreamingEvent::from).collect())
    }

    /// Background maintenance: drop events older than the retention window.
    pub async fn purge(&self, older_than_seconds: i64) -> Result<u64, CoreError> {
        let cutoff = Utc::now().timestamp() - older_than_seconds;
        let result = sqlx::query("DELETE FROM streaming_events WHERE created_at < $1")
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
    async fn append_and_since_ordering() {
        let log = EventLog::new(test_pool().await);
        let sid = "stream-1";
        log.append(sid, EventKind::Start, start_payload()).await.unwrap();
        log.append(sid, EventKind::Token, token_payload("Hi", MarkerFlags::default()))
            .await
            .unwrap();
        let third = log
            .append(sid, EventKind::Token, token_payload(" there", MarkerFlags::default()))
            .await
            .unwrap();

        let all = log.since(sid, 0).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].event_type, "start");
        assert_eq!(all[2].event_type, "token");

        let tail = log.since(sid, third - 1).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].id, third);
    }

    #[tokio::test]
    async fn since_is_scoped_per_session() {
        let log = EventLog::new(test_pool().await);
        log.append("a", EventKind::Start, start_payload()).await.unwrap();
        log.append("b", EventKind::Start, start_payload()).await.unwrap();
        let events_a = log.since("a", 0).await.unwrap();
        assert_eq!(events_a.len(), 1);
    }

    #[tokio::test]
    async fn non_object_payload_is_wrapped() {
        let encoded = encode_payload(json!("plain-string"));
        assert_eq!(encoded, json!({ "value": "plain-string" }));
    }
}
