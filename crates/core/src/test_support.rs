//! In-memory SQLite schema used by unit and integration tests. Kept
//! separate from `migrations/`, which targets Postgres in production —
//! mirroring the teacher's own `setup_test_store`/`setup_test_db` helpers,
//! which hand-roll an equivalent SQLite schema rather than replaying the
//! production migrations.
#![cfg(test)]

use sqlx::any::{Any, AnyPoolOptions};
use sqlx::Pool;

pub async fn test_pool() -> Pool<Any> {
    sqlx::any::install_default_drivers();
    // A bare `sqlite::memory:` database is private to the connection that
    // opened it: a pool handing out more than one connection would scatter
    // the schema across isolated, empty databases. Pin the pool to a single
    // connection so every query lands on the same in-memory database.
    let pool = AnyPoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite pool");

    for stmt in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        sqlx::query(stmt).execute(&pool).await.expect("apply test schema");
    }
    pool
}

pub async fn seed_settings(pool: &Pool<Any>, chatbot_id: &str, upstream_url: &str) {
    sqlx::query(
        "INSERT INTO chatbot_settings (chatbot_id, upstream_url, flow_keys, first_message, feature_flags, ui_labels) \
         VALUES ($1, $2, '{}', 'Hi! How can I help?', '{}', '{}')",
    )
    .bind(chatbot_id)
    .bind(upstream_url)
    .execute(pool)
    .await
    .expect("seed settings");
}

const SCHEMA: &str = "
CREATE TABLE chatbot_settings (
    chatbot_id TEXT PRIMARY KEY,
    upstream_url TEXT NOT NULL,
    flow_keys TEXT NOT NULL DEFAULT '{}',
    first_message TEXT,
    feature_flags TEXT NOT NULL DEFAULT '{}',
    ui_labels TEXT NOT NULL DEFAULT '{}',
    classification_url TEXT
);

CREATE TABLE conversation_sessions (
    session_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    chatbot_id TEXT NOT NULL,
    message_text TEXT NOT NULL,
    image_data TEXT,
    image_filename TEXT,
    image_mime TEXT,
    image_size INTEGER,
    image_is_file INTEGER NOT NULL DEFAULT 0,
    configuration TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE streaming_sessions (
    streaming_session_id TEXT PRIMARY KEY,
    conversation_session_id TEXT NOT NULL,
    upstream_url TEXT NOT NULL,
    status TEXT NOT NULL,
    final_result TEXT,
    error_message TEXT,
    created_at INTEGER NOT NULL,
    completed_at INTEGER
);

CREATE TABLE streaming_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    streaming_session_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    event_data TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE conversations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    chatbot_id TEXT NOT NULL,
    conversation_data TEXT NOT NULL,
    emne TEXT,
    score TEXT,
    customer_rating TEXT,
    lacking_info BOOLEAN,
    bug_status TEXT,
    purchase_tracking_enabled BOOLEAN,
    is_livechat BOOLEAN,
    fallback BOOLEAN,
    created_at INTEGER NOT NULL,
    UNIQUE (user_id, chatbot_id)
);

CREATE TABLE message_context_chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id INTEGER NOT NULL,
    message_index INTEGER NOT NULL,
    content TEXT NOT NULL,
    metadata TEXT,
    similarity_score REAL
)";
