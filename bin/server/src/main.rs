use anyhow::Result;
use chat_core::db;
use chat_core::ConversationCore;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod http;
use http::create_router;

static BACKEND_HOST: std::sync::LazyLock<String> =
    std::sync::LazyLock::new(|| std::env::var("BACKEND_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()));
static BACKEND_PORT: std::sync::LazyLock<String> =
    std::sync::LazyLock::new(|| std::env::var("BACKEND_PORT").unwrap_or_else(|_| "8080".to_string()));
static DATABASE_URL: std::sync::LazyLock<String> = std::sync::LazyLock::new(|| {
    std::env::var("DATABASE_URL").unwrap_or_else(|_| "postgresql://chatbot@localhost:5432/chatbot".to_string())
});
static UPSTREAM_BEARER_TOKEN: std::sync::LazyLock<Option<String>> =
    std::sync::LazyLock::new(|| std::env::var("UPSTREAM_BEARER_TOKEN").ok());

#[derive(Parser)]
#[command(name = "conversation-core")]
#[command(about = "Conversation processing core for the hosted chatbot platform")]
struct Cli {
    /// Skip running database migrations at startup (they are already applied)
    #[arg(long)]
    skip_migrations: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let pool = db::connect_pool(&DATABASE_URL, 10).await?;

    if !cli.skip_migrations {
        tracing::info!("running database migrations...");
        db::run_migrations(&pool).await?;
        tracing::info!("database migrations completed");
    }

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .connect_timeout(Duration::from_secs(10))
        .build()?;

    let core = Arc::new(ConversationCore::new(pool, http_client, UPSTREAM_BEARER_TOKEN.clone()));

    spawn_maintenance_task(Arc::clone(&core));

    let app = create_router(core).layer(build_cors_layer());

    let bind_addr = format!("{}:{}", &*BACKEND_HOST, &*BACKEND_PORT);
    tracing::info!(%bind_addr, "conversation core listening");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Background maintenance: 1h event purge / 24h session purge (§3).
fn spawn_maintenance_task(core: Arc<ConversationCore>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5 * 60));
        loop {
            interval.tick().await;
            let (events_purged, sessions_purged) = core.purge_expired().await;
            if events_purged > 0 || sessions_purged > 0 {
                tracing::info!(events_purged, sessions_purged, "maintenance purge completed");
            }
        }
    });
}

fn build_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}
