use sqlx::any::{Any, AnyPoolOptions};
use sqlx::Pool;
use tracing::info;

/// Builds the shared connection pool. Called once at startup, mirroring the
/// teacher's ambient-singleton-free redesign: the pool is constructed here
/// and handed to every component explicitly rather than created at module
/// load.
pub async fn connect_pool(database_url: &str, max_connections: u32) -> Result<Pool<Any>, sqlx::Error> {
    sqlx::any::install_default_drivers();
    let url = with_ssl_mode(database_url);
    let pool = AnyPoolOptions::new()
        .max_connections(max_connections)
        .connect(&url)
        .await?;
    info!("connected to database pool");
    Ok(pool)
}

pub async fn run_migrations(pool: &Pool<Any>) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Appends `sslmode=require` to a `postgresql://` URL unless its host is
/// `localhost`/`127.0.0.1`, per the "SSL-enabled pool except... localhost"
/// rule. Non-Postgres URLs (e.g. `sqlite::memory:`, used by tests) pass
/// through unchanged.
fn with_ssl_mode(database_url: &str) -> String {
    if !database_url.starts_with("postgres://") && !database_url.starts_with("postgresql://") {
        return database_url.to_string();
    }
    let is_local = database_url.contains("localhost") || database_url.contains("127.0.0.1");
    if is_local || database_url.contains("sslmode=") {
        return database_url.to_string();
    }
    let separator = if database_url.contains('?') { "&" } else { "?" };
    format!("{database_url}{separator}sslmode=require")
}

pub async fn is_reachable(pool: &Pool<Any>) -> bool {
    sqlx::query("SELECT 1").execute(pool).await.is_ok()
}
