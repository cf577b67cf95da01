//! Cache Worker
//!
//! Standalone cache refresh loop for hosts that serve the charts but do not
//! run the strength scheduler. Polls the strength tables and keeps
//! `chart_data.json` / `last_update.json` current.
//!
//! Usage:
//!   cargo run --release --bin cache_worker
//!
//! Environment variables:
//!   STRENGTH_DB_PATH - SQLite database path (default: strengthflow.db)
//!   STRENGTH_CACHE_DIR / CACHE_DIR - cache directory (default: static/cache)
//!   CACHE_POLL_INTERVAL_MS - poll interval (default: 1000)
//!   CACHE_RETENTION_HOURS - optional retention behind the cursor

use dotenv::dotenv;
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;
use strengthflow::cache::{CacheRefresher, ResultCache};
use strengthflow::config::StrengthConfig;
use strengthflow::pipeline::{db::initialize_database, ShutdownToken, SqliteStrengthStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = StrengthConfig::from_env();

    info!("🚀 Cache Worker");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Cache dir: {}", config.cache_dir.display());
    match config.cache_retention_hours {
        Some(hours) => info!("   └─ Retention: {}h behind last data point", hours),
        None => info!("   └─ Retention: unbounded"),
    }

    initialize_database(&config.db_path, config.schema_dir.as_deref())?;
    let store = Arc::new(SqliteStrengthStore::new(&config.db_path)?);
    let cache = ResultCache::open(&config.cache_dir)?;

    let shutdown = ShutdownToken::new();
    let handle = CacheRefresher::new(
        store,
        cache,
        Duration::from_millis(config.poll_interval_ms),
        shutdown.clone(),
    )
    .with_retention_hours(config.cache_retention_hours)
    .spawn();

    info!("🔄 Press CTRL+C to shutdown gracefully");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("");
            info!("⚠️  Received CTRL+C, shutting down...");
        }
        Err(err) => {
            error!("❌ Failed to listen for CTRL+C: {}", err);
        }
    }

    shutdown.cancel();
    if let Err(e) = handle.await {
        error!("❌ Cache refresh task failed: {}", e);
    }

    info!("✅ Cache worker stopped");
    Ok(())
}
