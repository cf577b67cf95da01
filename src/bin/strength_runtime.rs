//! Strength Runtime
//!
//! Runs the scheduled strength calculation and, unless disabled, the cache
//! refresh loop in the same process:
//! - Initializes SQLite database with schema
//! - Spawns the strength scheduler (ticks at :05, :15, ... :55)
//! - Spawns the cache refresh loop
//! - Stops both cleanly on CTRL+C
//!
//! Usage:
//!   cargo run --release --bin strength_runtime
//!
//! Environment variables: see `StrengthConfig::from_env`

use dotenv::dotenv;
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;
use strengthflow::cache::{CacheRefresher, ResultCache};
use strengthflow::config::StrengthConfig;
use strengthflow::pipeline::{
    db::initialize_database, ShutdownToken, SqlitePriceStore, SqliteStrengthStore,
    StrengthScheduler, StrengthStore,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize environment and logging
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("🚀 Strength Runtime");
    info!("   ├─ Version: {}", env!("CARGO_PKG_VERSION"));
    info!("   └─ Mode: scheduled ticks + cache refresh");

    let config = StrengthConfig::from_env();

    info!("✅ Configuration loaded");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Reference asset: {}", config.reference_asset);
    info!("   ├─ Cache dir: {}", config.cache_dir.display());
    info!("   ├─ UTC offset: {} minutes", config.utc_offset_minutes);
    info!(
        "   └─ Cache refresh: {}",
        if config.cache_refresh_enabled { "in-process" } else { "disabled" }
    );

    // Initialize database (idempotent)
    info!("🔧 Initializing database...");
    initialize_database(&config.db_path, config.schema_dir.as_deref())?;

    let prices = Arc::new(SqlitePriceStore::new(&config.db_path)?);
    let strengths: Arc<dyn StrengthStore> = Arc::new(SqliteStrengthStore::new(&config.db_path)?);
    info!("✅ Database initialized");

    let shutdown = ShutdownToken::new();

    let scheduler = StrengthScheduler::new(
        prices.clone(),
        prices,
        strengths.clone(),
        &config,
        shutdown.clone(),
    );
    let scheduler_handle = scheduler.start();
    info!("   ├─ ✅ Strength scheduler spawned");

    let refresh_handle = if config.cache_refresh_enabled {
        let cache = ResultCache::open(&config.cache_dir)?;
        let refresher = CacheRefresher::new(
            strengths,
            cache,
            Duration::from_millis(config.poll_interval_ms),
            shutdown.clone(),
        )
        .with_retention_hours(config.cache_retention_hours);
        info!("   └─ ✅ Cache refresh loop spawned");
        Some(refresher.spawn())
    } else {
        info!("   └─ ⚠️  Cache refresh disabled (ENABLE_CACHE_REFRESH=false)");
        None
    };

    info!("");
    info!("🔄 Press CTRL+C to shutdown gracefully");

    // Wait for CTRL+C
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("");
            info!("⚠️  Received CTRL+C, shutting down...");
        }
        Err(err) => {
            error!("❌ Failed to listen for CTRL+C: {}", err);
        }
    }

    scheduler.stop();

    if let Err(e) = scheduler_handle.await {
        error!("❌ Strength scheduler task failed: {}", e);
    }
    if let Some(handle) = refresh_handle {
        if let Err(e) = handle.await {
            error!("❌ Cache refresh task failed: {}", e);
        }
    }

    info!("✅ Strength runtime stopped");
    Ok(())
}
