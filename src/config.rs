//! Runtime configuration from environment variables

use crate::strength::SelectionMethod;
use chrono::{FixedOffset, Offset, Utc};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

const DEFAULT_TICK_MINUTES: [u32; 6] = [5, 15, 25, 35, 45, 55];

/// Asia/Singapore, the clock the strength timestamps have always been written in
const DEFAULT_UTC_OFFSET_MINUTES: i32 = 8 * 60;

/// Configuration for the strength runtime and cache worker
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct StrengthConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Optional directory of extra `.sql` migrations
    pub schema_dir: Option<String>,

    /// Directory holding `chart_data.json` and `last_update.json`
    pub cache_dir: PathBuf,

    /// Asset every strength is measured against
    pub reference_asset: String,

    /// Category selection methods computed each tick
    pub methods: Vec<SelectionMethod>,

    /// Minutes past the hour at which ticks fire
    pub tick_minutes: Vec<u32>,

    /// Offset of the clock timestamps are written in
    pub utc_offset_minutes: i32,

    /// Cache refresh poll interval in milliseconds
    pub poll_interval_ms: u64,

    /// Drop cached points older than this many hours behind the cursor
    pub cache_retention_hours: Option<i64>,

    /// Run one tick immediately at startup
    pub run_on_start: bool,

    /// Run the cache refresh loop inside the strength runtime
    pub cache_refresh_enabled: bool,
}

impl StrengthConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `STRENGTH_DB_PATH` (default: strengthflow.db)
    /// - `STRENGTH_SCHEMA_DIR` (default: unset)
    /// - `STRENGTH_CACHE_DIR`, falling back to `CACHE_DIR` (default: static/cache)
    /// - `REFERENCE_ASSET` (default: BTC_1)
    /// - `STRENGTH_METHODS` (default: top_5,top_10,top_15,top_20,top_100_mc,top_200_mc)
    /// - `STRENGTH_TICK_MINUTES` (default: 5,15,25,35,45,55)
    /// - `STRENGTH_UTC_OFFSET_MINUTES` (default: 480)
    /// - `CACHE_POLL_INTERVAL_MS` (default: 1000)
    /// - `CACHE_RETENTION_HOURS` (default: unset, keep everything)
    /// - `STRENGTH_RUN_ON_START` (default: false)
    /// - `ENABLE_CACHE_REFRESH` (default: true)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let methods = lookup("STRENGTH_METHODS")
            .map(|s| parse_methods(&s))
            .filter(|m| !m.is_empty())
            .unwrap_or_else(SelectionMethod::defaults);

        let tick_minutes = lookup("STRENGTH_TICK_MINUTES")
            .map(|s| parse_minutes(&s))
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_TICK_MINUTES.to_vec());

        let utc_offset_minutes = parse_var(&lookup, "STRENGTH_UTC_OFFSET_MINUTES")
            .filter(|m: &i32| m.abs() < 24 * 60)
            .unwrap_or(DEFAULT_UTC_OFFSET_MINUTES);

        Self {
            db_path: lookup("STRENGTH_DB_PATH").unwrap_or_else(|| "strengthflow.db".to_string()),

            schema_dir: lookup("STRENGTH_SCHEMA_DIR").filter(|s| !s.trim().is_empty()),

            cache_dir: lookup("STRENGTH_CACHE_DIR")
                .or_else(|| lookup("CACHE_DIR"))
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("static/cache")),

            reference_asset: lookup("REFERENCE_ASSET").unwrap_or_else(|| "BTC_1".to_string()),

            methods,
            tick_minutes,
            utc_offset_minutes,

            poll_interval_ms: parse_var(&lookup, "CACHE_POLL_INTERVAL_MS")
                .filter(|ms: &u64| *ms > 0)
                .unwrap_or(1_000),

            cache_retention_hours: parse_var(&lookup, "CACHE_RETENTION_HOURS").filter(|h: &i64| *h > 0),

            run_on_start: parse_var(&lookup, "STRENGTH_RUN_ON_START").unwrap_or(false),

            cache_refresh_enabled: parse_var(&lookup, "ENABLE_CACHE_REFRESH").unwrap_or(true),
        }
    }

    /// Offset of the clock timestamps are written in
    pub fn timezone(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|s| s.trim().parse().ok())
}

/// Comma-separated method names; unknown entries are logged and skipped
fn parse_methods(raw: &str) -> Vec<SelectionMethod> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<SelectionMethod>() {
            Ok(method) => Some(method),
            Err(e) => {
                log::warn!("⚠️  Ignoring selection method: {}", e);
                None
            }
        })
        .collect()
}

/// Comma-separated minutes past the hour, sorted and deduplicated
fn parse_minutes(raw: &str) -> Vec<u32> {
    let mut minutes: Vec<u32> = raw
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .filter(|m| *m < 60)
        .collect();
    minutes.sort_unstable();
    minutes.dedup();
    minutes
}
