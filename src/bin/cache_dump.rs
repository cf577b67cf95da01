//! Cache Dump
//!
//! Prints the chart windows the frontend would render, as JSON on stdout.
//!
//! Usage:
//!   cargo run --bin cache_dump -- [short_hours] [long_hours]
//!   cargo run --bin cache_dump -- --window <hours>
//!
//! Defaults: 24h short window, 48h hourly window.

use dotenv::dotenv;
use log::{info, warn};
use std::env;
use strengthflow::cache::ResultCache;
use strengthflow::config::StrengthConfig;

const DEFAULT_SHORT_HOURS: i64 = 24;
const DEFAULT_LONG_HOURS: i64 = 48;

fn parse_hours(arg: Option<&String>, default: i64) -> Result<i64, Box<dyn std::error::Error>> {
    match arg {
        Some(raw) => Ok(raw.parse()?),
        None => Ok(default),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let config = StrengthConfig::from_env();
    let cache = ResultCache::new(&config.cache_dir);
    let args: Vec<String> = env::args().skip(1).collect();

    info!("📂 Reading cache from {}", config.cache_dir.display());

    let output = if args.first().map(String::as_str) == Some("--window") {
        let hours = args.get(1).map(|raw| raw.parse::<i64>()).transpose()?;
        cache
            .get_cached_data_with_window(hours)?
            .map(|data| serde_json::to_string_pretty(&data))
            .transpose()?
    } else {
        let short_hours = parse_hours(args.first(), DEFAULT_SHORT_HOURS)?;
        let long_hours = parse_hours(args.get(1), DEFAULT_LONG_HOURS)?;
        cache
            .get_cached_data_for_charts(short_hours, long_hours)?
            .map(|charts| serde_json::to_string_pretty(&charts))
            .transpose()?
    };

    match output {
        Some(json) => println!("{}", json),
        None => warn!("⚠️  No cache committed yet in {}", config.cache_dir.display()),
    }

    Ok(())
}
