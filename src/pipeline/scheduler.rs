//! Scheduled strength calculation
//!
//! Ticks fire at fixed minutes past the hour (default :05, :15, ... :55 on
//! the configured clock). Each tick scores the 10-minute mark five minutes
//! earlier, so the price snapshot for that mark has had time to land.
//!
//! Tick phases:
//! 1. Collecting - reference series, token universe, selections, price windows
//! 2. Computing - per-token strengths and per (category, method) aggregates
//! 3. Persisting - every sample in one store transaction

use super::db::{PriceSeriesStore, StoreError, StrengthStore, TokenUniverse};
use super::shutdown::ShutdownToken;
use super::types::{StrengthSample, TokenInfo, PRICE_CADENCE_MINUTES};
use crate::config::StrengthConfig;
use crate::strength::{aggregate, compute_strength, SelectionMethod, LOOKBACK_PERIODS};
use chrono::{Duration, FixedOffset, NaiveDateTime, Timelike, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Minutes between a tick firing and the price mark it scores
const TICK_LAG_MINUTES: i64 = 5;

const INSUFFICIENT_PRICE_DATA: &str = "insufficient price data";

#[derive(Debug, thiserror::Error)]
pub enum TickError {
    #[error("Reference series {asset_id} incomplete at {timestamp}")]
    MissingReference {
        asset_id: String,
        timestamp: NaiveDateTime,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Previous tick still running")]
    Overlap,

    #[error("Shutdown requested")]
    Cancelled,
}

/// A subject that got a null strength, and why
#[derive(Debug, Clone, PartialEq)]
pub struct TickFailure {
    pub subject: String,
    pub reason: String,
}

/// Summary of a committed tick
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub timestamp: NaiveDateTime,
    pub tokens_scored: usize,
    pub tokens_total: usize,
    pub categories_scored: usize,
    pub categories_total: usize,
    pub samples_written: usize,
    pub failures: Vec<TickFailure>,
}

/// The 10-minute mark scored by a tick firing at `tick`
pub fn calculation_timestamp(tick: NaiveDateTime) -> NaiveDateTime {
    let lagged = tick - Duration::minutes(TICK_LAG_MINUTES);
    let floored_minute = lagged.minute() - lagged.minute() % PRICE_CADENCE_MINUTES as u32;
    lagged
        .date()
        .and_hms_opt(lagged.hour(), floored_minute, 0)
        .unwrap_or(lagged)
}

/// First instant strictly after `now` whose minute is in `minutes`
pub fn next_tick(now: NaiveDateTime, minutes: &[u32]) -> NaiveDateTime {
    let hour_start = now
        .date()
        .and_hms_opt(now.hour(), 0, 0)
        .unwrap_or(now);

    (0..=1)
        .flat_map(|h| {
            minutes
                .iter()
                .map(move |m| hour_start + Duration::hours(h) + Duration::minutes(*m as i64))
        })
        .filter(|candidate| *candidate > now)
        .min()
        .unwrap_or(hour_start + Duration::hours(1))
}

/// Clears the in-flight flag when the tick ends, however it ends
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs strength ticks on schedule until stopped
#[derive(Clone)]
pub struct StrengthScheduler {
    prices: Arc<dyn PriceSeriesStore>,
    universe: Arc<dyn TokenUniverse>,
    store: Arc<dyn StrengthStore>,
    reference_asset: String,
    methods: Vec<SelectionMethod>,
    tick_minutes: Vec<u32>,
    timezone: FixedOffset,
    run_on_start: bool,
    in_flight: Arc<AtomicBool>,
    shutdown: ShutdownToken,
}

impl StrengthScheduler {
    pub fn new(
        prices: Arc<dyn PriceSeriesStore>,
        universe: Arc<dyn TokenUniverse>,
        store: Arc<dyn StrengthStore>,
        config: &StrengthConfig,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            prices,
            universe,
            store,
            reference_asset: config.reference_asset.clone(),
            methods: config.methods.clone(),
            tick_minutes: config.tick_minutes.clone(),
            timezone: config.timezone(),
            run_on_start: config.run_on_start,
            in_flight: Arc::new(AtomicBool::new(false)),
            shutdown,
        }
    }

    /// Spawn the schedule loop
    pub fn start(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.run().await })
    }

    /// Request the loop to stop; a tick in progress finishes its current phase
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    fn local_now(&self) -> NaiveDateTime {
        Utc::now().with_timezone(&self.timezone).naive_local()
    }

    async fn run(&self) {
        log::info!("⏰ Strength scheduler started");
        log::info!("   ├─ Reference: {}", self.reference_asset);
        log::info!(
            "   ├─ Methods: {}",
            self.methods.iter().map(|m| m.name()).collect::<Vec<_>>().join(", ")
        );
        log::info!("   └─ Tick minutes: {:?} (UTC{})", self.tick_minutes, self.timezone);

        if self.run_on_start {
            log::info!("🚀 Running initial strength tick");
            self.run_tick_logged(self.local_now()).await;
        }

        while !self.shutdown.is_cancelled() {
            let now = self.local_now();
            let next = next_tick(now, &self.tick_minutes);
            log::info!("⏭️  Next strength run at {}", next);

            let wait = (next - now).to_std().unwrap_or_default();
            if !self.shutdown.sleep(wait).await {
                break;
            }

            self.run_tick_logged(next).await;
        }

        log::info!("🛑 Strength scheduler stopped");
    }

    async fn run_tick_logged(&self, tick: NaiveDateTime) {
        match self.run_tick(tick).await {
            Ok(_) => {}
            Err(TickError::Overlap) => {
                log::warn!("⚠️  Skipping tick at {}: previous tick still running", tick);
            }
            Err(TickError::Cancelled) => {
                log::info!("🛑 Tick at {} abandoned for shutdown, nothing written", tick);
            }
            Err(e) => {
                log::error!("❌ Strength tick at {} failed: {}", tick, e);
            }
        }
    }

    /// Run one tick for the schedule instant `tick` (local clock)
    ///
    /// Nothing is written unless the whole tick reaches Persisting.
    pub async fn run_tick(&self, tick: NaiveDateTime) -> Result<TickReport, TickError> {
        let _in_flight = InFlight::acquire(&self.in_flight).ok_or(TickError::Overlap)?;

        let timestamp = calculation_timestamp(tick);
        let date = timestamp.date();
        log::info!("📊 Strength tick {} (scoring {})", tick, timestamp);

        // Collecting
        let reference = self
            .prices
            .price_series(&self.reference_asset, timestamp, LOOKBACK_PERIODS)
            .await?
            .ok_or_else(|| TickError::MissingReference {
                asset_id: self.reference_asset.clone(),
                timestamp,
            })?;

        // The reference can still be a category member, so contributor
        // lookups use the whole listing
        let universe = self.universe.tokens().await?;
        let tokens: Vec<&TokenInfo> = universe
            .iter()
            .filter(|t| t.asset_id != self.reference_asset)
            .collect();

        let widest_market_cap = self
            .methods
            .iter()
            .filter_map(|m| match m {
                SelectionMethod::MarketCapTop(limit) => Some(*limit),
                SelectionMethod::CategoryTop(_) => None,
            })
            .max();
        let leaders = match widest_market_cap {
            Some(limit) => self.universe.market_cap_leaders(date, limit).await?,
            None => Vec::new(),
        };

        let categories = self.universe.categories(date).await?;
        let mut selections = Vec::with_capacity(categories.len() * self.methods.len());
        for category in &categories {
            let members = self.universe.category_members(category, date, None).await?;
            for method in &self.methods {
                selections.push((category.clone(), *method, method.select(&members, &leaders)));
            }
        }

        let wanted: BTreeSet<String> = tokens
            .iter()
            .map(|t| t.asset_id.clone())
            .chain(selections.iter().flat_map(|(_, _, s)| s.iter().cloned()))
            .collect();
        let wanted: Vec<String> = wanted.into_iter().collect();
        let windows = self
            .prices
            .price_window(&wanted, timestamp, LOOKBACK_PERIODS)
            .await?;

        log::debug!(
            "   ├─ Collected {} tokens, {} categories, {} complete windows",
            tokens.len(),
            categories.len(),
            windows.len()
        );

        if self.shutdown.is_cancelled() {
            return Err(TickError::Cancelled);
        }

        // Computing
        let mut samples = Vec::with_capacity(tokens.len() + selections.len());
        let mut failures = Vec::new();

        let mut tokens_scored = 0;
        for &token in &tokens {
            let strength = windows
                .get(&token.asset_id)
                .and_then(|series| compute_strength(series, &reference));
            match strength {
                Some(_) => tokens_scored += 1,
                None => failures.push(TickFailure {
                    subject: token.asset_id.clone(),
                    reason: INSUFFICIENT_PRICE_DATA.to_string(),
                }),
            }
            samples.push(StrengthSample::token(timestamp, token.clone(), strength));
        }

        let info_by_id: HashMap<&str, &TokenInfo> =
            universe.iter().map(|t| (t.asset_id.as_str(), t)).collect();

        let categories_total = selections.len();
        let mut categories_scored = 0;
        for (category, method, selection) in selections {
            let subject = format!("{} ({})", category, method);

            if selection.is_empty() {
                failures.push(TickFailure {
                    subject,
                    reason: method.empty_reason(),
                });
                samples.push(StrengthSample::category(timestamp, category, method, Vec::new(), None));
                continue;
            }

            let result = aggregate(&reference, &windows, &selection);
            for failed in &result.failed {
                log::debug!("   ├─ {}: no strength for {}", subject, failed);
            }

            if result.is_defined() {
                categories_scored += 1;
            } else {
                failures.push(TickFailure {
                    subject,
                    reason: INSUFFICIENT_PRICE_DATA.to_string(),
                });
            }

            let contributors = result
                .contributors
                .iter()
                .filter_map(|id| info_by_id.get(id.as_str()).map(|info| (*info).clone()))
                .collect();
            samples.push(StrengthSample::category(
                timestamp,
                category,
                method,
                contributors,
                result.score,
            ));
        }

        if self.shutdown.is_cancelled() {
            return Err(TickError::Cancelled);
        }

        // Persisting
        let samples_written = self.store.write_batch(&samples).await?;

        let report = TickReport {
            timestamp,
            tokens_scored,
            tokens_total: tokens.len(),
            categories_scored,
            categories_total,
            samples_written,
            failures,
        };
        log_report(&report);
        Ok(report)
    }
}

fn log_report(report: &TickReport) {
    log::info!("✅ Strength tick {} committed", report.timestamp);
    log::info!(
        "   ├─ Tokens: {}/{} scored",
        report.tokens_scored,
        report.tokens_total
    );
    log::info!(
        "   ├─ Categories: {}/{} scored",
        report.categories_scored,
        report.categories_total
    );
    log::info!("   └─ Samples written: {}", report.samples_written);

    if report.failures.is_empty() {
        return;
    }

    log::warn!("⚠️  {} subjects without a strength:", report.failures.len());
    let last = report.failures.len() - 1;
    for (i, failure) in report.failures.iter().enumerate() {
        let branch = if i == last { "└─" } else { "├─" };
        log::warn!("   {} {}: {}", branch, failure.subject, failure.reason);
    }
}
