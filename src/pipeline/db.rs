//! SQLite storage for price series, token universe, and strength results
//!
//! Traits sit at the seams the pipeline depends on:
//! - `PriceSeriesStore` - read-only price windows (populated by ingestion)
//! - `TokenUniverse` - token listing, categories, and daily rankings
//! - `StrengthStore` - append-only strength results, read back by the cache
//!
//! Tables (see `sql/`):
//! - `prices` - one row per (timestamp, asset_id)
//! - `tokens`, `category_ranks`, `market_cap_ranks`
//! - `category_strength` - INSERT per (tick, category, method)
//! - `token_strength` - INSERT per (tick, token)

use super::types::{
    window_timestamps, PricePoint, StrengthRow, StrengthSample, Subject, TokenInfo, TOKEN_SECTION,
};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Embedded schema, applied in order
const SCHEMA: &[(&str, &str)] = &[
    ("00_price_series.sql", include_str!("../../sql/00_price_series.sql")),
    ("01_token_universe.sql", include_str!("../../sql/01_token_universe.sql")),
    ("02_strength.sql", include_str!("../../sql/02_strength.sql")),
];

/// How long a connection waits on a locked database before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Schema directory not found: {0}")]
    SchemaDirMissing(String),

    #[error("Database connection lock poisoned")]
    LockPoisoned,
}

/// Read access to fixed-cadence price snapshots
#[async_trait]
pub trait PriceSeriesStore: Send + Sync {
    /// Prices for `asset_id` at the `periods` snapshots ending at `end`, oldest first
    ///
    /// Returns `None` unless every snapshot in the window exists with a price.
    async fn price_series(
        &self,
        asset_id: &str,
        end: NaiveDateTime,
        periods: usize,
    ) -> Result<Option<Vec<Decimal>>, StoreError>;

    /// Complete windows for many assets at once
    ///
    /// Assets without a complete window are absent from the result.
    async fn price_window(
        &self,
        asset_ids: &[String],
        end: NaiveDateTime,
        periods: usize,
    ) -> Result<HashMap<String, Vec<Decimal>>, StoreError> {
        let mut windows = HashMap::with_capacity(asset_ids.len());
        for asset_id in asset_ids {
            if let Some(series) = self.price_series(asset_id, end, periods).await? {
                windows.insert(asset_id.clone(), series);
            }
        }
        Ok(windows)
    }
}

/// Token listing and rank data used to build selections
#[async_trait]
pub trait TokenUniverse: Send + Sync {
    /// All listed tokens
    async fn tokens(&self) -> Result<Vec<TokenInfo>, StoreError>;

    /// Categories ranked on `date`
    async fn categories(&self, date: NaiveDate) -> Result<Vec<String>, StoreError>;

    /// Category members on `date` ordered by category rank, optionally cut to `limit`
    async fn category_members(
        &self,
        category: &str,
        date: NaiveDate,
        limit: Option<usize>,
    ) -> Result<Vec<String>, StoreError>;

    /// Top `limit` assets by market-cap rank on `date`
    async fn market_cap_leaders(
        &self,
        date: NaiveDate,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;
}

/// Append-only strength results
#[async_trait]
pub trait StrengthStore: Send + Sync {
    /// Write all samples of one tick in a single transaction
    ///
    /// Either every sample is stored or none is.
    async fn write_batch(&self, samples: &[StrengthSample]) -> Result<usize, StoreError>;

    /// Newest result timestamp, `None` when the store is empty
    async fn latest_timestamp(&self) -> Result<Option<NaiveDateTime>, StoreError>;

    /// Every stored result strictly newer than `since` (all results if `None`),
    /// ordered by timestamp
    async fn samples_since(
        &self,
        since: Option<NaiveDateTime>,
    ) -> Result<Vec<StrengthRow>, StoreError>;
}

/// Open a connection with WAL journaling and a busy timeout
pub fn open_connection(db_path: impl AsRef<Path>) -> Result<Connection, StoreError> {
    let conn = Connection::open(db_path)?;
    // journal_mode reports the resulting mode as a row
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

/// Apply the embedded schema (idempotent, every statement uses IF NOT EXISTS)
pub fn apply_schema(conn: &Connection) -> Result<(), StoreError> {
    log::info!("🔧 Applying embedded schema");
    for (name, sql) in SCHEMA {
        conn.execute_batch(sql)?;
        log::debug!("   ├─ ✅ {}", name);
    }
    log::info!("   └─ ✅ {} schema files applied", SCHEMA.len());
    Ok(())
}

/// Run extra migrations from a directory of `.sql` files
///
/// Files run in file-name order (`00_`, `01_`, ...) and must be idempotent.
pub fn run_schema_migrations(conn: &Connection, schema_dir: &str) -> Result<(), StoreError> {
    let schema_path = Path::new(schema_dir);

    if !schema_path.exists() {
        return Err(StoreError::SchemaDirMissing(schema_dir.to_string()));
    }

    let mut sql_files: Vec<_> = fs::read_dir(schema_path)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("sql"))
        .collect();

    sql_files.sort_by_key(|entry| entry.file_name());

    log::info!("🔧 Running schema migrations from: {}", schema_dir);

    for entry in sql_files {
        let path = entry.path();
        let filename = entry.file_name().to_string_lossy().into_owned();

        log::info!("   ├─ Executing: {}", filename);
        let sql_content = fs::read_to_string(&path)?;
        conn.execute_batch(&sql_content)?;
    }

    log::info!("✅ All schema migrations completed successfully");
    Ok(())
}

/// Create or upgrade the database at `db_path`
///
/// Applies the embedded schema, then any extra migrations in `schema_dir`.
pub fn initialize_database(
    db_path: impl AsRef<Path>,
    schema_dir: Option<&str>,
) -> Result<(), StoreError> {
    let conn = open_connection(db_path)?;
    apply_schema(&conn)?;
    if let Some(dir) = schema_dir {
        run_schema_migrations(&conn, dir)?;
    }
    Ok(())
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, StoreError> {
    conn.lock().map_err(|_| StoreError::LockPoisoned)
}

/// Stored REAL → exact decimal (via its shortest decimal representation)
///
/// Negative and non-finite prices are treated as missing.
fn decimal_from_price(value: f64) -> Option<Decimal> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Decimal::from_str(&value.to_string()).ok()
}

/// Assemble a complete window from (timestamp, price) rows
fn assemble_series(
    window: &[NaiveDateTime],
    rows: &BTreeMap<NaiveDateTime, Option<Decimal>>,
) -> Option<Vec<Decimal>> {
    window
        .iter()
        .map(|ts| rows.get(ts).copied().flatten())
        .collect()
}

/// SQLite-backed price series and token universe
pub struct SqlitePriceStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePriceStore {
    /// Open the store (schema must already be applied)
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self::from_connection(open_connection(db_path)?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Insert price snapshots (ingestion side and fixtures)
    pub fn insert_prices(&self, points: &[PricePoint]) -> Result<usize, StoreError> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO prices (timestamp, asset_id, price) VALUES (?1, ?2, ?3)",
            )?;
            for point in points {
                let price = point.price.and_then(|p| p.to_f64());
                stmt.execute(params![point.timestamp, point.asset_id, price])?;
            }
        }
        tx.commit()?;
        Ok(points.len())
    }

    pub fn insert_token(&self, token: &TokenInfo) -> Result<(), StoreError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT OR REPLACE INTO tokens (asset_id, symbol, name) VALUES (?1, ?2, ?3)",
            params![token.asset_id, token.symbol, token.name],
        )?;
        Ok(())
    }

    pub fn insert_category_rank(
        &self,
        date: NaiveDate,
        category: &str,
        asset_id: &str,
        rank: i64,
    ) -> Result<(), StoreError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT OR REPLACE INTO category_ranks (date, category, asset_id, rank)
             VALUES (?1, ?2, ?3, ?4)",
            params![date, category, asset_id, rank],
        )?;
        Ok(())
    }

    pub fn insert_market_cap_rank(
        &self,
        date: NaiveDate,
        asset_id: &str,
        market_cap_rank: i64,
    ) -> Result<(), StoreError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT OR REPLACE INTO market_cap_ranks (date, asset_id, market_cap_rank)
             VALUES (?1, ?2, ?3)",
            params![date, asset_id, market_cap_rank],
        )?;
        Ok(())
    }
}

#[async_trait]
impl PriceSeriesStore for SqlitePriceStore {
    async fn price_series(
        &self,
        asset_id: &str,
        end: NaiveDateTime,
        periods: usize,
    ) -> Result<Option<Vec<Decimal>>, StoreError> {
        let window = window_timestamps(end, periods);
        let Some(start) = window.first().copied() else {
            return Ok(None);
        };

        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT timestamp, price FROM prices
             WHERE asset_id = ?1 AND timestamp >= ?2 AND timestamp <= ?3
             ORDER BY timestamp",
        )?;

        let rows = stmt
            .query_map(params![asset_id, start, end], |row| {
                Ok((row.get::<_, NaiveDateTime>(0)?, row.get::<_, Option<f64>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let by_timestamp: BTreeMap<_, _> = rows
            .into_iter()
            .map(|(ts, price)| (ts, price.and_then(decimal_from_price)))
            .collect();

        Ok(assemble_series(&window, &by_timestamp))
    }

    /// Single query over the window's timestamps for every asset
    async fn price_window(
        &self,
        asset_ids: &[String],
        end: NaiveDateTime,
        periods: usize,
    ) -> Result<HashMap<String, Vec<Decimal>>, StoreError> {
        let window = window_timestamps(end, periods);
        if window.is_empty() || asset_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let wanted: HashSet<&str> = asset_ids.iter().map(String::as_str).collect();
        let placeholders = vec!["?"; window.len()].join(",");
        let query = format!(
            "SELECT asset_id, timestamp, price FROM prices WHERE timestamp IN ({})",
            placeholders
        );

        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(params_from_iter(window.iter()), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, NaiveDateTime>(1)?,
                row.get::<_, Option<f64>>(2)?,
            ))
        })?;

        let mut by_asset: HashMap<String, BTreeMap<NaiveDateTime, Option<Decimal>>> =
            HashMap::new();
        for row in rows {
            let (asset_id, ts, price) = row?;
            if !wanted.contains(asset_id.as_str()) {
                continue;
            }
            by_asset
                .entry(asset_id)
                .or_default()
                .insert(ts, price.and_then(decimal_from_price));
        }

        Ok(by_asset
            .into_iter()
            .filter_map(|(asset_id, rows)| {
                assemble_series(&window, &rows).map(|series| (asset_id, series))
            })
            .collect())
    }
}

#[async_trait]
impl TokenUniverse for SqlitePriceStore {
    async fn tokens(&self) -> Result<Vec<TokenInfo>, StoreError> {
        let conn = lock(&self.conn)?;
        let mut stmt =
            conn.prepare("SELECT asset_id, symbol, name FROM tokens ORDER BY asset_id")?;
        let tokens = stmt
            .query_map([], |row| {
                Ok(TokenInfo {
                    asset_id: row.get(0)?,
                    symbol: row.get(1)?,
                    name: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tokens)
    }

    async fn categories(&self, date: NaiveDate) -> Result<Vec<String>, StoreError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT category FROM category_ranks WHERE date = ?1 ORDER BY category",
        )?;
        let categories = stmt
            .query_map([date], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(categories)
    }

    async fn category_members(
        &self,
        category: &str,
        date: NaiveDate,
        limit: Option<usize>,
    ) -> Result<Vec<String>, StoreError> {
        // SQLite treats a negative LIMIT as "no limit"
        let limit = limit.map(|l| l as i64).unwrap_or(-1);

        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT c.asset_id
             FROM category_ranks c
             JOIN tokens t ON t.asset_id = c.asset_id
             WHERE c.category = ?1 AND c.date = ?2
             ORDER BY c.rank
             LIMIT ?3",
        )?;
        let members = stmt
            .query_map(params![category, date, limit], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(members)
    }

    async fn market_cap_leaders(
        &self,
        date: NaiveDate,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT m.asset_id
             FROM market_cap_ranks m
             JOIN tokens t ON t.asset_id = m.asset_id
             WHERE m.date = ?1
             ORDER BY m.market_cap_rank
             LIMIT ?2",
        )?;
        let leaders = stmt
            .query_map(params![date, limit as i64], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(leaders)
    }
}

/// SQLite implementation of StrengthStore
pub struct SqliteStrengthStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStrengthStore {
    /// Open the store (schema must already be applied)
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self::from_connection(open_connection(db_path)?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }
}

#[async_trait]
impl StrengthStore for SqliteStrengthStore {
    async fn write_batch(&self, samples: &[StrengthSample]) -> Result<usize, StoreError> {
        let mut conn = lock(&self.conn)?;

        // Dropping the transaction without commit rolls back every insert
        let tx = conn.transaction()?;
        {
            let mut category_stmt = tx.prepare(
                "INSERT INTO category_strength
                    (timestamp, category, calculation_type, strength_ratio, token_info)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            let mut token_stmt = tx.prepare(
                "INSERT INTO token_strength (timestamp, asset_id, symbol, name, strength)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;

            for sample in samples {
                match &sample.subject {
                    Subject::Category {
                        category,
                        method,
                        contributors,
                    } => {
                        let token_info = serde_json::to_string(contributors)?;
                        category_stmt.execute(params![
                            sample.timestamp,
                            category,
                            method.name(),
                            sample.strength,
                            token_info,
                        ])?;
                    }
                    Subject::Token(token) => {
                        token_stmt.execute(params![
                            sample.timestamp,
                            token.asset_id,
                            token.symbol,
                            token.name,
                            sample.strength,
                        ])?;
                    }
                }
            }
        }
        tx.commit()?;

        Ok(samples.len())
    }

    async fn latest_timestamp(&self) -> Result<Option<NaiveDateTime>, StoreError> {
        let conn = lock(&self.conn)?;
        let latest = conn
            .query_row(
                "SELECT MAX(ts) FROM (
                    SELECT MAX(timestamp) AS ts FROM category_strength
                    UNION ALL
                    SELECT MAX(timestamp) AS ts FROM token_strength
                 )",
                [],
                |row| row.get::<_, Option<NaiveDateTime>>(0),
            )
            .optional()?
            .flatten();
        Ok(latest)
    }

    async fn samples_since(
        &self,
        since: Option<NaiveDateTime>,
    ) -> Result<Vec<StrengthRow>, StoreError> {
        let mut conn = lock(&self.conn)?;

        // Both tables from one snapshot, so a tick committed between the two
        // reads cannot show up in one table only
        let tx = conn.transaction()?;
        let mut rows = Vec::new();

        let mut stmt = tx.prepare(
            "SELECT timestamp, calculation_type, category, strength_ratio
             FROM category_strength
             WHERE ?1 IS NULL OR timestamp > ?1
             ORDER BY timestamp ASC, id ASC",
        )?;
        let category_rows = stmt.query_map([since], |row| {
            Ok(StrengthRow {
                timestamp: row.get(0)?,
                section: row.get(1)?,
                key: row.get(2)?,
                strength: row.get(3)?,
            })
        })?;
        for row in category_rows {
            rows.push(row?);
        }
        drop(stmt);

        let mut stmt = tx.prepare(
            "SELECT timestamp, asset_id, strength
             FROM token_strength
             WHERE ?1 IS NULL OR timestamp > ?1
             ORDER BY timestamp ASC, id ASC",
        )?;
        let token_rows = stmt.query_map([since], |row| {
            Ok(StrengthRow {
                timestamp: row.get(0)?,
                section: TOKEN_SECTION.to_string(),
                key: row.get(1)?,
                strength: row.get(2)?,
            })
        })?;
        for row in token_rows {
            rows.push(row?);
        }
        drop(stmt);
        tx.commit()?;

        Ok(rows)
    }
}
