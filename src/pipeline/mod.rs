//! # Strength Pipeline
//!
//! Scheduled relative-strength calculation over fixed-cadence price snapshots.
//!
//! ## Flow
//!
//! 1. Ingestion (external) writes 10-minute price snapshots and daily ranks
//! 2. `StrengthScheduler` fires at :05, :15, ... :55 and scores the previous
//!    10-minute mark for every token and every (category, method) pair
//! 3. All samples of a tick are appended to the strength tables in one
//!    transaction
//! 4. The cache refresh loop (`crate::cache`) picks up committed rows
//!
//! ## Module Organization
//!
//! - `types` - Core records (PricePoint, StrengthSample, StrengthRow)
//! - `db` - Store traits and their SQLite implementations
//! - `scheduler` - Tick timing and orchestration
//! - `shutdown` - Cooperative shutdown token

pub mod db;
pub mod scheduler;
pub mod shutdown;
pub mod types;

// Re-export commonly used types
pub use db::{
    PriceSeriesStore, SqlitePriceStore, SqliteStrengthStore, StoreError, StrengthStore,
    TokenUniverse,
};
pub use scheduler::{StrengthScheduler, TickError, TickReport};
pub use shutdown::ShutdownToken;
pub use types::{PricePoint, StrengthRow, StrengthSample, Subject, TokenInfo};
