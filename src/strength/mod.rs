//! Relative strength computation
//!
//! - `calculator` - per-subject strength against the reference asset
//! - `aggregator` - category score as the mean of valid subject strengths
//! - `selection` - rank-based selection methods (`top_N`, `top_M_mc`)

pub mod aggregator;
pub mod calculator;
pub mod selection;

pub use aggregator::{aggregate, CategoryAggregate};
pub use calculator::{compute_strength, LOOKBACK_PERIODS};
pub use selection::SelectionMethod;
