//! JSON result cache consumed by the chart frontend

pub mod charts;
pub mod merge;
pub mod refresh;
pub mod store;

pub use charts::ChartWindows;
pub use merge::{CacheData, CachePoint};
pub use refresh::{CacheRefresher, RefreshOutcome};
pub use store::{CacheError, ResultCache};
