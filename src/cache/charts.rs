//! Read-side views over the committed cache
//!
//! Windows are measured back from the cursor, not from the wall clock.

use super::merge::CacheData;
use super::store::{CacheError, ResultCache};
use chrono::{Duration, NaiveDateTime, Timelike};
use serde::Serialize;

/// Short (full 10-minute cadence) and long (hourly) chart windows
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartWindows {
    pub latest: NaiveDateTime,
    pub short: CacheData,
    pub long: CacheData,
}

/// Points at or after `latest - hours`
pub fn recent_window(data: &CacheData, latest: NaiveDateTime, hours: i64) -> CacheData {
    let cutoff = latest - Duration::hours(hours);
    data.filtered(|p| p.timestamp >= cutoff)
}

/// Top-of-hour points at or after `latest - hours`
pub fn hourly_window(data: &CacheData, latest: NaiveDateTime, hours: i64) -> CacheData {
    let cutoff = latest - Duration::hours(hours);
    data.filtered(|p| p.timestamp >= cutoff && p.timestamp.minute() == 0)
}

impl ResultCache {
    /// Both chart windows, `None` before the first commit
    pub fn get_cached_data_for_charts(
        &self,
        short_hours: i64,
        long_hours: i64,
    ) -> Result<Option<ChartWindows>, CacheError> {
        let Some((latest, data)) = self.read()? else {
            return Ok(None);
        };

        Ok(Some(ChartWindows {
            latest,
            short: recent_window(&data, latest, short_hours),
            long: hourly_window(&data, latest, long_hours),
        }))
    }

    /// The cache cut to the last `hours` (everything when `None`)
    pub fn get_cached_data_with_window(
        &self,
        hours: Option<i64>,
    ) -> Result<Option<CacheData>, CacheError> {
        let Some((latest, data)) = self.read()? else {
            return Ok(None);
        };

        Ok(Some(match hours {
            Some(hours) => recent_window(&data, latest, hours),
            None => data,
        }))
    }
}
