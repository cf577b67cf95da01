//! Typed cache contents and the idempotent merge
//!
//! Layout on disk (`chart_data.json`):
//! ```json
//! { "top_5": { "DeFi": [ { "timestamp": "2025-03-01T12:00:00", "strength": 1.02 } ] },
//!   "tokens": { "ETH_1027": [ ... ] } }
//! ```

use crate::pipeline::types::StrengthRow;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Deduplicating accumulator: section → subject → timestamp → strength
type Grouped = BTreeMap<String, BTreeMap<String, BTreeMap<NaiveDateTime, Option<f64>>>>;

/// One point of a cached strength series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CachePoint {
    pub timestamp: NaiveDateTime,
    /// `null` when the strength could not be computed for that tick
    pub strength: Option<f64>,
}

/// Section (selection method or `tokens`) → subject → ascending series
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheData {
    sections: BTreeMap<String, BTreeMap<String, Vec<CachePoint>>>,
}

impl CacheData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group stored rows into a batch, each series sorted and deduplicated
    pub fn from_rows(rows: &[StrengthRow]) -> Self {
        let mut grouped = Grouped::new();

        for row in rows {
            grouped
                .entry(row.section.clone())
                .or_default()
                .entry(row.key.clone())
                .or_default()
                .insert(row.timestamp, row.strength);
        }

        from_grouped(grouped)
    }

    /// Append a point without ordering (fixtures and tests)
    pub fn push(&mut self, section: &str, key: &str, point: CachePoint) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .entry(key.to_string())
            .or_default()
            .push(point);
    }

    pub fn series(&self, section: &str, key: &str) -> Option<&[CachePoint]> {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .map(Vec::as_slice)
    }

    pub fn section(&self, section: &str) -> Option<&BTreeMap<String, Vec<CachePoint>>> {
        self.sections.get(section)
    }

    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(String::as_str)
    }

    pub fn point_count(&self) -> usize {
        self.sections
            .values()
            .flat_map(|s| s.values())
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.point_count() == 0
    }

    /// Newest timestamp over every series
    pub fn max_timestamp(&self) -> Option<NaiveDateTime> {
        self.sections
            .values()
            .flat_map(|s| s.values())
            .flat_map(|points| points.iter().map(|p| p.timestamp))
            .max()
    }

    /// Union of `self` and `batch` per (section, subject)
    ///
    /// Points sharing a timestamp keep the batch's value; every series comes
    /// back sorted ascending. Merging the same batch twice is a no-op.
    pub fn merge(&self, batch: &CacheData) -> CacheData {
        let mut merged = Grouped::new();

        for source in [self, batch] {
            for (section, series) in &source.sections {
                let target = merged.entry(section.clone()).or_default();
                for (key, points) in series {
                    let by_ts = target.entry(key.clone()).or_default();
                    for point in points {
                        by_ts.insert(point.timestamp, point.strength);
                    }
                }
            }
        }

        from_grouped(merged)
    }

    /// Drop points older than `cutoff`, then series and sections left empty
    pub fn prune_before(&mut self, cutoff: NaiveDateTime) {
        self.retain_points(|p| p.timestamp >= cutoff);
    }

    /// Copy keeping only the points accepted by `keep`
    pub fn filtered<F>(&self, keep: F) -> CacheData
    where
        F: Fn(&CachePoint) -> bool,
    {
        let mut copy = self.clone();
        copy.retain_points(keep);
        copy
    }

    fn retain_points<F>(&mut self, keep: F)
    where
        F: Fn(&CachePoint) -> bool,
    {
        for series in self.sections.values_mut() {
            for points in series.values_mut() {
                points.retain(|p| keep(p));
            }
            series.retain(|_, points| !points.is_empty());
        }
        self.sections.retain(|_, series| !series.is_empty());
    }
}

fn from_grouped(grouped: Grouped) -> CacheData {
    CacheData {
        sections: grouped
            .into_iter()
            .map(|(section, series)| {
                let series = series
                    .into_iter()
                    .map(|(key, points)| (key, collect_points(points)))
                    .collect();
                (section, series)
            })
            .collect(),
    }
}

fn collect_points(points: BTreeMap<NaiveDateTime, Option<f64>>) -> Vec<CachePoint> {
    points
        .into_iter()
        .map(|(timestamp, strength)| CachePoint {
            timestamp,
            strength,
        })
        .collect()
}
