//! Category aggregation: average of per-subject strengths

use super::calculator::compute_strength;
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Result of aggregating one selection
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryAggregate {
    /// Mean strength of contributing subjects, `None` if nobody contributed
    pub score: Option<f64>,
    /// Subjects whose strength was computed (selection order)
    pub contributors: Vec<String>,
    /// Subjects without a usable series (diagnostics only)
    pub failed: Vec<String>,
}

impl CategoryAggregate {
    pub fn is_defined(&self) -> bool {
        self.score.is_some()
    }
}

/// Aggregate the strength of `selection` against `reference`
///
/// Subjects missing from `series_by_key` or whose calculation is undefined are
/// reported in `failed` and excluded from the mean. A selection where nobody
/// succeeds has no score rather than a neutral one.
pub fn aggregate(
    reference: &[Decimal],
    series_by_key: &HashMap<String, Vec<Decimal>>,
    selection: &[String],
) -> CategoryAggregate {
    let mut scores = Vec::with_capacity(selection.len());
    let mut contributors = Vec::with_capacity(selection.len());
    let mut failed = Vec::new();

    for key in selection {
        let strength = series_by_key
            .get(key)
            .and_then(|series| compute_strength(series, reference));

        match strength {
            Some(value) => {
                scores.push(value);
                contributors.push(key.clone());
            }
            None => failed.push(key.clone()),
        }
    }

    let score = if scores.is_empty() {
        None
    } else {
        Some(scores.iter().sum::<f64>() / scores.len() as f64)
    };

    CategoryAggregate {
        score,
        contributors,
        failed,
    }
}
