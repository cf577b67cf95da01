//! Core records passed between pipeline stages

use crate::strength::SelectionMethod;
use chrono::{Duration, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Spacing of the price snapshots, in minutes
pub const PRICE_CADENCE_MINUTES: i64 = 10;

/// Cache section holding per-token series
pub const TOKEN_SECTION: &str = "tokens";

/// One price snapshot written by the ingestion side
#[derive(Debug, Clone, PartialEq)]
pub struct PricePoint {
    pub asset_id: String,
    pub timestamp: NaiveDateTime,
    /// `None` when the snapshot recorded no price
    pub price: Option<Decimal>,
}

/// Token listing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    /// Price-series key, `SYMBOL_cmcid` (e.g. `ETH_1027`)
    pub asset_id: String,
    pub symbol: String,
    pub name: String,
}

/// What a strength sample describes
#[derive(Debug, Clone, PartialEq)]
pub enum Subject {
    Token(TokenInfo),
    Category {
        category: String,
        method: SelectionMethod,
        /// Tokens whose strength went into the average
        contributors: Vec<TokenInfo>,
    },
}

impl Subject {
    /// Cache section this subject's series lives in
    pub fn section(&self) -> String {
        match self {
            Subject::Token(_) => TOKEN_SECTION.to_string(),
            Subject::Category { method, .. } => method.name(),
        }
    }

    /// Series key within the section
    pub fn key(&self) -> &str {
        match self {
            Subject::Token(token) => &token.asset_id,
            Subject::Category { category, .. } => category,
        }
    }
}

/// One computed strength, appended to the strength store once per tick
#[derive(Debug, Clone, PartialEq)]
pub struct StrengthSample {
    pub timestamp: NaiveDateTime,
    pub subject: Subject,
    /// `None` when the strength could not be computed
    pub strength: Option<f64>,
}

impl StrengthSample {
    pub fn token(timestamp: NaiveDateTime, token: TokenInfo, strength: Option<f64>) -> Self {
        Self {
            timestamp,
            subject: Subject::Token(token),
            strength,
        }
    }

    pub fn category(
        timestamp: NaiveDateTime,
        category: String,
        method: SelectionMethod,
        contributors: Vec<TokenInfo>,
        strength: Option<f64>,
    ) -> Self {
        Self {
            timestamp,
            subject: Subject::Category {
                category,
                method,
                contributors,
            },
            strength,
        }
    }
}

/// A stored strength as read back for the result cache
#[derive(Debug, Clone, PartialEq)]
pub struct StrengthRow {
    pub timestamp: NaiveDateTime,
    /// Selection method name, or `TOKEN_SECTION`
    pub section: String,
    /// Category name or token asset id
    pub key: String,
    pub strength: Option<f64>,
}

/// Timestamps of a `periods`-long window ending at `end`, oldest first
pub fn window_timestamps(end: NaiveDateTime, periods: usize) -> Vec<NaiveDateTime> {
    (0..periods as i64)
        .rev()
        .map(|i| end - Duration::minutes(i * PRICE_CADENCE_MINUTES))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 1)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn test_window_timestamps_oldest_first() {
        let window = window_timestamps(at(12, 0), 12);
        assert_eq!(window.len(), 12);
        assert_eq!(window[0], at(10, 10));
        assert_eq!(window[11], at(12, 0));
        assert!(window.windows(2).all(|w| w[1] - w[0] == Duration::minutes(10)));
    }

    #[test]
    fn test_subject_section_and_key() {
        let token = Subject::Token(TokenInfo {
            asset_id: "ETH_1027".to_string(),
            symbol: "ETH".to_string(),
            name: "Ethereum".to_string(),
        });
        assert_eq!(token.section(), TOKEN_SECTION);
        assert_eq!(token.key(), "ETH_1027");

        let category = Subject::Category {
            category: "DeFi".to_string(),
            method: SelectionMethod::MarketCapTop(100),
            contributors: vec![],
        };
        assert_eq!(category.section(), "top_100_mc");
        assert_eq!(category.key(), "DeFi");
    }
}
