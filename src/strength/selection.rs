//! Selection methods: which tokens count toward a category's score

use std::fmt;
use std::str::FromStr;

/// Rule picking the subjects of a category aggregate
///
/// Methods are independent: every configured method is computed for every
/// category on every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectionMethod {
    /// Top N category members by category rank (`top_N`)
    CategoryTop(usize),
    /// Top M assets by overall market-cap rank that are category members (`top_M_mc`)
    MarketCapTop(usize),
}

impl SelectionMethod {
    /// Methods computed when none are configured
    pub fn defaults() -> Vec<SelectionMethod> {
        vec![
            SelectionMethod::CategoryTop(5),
            SelectionMethod::CategoryTop(10),
            SelectionMethod::CategoryTop(15),
            SelectionMethod::CategoryTop(20),
            SelectionMethod::MarketCapTop(100),
            SelectionMethod::MarketCapTop(200),
        ]
    }

    /// Stored name (`calculation_type` column, cache section key)
    pub fn name(&self) -> String {
        match self {
            SelectionMethod::CategoryTop(n) => format!("top_{}", n),
            SelectionMethod::MarketCapTop(m) => format!("top_{}_mc", m),
        }
    }

    pub fn limit(&self) -> usize {
        match self {
            SelectionMethod::CategoryTop(n) | SelectionMethod::MarketCapTop(n) => *n,
        }
    }

    /// Apply the method to already-ranked inputs
    ///
    /// - `category_members`: category members ordered by category rank
    /// - `market_cap_leaders`: assets ordered by market-cap rank, already cut
    ///   to this method's limit for `MarketCapTop`
    pub fn select(&self, category_members: &[String], market_cap_leaders: &[String]) -> Vec<String> {
        match self {
            SelectionMethod::CategoryTop(n) => category_members.iter().take(*n).cloned().collect(),
            SelectionMethod::MarketCapTop(m) => market_cap_leaders
                .iter()
                .take(*m)
                .filter(|asset| category_members.contains(asset))
                .cloned()
                .collect(),
        }
    }

    /// Diagnostic used when the selection comes back empty
    pub fn empty_reason(&self) -> String {
        match self {
            SelectionMethod::CategoryTop(n) => format!("No tokens found for limit {}", n),
            SelectionMethod::MarketCapTop(m) => format!("No tokens found in top {} by market cap", m),
        }
    }
}

impl fmt::Display for SelectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for SelectionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let rest = s
            .strip_prefix("top_")
            .ok_or_else(|| format!("Unknown selection method: {}", s))?;

        let (digits, market_cap) = match rest.strip_suffix("_mc") {
            Some(digits) => (digits, true),
            None => (rest, false),
        };

        let limit: usize = digits
            .parse()
            .map_err(|_| format!("Invalid limit in selection method: {}", s))?;
        if limit == 0 {
            return Err(format!("Selection limit must be positive: {}", s));
        }

        Ok(if market_cap {
            SelectionMethod::MarketCapTop(limit)
        } else {
            SelectionMethod::CategoryTop(limit)
        })
    }
}
