//! strengthflow - relative strength of crypto tokens and categories against a
//! reference asset, with a JSON cache for the chart frontend.

pub mod cache;
pub mod config;
pub mod pipeline;
pub mod strength;
