//! Rolling market analytics

pub mod cache;
pub mod indicators;

pub use cache::{AnalyticsConfig, MarketAlert, MarketAnalyticsCache, MarketSnapshot, Tick};
pub use indicators::Trend;
