//! Read-only market state consumed by execution

use crate::analytics::MarketSnapshot;
use crate::orderbook::OrderBookSnapshot;
use std::sync::Arc;

/// Lock-free view of books and analytics
///
/// Implementations hand out immutable snapshots; callers may hold them for
/// as long as they like without blocking the writer.
pub trait MarketDataProvider: Send + Sync {
    /// Latest published order book
    fn book_snapshot(&self, symbol: &str) -> Option<Arc<OrderBookSnapshot>>;

    /// Latest published analytics
    fn market_snapshot(&self, symbol: &str) -> Option<Arc<MarketSnapshot>>;

    /// Most recent trade prices, oldest first
    fn recent_prices(&self, symbol: &str, limit: usize) -> Vec<f64>;
}
