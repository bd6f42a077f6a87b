//! Order book reconstruction

pub mod book;
pub mod price_levels;
pub mod store;

pub use book::{
    BookConfig, BookState, DepthDiff, DepthSnapshot, DiffOutcome, ImpactEstimate, OrderBook,
    OrderBookSnapshot, TopOfBook, walk_levels,
};
pub use price_levels::{PriceLevel, SideBook};
pub use store::OrderBookStore;
