//! Market Connector Service
//!
//! Maintains one multiplexed stream connection to the exchange, rebuilds
//! per-symbol order books from snapshots plus incremental diffs, and keeps
//! rolling analytics for every subscribed symbol.
//!
//! Layers, leaves first:
//! - [`transport`]: frame-level send/receive behind a trait
//! - [`subscription`]: channel to handler bookkeeping, no I/O
//! - [`connection`]: reconnecting stream client with heartbeat and health monitor
//! - [`orderbook`]: book reconstruction and the single-writer book store
//! - [`analytics`]: rolling histories and periodic indicator recompute
//! - [`service`]: the manager wiring all of the above together

pub mod analytics;
pub mod connection;
pub mod error;
pub mod messages;
pub mod orderbook;
pub mod provider;
pub mod service;
pub mod snapshot;
pub mod subscription;
pub mod transport;

pub use analytics::{AnalyticsConfig, MarketAlert, MarketAnalyticsCache, MarketSnapshot, Trend};
pub use connection::{ConnectionMetricsSnapshot, ConnectionState, StreamConfig, StreamConnection};
pub use error::{BookError, BookResult, StreamError, StreamResult};
pub use messages::{MarketEvent, StreamKind, StreamName};
pub use orderbook::{
    BookConfig, BookState, DepthDiff, DepthSnapshot, DiffOutcome, ImpactEstimate, OrderBook,
    OrderBookSnapshot, OrderBookStore, PriceLevel, TopOfBook,
};
pub use provider::MarketDataProvider;
pub use service::{MarketDataConfig, MarketDataService, MarketUpdate};
pub use snapshot::{RestSnapshotClient, SnapshotSource};
pub use subscription::{HandlerId, StreamHandler, SubscriptionRegistry};
pub use transport::{Frame, FrameSink, FrameSource, Transport, WebSocketTransport};
