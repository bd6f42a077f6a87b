//! Order Management System (OMS)
//!
//! Order and position lifecycle for a USD-M futures account: placement with
//! bounded retries, reduce-only protective orders, fill booking, isolated
//! margin transfers, liquidation detection and a typed exchange error model.
//!
//! Features:
//! - Order state machine (NEW → PARTIALLY_FILLED → FILLED/CANCELED/REJECTED/EXPIRED)
//! - Position state machine (OPEN → CLOSED/LIQUIDATED)
//! - Per-symbol serialization of mutations
//! - Signed REST client for the futures API
//! - Pluggable persistence

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod error;
pub mod exchange;
pub mod filters;
pub mod lifecycle;
pub mod manager;
pub mod order;
pub mod persistence;
pub mod position;
pub mod rest;

pub use error::{ExchangeError, ExchangeErrorKind, ExchangeResult, OmsError, OmsResult};
pub use exchange::{AccountInfo, ExchangeClient, MarginTransfer};
pub use filters::SymbolFilters;
pub use lifecycle::{OrderLifecycleManager, ReportOutcome};
pub use manager::{
    OmsConfig, OmsEvent, OmsMetricsSnapshot, OpenPositionRequest, OrderManager, RetryPolicy,
    SymbolGuard,
};
pub use order::{
    ExchangeOrder, Order, OrderAmendment, OrderRequest, OrderStatus, OrderType, TimeInForce,
};
pub use persistence::{InMemoryStore, Persistence};
pub use position::{Position, PositionStatus};
pub use rest::BinanceFuturesClient;
