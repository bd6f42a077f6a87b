//! Exchange boundary used by the order manager

use crate::error::ExchangeResult;
use crate::filters::SymbolFilters;
use crate::order::{ExchangeOrder, OrderRequest};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use services_common::MarginType;

/// Futures account balances
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AccountInfo {
    /// Wallet balance
    pub total_wallet_balance: f64,
    /// Balance available for new orders
    pub available_balance: f64,
    /// Unrealized PnL across positions
    pub total_unrealized_profit: f64,
    /// Wallet balance plus unrealized PnL
    pub total_margin_balance: f64,
}

/// Direction of an isolated margin transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarginTransfer {
    /// Post margin to the position
    Add,
    /// Withdraw margin from the position
    Reduce,
}

/// Operations the order manager needs from a futures exchange
///
/// Every call may fail with a typed [`crate::ExchangeError`]; retries are the
/// caller's decision.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Place a new order tagged with `client_order_id`
    async fn place_order(&self, request: &OrderRequest, client_order_id: &str) -> ExchangeResult<ExchangeOrder>;

    /// Cancel a working order
    async fn cancel_order(&self, symbol: &str, exchange_order_id: &str) -> ExchangeResult<ExchangeOrder>;

    /// Current state of an order
    async fn get_order(&self, symbol: &str, exchange_order_id: &str) -> ExchangeResult<ExchangeOrder>;

    /// Account balances
    async fn account(&self) -> ExchangeResult<AccountInfo>;

    /// Trading rules for `symbol`, `None` when the symbol is not listed
    async fn symbol_filters(&self, symbol: &str) -> ExchangeResult<Option<SymbolFilters>>;

    /// Set the leverage used by new orders on `symbol`
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()>;

    /// Switch `symbol` between isolated and crossed margin
    async fn set_margin_type(&self, symbol: &str, margin_type: MarginType) -> ExchangeResult<()>;

    /// Move isolated margin in or out of the position on `symbol`
    async fn transfer_margin(&self, symbol: &str, amount: f64, direction: MarginTransfer) -> ExchangeResult<()>;

    /// Current mark price
    async fn mark_price(&self, symbol: &str) -> ExchangeResult<f64>;
}
