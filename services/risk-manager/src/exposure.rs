//! Account state the gate evaluates requests against

use serde::{Deserialize, Serialize};
use services_common::PositionSide;

/// One open position as seen by the risk gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenExposure {
    /// Upper-case symbol
    pub symbol: String,
    /// Direction
    pub side: PositionSide,
    /// Size in base units
    pub size: f64,
    /// Average entry price
    pub entry_price: f64,
    /// Latest mark price, entry price when unknown
    pub mark_price: f64,
    /// Position leverage
    pub leverage: u32,
    /// Unrealized PnL in quote currency
    pub unrealized_pnl: f64,
}

impl OpenExposure {
    /// Notional at the mark price
    #[must_use]
    pub fn notional(&self) -> f64 {
        self.size * self.mark_price
    }

    /// Margin posted for the position
    #[must_use]
    pub fn margin(&self) -> f64 {
        self.notional() / f64::from(self.leverage.max(1))
    }

    /// Unrealized PnL relative to the entry value, as a fraction
    #[must_use]
    pub fn unrealized_pnl_fraction(&self) -> f64 {
        let entry_value = self.size * self.entry_price;
        if entry_value > 0.0 { self.unrealized_pnl / entry_value } else { 0.0 }
    }
}

/// Balance, today's PnL and open positions of one account
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    /// Wallet balance in quote currency
    pub balance: f64,
    /// PnL realized since the start of the trading day
    pub daily_realized_pnl: f64,
    /// Equity at the start of the trading day; balance when unset
    pub day_start_equity: Option<f64>,
    /// Open positions
    pub positions: Vec<OpenExposure>,
}

impl AccountSnapshot {
    /// Account with a balance and nothing open
    #[must_use]
    pub fn with_balance(balance: f64) -> Self {
        Self {
            balance,
            ..Self::default()
        }
    }

    /// Unrealized PnL over all open positions
    #[must_use]
    pub fn unrealized_pnl(&self) -> f64 {
        self.positions.iter().map(|p| p.unrealized_pnl).sum()
    }

    /// Realized plus unrealized PnL today
    #[must_use]
    pub fn daily_pnl(&self) -> f64 {
        self.daily_realized_pnl + self.unrealized_pnl()
    }

    /// Balance plus unrealized PnL
    #[must_use]
    pub fn equity(&self) -> f64 {
        self.balance + self.unrealized_pnl()
    }

    /// Fractional equity drop since the start of the day, 0 when up
    #[must_use]
    pub fn drawdown(&self) -> f64 {
        let start = self.day_start_equity.unwrap_or(self.balance);
        if start <= 0.0 {
            return 0.0;
        }
        ((start - self.equity()) / start).max(0.0)
    }

    /// Notional of every open position
    #[must_use]
    pub fn total_exposure(&self) -> f64 {
        self.positions.iter().map(OpenExposure::notional).sum()
    }

    /// Margin posted across open positions
    #[must_use]
    pub fn margin_used(&self) -> f64 {
        self.positions.iter().map(OpenExposure::margin).sum()
    }

    /// Open position count
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.positions.len()
    }

    /// Open position on `symbol`, if any
    #[must_use]
    pub fn position(&self, symbol: &str) -> Option<&OpenExposure> {
        self.positions.iter().find(|p| p.symbol.eq_ignore_ascii_case(symbol))
    }
}

/// A proposed new position or increase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRequest {
    /// Upper-case symbol
    pub symbol: String,
    /// Direction
    pub side: PositionSide,
    /// Size in base units
    pub quantity: f64,
    /// Expected entry price
    pub price: f64,
    /// Requested leverage
    pub leverage: u32,
}

impl PositionRequest {
    /// Request for `quantity` units at `price`
    #[must_use]
    pub fn new(symbol: &str, side: PositionSide, quantity: f64, price: f64, leverage: u32) -> Self {
        Self {
            symbol: services_common::normalize_symbol(symbol),
            side,
            quantity,
            price,
            leverage,
        }
    }

    /// Notional in quote currency
    #[must_use]
    pub fn notional(&self) -> f64 {
        self.quantity * self.price
    }

    /// Margin the request would post
    #[must_use]
    pub fn margin(&self) -> f64 {
        self.notional() / f64::from(self.leverage.max(1))
    }
}
