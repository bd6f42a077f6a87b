//! Position model
//!
//! Positions are one-way: at most one OPEN position per symbol for an
//! account. Size is always non-negative, direction lives in `side`.

use crate::error::{OmsError, OmsResult};
use chrono::{DateTime, Utc};
use risk_manager::OpenExposure;
use serde::{Deserialize, Serialize};
use services_common::{EPSILON, MarginType, PERCENT, PositionSide};
use std::fmt;
use uuid::Uuid;

/// Position status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    /// Position is live
    Open,
    /// Closed by the account
    Closed,
    /// Closed by the exchange at the liquidation price
    Liquidated,
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Open => "OPEN",
            Self::Closed => "CLOSED",
            Self::Liquidated => "LIQUIDATED",
        })
    }
}

/// Futures position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Unique position ID
    pub id: Uuid,
    /// Account owning the position
    pub user_id: String,
    /// Symbol
    pub symbol: String,
    /// Direction
    pub side: PositionSide,
    /// Status
    pub status: PositionStatus,
    /// Average entry price
    pub entry_price: f64,
    /// Last mark price seen
    pub mark_price: Option<f64>,
    /// Price at which the position is liquidated
    pub liquidation_price: Option<f64>,
    /// Size in base units
    pub size: f64,
    /// Leverage, at least 1
    pub leverage: u32,
    /// Margin mode
    pub margin_type: MarginType,
    /// Margin posted to an isolated position
    pub isolated_margin: f64,
    /// Maintenance margin rate used for the liquidation price
    pub maintenance_margin_rate: f64,
    /// Stop-loss trigger
    pub stop_loss: Option<f64>,
    /// Take-profit trigger
    pub take_profit: Option<f64>,
    /// Trailing stop distance
    pub trailing_stop: Option<f64>,
    /// Order that opened the position
    pub entry_order_id: Option<Uuid>,
    /// Working stop-loss order
    pub stop_loss_order_id: Option<Uuid>,
    /// Working take-profit order
    pub take_profit_order_id: Option<Uuid>,
    /// Unrealized PnL at the last mark
    pub unrealized_pnl: f64,
    /// PnL realized by reductions and the final close
    pub realized_pnl: f64,
    /// Realized plus unrealized
    pub total_pnl: f64,
    /// Return on the initial margin, in percent
    pub roe: f64,
    /// Open timestamp
    pub opened_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
    /// Close timestamp
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    /// New OPEN position
    ///
    /// Isolated positions start with exactly the initial margin posted.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        user_id: &str,
        symbol: &str,
        side: PositionSide,
        entry_price: f64,
        size: f64,
        leverage: u32,
        margin_type: MarginType,
        maintenance_margin_rate: f64,
    ) -> Self {
        let now = Utc::now();
        let leverage = leverage.max(1);
        let mut position = Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            symbol: symbol.to_string(),
            side,
            status: PositionStatus::Open,
            entry_price,
            mark_price: Some(entry_price),
            liquidation_price: None,
            size,
            leverage,
            margin_type,
            isolated_margin: 0.0,
            maintenance_margin_rate,
            stop_loss: None,
            take_profit: None,
            trailing_stop: None,
            entry_order_id: None,
            stop_loss_order_id: None,
            take_profit_order_id: None,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            total_pnl: 0.0,
            roe: 0.0,
            opened_at: now,
            updated_at: now,
            closed_at: None,
        };
        if margin_type == MarginType::Isolated {
            position.isolated_margin = position.initial_margin();
        }
        position.recompute_liquidation_price();
        position
    }

    /// Position is live
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Unrealized PnL is positive
    #[must_use]
    pub fn is_in_profit(&self) -> bool {
        self.unrealized_pnl > 0.0
    }

    /// Entry notional
    #[must_use]
    pub fn entry_value(&self) -> f64 {
        self.entry_price * self.size
    }

    /// Margin required at entry
    #[must_use]
    pub fn initial_margin(&self) -> f64 {
        self.entry_value() / f64::from(self.leverage)
    }

    /// Unrealized PnL relative to entry price, in percent
    #[must_use]
    pub fn unrealized_pnl_pct(&self) -> f64 {
        match self.mark_price {
            Some(mark) if self.entry_price > 0.0 => {
                self.side.sign() * (mark - self.entry_price) / self.entry_price * PERCENT
            }
            _ => 0.0,
        }
    }

    /// PnL of `quantity` units closed at `price`
    #[must_use]
    pub fn pnl_at(&self, price: f64, quantity: f64) -> f64 {
        match self.side {
            PositionSide::Long => (price - self.entry_price) * quantity,
            PositionSide::Short => (self.entry_price - price) * quantity,
        }
    }

    /// Recompute unrealized, total PnL and ROE at the current mark
    pub fn recompute_pnl(&mut self) {
        let Some(mark) = self.mark_price else {
            return;
        };
        self.unrealized_pnl = self.pnl_at(mark, self.size);
        self.total_pnl = self.unrealized_pnl + self.realized_pnl;
        let initial_margin = self.initial_margin();
        self.roe = if initial_margin > 0.0 {
            self.total_pnl / initial_margin * PERCENT
        } else {
            0.0
        };
    }

    /// Move the mark and recompute PnL
    pub fn update_mark(&mut self, mark_price: f64) {
        self.mark_price = Some(mark_price);
        self.recompute_pnl();
        self.updated_at = Utc::now();
    }

    /// Liquidation price from entry, leverage and posted margin
    ///
    /// Crossed positions use the standard leverage formula. Isolated
    /// positions use their posted margin per unit, so adding margin moves
    /// the liquidation price away from entry.
    pub fn recompute_liquidation_price(&mut self) {
        if self.size <= EPSILON {
            self.liquidation_price = None;
            return;
        }
        let price = match self.margin_type {
            MarginType::Crossed => risk_manager::liquidation_price(
                self.entry_price,
                self.leverage,
                self.side,
                self.maintenance_margin_rate,
            ),
            MarginType::Isolated => {
                let margin_per_unit = self.isolated_margin / self.size;
                let maintenance = self.maintenance_margin_rate * self.entry_price;
                self.entry_price - self.side.sign() * (margin_per_unit - maintenance)
            }
        };
        self.liquidation_price = Some(price.max(0.0));
    }

    /// Mark price has crossed the liquidation price
    #[must_use]
    pub fn is_liquidatable(&self, mark_price: f64) -> bool {
        match (self.liquidation_price, self.side) {
            (Some(liq), PositionSide::Long) => mark_price <= liq,
            (Some(liq), PositionSide::Short) => mark_price >= liq,
            (None, _) => false,
        }
    }

    /// Add `quantity` at `price`, averaging the entry
    pub fn add(&mut self, quantity: f64, price: f64) {
        let new_size = self.size + quantity;
        if new_size <= EPSILON {
            return;
        }
        self.entry_price = (self.entry_price * self.size + price * quantity) / new_size;
        if self.margin_type == MarginType::Isolated {
            self.isolated_margin += price * quantity / f64::from(self.leverage);
        }
        self.size = new_size;
        self.recompute_liquidation_price();
        self.recompute_pnl();
        self.updated_at = Utc::now();
    }

    /// Reduce by up to `quantity` at `price`, returning the realized PnL
    ///
    /// The reduction is clamped to the current size; the caller closes the
    /// position when the size reaches zero.
    pub fn reduce(&mut self, quantity: f64, price: f64) -> f64 {
        let quantity = quantity.min(self.size);
        let realized = self.pnl_at(price, quantity);
        if self.margin_type == MarginType::Isolated && self.size > EPSILON {
            self.isolated_margin *= (self.size - quantity) / self.size;
        }
        self.size -= quantity;
        if self.size <= EPSILON {
            self.size = 0.0;
        }
        self.realized_pnl += realized;
        self.recompute_liquidation_price();
        self.recompute_pnl();
        self.updated_at = Utc::now();
        realized
    }

    fn require_isolated(&self) -> OmsResult<()> {
        if self.margin_type != MarginType::Isolated {
            return Err(OmsError::InvalidMarginType {
                position_id: self.id.to_string(),
                margin_type: self.margin_type.to_string(),
            });
        }
        Ok(())
    }

    /// Post additional isolated margin
    ///
    /// # Errors
    ///
    /// Fails unless the position is isolated and the amount is positive.
    pub fn add_margin(&mut self, amount: f64) -> OmsResult<()> {
        self.require_isolated()?;
        if amount <= 0.0 {
            return Err(OmsError::validation("Margin amount must be positive"));
        }
        self.isolated_margin += amount;
        self.recompute_liquidation_price();
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Withdraw isolated margin
    ///
    /// # Errors
    ///
    /// Fails unless the position is isolated and holds at least `amount`.
    pub fn reduce_margin(&mut self, amount: f64) -> OmsResult<()> {
        self.require_isolated()?;
        if amount <= 0.0 {
            return Err(OmsError::validation("Margin amount must be positive"));
        }
        if amount > self.isolated_margin {
            return Err(OmsError::InsufficientMargin {
                position_id: self.id.to_string(),
                requested: amount,
                available: self.isolated_margin,
            });
        }
        self.isolated_margin -= amount;
        self.recompute_liquidation_price();
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Settle and close at `close_price`
    ///
    /// Realized PnL is fixed, unrealized PnL cleared.
    pub(crate) fn settle(&mut self, status: PositionStatus, close_price: f64) {
        if self.size > EPSILON {
            self.realized_pnl += self.pnl_at(close_price, self.size);
        }
        self.status = status;
        self.mark_price = Some(close_price);
        self.unrealized_pnl = 0.0;
        self.total_pnl = self.realized_pnl;
        self.liquidation_price = None;
        let now = Utc::now();
        self.closed_at = Some(now);
        self.updated_at = now;
    }

    /// View used by the risk gate
    #[must_use]
    pub fn exposure(&self) -> OpenExposure {
        OpenExposure {
            symbol: self.symbol.clone(),
            side: self.side,
            size: self.size,
            entry_price: self.entry_price,
            mark_price: self.mark_price.unwrap_or(self.entry_price),
            leverage: self.leverage,
            unrealized_pnl: self.unrealized_pnl,
        }
    }
}
