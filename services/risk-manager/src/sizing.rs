//! Position sizing
//!
//! Sizes are advisory. Whatever the sizer proposes still goes through the
//! [`RiskGate`] before an order is placed; pyramiding re-validates the
//! resulting total here as well.

use crate::error::{SizingError, SizingResult, positive};
use crate::exposure::{AccountSnapshot, OpenExposure, PositionRequest};
use crate::gate::RiskGate;
use crate::limits::RiskLimits;
use services_common::PERCENT;
use tracing::debug;

/// Position sizer bound to a set of limits
#[derive(Debug, Clone)]
pub struct PositionSizer {
    limits: RiskLimits,
}

impl PositionSizer {
    /// Sizer using `limits`
    #[must_use]
    pub const fn new(limits: RiskLimits) -> Self {
        Self { limits }
    }

    fn check_leverage(&self, leverage: u32) -> SizingResult<u32> {
        if leverage == 0 {
            return Err(SizingError::InvalidInput {
                field: "leverage",
                value: 0.0,
            });
        }
        if leverage > self.limits.max_leverage {
            return Err(SizingError::LeverageTooHigh {
                requested: leverage,
                max: self.limits.max_leverage,
            });
        }
        Ok(leverage)
    }

    /// Notional size risking `risk_per_trade` of `balance` with a stop `stop_loss_pct` away
    ///
    /// Both fractions are decimals (0.01 = 1%). The result is in quote
    /// currency and capped at `balance * max_position_fraction * leverage`.
    ///
    /// # Errors
    ///
    /// Non-positive inputs, leverage above the limit, or a stop wider than
    /// the configured maximum.
    pub fn fixed_or_risk_based(
        &self,
        balance: f64,
        risk_per_trade: f64,
        stop_loss_pct: f64,
        leverage: u32,
    ) -> SizingResult<f64> {
        let balance = positive("balance", balance)?;
        let risk_per_trade = positive("risk_per_trade", risk_per_trade)?;
        let stop_loss_pct = positive("stop_loss_pct", stop_loss_pct)?;
        let leverage = self.check_leverage(leverage)?;
        if stop_loss_pct > self.limits.max_stop_loss_fraction {
            return Err(SizingError::StopTooWide {
                fraction: stop_loss_pct,
                max: self.limits.max_stop_loss_fraction,
            });
        }

        let size = balance * risk_per_trade / stop_loss_pct * f64::from(leverage);
        Ok(size.min(self.limits.max_notional(balance, leverage)))
    }

    /// Quantity in base units for a signal with explicit entry and stop
    ///
    /// `risk_percent` is a percentage (1.0 = 1%). The quantity risks that
    /// share of `balance` over the entry to stop distance, scaled by
    /// leverage, and is capped at the position-fraction limit converted to
    /// units at the entry price.
    ///
    /// # Errors
    ///
    /// Non-positive inputs, leverage above the limit, or entry equal to stop.
    pub fn risk_based_quantity(
        &self,
        balance: f64,
        risk_percent: f64,
        entry: f64,
        stop_loss: f64,
        leverage: u32,
    ) -> SizingResult<f64> {
        let balance = positive("balance", balance)?;
        let risk_percent = positive("risk_percent", risk_percent)?;
        let entry = positive("entry", entry)?;
        let stop_loss = positive("stop_loss", stop_loss)?;
        let leverage = self.check_leverage(leverage)?;

        let distance = (entry - stop_loss).abs();
        if distance <= services_common::EPSILON {
            return Err(SizingError::ZeroStopDistance);
        }

        let risk_amount = balance * risk_percent / PERCENT;
        let quantity = risk_amount / distance * f64::from(leverage);
        let cap = self.limits.max_notional(balance, leverage) / entry;
        debug!(
            "Sized {:.6} units (uncapped {:.6}, cap {:.6}) risking {:.2}",
            quantity.min(cap),
            quantity,
            cap,
            risk_amount
        );
        Ok(quantity.min(cap))
    }

    /// Whether `notional` fits the per-position limit
    #[must_use]
    pub fn validate_position_size(&self, notional: f64, balance: f64, leverage: u32) -> bool {
        notional <= self.limits.max_notional(balance, leverage) + services_common::EPSILON
    }

    /// Shrink `size` so it plus correlated exposure fits the unlevered limit
    #[must_use]
    pub fn adjust_for_correlation(&self, size: f64, correlated_exposure: f64, balance: f64) -> f64 {
        let max = balance * self.limits.max_position_fraction;
        if size + correlated_exposure > max {
            (max - correlated_exposure).max(0.0)
        } else {
            size
        }
    }

    /// Additional base units to add to a winning position
    ///
    /// `None` when the position's unrealized PnL fraction is below
    /// `profit_threshold`, or when the enlarged position fails the gate.
    #[must_use]
    pub fn pyramid_size(
        &self,
        position: &OpenExposure,
        account: &AccountSnapshot,
        profit_threshold: f64,
        gate: &RiskGate,
    ) -> Option<f64> {
        if profit_threshold <= 0.0 {
            return None;
        }
        let pnl_fraction = position.unrealized_pnl_fraction();
        if pnl_fraction < profit_threshold {
            return None;
        }

        let additional = position.size * (pnl_fraction / profit_threshold) * self.limits.pyramid_scale;
        let total = position.size + additional;
        if !self.validate_position_size(total * position.mark_price, account.balance, position.leverage) {
            debug!("Pyramid on {} exceeds position limit", position.symbol);
            return None;
        }

        let request = PositionRequest::new(
            &position.symbol,
            position.side,
            total,
            position.mark_price,
            position.leverage,
        );
        gate.validate_increase(&request, account)
            .is_approved()
            .then_some(additional)
    }

    /// Staged entry: `num_orders` rungs stepping down `interval_pct` each
    ///
    /// Each rung carries the same notional, sized so the whole ladder risks
    /// the position-fraction limit.
    ///
    /// # Errors
    ///
    /// Non-positive inputs, zero rungs, or a ladder deep enough to reach a
    /// zero price.
    pub fn ladder_sizes(
        &self,
        price: f64,
        balance: f64,
        interval_pct: f64,
        num_orders: usize,
    ) -> SizingResult<Vec<(f64, f64)>> {
        let price = positive("price", price)?;
        if num_orders == 0 {
            return Err(SizingError::InvalidInput {
                field: "num_orders",
                value: 0.0,
            });
        }
        let rung_size = self.fixed_or_risk_based(
            balance,
            self.limits.max_position_fraction / num_orders as f64,
            interval_pct,
            1,
        )?;
        if interval_pct * (num_orders - 1) as f64 >= 1.0 {
            return Err(SizingError::InvalidInput {
                field: "interval_pct",
                value: interval_pct,
            });
        }

        Ok((0..num_orders)
            .map(|i| (price * (1.0 - interval_pct * i as f64), rung_size))
            .collect())
    }
}
