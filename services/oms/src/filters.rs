//! Exchange symbol filters
//!
//! Every order is checked against the symbol's lot size, price filter and
//! leverage bracket before it is sent, so obvious rejections never cost a
//! round trip.

use crate::error::{OmsError, OmsResult};
use crate::order::OrderRequest;
use serde::{Deserialize, Serialize};

/// Maximum leverage assumed when the exchange does not report a bracket
pub const DEFAULT_MAX_LEVERAGE: u32 = 125;

/// Relative tolerance for step and tick alignment
const ALIGNMENT_TOLERANCE: f64 = 1e-6;

/// Trading rules for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolFilters {
    /// Symbol
    pub symbol: String,
    /// Smallest order quantity
    pub min_qty: f64,
    /// Largest order quantity
    pub max_qty: f64,
    /// Quantity increment
    pub step_size: f64,
    /// Lowest accepted price
    pub min_price: f64,
    /// Highest accepted price
    pub max_price: f64,
    /// Price increment
    pub tick_size: f64,
    /// Highest leverage the symbol allows
    pub max_leverage: u32,
}

fn is_aligned(value: f64, origin: f64, increment: f64) -> bool {
    if increment <= 0.0 {
        return true;
    }
    let steps = (value - origin) / increment;
    (steps - steps.round()).abs() < ALIGNMENT_TOLERANCE
}

impl SymbolFilters {
    /// Check quantity bounds and step alignment
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the violated bound.
    pub fn validate_quantity(&self, quantity: f64) -> OmsResult<()> {
        if quantity < self.min_qty || quantity > self.max_qty {
            return Err(OmsError::validation(format!(
                "Quantity {quantity} must be between {} and {}",
                self.min_qty, self.max_qty
            )));
        }
        if !is_aligned(quantity, self.min_qty, self.step_size) {
            return Err(OmsError::validation(format!(
                "Quantity {quantity} is not a multiple of step size {}",
                self.step_size
            )));
        }
        Ok(())
    }

    /// Check price bounds and tick alignment
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the violated bound.
    pub fn validate_price(&self, price: f64) -> OmsResult<()> {
        // A zero max price means the exchange imposes no ceiling
        let above_max = self.max_price > 0.0 && price > self.max_price;
        if price < self.min_price || above_max {
            return Err(OmsError::validation(format!(
                "Price {price} must be between {} and {}",
                self.min_price, self.max_price
            )));
        }
        if !is_aligned(price, 0.0, self.tick_size) {
            return Err(OmsError::validation(format!(
                "Price {price} is not a multiple of tick size {}",
                self.tick_size
            )));
        }
        Ok(())
    }

    /// Check leverage is in `1..=max_leverage`
    ///
    /// # Errors
    ///
    /// Returns a validation error when out of range.
    pub fn validate_leverage(&self, leverage: u32) -> OmsResult<()> {
        if leverage == 0 || leverage > self.max_leverage {
            return Err(OmsError::validation(format!(
                "Leverage must be between 1 and {}",
                self.max_leverage
            )));
        }
        Ok(())
    }

    /// Check a whole order request
    ///
    /// # Errors
    ///
    /// Returns the first violated filter.
    pub fn validate_order(&self, request: &OrderRequest) -> OmsResult<()> {
        if !request.close_position {
            self.validate_quantity(request.quantity)?;
        }
        if let Some(price) = request.price {
            self.validate_price(price)?;
        }
        if let Some(stop_price) = request.stop_price {
            self.validate_price(stop_price)?;
        }
        if let Some(leverage) = request.leverage {
            self.validate_leverage(leverage)?;
        }
        Ok(())
    }

    /// Round `quantity` down to the step size
    #[must_use]
    pub fn round_quantity(&self, quantity: f64) -> f64 {
        if self.step_size <= 0.0 {
            return quantity;
        }
        let steps = (quantity / self.step_size + ALIGNMENT_TOLERANCE).floor();
        steps * self.step_size
    }

    /// Round `price` to the nearest tick
    #[must_use]
    pub fn round_price(&self, price: f64) -> f64 {
        if self.tick_size <= 0.0 {
            return price;
        }
        (price / self.tick_size).round() * self.tick_size
    }
}
