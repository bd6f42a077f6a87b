//! Risk limits

use serde::{Deserialize, Serialize};

/// Account-wide risk limits
///
/// Fractions are expressed relative to the account balance (0.02 = 2%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    /// Highest leverage accepted for any position
    pub max_leverage: u32,
    /// Largest notional per position as a fraction of balance, before leverage
    pub max_position_fraction: f64,
    /// Open positions allowed at the same time
    pub max_positions: usize,
    /// Daily loss, realized plus unrealized, as a fraction of balance
    pub max_daily_loss: f64,
    /// Default risk per trade as a fraction of balance
    pub max_position_loss: f64,
    /// Correlation above which a new symbol is refused
    pub correlation_threshold: f64,
    /// Closes sampled per symbol for correlation
    pub correlation_samples: usize,
    /// Overlapping returns needed before correlation is trusted
    pub min_correlation_returns: usize,
    /// Margin in use, including the new order, as a fraction of balance
    pub max_margin_usage: f64,
    /// Total notional exposure as a multiple of balance
    pub max_exposure_multiple: f64,
    /// Maintenance margin rate used for liquidation prices
    pub maintenance_margin_rate: f64,
    /// Reward to risk ratio for default take-profit levels
    pub reward_ratio: f64,
    /// Widest stop accepted by the sizer, as a fraction of price
    pub max_stop_loss_fraction: f64,
    /// Share of the theoretical increase added when pyramiding
    pub pyramid_scale: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_leverage: 125,
            max_position_fraction: 0.5,
            max_positions: 10,
            max_daily_loss: 0.02,
            max_position_loss: 0.01,
            correlation_threshold: 0.8,
            correlation_samples: 30,
            min_correlation_returns: 10,
            max_margin_usage: 0.8,
            max_exposure_multiple: 2.0,
            maintenance_margin_rate: 0.004,
            reward_ratio: 2.0,
            max_stop_loss_fraction: 0.1,
            pyramid_scale: 0.5,
        }
    }
}

impl RiskLimits {
    /// Largest notional allowed for one position
    #[must_use]
    pub fn max_notional(&self, balance: f64, leverage: u32) -> f64 {
        balance * self.max_position_fraction * f64::from(leverage.max(1))
    }

    /// Daily loss floor in quote currency (negative)
    #[must_use]
    pub fn daily_loss_floor(&self, balance: f64) -> f64 {
        -self.max_daily_loss * balance
    }
}
