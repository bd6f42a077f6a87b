//! Indicator math over a price history
//!
//! Pure functions; the cache calls them on its own cadence.

use serde::{Deserialize, Serialize};
use services_common::PERCENT;
use services_common::math::{log_returns, mean, std_dev};

/// Trend classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    /// Short average above long and price up by more than the threshold
    Up,
    /// Short average below long and price down by more than the threshold
    Down,
    /// Anything else, including too little history
    #[default]
    Sideways,
}

/// Volatility of the last `window` log returns
///
/// Standard deviation of the returns scaled by the square root of their
/// count. Returns 0 with fewer than two prices.
#[must_use]
pub fn volatility(prices: &[f64], window: usize) -> f64 {
    let start = prices.len().saturating_sub(window + 1);
    let returns = log_returns(&prices[start..]);
    std_dev(&returns).map_or(0.0, |sd| sd * (returns.len() as f64).sqrt())
}

/// Percent change between the price `window` samples back and the latest
#[must_use]
pub fn momentum(prices: &[f64], window: usize) -> f64 {
    if window == 0 || prices.len() < window {
        return 0.0;
    }
    let past = prices[prices.len() - window];
    let last = prices[prices.len() - 1];
    if past <= 0.0 {
        return 0.0;
    }
    (last - past) / past * PERCENT
}

/// Moving-average crossover confirmed by a minimum move over the long window
///
/// `threshold` is a fraction (0.01 = 1 %).
#[must_use]
pub fn trend(prices: &[f64], short: usize, long: usize, threshold: f64) -> Trend {
    if short == 0 || long == 0 || prices.len() < long.max(short) {
        return Trend::Sideways;
    }
    let n = prices.len();
    let (Some(short_ma), Some(long_ma)) = (mean(&prices[n - short..]), mean(&prices[n - long..])) else {
        return Trend::Sideways;
    };
    let reference = prices[n - long];
    if reference <= 0.0 {
        return Trend::Sideways;
    }
    let change = (prices[n - 1] - reference) / reference;

    if short_ma > long_ma && change > threshold {
        Trend::Up
    } else if short_ma < long_ma && change < -threshold {
        Trend::Down
    } else {
        Trend::Sideways
    }
}

/// Inputs of the composite signal strength
#[derive(Debug, Clone, Copy)]
pub struct StrengthInputs {
    /// Trend classification
    pub trend: Trend,
    /// Momentum in percent
    pub momentum: f64,
    /// Momentum magnitude counted as strong
    pub momentum_threshold: f64,
    /// Recent volume over average volume
    pub volume_ratio: f64,
    /// Volume ratio counted as a surge
    pub volume_surge: f64,
    /// Price change over the history, in percent
    pub price_change_percent: f64,
    /// Short moving average
    pub sma_short: Option<f64>,
    /// Long moving average
    pub sma_long: Option<f64>,
    /// Current volatility
    pub volatility: f64,
    /// Volatility counted as high
    pub high_volatility: f64,
}

/// Directional strength in [-100, 100]; positive is bullish
#[must_use]
pub fn signal_strength(inputs: &StrengthInputs) -> f64 {
    let mut strength = match inputs.trend {
        Trend::Up if inputs.momentum > 0.0 => 30.0,
        Trend::Up => 10.0,
        Trend::Down if inputs.momentum < 0.0 => -30.0,
        Trend::Down => -10.0,
        Trend::Sideways => 0.0,
    };

    if inputs.momentum.abs() > inputs.momentum_threshold {
        strength += 20.0_f64.copysign(inputs.momentum);
    }

    if inputs.volume_ratio > inputs.volume_surge {
        strength += if inputs.price_change_percent > 0.0 { 10.0 } else { -10.0 };
    }

    if let (Some(short), Some(long)) = (inputs.sma_short, inputs.sma_long) {
        if short > long {
            strength += 15.0;
        } else if short < long {
            strength -= 15.0;
        }
    }

    // High volatility damps conviction
    if inputs.volatility > inputs.high_volatility {
        strength *= 0.8;
    }

    strength.clamp(-100.0, 100.0)
}
