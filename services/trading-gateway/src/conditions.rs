//! Execution-time market condition checks
//!
//! A signal that passed validation may still be a bad trade by the time it
//! is executed. These checks read the latest published book and analytics
//! and refuse execution when the market has moved away from the signal or
//! is too thin, too wide or too volatile. A failure cancels the signal; it
//! is never an execution error.

use crate::scoring::DEPTH_LEVELS;
use crate::signal::{Signal, SignalAction, SignalType};
use market_connector::MarketDataProvider;
use serde::{Deserialize, Serialize};
use services_common::Side;
use thiserror::Error;

/// Ceilings and floors for the market condition checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConditionLimits {
    /// Largest distance of the current price from an entry, as a fraction
    pub max_price_deviation: f64,
    /// Largest absolute 24h change, in percent
    pub max_price_change_24h_percent: f64,
    /// 24h volume must be at least this multiple of the top bid depth
    pub liquidity_multiple: f64,
    /// Widest spread relative to the best bid, in percent
    pub max_spread_percent: f64,
    /// Largest absolute funding rate, as a fraction
    pub max_funding_rate: f64,
    /// Lowest bid over ask depth accepted for longs
    pub min_long_buy_sell_ratio: f64,
    /// Highest bid over ask depth accepted for shorts
    pub max_short_buy_sell_ratio: f64,
}

impl Default for MarketConditionLimits {
    fn default() -> Self {
        Self {
            max_price_deviation: 0.01,
            max_price_change_24h_percent: 5.0,
            liquidity_multiple: 100.0,
            max_spread_percent: 0.1,
            max_funding_rate: 0.001,
            min_long_buy_sell_ratio: 0.8,
            max_short_buy_sell_ratio: 1.2,
        }
    }
}

/// Reason a signal was not executed under current conditions
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConditionFailure {
    /// No live book or analytics for the symbol
    #[error("Market data unavailable for {symbol}: {missing}")]
    MarketDataUnavailable {
        /// Symbol
        symbol: String,
        /// What is missing
        missing: &'static str,
    },

    /// Price moved too far from the entry
    #[error("Price deviation {deviation:.4} from entry {entry} exceeds {max:.4} (price {price})")]
    PriceDeviation {
        /// Current reference price
        price: f64,
        /// Signal entry
        entry: f64,
        /// Fractional distance
        deviation: f64,
        /// Configured ceiling
        max: f64,
    },

    /// Market moved too much over 24h
    #[error("Market too volatile: 24h change {change_percent:.2}% exceeds {max:.2}%")]
    Volatility {
        /// 24h change in percent
        change_percent: f64,
        /// Configured ceiling
        max: f64,
    },

    /// Not enough traded volume relative to resting depth
    #[error("Insufficient liquidity: 24h volume {volume_24h} below {required}")]
    Liquidity {
        /// 24h volume
        volume_24h: f64,
        /// Required volume
        required: f64,
    },

    /// Spread too wide
    #[error("Spread {spread_percent:.4}% exceeds {max:.4}%")]
    Spread {
        /// Spread relative to the bid, in percent
        spread_percent: f64,
        /// Configured ceiling
        max: f64,
    },

    /// Funding too expensive in either direction
    #[error("Funding rate {rate} exceeds {max}")]
    FundingRate {
        /// Current funding rate
        rate: f64,
        /// Configured ceiling
        max: f64,
    },

    /// Order flow leans against the signal
    #[error("Order flow against {action}: buy/sell ratio {ratio:.3}")]
    OrderFlow {
        /// Signal action
        action: SignalAction,
        /// Bid over ask depth
        ratio: f64,
    },
}

/// Market state that passed every check
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarketView {
    /// Mark, last or mid price
    pub price: f64,
    /// Quantity in the top bid levels
    pub bid_volume: f64,
    /// Quantity in the top ask levels
    pub ask_volume: f64,
    /// Bid over ask depth, 1 when the ask side is empty
    pub buy_sell_ratio: f64,
    /// Spread relative to the bid, in percent
    pub spread_percent: f64,
}

/// Run every market check for `signal`
///
/// Order: price deviation (entries only), 24h change, liquidity, spread,
/// funding, then order flow (LONG and SHORT only). Data the analytics have
/// not seen yet (24h ticker, funding) skips the corresponding check; a
/// missing book or price fails.
///
/// # Errors
///
/// The first failing check.
pub fn check_market_conditions(
    signal: &Signal,
    limits: &MarketConditionLimits,
    market: &dyn MarketDataProvider,
) -> Result<MarketView, ConditionFailure> {
    let unavailable = |missing| ConditionFailure::MarketDataUnavailable {
        symbol: signal.symbol.clone(),
        missing,
    };
    let book = market.book_snapshot(&signal.symbol).ok_or_else(|| unavailable("order book"))?;
    let top = book.top.ok_or_else(|| unavailable("live order book"))?;
    let snapshot = market.market_snapshot(&signal.symbol);
    let price = snapshot
        .as_ref()
        .and_then(|s| s.reference_price())
        .unwrap_or(top.mid);

    if signal.signal_type == SignalType::Entry {
        if let Some(entry) = signal.entry_price.filter(|e| *e > 0.0) {
            let deviation = (price - entry).abs() / entry;
            if deviation > limits.max_price_deviation {
                return Err(ConditionFailure::PriceDeviation {
                    price,
                    entry,
                    deviation,
                    max: limits.max_price_deviation,
                });
            }
        }
    }

    if let Some(change) = snapshot.as_ref().and_then(|s| s.price_change_24h_percent) {
        if change.abs() > limits.max_price_change_24h_percent {
            return Err(ConditionFailure::Volatility {
                change_percent: change,
                max: limits.max_price_change_24h_percent,
            });
        }
    }

    let bid_volume = book.volume(Side::Buy, DEPTH_LEVELS);
    let ask_volume = book.volume(Side::Sell, DEPTH_LEVELS);
    if let Some(volume_24h) = snapshot.as_ref().and_then(|s| s.volume_24h) {
        let required = bid_volume * limits.liquidity_multiple;
        if volume_24h < required {
            return Err(ConditionFailure::Liquidity { volume_24h, required });
        }
    }

    if top.spread_percent > limits.max_spread_percent {
        return Err(ConditionFailure::Spread {
            spread_percent: top.spread_percent,
            max: limits.max_spread_percent,
        });
    }

    if let Some(rate) = snapshot.as_ref().and_then(|s| s.funding_rate) {
        if rate.abs() > limits.max_funding_rate {
            return Err(ConditionFailure::FundingRate {
                rate,
                max: limits.max_funding_rate,
            });
        }
    }

    let buy_sell_ratio = if ask_volume > 0.0 { bid_volume / ask_volume } else { 1.0 };
    let against = match signal.action {
        SignalAction::Long => buy_sell_ratio < limits.min_long_buy_sell_ratio,
        SignalAction::Short => buy_sell_ratio > limits.max_short_buy_sell_ratio,
        SignalAction::CloseLong | SignalAction::CloseShort => false,
    };
    if against {
        return Err(ConditionFailure::OrderFlow {
            action: signal.action,
            ratio: buy_sell_ratio,
        });
    }

    Ok(MarketView {
        price,
        bid_volume,
        ask_volume,
        buy_sell_ratio,
        spread_percent: top.spread_percent,
    })
}
