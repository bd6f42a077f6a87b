//! Signal confidence scoring
//!
//! The score starts at [`BASE_SCORE`] and moves with four contributions, each
//! in [-50, 50] and signed towards the signal's order side:
//!
//! | Contribution | Weight | Source |
//! |---|---|---|
//! | trend | 0.3 | trend classification of the analytics snapshot |
//! | volume | 0.2 | recent volume over the rolling average |
//! | price | 0.3 | composite signal strength |
//! | market | 0.2 | top-of-book depth imbalance, or taker buy/sell ratio |
//!
//! The sum is clamped to [0, 100]. Missing market data contributes nothing.

use crate::signal::SignalAction;
use market_connector::{MarketSnapshot, OrderBookSnapshot, Trend};
use services_common::Side;

/// Score with no information either way
pub const BASE_SCORE: f64 = 50.0;

const TREND_WEIGHT: f64 = 0.3;
const VOLUME_WEIGHT: f64 = 0.2;
const PRICE_WEIGHT: f64 = 0.3;
const MARKET_WEIGHT: f64 = 0.2;
const CONTRIBUTION_BOUND: f64 = 50.0;

/// Book levels used for the depth imbalance
pub const DEPTH_LEVELS: usize = 10;

/// Individual contributions before weighting
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScoreBreakdown {
    /// Trend alignment
    pub trend: f64,
    /// Volume profile
    pub volume: f64,
    /// Price action
    pub price: f64,
    /// Order flow
    pub market: f64,
}

impl ScoreBreakdown {
    /// Weighted score clamped to [0, 100]
    #[must_use]
    pub fn score(&self) -> f64 {
        let raw = BASE_SCORE
            + self.trend * TREND_WEIGHT
            + self.volume * VOLUME_WEIGHT
            + self.price * PRICE_WEIGHT
            + self.market * MARKET_WEIGHT;
        raw.clamp(0.0, 100.0)
    }
}

const fn direction(action: SignalAction) -> f64 {
    match action.order_side() {
        Side::Buy => 1.0,
        Side::Sell => -1.0,
    }
}

fn bounded(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(-CONTRIBUTION_BOUND, CONTRIBUTION_BOUND)
    } else {
        0.0
    }
}

/// Imbalance in [-1, 1] of two non-negative volumes
fn imbalance(buy: f64, sell: f64) -> Option<f64> {
    let total = buy + sell;
    (total > 0.0).then(|| (buy - sell) / total)
}

/// Contributions for `action` given the latest market state
#[must_use]
pub fn breakdown(
    action: SignalAction,
    market: Option<&MarketSnapshot>,
    book: Option<&OrderBookSnapshot>,
) -> ScoreBreakdown {
    let sign = direction(action);
    let mut result = ScoreBreakdown::default();

    if let Some(snapshot) = market {
        result.trend = match snapshot.trend {
            Trend::Up => CONTRIBUTION_BOUND * sign,
            Trend::Down => -CONTRIBUTION_BOUND * sign,
            Trend::Sideways => 0.0,
        };
        if snapshot.samples > 0 {
            result.volume = bounded((snapshot.volume_ratio - 1.0) * CONTRIBUTION_BOUND);
        }
        result.price = bounded(snapshot.signal_strength / 2.0 * sign);
    }

    let book_flow = book.and_then(|b| imbalance(b.volume(Side::Buy, DEPTH_LEVELS), b.volume(Side::Sell, DEPTH_LEVELS)));
    let taker_flow = market
        .and_then(|m| m.buy_sell_ratio)
        .and_then(|ratio| imbalance(ratio, 1.0));
    if let Some(flow) = book_flow.or(taker_flow) {
        result.market = bounded(flow * CONTRIBUTION_BOUND * sign);
    }
    result
}

/// Confidence in [0, 100] for `action`
#[must_use]
pub fn confidence_score(
    action: SignalAction,
    market: Option<&MarketSnapshot>,
    book: Option<&OrderBookSnapshot>,
) -> f64 {
    breakdown(action, market, book).score()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;

    fn snapshot(trend: Trend, volume_ratio: f64, strength: f64) -> MarketSnapshot {
        MarketSnapshot {
            symbol: "BTCUSDT".to_string(),
            last_price: Some(100.0),
            best_bid: None,
            best_ask: None,
            mark_price: None,
            funding_rate: None,
            price_change_24h_percent: None,
            high_24h: None,
            low_24h: None,
            volume_24h: None,
            price_change_percent: 0.0,
            volatility: 0.0,
            momentum: 0.0,
            trend,
            sma_short: None,
            sma_long: None,
            volume_ratio,
            buy_sell_ratio: None,
            signal_strength: strength,
            samples: 100,
            last_update: None,
            computed_at: Utc::now(),
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_no_data_scores_base() {
        assert_eq!(confidence_score(SignalAction::Long, None, None), BASE_SCORE);
    }

    #[test]
    fn test_aligned_trend_raises_long_and_lowers_short() {
        let up = snapshot(Trend::Up, 1.0, 0.0);
        assert!(approx(confidence_score(SignalAction::Long, Some(&up), None), 65.0));
        assert!(approx(confidence_score(SignalAction::Short, Some(&up), None), 35.0));
    }

    #[test]
    fn test_weights_combine() {
        let mut market = snapshot(Trend::Up, 2.0, 100.0);
        market.buy_sell_ratio = Some(3.0);
        let parts = breakdown(SignalAction::Long, Some(&market), None);

        assert_eq!(parts.trend, 50.0);
        assert_eq!(parts.volume, 50.0);
        assert_eq!(parts.price, 50.0);
        assert_eq!(parts.market, 25.0);
        assert!(approx(parts.score(), 95.0));
    }

    #[test]
    fn test_closing_a_long_sells() {
        let down = snapshot(Trend::Down, 1.0, -60.0);
        let parts = breakdown(SignalAction::CloseLong, Some(&down), None);
        assert_eq!(parts.trend, 50.0);
        assert_eq!(parts.price, 30.0);
    }

    proptest! {
        #[test]
        fn prop_score_is_bounded(
            volume_ratio in -10.0f64..10.0,
            strength in -500.0f64..500.0,
            ratio in 0.0f64..100.0,
        ) {
            let mut market = snapshot(Trend::Up, volume_ratio, strength);
            market.buy_sell_ratio = Some(ratio);
            for action in [SignalAction::Long, SignalAction::Short] {
                let score = confidence_score(action, Some(&market), None);
                prop_assert!((0.0..=100.0).contains(&score));
            }
        }
    }
}
