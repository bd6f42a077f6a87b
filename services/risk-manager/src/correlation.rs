//! Correlation between a candidate symbol and open positions
//!
//! Pearson correlation of log returns over the most recent closes of both
//! symbols. Series are aligned on their tails; fewer overlapping returns
//! than the configured minimum means the pair is treated as uncorrelated.

use services_common::math::{log_returns, pearson};

/// Source of recent closing prices, oldest first
pub trait PriceHistory: Send + Sync {
    /// Up to `limit` most recent prices for `symbol`
    fn recent_closes(&self, symbol: &str, limit: usize) -> Vec<f64>;
}

impl<F> PriceHistory for F
where
    F: Fn(&str, usize) -> Vec<f64> + Send + Sync,
{
    fn recent_closes(&self, symbol: &str, limit: usize) -> Vec<f64> {
        self(symbol, limit)
    }
}

/// Strongest correlation found against open positions
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelatedPair {
    /// Open position symbol
    pub symbol: String,
    /// Correlation of log returns
    pub correlation: f64,
}

/// Correlation estimator with a fixed lookback
#[derive(Debug, Clone, Copy)]
pub struct CorrelationEstimator {
    samples: usize,
    min_returns: usize,
}

impl CorrelationEstimator {
    /// Use `samples` closes per symbol and require `min_returns` overlapping returns
    #[must_use]
    pub const fn new(samples: usize, min_returns: usize) -> Self {
        Self { samples, min_returns }
    }

    /// Closes requested per symbol
    #[must_use]
    pub const fn samples(&self) -> usize {
        self.samples
    }

    /// Correlation of two price series, `None` when there is too little data
    #[must_use]
    pub fn correlation(&self, a: &[f64], b: &[f64]) -> Option<f64> {
        let ra = log_returns(a);
        let rb = log_returns(b);
        let n = ra.len().min(rb.len());
        if n < self.min_returns.max(2) {
            return None;
        }
        pearson(&ra[ra.len() - n..], &rb[rb.len() - n..])
    }

    /// Highest correlation between `symbol` and any of `others`
    pub fn most_correlated<'a>(
        &self,
        history: &dyn PriceHistory,
        symbol: &str,
        others: impl IntoIterator<Item = &'a str>,
    ) -> Option<CorrelatedPair> {
        let candidate = history.recent_closes(symbol, self.samples);
        others
            .into_iter()
            .filter(|other| !other.eq_ignore_ascii_case(symbol))
            .filter_map(|other| {
                let closes = history.recent_closes(other, self.samples);
                self.correlation(&candidate, &closes).map(|correlation| CorrelatedPair {
                    symbol: other.to_string(),
                    correlation,
                })
            })
            .max_by(|x, y| x.correlation.total_cmp(&y.correlation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn walk(seed: f64, len: usize) -> Vec<f64> {
        (0..len)
            .map(|i| {
                let i = i as f64;
                100.0 + (i * seed).sin() * 5.0 + i * 0.1
            })
            .collect()
    }

    #[test]
    fn test_identical_series_are_fully_correlated() {
        let estimator = CorrelationEstimator::new(30, 10);
        let prices = walk(0.7, 30);
        let corr = estimator.correlation(&prices, &prices).expect("enough data");
        assert!((corr - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_short_history_is_uncorrelated() {
        let estimator = CorrelationEstimator::new(30, 10);
        assert_eq!(estimator.correlation(&walk(0.7, 5), &walk(0.7, 30)), None);
    }

    #[test]
    fn test_most_correlated_skips_same_symbol() {
        let estimator = CorrelationEstimator::new(30, 10);
        let history = |symbol: &str, limit: usize| -> Vec<f64> {
            match symbol {
                "ETHUSDT" | "BTCUSDT" => walk(0.7, limit),
                _ => walk(2.3, limit),
            }
        };
        let found = estimator
            .most_correlated(&history, "BTCUSDT", ["BTCUSDT", "ETHUSDT", "XRPUSDT"])
            .expect("pairs measured");
        assert_eq!(found.symbol, "ETHUSDT");
        assert!(found.correlation > 0.99);
    }
}
