//! Pre-trade risk gate
//!
//! Every check runs in a fixed order and the first failure short-circuits
//! with its own [`RiskRejection`]. The gate keeps no account state of its
//! own; callers hand it an [`AccountSnapshot`] per request, so two requests
//! for the same account must be serialized by the caller.

use crate::correlation::{CorrelationEstimator, PriceHistory};
use crate::error::{RiskRejection, RiskResult};
use crate::exposure::{AccountSnapshot, PositionRequest};
use crate::limits::RiskLimits;
use serde::{Deserialize, Serialize};
use services_common::PositionSide;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Outcome of a risk check
#[derive(Debug, Clone, PartialEq)]
pub enum RiskDecision {
    /// Request may proceed
    Approved,
    /// Request breaks the contained rule
    Rejected(RiskRejection),
}

impl RiskDecision {
    /// Whether the request may proceed
    #[must_use]
    pub const fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }

    /// Convert into a `Result` for `?` propagation
    ///
    /// # Errors
    ///
    /// The rejection, when rejected.
    pub fn into_result(self) -> RiskResult<()> {
        match self {
            Self::Approved => Ok(()),
            Self::Rejected(rejection) => Err(rejection),
        }
    }
}

impl From<RiskResult<()>> for RiskDecision {
    fn from(result: RiskResult<()>) -> Self {
        match result {
            Ok(()) => Self::Approved,
            Err(rejection) => Self::Rejected(rejection),
        }
    }
}

/// Counters of gate activity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskGateMetrics {
    /// Requests evaluated
    pub checks: u64,
    /// Requests approved
    pub approved: u64,
    /// Requests rejected
    pub rejected: u64,
}

/// Risk gate over a fixed set of limits
pub struct RiskGate {
    limits: RiskLimits,
    correlation: CorrelationEstimator,
    history: Option<Arc<dyn PriceHistory>>,
    checks: AtomicU64,
    approved: AtomicU64,
    rejected: AtomicU64,
}

impl std::fmt::Debug for RiskGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskGate")
            .field("limits", &self.limits)
            .field("correlation", &self.correlation)
            .field("has_history", &self.history.is_some())
            .finish_non_exhaustive()
    }
}

impl RiskGate {
    /// Gate without price history; correlation checks always pass
    #[must_use]
    pub fn new(limits: RiskLimits) -> Self {
        let correlation = CorrelationEstimator::new(limits.correlation_samples, limits.min_correlation_returns);
        Self {
            limits,
            correlation,
            history: None,
            checks: AtomicU64::new(0),
            approved: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Attach a price history for correlation checks
    #[must_use]
    pub fn with_price_history(mut self, history: Arc<dyn PriceHistory>) -> Self {
        self.history = Some(history);
        self
    }

    /// Configured limits
    #[must_use]
    pub const fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Validate a new position
    ///
    /// Checks, in order: leverage, notional, open position count, daily
    /// loss, correlation with open positions.
    ///
    /// # Arguments
    ///
    /// * `request` - Symbol, side, quantity, expected price and leverage
    /// * `account` - Balance, today's PnL and open positions
    ///
    /// # Example
    ///
    /// ```
    /// use risk_manager::{AccountSnapshot, PositionRequest, RiskGate, RiskLimits, RiskRejection};
    /// use services_common::PositionSide;
    ///
    /// let gate = RiskGate::new(RiskLimits::default());
    /// let account = AccountSnapshot::with_balance(10_000.0);
    ///
    /// let ok = PositionRequest::new("BTCUSDT", PositionSide::Long, 50.0, 100.0, 1);
    /// assert!(gate.validate_new_position(&ok, &account).is_approved());
    ///
    /// let too_much = PositionRequest::new("BTCUSDT", PositionSide::Long, 1e6, 100.0, 200);
    /// let decision = gate.validate_new_position(&too_much, &account);
    /// assert!(matches!(
    ///     decision.into_result(),
    ///     Err(RiskRejection::LeverageTooHigh { requested: 200, max: 125 })
    /// ));
    /// ```
    pub fn validate_new_position(&self, request: &PositionRequest, account: &AccountSnapshot) -> RiskDecision {
        self.record(request, self.new_position_checks(request, account))
    }

    /// Validate an increase of an existing position
    ///
    /// Same as [`Self::validate_new_position`] minus the position count and
    /// correlation checks, which do not apply to a position already open.
    /// `request.quantity` is the resulting total size.
    pub fn validate_increase(&self, request: &PositionRequest, account: &AccountSnapshot) -> RiskDecision {
        let result = self
            .check_request(request, account)
            .and_then(|()| self.check_leverage(request))
            .and_then(|()| self.check_notional(request, account))
            .and_then(|()| self.check_daily_loss(account));
        self.record(request, result)
    }

    /// Validate right before an order goes out
    ///
    /// Runs the new-position checks, then margin usage, total exposure and
    /// daily drawdown.
    pub fn validate_execution(&self, request: &PositionRequest, account: &AccountSnapshot) -> RiskDecision {
        let result = self
            .new_position_checks(request, account)
            .and_then(|()| self.check_margin_usage(request, account))
            .and_then(|()| self.check_exposure(request, account))
            .and_then(|()| self.check_drawdown(account));
        self.record(request, result)
    }

    /// Activity counters
    #[must_use]
    pub fn get_metrics(&self) -> RiskGateMetrics {
        RiskGateMetrics {
            checks: self.checks.load(Ordering::Relaxed),
            approved: self.approved.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Stop-loss price risking `risk_per_trade` of `balance` on `size` notional
    ///
    /// Falls back to the configured per-position loss when `risk_per_trade`
    /// is `None`.
    #[must_use]
    pub fn stop_loss_price(
        &self,
        entry: f64,
        size: f64,
        balance: f64,
        risk_per_trade: Option<f64>,
        side: PositionSide,
    ) -> Option<f64> {
        stop_loss_price(entry, size, balance, risk_per_trade.unwrap_or(self.limits.max_position_loss), side)
    }

    /// Take-profit price at the configured reward ratio
    #[must_use]
    pub fn take_profit_price(&self, entry: f64, stop_loss: f64) -> f64 {
        take_profit_price(entry, stop_loss, self.limits.reward_ratio)
    }

    /// Liquidation price at the configured maintenance margin rate
    #[must_use]
    pub fn liquidation_price(&self, entry: f64, leverage: u32, side: PositionSide) -> f64 {
        liquidation_price(entry, leverage, side, self.limits.maintenance_margin_rate)
    }

    fn new_position_checks(&self, request: &PositionRequest, account: &AccountSnapshot) -> RiskResult<()> {
        self.check_request(request, account)?;
        self.check_leverage(request)?;
        self.check_notional(request, account)?;
        self.check_position_count(account)?;
        self.check_daily_loss(account)?;
        self.check_correlation(request, account)
    }

    fn record(&self, request: &PositionRequest, result: RiskResult<()>) -> RiskDecision {
        self.checks.fetch_add(1, Ordering::Relaxed);
        match &result {
            Ok(()) => {
                self.approved.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("risk_gate_approved_total").increment(1);
                debug!(
                    "Risk approved {} {} {} @ {} x{}",
                    request.symbol, request.side, request.quantity, request.price, request.leverage
                );
            }
            Err(rejection) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("risk_gate_rejected_total", "rule" => rejection.rule()).increment(1);
                warn!("Order rejected for {}: {}", request.symbol, rejection);
            }
        }
        result.into()
    }

    fn check_request(&self, request: &PositionRequest, account: &AccountSnapshot) -> RiskResult<()> {
        let invalid = |reason: String| Err(RiskRejection::InvalidRequest { reason });
        if !(request.quantity.is_finite() && request.quantity > 0.0) {
            return invalid(format!("quantity {}", request.quantity));
        }
        if !(request.price.is_finite() && request.price > 0.0) {
            return invalid(format!("price {}", request.price));
        }
        if request.leverage == 0 {
            return invalid("leverage 0".to_string());
        }
        if !(account.balance.is_finite() && account.balance > 0.0) {
            return invalid(format!("balance {}", account.balance));
        }
        Ok(())
    }

    fn check_leverage(&self, request: &PositionRequest) -> RiskResult<()> {
        if request.leverage > self.limits.max_leverage {
            return Err(RiskRejection::LeverageTooHigh {
                requested: request.leverage,
                max: self.limits.max_leverage,
            });
        }
        Ok(())
    }

    fn check_notional(&self, request: &PositionRequest, account: &AccountSnapshot) -> RiskResult<()> {
        let notional = request.notional();
        let max = self.limits.max_notional(account.balance, request.leverage);
        if notional > max + services_common::EPSILON {
            return Err(RiskRejection::PositionTooLarge { notional, max });
        }
        Ok(())
    }

    fn check_position_count(&self, account: &AccountSnapshot) -> RiskResult<()> {
        let open = account.open_count();
        if open >= self.limits.max_positions {
            return Err(RiskRejection::TooManyPositions {
                open,
                max: self.limits.max_positions,
            });
        }
        Ok(())
    }

    fn check_daily_loss(&self, account: &AccountSnapshot) -> RiskResult<()> {
        let pnl = account.daily_pnl();
        let floor = self.limits.daily_loss_floor(account.balance);
        if pnl < floor {
            return Err(RiskRejection::DailyLossLimit { pnl, floor });
        }
        Ok(())
    }

    fn check_correlation(&self, request: &PositionRequest, account: &AccountSnapshot) -> RiskResult<()> {
        let Some(history) = &self.history else {
            return Ok(());
        };
        let open = account.positions.iter().map(|p| p.symbol.as_str());
        if let Some(pair) = self.correlation.most_correlated(history.as_ref(), &request.symbol, open) {
            if pair.correlation > self.limits.correlation_threshold {
                return Err(RiskRejection::CorrelationTooHigh {
                    symbol: request.symbol.clone(),
                    other: pair.symbol,
                    correlation: pair.correlation,
                    threshold: self.limits.correlation_threshold,
                });
            }
        }
        Ok(())
    }

    fn check_margin_usage(&self, request: &PositionRequest, account: &AccountSnapshot) -> RiskResult<()> {
        let ratio = (account.margin_used() + request.margin()) / account.balance;
        if ratio > self.limits.max_margin_usage {
            return Err(RiskRejection::MarginUsageTooHigh {
                ratio,
                max: self.limits.max_margin_usage,
            });
        }
        Ok(())
    }

    fn check_exposure(&self, request: &PositionRequest, account: &AccountSnapshot) -> RiskResult<()> {
        let exposure = account.total_exposure() + request.notional();
        let max = account.balance * self.limits.max_exposure_multiple;
        if exposure > max {
            return Err(RiskRejection::ExposureTooHigh { exposure, max });
        }
        Ok(())
    }

    fn check_drawdown(&self, account: &AccountSnapshot) -> RiskResult<()> {
        let drawdown = account.drawdown();
        if drawdown > self.limits.max_daily_loss {
            return Err(RiskRejection::DrawdownTooHigh {
                drawdown,
                max: self.limits.max_daily_loss,
            });
        }
        Ok(())
    }
}

/// Stop-loss price for a position of `size` notional risking `risk_per_trade` of `balance`
///
/// Returns `None` for non-positive inputs.
#[must_use]
pub fn stop_loss_price(entry: f64, size: f64, balance: f64, risk_per_trade: f64, side: PositionSide) -> Option<f64> {
    if entry <= 0.0 || size <= 0.0 || balance <= 0.0 || risk_per_trade <= 0.0 {
        return None;
    }
    let max_loss = balance * risk_per_trade;
    let distance = max_loss / size * entry;
    Some(entry - side.sign() * distance)
}

/// Take-profit price `reward_ratio` stop distances beyond entry
///
/// Works for both directions: a stop above entry yields a target below it.
#[must_use]
pub fn take_profit_price(entry: f64, stop_loss: f64, reward_ratio: f64) -> f64 {
    entry + (entry - stop_loss) * reward_ratio
}

/// Liquidation price of an isolated position
#[must_use]
pub fn liquidation_price(entry: f64, leverage: u32, side: PositionSide, maintenance_margin_rate: f64) -> f64 {
    let inverse_leverage = 1.0 / f64::from(leverage.max(1));
    match side {
        PositionSide::Long => entry * (1.0 - inverse_leverage + maintenance_margin_rate),
        PositionSide::Short => entry * (1.0 + inverse_leverage - maintenance_margin_rate),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_liquidation_formula() {
        assert!((liquidation_price(100.0, 10, PositionSide::Long, 0.01) - 91.0).abs() < 1e-9);
        assert!((liquidation_price(100.0, 10, PositionSide::Short, 0.01) - 109.0).abs() < 1e-9);
    }

    #[test]
    fn test_stop_and_target_are_mirrored_for_shorts() {
        let long_stop = stop_loss_price(100.0, 5_000.0, 10_000.0, 0.01, PositionSide::Long).expect("valid");
        let short_stop = stop_loss_price(100.0, 5_000.0, 10_000.0, 0.01, PositionSide::Short).expect("valid");
        assert!((long_stop - 98.0).abs() < 1e-9);
        assert!((short_stop - 102.0).abs() < 1e-9);
        assert!((take_profit_price(100.0, long_stop, 2.0) - 104.0).abs() < 1e-9);
        assert!((take_profit_price(100.0, short_stop, 2.0) - 96.0).abs() < 1e-9);
    }

    #[test]
    fn test_decision_conversions() {
        let rejection = RiskRejection::TooManyPositions { open: 10, max: 10 };
        let decision = RiskDecision::from(Err(rejection.clone()));
        assert!(!decision.is_approved());
        assert_eq!(decision.into_result(), Err(rejection));
        assert!(RiskDecision::from(Ok(())).is_approved());
    }
}
