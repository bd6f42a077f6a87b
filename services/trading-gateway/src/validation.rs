//! Structural signal checks
//!
//! Runs before a signal is stored. Rules are checked in a fixed order and the
//! first broken one is reported.

use crate::error::ValidationError;
use crate::signal::{MAX_VALIDITY_MINUTES, SignalAction, SignalRequest, SignalType};
use oms::SymbolFilters;
use oms::filters::DEFAULT_MAX_LEVERAGE;
use services_common::PERCENT;

fn positive(field: &'static str, value: f64) -> Result<f64, ValidationError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(ValidationError::InvalidPrice { field, value })
    }
}

fn required(signal_type: SignalType, field: &'static str, value: Option<f64>) -> Result<f64, ValidationError> {
    let value = value.ok_or(ValidationError::MissingPrice { signal_type, field })?;
    positive(field, value)
}

/// Check `request` against the symbol's exchange filters
///
/// `filters` is `None` when the exchange does not list the symbol.
///
/// # Errors
///
/// The first rule the request breaks.
pub fn validate_signal(request: &SignalRequest, filters: Option<&SymbolFilters>) -> Result<(), ValidationError> {
    let Some(filters) = filters else {
        return Err(ValidationError::UnknownSymbol {
            symbol: request.symbol.clone(),
        });
    };

    match request.signal_type {
        SignalType::Entry => validate_entry(request)?,
        SignalType::Exit => {
            if request.action.is_opening() {
                return Err(ValidationError::ActionMismatch {
                    signal_type: request.signal_type,
                    action: request.action,
                });
            }
        }
        SignalType::StopLoss | SignalType::TakeProfit => {
            required(request.signal_type, "price", request.price)?;
        }
    }

    let max = if filters.max_leverage == 0 {
        DEFAULT_MAX_LEVERAGE
    } else {
        filters.max_leverage
    };
    let requested = request.leverage.unwrap_or(1);
    if requested == 0 || requested > max {
        return Err(ValidationError::InvalidLeverage { requested, max });
    }

    if let Some(minutes) = request.time_validity.filter(|minutes| *minutes > MAX_VALIDITY_MINUTES) {
        return Err(ValidationError::InvalidTimeValidity {
            minutes,
            max: MAX_VALIDITY_MINUTES,
        });
    }
    Ok(())
}

fn validate_entry(request: &SignalRequest) -> Result<(), ValidationError> {
    if !request.action.is_opening() {
        return Err(ValidationError::ActionMismatch {
            signal_type: request.signal_type,
            action: request.action,
        });
    }
    let entry = required(SignalType::Entry, "entry_price", request.entry_price)?;
    let stop_loss = required(SignalType::Entry, "stop_loss", request.stop_loss)?;
    let take_profit = request
        .take_profit
        .map(|tp| positive("take_profit", tp))
        .transpose()?;

    let (stop_ok, target_ok) = match request.action {
        SignalAction::Long => (stop_loss < entry, take_profit.is_none_or(|tp| tp > entry)),
        _ => (stop_loss > entry, take_profit.is_none_or(|tp| tp < entry)),
    };
    if !stop_ok {
        return Err(ValidationError::StopLossWrongSide {
            action: request.action,
            entry,
            stop_loss,
        });
    }
    if !target_ok {
        return Err(ValidationError::TakeProfitWrongSide {
            action: request.action,
            entry,
            take_profit: take_profit.unwrap_or_default(),
        });
    }

    match (request.risk_percentage, request.quantity) {
        (Some(risk), _) if !(risk > 0.0 && risk <= PERCENT) => {
            Err(ValidationError::InvalidRiskPercentage { value: risk })
        }
        (Some(_), _) => Ok(()),
        (None, Some(quantity)) if !(quantity.is_finite() && quantity > 0.0) => {
            Err(ValidationError::InvalidQuantity { value: quantity })
        }
        (None, Some(_)) => Ok(()),
        (None, None) => Err(ValidationError::MissingSize),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn filters() -> SymbolFilters {
        SymbolFilters {
            symbol: "BTCUSDT".to_string(),
            min_qty: 0.001,
            max_qty: 1000.0,
            step_size: 0.001,
            min_price: 0.1,
            max_price: 0.0,
            tick_size: 0.1,
            max_leverage: 125,
        }
    }

    fn long_entry() -> SignalRequest {
        SignalRequest::entry("BTCUSDT", SignalAction::Long, 100.0, 98.0)
            .with_take_profit(104.0)
            .with_risk_percentage(1.0)
    }

    #[test]
    fn test_valid_entries_pass() {
        assert_eq!(validate_signal(&long_entry(), Some(&filters())), Ok(()));
        let short = SignalRequest::entry("BTCUSDT", SignalAction::Short, 100.0, 102.0)
            .with_take_profit(95.0)
            .with_quantity(0.5);
        assert_eq!(validate_signal(&short, Some(&filters())), Ok(()));
    }

    #[test]
    fn test_unknown_symbol_checked_first() {
        let mut request = long_entry();
        request.stop_loss = None;
        assert_eq!(
            validate_signal(&request, None),
            Err(ValidationError::UnknownSymbol {
                symbol: "BTCUSDT".to_string()
            })
        );
    }

    #[rstest]
    #[case::long_stop_above(SignalAction::Long, 100.0, 101.0)]
    #[case::long_stop_at_entry(SignalAction::Long, 100.0, 100.0)]
    #[case::short_stop_below(SignalAction::Short, 100.0, 99.0)]
    fn test_stop_on_wrong_side(#[case] action: SignalAction, #[case] entry: f64, #[case] stop: f64) {
        let request = SignalRequest::entry("BTCUSDT", action, entry, stop).with_risk_percentage(1.0);
        assert!(matches!(
            validate_signal(&request, Some(&filters())),
            Err(ValidationError::StopLossWrongSide { .. })
        ));
    }

    #[rstest]
    #[case::long(SignalAction::Long, 98.0, 99.0)]
    #[case::short(SignalAction::Short, 102.0, 101.0)]
    fn test_target_on_wrong_side(#[case] action: SignalAction, #[case] stop: f64, #[case] target: f64) {
        let request = SignalRequest::entry("BTCUSDT", action, 100.0, stop)
            .with_take_profit(target)
            .with_risk_percentage(1.0);
        assert!(matches!(
            validate_signal(&request, Some(&filters())),
            Err(ValidationError::TakeProfitWrongSide { .. })
        ));
    }

    #[test]
    fn test_entry_requires_prices() {
        let mut request = long_entry();
        request.entry_price = None;
        assert_eq!(
            validate_signal(&request, Some(&filters())),
            Err(ValidationError::MissingPrice {
                signal_type: SignalType::Entry,
                field: "entry_price"
            })
        );

        let mut request = long_entry();
        request.stop_loss = Some(-1.0);
        assert_eq!(
            validate_signal(&request, Some(&filters())),
            Err(ValidationError::InvalidPrice {
                field: "stop_loss",
                value: -1.0
            })
        );
    }

    #[rstest]
    #[case(0.0)]
    #[case(-5.0)]
    #[case(100.5)]
    fn test_risk_percentage_bounds(#[case] risk: f64) {
        let request = SignalRequest::entry("BTCUSDT", SignalAction::Long, 100.0, 98.0).with_risk_percentage(risk);
        assert_eq!(
            validate_signal(&request, Some(&filters())),
            Err(ValidationError::InvalidRiskPercentage { value: risk })
        );
    }

    #[test]
    fn test_full_risk_is_allowed() {
        let request = SignalRequest::entry("BTCUSDT", SignalAction::Long, 100.0, 98.0).with_risk_percentage(100.0);
        assert_eq!(validate_signal(&request, Some(&filters())), Ok(()));
    }

    #[test]
    fn test_entry_needs_size() {
        let request = SignalRequest::entry("BTCUSDT", SignalAction::Long, 100.0, 98.0);
        assert_eq!(validate_signal(&request, Some(&filters())), Err(ValidationError::MissingSize));
    }

    #[rstest]
    #[case(SignalType::Entry, SignalAction::CloseLong)]
    #[case(SignalType::Exit, SignalAction::Long)]
    #[case(SignalType::Exit, SignalAction::Short)]
    fn test_action_must_fit_type(#[case] signal_type: SignalType, #[case] action: SignalAction) {
        let mut request = long_entry();
        request.signal_type = signal_type;
        request.action = action;
        assert_eq!(
            validate_signal(&request, Some(&filters())),
            Err(ValidationError::ActionMismatch { signal_type, action })
        );
    }

    #[test]
    fn test_exit_needs_no_prices() {
        let request = SignalRequest::exit("BTCUSDT", SignalAction::CloseShort);
        assert_eq!(validate_signal(&request, Some(&filters())), Ok(()));
    }

    #[test]
    fn test_protective_update_needs_price() {
        let mut request = SignalRequest::protective(SignalType::StopLoss, "BTCUSDT", SignalAction::Long, 97.0);
        assert_eq!(validate_signal(&request, Some(&filters())), Ok(()));
        request.price = None;
        assert_eq!(
            validate_signal(&request, Some(&filters())),
            Err(ValidationError::MissingPrice {
                signal_type: SignalType::StopLoss,
                field: "price"
            })
        );
    }

    #[rstest]
    #[case(0)]
    #[case(126)]
    fn test_leverage_bounds(#[case] leverage: u32) {
        let request = long_entry().with_leverage(leverage);
        assert_eq!(
            validate_signal(&request, Some(&filters())),
            Err(ValidationError::InvalidLeverage {
                requested: leverage,
                max: 125
            })
        );
    }

    #[test]
    fn test_symbol_bracket_caps_leverage() {
        let mut tight = filters();
        tight.max_leverage = 20;
        let request = long_entry().with_leverage(25);
        assert_eq!(
            validate_signal(&request, Some(&tight)),
            Err(ValidationError::InvalidLeverage { requested: 25, max: 20 })
        );
    }

    #[rstest]
    #[case(MAX_VALIDITY_MINUTES + 1)]
    #[case(i64::MAX)]
    fn test_validity_window_is_capped(#[case] minutes: i64) {
        let request = long_entry().with_time_validity(minutes);
        assert_eq!(
            validate_signal(&request, Some(&filters())),
            Err(ValidationError::InvalidTimeValidity {
                minutes,
                max: MAX_VALIDITY_MINUTES
            })
        );
        let longest = long_entry().with_time_validity(MAX_VALIDITY_MINUTES);
        assert_eq!(validate_signal(&longest, Some(&filters())), Ok(()));
    }
}
