//! Order and position lifecycle management

use crate::error::{OmsError, OmsResult};
use crate::order::{ExchangeOrder, Order, OrderRequest, OrderStatus, OrderType};
use crate::position::{Position, PositionStatus};
use chrono::Utc;
use std::collections::HashMap;
use tracing::debug;

/// Result of folding an exchange report into an order
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReportOutcome {
    /// Status before the report
    pub old_status: OrderStatus,
    /// Status after the report
    pub new_status: OrderStatus,
    /// Newly executed quantity
    pub filled_quantity: f64,
    /// Average price of the newly executed quantity
    pub fill_price: Option<f64>,
}

impl ReportOutcome {
    /// Status changed
    #[must_use]
    pub fn status_changed(&self) -> bool {
        self.old_status != self.new_status
    }
}

/// Order lifecycle manager
#[derive(Debug)]
pub struct OrderLifecycleManager {
    /// Valid state transitions
    valid_transitions: HashMap<OrderStatus, Vec<OrderStatus>>,
    /// Valid position state transitions
    position_transitions: HashMap<PositionStatus, Vec<PositionStatus>>,
}

impl Default for OrderLifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderLifecycleManager {
    /// Create new lifecycle manager
    #[must_use]
    pub fn new() -> Self {
        let mut valid_transitions = HashMap::new();

        valid_transitions.insert(
            OrderStatus::New,
            vec![
                OrderStatus::PartiallyFilled,
                OrderStatus::Filled,
                OrderStatus::PendingCancel,
                OrderStatus::Canceled,
                OrderStatus::Rejected,
                OrderStatus::Expired,
            ],
        );

        valid_transitions.insert(
            OrderStatus::PartiallyFilled,
            vec![
                OrderStatus::Filled,
                OrderStatus::PendingCancel,
                OrderStatus::Canceled,
                OrderStatus::Expired,
            ],
        );

        valid_transitions.insert(
            OrderStatus::PendingCancel,
            vec![OrderStatus::Canceled, OrderStatus::Filled, OrderStatus::Expired],
        );

        // Terminal states have no transitions
        valid_transitions.insert(OrderStatus::Filled, vec![]);
        valid_transitions.insert(OrderStatus::Canceled, vec![]);
        valid_transitions.insert(OrderStatus::Rejected, vec![]);
        valid_transitions.insert(OrderStatus::Expired, vec![]);

        let mut position_transitions = HashMap::new();
        position_transitions.insert(
            PositionStatus::Open,
            vec![PositionStatus::Closed, PositionStatus::Liquidated],
        );
        position_transitions.insert(PositionStatus::Closed, vec![]);
        position_transitions.insert(PositionStatus::Liquidated, vec![]);

        Self {
            valid_transitions,
            position_transitions,
        }
    }

    /// Validate an order request before it reaches the exchange
    ///
    /// # Errors
    ///
    /// Returns a validation error for missing or non-positive fields.
    pub fn validate_request(&self, request: &OrderRequest) -> OmsResult<()> {
        if request.symbol.is_empty() {
            return Err(OmsError::validation("Symbol is required"));
        }
        if !request.close_position && !(request.quantity > 0.0) {
            return Err(OmsError::validation("Order quantity must be positive"));
        }
        if request.order_type.requires_price() && !request.price.is_some_and(|p| p > 0.0) {
            return Err(OmsError::validation(format!(
                "{} order requires a positive price",
                request.order_type
            )));
        }
        if request.order_type.requires_stop_price()
            && !request.stop_price.is_some_and(|p| p > 0.0)
        {
            return Err(OmsError::validation(format!(
                "{} order requires a positive stop price",
                request.order_type
            )));
        }
        if request.close_position
            && !matches!(
                request.order_type,
                OrderType::StopMarket | OrderType::TakeProfitMarket
            )
        {
            return Err(OmsError::validation(
                "closePosition is only valid on stop or take-profit market orders",
            ));
        }
        if request.leverage == Some(0) {
            return Err(OmsError::validation("Leverage must be at least 1"));
        }
        Ok(())
    }

    /// Validate state transition
    ///
    /// # Errors
    ///
    /// Returns [`OmsError::InvalidOrderState`] for a transition the map does not allow.
    pub fn validate_transition(&self, order: &Order, new_status: OrderStatus) -> OmsResult<()> {
        let current_status = order.status;

        if let Some(valid_next_states) = self.valid_transitions.get(&current_status)
            && valid_next_states.contains(&new_status)
        {
            debug!("Valid transition: {:?} -> {:?}", current_status, new_status);
            return Ok(());
        }

        Err(OmsError::InvalidOrderState {
            order_id: order.id.to_string(),
            operation: format!("moved to {new_status}"),
            current_state: current_status.to_string(),
        })
    }

    /// Validate a position state transition
    ///
    /// # Errors
    ///
    /// Returns [`OmsError::InvalidPositionState`] for a transition the map does not allow.
    pub fn validate_position_transition(
        &self,
        position: &Position,
        new_status: PositionStatus,
    ) -> OmsResult<()> {
        if let Some(valid_next_states) = self.position_transitions.get(&position.status)
            && valid_next_states.contains(&new_status)
        {
            return Ok(());
        }
        Err(OmsError::InvalidPositionState {
            position_id: position.id.to_string(),
            operation: format!("moved to {new_status}"),
            current_state: position.status.to_string(),
        })
    }

    /// Check if order can be cancelled
    #[must_use]
    pub const fn can_cancel(&self, order: &Order) -> bool {
        order.status.is_active()
    }

    /// Check if order can be amended
    #[must_use]
    pub const fn can_amend(&self, order: &Order) -> bool {
        matches!(order.status, OrderStatus::New)
    }

    /// Fold an exchange report into `order`
    ///
    /// Executed quantity never decreases. A report repeating the current
    /// status only refreshes execution fields.
    ///
    /// # Errors
    ///
    /// Returns [`OmsError::InvalidOrderState`] if the reported status cannot
    /// follow the current one; the order is left untouched.
    pub fn apply_report(&self, order: &mut Order, report: &ExchangeOrder) -> OmsResult<ReportOutcome> {
        let old_status = order.status;
        if report.status != old_status {
            self.validate_transition(order, report.status)?;
        }

        let old_executed = order.executed_quantity;
        let old_average = order.average_price.unwrap_or(0.0);
        let new_executed = report.executed_quantity.max(old_executed);
        let filled_quantity = new_executed - old_executed;
        let new_average = report.average_price.filter(|p| *p > 0.0);

        let fill_price = if filled_quantity > 0.0 {
            new_average.map(|avg| {
                let incremental = (avg * new_executed - old_average * old_executed) / filled_quantity;
                if incremental > 0.0 { incremental } else { avg }
            })
        } else {
            None
        };

        let now = Utc::now();
        order.status = report.status;
        order.executed_quantity = new_executed;
        if new_average.is_some() {
            order.average_price = new_average;
        }
        if report.status == OrderStatus::Filled && order.filled_at.is_none() {
            order.filled_at = Some(now);
        }
        if report.status == OrderStatus::Expired && order.expired_at.is_none() {
            order.expired_at = Some(now);
        }
        order.updated_at = now;

        Ok(ReportOutcome {
            old_status,
            new_status: report.status,
            filled_quantity,
            fill_price,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use services_common::Side;

    fn order(status: OrderStatus) -> Order {
        let request = OrderRequest::limit("BTCUSDT", Side::Buy, 2.0, 100.0);
        let ack = ExchangeOrder {
            order_id: "42".to_string(),
            client_order_id: "c42".to_string(),
            symbol: "BTCUSDT".to_string(),
            status,
            quantity: 2.0,
            executed_quantity: 0.0,
            average_price: None,
            update_time: 0,
        };
        Order::from_ack("u1", &request, &ack, None)
    }

    fn report(status: OrderStatus, executed: f64, average: Option<f64>) -> ExchangeOrder {
        ExchangeOrder {
            order_id: "42".to_string(),
            client_order_id: "c42".to_string(),
            symbol: "BTCUSDT".to_string(),
            status,
            quantity: 2.0,
            executed_quantity: executed,
            average_price: average,
            update_time: 1,
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        let lifecycle = OrderLifecycleManager::new();
        for status in [OrderStatus::Filled, OrderStatus::Canceled, OrderStatus::Rejected, OrderStatus::Expired] {
            assert!(lifecycle.validate_transition(&order(status), OrderStatus::New).is_err());
            assert!(lifecycle.validate_transition(&order(status), OrderStatus::PartiallyFilled).is_err());
        }
    }

    #[test]
    fn test_fill_path() {
        let lifecycle = OrderLifecycleManager::new();
        let new = order(OrderStatus::New);
        assert!(lifecycle.validate_transition(&new, OrderStatus::PartiallyFilled).is_ok());
        assert!(lifecycle.validate_transition(&new, OrderStatus::Rejected).is_ok());
        let partial = order(OrderStatus::PartiallyFilled);
        assert!(lifecycle.validate_transition(&partial, OrderStatus::Filled).is_ok());
        assert!(lifecycle.validate_transition(&partial, OrderStatus::Rejected).is_err());
    }

    #[test]
    fn test_apply_report_tracks_incremental_fills() {
        let lifecycle = OrderLifecycleManager::new();
        let mut order = order(OrderStatus::New);

        let first = lifecycle
            .apply_report(&mut order, &report(OrderStatus::PartiallyFilled, 1.0, Some(100.0)))
            .expect("valid transition");
        assert_eq!(first.filled_quantity, 1.0);
        assert_eq!(first.fill_price, Some(100.0));

        // Average 101 over 2 units means the second unit filled at 102
        let second = lifecycle
            .apply_report(&mut order, &report(OrderStatus::Filled, 2.0, Some(101.0)))
            .expect("valid transition");
        assert!((second.fill_price.unwrap_or_default() - 102.0).abs() < 1e-9);
        assert!(order.filled_at.is_some());
        assert!(order.is_terminal());

        assert!(lifecycle
            .apply_report(&mut order, &report(OrderStatus::New, 2.0, Some(101.0)))
            .is_err());
        assert_eq!(order.status, OrderStatus::Filled);
    }

    #[test]
    fn test_request_validation() {
        let lifecycle = OrderLifecycleManager::new();
        let mut request = OrderRequest::limit("BTCUSDT", Side::Buy, 1.0, 100.0);
        assert!(lifecycle.validate_request(&request).is_ok());
        request.price = None;
        assert!(lifecycle.validate_request(&request).is_err());
        let stop = OrderRequest {
            stop_price: None,
            ..OrderRequest::stop_market("BTCUSDT", Side::Sell, 1.0, 90.0)
        };
        assert!(lifecycle.validate_request(&stop).is_err());
        assert!(lifecycle.validate_request(&OrderRequest::market("BTCUSDT", Side::Buy, 0.0)).is_err());
    }

    #[test]
    fn test_position_transitions() {
        let lifecycle = OrderLifecycleManager::new();
        let mut position = Position::open(
            "u1",
            "BTCUSDT",
            services_common::PositionSide::Long,
            100.0,
            1.0,
            1,
            services_common::MarginType::Crossed,
            0.004,
        );
        assert!(lifecycle.validate_position_transition(&position, PositionStatus::Liquidated).is_ok());
        position.status = PositionStatus::Closed;
        assert!(lifecycle.validate_position_transition(&position, PositionStatus::Open).is_err());
        assert!(lifecycle.validate_position_transition(&position, PositionStatus::Liquidated).is_err());
    }
}
