//! Order definitions and structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use services_common::{Side, normalize_symbol};
use std::fmt;
use uuid::Uuid;

/// Futures order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    /// Market order
    Market,
    /// Limit order
    Limit,
    /// Market order triggered at the stop price
    StopMarket,
    /// Limit order triggered at the stop price
    StopLimit,
    /// Market order triggered at the profit target
    TakeProfitMarket,
    /// Limit order triggered at the profit target
    TakeProfitLimit,
}

impl OrderType {
    /// Exchange wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Market => "MARKET",
            Self::Limit => "LIMIT",
            Self::StopMarket => "STOP_MARKET",
            // The futures API names stop-limit orders STOP
            Self::StopLimit => "STOP",
            Self::TakeProfitMarket => "TAKE_PROFIT_MARKET",
            Self::TakeProfitLimit => "TAKE_PROFIT",
        }
    }

    /// Parse an exchange wire name
    #[must_use]
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "MARKET" => Some(Self::Market),
            "LIMIT" => Some(Self::Limit),
            "STOP_MARKET" => Some(Self::StopMarket),
            "STOP" | "STOP_LIMIT" => Some(Self::StopLimit),
            "TAKE_PROFIT_MARKET" => Some(Self::TakeProfitMarket),
            "TAKE_PROFIT" | "TAKE_PROFIT_LIMIT" => Some(Self::TakeProfitLimit),
            _ => None,
        }
    }

    /// Order carries a limit price
    #[must_use]
    pub const fn requires_price(self) -> bool {
        matches!(self, Self::Limit | Self::StopLimit | Self::TakeProfitLimit)
    }

    /// Order carries a trigger price
    #[must_use]
    pub const fn requires_stop_price(self) -> bool {
        matches!(
            self,
            Self::StopMarket | Self::StopLimit | Self::TakeProfitMarket | Self::TakeProfitLimit
        )
    }

    /// Limit orders need a time in force on the wire
    #[must_use]
    pub const fn takes_time_in_force(self) -> bool {
        self.requires_price()
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order status as reported by the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Accepted, nothing executed yet
    New,
    /// Partially executed
    PartiallyFilled,
    /// Fully executed
    Filled,
    /// Cancelled
    Canceled,
    /// Cancel requested, not yet confirmed
    PendingCancel,
    /// Rejected
    Rejected,
    /// Expired by time in force
    Expired,
}

impl OrderStatus {
    /// Exchange wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Filled => "FILLED",
            Self::Canceled => "CANCELED",
            Self::PendingCancel => "PENDING_CANCEL",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
        }
    }

    /// Parse an exchange wire name
    #[must_use]
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(Self::New),
            "PARTIALLY_FILLED" => Some(Self::PartiallyFilled),
            "FILLED" => Some(Self::Filled),
            "CANCELED" => Some(Self::Canceled),
            "PENDING_CANCEL" => Some(Self::PendingCancel),
            "REJECTED" => Some(Self::Rejected),
            "EXPIRED" | "EXPIRED_IN_MATCH" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Still working on the exchange
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::New | Self::PartiallyFilled)
    }

    /// No further transitions possible
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Canceled | Self::Rejected | Self::Expired
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time in force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    /// Good till cancelled
    #[default]
    Gtc,
    /// Immediate or cancel
    Ioc,
    /// Fill or kill
    Fok,
    /// Good till crossing (post only)
    Gtx,
}

impl TimeInForce {
    /// Exchange wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gtc => "GTC",
            Self::Ioc => "IOC",
            Self::Fok => "FOK",
            Self::Gtx => "GTX",
        }
    }
}

/// Order request for creating new orders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Symbol
    pub symbol: String,
    /// Side
    pub side: Side,
    /// Order type
    pub order_type: OrderType,
    /// Quantity in base units
    pub quantity: f64,
    /// Limit price
    pub price: Option<f64>,
    /// Trigger price
    pub stop_price: Option<f64>,
    /// Time in force, limit types only
    pub time_in_force: TimeInForce,
    /// Leverage to apply to the symbol before placement
    pub leverage: Option<u32>,
    /// Order may only reduce an existing position
    pub reduce_only: bool,
    /// Trigger order closes the whole position
    pub close_position: bool,
}

impl OrderRequest {
    fn base(symbol: &str, side: Side, order_type: OrderType, quantity: f64) -> Self {
        Self {
            symbol: normalize_symbol(symbol),
            side,
            order_type,
            quantity,
            price: None,
            stop_price: None,
            time_in_force: TimeInForce::Gtc,
            leverage: None,
            reduce_only: false,
            close_position: false,
        }
    }

    /// Market order
    #[must_use]
    pub fn market(symbol: &str, side: Side, quantity: f64) -> Self {
        Self::base(symbol, side, OrderType::Market, quantity)
    }

    /// GTC limit order
    #[must_use]
    pub fn limit(symbol: &str, side: Side, quantity: f64, price: f64) -> Self {
        Self {
            price: Some(price),
            ..Self::base(symbol, side, OrderType::Limit, quantity)
        }
    }

    /// Reduce-only stop market order
    #[must_use]
    pub fn stop_market(symbol: &str, side: Side, quantity: f64, stop_price: f64) -> Self {
        Self {
            stop_price: Some(stop_price),
            reduce_only: true,
            ..Self::base(symbol, side, OrderType::StopMarket, quantity)
        }
    }

    /// Reduce-only take-profit market order
    #[must_use]
    pub fn take_profit_market(symbol: &str, side: Side, quantity: f64, stop_price: f64) -> Self {
        Self {
            stop_price: Some(stop_price),
            reduce_only: true,
            ..Self::base(symbol, side, OrderType::TakeProfitMarket, quantity)
        }
    }

    /// Set the leverage applied before placement
    #[must_use]
    pub const fn with_leverage(mut self, leverage: u32) -> Self {
        self.leverage = Some(leverage);
        self
    }

    /// Mark the order reduce-only
    #[must_use]
    pub const fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }

    /// Price used for notional checks: limit price, else trigger price
    #[must_use]
    pub fn reference_price(&self) -> Option<f64> {
        self.price.or(self.stop_price)
    }
}

/// Changes applied by [`crate::OrderManager::update_order`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderAmendment {
    /// New quantity
    pub quantity: Option<f64>,
    /// New limit price
    pub price: Option<f64>,
    /// New trigger price
    pub stop_price: Option<f64>,
}

/// Order as acknowledged or reported by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeOrder {
    /// Exchange-assigned id
    pub order_id: String,
    /// Client id sent with the request
    pub client_order_id: String,
    /// Symbol
    pub symbol: String,
    /// Current status
    pub status: OrderStatus,
    /// Original quantity
    pub quantity: f64,
    /// Executed quantity
    pub executed_quantity: f64,
    /// Average fill price, when anything executed
    pub average_price: Option<f64>,
    /// Last update time in milliseconds
    pub update_time: i64,
}

/// Order record owned by the lifecycle manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Unique order ID
    pub id: Uuid,
    /// Account owning the order
    pub user_id: String,
    /// Exchange order id, unique across records
    pub exchange_order_id: String,
    /// Client order id sent to the exchange
    pub client_order_id: String,
    /// Position the order opens, protects or closes
    pub position_id: Option<Uuid>,
    /// Symbol
    pub symbol: String,
    /// Order side
    pub side: Side,
    /// Order type
    pub order_type: OrderType,
    /// Order status
    pub status: OrderStatus,
    /// Limit price
    pub price: Option<f64>,
    /// Trigger price
    pub stop_price: Option<f64>,
    /// Average fill price
    pub average_price: Option<f64>,
    /// Original quantity
    pub quantity: f64,
    /// Executed quantity
    pub executed_quantity: f64,
    /// Time in force
    pub time_in_force: TimeInForce,
    /// Reduce-only flag
    pub reduce_only: bool,
    /// Close-position flag
    pub close_position: bool,
    /// Leverage applied at placement
    pub leverage: Option<u32>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
    /// Time the order became FILLED
    pub filled_at: Option<DateTime<Utc>>,
    /// Time the order became EXPIRED
    pub expired_at: Option<DateTime<Utc>>,
}

impl Order {
    /// Record for an accepted placement
    #[must_use]
    pub fn from_ack(
        user_id: &str,
        request: &OrderRequest,
        ack: &ExchangeOrder,
        position_id: Option<Uuid>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            exchange_order_id: ack.order_id.clone(),
            client_order_id: ack.client_order_id.clone(),
            position_id,
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            status: ack.status,
            price: request.price,
            stop_price: request.stop_price,
            average_price: ack.average_price.filter(|p| *p > 0.0),
            quantity: request.quantity,
            executed_quantity: ack.executed_quantity,
            time_in_force: request.time_in_force,
            reduce_only: request.reduce_only,
            close_position: request.close_position,
            leverage: request.leverage,
            created_at: now,
            updated_at: now,
            filled_at: (ack.status == OrderStatus::Filled).then_some(now),
            expired_at: (ack.status == OrderStatus::Expired).then_some(now),
        }
    }

    /// Quantity still working
    #[must_use]
    pub fn remaining_quantity(&self) -> f64 {
        (self.quantity - self.executed_quantity).max(0.0)
    }

    /// Executed share of the order, in percent
    #[must_use]
    pub fn filled_percentage(&self) -> f64 {
        if self.quantity <= 0.0 {
            return 0.0;
        }
        self.executed_quantity / self.quantity * services_common::PERCENT
    }

    /// Still working on the exchange
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// No further transitions possible
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Commission on the executed notional at `rate`
    #[must_use]
    pub fn commission(&self, rate: f64) -> f64 {
        match self.average_price {
            Some(price) => self.executed_quantity * price * rate,
            None => 0.0,
        }
    }

    /// Request that would recreate this order with `amendment` applied
    #[must_use]
    pub fn amended_request(&self, amendment: &OrderAmendment) -> OrderRequest {
        OrderRequest {
            symbol: self.symbol.clone(),
            side: self.side,
            order_type: self.order_type,
            quantity: amendment.quantity.unwrap_or(self.quantity),
            price: amendment.price.or(self.price),
            stop_price: amendment.stop_price.or(self.stop_price),
            time_in_force: self.time_in_force,
            leverage: self.leverage,
            reduce_only: self.reduce_only,
            close_position: self.close_position,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names_round_trip() {
        for order_type in [
            OrderType::Market,
            OrderType::Limit,
            OrderType::StopMarket,
            OrderType::StopLimit,
            OrderType::TakeProfitMarket,
            OrderType::TakeProfitLimit,
        ] {
            assert_eq!(OrderType::from_wire(order_type.as_str()), Some(order_type));
        }
        assert_eq!(OrderStatus::from_wire("PARTIALLY_FILLED"), Some(OrderStatus::PartiallyFilled));
        assert_eq!(OrderStatus::from_wire("BOGUS"), None);
    }

    #[test]
    fn test_protective_constructors_are_reduce_only() {
        let sl = OrderRequest::stop_market("btcusdt", Side::Sell, 1.0, 95.0);
        assert!(sl.reduce_only);
        assert_eq!(sl.symbol, "BTCUSDT");
        assert_eq!(sl.reference_price(), Some(95.0));
        assert!(OrderRequest::take_profit_market("BTCUSDT", Side::Sell, 1.0, 110.0).reduce_only);
        assert!(!OrderRequest::market("BTCUSDT", Side::Buy, 1.0).reduce_only);
    }

    #[test]
    fn test_amended_request_keeps_unchanged_fields() {
        let request = OrderRequest::limit("BTCUSDT", Side::Buy, 2.0, 100.0).with_leverage(5);
        let ack = ExchangeOrder {
            order_id: "1".to_string(),
            client_order_id: "c1".to_string(),
            symbol: "BTCUSDT".to_string(),
            status: OrderStatus::New,
            quantity: 2.0,
            executed_quantity: 0.0,
            average_price: None,
            update_time: 0,
        };
        let order = Order::from_ack("u1", &request, &ack, None);
        let amended = order.amended_request(&OrderAmendment {
            price: Some(99.0),
            ..OrderAmendment::default()
        });
        assert_eq!(amended.price, Some(99.0));
        assert_eq!(amended.quantity, 2.0);
        assert_eq!(amended.leverage, Some(5));
        assert_eq!(order.remaining_quantity(), 2.0);
        assert_eq!(order.filled_percentage(), 0.0);
    }
}
