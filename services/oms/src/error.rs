//! Error types for the Order Management System

use risk_manager::RiskRejection;
use std::fmt;
use thiserror::Error;

/// Category of an exchange failure, derived from the provider's error code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeErrorKind {
    /// Exchange-side internal error (-1001)
    Internal,
    /// Request weight or order rate exceeded (-1003, HTTP 429/418)
    RateLimit,
    /// Not enough margin balance (-1010)
    InsufficientBalance,
    /// Timestamp outside the receive window (-1021)
    Timestamp,
    /// Bad signature, key or permissions
    Authentication,
    /// Malformed or illegal parameter (-1100)
    InvalidParameter,
    /// Quantity rejected by the symbol filters (-1111)
    InvalidQuantity,
    /// Order type not supported (-1112)
    InvalidOrderType,
    /// Operation not valid in the order's status (-1116)
    InvalidOrderStatus,
    /// Price rejected by the symbol filters (-1117)
    InvalidPrice,
    /// Position side does not match the position mode (-1119)
    InvalidPositionSide,
    /// Leverage outside the allowed bracket (-1120)
    InvalidLeverage,
    /// Unknown symbol (-1121)
    InvalidSymbol,
    /// User data stream listen key expired or unknown (-1125)
    InvalidListenKey,
    /// Inconsistent combination of order parameters (-1130)
    InvalidOrderConfig,
    /// New order rejected (-2010)
    OrderRejected,
    /// Cancel rejected (-2011)
    CancelRejected,
    /// Order does not exist (-2013)
    OrderNotFound,
    /// Margin type change refused (-4001)
    InvalidMarginType,
    /// Position mode change refused (-4110)
    InvalidPositionMode,
    /// Request never produced an exchange response
    Transport,
    /// Response body could not be decoded
    Decode,
    /// Any other code
    Unknown,
}

impl ExchangeErrorKind {
    /// Kind for a provider error code
    #[must_use]
    pub const fn from_code(code: i64) -> Self {
        match code {
            -1001 => Self::Internal,
            -1003 => Self::RateLimit,
            -1010 => Self::InsufficientBalance,
            -1021 => Self::Timestamp,
            -1022 | -1114 | -1115 | -2014 | -2015 => Self::Authentication,
            -1100 => Self::InvalidParameter,
            -1111 => Self::InvalidQuantity,
            -1112 => Self::InvalidOrderType,
            -1116 => Self::InvalidOrderStatus,
            -1117 => Self::InvalidPrice,
            -1119 => Self::InvalidPositionSide,
            -1120 => Self::InvalidLeverage,
            -1121 => Self::InvalidSymbol,
            -1125 => Self::InvalidListenKey,
            -1130 => Self::InvalidOrderConfig,
            -2010 => Self::OrderRejected,
            -2011 => Self::CancelRejected,
            -2013 => Self::OrderNotFound,
            -4001 => Self::InvalidMarginType,
            -4110 => Self::InvalidPositionMode,
            _ => Self::Unknown,
        }
    }

    /// Whether retrying the same request may succeed
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Internal | Self::RateLimit | Self::Timestamp | Self::Transport
        )
    }

    /// Short label used in logs and metrics
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::RateLimit => "rate_limit",
            Self::InsufficientBalance => "insufficient_balance",
            Self::Timestamp => "timestamp",
            Self::Authentication => "authentication",
            Self::InvalidParameter => "invalid_parameter",
            Self::InvalidQuantity => "invalid_quantity",
            Self::InvalidOrderType => "invalid_order_type",
            Self::InvalidOrderStatus => "invalid_order_status",
            Self::InvalidPrice => "invalid_price",
            Self::InvalidPositionSide => "invalid_position_side",
            Self::InvalidLeverage => "invalid_leverage",
            Self::InvalidSymbol => "invalid_symbol",
            Self::InvalidListenKey => "invalid_listen_key",
            Self::InvalidOrderConfig => "invalid_order_config",
            Self::OrderRejected => "order_rejected",
            Self::CancelRejected => "cancel_rejected",
            Self::OrderNotFound => "order_not_found",
            Self::InvalidMarginType => "invalid_margin_type",
            Self::InvalidPositionMode => "invalid_position_mode",
            Self::Transport => "transport",
            Self::Decode => "decode",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ExchangeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed failure of an exchange call
#[derive(Error, Debug, Clone, PartialEq)]
#[error("exchange error [{kind}] {}: {message}", display_code(.code))]
pub struct ExchangeError {
    /// Category of the failure
    pub kind: ExchangeErrorKind,
    /// Provider error code, when the exchange sent one
    pub code: Option<i64>,
    /// Provider message or local description
    pub message: String,
    /// Seconds to wait before retrying, for rate limits
    pub retry_after: Option<u64>,
}

fn display_code(code: &Option<i64>) -> String {
    code.map_or_else(|| "-".to_string(), |c| c.to_string())
}

impl ExchangeError {
    /// Error built from a provider `{code, msg}` body
    #[must_use]
    pub fn from_code(code: i64, message: impl Into<String>) -> Self {
        Self {
            kind: ExchangeErrorKind::from_code(code),
            code: Some(code),
            message: message.into(),
            retry_after: None,
        }
    }

    /// Rate limit with an optional retry hint
    #[must_use]
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<u64>) -> Self {
        Self {
            kind: ExchangeErrorKind::RateLimit,
            code: None,
            message: message.into(),
            retry_after,
        }
    }

    /// Error of `kind` without a provider code
    #[must_use]
    pub fn new(kind: ExchangeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Network failure before a response was received
    pub fn transport(err: impl fmt::Display) -> Self {
        Self::new(ExchangeErrorKind::Transport, err.to_string())
    }

    /// Attach a retry hint
    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Option<u64>) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// Whether retrying the same request may succeed
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// OMS-specific error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OmsError {
    /// Order not found in the system
    #[error("Order not found: {order_id}")]
    OrderNotFound {
        /// The identifier of the order that could not be found
        order_id: String,
    },

    /// Position not found in the system
    #[error("Position not found: {position_id}")]
    PositionNotFound {
        /// The identifier of the position that could not be found
        position_id: String,
    },

    /// The exchange order id is already tracked by another record
    #[error("Duplicate exchange order id {exchange_order_id}")]
    DuplicateOrder {
        /// Exchange-assigned identifier
        exchange_order_id: String,
    },

    /// Order is in an invalid state for the requested operation
    #[error("Order {order_id} cannot be {operation} in current state {current_state}")]
    InvalidOrderState {
        /// The identifier of the order in invalid state
        order_id: String,
        /// The operation that was attempted on the order
        operation: String,
        /// The current state of the order that prevents the operation
        current_state: String,
    },

    /// Position is in an invalid state for the requested operation
    #[error("Position {position_id} cannot be {operation} in current state {current_state}")]
    InvalidPositionState {
        /// The identifier of the position
        position_id: String,
        /// The operation that was attempted
        operation: String,
        /// The current state that prevents the operation
        current_state: String,
    },

    /// Margin operation on a position that is not isolated
    #[error("Position {position_id} uses {margin_type} margin, isolated required")]
    InvalidMarginType {
        /// The identifier of the position
        position_id: String,
        /// Margin type of the position
        margin_type: String,
    },

    /// Requested margin reduction exceeds the posted margin
    #[error("Insufficient margin on {position_id}: requested {requested}, available {available}")]
    InsufficientMargin {
        /// The identifier of the position
        position_id: String,
        /// Amount asked for
        requested: f64,
        /// Isolated margin currently posted
        available: f64,
    },

    /// Validation error
    #[error("Validation error: {message}")]
    Validation {
        /// Detailed validation error message
        message: String,
    },

    /// A well-formed request refused by the risk gate
    #[error("Risk check failed: {0}")]
    RiskRejected(#[from] RiskRejection),

    /// Placement kept failing after every allowed attempt
    #[error("Order placement failed after {attempts} attempts: {source}")]
    PlacementFailed {
        /// Attempts made, including the first
        attempts: u32,
        /// Error of the last attempt
        source: ExchangeError,
    },

    /// Persistence boundary refused a record
    #[error("Persistence error: {message}")]
    Persistence {
        /// Error reported by the store
        message: String,
    },

    /// Exchange call failed
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

impl OmsError {
    /// Validation failure with `message`
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

/// Type alias for exchange call results
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Type alias for OMS results
pub type OmsResult<T> = Result<T, OmsError>;
