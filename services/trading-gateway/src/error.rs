//! Error types for signal handling

use crate::signal::{SignalAction, SignalStatus, SignalType};
use oms::{ExchangeError, OmsError};
use risk_manager::SizingError;
use services_common::PositionSide;
use thiserror::Error;
use uuid::Uuid;

/// Structural problem with an incoming signal
///
/// Signals failing any of these rules are never stored.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Symbol not listed on the exchange
    #[error("Unknown symbol {symbol}")]
    UnknownSymbol {
        /// Requested symbol
        symbol: String,
    },

    /// Action does not fit the signal type
    #[error("{signal_type} signal cannot carry action {action}")]
    ActionMismatch {
        /// Signal type
        signal_type: SignalType,
        /// Offending action
        action: SignalAction,
    },

    /// A price the signal type requires is absent
    #[error("{signal_type} signal requires {field}")]
    MissingPrice {
        /// Signal type
        signal_type: SignalType,
        /// Missing field
        field: &'static str,
    },

    /// A price is zero, negative or not finite
    #[error("Invalid {field}: {value}")]
    InvalidPrice {
        /// Field name
        field: &'static str,
        /// Offending value
        value: f64,
    },

    /// Stop loss on the profitable side of entry
    #[error("Stop loss {stop_loss} is on the wrong side of entry {entry} for {action}")]
    StopLossWrongSide {
        /// Signal action
        action: SignalAction,
        /// Entry price
        entry: f64,
        /// Stop loss
        stop_loss: f64,
    },

    /// Take profit on the losing side of entry
    #[error("Take profit {take_profit} is on the wrong side of entry {entry} for {action}")]
    TakeProfitWrongSide {
        /// Signal action
        action: SignalAction,
        /// Entry price
        entry: f64,
        /// Take profit
        take_profit: f64,
    },

    /// Risk percentage outside (0, 100]
    #[error("Risk percentage {value} must be in (0, 100]")]
    InvalidRiskPercentage {
        /// Offending value
        value: f64,
    },

    /// Entry signal with neither a risk percentage nor a quantity
    #[error("Entry signal needs a risk percentage or a quantity")]
    MissingSize,

    /// Fixed quantity is zero, negative or not finite
    #[error("Invalid quantity {value}")]
    InvalidQuantity {
        /// Offending value
        value: f64,
    },

    /// Leverage outside 1..=max for the symbol
    #[error("Leverage {requested}x must be between 1 and {max}x")]
    InvalidLeverage {
        /// Requested leverage
        requested: u32,
        /// Symbol maximum
        max: u32,
    },

    /// Validity window longer than the engine accepts
    #[error("Time validity of {minutes} minutes exceeds {max}")]
    InvalidTimeValidity {
        /// Requested window, in minutes
        minutes: i64,
        /// Longest accepted window
        max: i64,
    },
}

/// Signal pipeline errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// Signal rejected before creation
    #[error("Invalid signal: {0}")]
    Validation(#[from] ValidationError),

    /// No signal with this id
    #[error("Signal not found: {signal_id}")]
    SignalNotFound {
        /// Requested id
        signal_id: Uuid,
    },

    /// Operation not allowed in the signal's status
    #[error("Signal {signal_id} cannot be {operation} in status {status}")]
    InvalidSignalState {
        /// Signal id
        signal_id: Uuid,
        /// Attempted operation
        operation: &'static str,
        /// Current status
        status: SignalStatus,
    },

    /// Exit or protective update with nothing to act on
    #[error("No open position for {symbol}")]
    NoOpenPosition {
        /// Symbol
        symbol: String,
    },

    /// Exit direction does not match the open position
    #[error("{action} does not match open {side} position on {symbol}")]
    ExitDirectionMismatch {
        /// Symbol
        symbol: String,
        /// Signal action
        action: SignalAction,
        /// Side of the open position
        side: PositionSide,
    },

    /// Placement kept failing after every allowed attempt
    #[error("Execution failed after {attempts} attempts: {source}")]
    ExecutionFailure {
        /// Attempts made
        attempts: u32,
        /// Error of the last attempt
        source: ExchangeError,
    },

    /// Sizing inputs were unusable
    #[error("Sizing failed: {0}")]
    Sizing(#[from] SizingError),

    /// Signal store refused a record
    #[error("Signal persistence error: {message}")]
    Persistence {
        /// Error reported by the store
        message: String,
    },

    /// Order or position operation failed
    #[error(transparent)]
    Oms(OmsError),

    /// Exchange call failed
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

impl From<OmsError> for PipelineError {
    fn from(err: OmsError) -> Self {
        match err {
            OmsError::PlacementFailed { attempts, source } => Self::ExecutionFailure { attempts, source },
            OmsError::Exchange(source) => Self::Exchange(source),
            other => Self::Oms(other),
        }
    }
}

/// Type alias for pipeline results
pub type PipelineResult<T> = Result<T, PipelineError>;
