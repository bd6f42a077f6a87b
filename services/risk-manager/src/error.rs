//! Risk rejections and sizing errors

use thiserror::Error;

/// A well-formed request that breaks a risk rule
///
/// One variant per rule so callers can report exactly which check failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RiskRejection {
    /// Request fields are unusable
    #[error("Invalid risk request: {reason}")]
    InvalidRequest {
        /// What is wrong
        reason: String,
    },

    /// Leverage above the account limit
    #[error("Leverage {requested}x exceeds maximum allowed {max}x")]
    LeverageTooHigh {
        /// Requested leverage
        requested: u32,
        /// Configured limit
        max: u32,
    },

    /// Notional above the per-position limit
    #[error("Position size {notional:.2} exceeds maximum allowed {max:.2}")]
    PositionTooLarge {
        /// Requested notional
        notional: f64,
        /// Largest notional allowed
        max: f64,
    },

    /// Too many open positions
    #[error("Maximum number of positions ({max}) reached")]
    TooManyPositions {
        /// Currently open
        open: usize,
        /// Configured limit
        max: usize,
    },

    /// Today's PnL is below the loss floor
    #[error("Daily loss limit reached: pnl {pnl:.2} below {floor:.2}")]
    DailyLossLimit {
        /// Realized plus unrealized PnL today
        pnl: f64,
        /// Loss floor in quote currency
        floor: f64,
    },

    /// New symbol moves too closely with an open position
    #[error("High correlation risk: {symbol} vs {other} at {correlation:.2} (limit {threshold:.2})")]
    CorrelationTooHigh {
        /// Requested symbol
        symbol: String,
        /// Open position it correlates with
        other: String,
        /// Measured correlation
        correlation: f64,
        /// Configured threshold
        threshold: f64,
    },

    /// Margin in use would exceed the ceiling
    #[error("Margin usage {ratio:.2} exceeds {max:.2}")]
    MarginUsageTooHigh {
        /// Margin used over balance including the new order
        ratio: f64,
        /// Configured ceiling
        max: f64,
    },

    /// Total exposure would exceed the ceiling
    #[error("Total exposure {exposure:.2} exceeds {max:.2}")]
    ExposureTooHigh {
        /// Notional exposure including the new order
        exposure: f64,
        /// Largest exposure allowed
        max: f64,
    },

    /// Equity fell too far from the start of the day
    #[error("Daily drawdown {drawdown:.4} exceeds {max:.4}")]
    DrawdownTooHigh {
        /// Fractional drop from the day's starting equity
        drawdown: f64,
        /// Configured limit
        max: f64,
    },
}

impl RiskRejection {
    /// Short rule name for logs and metric labels
    #[must_use]
    pub const fn rule(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "invalid_request",
            Self::LeverageTooHigh { .. } => "leverage",
            Self::PositionTooLarge { .. } => "position_size",
            Self::TooManyPositions { .. } => "position_count",
            Self::DailyLossLimit { .. } => "daily_loss",
            Self::CorrelationTooHigh { .. } => "correlation",
            Self::MarginUsageTooHigh { .. } => "margin_usage",
            Self::ExposureTooHigh { .. } => "exposure",
            Self::DrawdownTooHigh { .. } => "drawdown",
        }
    }
}

/// Sizing input problems
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SizingError {
    /// Non-finite or non-positive input
    #[error("Invalid {field}: {value}")]
    InvalidInput {
        /// Parameter name
        field: &'static str,
        /// Offending value
        value: f64,
    },

    /// Leverage above the account limit
    #[error("Leverage {requested}x exceeds maximum allowed {max}x")]
    LeverageTooHigh {
        /// Requested leverage
        requested: u32,
        /// Configured limit
        max: u32,
    },

    /// Stop further away than the sizer accepts
    #[error("Stop loss {fraction:.4} wider than {max:.4}")]
    StopTooWide {
        /// Stop distance as a fraction of price
        fraction: f64,
        /// Configured limit
        max: f64,
    },

    /// Entry and stop are the same price
    #[error("Stop loss equals entry price")]
    ZeroStopDistance,
}

/// Risk check result
pub type RiskResult<T> = Result<T, RiskRejection>;

/// Sizing result
pub type SizingResult<T> = Result<T, SizingError>;

pub(crate) fn positive(field: &'static str, value: f64) -> SizingResult<f64> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(SizingError::InvalidInput { field, value })
    }
}
