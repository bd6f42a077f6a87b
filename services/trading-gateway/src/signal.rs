//! Trading signal model
//!
//! A [`Signal`] is created from a [`SignalRequest`] once the request passes
//! structural validation. From then on the pipeline owns it until it reaches
//! a terminal status; the order and position it produced are referenced by id
//! only.

use chrono::{DateTime, Duration, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use services_common::{PositionSide, Side, normalize_symbol};
use std::fmt;
use uuid::Uuid;

/// Validity window, in minutes, for timeframes without an explicit entry
pub const DEFAULT_VALIDITY_MINUTES: i64 = 60;

/// Longest accepted validity window, in minutes (30 days)
pub const MAX_VALIDITY_MINUTES: i64 = 43_200;

/// Where a signal came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalSource {
    /// TradingView webhook alert
    #[serde(rename = "TRADINGVIEW")]
    TradingView,
    /// In-house indicator
    CustomIndicator,
    /// Entered by hand
    Manual,
    /// Automated strategy
    Bot,
}

/// What the signal asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalType {
    /// Open a position
    Entry,
    /// Close a position
    Exit,
    /// Move the stop loss of an open position
    StopLoss,
    /// Move the take profit of an open position
    TakeProfit,
}

impl SignalType {
    /// Wire label
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Entry => "ENTRY",
            Self::Exit => "EXIT",
            Self::StopLoss => "STOP_LOSS",
            Self::TakeProfit => "TAKE_PROFIT",
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalAction {
    /// Open long
    Long,
    /// Open short
    Short,
    /// Close a long position
    CloseLong,
    /// Close a short position
    CloseShort,
}

impl SignalAction {
    /// Position the action opens or closes
    #[must_use]
    pub const fn position_side(self) -> PositionSide {
        match self {
            Self::Long | Self::CloseLong => PositionSide::Long,
            Self::Short | Self::CloseShort => PositionSide::Short,
        }
    }

    /// Side of the order the action sends
    #[must_use]
    pub const fn order_side(self) -> Side {
        match self {
            Self::Long | Self::CloseShort => Side::Buy,
            Self::Short | Self::CloseLong => Side::Sell,
        }
    }

    /// LONG or SHORT
    #[must_use]
    pub const fn is_opening(self) -> bool {
        matches!(self, Self::Long | Self::Short)
    }

    /// Wire label
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
            Self::CloseLong => "CLOSE_LONG",
            Self::CloseShort => "CLOSE_SHORT",
        }
    }
}

impl fmt::Display for SignalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signal lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalStatus {
    /// Waiting for execution
    Pending,
    /// Orders placed or position updated
    Executed,
    /// Execution raised an unrecoverable error
    Failed,
    /// Validity window passed before execution
    Expired,
    /// Market or risk conditions refused it, or cancelled on request
    Cancelled,
}

impl SignalStatus {
    /// No further transitions
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Wire label
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Executed => "EXECUTED",
            Self::Failed => "FAILED",
            Self::Expired => "EXPIRED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validity window in minutes for `timeframe`
///
/// ```
/// use trading_gateway::signal::default_time_validity;
///
/// assert_eq!(default_time_validity("1m"), 5);
/// assert_eq!(default_time_validity("4h"), 1200);
/// assert_eq!(default_time_validity("3d"), 60);
/// ```
#[must_use]
pub fn default_time_validity(timeframe: &str) -> i64 {
    match timeframe {
        "1m" => 5,
        "3m" => 15,
        "5m" => 25,
        "15m" => 75,
        "30m" => 150,
        "1h" => 300,
        "2h" => 600,
        "4h" => 1200,
        "6h" => 1800,
        "8h" => 2400,
        "12h" => 3600,
        "1d" => 7200,
        _ => DEFAULT_VALIDITY_MINUTES,
    }
}

/// Signal as handed over by the ingestion boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRequest {
    /// Origin
    pub source: SignalSource,
    /// Signal type
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    /// Direction
    pub action: SignalAction,
    /// Symbol
    pub symbol: String,
    /// Chart timeframe, e.g. `15m`
    pub timeframe: String,
    /// Trigger price for STOP_LOSS and TAKE_PROFIT signals
    #[serde(default)]
    pub price: Option<f64>,
    /// Entry price
    #[serde(default)]
    pub entry_price: Option<f64>,
    /// Stop loss
    #[serde(default)]
    pub stop_loss: Option<f64>,
    /// Take profit
    #[serde(default)]
    pub take_profit: Option<f64>,
    /// Fixed quantity, used when no risk percentage is given
    #[serde(default)]
    pub quantity: Option<f64>,
    /// Leverage, 1 when absent
    #[serde(default)]
    pub leverage: Option<u32>,
    /// Share of balance to risk, in percent
    #[serde(default)]
    pub risk_percentage: Option<f64>,
    /// Free text
    #[serde(default)]
    pub description: Option<String>,
    /// Strategy that produced the signal
    #[serde(default)]
    pub strategy_name: Option<String>,
    /// Validity window in minutes; defaults by timeframe
    #[serde(default)]
    pub time_validity: Option<i64>,
    /// Indicator values reported with the signal
    #[serde(default)]
    pub indicators: FxHashMap<String, f64>,
}

impl SignalRequest {
    /// Entry signal with entry and stop
    #[must_use]
    pub fn entry(symbol: &str, action: SignalAction, entry_price: f64, stop_loss: f64) -> Self {
        Self {
            entry_price: Some(entry_price),
            stop_loss: Some(stop_loss),
            ..Self::bare(SignalType::Entry, symbol, action)
        }
    }

    /// Exit signal for the open position
    #[must_use]
    pub fn exit(symbol: &str, action: SignalAction) -> Self {
        Self::bare(SignalType::Exit, symbol, action)
    }

    /// STOP_LOSS or TAKE_PROFIT signal moving a level to `price`
    #[must_use]
    pub fn protective(signal_type: SignalType, symbol: &str, action: SignalAction, price: f64) -> Self {
        Self {
            price: Some(price),
            ..Self::bare(signal_type, symbol, action)
        }
    }

    fn bare(signal_type: SignalType, symbol: &str, action: SignalAction) -> Self {
        Self {
            source: SignalSource::Manual,
            signal_type,
            action,
            symbol: normalize_symbol(symbol),
            timeframe: "1h".to_string(),
            price: None,
            entry_price: None,
            stop_loss: None,
            take_profit: None,
            quantity: None,
            leverage: None,
            risk_percentage: None,
            description: None,
            strategy_name: None,
            time_validity: None,
            indicators: FxHashMap::default(),
        }
    }

    /// Take profit level
    #[must_use]
    pub const fn with_take_profit(mut self, take_profit: f64) -> Self {
        self.take_profit = Some(take_profit);
        self
    }

    /// Size by risking `percent` of balance
    #[must_use]
    pub const fn with_risk_percentage(mut self, percent: f64) -> Self {
        self.risk_percentage = Some(percent);
        self
    }

    /// Fixed size in base units
    #[must_use]
    pub const fn with_quantity(mut self, quantity: f64) -> Self {
        self.quantity = Some(quantity);
        self
    }

    /// Leverage
    #[must_use]
    pub const fn with_leverage(mut self, leverage: u32) -> Self {
        self.leverage = Some(leverage);
        self
    }

    /// Explicit validity window in minutes
    #[must_use]
    pub const fn with_time_validity(mut self, minutes: i64) -> Self {
        self.time_validity = Some(minutes);
        self
    }

    /// Chart timeframe
    #[must_use]
    pub fn with_timeframe(mut self, timeframe: &str) -> Self {
        self.timeframe = timeframe.to_string();
        self
    }
}

/// Signal owned by the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Unique signal id
    pub id: Uuid,
    /// Account the signal trades for
    pub user_id: String,
    /// Order placed for the signal
    pub order_id: Option<Uuid>,
    /// Position opened, closed or updated
    pub position_id: Option<Uuid>,
    /// Origin
    pub source: SignalSource,
    /// Signal type
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    /// Direction
    pub action: SignalAction,
    /// Status
    pub status: SignalStatus,
    /// Symbol
    pub symbol: String,
    /// Chart timeframe
    pub timeframe: String,
    /// Trigger price for protective updates
    pub price: Option<f64>,
    /// Entry price
    pub entry_price: Option<f64>,
    /// Stop loss
    pub stop_loss: Option<f64>,
    /// Take profit
    pub take_profit: Option<f64>,
    /// Reward over risk implied by entry, stop and target
    pub risk_reward_ratio: Option<f64>,
    /// Fixed quantity, or the executed quantity once sized
    pub quantity: Option<f64>,
    /// Leverage
    pub leverage: u32,
    /// Share of balance to risk, in percent
    pub risk_percentage: Option<f64>,
    /// Free text
    pub description: Option<String>,
    /// Strategy that produced the signal
    pub strategy_name: Option<String>,
    /// Confidence in [0, 100]
    pub confidence_score: f64,
    /// Validity window in minutes
    pub time_validity: i64,
    /// Indicator values reported with the signal
    pub indicators: FxHashMap<String, f64>,
    /// Fill or trigger price
    pub executed_price: Option<f64>,
    /// Time the signal was executed
    pub execution_time: Option<DateTime<Utc>>,
    /// Seconds from creation to execution
    pub execution_delay: Option<f64>,
    /// Realized PnL of an exit
    pub pnl: Option<f64>,
    /// Realized PnL over entry value, in percent
    pub pnl_percentage: Option<f64>,
    /// Whether an exit closed in profit
    pub success: Option<bool>,
    /// Why the signal was cancelled or failed
    pub status_reason: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
    /// Time the signal expired
    pub expired_at: Option<DateTime<Utc>>,
}

impl Signal {
    /// Pending signal for `user_id` built from a validated request
    #[must_use]
    pub fn from_request(user_id: &str, request: SignalRequest, now: DateTime<Utc>) -> Self {
        let risk_reward_ratio = match (request.entry_price, request.stop_loss, request.take_profit) {
            (Some(entry), Some(stop), Some(target)) if (entry - stop).abs() > services_common::EPSILON => {
                Some((target - entry).abs() / (entry - stop).abs())
            }
            _ => None,
        };
        let time_validity = request
            .time_validity
            .filter(|minutes| *minutes > 0)
            .unwrap_or_else(|| default_time_validity(&request.timeframe))
            .min(MAX_VALIDITY_MINUTES);

        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            order_id: None,
            position_id: None,
            source: request.source,
            signal_type: request.signal_type,
            action: request.action,
            status: SignalStatus::Pending,
            symbol: normalize_symbol(&request.symbol),
            timeframe: request.timeframe,
            price: request.price,
            entry_price: request.entry_price,
            stop_loss: request.stop_loss,
            take_profit: request.take_profit,
            risk_reward_ratio,
            quantity: request.quantity,
            leverage: request.leverage.unwrap_or(1),
            risk_percentage: request.risk_percentage,
            description: request.description,
            strategy_name: request.strategy_name,
            confidence_score: crate::scoring::BASE_SCORE,
            time_validity,
            indicators: request.indicators,
            executed_price: None,
            execution_time: None,
            execution_delay: None,
            pnl: None,
            pnl_percentage: None,
            success: None,
            status_reason: None,
            created_at: now,
            updated_at: now,
            expired_at: None,
        }
    }

    /// End of the validity window
    #[must_use]
    pub fn valid_until(&self) -> DateTime<Utc> {
        Duration::try_minutes(self.time_validity)
            .and_then(|window| self.created_at.checked_add_signed(window))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Pending and still inside its validity window at `now`
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.status == SignalStatus::Pending && now <= self.valid_until()
    }

    /// Pending but past its validity window at `now`
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.status == SignalStatus::Pending && now > self.valid_until()
    }

    /// Record a successful execution
    pub fn mark_executed(&mut self, executed_price: f64, now: DateTime<Utc>) {
        self.status = SignalStatus::Executed;
        self.executed_price = Some(executed_price);
        self.execution_time = Some(now);
        let delay_ms = (now - self.created_at).num_milliseconds().max(0);
        self.execution_delay = Some(delay_ms as f64 / 1000.0);
        self.updated_at = now;
    }

    /// Move to EXPIRED
    pub fn expire(&mut self, now: DateTime<Utc>) {
        self.status = SignalStatus::Expired;
        self.expired_at = Some(now);
        self.updated_at = now;
    }

    /// Move to CANCELLED with a reason
    pub fn cancel(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.status = SignalStatus::Cancelled;
        self.status_reason = Some(reason.into());
        self.updated_at = now;
    }

    /// Move to FAILED with a reason
    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.status = SignalStatus::Failed;
        self.status_reason = Some(reason.into());
        self.updated_at = now;
    }
}
