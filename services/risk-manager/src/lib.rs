//! Risk Manager
//!
//! Pre-trade risk control for the trading engine:
//! - Ordered position checks with one rejection reason per rule
//! - Execution-time margin, exposure and drawdown checks
//! - Correlation limits against open positions
//! - Risk-based position sizing, pyramiding and laddered entries
//! - Stop-loss, take-profit and liquidation price helpers

pub mod correlation;
pub mod error;
pub mod exposure;
pub mod gate;
pub mod limits;
pub mod sizing;

pub use correlation::{CorrelatedPair, CorrelationEstimator, PriceHistory};
pub use error::{RiskRejection, RiskResult, SizingError, SizingResult};
pub use exposure::{AccountSnapshot, OpenExposure, PositionRequest};
pub use gate::{RiskDecision, RiskGate, RiskGateMetrics, liquidation_price, stop_loss_price, take_profit_price};
pub use limits::RiskLimits;
pub use sizing::PositionSizer;
