//! Trading Gateway
//!
//! Turns external trading signals into risk-checked futures positions:
//! - Structural validation of incoming signals against exchange filters
//! - Confidence scoring from the live book and rolling analytics
//! - Execution-time market condition checks
//! - Risk-based sizing and the execution-time risk gate
//! - Entry, exit and protective-level execution through the order manager
//! - Validity windows with periodic expiry of stale signals

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod conditions;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod scoring;
pub mod signal;
pub mod store;
pub mod telemetry;
pub mod validation;

pub use conditions::{ConditionFailure, MarketConditionLimits, MarketView, check_market_conditions};
pub use config::EngineConfig;
pub use error::{PipelineError, PipelineResult, ValidationError};
pub use pipeline::{PipelineConfig, SignalEvent, SignalExecutionPipeline};
pub use scoring::{ScoreBreakdown, confidence_score};
pub use signal::{Signal, SignalAction, SignalRequest, SignalSource, SignalStatus, SignalType};
pub use store::{InMemorySignalStore, SignalStore};
pub use telemetry::{TelemetryCollector, TelemetryStats};
pub use validation::validate_signal;
