//! Shared types, configuration and helpers used by every service in the
//! trading engine workspace.

pub mod config;
pub mod constants;
pub mod logging;
pub mod math;
pub mod types;

pub use config::*;
pub use constants::*;
pub use types::*;
