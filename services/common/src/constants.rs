//! Common constants used across all services

/// Multiplier between a fraction and a percentage
pub const PERCENT: f64 = 100.0;

/// Tolerance used when comparing floating point prices and quantities
pub const EPSILON: f64 = 1e-9;

// Retry constants
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
