//! Engine configuration

use crate::pipeline::PipelineConfig;
use market_connector::MarketDataConfig;
use oms::OmsConfig;
use risk_manager::RiskLimits;
use serde::{Deserialize, Serialize};
use services_common::{Credentials, ExchangeEndpoints};
use std::net::SocketAddr;
use tracing::{info, warn};

/// Prefix of environment overrides, e.g. `ENGINE__RISK__MAX_LEVERAGE=20`
pub const ENV_PREFIX: &str = "ENGINE";

/// Everything the engine binary needs to start
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Account the engine trades for
    pub user_id: String,
    /// Exchange endpoints shared by the stream and REST clients
    pub endpoints: ExchangeEndpoints,
    /// API key and secret
    pub credentials: Credentials,
    /// Symbols subscribed at startup
    pub symbols: Vec<String>,
    /// Market data service
    pub market: MarketDataConfig,
    /// Risk limits for the gate and the sizer
    pub risk: RiskLimits,
    /// Order manager
    pub oms: OmsConfig,
    /// Signal pipeline
    pub pipeline: PipelineConfig,
    /// REST request timeout, in milliseconds
    pub rest_timeout_ms: u64,
    /// Health endpoint bind address
    pub health_addr: SocketAddr,
    /// Prometheus endpoint bind address
    pub metrics_addr: SocketAddr,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_id: "default".to_string(),
            endpoints: ExchangeEndpoints::default(),
            credentials: Credentials::default(),
            symbols: vec!["BTCUSDT".to_string()],
            market: MarketDataConfig::default(),
            risk: RiskLimits::default(),
            oms: OmsConfig::default(),
            pipeline: PipelineConfig::default(),
            rest_timeout_ms: 10_000,
            health_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl EngineConfig {
    /// Load from an optional file, then apply `ENGINE__*` environment overrides
    ///
    /// The top-level endpoints are copied into the market data section so
    /// both clients always talk to the same venue.
    ///
    /// # Errors
    ///
    /// Unreadable file or values that do not deserialize.
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!("Loading configuration from {}", path);
            builder = builder.add_source(config::File::with_name(path));
        } else {
            warn!("No configuration file given, using defaults and environment");
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let mut engine: Self = settings.try_deserialize()?;
        engine.market.endpoints = engine.endpoints.clone();
        if engine.endpoints.testnet {
            info!("Using exchange testnet at {}", engine.endpoints.rest_url);
        }
        if !engine.credentials.is_configured() {
            warn!("API credentials missing, order placement will be rejected");
        }
        Ok(engine)
    }
}
