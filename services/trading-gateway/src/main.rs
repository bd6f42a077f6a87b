//! Trading engine entry point
//!
//! Wires the market data service, the order manager and the signal pipeline
//! together, then runs until interrupted.

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use market_connector::{ConnectionState, MarketDataService};
use oms::{BinanceFuturesClient, InMemoryStore, OrderManager};
use risk_manager::{PositionSizer, RiskGate};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use trading_gateway::{EngineConfig, InMemorySignalStore, SignalExecutionPipeline, telemetry};

const SERVICE_NAME: &str = "trading-gateway";
const CONFIG_ENV: &str = "ENGINE_CONFIG";

#[tokio::main]
async fn main() -> Result<()> {
    services_common::logging::init_tracing(SERVICE_NAME)?;
    info!("Starting trading engine v{}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::args().nth(1).or_else(|| std::env::var(CONFIG_ENV).ok());
    let config = EngineConfig::load(config_path.as_deref())?;
    telemetry::install_prometheus(config.metrics_addr)?;

    let market = Arc::new(MarketDataService::connect_default(config.market.clone())?);
    let exchange = Arc::new(BinanceFuturesClient::new(
        &config.endpoints.rest_url,
        config.credentials.clone(),
        Duration::from_millis(config.rest_timeout_ms),
    )?);
    let gate = Arc::new(RiskGate::new(config.risk.clone()));
    let orders = Arc::new(OrderManager::new(
        &config.user_id,
        config.oms.clone(),
        exchange,
        Arc::new(InMemoryStore::new()),
        gate,
    ));
    let pipeline = Arc::new(SignalExecutionPipeline::new(
        config.pipeline.clone(),
        orders,
        market.clone(),
        PositionSizer::new(config.risk.clone()),
        Arc::new(InMemorySignalStore::new()),
    ));

    let stream = {
        let market = market.clone();
        tokio::spawn(async move {
            if let Err(e) = market.run().await {
                error!("Market data service stopped: {}", e);
            }
        })
    };
    for symbol in &config.symbols {
        market.subscribe_symbol(symbol).await;
    }
    let sweeper = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.run().await })
    };
    start_health_check(config.health_addr, market.clone());
    info!("Trading engine running for {} symbols", config.symbols.len());

    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Received shutdown signal");

    pipeline.shutdown();
    market.shutdown();
    for (name, task) in [("pipeline", sweeper), ("market data", stream)] {
        if let Err(e) = task.await {
            warn!("{} task ended abnormally: {}", name, e);
        }
    }
    info!("Pipeline stats at shutdown: {:?}", pipeline.get_metrics());
    info!("Trading engine shut down gracefully");
    Ok(())
}

async fn health(State(market): State<Arc<MarketDataService>>) -> (StatusCode, Json<serde_json::Value>) {
    let state = market.connection_state();
    let code = if state == ConnectionState::Connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = serde_json::json!({
        "service": SERVICE_NAME,
        "status": if code == StatusCode::OK { "healthy" } else { "unhealthy" },
        "stream": format!("{state:?}"),
    });
    (code, Json(body))
}

/// Serve `/health`, healthy while the market data stream is connected
fn start_health_check(addr: SocketAddr, market: Arc<MarketDataService>) {
    tokio::spawn(async move {
        let app = axum::Router::new()
            .route("/health", axum::routing::get(health))
            .with_state(market);

        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind health check server to {}: {}", addr, e);
                return;
            }
        };
        info!("Health check endpoint available at http://{}/health", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("Health check server error: {}", e);
        }
    });
}
