//! Tracing subscriber setup shared by binaries and test suites

use std::sync::Once;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

static TEST_INIT: Once = Once::new();

/// Initialize tracing for a service binary
///
/// `RUST_LOG` takes precedence; otherwise `<service>=info` plus the
/// workspace crates at info level.
pub fn init_tracing(service_name: &str) -> anyhow::Result<()> {
    let default_filter = format!(
        "{}=info,market_connector=info,risk_manager=info,oms=info,trading_gateway=info",
        service_name.replace('-', "_")
    );

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true)
                .with_thread_ids(true),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))
}

/// Initialize logging for tests, at most once per process
pub fn init_test_logging() {
    TEST_INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    });
}
