//! Order book snapshots over REST

use crate::error::{StreamError, StreamResult};
use crate::orderbook::{DepthSnapshot, PriceLevel};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Source of full order book snapshots
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Fetch the top `limit` levels per side of `symbol`
    async fn fetch_depth(&self, symbol: &str, limit: u32) -> StreamResult<DepthSnapshot>;
}

#[derive(Debug, Deserialize)]
struct DepthResponse {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    #[serde(rename = "E", default)]
    event_time: u64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

/// Depth snapshots from the futures REST API
#[derive(Debug, Clone)]
pub struct RestSnapshotClient {
    base_url: String,
    client: Client,
}

impl RestSnapshotClient {
    /// Client for `base_url`, e.g. `https://fapi.binance.com`
    pub fn new(base_url: &str, timeout: Duration) -> StreamResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(StreamError::transport)?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn parse_levels(symbol: &str, raw: &[[String; 2]]) -> StreamResult<Vec<PriceLevel>> {
        raw.iter()
            .map(|[p, q]| match (p.parse::<f64>(), q.parse::<f64>()) {
                (Ok(price), Ok(quantity)) => Ok(PriceLevel::new(price, quantity)),
                _ => Err(StreamError::Snapshot {
                    symbol: symbol.to_string(),
                    message: format!("invalid level [{p}, {q}]"),
                }),
            })
            .collect()
    }
}

#[async_trait]
impl SnapshotSource for RestSnapshotClient {
    async fn fetch_depth(&self, symbol: &str, limit: u32) -> StreamResult<DepthSnapshot> {
        let symbol = services_common::normalize_symbol(symbol);
        let url = format!("{}/fapi/v1/depth", self.base_url);
        let snapshot_error = |message: String| StreamError::Snapshot {
            symbol: symbol.clone(),
            message,
        };

        let limit = limit.to_string();
        let response = self
            .client
            .get(&url)
            .query(&[("symbol", symbol.as_str()), ("limit", limit.as_str())])
            .send()
            .await
            .map_err(|e| snapshot_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(snapshot_error(format!("HTTP {status}: {body}")));
        }

        let depth: DepthResponse = response
            .json()
            .await
            .map_err(|e| snapshot_error(e.to_string()))?;

        debug!(
            "Fetched {} snapshot at {} ({} bids, {} asks)",
            symbol,
            depth.last_update_id,
            depth.bids.len(),
            depth.asks.len()
        );

        Ok(DepthSnapshot {
            bids: Self::parse_levels(&symbol, &depth.bids)?,
            asks: Self::parse_levels(&symbol, &depth.asks)?,
            last_update_id: depth.last_update_id,
            event_time: depth.event_time,
            symbol,
        })
    }
}
