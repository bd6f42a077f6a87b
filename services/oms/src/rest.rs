//! Signed REST client for the USD-M futures API

use crate::error::{ExchangeError, ExchangeErrorKind, ExchangeResult};
use crate::exchange::{AccountInfo, ExchangeClient, MarginTransfer};
use crate::filters::{DEFAULT_MAX_LEVERAGE, SymbolFilters};
use crate::order::{ExchangeOrder, OrderRequest, OrderStatus};
use async_trait::async_trait;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use services_common::{Credentials, MarginType};
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Receive window sent with signed requests, in milliseconds
pub const DEFAULT_RECV_WINDOW_MS: u64 = 5000;

/// Margin type already set; the exchange reports it as an error
const NO_MARGIN_TYPE_CHANGE: i64 = -4046;

/// HMAC-SHA256 signature of `query`, hex encoded
///
/// # Errors
///
/// Returns an authentication error if the key cannot initialise the MAC.
pub fn sign_query(secret: &str, query: &str) -> ExchangeResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::new(ExchangeErrorKind::Authentication, e.to_string()))?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Decimal string without float noise, e.g. `0.1` rather than `0.1000000000000001`
fn decimal(value: f64) -> String {
    let s = format!("{value:.8}");
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

fn parse_decimal(field: &str, raw: &str) -> ExchangeResult<f64> {
    raw.parse::<f64>()
        .map_err(|_| ExchangeError::new(ExchangeErrorKind::Decode, format!("invalid {field}: {raw}")))
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: u64,
    symbol: String,
    status: String,
    #[serde(default)]
    client_order_id: String,
    #[serde(default)]
    avg_price: Option<String>,
    orig_qty: String,
    executed_qty: String,
    #[serde(default)]
    update_time: i64,
}

impl OrderResponse {
    fn into_order(self) -> ExchangeResult<ExchangeOrder> {
        let status = OrderStatus::from_wire(&self.status).ok_or_else(|| {
            ExchangeError::new(ExchangeErrorKind::Decode, format!("unknown order status {}", self.status))
        })?;
        let average_price = match self.avg_price.as_deref() {
            Some(raw) => Some(parse_decimal("avgPrice", raw)?).filter(|p| *p > 0.0),
            None => None,
        };
        Ok(ExchangeOrder {
            order_id: self.order_id.to_string(),
            client_order_id: self.client_order_id,
            symbol: self.symbol,
            status,
            quantity: parse_decimal("origQty", &self.orig_qty)?,
            executed_quantity: parse_decimal("executedQty", &self.executed_qty)?,
            average_price,
            update_time: self.update_time,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountResponse {
    total_wallet_balance: String,
    available_balance: String,
    total_unrealized_profit: String,
    total_margin_balance: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfoResponse {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
    filters: Vec<RawFilter>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "filterType")]
enum RawFilter {
    #[serde(rename = "PRICE_FILTER", rename_all = "camelCase")]
    Price {
        min_price: String,
        max_price: String,
        tick_size: String,
    },
    #[serde(rename = "LOT_SIZE", rename_all = "camelCase")]
    LotSize {
        min_qty: String,
        max_qty: String,
        step_size: String,
    },
    #[serde(other)]
    Other,
}

impl SymbolInfo {
    fn into_filters(self) -> ExchangeResult<SymbolFilters> {
        let mut filters = SymbolFilters {
            symbol: self.symbol,
            min_qty: 0.0,
            max_qty: f64::MAX,
            step_size: 0.0,
            min_price: 0.0,
            max_price: 0.0,
            tick_size: 0.0,
            max_leverage: DEFAULT_MAX_LEVERAGE,
        };
        for raw in self.filters {
            match raw {
                RawFilter::Price {
                    min_price,
                    max_price,
                    tick_size,
                } => {
                    filters.min_price = parse_decimal("minPrice", &min_price)?;
                    filters.max_price = parse_decimal("maxPrice", &max_price)?;
                    filters.tick_size = parse_decimal("tickSize", &tick_size)?;
                }
                RawFilter::LotSize {
                    min_qty,
                    max_qty,
                    step_size,
                } => {
                    filters.min_qty = parse_decimal("minQty", &min_qty)?;
                    filters.max_qty = parse_decimal("maxQty", &max_qty)?;
                    filters.step_size = parse_decimal("stepSize", &step_size)?;
                }
                RawFilter::Other => {}
            }
        }
        Ok(filters)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PremiumIndexResponse {
    mark_price: String,
}

/// Futures REST client with request signing
pub struct BinanceFuturesClient {
    base_url: String,
    credentials: Credentials,
    client: Client,
    recv_window_ms: u64,
    filters: DashMap<String, SymbolFilters>,
}

impl std::fmt::Debug for BinanceFuturesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceFuturesClient")
            .field("base_url", &self.base_url)
            .field("credentials", &self.credentials)
            .field("recv_window_ms", &self.recv_window_ms)
            .field("cached_symbols", &self.filters.len())
            .finish()
    }
}

impl BinanceFuturesClient {
    /// Client for `base_url`, e.g. `https://fapi.binance.com`
    ///
    /// # Errors
    ///
    /// Returns a transport error if the HTTP client cannot be built.
    pub fn new(base_url: &str, credentials: Credentials, timeout: Duration) -> ExchangeResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ExchangeError::transport)?;
        if !credentials.is_configured() {
            warn!("Futures client created without API credentials; signed calls will fail");
        }
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            client,
            recv_window_ms: DEFAULT_RECV_WINDOW_MS,
            filters: DashMap::new(),
        })
    }

    /// Override the receive window
    #[must_use]
    pub fn with_recv_window(mut self, recv_window_ms: u64) -> Self {
        self.recv_window_ms = recv_window_ms;
        self
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> ExchangeResult<T> {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body = response.text().await.map_err(ExchangeError::transport)?;

        if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
            let message = serde_json::from_str::<ApiErrorBody>(&body).map_or(body, |e| e.msg);
            warn!("Rate limited (HTTP {}), retry after {:?}s", status, retry_after);
            return Err(ExchangeError::rate_limited(message, retry_after));
        }

        if !status.is_success() {
            return Err(match serde_json::from_str::<ApiErrorBody>(&body) {
                Ok(api) => ExchangeError::from_code(api.code, api.msg).with_retry_after(retry_after),
                Err(_) => ExchangeError::new(ExchangeErrorKind::Unknown, format!("HTTP {status}: {body}")),
            });
        }

        serde_json::from_str(&body).map_err(|e| ExchangeError::new(ExchangeErrorKind::Decode, e.to_string()))
    }

    async fn public<T: DeserializeOwned>(&self, path: &str, params: &[(&str, String)]) -> ExchangeResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(ExchangeError::transport)?;
        Self::decode(response).await
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> ExchangeResult<T> {
        if !self.credentials.is_configured() {
            return Err(ExchangeError::new(
                ExchangeErrorKind::Authentication,
                "API credentials are not configured",
            ));
        }

        let query = {
            let mut serializer = url::form_urlencoded::Serializer::new(String::new());
            for (key, value) in params {
                serializer.append_pair(key, value);
            }
            serializer.append_pair("recvWindow", &self.recv_window_ms.to_string());
            serializer.append_pair("timestamp", &chrono::Utc::now().timestamp_millis().to_string());
            serializer.finish()
        };
        let signature = sign_query(&self.credentials.api_secret, &query)?;

        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);
        debug!("{} {}", method, path);
        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.credentials.api_key)
            .send()
            .await
            .map_err(ExchangeError::transport)?;
        Self::decode(response).await
    }

    fn order_params(request: &OrderRequest, client_order_id: &str) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("symbol", request.symbol.clone()),
            ("side", request.side.as_str().to_string()),
            ("type", request.order_type.as_str().to_string()),
        ];
        if request.close_position {
            params.push(("closePosition", "true".to_string()));
        } else {
            params.push(("quantity", decimal(request.quantity)));
        }
        if let Some(price) = request.price {
            params.push(("price", decimal(price)));
        }
        if let Some(stop_price) = request.stop_price {
            params.push(("stopPrice", decimal(stop_price)));
        }
        if request.order_type.takes_time_in_force() {
            params.push(("timeInForce", request.time_in_force.as_str().to_string()));
        }
        if request.reduce_only && !request.close_position {
            params.push(("reduceOnly", "true".to_string()));
        }
        params.push(("newClientOrderId", client_order_id.to_string()));
        params.push(("newOrderRespType", "RESULT".to_string()));
        params
    }

    async fn load_filters(&self) -> ExchangeResult<()> {
        let info: ExchangeInfoResponse = self.public("/fapi/v1/exchangeInfo", &[]).await?;
        let count = info.symbols.len();
        for symbol in info.symbols {
            let filters = symbol.into_filters()?;
            self.filters.insert(filters.symbol.clone(), filters);
        }
        info!("Loaded trading rules for {} symbols", count);
        Ok(())
    }
}

#[async_trait]
impl ExchangeClient for BinanceFuturesClient {
    async fn place_order(&self, request: &OrderRequest, client_order_id: &str) -> ExchangeResult<ExchangeOrder> {
        let params = Self::order_params(request, client_order_id);
        let response: OrderResponse = self.signed(Method::POST, "/fapi/v1/order", &params).await?;
        let order = response.into_order()?;
        info!(
            "Placed {} {} {} {} -> {} ({})",
            request.order_type, request.side, request.quantity, request.symbol, order.order_id, order.status
        );
        Ok(order)
    }

    async fn cancel_order(&self, symbol: &str, exchange_order_id: &str) -> ExchangeResult<ExchangeOrder> {
        let params = [("symbol", symbol.to_string()), ("orderId", exchange_order_id.to_string())];
        let response: OrderResponse = self.signed(Method::DELETE, "/fapi/v1/order", &params).await?;
        response.into_order()
    }

    async fn get_order(&self, symbol: &str, exchange_order_id: &str) -> ExchangeResult<ExchangeOrder> {
        let params = [("symbol", symbol.to_string()), ("orderId", exchange_order_id.to_string())];
        let response: OrderResponse = self.signed(Method::GET, "/fapi/v1/order", &params).await?;
        response.into_order()
    }

    async fn account(&self) -> ExchangeResult<AccountInfo> {
        let response: AccountResponse = self.signed(Method::GET, "/fapi/v2/account", &[]).await?;
        Ok(AccountInfo {
            total_wallet_balance: parse_decimal("totalWalletBalance", &response.total_wallet_balance)?,
            available_balance: parse_decimal("availableBalance", &response.available_balance)?,
            total_unrealized_profit: parse_decimal("totalUnrealizedProfit", &response.total_unrealized_profit)?,
            total_margin_balance: parse_decimal("totalMarginBalance", &response.total_margin_balance)?,
        })
    }

    async fn symbol_filters(&self, symbol: &str) -> ExchangeResult<Option<SymbolFilters>> {
        let symbol = services_common::normalize_symbol(symbol);
        if let Some(filters) = self.filters.get(&symbol) {
            return Ok(Some(filters.value().clone()));
        }
        self.load_filters().await?;
        Ok(self.filters.get(&symbol).map(|f| f.value().clone()))
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        let params = [("symbol", symbol.to_string()), ("leverage", leverage.to_string())];
        let _: serde_json::Value = self.signed(Method::POST, "/fapi/v1/leverage", &params).await?;
        debug!("Leverage for {} set to {}x", symbol, leverage);
        Ok(())
    }

    async fn set_margin_type(&self, symbol: &str, margin_type: MarginType) -> ExchangeResult<()> {
        let params = [("symbol", symbol.to_string()), ("marginType", margin_type.to_string())];
        match self.signed::<serde_json::Value>(Method::POST, "/fapi/v1/marginType", &params).await {
            Ok(_) => Ok(()),
            Err(e) if e.code == Some(NO_MARGIN_TYPE_CHANGE) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn transfer_margin(&self, symbol: &str, amount: f64, direction: MarginTransfer) -> ExchangeResult<()> {
        let kind = match direction {
            MarginTransfer::Add => "1",
            MarginTransfer::Reduce => "2",
        };
        let params = [
            ("symbol", symbol.to_string()),
            ("amount", decimal(amount)),
            ("type", kind.to_string()),
        ];
        let _: serde_json::Value = self.signed(Method::POST, "/fapi/v1/positionMargin", &params).await?;
        Ok(())
    }

    async fn mark_price(&self, symbol: &str) -> ExchangeResult<f64> {
        let response: PremiumIndexResponse = self
            .public("/fapi/v1/premiumIndex", &[("symbol", services_common::normalize_symbol(symbol))])
            .await?;
        parse_decimal("markPrice", &response.mark_price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_matches_reference_vector() {
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            sign_query(secret, query).ok().as_deref(),
            Some("c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71")
        );
    }

    #[test]
    fn test_decimal_formatting() {
        assert_eq!(decimal(50.0), "50");
        assert_eq!(decimal(0.1 + 0.2), "0.3");
        assert_eq!(decimal(0.001), "0.001");
    }

    #[test]
    fn test_order_params_for_protective_order() {
        let request = OrderRequest::stop_market("BTCUSDT", services_common::Side::Sell, 0.5, 95.5);
        let params = BinanceFuturesClient::order_params(&request, "cid");
        let get = |k: &str| params.iter().find(|(key, _)| *key == k).map(|(_, v)| v.as_str());
        assert_eq!(get("type"), Some("STOP_MARKET"));
        assert_eq!(get("stopPrice"), Some("95.5"));
        assert_eq!(get("reduceOnly"), Some("true"));
        assert_eq!(get("timeInForce"), None);
        assert_eq!(get("newClientOrderId"), Some("cid"));
    }
}
