//! Signed futures REST client against a mock exchange

use oms::rest::sign_query;
use oms::{
    BinanceFuturesClient, ExchangeClient, ExchangeErrorKind, MarginTransfer, OrderRequest,
    OrderStatus,
};
use serde_json::json;
use services_common::{Credentials, MarginType, Side};
use std::time::Duration;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);
const SECRET: &str = "test-secret";

fn client(server: &MockServer) -> BinanceFuturesClient {
    let credentials = Credentials {
        api_key: "test-key".to_string(),
        api_secret: SECRET.to_string(),
    };
    BinanceFuturesClient::new(&server.uri(), credentials, TEST_TIMEOUT).expect("client builds")
}

fn order_body(status: &str, executed: &str, avg: &str) -> serde_json::Value {
    json!({
        "orderId": 22542179,
        "symbol": "BTCUSDT",
        "status": status,
        "clientOrderId": "oms-1-1",
        "price": "0",
        "avgPrice": avg,
        "origQty": "0.010",
        "executedQty": executed,
        "type": "MARKET",
        "side": "BUY",
        "updateTime": 1566818724722u64
    })
}

#[tokio::test]
async fn test_place_order_is_signed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/fapi/v1/order"))
        .and(header("X-MBX-APIKEY", "test-key"))
        .and(query_param("symbol", "BTCUSDT"))
        .and(query_param("side", "BUY"))
        .and(query_param("type", "MARKET"))
        .and(query_param("quantity", "0.01"))
        .and(query_param("newClientOrderId", "oms-1-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(order_body("FILLED", "0.010", "50000.10")))
        .expect(1)
        .mount(&server)
        .await;

    let order = client(&server)
        .place_order(&OrderRequest::market("BTCUSDT", Side::Buy, 0.01), "oms-1-1")
        .await
        .expect("order placed");

    assert_eq!(order.order_id, "22542179");
    assert_eq!(order.status, OrderStatus::Filled);
    assert_eq!(order.executed_quantity, 0.01);
    assert_eq!(order.average_price, Some(50000.1));

    let requests = server.received_requests().await.expect("recording enabled");
    let query = requests[0].url.query().expect("query string");
    let (payload, signature) = query.split_once("&signature=").expect("signature is last");
    assert!(payload.contains("recvWindow=5000"));
    assert!(payload.contains("timestamp="));
    assert_eq!(sign_query(SECRET, payload).ok().as_deref(), Some(signature));
}

#[tokio::test]
async fn test_error_codes_map_to_kinds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/fapi/v1/order"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "code": -1010,
            "msg": "Account has insufficient balance for requested action."
        })))
        .mount(&server)
        .await;

    let err = client(&server)
        .place_order(&OrderRequest::market("BTCUSDT", Side::Buy, 0.01), "cid")
        .await
        .expect_err("rejected");

    assert_eq!(err.kind, ExchangeErrorKind::InsufficientBalance);
    assert_eq!(err.code, Some(-1010));
    assert!(!err.is_transient());
    assert!(err.message.contains("insufficient balance"));
}

#[tokio::test]
async fn test_rate_limit_carries_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fapi/v2/account"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("Retry-After", "7")
                .set_body_json(json!({"code": -1003, "msg": "Too many requests."})),
        )
        .mount(&server)
        .await;

    let err = client(&server).account().await.expect_err("rate limited");

    assert_eq!(err.kind, ExchangeErrorKind::RateLimit);
    assert_eq!(err.retry_after, Some(7));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_unsigned_client_refuses_signed_calls() {
    let server = MockServer::start().await;
    let client = BinanceFuturesClient::new(&server.uri(), Credentials::default(), TEST_TIMEOUT)
        .expect("client builds");

    let err = client.account().await.expect_err("no credentials");

    assert_eq!(err.kind, ExchangeErrorKind::Authentication);
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
}

#[tokio::test]
async fn test_account_balances_parse() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fapi/v2/account"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "totalWalletBalance": "10000.50",
            "availableBalance": "9000.25",
            "totalUnrealizedProfit": "-12.5",
            "totalMarginBalance": "9988.00",
            "assets": [],
            "positions": []
        })))
        .mount(&server)
        .await;

    let account = client(&server).account().await.expect("account");

    assert_eq!(account.total_wallet_balance, 10000.5);
    assert_eq!(account.available_balance, 9000.25);
    assert_eq!(account.total_unrealized_profit, -12.5);
}

#[tokio::test]
async fn test_signed_calls_run_on_spawned_tasks() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/fapi/v1/order"))
        .respond_with(ResponseTemplate::new(200).set_body_json(order_body("NEW", "0", "0")))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let handle = tokio::spawn(async move {
        client
            .place_order(&OrderRequest::market("BTCUSDT", Side::Buy, 0.01), "oms-1-1")
            .await
    });

    let order = handle.await.expect("task joins").expect("order placed");
    assert_eq!(order.status, OrderStatus::New);
}

#[tokio::test]
async fn test_exchange_info_is_fetched_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fapi/v1/exchangeInfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "timezone": "UTC",
            "symbols": [{
                "symbol": "BTCUSDT",
                "status": "TRADING",
                "filters": [
                    {"filterType": "PRICE_FILTER", "minPrice": "556.80", "maxPrice": "4529764", "tickSize": "0.10"},
                    {"filterType": "LOT_SIZE", "minQty": "0.001", "maxQty": "1000", "stepSize": "0.001"},
                    {"filterType": "MARKET_LOT_SIZE", "minQty": "0.001", "maxQty": "120", "stepSize": "0.001"},
                    {"filterType": "MIN_NOTIONAL", "notional": "100"}
                ]
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let filters = client
        .symbol_filters("btcusdt")
        .await
        .expect("loaded")
        .expect("listed");
    assert_eq!(filters.tick_size, 0.1);
    assert_eq!(filters.step_size, 0.001);
    assert_eq!(filters.min_price, 556.8);
    assert_eq!(filters.max_qty, 1000.0);

    assert!(client.symbol_filters("BTCUSDT").await.expect("cached").is_some());
}

#[tokio::test]
async fn test_margin_type_already_set_is_not_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/fapi/v1/marginType"))
        .and(query_param("marginType", "ISOLATED"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "code": -4046,
            "msg": "No need to change margin type."
        })))
        .expect(1)
        .mount(&server)
        .await;

    client(&server)
        .set_margin_type("BTCUSDT", MarginType::Isolated)
        .await
        .expect("treated as success");
}

#[tokio::test]
async fn test_margin_transfer_direction() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/fapi/v1/positionMargin"))
        .and(query_param("type", "2"))
        .and(query_param("amount", "12.5"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "amount": 12.5, "code": 200, "msg": "Successfully modify position margin.", "type": 2
        })))
        .expect(1)
        .mount(&server)
        .await;

    client(&server)
        .transfer_margin("BTCUSDT", 12.5, MarginTransfer::Reduce)
        .await
        .expect("transferred");
}

#[tokio::test]
async fn test_mark_price_parses() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fapi/v1/premiumIndex"))
        .and(query_param("symbol", "BTCUSDT"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "symbol": "BTCUSDT",
            "markPrice": "11793.63104562",
            "lastFundingRate": "0.00038246"
        })))
        .mount(&server)
        .await;

    let mark = client(&server).mark_price("btcusdt").await.expect("mark");
    assert!((mark - 11_793.631_045_62).abs() < 1e-9);
}
