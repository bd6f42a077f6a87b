//! Exchange and market data doubles shared by the pipeline tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use market_connector::{
    BookConfig, DepthSnapshot, MarketDataProvider, MarketSnapshot, OrderBook, OrderBookSnapshot, PriceLevel, Trend,
};
use oms::{
    AccountInfo, ExchangeClient, ExchangeError, ExchangeOrder, ExchangeResult, InMemoryStore, MarginTransfer,
    OmsConfig, OrderManager, OrderRequest, OrderStatus, OrderType, RetryPolicy, SymbolFilters,
};
use parking_lot::{Mutex, RwLock};
use risk_manager::{PositionSizer, RiskGate, RiskLimits};
use services_common::MarginType;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use trading_gateway::{InMemorySignalStore, PipelineConfig, SignalExecutionPipeline};

pub const BTC: &str = "BTCUSDT";

pub fn btc_filters() -> SymbolFilters {
    SymbolFilters {
        symbol: BTC.to_string(),
        min_qty: 0.001,
        max_qty: 1000.0,
        step_size: 0.001,
        min_price: 0.1,
        max_price: 0.0,
        tick_size: 0.1,
        max_leverage: 125,
    }
}

/// Exchange double: market orders fill at the mark, everything else rests
#[derive(Debug)]
pub struct FakeExchange {
    next_id: AtomicU64,
    pub balance: Mutex<f64>,
    marks: Mutex<HashMap<String, f64>>,
    orders: Mutex<HashMap<String, ExchangeOrder>>,
    placed: Mutex<Vec<OrderRequest>>,
    place_failures: Mutex<VecDeque<ExchangeError>>,
}

impl FakeExchange {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            balance: Mutex::new(10_000.0),
            marks: Mutex::new(HashMap::from([(BTC.to_string(), 100.0)])),
            orders: Mutex::new(HashMap::new()),
            placed: Mutex::new(Vec::new()),
            place_failures: Mutex::new(VecDeque::new()),
        }
    }

    pub fn set_mark(&self, symbol: &str, price: f64) {
        self.marks.lock().insert(symbol.to_string(), price);
    }

    pub fn fail_next_placements(&self, errors: impl IntoIterator<Item = ExchangeError>) {
        self.place_failures.lock().extend(errors);
    }

    pub fn placed(&self) -> Vec<OrderRequest> {
        self.placed.lock().clone()
    }

    pub fn placed_types(&self) -> Vec<OrderType> {
        self.placed.lock().iter().map(|r| r.order_type).collect()
    }

    fn mark(&self, symbol: &str) -> f64 {
        self.marks.lock().get(symbol).copied().unwrap_or(100.0)
    }
}

#[async_trait]
impl ExchangeClient for FakeExchange {
    async fn place_order(&self, request: &OrderRequest, client_order_id: &str) -> ExchangeResult<ExchangeOrder> {
        if let Some(error) = self.place_failures.lock().pop_front() {
            return Err(error);
        }
        self.placed.lock().push(request.clone());

        let fills = request.order_type == OrderType::Market;
        let order = ExchangeOrder {
            order_id: self.next_id.fetch_add(1, Ordering::Relaxed).to_string(),
            client_order_id: client_order_id.to_string(),
            symbol: request.symbol.clone(),
            status: if fills { OrderStatus::Filled } else { OrderStatus::New },
            quantity: request.quantity,
            executed_quantity: if fills { request.quantity } else { 0.0 },
            average_price: fills.then(|| self.mark(&request.symbol)),
            update_time: 1,
        };
        self.orders.lock().insert(order.order_id.clone(), order.clone());
        Ok(order)
    }

    async fn cancel_order(&self, _symbol: &str, exchange_order_id: &str) -> ExchangeResult<ExchangeOrder> {
        let mut orders = self.orders.lock();
        let order = orders
            .get_mut(exchange_order_id)
            .ok_or_else(|| ExchangeError::from_code(-2011, "Unknown order sent."))?;
        order.status = OrderStatus::Canceled;
        order.update_time += 1;
        Ok(order.clone())
    }

    async fn get_order(&self, _symbol: &str, exchange_order_id: &str) -> ExchangeResult<ExchangeOrder> {
        self.orders
            .lock()
            .get(exchange_order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::from_code(-2013, "Order does not exist."))
    }

    async fn account(&self) -> ExchangeResult<AccountInfo> {
        let balance = *self.balance.lock();
        Ok(AccountInfo {
            total_wallet_balance: balance,
            available_balance: balance,
            total_unrealized_profit: 0.0,
            total_margin_balance: balance,
        })
    }

    async fn symbol_filters(&self, symbol: &str) -> ExchangeResult<Option<SymbolFilters>> {
        Ok((symbol == BTC).then(btc_filters))
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> ExchangeResult<()> {
        Ok(())
    }

    async fn set_margin_type(&self, _symbol: &str, _margin_type: MarginType) -> ExchangeResult<()> {
        Ok(())
    }

    async fn transfer_margin(&self, _symbol: &str, _amount: f64, _direction: MarginTransfer) -> ExchangeResult<()> {
        Ok(())
    }

    async fn mark_price(&self, symbol: &str) -> ExchangeResult<f64> {
        Ok(self.mark(symbol))
    }
}

/// Book with one level per side around `mid`
pub fn book(mid: f64, half_spread: f64, bid_qty: f64, ask_qty: f64) -> OrderBookSnapshot {
    let mut book = OrderBook::new(BTC, BookConfig::default());
    book.apply_snapshot(&DepthSnapshot {
        symbol: BTC.to_string(),
        last_update_id: 1,
        bids: vec![PriceLevel::new(mid - half_spread, bid_qty)],
        asks: vec![PriceLevel::new(mid + half_spread, ask_qty)],
        event_time: 0,
    })
    .expect("snapshot applies");
    book.snapshot()
}

/// Calm, liquid analytics at `price`
pub fn analytics(price: f64) -> MarketSnapshot {
    MarketSnapshot {
        symbol: BTC.to_string(),
        last_price: Some(price),
        best_bid: Some(price - 0.01),
        best_ask: Some(price + 0.01),
        mark_price: Some(price),
        funding_rate: Some(0.0001),
        price_change_24h_percent: Some(1.0),
        high_24h: Some(price * 1.01),
        low_24h: Some(price * 0.99),
        volume_24h: Some(1_000_000.0),
        price_change_percent: 0.0,
        volatility: 0.0,
        momentum: 0.0,
        trend: Trend::Up,
        sma_short: None,
        sma_long: None,
        volume_ratio: 1.0,
        buy_sell_ratio: None,
        signal_strength: 0.0,
        samples: 100,
        last_update: None,
        computed_at: Utc::now(),
    }
}

/// Market data double with directly settable snapshots
#[derive(Debug, Default)]
pub struct FakeMarket {
    books: RwLock<HashMap<String, Arc<OrderBookSnapshot>>>,
    snapshots: RwLock<HashMap<String, Arc<MarketSnapshot>>>,
}

impl FakeMarket {
    /// Calm market around 100 with balanced depth
    pub fn calm() -> Self {
        let market = Self::default();
        market.set_book(book(100.0, 0.01, 10.0, 10.0));
        market.set_analytics(analytics(100.0));
        market
    }

    pub fn set_book(&self, book: OrderBookSnapshot) {
        self.books.write().insert(book.symbol.clone(), Arc::new(book));
    }

    pub fn set_analytics(&self, snapshot: MarketSnapshot) {
        self.snapshots.write().insert(snapshot.symbol.clone(), Arc::new(snapshot));
    }

    pub fn update_analytics(&self, update: impl FnOnce(&mut MarketSnapshot)) {
        let mut snapshot = self
            .snapshots
            .read()
            .get(BTC)
            .map(|s| s.as_ref().clone())
            .unwrap_or_else(|| analytics(100.0));
        update(&mut snapshot);
        self.set_analytics(snapshot);
    }

    pub fn clear(&self) {
        self.books.write().clear();
        self.snapshots.write().clear();
    }
}

impl MarketDataProvider for FakeMarket {
    fn book_snapshot(&self, symbol: &str) -> Option<Arc<OrderBookSnapshot>> {
        self.books.read().get(symbol).cloned()
    }

    fn market_snapshot(&self, symbol: &str) -> Option<Arc<MarketSnapshot>> {
        self.snapshots.read().get(symbol).cloned()
    }

    fn recent_prices(&self, _symbol: &str, _limit: usize) -> Vec<f64> {
        Vec::new()
    }
}

pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        attempts: 3,
        delay: Duration::from_millis(1),
    }
}

pub struct Harness {
    pub exchange: Arc<FakeExchange>,
    pub market: Arc<FakeMarket>,
    pub orders: Arc<OrderManager>,
    pub store: Arc<InMemorySignalStore>,
    pub pipeline: SignalExecutionPipeline,
}

pub fn harness() -> Harness {
    harness_with_limits(RiskLimits::default())
}

pub fn harness_with_limits(limits: RiskLimits) -> Harness {
    services_common::logging::init_test_logging();
    let exchange = Arc::new(FakeExchange::new());
    let market = Arc::new(FakeMarket::calm());
    let orders = Arc::new(OrderManager::new(
        "user-1",
        OmsConfig {
            placement: fast_policy(),
            ..OmsConfig::default()
        },
        exchange.clone(),
        Arc::new(InMemoryStore::new()),
        Arc::new(RiskGate::new(limits.clone())),
    ));
    let store = Arc::new(InMemorySignalStore::new());
    let config = PipelineConfig {
        placement: fast_policy(),
        evaluation_interval_ms: 10,
        ..PipelineConfig::default()
    };
    let pipeline = SignalExecutionPipeline::new(
        config,
        orders.clone(),
        market.clone(),
        PositionSizer::new(limits),
        store.clone(),
    );
    Harness {
        exchange,
        market,
        orders,
        store,
        pipeline,
    }
}

pub fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}
