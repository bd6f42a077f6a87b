//! Scripted exchange fake and fixtures shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use oms::{
    AccountInfo, ExchangeClient, ExchangeError, ExchangeOrder, ExchangeResult, InMemoryStore,
    MarginTransfer, OmsConfig, OrderManager, OrderRequest, OrderStatus, OrderType, RetryPolicy,
    SymbolFilters,
};
use parking_lot::Mutex;
use risk_manager::{RiskGate, RiskLimits};
use services_common::MarginType;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub const BTC: &str = "BTCUSDT";
pub const ETH: &str = "ETHUSDT";

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

pub fn eth_filters() -> SymbolFilters {
    SymbolFilters {
        symbol: ETH.to_string(),
        min_qty: 0.01,
        max_qty: 10_000.0,
        step_size: 0.01,
        min_price: 0.01,
        max_price: 0.0,
        tick_size: 0.01,
        max_leverage: 50,
    }
}

/// Exchange double: market orders fill at the mark price, everything else rests
#[derive(Debug)]
pub struct FakeExchange {
    pub next_id: AtomicU64,
    pub balance: Mutex<f64>,
    pub marks: Mutex<HashMap<String, f64>>,
    pub filters: Mutex<HashMap<String, SymbolFilters>>,
    pub orders: Mutex<HashMap<String, ExchangeOrder>>,
    pub placed: Mutex<Vec<(OrderRequest, String)>>,
    pub calls: Mutex<Vec<String>>,
    pub place_failures: Mutex<VecDeque<ExchangeError>>,
    pub cancel_failures: Mutex<VecDeque<ExchangeError>>,
    pub fill_limits: Mutex<bool>,
}

impl FakeExchange {
    pub fn new() -> Self {
        let marks = HashMap::from([(BTC.to_string(), 100.0), (ETH.to_string(), 10.0)]);
        let filters = HashMap::from([(BTC.to_string(), btc_filters()), (ETH.to_string(), eth_filters())]);
        Self {
            next_id: AtomicU64::new(1000),
            balance: Mutex::new(10_000.0),
            marks: Mutex::new(marks),
            filters: Mutex::new(filters),
            orders: Mutex::new(HashMap::new()),
            placed: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            place_failures: Mutex::new(VecDeque::new()),
            cancel_failures: Mutex::new(VecDeque::new()),
            fill_limits: Mutex::new(false),
        }
    }

    pub fn set_mark(&self, symbol: &str, price: f64) {
        self.marks.lock().insert(symbol.to_string(), price);
    }

    pub fn fail_next_placements(&self, errors: impl IntoIterator<Item = ExchangeError>) {
        self.place_failures.lock().extend(errors);
    }

    pub fn placed_types(&self) -> Vec<OrderType> {
        self.placed.lock().iter().map(|(r, _)| r.order_type).collect()
    }

    pub fn placed_requests(&self) -> Vec<OrderRequest> {
        self.placed.lock().iter().map(|(r, _)| r.clone()).collect()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn called(&self, prefix: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// Report a (partial) fill for a resting order
    pub fn fill(&self, exchange_order_id: &str, executed: f64, average_price: f64) -> ExchangeOrder {
        let mut orders = self.orders.lock();
        let order = orders.get_mut(exchange_order_id).expect("known exchange order");
        order.executed_quantity = executed;
        order.average_price = Some(average_price);
        order.status = if executed + 1e-12 >= order.quantity {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        order.update_time += 1;
        order.clone()
    }

    fn mark(&self, symbol: &str) -> f64 {
        self.marks.lock().get(symbol).copied().unwrap_or(100.0)
    }
}

impl Default for FakeExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeClient for FakeExchange {
    async fn place_order(&self, request: &OrderRequest, client_order_id: &str) -> ExchangeResult<ExchangeOrder> {
        self.calls.lock().push(format!("place {} {}", request.order_type, request.symbol));
        if let Some(error) = self.place_failures.lock().pop_front() {
            return Err(error);
        }
        self.placed.lock().push((request.clone(), client_order_id.to_string()));

        let fills_now = match request.order_type {
            OrderType::Market => true,
            OrderType::Limit => *self.fill_limits.lock(),
            _ => false,
        };
        let average_price = match request.order_type {
            OrderType::Market => Some(self.mark(&request.symbol)),
            OrderType::Limit => request.price,
            _ => None,
        };
        let order = ExchangeOrder {
            order_id: self.next_id.fetch_add(1, Ordering::Relaxed).to_string(),
            client_order_id: client_order_id.to_string(),
            symbol: request.symbol.clone(),
            status: if fills_now { OrderStatus::Filled } else { OrderStatus::New },
            quantity: request.quantity,
            executed_quantity: if fills_now { request.quantity } else { 0.0 },
            average_price: if fills_now { average_price } else { None },
            update_time: 1,
        };
        self.orders.lock().insert(order.order_id.clone(), order.clone());
        Ok(order)
    }

    async fn cancel_order(&self, symbol: &str, exchange_order_id: &str) -> ExchangeResult<ExchangeOrder> {
        self.calls.lock().push(format!("cancel {symbol} {exchange_order_id}"));
        if let Some(error) = self.cancel_failures.lock().pop_front() {
            return Err(error);
        }
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
        Ok(self.filters.lock().get(symbol).cloned())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        self.calls.lock().push(format!("leverage {symbol} {leverage}"));
        Ok(())
    }

    async fn set_margin_type(&self, symbol: &str, margin_type: MarginType) -> ExchangeResult<()> {
        self.calls.lock().push(format!("margin_type {symbol} {margin_type}"));
        Ok(())
    }

    async fn transfer_margin(&self, symbol: &str, amount: f64, direction: MarginTransfer) -> ExchangeResult<()> {
        self.calls.lock().push(format!("transfer {symbol} {amount} {direction:?}"));
        Ok(())
    }

    async fn mark_price(&self, symbol: &str) -> ExchangeResult<f64> {
        Ok(self.mark(symbol))
    }
}

/// Millisecond retries so retry tests stay fast
pub fn fast_config() -> OmsConfig {
    OmsConfig {
        placement: RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(1),
        },
        ..OmsConfig::default()
    }
}

pub struct Harness {
    pub exchange: Arc<FakeExchange>,
    pub store: Arc<InMemoryStore>,
    pub manager: OrderManager,
}

pub fn harness() -> Harness {
    harness_with_limits(RiskLimits::default())
}

pub fn harness_with_limits(limits: RiskLimits) -> Harness {
    services_common::logging::init_test_logging();
    let exchange = Arc::new(FakeExchange::new());
    let store = Arc::new(InMemoryStore::new());
    let manager = OrderManager::new(
        "user-1",
        fast_config(),
        exchange.clone(),
        store.clone(),
        Arc::new(RiskGate::new(limits)),
    );
    Harness {
        exchange,
        store,
        manager,
    }
}

pub fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}
