//! Order and position lifecycle owner
//!
//! One [`OrderManager`] serves one account. Every mutation of an order or a
//! position runs under the account's per-symbol lock, so two callers can never
//! interleave risk checks and placements on the same symbol. Callers that need
//! to hold the lock across their own checks take a [`SymbolGuard`] and use the
//! `*_guarded` variants.

use crate::error::{ExchangeError, ExchangeErrorKind, OmsError, OmsResult};
use crate::exchange::{ExchangeClient, MarginTransfer};
use crate::filters::SymbolFilters;
use crate::lifecycle::{OrderLifecycleManager, ReportOutcome};
use crate::order::{ExchangeOrder, Order, OrderAmendment, OrderRequest, OrderStatus};
use crate::persistence::Persistence;
use crate::position::{Position, PositionStatus};
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex as SyncMutex, RwLock};
use risk_manager::{AccountSnapshot, PositionRequest, RiskGate};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use services_common::{EPSILON, MarginType, PositionSide, normalize_symbol};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, broadcast};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bounded retry of transient placement failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts including the first
    pub attempts: u32,
    /// Delay between attempts
    #[serde(with = "millis")]
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: services_common::DEFAULT_MAX_RETRIES,
            delay: Duration::from_millis(services_common::DEFAULT_RETRY_DELAY_MS),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// OMS Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OmsConfig {
    /// Maintenance margin rate used for liquidation prices
    pub maintenance_margin_rate: f64,
    /// Capacity of the event broadcast channel
    pub event_buffer: usize,
    /// Retry policy for direct placements
    pub placement: RetryPolicy,
}

impl Default for OmsConfig {
    fn default() -> Self {
        Self {
            maintenance_margin_rate: 0.004,
            event_buffer: 10_000,
            placement: RetryPolicy::default(),
        }
    }
}

/// Parameters of a new position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPositionRequest {
    /// Symbol
    pub symbol: String,
    /// Direction
    pub side: PositionSide,
    /// Size in base units
    pub quantity: f64,
    /// Limit entry price; market entry when absent
    pub entry_price: Option<f64>,
    /// Leverage
    pub leverage: u32,
    /// Margin mode
    pub margin_type: MarginType,
    /// Stop-loss trigger
    pub stop_loss: Option<f64>,
    /// Take-profit trigger
    pub take_profit: Option<f64>,
    /// Trailing stop distance
    pub trailing_stop: Option<f64>,
}

impl OpenPositionRequest {
    /// Market entry with crossed margin and no protective orders
    #[must_use]
    pub fn new(symbol: &str, side: PositionSide, quantity: f64, leverage: u32) -> Self {
        Self {
            symbol: normalize_symbol(symbol),
            side,
            quantity,
            entry_price: None,
            leverage,
            margin_type: MarginType::Crossed,
            stop_loss: None,
            take_profit: None,
            trailing_stop: None,
        }
    }

    /// Enter with a limit order at `price`
    #[must_use]
    pub const fn with_entry_price(mut self, price: f64) -> Self {
        self.entry_price = Some(price);
        self
    }

    /// Protective levels
    #[must_use]
    pub const fn with_stops(mut self, stop_loss: Option<f64>, take_profit: Option<f64>) -> Self {
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self
    }

    /// Margin mode
    #[must_use]
    pub const fn with_margin_type(mut self, margin_type: MarginType) -> Self {
        self.margin_type = margin_type;
        self
    }
}

/// Exclusive right to mutate one symbol's orders and positions
#[derive(Debug)]
pub struct SymbolGuard {
    symbol: String,
    _guard: OwnedMutexGuard<()>,
}

impl SymbolGuard {
    /// Symbol the guard covers
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }
}

/// Order and position events for broadcasting
#[derive(Debug, Clone)]
pub enum OmsEvent {
    /// New order accepted by the exchange
    OrderCreated(Order),
    /// Order status changed
    OrderStatusChanged {
        /// Order ID
        order_id: Uuid,
        /// Old status
        old_status: OrderStatus,
        /// New status
        new_status: OrderStatus,
        /// Timestamp
        timestamp: DateTime<Utc>,
    },
    /// Position opened
    PositionOpened(Position),
    /// Position size, margin or protective levels changed
    PositionUpdated(Position),
    /// Position closed
    PositionClosed(Position),
    /// Position liquidated
    PositionLiquidated(Position),
}

/// OMS Metrics
#[derive(Debug, Default)]
struct OmsMetrics {
    orders_created: AtomicU64,
    orders_filled: AtomicU64,
    orders_cancelled: AtomicU64,
    orders_rejected: AtomicU64,
    placement_retries: AtomicU64,
    positions_opened: AtomicU64,
    positions_closed: AtomicU64,
    positions_liquidated: AtomicU64,
}

/// OMS metrics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OmsMetricsSnapshot {
    /// Orders accepted by the exchange
    pub orders_created: u64,
    /// Orders that reached FILLED
    pub orders_filled: u64,
    /// Orders that reached CANCELED
    pub orders_cancelled: u64,
    /// Orders the exchange rejected
    pub orders_rejected: u64,
    /// Placement attempts after the first
    pub placement_retries: u64,
    /// Positions opened
    pub positions_opened: u64,
    /// Positions closed
    pub positions_closed: u64,
    /// Positions liquidated
    pub positions_liquidated: u64,
    /// Orders still working
    pub active_orders: usize,
    /// Positions still open
    pub open_positions: usize,
}

#[derive(Debug)]
struct DailyPnl {
    day: NaiveDate,
    realized: f64,
    start_equity: Option<f64>,
}

impl DailyPnl {
    fn today() -> Self {
        Self {
            day: Utc::now().date_naive(),
            realized: 0.0,
            start_equity: None,
        }
    }

    fn roll(&mut self) {
        let today = Utc::now().date_naive();
        if self.day != today {
            *self = Self::today();
        }
    }
}

enum PositionChange {
    Opened(Position),
    Updated(Position),
    Closed(Position),
}

/// Order and position lifecycle owner for one account
pub struct OrderManager {
    user_id: String,
    config: OmsConfig,
    exchange: Arc<dyn ExchangeClient>,
    persistence: Arc<dyn Persistence>,
    gate: Arc<RiskGate>,
    lifecycle: OrderLifecycleManager,
    orders: RwLock<FxHashMap<Uuid, Order>>,
    exchange_ids: RwLock<FxHashMap<String, Uuid>>,
    positions: RwLock<FxHashMap<Uuid, Position>>,
    open_by_symbol: RwLock<FxHashMap<String, Uuid>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    daily: SyncMutex<DailyPnl>,
    client_order_seq: AtomicU64,
    event_bus: broadcast::Sender<OmsEvent>,
    metrics: OmsMetrics,
}

impl std::fmt::Debug for OrderManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderManager")
            .field("user_id", &self.user_id)
            .field("config", &self.config)
            .field("orders", &self.orders.read().len())
            .field("positions", &self.positions.read().len())
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl OrderManager {
    /// Manager for `user_id` trading through `exchange`
    pub fn new(
        user_id: &str,
        config: OmsConfig,
        exchange: Arc<dyn ExchangeClient>,
        persistence: Arc<dyn Persistence>,
        gate: Arc<RiskGate>,
    ) -> Self {
        let (event_bus, _) = broadcast::channel(config.event_buffer.max(1));
        info!("Initializing order manager for {}", user_id);
        Self {
            user_id: user_id.to_string(),
            config,
            exchange,
            persistence,
            gate,
            lifecycle: OrderLifecycleManager::new(),
            orders: RwLock::new(FxHashMap::default()),
            exchange_ids: RwLock::new(FxHashMap::default()),
            positions: RwLock::new(FxHashMap::default()),
            open_by_symbol: RwLock::new(FxHashMap::default()),
            locks: DashMap::new(),
            daily: SyncMutex::new(DailyPnl::today()),
            client_order_seq: AtomicU64::new(1),
            event_bus,
            metrics: OmsMetrics::default(),
        }
    }

    /// Account served by this manager
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Configuration
    #[must_use]
    pub const fn config(&self) -> &OmsConfig {
        &self.config
    }

    /// Risk gate used for direct position requests
    #[must_use]
    pub fn gate(&self) -> &RiskGate {
        &self.gate
    }

    /// Subscribe to order and position events
    pub fn subscribe(&self) -> broadcast::Receiver<OmsEvent> {
        self.event_bus.subscribe()
    }

    /// Take the mutation lock for `symbol`
    pub async fn lock(&self, symbol: &str) -> SymbolGuard {
        let symbol = normalize_symbol(symbol);
        let mutex = self
            .locks
            .entry(symbol.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        SymbolGuard {
            symbol,
            _guard: mutex.lock_owned().await,
        }
    }

    fn check_guard(guard: &SymbolGuard, symbol: &str) -> OmsResult<()> {
        if guard.symbol != symbol {
            return Err(OmsError::validation(format!(
                "Lock held for {} but operation targets {}",
                guard.symbol, symbol
            )));
        }
        Ok(())
    }

    fn next_client_order_id(&self) -> String {
        let seq = self.client_order_seq.fetch_add(1, Ordering::Relaxed);
        format!("oms-{}-{}", Utc::now().timestamp_millis(), seq)
    }

    /// Trading rules for `symbol`, `None` when unlisted
    ///
    /// # Errors
    ///
    /// Propagates exchange failures.
    pub async fn symbol_filters(&self, symbol: &str) -> OmsResult<Option<SymbolFilters>> {
        Ok(self.exchange.symbol_filters(&normalize_symbol(symbol)).await?)
    }

    async fn require_filters(&self, symbol: &str) -> OmsResult<SymbolFilters> {
        self.symbol_filters(symbol)
            .await?
            .ok_or_else(|| OmsError::validation(format!("Invalid symbol: {symbol}")))
    }

    async fn prepare(&self, request: &OrderRequest) -> OmsResult<()> {
        self.lifecycle.validate_request(request)?;
        self.require_filters(&request.symbol)
            .await?
            .validate_order(request)
    }

    async fn place_with_retry(
        &self,
        request: &OrderRequest,
        policy: RetryPolicy,
    ) -> OmsResult<ExchangeOrder> {
        let client_order_id = self.next_client_order_id();
        let attempts = policy.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.exchange.place_order(request, &client_order_id).await {
                Ok(ack) => return Ok(ack),
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(
                        "Placement of {} {} failed (attempt {}/{}): {}",
                        request.order_type, request.symbol, attempt, attempts, e
                    );
                    self.metrics.placement_retries.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("oms_placement_retries_total").increment(1);
                    let delay = e.retry_after.map_or(policy.delay, Duration::from_secs);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    error!("Placement of {} {} gave up after {} attempts: {}", request.order_type, request.symbol, attempt, e);
                    return Err(OmsError::PlacementFailed {
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    error!("Placement of {} {} rejected: {}", request.order_type, request.symbol, e);
                    return Err(e.into());
                }
            }
        }
    }

    async fn record(
        &self,
        request: &OrderRequest,
        ack: &ExchangeOrder,
        position_id: Option<Uuid>,
    ) -> OmsResult<Order> {
        let order = Order::from_ack(&self.user_id, request, ack, position_id);
        {
            let mut exchange_ids = self.exchange_ids.write();
            if exchange_ids.contains_key(&order.exchange_order_id) {
                return Err(OmsError::DuplicateOrder {
                    exchange_order_id: order.exchange_order_id,
                });
            }
            exchange_ids.insert(order.exchange_order_id.clone(), order.id);
            self.orders.write().insert(order.id, order.clone());
        }

        self.metrics.orders_created.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("oms_orders_created_total", "type" => order.order_type.as_str()).increment(1);
        match order.status {
            OrderStatus::Rejected => {
                self.metrics.orders_rejected.fetch_add(1, Ordering::Relaxed);
            }
            OrderStatus::Filled => {
                self.metrics.orders_filled.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }

        self.persistence.save_order(&order).await?;
        let _ = self.event_bus.send(OmsEvent::OrderCreated(order.clone()));
        debug!("Order {} recorded as {} ({})", order.id, order.exchange_order_id, order.status);
        Ok(order)
    }

    /// Place an order
    ///
    /// Fills of standalone orders update the symbol's position: same-side
    /// fills add and average the entry, opposite-side fills reduce or close.
    ///
    /// # Errors
    ///
    /// Validation, symbol filter and exchange failures.
    pub async fn place_order(&self, request: OrderRequest) -> OmsResult<Order> {
        let guard = self.lock(&request.symbol).await;
        self.place_order_guarded(&guard, request).await
    }

    /// [`Self::place_order`] under a held lock
    ///
    /// # Errors
    ///
    /// Validation, symbol filter and exchange failures.
    pub async fn place_order_guarded(&self, guard: &SymbolGuard, request: OrderRequest) -> OmsResult<Order> {
        Self::check_guard(guard, &request.symbol)?;
        self.prepare(&request).await?;
        if let Some(leverage) = request.leverage {
            self.exchange.set_leverage(&request.symbol, leverage).await?;
        }
        let ack = self.place_with_retry(&request, RetryPolicy { attempts: 1, ..self.config.placement }).await?;
        let order = self.record(&request, &ack, None).await?;

        if order.executed_quantity > 0.0 {
            match order.average_price.or(order.price) {
                Some(price) => self.book_and_publish(&order, order.executed_quantity, price).await?,
                None => warn!("Order {} executed without a price; position not updated", order.id),
            }
        }
        info!("Order {} placed: {} {} {} {}", order.id, order.order_type, order.side, order.quantity, order.symbol);
        Ok(order)
    }

    fn order_snapshot(&self, order_id: &Uuid) -> OmsResult<Order> {
        self.orders
            .read()
            .get(order_id)
            .cloned()
            .ok_or_else(|| OmsError::OrderNotFound {
                order_id: order_id.to_string(),
            })
    }

    fn position_snapshot(&self, position_id: &Uuid) -> OmsResult<Position> {
        self.positions
            .read()
            .get(position_id)
            .cloned()
            .ok_or_else(|| OmsError::PositionNotFound {
                position_id: position_id.to_string(),
            })
    }

    fn require_open(position: &Position, operation: &str) -> OmsResult<()> {
        if !position.is_open() {
            return Err(OmsError::InvalidPositionState {
                position_id: position.id.to_string(),
                operation: operation.to_string(),
                current_state: position.status.to_string(),
            });
        }
        Ok(())
    }

    async fn process_report(&self, order_id: Uuid, report: &ExchangeOrder) -> OmsResult<Order> {
        let (order, outcome): (Order, ReportOutcome) = {
            let mut orders = self.orders.write();
            let order = orders.get_mut(&order_id).ok_or_else(|| OmsError::OrderNotFound {
                order_id: order_id.to_string(),
            })?;
            let outcome = self.lifecycle.apply_report(order, report)?;
            (order.clone(), outcome)
        };

        if outcome.status_changed() {
            match outcome.new_status {
                OrderStatus::Filled => {
                    self.metrics.orders_filled.fetch_add(1, Ordering::Relaxed);
                }
                OrderStatus::Canceled => {
                    self.metrics.orders_cancelled.fetch_add(1, Ordering::Relaxed);
                }
                OrderStatus::Rejected => {
                    self.metrics.orders_rejected.fetch_add(1, Ordering::Relaxed);
                }
                _ => {}
            }
            let _ = self.event_bus.send(OmsEvent::OrderStatusChanged {
                order_id,
                old_status: outcome.old_status,
                new_status: outcome.new_status,
                timestamp: order.updated_at,
            });
            info!("Order {} {} -> {}", order_id, outcome.old_status, outcome.new_status);
        }
        self.persistence.save_order(&order).await?;

        let books_fills = order.position_id.is_none() || order.reduce_only || order.close_position;
        if outcome.filled_quantity > 0.0 && books_fills {
            let price = outcome.fill_price.or(order.average_price).or(order.price).or(order.stop_price);
            match price {
                Some(price) => self.book_and_publish(&order, outcome.filled_quantity, price).await?,
                None => warn!("Fill on {} without a price; position not updated", order_id),
            }
        }
        Ok(order)
    }

    fn book_fill(&self, order: &Order, quantity: f64, price: f64) -> Vec<PositionChange> {
        let mut positions = self.positions.write();
        let mut open = self.open_by_symbol.write();

        let current = open.get(&order.symbol).copied();
        let target = match order.position_id {
            Some(linked) if current != Some(linked) => {
                debug!("Fill on {} for inactive position {}", order.id, linked);
                return Vec::new();
            }
            Some(linked) => Some(linked),
            None => current,
        };
        let reduce_only = order.reduce_only || order.close_position;
        let mut changes = Vec::new();
        let mut flip_quantity = 0.0;

        match target.and_then(|id| positions.get_mut(&id)) {
            None if reduce_only => {
                warn!("Reduce-only fill on {} with no open position", order.symbol);
            }
            None => {
                flip_quantity = quantity;
            }
            Some(position) if order.side == position.side.entry_side() => {
                if reduce_only {
                    warn!("Reduce-only fill on {} in the position's direction ignored", order.symbol);
                } else {
                    position.add(quantity, price);
                    changes.push(PositionChange::Updated(position.clone()));
                }
            }
            Some(position) => {
                let before = position.size;
                let realized = position.reduce(quantity, price);
                self.daily.lock().realized += realized;
                if position.size <= EPSILON {
                    position.settle(PositionStatus::Closed, price);
                    open.remove(&order.symbol);
                    changes.push(PositionChange::Closed(position.clone()));
                    if !reduce_only && quantity - before > EPSILON {
                        flip_quantity = quantity - before;
                    }
                } else {
                    changes.push(PositionChange::Updated(position.clone()));
                }
            }
        }

        if flip_quantity > EPSILON {
            let position = Position::open(
                &self.user_id,
                &order.symbol,
                PositionSide::from_entry_side(order.side),
                price,
                flip_quantity,
                order.leverage.unwrap_or(1),
                MarginType::Crossed,
                self.config.maintenance_margin_rate,
            );
            open.insert(order.symbol.clone(), position.id);
            positions.insert(position.id, position.clone());
            changes.push(PositionChange::Opened(position));
        }
        changes
    }

    async fn book_and_publish(&self, order: &Order, quantity: f64, price: f64) -> OmsResult<()> {
        for change in self.book_fill(order, quantity, price) {
            match change {
                PositionChange::Opened(position) => {
                    self.metrics.positions_opened.fetch_add(1, Ordering::Relaxed);
                    info!("Position {} opened by fill: {} {} {} @ {}", position.id, position.side, position.size, position.symbol, position.entry_price);
                    self.persistence.save_position(&position).await?;
                    let _ = self.event_bus.send(OmsEvent::PositionOpened(position));
                }
                PositionChange::Updated(position) => {
                    self.persistence.save_position(&position).await?;
                    let _ = self.event_bus.send(OmsEvent::PositionUpdated(position));
                }
                PositionChange::Closed(position) => {
                    self.metrics.positions_closed.fetch_add(1, Ordering::Relaxed);
                    info!("Position {} closed by fill, realized {:.4}", position.id, position.realized_pnl);
                    self.persistence.save_position(&position).await?;
                    // Cancelling re-enters report processing
                    Box::pin(self.cancel_linked_orders(position.id)).await;
                    let _ = self.event_bus.send(OmsEvent::PositionClosed(position));
                }
            }
        }
        Ok(())
    }

    /// Fold an exchange order update, e.g. from the user data stream
    ///
    /// # Errors
    ///
    /// Unknown exchange order id or an invalid status transition.
    pub async fn on_order_update(&self, report: ExchangeOrder) -> OmsResult<Order> {
        let order_id = self
            .exchange_ids
            .read()
            .get(&report.order_id)
            .copied()
            .ok_or_else(|| OmsError::OrderNotFound {
                order_id: report.order_id.clone(),
            })?;
        let _guard = self.lock(&report.symbol).await;
        self.process_report(order_id, &report).await
    }

    /// Poll the exchange for an active order's current state
    ///
    /// # Errors
    ///
    /// Unknown order, exchange failure or an invalid status transition.
    pub async fn refresh_order(&self, order_id: Uuid) -> OmsResult<Order> {
        let order = self.order_snapshot(&order_id)?;
        if !order.is_active() {
            return Ok(order);
        }
        let _guard = self.lock(&order.symbol).await;
        let report = self.exchange.get_order(&order.symbol, &order.exchange_order_id).await?;
        self.process_report(order_id, &report).await
    }

    /// Cancel a working order
    ///
    /// # Errors
    ///
    /// Unknown order, order not active, or exchange failure.
    pub async fn cancel_order(&self, order_id: Uuid) -> OmsResult<Order> {
        let symbol = self.order_snapshot(&order_id)?.symbol;
        let guard = self.lock(&symbol).await;
        self.cancel_order_guarded(&guard, order_id).await
    }

    /// [`Self::cancel_order`] under a held lock
    ///
    /// # Errors
    ///
    /// Unknown order, order not active, or exchange failure.
    pub async fn cancel_order_guarded(&self, guard: &SymbolGuard, order_id: Uuid) -> OmsResult<Order> {
        let order = self.order_snapshot(&order_id)?;
        Self::check_guard(guard, &order.symbol)?;
        if !self.lifecycle.can_cancel(&order) {
            return Err(OmsError::InvalidOrderState {
                order_id: order_id.to_string(),
                operation: "cancelled".to_string(),
                current_state: order.status.to_string(),
            });
        }
        let report = self.exchange.cancel_order(&order.symbol, &order.exchange_order_id).await?;
        let order = self.process_report(order_id, &report).await?;
        info!("Order {} cancelled", order_id);
        Ok(order)
    }

    /// Replace a working order: cancel it, then place the amended copy
    ///
    /// # Errors
    ///
    /// Unknown or inactive order, validation or exchange failure. If the
    /// replacement fails the original stays cancelled.
    pub async fn update_order(&self, order_id: Uuid, amendment: OrderAmendment) -> OmsResult<Order> {
        let symbol = self.order_snapshot(&order_id)?.symbol;
        let guard = self.lock(&symbol).await;

        let original = self.order_snapshot(&order_id)?;
        if !self.lifecycle.can_cancel(&original) {
            return Err(OmsError::InvalidOrderState {
                order_id: order_id.to_string(),
                operation: "updated".to_string(),
                current_state: original.status.to_string(),
            });
        }
        let request = original.amended_request(&amendment);
        self.prepare(&request).await?;

        self.cancel_order_guarded(&guard, order_id).await?;
        let ack = self.place_with_retry(&request, self.config.placement).await?;
        let replacement = self.record(&request, &ack, original.position_id).await?;

        if let Some(position_id) = original.position_id {
            let updated = {
                let mut positions = self.positions.write();
                positions.get_mut(&position_id).map(|position| {
                    if position.stop_loss_order_id == Some(order_id) {
                        position.stop_loss_order_id = Some(replacement.id);
                        position.stop_loss = replacement.stop_price;
                    }
                    if position.take_profit_order_id == Some(order_id) {
                        position.take_profit_order_id = Some(replacement.id);
                        position.take_profit = replacement.stop_price;
                    }
                    position.clone()
                })
            };
            if let Some(position) = updated {
                self.persistence.save_position(&position).await?;
            }
        }
        info!("Order {} replaced by {}", order_id, replacement.id);
        Ok(replacement)
    }

    fn validate_protective_levels(
        side: PositionSide,
        reference: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> OmsResult<()> {
        if let Some(sl) = stop_loss {
            let valid = match side {
                PositionSide::Long => sl < reference,
                PositionSide::Short => sl > reference,
            };
            if sl <= 0.0 || !valid {
                return Err(OmsError::validation(format!(
                    "Stop loss {sl} must be {} entry {reference} for {side} positions",
                    if side == PositionSide::Long { "below" } else { "above" }
                )));
            }
        }
        if let Some(tp) = take_profit {
            let valid = match side {
                PositionSide::Long => tp > reference,
                PositionSide::Short => tp < reference,
            };
            if tp <= 0.0 || !valid {
                return Err(OmsError::validation(format!(
                    "Take profit {tp} must be {} entry {reference} for {side} positions",
                    if side == PositionSide::Long { "above" } else { "below" }
                )));
            }
        }
        Ok(())
    }

    /// Open a position after the risk gate approves it
    ///
    /// # Arguments
    ///
    /// * `request` - symbol, direction, size, leverage and optional protective levels
    ///
    /// # Errors
    ///
    /// Validation failures, a [`risk_manager::RiskRejection`], or exchange failures.
    pub async fn open_position(&self, request: OpenPositionRequest) -> OmsResult<Position> {
        let guard = self.lock(&request.symbol).await;
        let reference = match request.entry_price {
            Some(price) => price,
            None => self.exchange.mark_price(&request.symbol).await?,
        };
        let account = self.account_snapshot().await?;
        let risk_request = PositionRequest::new(
            &request.symbol,
            request.side,
            request.quantity,
            reference,
            request.leverage,
        );
        self.gate.validate_new_position(&risk_request, &account).into_result()?;
        self.open_position_guarded(&guard, request, self.config.placement).await
    }

    /// Open a position under a held lock, without consulting the risk gate
    ///
    /// The caller is responsible for the risk decision. Sets leverage and
    /// margin type, places the entry (LIMIT when an entry price is given,
    /// else MARKET) retrying transient failures per `policy`, books the
    /// position at the requested size, then places reduce-only protective
    /// orders.
    ///
    /// # Errors
    ///
    /// Validation failures, [`OmsError::PlacementFailed`] once retries are
    /// exhausted, or exchange failures. A failure placing protective orders
    /// leaves the position open and tracked.
    pub async fn open_position_guarded(
        &self,
        guard: &SymbolGuard,
        request: OpenPositionRequest,
        policy: RetryPolicy,
    ) -> OmsResult<Position> {
        Self::check_guard(guard, &request.symbol)?;
        if !(request.quantity > 0.0) {
            return Err(OmsError::validation("Position size must be positive"));
        }
        if request.leverage == 0 {
            return Err(OmsError::validation("Leverage must be at least 1"));
        }
        if let Some(existing) = self.open_position_for(&request.symbol) {
            return Err(OmsError::InvalidPositionState {
                position_id: existing.id.to_string(),
                operation: "opened again".to_string(),
                current_state: existing.status.to_string(),
            });
        }
        if let Some(entry) = request.entry_price {
            Self::validate_protective_levels(request.side, entry, request.stop_loss, request.take_profit)?;
        }

        let filters = self.require_filters(&request.symbol).await?;
        filters.validate_leverage(request.leverage)?;
        let side = request.side.entry_side();
        let entry_request = match request.entry_price {
            Some(price) => OrderRequest::limit(&request.symbol, side, request.quantity, price),
            None => OrderRequest::market(&request.symbol, side, request.quantity),
        }
        .with_leverage(request.leverage);
        self.lifecycle.validate_request(&entry_request)?;
        filters.validate_order(&entry_request)?;

        self.exchange.set_leverage(&request.symbol, request.leverage).await?;
        self.exchange.set_margin_type(&request.symbol, request.margin_type).await?;

        let ack = self.place_with_retry(&entry_request, policy).await?;
        let entry_order = self.record(&entry_request, &ack, None).await?;
        if matches!(entry_order.status, OrderStatus::Rejected | OrderStatus::Expired) {
            return Err(OmsError::InvalidOrderState {
                order_id: entry_order.id.to_string(),
                operation: "used to open a position".to_string(),
                current_state: entry_order.status.to_string(),
            });
        }

        let entry_price = match entry_order.average_price.or(request.entry_price) {
            Some(price) => price,
            None => self.exchange.mark_price(&request.symbol).await?,
        };
        if request.entry_price.is_none() {
            Self::validate_protective_levels(request.side, entry_price, request.stop_loss, request.take_profit)?;
        }

        let mut position = Position::open(
            &self.user_id,
            &request.symbol,
            request.side,
            entry_price,
            request.quantity,
            request.leverage,
            request.margin_type,
            self.config.maintenance_margin_rate,
        );
        position.entry_order_id = Some(entry_order.id);
        position.trailing_stop = request.trailing_stop;
        let position_id = position.id;
        let linked_entry = {
            let mut orders = self.orders.write();
            let linked = orders.get_mut(&entry_order.id).map(|order| {
                order.position_id = Some(position_id);
                order.clone()
            });
            self.positions.write().insert(position_id, position.clone());
            self.open_by_symbol.write().insert(request.symbol.clone(), position_id);
            linked
        };
        if let Some(order) = linked_entry {
            self.persistence.save_order(&order).await?;
        }
        self.metrics.positions_opened.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("oms_positions_opened_total").increment(1);
        self.persistence.save_position(&position).await?;
        let _ = self.event_bus.send(OmsEvent::PositionOpened(position.clone()));
        info!(
            "Position {} opened: {} {} {} @ {} ({}x {})",
            position_id, request.side, request.quantity, request.symbol, entry_price, request.leverage, request.margin_type
        );

        if request.stop_loss.is_some() || request.take_profit.is_some() {
            return self
                .replace_protective_orders(position_id, request.stop_loss, request.take_profit, policy)
                .await;
        }
        Ok(position)
    }

    async fn cancel_quietly(&self, order_id: Uuid) {
        let Ok(order) = self.order_snapshot(&order_id) else {
            return;
        };
        if !order.is_active() {
            return;
        }
        match self.exchange.cancel_order(&order.symbol, &order.exchange_order_id).await {
            Ok(report) => {
                if let Err(e) = self.process_report(order_id, &report).await {
                    warn!("Cancel report for {} not applied: {}", order_id, e);
                }
            }
            Err(ExchangeError {
                kind: ExchangeErrorKind::OrderNotFound,
                ..
            }) => {
                debug!("Order {} already gone on the exchange", order_id);
            }
            Err(e) => warn!("Failed to cancel order {}: {}", order_id, e),
        }
    }

    async fn cancel_linked_orders(&self, position_id: Uuid) {
        let linked: Vec<Uuid> = self
            .orders
            .read()
            .values()
            .filter(|o| o.position_id == Some(position_id) && o.is_active())
            .map(|o| o.id)
            .collect();
        for order_id in linked {
            self.cancel_quietly(order_id).await;
        }
    }

    async fn replace_protective_orders(
        &self,
        position_id: Uuid,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        policy: RetryPolicy,
    ) -> OmsResult<Position> {
        let position = self.position_snapshot(&position_id)?;
        let exit_side = position.side.exit_side();

        if let Some(price) = stop_loss {
            if let Some(old) = position.stop_loss_order_id {
                self.cancel_quietly(old).await;
            }
            let request = OrderRequest::stop_market(&position.symbol, exit_side, position.size, price);
            self.prepare(&request).await?;
            let ack = self.place_with_retry(&request, policy).await?;
            let order = self.record(&request, &ack, Some(position_id)).await?;
            if let Some(p) = self.positions.write().get_mut(&position_id) {
                p.stop_loss = Some(price);
                p.stop_loss_order_id = Some(order.id);
                p.updated_at = Utc::now();
            }
            debug!("Stop loss for {} set at {}", position_id, price);
        }

        if let Some(price) = take_profit {
            if let Some(old) = position.take_profit_order_id {
                self.cancel_quietly(old).await;
            }
            let request = OrderRequest::take_profit_market(&position.symbol, exit_side, position.size, price);
            self.prepare(&request).await?;
            let ack = self.place_with_retry(&request, policy).await?;
            let order = self.record(&request, &ack, Some(position_id)).await?;
            if let Some(p) = self.positions.write().get_mut(&position_id) {
                p.take_profit = Some(price);
                p.take_profit_order_id = Some(order.id);
                p.updated_at = Utc::now();
            }
            debug!("Take profit for {} set at {}", position_id, price);
        }

        let position = self.position_snapshot(&position_id)?;
        self.persistence.save_position(&position).await?;
        let _ = self.event_bus.send(OmsEvent::PositionUpdated(position.clone()));
        Ok(position)
    }

    /// Move a position's stop loss and/or take profit
    ///
    /// Each changed level replaces its reduce-only protective order.
    ///
    /// # Errors
    ///
    /// Unknown or closed position, levels on the wrong side of entry, or
    /// exchange failures.
    pub async fn update_stop_loss_take_profit(
        &self,
        position_id: Uuid,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> OmsResult<Position> {
        let symbol = self.position_snapshot(&position_id)?.symbol;
        let guard = self.lock(&symbol).await;
        self.update_stop_loss_take_profit_guarded(&guard, position_id, stop_loss, take_profit, self.config.placement)
            .await
    }

    /// [`Self::update_stop_loss_take_profit`] under a held lock
    ///
    /// # Errors
    ///
    /// Unknown or closed position, levels on the wrong side of entry, or
    /// exchange failures.
    pub async fn update_stop_loss_take_profit_guarded(
        &self,
        guard: &SymbolGuard,
        position_id: Uuid,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        policy: RetryPolicy,
    ) -> OmsResult<Position> {
        let position = self.position_snapshot(&position_id)?;
        Self::check_guard(guard, &position.symbol)?;
        Self::require_open(&position, "given new protective levels")?;
        Self::validate_protective_levels(position.side, position.entry_price, stop_loss, take_profit)?;

        let stop_loss = stop_loss.filter(|sl| position.stop_loss != Some(*sl));
        let take_profit = take_profit.filter(|tp| position.take_profit != Some(*tp));
        if stop_loss.is_none() && take_profit.is_none() {
            return Ok(position);
        }
        self.replace_protective_orders(position_id, stop_loss, take_profit, policy).await
    }

    /// Close a position with a reduce-only order
    ///
    /// Working orders linked to the position are cancelled first. A
    /// `limit_price` closes with a LIMIT order, otherwise MARKET.
    ///
    /// # Errors
    ///
    /// Unknown or already closed position, or exchange failures.
    pub async fn close_position(&self, position_id: Uuid, limit_price: Option<f64>) -> OmsResult<Position> {
        let symbol = self.position_snapshot(&position_id)?.symbol;
        let guard = self.lock(&symbol).await;
        self.close_position_guarded(&guard, position_id, limit_price, self.config.placement)
            .await
    }

    /// [`Self::close_position`] under a held lock
    ///
    /// # Errors
    ///
    /// Unknown or already closed position, or exchange failures.
    pub async fn close_position_guarded(
        &self,
        guard: &SymbolGuard,
        position_id: Uuid,
        limit_price: Option<f64>,
        policy: RetryPolicy,
    ) -> OmsResult<Position> {
        let position = self.position_snapshot(&position_id)?;
        Self::check_guard(guard, &position.symbol)?;
        Self::require_open(&position, "closed")?;
        self.lifecycle.validate_position_transition(&position, PositionStatus::Closed)?;

        self.cancel_linked_orders(position_id).await;

        let exit_side = position.side.exit_side();
        let request = match limit_price {
            Some(price) => OrderRequest::limit(&position.symbol, exit_side, position.size, price),
            None => OrderRequest::market(&position.symbol, exit_side, position.size),
        }
        .reduce_only();
        self.prepare(&request).await?;
        let ack = self.place_with_retry(&request, policy).await?;
        let close_order = self.record(&request, &ack, Some(position_id)).await?;

        let close_price = match close_order.average_price.or(limit_price) {
            Some(price) => price,
            None => self.exchange.mark_price(&position.symbol).await?,
        };

        let closed = {
            let mut positions = self.positions.write();
            let position = positions.get_mut(&position_id).ok_or_else(|| OmsError::PositionNotFound {
                position_id: position_id.to_string(),
            })?;
            let realized_before = position.realized_pnl;
            position.settle(PositionStatus::Closed, close_price);
            self.daily.lock().realized += position.realized_pnl - realized_before;
            self.open_by_symbol.write().remove(&position.symbol);
            position.clone()
        };

        self.metrics.positions_closed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("oms_positions_closed_total").increment(1);
        self.persistence.save_position(&closed).await?;
        let _ = self.event_bus.send(OmsEvent::PositionClosed(closed.clone()));
        info!(
            "Position {} closed at {} with realized PnL {:.4}",
            position_id, close_price, closed.realized_pnl
        );
        Ok(closed)
    }

    async fn transfer_margin(&self, position_id: Uuid, amount: f64, direction: MarginTransfer) -> OmsResult<Position> {
        let symbol = self.position_snapshot(&position_id)?.symbol;
        let _guard = self.lock(&symbol).await;

        let mut updated = self.position_snapshot(&position_id)?;
        Self::require_open(&updated, "given margin")?;
        match direction {
            MarginTransfer::Add => updated.add_margin(amount)?,
            MarginTransfer::Reduce => updated.reduce_margin(amount)?,
        }
        self.exchange.transfer_margin(&symbol, amount, direction).await?;

        self.positions.write().insert(position_id, updated.clone());
        self.persistence.save_position(&updated).await?;
        let _ = self.event_bus.send(OmsEvent::PositionUpdated(updated.clone()));
        info!(
            "Isolated margin on {} now {:.4}, liquidation at {:?}",
            position_id, updated.isolated_margin, updated.liquidation_price
        );
        Ok(updated)
    }

    /// Post additional margin to an isolated position
    ///
    /// # Errors
    ///
    /// Position not open or not isolated, non-positive amount, or exchange failure.
    pub async fn add_margin(&self, position_id: Uuid, amount: f64) -> OmsResult<Position> {
        self.transfer_margin(position_id, amount, MarginTransfer::Add).await
    }

    /// Withdraw margin from an isolated position
    ///
    /// # Errors
    ///
    /// Position not open or not isolated, more than posted, or exchange failure.
    pub async fn reduce_margin(&self, position_id: Uuid, amount: f64) -> OmsResult<Position> {
        self.transfer_margin(position_id, amount, MarginTransfer::Reduce).await
    }

    /// Revalue the open position on `symbol` at `mark_price`
    ///
    /// A mark at or through the liquidation price moves the position to
    /// LIQUIDATED.
    ///
    /// # Errors
    ///
    /// Persistence failures.
    pub async fn update_mark_price(&self, symbol: &str, mark_price: f64) -> OmsResult<Option<Position>> {
        let symbol = normalize_symbol(symbol);
        let _guard = self.lock(&symbol).await;
        let Some(position_id) = self.open_by_symbol.read().get(&symbol).copied() else {
            return Ok(None);
        };

        let (position, liquidated) = {
            let mut positions = self.positions.write();
            let Some(position) = positions.get_mut(&position_id) else {
                return Ok(None);
            };
            if position.is_liquidatable(mark_price) {
                let price = position.liquidation_price.unwrap_or(mark_price);
                let realized_before = position.realized_pnl;
                position.settle(PositionStatus::Liquidated, price);
                self.daily.lock().realized += position.realized_pnl - realized_before;
                self.open_by_symbol.write().remove(&symbol);
                (position.clone(), true)
            } else {
                position.update_mark(mark_price);
                (position.clone(), false)
            }
        };

        if liquidated {
            error!("Position {} on {} liquidated at mark {}", position.id, symbol, mark_price);
            self.metrics.positions_liquidated.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("oms_positions_liquidated_total").increment(1);
            self.persistence.save_position(&position).await?;
            self.cancel_linked_orders(position.id).await;
            let _ = self.event_bus.send(OmsEvent::PositionLiquidated(position.clone()));
        }
        Ok(Some(position))
    }

    /// Balance, daily PnL and open exposure for the risk gate
    ///
    /// # Errors
    ///
    /// Exchange failure fetching balances.
    pub async fn account_snapshot(&self) -> OmsResult<AccountSnapshot> {
        let account = self.exchange.account().await?;
        let positions: Vec<_> = self
            .positions
            .read()
            .values()
            .filter(|p| p.is_open())
            .map(Position::exposure)
            .collect();
        let unrealized: f64 = positions.iter().map(|p| p.unrealized_pnl).sum();

        let mut daily = self.daily.lock();
        daily.roll();
        let start_equity = *daily
            .start_equity
            .get_or_insert(account.total_wallet_balance + unrealized);
        Ok(AccountSnapshot {
            balance: account.total_wallet_balance,
            daily_realized_pnl: daily.realized,
            day_start_equity: Some(start_equity),
            positions,
        })
    }

    /// Order by id
    #[must_use]
    pub fn get_order(&self, order_id: &Uuid) -> Option<Order> {
        self.orders.read().get(order_id).cloned()
    }

    /// Orders, newest first, optionally filtered by symbol and status
    #[must_use]
    pub fn get_orders(&self, symbol: Option<&str>, status: Option<OrderStatus>) -> Vec<Order> {
        let symbol = symbol.map(normalize_symbol);
        let mut orders: Vec<Order> = self
            .orders
            .read()
            .values()
            .filter(|o| symbol.as_ref().is_none_or(|s| &o.symbol == s))
            .filter(|o| status.is_none_or(|s| o.status == s))
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        orders
    }

    /// Working orders
    #[must_use]
    pub fn active_orders(&self) -> Vec<Order> {
        self.orders
            .read()
            .values()
            .filter(|o| o.is_active())
            .cloned()
            .collect()
    }

    /// Position by id
    #[must_use]
    pub fn get_position(&self, position_id: &Uuid) -> Option<Position> {
        self.positions.read().get(position_id).cloned()
    }

    /// The open position on `symbol`, if any
    #[must_use]
    pub fn open_position_for(&self, symbol: &str) -> Option<Position> {
        let symbol = normalize_symbol(symbol);
        let id = self.open_by_symbol.read().get(&symbol).copied()?;
        self.positions.read().get(&id).cloned()
    }

    /// Positions, newest first, optionally filtered by status
    #[must_use]
    pub fn positions(&self, status: Option<PositionStatus>) -> Vec<Position> {
        let mut positions: Vec<Position> = self
            .positions
            .read()
            .values()
            .filter(|p| status.is_none_or(|s| p.status == s))
            .cloned()
            .collect();
        positions.sort_by(|a, b| b.opened_at.cmp(&a.opened_at));
        positions
    }

    /// Get metrics
    #[must_use]
    pub fn get_metrics(&self) -> OmsMetricsSnapshot {
        OmsMetricsSnapshot {
            orders_created: self.metrics.orders_created.load(Ordering::Relaxed),
            orders_filled: self.metrics.orders_filled.load(Ordering::Relaxed),
            orders_cancelled: self.metrics.orders_cancelled.load(Ordering::Relaxed),
            orders_rejected: self.metrics.orders_rejected.load(Ordering::Relaxed),
            placement_retries: self.metrics.placement_retries.load(Ordering::Relaxed),
            positions_opened: self.metrics.positions_opened.load(Ordering::Relaxed),
            positions_closed: self.metrics.positions_closed.load(Ordering::Relaxed),
            positions_liquidated: self.metrics.positions_liquidated.load(Ordering::Relaxed),
            active_orders: self.orders.read().values().filter(|o| o.is_active()).count(),
            open_positions: self.open_by_symbol.read().len(),
        }
    }
}
