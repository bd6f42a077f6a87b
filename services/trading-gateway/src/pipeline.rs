//! Signal execution pipeline
//!
//! Signals move `PENDING -> EXECUTED | FAILED | EXPIRED | CANCELLED`:
//!
//! - structurally invalid requests are rejected at submission and never stored
//! - a signal past its validity window expires on its next evaluation
//! - market condition or risk failures cancel the signal
//! - placement errors that survive the retry policy fail it
//!
//! Execution holds the order manager's lock for the signal's symbol from the
//! risk check through placement, so two signals for the same symbol can never
//! both pass the gate against the same account state.

use crate::conditions::{MarketConditionLimits, MarketView, check_market_conditions};
use crate::error::{PipelineError, PipelineResult, ValidationError};
use crate::scoring::confidence_score;
use crate::signal::{Signal, SignalRequest, SignalStatus, SignalType};
use crate::store::SignalStore;
use crate::telemetry::{TelemetryCollector, TelemetryStats};
use crate::validation::validate_signal;
use chrono::{DateTime, Utc};
use market_connector::MarketDataProvider;
use oms::{OpenPositionRequest, OrderManager, OrderType, RetryPolicy, SymbolGuard};
use parking_lot::RwLock;
use risk_manager::{PositionRequest, PositionSizer};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use services_common::{EPSILON, MarginType, PERCENT, normalize_symbol};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Market condition ceilings and floors
    pub conditions: MarketConditionLimits,
    /// Retry policy for entry, exit and protective placements
    pub placement: RetryPolicy,
    /// Margin mode for positions opened by signals
    pub margin_type: MarginType,
    /// Interval of the pending-signal sweep, in milliseconds
    pub evaluation_interval_ms: u64,
    /// Execute active pending signals during the sweep
    pub auto_execute: bool,
    /// Capacity of the signal event broadcast
    pub event_buffer: usize,
    /// Finished signals kept in memory for lookups; older ones live only in the store
    pub history_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            conditions: MarketConditionLimits::default(),
            placement: RetryPolicy::default(),
            margin_type: MarginType::Crossed,
            evaluation_interval_ms: 1_000,
            auto_execute: true,
            event_buffer: 1_000,
            history_capacity: 1_000,
        }
    }
}

/// Signal events for broadcasting
#[derive(Debug, Clone)]
pub enum SignalEvent {
    /// Signal accepted and stored as PENDING
    Created(Signal),
    /// Signal reached a terminal status
    Finished(Signal),
}

/// Pending signals by id plus a bounded tail of finished ones
#[derive(Debug, Default)]
struct SignalBook {
    pending: FxHashMap<Uuid, Signal>,
    finished: VecDeque<Signal>,
}

impl SignalBook {
    fn get(&self, signal_id: &Uuid) -> Option<&Signal> {
        self.pending
            .get(signal_id)
            .or_else(|| self.finished.iter().rev().find(|s| s.id == *signal_id))
    }

    fn record(&mut self, signal: Signal, capacity: usize) {
        if !signal.status.is_terminal() {
            self.pending.insert(signal.id, signal);
            return;
        }
        self.pending.remove(&signal.id);
        self.finished.retain(|s| s.id != signal.id);
        self.finished.push_back(signal);
        while self.finished.len() > capacity {
            self.finished.pop_front();
        }
    }

    fn len(&self) -> usize {
        self.pending.len() + self.finished.len()
    }
}

#[derive(Debug, Default)]
struct Execution {
    executed_price: f64,
    order_id: Option<Uuid>,
    position_id: Option<Uuid>,
    quantity: Option<f64>,
    pnl: Option<f64>,
    pnl_percentage: Option<f64>,
}

#[derive(Debug)]
enum Disposition {
    Executed(Execution),
    Cancelled { rule: &'static str, reason: String },
}

impl Disposition {
    fn cancelled(rule: &'static str, reason: impl Into<String>) -> Self {
        Self::Cancelled {
            rule,
            reason: reason.into(),
        }
    }
}

/// Turns signals into orders and positions under risk control
pub struct SignalExecutionPipeline {
    config: PipelineConfig,
    orders: Arc<OrderManager>,
    market: Arc<dyn MarketDataProvider>,
    sizer: PositionSizer,
    store: Arc<dyn SignalStore>,
    signals: RwLock<SignalBook>,
    event_bus: broadcast::Sender<SignalEvent>,
    telemetry: TelemetryCollector,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for SignalExecutionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalExecutionPipeline")
            .field("config", &self.config)
            .field("signals", &self.signals.read().len())
            .field("telemetry", &self.telemetry)
            .finish_non_exhaustive()
    }
}

impl SignalExecutionPipeline {
    /// Pipeline trading through `orders` with market state from `market`
    pub fn new(
        config: PipelineConfig,
        orders: Arc<OrderManager>,
        market: Arc<dyn MarketDataProvider>,
        sizer: PositionSizer,
        store: Arc<dyn SignalStore>,
    ) -> Self {
        let (event_bus, _) = broadcast::channel(config.event_buffer.max(1));
        info!("Initializing signal pipeline for {}", orders.user_id());
        Self {
            config,
            orders,
            market,
            sizer,
            store,
            signals: RwLock::new(SignalBook::default()),
            event_bus,
            telemetry: TelemetryCollector::new(),
            shutdown_tx: watch::Sender::new(false),
        }
    }

    /// Configuration
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Subscribe to signal events
    pub fn subscribe(&self) -> broadcast::Receiver<SignalEvent> {
        self.event_bus.subscribe()
    }

    /// Validate, score and store a new signal
    ///
    /// # Errors
    ///
    /// [`PipelineError::Validation`] naming the broken rule, or an exchange
    /// failure while loading the symbol's filters.
    pub async fn submit_signal(&self, mut request: SignalRequest) -> PipelineResult<Uuid> {
        request.symbol = normalize_symbol(&request.symbol);
        let filters = self.orders.symbol_filters(&request.symbol).await?;
        if let Err(e) = validate_signal(&request, filters.as_ref()) {
            self.telemetry.record_rejected();
            warn!("Signal for {} rejected: {}", request.symbol, e);
            return Err(e.into());
        }

        let mut signal = Signal::from_request(self.orders.user_id(), request, Utc::now());
        signal.confidence_score = confidence_score(
            signal.action,
            self.market.market_snapshot(&signal.symbol).as_deref(),
            self.market.book_snapshot(&signal.symbol).as_deref(),
        );
        self.store.save_signal(&signal).await?;
        self.signals.write().record(signal.clone(), self.config.history_capacity);
        self.telemetry.record_received();
        let _ = self.event_bus.send(SignalEvent::Created(signal.clone()));
        info!(
            "Signal {} accepted: {} {} {} (confidence {:.1}, valid {} min)",
            signal.id, signal.signal_type, signal.action, signal.symbol, signal.confidence_score, signal.time_validity
        );
        Ok(signal.id)
    }

    /// Evaluate and, when everything passes, execute a pending signal
    ///
    /// Returns the signal in its terminal status when it executed, expired or
    /// was cancelled. A failed execution marks the signal FAILED and returns
    /// the error.
    ///
    /// # Errors
    ///
    /// Unknown or non-pending signal, [`PipelineError::ExecutionFailure`]
    /// once placement retries are exhausted, or any other execution error.
    pub async fn execute_signal(&self, signal_id: Uuid) -> PipelineResult<Signal> {
        let symbol = self.signal_snapshot(&signal_id)?.symbol;
        let guard = self.orders.lock(&symbol).await;
        let signal = self.pending_snapshot(&signal_id, "executed")?;

        let now = Utc::now();
        if !signal.is_active(now) {
            return self.finish_expired(signal, now).await;
        }

        let view = match check_market_conditions(&signal, &self.config.conditions, self.market.as_ref()) {
            Ok(view) => view,
            Err(failure) => {
                return self
                    .finish_cancelled(signal, "market_conditions", failure.to_string())
                    .await;
            }
        };
        debug!(
            "Market checks passed for {}: price {} ratio {:.3} spread {:.4}%",
            signal.id, view.price, view.buy_sell_ratio, view.spread_percent
        );

        let result = match signal.signal_type {
            SignalType::Entry => self.execute_entry(&guard, &signal, &view).await,
            SignalType::Exit => self.execute_exit(&guard, &signal).await,
            SignalType::StopLoss | SignalType::TakeProfit => self.execute_protective(&guard, &signal).await,
        };

        match result {
            Ok(Disposition::Executed(execution)) => self.finish_executed(signal, execution).await,
            Ok(Disposition::Cancelled { rule, reason }) => self.finish_cancelled(signal, rule, reason).await,
            Err(e) => {
                self.finish_failed(signal, &e).await;
                Err(e)
            }
        }
    }

    /// Cancel a pending signal on request
    ///
    /// # Errors
    ///
    /// Unknown or non-pending signal.
    pub async fn cancel_signal(&self, signal_id: Uuid) -> PipelineResult<Signal> {
        let symbol = self.signal_snapshot(&signal_id)?.symbol;
        let _guard = self.orders.lock(&symbol).await;
        let signal = self.pending_snapshot(&signal_id, "cancelled")?;
        self.finish_cancelled(signal, "request", "Cancelled on request".to_string())
            .await
    }

    /// Expire every pending signal past its window at `now`
    ///
    /// Returns the ids that expired.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let stale: Vec<(Uuid, String)> = self
            .signals
            .read()
            .pending
            .values()
            .filter(|s| s.is_stale(now))
            .map(|s| (s.id, s.symbol.clone()))
            .collect();

        let mut expired = Vec::with_capacity(stale.len());
        for (signal_id, symbol) in stale {
            let _guard = self.orders.lock(&symbol).await;
            let Ok(signal) = self.pending_snapshot(&signal_id, "expired") else {
                continue;
            };
            if !signal.is_stale(now) {
                continue;
            }
            match self.finish_expired(signal, now).await {
                Ok(_) => expired.push(signal_id),
                Err(e) => error!("Failed to persist expiry of {}: {}", signal_id, e),
            }
        }
        expired
    }

    /// One sweep: expire stale signals, then execute active ones when enabled
    pub async fn evaluate_pending(&self) {
        let expired = self.expire_stale(Utc::now()).await;
        if !expired.is_empty() {
            info!("Expired {} stale signals", expired.len());
        }
        if !self.config.auto_execute {
            return;
        }

        let mut pending: Vec<(DateTime<Utc>, Uuid)> = self
            .signals
            .read()
            .pending
            .values()
            .map(|s| (s.created_at, s.id))
            .collect();
        pending.sort_unstable();
        for (_, signal_id) in pending {
            match self.execute_signal(signal_id).await {
                Ok(signal) => debug!("Signal {} finished as {}", signal_id, signal.status),
                Err(PipelineError::InvalidSignalState { .. }) => {
                    debug!("Signal {} already handled elsewhere", signal_id);
                }
                Err(e) => warn!("Signal {} failed: {}", signal_id, e),
            }
        }
    }

    /// Run the periodic sweep until [`Self::shutdown`]
    pub async fn run(&self) {
        self.shutdown_tx.send_replace(false);
        let mut shutdown = self.shutdown_tx.subscribe();
        let period = Duration::from_millis(self.config.evaluation_interval_ms.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Signal pipeline evaluating every {:?}", period);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.evaluate_pending().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Signal pipeline stopped");
    }

    /// Stop [`Self::run`]
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Signal by id
    #[must_use]
    pub fn get_signal(&self, signal_id: &Uuid) -> Option<Signal> {
        self.signals.read().get(signal_id).cloned()
    }

    /// Pending and recently finished signals, newest first, optionally filtered by status
    #[must_use]
    pub fn signals(&self, status: Option<SignalStatus>) -> Vec<Signal> {
        let book = self.signals.read();
        let mut signals: Vec<Signal> = book
            .pending
            .values()
            .chain(book.finished.iter())
            .filter(|s| status.is_none_or(|st| s.status == st))
            .cloned()
            .collect();
        signals.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        signals
    }

    /// Signal counters
    #[must_use]
    pub fn get_metrics(&self) -> TelemetryStats {
        self.telemetry.get_stats()
    }

    fn signal_snapshot(&self, signal_id: &Uuid) -> PipelineResult<Signal> {
        self.get_signal(signal_id)
            .ok_or(PipelineError::SignalNotFound { signal_id: *signal_id })
    }

    fn pending_snapshot(&self, signal_id: &Uuid, operation: &'static str) -> PipelineResult<Signal> {
        let signal = self.signal_snapshot(signal_id)?;
        if signal.status != SignalStatus::Pending {
            return Err(PipelineError::InvalidSignalState {
                signal_id: *signal_id,
                operation,
                status: signal.status,
            });
        }
        Ok(signal)
    }

    async fn execute_entry(&self, guard: &SymbolGuard, signal: &Signal, view: &MarketView) -> PipelineResult<Disposition> {
        if let Some(open) = self.orders.open_position_for(&signal.symbol) {
            return Ok(Disposition::cancelled(
                "position_open",
                format!("Position {} already open on {}", open.id, signal.symbol),
            ));
        }
        let filters = self
            .orders
            .symbol_filters(&signal.symbol)
            .await?
            .ok_or_else(|| ValidationError::UnknownSymbol {
                symbol: signal.symbol.clone(),
            })?;
        let entry = filters.round_price(signal.entry_price.unwrap_or(view.price));
        let account = self.orders.account_snapshot().await?;

        let raw_quantity = match (signal.risk_percentage, signal.stop_loss) {
            (Some(risk), Some(stop)) => {
                self.sizer
                    .risk_based_quantity(account.balance, risk, entry, stop, signal.leverage)?
            }
            _ => signal.quantity.unwrap_or_default(),
        };
        let quantity = filters.round_quantity(raw_quantity);
        if quantity <= 0.0 || quantity < filters.min_qty {
            return Ok(Disposition::cancelled(
                "size",
                format!("Sized quantity {raw_quantity} below minimum {}", filters.min_qty),
            ));
        }

        let side = signal.action.position_side();
        let risk_request = PositionRequest::new(&signal.symbol, side, quantity, entry, signal.leverage);
        if let Err(rejection) = self
            .orders
            .gate()
            .validate_execution(&risk_request, &account)
            .into_result()
        {
            return Ok(Disposition::cancelled(rejection.rule(), rejection.to_string()));
        }

        let request = OpenPositionRequest::new(&signal.symbol, side, quantity, signal.leverage)
            .with_entry_price(entry)
            .with_stops(
                signal.stop_loss.map(|p| filters.round_price(p)),
                signal.take_profit.map(|p| filters.round_price(p)),
            )
            .with_margin_type(self.config.margin_type);
        let position = self
            .orders
            .open_position_guarded(guard, request, self.config.placement)
            .await?;

        let executed_price = position
            .entry_order_id
            .and_then(|id| self.orders.get_order(&id))
            .and_then(|order| order.average_price)
            .unwrap_or(entry);
        Ok(Disposition::Executed(Execution {
            executed_price,
            order_id: position.entry_order_id,
            position_id: Some(position.id),
            quantity: Some(quantity),
            ..Execution::default()
        }))
    }

    async fn execute_exit(&self, guard: &SymbolGuard, signal: &Signal) -> PipelineResult<Disposition> {
        let position = self
            .orders
            .open_position_for(&signal.symbol)
            .ok_or_else(|| PipelineError::NoOpenPosition {
                symbol: signal.symbol.clone(),
            })?;
        if position.side != signal.action.position_side() {
            return Err(PipelineError::ExitDirectionMismatch {
                symbol: signal.symbol.clone(),
                action: signal.action,
                side: position.side,
            });
        }

        let entry_value = position.entry_value();
        let realized_before = position.realized_pnl;
        let closed = self
            .orders
            .close_position_guarded(guard, position.id, None, self.config.placement)
            .await?;

        let pnl = closed.realized_pnl - realized_before;
        let close_order = self
            .orders
            .get_orders(Some(&closed.symbol), None)
            .into_iter()
            .find(|o| o.position_id == Some(closed.id) && o.reduce_only && o.order_type == OrderType::Market);
        Ok(Disposition::Executed(Execution {
            executed_price: closed.mark_price.unwrap_or(closed.entry_price),
            order_id: close_order.map(|o| o.id),
            position_id: Some(closed.id),
            quantity: Some(position.size),
            pnl: Some(pnl),
            pnl_percentage: (entry_value > EPSILON).then(|| pnl / entry_value * PERCENT),
        }))
    }

    async fn execute_protective(&self, guard: &SymbolGuard, signal: &Signal) -> PipelineResult<Disposition> {
        let position = self
            .orders
            .open_position_for(&signal.symbol)
            .ok_or_else(|| PipelineError::NoOpenPosition {
                symbol: signal.symbol.clone(),
            })?;
        let price = signal.price.ok_or(ValidationError::MissingPrice {
            signal_type: signal.signal_type,
            field: "price",
        })?;

        let (stop_loss, take_profit) = match signal.signal_type {
            SignalType::StopLoss => (Some(price), None),
            _ => (None, Some(price)),
        };
        let updated = self
            .orders
            .update_stop_loss_take_profit_guarded(guard, position.id, stop_loss, take_profit, self.config.placement)
            .await?;

        let order_id = match signal.signal_type {
            SignalType::StopLoss => updated.stop_loss_order_id,
            _ => updated.take_profit_order_id,
        };
        Ok(Disposition::Executed(Execution {
            executed_price: price,
            order_id,
            position_id: Some(updated.id),
            ..Execution::default()
        }))
    }

    async fn commit(&self, signal: Signal) -> PipelineResult<Signal> {
        self.signals.write().record(signal.clone(), self.config.history_capacity);
        self.store.save_signal(&signal).await?;
        if signal.status.is_terminal() {
            let _ = self.event_bus.send(SignalEvent::Finished(signal.clone()));
        }
        Ok(signal)
    }

    async fn finish_executed(&self, mut signal: Signal, execution: Execution) -> PipelineResult<Signal> {
        signal.order_id = execution.order_id;
        signal.position_id = execution.position_id;
        if execution.quantity.is_some() {
            signal.quantity = execution.quantity;
        }
        signal.pnl = execution.pnl;
        signal.pnl_percentage = execution.pnl_percentage;
        signal.success = execution.pnl.map(|pnl| pnl > 0.0);
        signal.mark_executed(execution.executed_price, Utc::now());

        self.telemetry
            .record_executed(signal.execution_delay.unwrap_or_default());
        info!(
            "Signal {} executed at {} after {:.3}s",
            signal.id,
            execution.executed_price,
            signal.execution_delay.unwrap_or_default()
        );
        self.commit(signal).await
    }

    async fn finish_cancelled(&self, mut signal: Signal, rule: &'static str, reason: String) -> PipelineResult<Signal> {
        warn!("Signal {} cancelled ({}): {}", signal.id, rule, reason);
        signal.cancel(reason, Utc::now());
        self.telemetry.record_cancelled(rule);
        self.commit(signal).await
    }

    async fn finish_expired(&self, mut signal: Signal, now: DateTime<Utc>) -> PipelineResult<Signal> {
        info!(
            "Signal {} expired, validity of {} min ended at {}",
            signal.id,
            signal.time_validity,
            signal.valid_until()
        );
        signal.expire(now);
        self.telemetry.record_expired();
        self.commit(signal).await
    }

    async fn finish_failed(&self, mut signal: Signal, cause: &PipelineError) {
        error!("Signal {} failed: {}", signal.id, cause);
        let signal_id = signal.id;
        signal.fail(cause.to_string(), Utc::now());
        self.telemetry.record_failed();
        if let Err(e) = self.commit(signal).await {
            error!("Failed to persist failure of {}: {}", signal_id, e);
        }
    }
}
