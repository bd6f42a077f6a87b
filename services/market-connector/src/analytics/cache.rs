//! Rolling per-symbol market analytics
//!
//! Stream handlers append ticks to bounded histories. A periodic job
//! recomputes the derived figures at a fixed cadence and republishes an
//! immutable [`MarketSnapshot`] per symbol; readers never see a half-updated
//! snapshot. A second job evicts ticks older than the retention horizon.

use crate::analytics::indicators::{self, StrengthInputs, Trend};
use crate::connection::shutdown_requested;
use crate::messages::{BookTicker, MarkPrice, Ticker24h, Trade};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use services_common::math::mean;
use services_common::{PERCENT, normalize_symbol};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Analytics cadence, windows and alert thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// Ticks kept per symbol
    pub capacity: usize,
    /// Recompute interval
    pub update_interval_ms: u64,
    /// Returns used for volatility
    pub volatility_window: usize,
    /// Samples used for momentum
    pub momentum_window: usize,
    /// Short moving average length
    pub short_ma: usize,
    /// Long moving average length, also the trend window
    pub long_ma: usize,
    /// Minimum move over the trend window, as a fraction
    pub trend_threshold: f64,
    /// Ticks older than this are evicted
    pub retention_secs: u64,
    /// Eviction interval
    pub cleanup_interval_secs: u64,
    /// A symbol without ticks for this long is reported stale
    pub stale_after_secs: u64,
    /// Volatility above this raises an alert
    pub high_volatility: f64,
    /// Volatility below this raises an alert
    pub low_volatility: f64,
    /// Volume ratio above this is a surge
    pub volume_surge: f64,
    /// Volume ratio below this is a dry market
    pub volume_dry: f64,
    /// Price move between recomputes worth an alert, as a fraction
    pub significant_move: f64,
    /// Price move between recomputes flagged as extreme, as a fraction
    pub extreme_move: f64,
    /// Momentum (percent) counted as strong
    pub momentum_threshold: f64,
    /// Alert channel capacity
    pub alert_capacity: usize,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            update_interval_ms: 1000,
            volatility_window: 20,
            momentum_window: 14,
            short_ma: 20,
            long_ma: 50,
            trend_threshold: 0.01,
            retention_secs: 24 * 3600,
            cleanup_interval_secs: 3600,
            stale_after_secs: 60,
            high_volatility: 0.02,
            low_volatility: 0.005,
            volume_surge: 2.0,
            volume_dry: 0.5,
            significant_move: 0.01,
            extreme_move: 0.05,
            momentum_threshold: 5.0,
            alert_capacity: 1000,
        }
    }
}

/// One trade sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Tick {
    /// Exchange time of the trade
    pub timestamp: DateTime<Utc>,
    /// Trade price
    pub price: f64,
    /// Trade quantity
    pub volume: f64,
    /// True when the taker bought
    pub taker_buy: bool,
}

/// Advisory market events; never errors
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MarketAlert {
    /// Volatility above the high threshold
    HighVolatility {
        /// Symbol
        symbol: String,
        /// Current volatility
        volatility: f64,
    },
    /// Volatility below the low threshold
    LowVolatility {
        /// Symbol
        symbol: String,
        /// Current volatility
        volatility: f64,
    },
    /// Recent volume well above average
    VolumeSurge {
        /// Symbol
        symbol: String,
        /// Recent over average volume
        ratio: f64,
    },
    /// Recent volume well below average
    VolumeDry {
        /// Symbol
        symbol: String,
        /// Recent over average volume
        ratio: f64,
    },
    /// Momentum beyond the threshold
    StrongMomentum {
        /// Symbol
        symbol: String,
        /// Momentum in percent
        momentum: f64,
    },
    /// Price moved sharply since the previous recompute
    PriceMove {
        /// Symbol
        symbol: String,
        /// Move in percent
        change_percent: f64,
        /// Move exceeded the extreme threshold
        extreme: bool,
    },
    /// Trend classification changed
    TrendChange {
        /// Symbol
        symbol: String,
        /// Previous trend
        from: Trend,
        /// New trend
        to: Trend,
    },
    /// No ticks within the stale age
    StaleFeed {
        /// Symbol
        symbol: String,
        /// Seconds since the last tick
        seconds_since_update: i64,
    },
}

/// Derived market state for one symbol
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketSnapshot {
    /// Upper-case symbol
    pub symbol: String,
    /// Last traded price
    pub last_price: Option<f64>,
    /// Best bid from the book ticker
    pub best_bid: Option<f64>,
    /// Best ask from the book ticker
    pub best_ask: Option<f64>,
    /// Mark price
    pub mark_price: Option<f64>,
    /// Funding rate as a fraction
    pub funding_rate: Option<f64>,
    /// 24h change in percent
    pub price_change_24h_percent: Option<f64>,
    /// 24h high
    pub high_24h: Option<f64>,
    /// 24h low
    pub low_24h: Option<f64>,
    /// 24h base volume
    pub volume_24h: Option<f64>,
    /// Change over the retained history, in percent
    pub price_change_percent: f64,
    /// Windowed volatility
    pub volatility: f64,
    /// Momentum in percent
    pub momentum: f64,
    /// Trend classification
    pub trend: Trend,
    /// Short moving average
    pub sma_short: Option<f64>,
    /// Long moving average
    pub sma_long: Option<f64>,
    /// Recent tick volume over the history average
    pub volume_ratio: f64,
    /// Taker buy volume over taker sell volume in the recent window
    pub buy_sell_ratio: Option<f64>,
    /// Composite strength in [-100, 100]
    pub signal_strength: f64,
    /// Ticks retained
    pub samples: usize,
    /// Time of the last tick
    pub last_update: Option<DateTime<Utc>>,
    /// Time of the recompute that produced this snapshot
    pub computed_at: DateTime<Utc>,
}

impl MarketSnapshot {
    /// Price used for execution checks: mark, then last trade, then mid
    #[must_use]
    pub fn reference_price(&self) -> Option<f64> {
        self.mark_price.or(self.last_price).or_else(|| match (self.best_bid, self.best_ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / 2.0),
            _ => None,
        })
    }
}

#[derive(Debug, Default)]
struct SymbolHistory {
    ticks: VecDeque<Tick>,
    last_price: Option<f64>,
    best_bid: Option<f64>,
    best_ask: Option<f64>,
    mark_price: Option<f64>,
    funding_rate: Option<f64>,
    ticker: Option<Ticker24h>,
    last_update: Option<DateTime<Utc>>,
    previous_price: Option<f64>,
    previous_trend: Trend,
    stale_reported: bool,
}

impl SymbolHistory {
    fn push(&mut self, tick: Tick, capacity: usize) {
        while self.ticks.len() >= capacity.max(1) {
            self.ticks.pop_front();
        }
        self.ticks.push_back(tick);
        self.last_price = Some(tick.price);
        self.last_update = Some(tick.timestamp);
        self.stale_reported = false;
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.last_update = Some(self.last_update.map_or(at, |t| t.max(at)));
    }
}

fn millis_to_time(ms: u64) -> Option<DateTime<Utc>> {
    i64::try_from(ms).ok().and_then(DateTime::from_timestamp_millis)
}

/// Rolling analytics for all tracked symbols
pub struct MarketAnalyticsCache {
    config: AnalyticsConfig,
    histories: Mutex<FxHashMap<String, SymbolHistory>>,
    snapshots: DashMap<String, Arc<MarketSnapshot>>,
    alert_tx: broadcast::Sender<MarketAlert>,
}

impl std::fmt::Debug for MarketAnalyticsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketAnalyticsCache")
            .field("symbols", &self.histories.lock().len())
            .field("config", &self.config)
            .finish()
    }
}

impl MarketAnalyticsCache {
    /// Create an empty cache
    #[must_use]
    pub fn new(config: AnalyticsConfig) -> Self {
        let (alert_tx, _) = broadcast::channel(config.alert_capacity.max(1));
        Self {
            config,
            histories: Mutex::new(FxHashMap::default()),
            snapshots: DashMap::new(),
            alert_tx,
        }
    }

    /// Configuration in use
    #[must_use]
    pub const fn config(&self) -> &AnalyticsConfig {
        &self.config
    }

    /// Receive advisory alerts
    #[must_use]
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<MarketAlert> {
        self.alert_tx.subscribe()
    }

    /// Start collecting a symbol
    pub fn track(&self, symbol: &str) {
        self.histories.lock().entry(normalize_symbol(symbol)).or_default();
    }

    /// Drop a symbol and its published snapshot
    pub fn untrack(&self, symbol: &str) {
        let key = normalize_symbol(symbol);
        self.histories.lock().remove(&key);
        self.snapshots.remove(&key);
    }

    fn with_history(&self, symbol: &str, update: impl FnOnce(&mut SymbolHistory)) {
        let key = normalize_symbol(symbol);
        match self.histories.lock().get_mut(&key) {
            Some(history) => update(history),
            None => debug!("Ignoring update for untracked symbol {}", key),
        }
    }

    /// Append a trade tick
    pub fn record_trade(&self, trade: &Trade) {
        let Some(timestamp) = millis_to_time(trade.event_time) else {
            return;
        };
        let capacity = self.config.capacity;
        self.with_history(&trade.symbol, |h| {
            h.push(
                Tick {
                    timestamp,
                    price: trade.price,
                    volume: trade.quantity,
                    taker_buy: !trade.buyer_is_maker,
                },
                capacity,
            );
        });
    }

    /// Update 24h statistics
    pub fn record_ticker(&self, ticker: &Ticker24h) {
        self.with_history(&ticker.symbol, |h| {
            h.last_price = Some(ticker.last_price);
            if let Some(at) = millis_to_time(ticker.event_time) {
                h.touch(at);
            }
            h.ticker = Some(ticker.clone());
        });
    }

    /// Update best bid/ask
    pub fn record_book_ticker(&self, book: &BookTicker) {
        self.with_history(&book.symbol, |h| {
            h.best_bid = Some(book.bid_price);
            h.best_ask = Some(book.ask_price);
        });
    }

    /// Update mark price and funding
    pub fn record_mark_price(&self, mark: &MarkPrice) {
        self.with_history(&mark.symbol, |h| {
            h.mark_price = Some(mark.mark_price);
            h.funding_rate = Some(mark.funding_rate);
        });
    }

    /// Latest published snapshot
    #[must_use]
    pub fn snapshot(&self, symbol: &str) -> Option<Arc<MarketSnapshot>> {
        self.snapshots
            .get(&normalize_symbol(symbol))
            .map(|s| Arc::clone(s.value()))
    }

    /// Last `limit` trade prices, oldest first
    #[must_use]
    pub fn recent_prices(&self, symbol: &str, limit: usize) -> Vec<f64> {
        let histories = self.histories.lock();
        histories
            .get(&normalize_symbol(symbol))
            .map(|h| {
                let skip = h.ticks.len().saturating_sub(limit);
                h.ticks.iter().skip(skip).map(|t| t.price).collect()
            })
            .unwrap_or_default()
    }

    /// Ticks retained for a symbol
    #[must_use]
    pub fn tick_count(&self, symbol: &str) -> usize {
        self.histories
            .lock()
            .get(&normalize_symbol(symbol))
            .map_or(0, |h| h.ticks.len())
    }

    /// Recompute every symbol, publish snapshots and return the alerts raised
    pub fn recompute(&self, now: DateTime<Utc>) -> Vec<MarketAlert> {
        let mut alerts = Vec::new();
        let mut published = Vec::new();
        {
            let mut histories = self.histories.lock();
            for (symbol, history) in histories.iter_mut() {
                let snapshot = self.compute(symbol, history, now, &mut alerts);
                published.push((symbol.clone(), Arc::new(snapshot)));
            }
        }
        for (symbol, snapshot) in published {
            self.snapshots.insert(symbol, snapshot);
        }
        for alert in &alerts {
            log_alert(alert);
            // No receivers is fine
            drop(self.alert_tx.send(alert.clone()));
        }
        alerts
    }

    fn compute(
        &self,
        symbol: &str,
        history: &mut SymbolHistory,
        now: DateTime<Utc>,
        alerts: &mut Vec<MarketAlert>,
    ) -> MarketSnapshot {
        let cfg = &self.config;
        let prices: Vec<f64> = history.ticks.iter().map(|t| t.price).collect();
        let volumes: Vec<f64> = history.ticks.iter().map(|t| t.volume).collect();

        let ready = prices.len() >= cfg.volatility_window;
        let volatility = if ready { indicators::volatility(&prices, cfg.volatility_window) } else { 0.0 };
        let momentum = if ready { indicators::momentum(&prices, cfg.momentum_window) } else { 0.0 };
        let trend = indicators::trend(&prices, cfg.short_ma, cfg.long_ma, cfg.trend_threshold);
        let sma_short = services_common::math::trailing_mean(&prices, cfg.short_ma);
        let sma_long = services_common::math::trailing_mean(&prices, cfg.long_ma);

        let recent = cfg.volatility_window.max(1);
        let recent_start = volumes.len().saturating_sub(recent);
        let volume_ratio = match (mean(&volumes[recent_start..]), mean(&volumes)) {
            (Some(recent_avg), Some(avg)) if avg > 0.0 => recent_avg / avg,
            _ => 1.0,
        };

        let (buy, sell) = history
            .ticks
            .iter()
            .skip(recent_start)
            .fold((0.0, 0.0), |(b, s), t| if t.taker_buy { (b + t.volume, s) } else { (b, s + t.volume) });
        let buy_sell_ratio = (sell > 0.0).then(|| buy / sell);

        let price_change_percent = match (prices.first(), prices.last()) {
            (Some(&first), Some(&last)) if first > 0.0 => (last - first) / first * PERCENT,
            _ => 0.0,
        };

        let signal_strength = indicators::signal_strength(&StrengthInputs {
            trend,
            momentum,
            momentum_threshold: cfg.momentum_threshold,
            volume_ratio,
            volume_surge: cfg.volume_surge,
            price_change_percent,
            sma_short,
            sma_long,
            volatility,
            high_volatility: cfg.high_volatility,
        });

        let symbol = symbol.to_string();
        if ready {
            if volatility > cfg.high_volatility {
                alerts.push(MarketAlert::HighVolatility { symbol: symbol.clone(), volatility });
            } else if volatility < cfg.low_volatility {
                alerts.push(MarketAlert::LowVolatility { symbol: symbol.clone(), volatility });
            }
            if momentum.abs() > cfg.momentum_threshold {
                alerts.push(MarketAlert::StrongMomentum { symbol: symbol.clone(), momentum });
            }
            if volume_ratio > cfg.volume_surge {
                alerts.push(MarketAlert::VolumeSurge { symbol: symbol.clone(), ratio: volume_ratio });
            } else if volume_ratio < cfg.volume_dry {
                alerts.push(MarketAlert::VolumeDry { symbol: symbol.clone(), ratio: volume_ratio });
            }
        }

        if let (Some(previous), Some(current)) = (history.previous_price, history.last_price) {
            if previous > 0.0 {
                let change = (current - previous) / previous;
                if change.abs() > cfg.significant_move {
                    alerts.push(MarketAlert::PriceMove {
                        symbol: symbol.clone(),
                        change_percent: change * PERCENT,
                        extreme: change.abs() > cfg.extreme_move,
                    });
                }
            }
        }
        history.previous_price = history.last_price;

        if trend != history.previous_trend {
            alerts.push(MarketAlert::TrendChange {
                symbol: symbol.clone(),
                from: history.previous_trend,
                to: trend,
            });
            history.previous_trend = trend;
        }

        if let Some(last) = history.last_update {
            let age = now - last;
            if !history.stale_reported && age > ChronoDuration::seconds(cfg.stale_after_secs as i64) {
                history.stale_reported = true;
                alerts.push(MarketAlert::StaleFeed {
                    symbol: symbol.clone(),
                    seconds_since_update: age.num_seconds(),
                });
            }
        }

        let ticker = history.ticker.as_ref();
        MarketSnapshot {
            symbol,
            last_price: history.last_price,
            best_bid: history.best_bid,
            best_ask: history.best_ask,
            mark_price: history.mark_price,
            funding_rate: history.funding_rate,
            price_change_24h_percent: ticker.map(|t| t.price_change_percent),
            high_24h: ticker.map(|t| t.high),
            low_24h: ticker.map(|t| t.low),
            volume_24h: ticker.map(|t| t.volume),
            price_change_percent,
            volatility,
            momentum,
            trend,
            sma_short,
            sma_long,
            volume_ratio,
            buy_sell_ratio,
            signal_strength,
            samples: prices.len(),
            last_update: history.last_update,
            computed_at: now,
        }
    }

    /// Drop ticks older than the retention horizon; returns how many went
    pub fn evict_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        let mut histories = self.histories.lock();
        for history in histories.values_mut() {
            while history.ticks.front().is_some_and(|t| t.timestamp < cutoff) {
                history.ticks.pop_front();
                removed += 1;
            }
        }
        removed
    }

    /// Spawn the recompute and cleanup jobs; both stop when `shutdown` flips
    pub fn spawn_jobs(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let update = {
            let cache = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            let period = Duration::from_millis(self.config.update_interval_ms.max(1));
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            cache.recompute(Utc::now());
                        }
                        () = shutdown_requested(&mut shutdown) => break,
                    }
                }
                debug!("Analytics update job stopped");
            })
        };

        let cleanup = {
            let cache = Arc::clone(self);
            let mut shutdown = shutdown;
            let period = Duration::from_secs(self.config.cleanup_interval_secs.max(1));
            let retention = ChronoDuration::seconds(self.config.retention_secs as i64);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let removed = cache.evict_older_than(Utc::now() - retention);
                            if removed > 0 {
                                info!("Evicted {} expired ticks", removed);
                            }
                        }
                        () = shutdown_requested(&mut shutdown) => break,
                    }
                }
                debug!("Analytics cleanup job stopped");
            })
        };

        vec![update, cleanup]
    }
}

fn log_alert(alert: &MarketAlert) {
    match alert {
        MarketAlert::HighVolatility { symbol, volatility } => {
            warn!("High volatility detected for {}: {:.2}%", symbol, volatility * PERCENT);
        }
        MarketAlert::StrongMomentum { symbol, momentum } => {
            let direction = if *momentum > 0.0 { "bullish" } else { "bearish" };
            info!("Strong {} momentum for {}: {:.2}%", direction, symbol, momentum);
        }
        MarketAlert::VolumeSurge { symbol, ratio } => {
            info!("Volume surge detected for {}: {:.2}x average", symbol, ratio);
        }
        MarketAlert::PriceMove { symbol, change_percent, .. } => {
            warn!("Significant price move for {}: {:.2}%", symbol, change_percent);
        }
        MarketAlert::StaleFeed { symbol, seconds_since_update } => {
            warn!("No updates for {} in {}s", symbol, seconds_since_update);
        }
        other => debug!("Market alert: {:?}", other),
    }
}
