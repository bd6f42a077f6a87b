//! Top-level market data manager
//!
//! Wires one [`StreamConnection`] to the order book store and the analytics
//! cache. A single dispatcher handler is registered on every channel the
//! service opens; it is the only writer of books and histories. Snapshot
//! resyncs run on their own task, driven by the store's resync requests.
//!
//! # Example
//!
//! ```no_run
//! use market_connector::{MarketDataConfig, MarketDataService};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let service = Arc::new(MarketDataService::connect_default(MarketDataConfig::default())?);
//! service.subscribe_symbol("BTCUSDT").await;
//!
//! let runner = Arc::clone(&service);
//! tokio::spawn(async move { runner.run().await });
//!
//! if let Some(book) = service.order_book_snapshot("BTCUSDT") {
//!     println!("best bid {:?}", book.best_bid());
//! }
//! # Ok(())
//! # }
//! ```

use crate::analytics::{AnalyticsConfig, MarketAnalyticsCache, MarketSnapshot};
use crate::connection::{ConnectionState, StreamConfig, StreamConnection, shutdown_requested};
use crate::error::{BookError, BookResult, StreamResult};
use crate::messages::{MarketEvent, StreamKind, StreamName};
use crate::orderbook::{BookConfig, DiffOutcome, ImpactEstimate, OrderBookSnapshot, OrderBookStore};
use crate::provider::MarketDataProvider;
use crate::snapshot::{RestSnapshotClient, SnapshotSource};
use crate::subscription::{HandlerId, StreamHandler};
use crate::transport::{Transport, WebSocketTransport};
use serde::{Deserialize, Serialize};
use services_common::{ExchangeEndpoints, Side};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

/// Market data service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketDataConfig {
    /// Exchange endpoints; the stream URL overrides `stream.url` when set
    pub endpoints: ExchangeEndpoints,
    /// Stream connection settings
    pub stream: StreamConfig,
    /// Order book settings
    pub book: BookConfig,
    /// Analytics settings
    pub analytics: AnalyticsConfig,
    /// REST snapshot request timeout
    pub snapshot_timeout_ms: u64,
    /// Delay before retrying a failed snapshot fetch
    pub resync_retry_delay_ms: u64,
    /// Capacity of the update broadcast
    pub update_capacity: usize,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        let endpoints = ExchangeEndpoints::default();
        Self {
            stream: StreamConfig {
                url: endpoints.ws_url.clone(),
                ..StreamConfig::default()
            },
            endpoints,
            book: BookConfig::default(),
            analytics: AnalyticsConfig::default(),
            snapshot_timeout_ms: 10_000,
            resync_retry_delay_ms: 1_000,
            update_capacity: 1024,
        }
    }
}

/// Update pushed to hook subscribers
#[derive(Debug, Clone)]
pub enum MarketUpdate {
    /// Decoded stream event
    Event(MarketEvent),
    /// Book republished after a diff was applied
    OrderBook(Arc<OrderBookSnapshot>),
}

/// Channels opened for a symbol by [`MarketDataService::subscribe_symbol`]
#[must_use]
pub fn symbol_channels(symbol: &str) -> Vec<StreamName> {
    [
        StreamKind::Trade,
        StreamKind::Ticker,
        StreamKind::BookTicker,
        StreamKind::DepthDiff,
        StreamKind::MarkPrice,
    ]
    .into_iter()
    .map(|kind| StreamName::new(symbol, kind))
    .collect()
}

struct Dispatcher {
    books: Arc<OrderBookStore>,
    analytics: Arc<MarketAnalyticsCache>,
    updates_tx: broadcast::Sender<MarketUpdate>,
}

impl Dispatcher {
    fn publish(&self, update: MarketUpdate) {
        // Hooks are optional
        drop(self.updates_tx.send(update));
    }
}

impl StreamHandler for Dispatcher {
    fn on_event(&self, stream: &StreamName, event: &MarketEvent) {
        match event {
            MarketEvent::Depth(diff) => match self.books.apply_diff(diff.clone()) {
                Ok(DiffOutcome::Applied) => {
                    if let Some(book) = self.books.snapshot(&diff.symbol) {
                        self.publish(MarketUpdate::OrderBook(book));
                    }
                }
                Ok(DiffOutcome::Duplicate | DiffOutcome::Buffered) => {}
                Err(BookError::UnknownSymbol { symbol }) => {
                    debug!("Depth update for untracked book {}", symbol);
                }
                Err(e) => warn!("Depth update on {} not applied: {}", stream, e),
            },
            MarketEvent::Trade(trade) => {
                self.analytics.record_trade(trade);
                self.publish(MarketUpdate::Event(event.clone()));
            }
            MarketEvent::Ticker(ticker) => {
                self.analytics.record_ticker(ticker);
                self.publish(MarketUpdate::Event(event.clone()));
            }
            MarketEvent::BookTicker(book) => {
                self.analytics.record_book_ticker(book);
                self.publish(MarketUpdate::Event(event.clone()));
            }
            MarketEvent::MarkPrice(mark) => {
                self.analytics.record_mark_price(mark);
                self.publish(MarketUpdate::Event(event.clone()));
            }
            MarketEvent::Liquidation(liquidation) => {
                info!(
                    "Liquidation on {}: {} {} @ {}",
                    liquidation.symbol, liquidation.side, liquidation.quantity, liquidation.average_price
                );
                self.publish(MarketUpdate::Event(event.clone()));
            }
            MarketEvent::PartialDepth(_) | MarketEvent::Kline(_) => {
                self.publish(MarketUpdate::Event(event.clone()));
            }
        }
    }
}

/// Market data manager owning the stream, books and analytics
pub struct MarketDataService {
    config: MarketDataConfig,
    connection: Arc<StreamConnection>,
    books: Arc<OrderBookStore>,
    analytics: Arc<MarketAnalyticsCache>,
    snapshots: Arc<dyn SnapshotSource>,
    resync_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
    dispatcher: Arc<Dispatcher>,
    updates_tx: broadcast::Sender<MarketUpdate>,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for MarketDataService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataService")
            .field("connection", &self.connection)
            .field("books", &self.books)
            .field("analytics", &self.analytics)
            .finish_non_exhaustive()
    }
}

impl MarketDataService {
    /// Build the service over explicit transport and snapshot collaborators
    #[must_use]
    pub fn new(
        config: MarketDataConfig,
        transport: Arc<dyn Transport>,
        snapshots: Arc<dyn SnapshotSource>,
    ) -> Self {
        let connection = Arc::new(StreamConnection::new(config.stream.clone(), transport));
        let (store, resync_rx) = OrderBookStore::new(config.book.clone());
        let books = Arc::new(store);
        let analytics = Arc::new(MarketAnalyticsCache::new(config.analytics.clone()));
        let (updates_tx, _) = broadcast::channel(config.update_capacity.max(1));
        let dispatcher = Arc::new(Dispatcher {
            books: Arc::clone(&books),
            analytics: Arc::clone(&analytics),
            updates_tx: updates_tx.clone(),
        });

        Self {
            config,
            connection,
            books,
            analytics,
            snapshots,
            resync_rx: Arc::new(tokio::sync::Mutex::new(resync_rx)),
            dispatcher,
            updates_tx,
            shutdown_tx: watch::Sender::new(false),
        }
    }

    /// Build the service with the websocket transport and REST snapshots
    ///
    /// # Errors
    ///
    /// Fails when the HTTP client cannot be built.
    pub fn connect_default(mut config: MarketDataConfig) -> StreamResult<Self> {
        config.stream.url.clone_from(&config.endpoints.ws_url);
        let snapshots = RestSnapshotClient::new(
            &config.endpoints.rest_url,
            Duration::from_millis(config.snapshot_timeout_ms),
        )?;
        Ok(Self::new(config, Arc::new(WebSocketTransport), Arc::new(snapshots)))
    }

    /// Stream connection
    #[must_use]
    pub fn connection(&self) -> &Arc<StreamConnection> {
        &self.connection
    }

    /// Current stream state
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Order book store
    #[must_use]
    pub fn books(&self) -> &Arc<OrderBookStore> {
        &self.books
    }

    /// Analytics cache
    #[must_use]
    pub fn analytics(&self) -> &Arc<MarketAnalyticsCache> {
        &self.analytics
    }

    /// Subscribe to dispatched updates
    #[must_use]
    pub fn subscribe_updates(&self) -> broadcast::Receiver<MarketUpdate> {
        self.updates_tx.subscribe()
    }

    /// Register a raw handler on any channel
    pub async fn add_handler(&self, channel: StreamName, handler: Arc<dyn StreamHandler>) -> HandlerId {
        self.connection.subscribe(channel, handler).await
    }

    /// Remove a raw handler
    pub async fn remove_handler(&self, channel: &StreamName, id: HandlerId) -> bool {
        self.connection.remove_handler(channel, id).await
    }

    /// Start market data for a symbol; true when this was the first reference
    pub async fn subscribe_symbol(&self, symbol: &str) -> bool {
        if !self.connection.acquire_symbol(symbol) {
            debug!("{} already subscribed", symbol);
            return false;
        }
        info!("Subscribing market data for {}", symbol);
        self.analytics.track(symbol);
        self.books.track(symbol);
        let handler: Arc<dyn StreamHandler> = self.dispatcher.clone();
        for channel in symbol_channels(symbol) {
            self.connection.subscribe(channel, Arc::clone(&handler)).await;
        }
        true
    }

    /// Release a symbol; channels close when the last reference goes
    pub async fn unsubscribe_symbol(&self, symbol: &str) -> bool {
        if !self.connection.release_symbol(symbol) {
            return false;
        }
        info!("Unsubscribing market data for {}", symbol);
        for channel in symbol_channels(symbol) {
            self.connection.unsubscribe(&channel).await;
        }
        self.books.untrack(symbol);
        self.analytics.untrack(symbol);
        true
    }

    /// Published book for a symbol
    #[must_use]
    pub fn order_book_snapshot(&self, symbol: &str) -> Option<Arc<OrderBookSnapshot>> {
        self.books.snapshot(symbol)
    }

    /// Published analytics for a symbol
    #[must_use]
    pub fn market_analytics(&self, symbol: &str) -> Option<Arc<MarketSnapshot>> {
        self.analytics.snapshot(symbol)
    }

    /// Fill estimate against the full order book
    ///
    /// # Errors
    ///
    /// Propagates [`OrderBookStore::estimate_impact`] errors.
    pub fn estimate_impact(&self, symbol: &str, side: Side, quantity: f64) -> BookResult<ImpactEstimate> {
        self.books.estimate_impact(symbol, side, quantity)
    }

    /// Stop every loop and close the stream
    pub fn shutdown(&self) {
        info!("Market data service shutting down");
        self.shutdown_tx.send_replace(true);
        self.connection.shutdown();
    }

    /// Run until shutdown or until the stream gives up
    ///
    /// Background jobs are stopped before returning in both cases, so the
    /// service can be run again after a failure.
    ///
    /// # Errors
    ///
    /// Propagates the stream connection's terminal error.
    pub async fn run(&self) -> StreamResult<()> {
        self.shutdown_tx.send_replace(false);
        let mut jobs = self.analytics.spawn_jobs(self.shutdown_tx.subscribe());
        jobs.push(self.spawn_resync());

        let result = self.connection.connect().await;
        if let Err(e) = &result {
            error!("Market data stream stopped: {}", e);
        }

        self.shutdown_tx.send_replace(true);
        for job in jobs {
            if let Err(e) = job.await {
                warn!("Market data job ended abnormally: {}", e);
            }
        }
        result
    }

    fn spawn_resync(&self) -> tokio::task::JoinHandle<()> {
        let resync_rx = Arc::clone(&self.resync_rx);
        let books = Arc::clone(&self.books);
        let snapshots = Arc::clone(&self.snapshots);
        let limit = self.config.book.snapshot_limit;
        let retry_delay = Duration::from_millis(self.config.resync_retry_delay_ms);
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut requests = resync_rx.lock().await;
            loop {
                let symbol = tokio::select! {
                    next = requests.recv() => match next {
                        Some(symbol) => symbol,
                        None => break,
                    },
                    () = shutdown_requested(&mut shutdown) => break,
                };
                resync(&books, snapshots.as_ref(), &symbol, limit, retry_delay, &shutdown).await;
            }
            debug!("Order book resync job stopped");
        })
    }
}

async fn resync(
    books: &Arc<OrderBookStore>,
    snapshots: &dyn SnapshotSource,
    symbol: &str,
    limit: u32,
    retry_delay: Duration,
    shutdown: &watch::Receiver<bool>,
) {
    match snapshots.fetch_depth(symbol, limit).await {
        Ok(snapshot) => match books.apply_snapshot(&snapshot) {
            Ok(()) => info!("Order book {} resynced at {}", symbol, snapshot.last_update_id),
            Err(e) => warn!("Snapshot for {} left the book stale: {}", symbol, e),
        },
        Err(e) => {
            warn!("Snapshot fetch for {} failed, retrying in {:?}: {}", symbol, retry_delay, e);
            let books = Arc::clone(books);
            let symbol = symbol.to_string();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = tokio::time::sleep(retry_delay) => books.retry_resync(&symbol),
                    () = shutdown_requested(&mut shutdown) => debug!("Resync retry for {} dropped on shutdown", symbol),
                }
            });
        }
    }
}

impl MarketDataProvider for MarketDataService {
    fn book_snapshot(&self, symbol: &str) -> Option<Arc<OrderBookSnapshot>> {
        self.order_book_snapshot(symbol)
    }

    fn market_snapshot(&self, symbol: &str) -> Option<Arc<MarketSnapshot>> {
        self.market_analytics(symbol)
    }

    fn recent_prices(&self, symbol: &str, limit: usize) -> Vec<f64> {
        self.analytics.recent_prices(symbol, limit)
    }
}
