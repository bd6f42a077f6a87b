//! Single-writer book store with lock-free snapshot reads
//!
//! The stream dispatch task is the only writer. Every mutation republishes
//! an immutable [`OrderBookSnapshot`] through an `ArcSwap`, so readers never
//! contend with the writer. When a book leaves the live state the store
//! raises one resync request per stale episode on an mpsc channel; the owner
//! answers it with a fresh snapshot.

use crate::error::{BookError, BookResult};
use crate::orderbook::book::{
    BookConfig, DepthDiff, DepthSnapshot, DiffOutcome, ImpactEstimate, OrderBook, OrderBookSnapshot,
};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use services_common::{Side, normalize_symbol};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info};

struct BookSlot {
    book: Mutex<OrderBook>,
    published: ArcSwap<OrderBookSnapshot>,
    resync_requested: AtomicBool,
}

impl BookSlot {
    fn publish(&self, book: &OrderBook) {
        self.published.store(Arc::new(book.snapshot()));
    }
}

/// Books for all tracked symbols
pub struct OrderBookStore {
    config: BookConfig,
    books: DashMap<String, Arc<BookSlot>>,
    resync_tx: mpsc::UnboundedSender<String>,
}

impl std::fmt::Debug for OrderBookStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderBookStore")
            .field("books", &self.books.len())
            .field("config", &self.config)
            .finish()
    }
}

impl OrderBookStore {
    /// Create a store and the receiver of its resync requests
    #[must_use]
    pub fn new(config: BookConfig) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (resync_tx, resync_rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                books: DashMap::new(),
                resync_tx,
            },
            resync_rx,
        )
    }

    /// Start tracking a symbol; requests its initial snapshot
    pub fn track(&self, symbol: &str) {
        let symbol = normalize_symbol(symbol);
        let mut created = false;
        let slot = self
            .books
            .entry(symbol.clone())
            .or_insert_with(|| {
                created = true;
                let book = OrderBook::new(&symbol, self.config.clone());
                let published = ArcSwap::from_pointee(book.snapshot());
                Arc::new(BookSlot {
                    book: Mutex::new(book),
                    published,
                    resync_requested: AtomicBool::new(false),
                })
            })
            .clone();
        if created {
            info!("Tracking order book for {}", symbol);
            self.request_resync(&symbol, &slot);
        }
    }

    /// Stop tracking a symbol
    pub fn untrack(&self, symbol: &str) -> bool {
        self.books.remove(&normalize_symbol(symbol)).is_some()
    }

    /// Tracked symbols
    #[must_use]
    pub fn symbols(&self) -> Vec<String> {
        self.books.iter().map(|e| e.key().clone()).collect()
    }

    fn slot(&self, symbol: &str) -> BookResult<Arc<BookSlot>> {
        let key = normalize_symbol(symbol);
        self.books
            .get(&key)
            .map(|s| Arc::clone(s.value()))
            .ok_or(BookError::UnknownSymbol { symbol: key })
    }

    fn request_resync(&self, symbol: &str, slot: &BookSlot) {
        if !slot.resync_requested.swap(true, Ordering::AcqRel) {
            debug!("Requesting snapshot for {}", symbol);
            // Receiver gone means the owner is shutting down
            let _ = self.resync_tx.send(symbol.to_string());
        }
    }

    /// Apply a diff from the stream
    ///
    /// # Errors
    ///
    /// Propagates [`OrderBook::apply_diff`] errors and `UnknownSymbol`.
    pub fn apply_diff(&self, diff: DepthDiff) -> BookResult<DiffOutcome> {
        let symbol = normalize_symbol(&diff.symbol);
        let slot = self.slot(&symbol)?;
        let mut book = slot.book.lock();
        let result = book.apply_diff(diff);
        if !matches!(result, Ok(DiffOutcome::Duplicate)) {
            slot.publish(&book);
        }
        if book.is_stale() {
            self.request_resync(&symbol, &slot);
        }
        result
    }

    /// Apply a snapshot, usually in answer to a resync request
    ///
    /// # Errors
    ///
    /// Propagates [`OrderBook::apply_snapshot`] errors and `UnknownSymbol`.
    pub fn apply_snapshot(&self, snapshot: &DepthSnapshot) -> BookResult<()> {
        let symbol = normalize_symbol(&snapshot.symbol);
        let slot = self.slot(&symbol)?;
        let mut book = slot.book.lock();
        let result = book.apply_snapshot(snapshot);
        slot.publish(&book);
        slot.resync_requested.store(false, Ordering::Release);
        if book.is_stale() {
            self.request_resync(&symbol, &slot);
        }
        result
    }

    /// Re-request a snapshot after a failed fetch
    pub fn retry_resync(&self, symbol: &str) {
        if let Ok(slot) = self.slot(symbol) {
            slot.resync_requested.store(false, Ordering::Release);
            self.request_resync(&normalize_symbol(symbol), &slot);
        }
    }

    /// Latest published snapshot, without locking the writer
    #[must_use]
    pub fn snapshot(&self, symbol: &str) -> Option<Arc<OrderBookSnapshot>> {
        self.slot(symbol).ok().map(|slot| slot.published.load_full())
    }

    /// Fill estimate against the full book
    ///
    /// Published snapshots are cut to `publish_depth`, so this walks the
    /// writer's levels under the slot lock instead.
    ///
    /// # Errors
    ///
    /// `UnknownSymbol`, `StaleBook` or `InvalidQuantity`.
    pub fn estimate_impact(&self, symbol: &str, side: Side, quantity: f64) -> BookResult<ImpactEstimate> {
        let slot = self.slot(symbol)?;
        let book = slot.book.lock();
        book.estimate_impact(side, quantity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::{BookState, PriceLevel};

    fn snapshot(id: u64) -> DepthSnapshot {
        DepthSnapshot {
            symbol: "BTCUSDT".to_string(),
            last_update_id: id,
            bids: vec![PriceLevel::new(99.0, 1.0)],
            asks: vec![PriceLevel::new(101.0, 1.0)],
            event_time: 0,
        }
    }

    #[test]
    fn test_track_requests_initial_snapshot_once() {
        let (store, mut rx) = OrderBookStore::new(BookConfig::default());
        store.track("btcusdt");
        store.track("BTCUSDT");
        assert_eq!(rx.try_recv().ok().as_deref(), Some("BTCUSDT"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_gap_requests_resync_once_per_episode() {
        let (store, mut rx) = OrderBookStore::new(BookConfig::default());
        store.track("BTCUSDT");
        let _ = rx.try_recv();
        store.apply_snapshot(&snapshot(100)).expect("snapshot");

        let gap = store.apply_diff(DepthDiff::new("BTCUSDT", 105, vec![], vec![]));
        assert!(matches!(gap, Err(BookError::SequenceGap { .. })));
        let _ = store.apply_diff(DepthDiff::new("BTCUSDT", 106, vec![], vec![]));

        assert_eq!(rx.try_recv().ok().as_deref(), Some("BTCUSDT"));
        assert!(rx.try_recv().is_err());

        let published = store.snapshot("BTCUSDT").expect("tracked");
        assert_eq!(published.state, BookState::Stale);
        assert!(published.best_bid().is_none());
    }

    #[test]
    fn test_readers_see_published_state() {
        let (store, _rx) = OrderBookStore::new(BookConfig::default());
        store.track("BTCUSDT");
        store.apply_snapshot(&snapshot(10)).expect("snapshot");
        store
            .apply_diff(DepthDiff::new("BTCUSDT", 11, vec![PriceLevel::new(99.5, 2.0)], vec![]))
            .expect("diff");
        let view = store.snapshot("btcusdt").expect("tracked");
        assert_eq!(view.best_bid(), Some(PriceLevel::new(99.5, 2.0)));
        assert_eq!(view.last_update_id, 11);
    }

    #[test]
    fn test_impact_walks_levels_beyond_published_depth() {
        let (store, _rx) = OrderBookStore::new(BookConfig::default());
        store.track("BTCUSDT");
        let mut deep = snapshot(10);
        deep.asks = (0..200).map(|i| PriceLevel::new(101.0 + f64::from(i), 1.0)).collect();
        store.apply_snapshot(&deep).expect("snapshot");

        assert_eq!(store.snapshot("BTCUSDT").expect("tracked").asks.len(), 100);
        let estimate = store.estimate_impact("BTCUSDT", Side::Buy, 150.0).expect("live");
        assert!(matches!(estimate, ImpactEstimate::Filled { levels_used: 150, .. }));
    }

    #[test]
    fn test_unknown_symbol() {
        let (store, _rx) = OrderBookStore::new(BookConfig::default());
        let result = store.apply_diff(DepthDiff::new("ETHUSDT", 1, vec![], vec![]));
        assert!(matches!(result, Err(BookError::UnknownSymbol { .. })));
        assert!(store.snapshot("ETHUSDT").is_none());
    }
}
