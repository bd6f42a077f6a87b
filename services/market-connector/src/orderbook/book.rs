//! Per-symbol order book rebuilt from a snapshot plus incremental diffs
//!
//! Sequencing follows the exchange rules: a diff carries the first and final
//! update id it covers and is applied only when it continues the book
//! (`first <= last + 1 <= final`). Anything older is a duplicate and is
//! ignored. A diff that skips ids marks the book stale; a stale book hides its
//! top of book and buffers diffs until a new snapshot arrives, then replays
//! the buffer.

use crate::error::{BookError, BookResult};
use crate::orderbook::price_levels::{PriceLevel, SideBook};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use services_common::{PERCENT, Side};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Incremental depth update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthDiff {
    /// Upper-case symbol
    pub symbol: String,
    /// First update id covered by this diff
    pub first_update_id: u64,
    /// Final update id covered by this diff
    pub final_update_id: u64,
    /// Changed bid levels; quantity 0 deletes
    pub bids: Vec<PriceLevel>,
    /// Changed ask levels; quantity 0 deletes
    pub asks: Vec<PriceLevel>,
    /// Event time in milliseconds
    pub event_time: u64,
}

impl DepthDiff {
    /// Diff covering a single update id
    #[must_use]
    pub fn new(symbol: &str, update_id: u64, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> Self {
        Self {
            symbol: symbol.to_string(),
            first_update_id: update_id,
            final_update_id: update_id,
            bids,
            asks,
            event_time: 0,
        }
    }
}

/// Full book state at an update id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthSnapshot {
    /// Upper-case symbol
    pub symbol: String,
    /// Update id the snapshot reflects
    pub last_update_id: u64,
    /// Bid levels in any order
    pub bids: Vec<PriceLevel>,
    /// Ask levels in any order
    pub asks: Vec<PriceLevel>,
    /// Event time in milliseconds, 0 for REST snapshots
    pub event_time: u64,
}

/// Trust state of a book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookState {
    /// No snapshot applied yet
    AwaitingSnapshot,
    /// Consistent with the exchange
    Live,
    /// Sequence broken or state invalid, needs a snapshot
    Stale,
}

/// Result of applying a diff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOutcome {
    /// Levels were updated
    Applied,
    /// Diff was already covered by the book
    Duplicate,
    /// Book is not live; diff kept for replay after the next snapshot
    Buffered,
}

/// Order book sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BookConfig {
    /// Levels kept per side
    pub max_depth: usize,
    /// Diffs buffered while waiting for a snapshot
    pub pending_capacity: usize,
    /// Levels requested from the REST snapshot endpoint
    pub snapshot_limit: u32,
    /// Levels per side copied into published snapshots
    pub publish_depth: usize,
}

impl Default for BookConfig {
    fn default() -> Self {
        Self {
            max_depth: 1000,
            pending_capacity: 1000,
            snapshot_limit: 1000,
            publish_depth: 100,
        }
    }
}

/// Cost of filling a quantity against the book
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ImpactEstimate {
    /// Whole quantity can be filled
    Filled {
        /// Volume-weighted fill price
        average_price: f64,
        /// Distance from the best price to the average, in percent
        slippage_percent: f64,
        /// Quote value of the fill
        total_value: f64,
        /// Levels consumed
        levels_used: usize,
    },
    /// Book is thinner than the requested quantity
    Partial {
        /// Quantity available on the side
        fillable_quantity: f64,
        /// Quantity that could not be filled
        unfilled_quantity: f64,
        /// Levels consumed
        levels_used: usize,
        /// Average price of the fillable part, if any
        average_price: Option<f64>,
    },
}

impl ImpactEstimate {
    /// Whether the whole quantity is fillable
    #[must_use]
    pub const fn is_filled(&self) -> bool {
        matches!(self, Self::Filled { .. })
    }
}

/// Walk `levels` best-first until `quantity` is consumed
#[must_use]
pub fn walk_levels(levels: &[PriceLevel], quantity: f64) -> ImpactEstimate {
    let mut remaining = quantity;
    let mut total_value = 0.0;
    let mut levels_used = 0;

    for level in levels {
        if remaining <= 0.0 {
            break;
        }
        let take = remaining.min(level.quantity);
        total_value += take * level.price;
        remaining -= take;
        levels_used += 1;
    }

    let filled = quantity - remaining;
    if remaining > services_common::EPSILON {
        return ImpactEstimate::Partial {
            fillable_quantity: filled,
            unfilled_quantity: remaining,
            levels_used,
            average_price: (filled > 0.0).then(|| total_value / filled),
        };
    }

    let average_price = total_value / quantity;
    let best = levels.first().map_or(average_price, |l| l.price);
    ImpactEstimate::Filled {
        average_price,
        slippage_percent: (average_price - best).abs() / best * PERCENT,
        total_value,
        levels_used,
    }
}

/// Best bid/ask with derived spread figures
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TopOfBook {
    /// Best bid
    pub bid: PriceLevel,
    /// Best ask
    pub ask: PriceLevel,
    /// Ask minus bid
    pub spread: f64,
    /// Spread relative to the bid, in percent
    pub spread_percent: f64,
    /// Midpoint
    pub mid: f64,
}

impl TopOfBook {
    fn from_levels(bid: PriceLevel, ask: PriceLevel) -> Self {
        let spread = ask.price - bid.price;
        Self {
            bid,
            ask,
            spread,
            spread_percent: spread / bid.price * PERCENT,
            mid: (bid.price + ask.price) / 2.0,
        }
    }
}

/// Immutable view of a book handed to readers
#[derive(Debug, Clone, Serialize)]
pub struct OrderBookSnapshot {
    /// Upper-case symbol
    pub symbol: String,
    /// Trust state when the snapshot was taken
    pub state: BookState,
    /// Last applied update id
    pub last_update_id: u64,
    /// Top of book, only when live
    pub top: Option<TopOfBook>,
    /// Bid levels, best first; empty unless live
    pub bids: Vec<PriceLevel>,
    /// Ask levels, best first; empty unless live
    pub asks: Vec<PriceLevel>,
    /// Time of the last mutation
    pub updated_at: Option<DateTime<Utc>>,
}

impl OrderBookSnapshot {
    /// Best bid, when the book is live
    #[must_use]
    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.top.map(|t| t.bid)
    }

    /// Best ask, when the book is live
    #[must_use]
    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.top.map(|t| t.ask)
    }

    /// Total quantity in the top `depth` levels of one side
    #[must_use]
    pub fn volume(&self, side: Side, depth: usize) -> f64 {
        let levels = match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        };
        levels.iter().take(depth).map(|l| l.quantity).sum()
    }

    /// Fill estimate for an order on `side` over the published depth
    pub fn estimate_impact(&self, side: Side, quantity: f64) -> BookResult<ImpactEstimate> {
        if self.state != BookState::Live {
            return Err(BookError::StaleBook {
                symbol: self.symbol.clone(),
            });
        }
        check_quantity(quantity)?;
        let levels = match side {
            Side::Buy => &self.asks,
            Side::Sell => &self.bids,
        };
        Ok(walk_levels(levels, quantity))
    }
}

fn check_quantity(quantity: f64) -> BookResult<()> {
    if quantity.is_finite() && quantity > 0.0 {
        Ok(())
    } else {
        Err(BookError::InvalidQuantity { quantity })
    }
}

/// Order book for a single symbol
#[derive(Debug, Clone)]
pub struct OrderBook {
    symbol: String,
    bids: SideBook,
    asks: SideBook,
    last_update_id: u64,
    state: BookState,
    pending: VecDeque<DepthDiff>,
    config: BookConfig,
    updated_at: Option<DateTime<Utc>>,
}

impl OrderBook {
    /// Create an empty book awaiting its first snapshot
    #[must_use]
    pub fn new(symbol: &str, config: BookConfig) -> Self {
        Self {
            symbol: services_common::normalize_symbol(symbol),
            bids: SideBook::bids(),
            asks: SideBook::asks(),
            last_update_id: 0,
            state: BookState::AwaitingSnapshot,
            pending: VecDeque::new(),
            config,
            updated_at: None,
        }
    }

    /// Symbol this book represents
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Current trust state
    #[must_use]
    pub const fn state(&self) -> BookState {
        self.state
    }

    /// Whether the book needs a snapshot before it can be read
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.state != BookState::Live
    }

    /// Last applied update id
    #[must_use]
    pub const fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    /// Diffs waiting for the next snapshot
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn validate(&self, bids: &[PriceLevel], asks: &[PriceLevel]) -> BookResult<()> {
        match bids.iter().chain(asks).find(|l| !l.is_valid()) {
            Some(bad) => Err(BookError::InvalidLevel {
                price: bad.price,
                quantity: bad.quantity,
            }),
            None => Ok(()),
        }
    }

    fn mark_stale(&mut self) {
        if self.state != BookState::Stale {
            warn!("Order book {} marked stale at update {}", self.symbol, self.last_update_id);
        }
        self.state = BookState::Stale;
    }

    fn buffer(&mut self, diff: DepthDiff) {
        if self.pending.len() >= self.config.pending_capacity {
            self.pending.pop_front();
        }
        self.pending.push_back(diff);
    }

    fn check_crossed(&mut self) -> BookResult<()> {
        if let (Some(bid), Some(ask)) = (self.bids.best(), self.asks.best()) {
            if bid.price >= ask.price {
                self.mark_stale();
                return Err(BookError::CrossedBook {
                    symbol: self.symbol.clone(),
                    bid: bid.price,
                    ask: ask.price,
                });
            }
        }
        Ok(())
    }

    /// Replace the book wholesale and clear staleness
    ///
    /// Buffered diffs newer than the snapshot are replayed afterwards; a
    /// gap in the buffer makes the book stale again.
    ///
    /// # Errors
    ///
    /// `InvalidLevel` leaves the book untouched. `CrossedBook` and
    /// `SequenceGap` leave it stale.
    pub fn apply_snapshot(&mut self, snapshot: &DepthSnapshot) -> BookResult<()> {
        self.validate(&snapshot.bids, &snapshot.asks)?;

        self.bids.replace(&snapshot.bids, self.config.max_depth);
        self.asks.replace(&snapshot.asks, self.config.max_depth);
        self.last_update_id = snapshot.last_update_id;
        self.state = BookState::Live;
        self.updated_at = Some(Utc::now());
        self.check_crossed()?;

        debug!(
            "Applied snapshot for {} at {} with {} bids and {} asks",
            self.symbol,
            self.last_update_id,
            self.bids.len(),
            self.asks.len()
        );

        let mut replay = std::mem::take(&mut self.pending).into_iter();
        while let Some(diff) = replay.next() {
            if let Err(err) = self.apply_live(diff) {
                self.pending.extend(replay);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Apply an incremental diff
    ///
    /// # Errors
    ///
    /// `InvalidLevel` rejects the diff without touching the book.
    /// `SequenceGap` and `CrossedBook` mark the book stale.
    pub fn apply_diff(&mut self, diff: DepthDiff) -> BookResult<DiffOutcome> {
        self.validate(&diff.bids, &diff.asks)?;
        match self.state {
            BookState::Live => self.apply_live(diff),
            BookState::AwaitingSnapshot | BookState::Stale => {
                self.buffer(diff);
                Ok(DiffOutcome::Buffered)
            }
        }
    }

    fn apply_live(&mut self, diff: DepthDiff) -> BookResult<DiffOutcome> {
        if diff.final_update_id <= self.last_update_id {
            return Ok(DiffOutcome::Duplicate);
        }

        let expected = self.last_update_id + 1;
        if diff.first_update_id > expected {
            warn!(
                "Gap in updates for {}: expected {}, got {}",
                self.symbol, expected, diff.first_update_id
            );
            let received = diff.first_update_id;
            self.mark_stale();
            self.buffer(diff);
            return Err(BookError::SequenceGap {
                symbol: self.symbol.clone(),
                expected,
                received,
            });
        }

        for level in &diff.bids {
            self.bids.upsert(*level);
        }
        for level in &diff.asks {
            self.asks.upsert(*level);
        }
        self.bids.truncate(self.config.max_depth);
        self.asks.truncate(self.config.max_depth);

        self.last_update_id = diff.final_update_id;
        self.updated_at = Some(Utc::now());
        self.check_crossed()?;
        Ok(DiffOutcome::Applied)
    }

    /// Best bid, unavailable while stale
    #[must_use]
    pub fn best_bid(&self) -> Option<PriceLevel> {
        if self.is_stale() { None } else { self.bids.best() }
    }

    /// Best ask, unavailable while stale
    #[must_use]
    pub fn best_ask(&self) -> Option<PriceLevel> {
        if self.is_stale() { None } else { self.asks.best() }
    }

    /// Best bid/ask with spread and mid, unavailable while stale
    #[must_use]
    pub fn top_of_book(&self) -> Option<TopOfBook> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(TopOfBook::from_levels(bid, ask)),
            _ => None,
        }
    }

    /// Mid price
    #[must_use]
    pub fn mid(&self) -> Option<f64> {
        self.top_of_book().map(|t| t.mid)
    }

    /// Bid levels, best first
    #[must_use]
    pub fn bids(&self) -> &[PriceLevel] {
        self.bids.levels()
    }

    /// Ask levels, best first
    #[must_use]
    pub fn asks(&self) -> &[PriceLevel] {
        self.asks.levels()
    }

    /// Total quantity in the top `depth` levels; `Buy` reads bids
    #[must_use]
    pub fn volume(&self, side: Side, depth: usize) -> f64 {
        match side {
            Side::Buy => self.bids.volume(depth),
            Side::Sell => self.asks.volume(depth),
        }
    }

    /// Estimate the fill of `quantity` for an order on `side`
    ///
    /// Buys walk the asks and sells walk the bids. A book thinner than the
    /// quantity yields [`ImpactEstimate::Partial`], never an error.
    ///
    /// # Errors
    ///
    /// `StaleBook` when the book cannot be trusted, `InvalidQuantity` for a
    /// non-positive quantity.
    pub fn estimate_impact(&self, side: Side, quantity: f64) -> BookResult<ImpactEstimate> {
        if self.is_stale() {
            return Err(BookError::StaleBook {
                symbol: self.symbol.clone(),
            });
        }
        check_quantity(quantity)?;
        let levels = match side {
            Side::Buy => self.asks.levels(),
            Side::Sell => self.bids.levels(),
        };
        Ok(walk_levels(levels, quantity))
    }

    /// Immutable copy for readers
    #[must_use]
    pub fn snapshot(&self) -> OrderBookSnapshot {
        let live = !self.is_stale();
        let depth = self.config.publish_depth;
        OrderBookSnapshot {
            symbol: self.symbol.clone(),
            state: self.state,
            last_update_id: self.last_update_id,
            top: self.top_of_book(),
            bids: if live { self.bids.levels().iter().take(depth).copied().collect() } else { Vec::new() },
            asks: if live { self.asks.levels().iter().take(depth).copied().collect() } else { Vec::new() },
            updated_at: self.updated_at,
        }
    }
}
