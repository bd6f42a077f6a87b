//! Price level storage for one side of the book

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A price and the total quantity resting at it
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    /// Price
    pub price: f64,
    /// Total quantity at this price
    pub quantity: f64,
}

impl PriceLevel {
    /// Create a level
    #[must_use]
    pub const fn new(price: f64, quantity: f64) -> Self {
        Self { price, quantity }
    }

    /// Finite positive price and finite non-negative quantity
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.price.is_finite() && self.price > 0.0 && self.quantity.is_finite() && self.quantity >= 0.0
    }
}

/// One side of the book, kept sorted best-first
///
/// Bids are ordered by descending price and asks by ascending price.
/// Levels with zero quantity are never stored.
#[derive(Debug, Clone)]
pub struct SideBook {
    levels: Vec<PriceLevel>,
    descending: bool,
}

impl SideBook {
    /// Empty bid side
    #[must_use]
    pub fn bids() -> Self {
        Self {
            levels: Vec::new(),
            descending: true,
        }
    }

    /// Empty ask side
    #[must_use]
    pub fn asks() -> Self {
        Self {
            levels: Vec::new(),
            descending: false,
        }
    }

    fn order(&self, a: f64, b: f64) -> Ordering {
        if self.descending { b.total_cmp(&a) } else { a.total_cmp(&b) }
    }

    /// Replace the whole side, dropping empty levels
    pub fn replace(&mut self, levels: &[PriceLevel], max_depth: usize) {
        self.levels.clear();
        self.levels
            .extend(levels.iter().copied().filter(|l| l.quantity > 0.0));
        let descending = self.descending;
        self.levels.sort_by(|a, b| {
            if descending { b.price.total_cmp(&a.price) } else { a.price.total_cmp(&b.price) }
        });
        // Duplicate prices in a snapshot keep the last quantity seen
        self.levels.dedup_by(|later, earlier| {
            if later.price == earlier.price {
                earlier.quantity = later.quantity;
                true
            } else {
                false
            }
        });
        self.levels.truncate(max_depth);
    }

    /// Insert, update or (quantity zero) delete a level
    pub fn upsert(&mut self, level: PriceLevel) {
        match self
            .levels
            .binary_search_by(|probe| self.order(probe.price, level.price))
        {
            Ok(pos) if level.quantity == 0.0 => {
                self.levels.remove(pos);
            }
            Ok(pos) => self.levels[pos].quantity = level.quantity,
            Err(_) if level.quantity == 0.0 => {}
            Err(pos) => self.levels.insert(pos, level),
        }
    }

    /// Drop levels beyond `max_depth`
    pub fn truncate(&mut self, max_depth: usize) {
        self.levels.truncate(max_depth);
    }

    /// Best level
    #[must_use]
    pub fn best(&self) -> Option<PriceLevel> {
        self.levels.first().copied()
    }

    /// All levels, best first
    #[must_use]
    pub fn levels(&self) -> &[PriceLevel] {
        &self.levels
    }

    /// Total quantity of the top `depth` levels
    #[must_use]
    pub fn volume(&self, depth: usize) -> f64 {
        self.levels.iter().take(depth).map(|l| l.quantity).sum()
    }

    /// Number of levels
    #[must_use]
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    /// No levels
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Remove all levels
    pub fn clear(&mut self) {
        self.levels.clear();
    }
}
