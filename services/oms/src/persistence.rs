//! Persistence boundary for order and position records
//!
//! The lifecycle manager hands every created or updated record to a
//! [`Persistence`] implementation. Storage technology is up to the
//! implementation; [`InMemoryStore`] keeps everything in process.

use crate::error::OmsResult;
use crate::order::Order;
use crate::position::Position;
use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use uuid::Uuid;

/// Sink for finalized order and position records
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Insert or replace an order record
    async fn save_order(&self, order: &Order) -> OmsResult<()>;

    /// Insert or replace a position record
    async fn save_position(&self, position: &Position) -> OmsResult<()>;
}

/// Process-local store
#[derive(Debug, Default)]
pub struct InMemoryStore {
    orders: RwLock<FxHashMap<Uuid, Order>>,
    positions: RwLock<FxHashMap<Uuid, Position>>,
}

impl InMemoryStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored order by id
    #[must_use]
    pub fn order(&self, id: &Uuid) -> Option<Order> {
        self.orders.read().get(id).cloned()
    }

    /// Stored position by id
    #[must_use]
    pub fn position(&self, id: &Uuid) -> Option<Position> {
        self.positions.read().get(id).cloned()
    }

    /// Number of stored orders
    #[must_use]
    pub fn order_count(&self) -> usize {
        self.orders.read().len()
    }

    /// Number of stored positions
    #[must_use]
    pub fn position_count(&self) -> usize {
        self.positions.read().len()
    }
}

#[async_trait]
impl Persistence for InMemoryStore {
    async fn save_order(&self, order: &Order) -> OmsResult<()> {
        self.orders.write().insert(order.id, order.clone());
        Ok(())
    }

    async fn save_position(&self, position: &Position) -> OmsResult<()> {
        self.positions.write().insert(position.id, position.clone());
        Ok(())
    }
}
