//! Persistence boundary for signal records

use crate::error::PipelineResult;
use crate::signal::Signal;
use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use uuid::Uuid;

/// Sink for created and updated signals
#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Insert or replace a signal record
    async fn save_signal(&self, signal: &Signal) -> PipelineResult<()>;
}

/// Process-local signal store
#[derive(Debug, Default)]
pub struct InMemorySignalStore {
    signals: RwLock<FxHashMap<Uuid, Signal>>,
}

impl InMemorySignalStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored signal by id
    #[must_use]
    pub fn signal(&self, id: &Uuid) -> Option<Signal> {
        self.signals.read().get(id).cloned()
    }

    /// Number of stored signals
    #[must_use]
    pub fn len(&self) -> usize {
        self.signals.read().len()
    }

    /// Nothing stored yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.signals.read().is_empty()
    }
}

#[async_trait]
impl SignalStore for InMemorySignalStore {
    async fn save_signal(&self, signal: &Signal) -> PipelineResult<()> {
        self.signals.write().insert(signal.id, signal.clone());
        Ok(())
    }
}
