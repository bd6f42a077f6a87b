//! Channel and handler bookkeeping
//!
//! The registry never performs I/O. The connection consults it to decide
//! which control messages to send and which handlers receive a payload.

use crate::messages::{MarketEvent, StreamName};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Receiver of decoded channel payloads
///
/// Handlers run on the dispatch task and must not block.
pub trait StreamHandler: Send + Sync {
    /// Called for every payload on a channel the handler is registered for
    fn on_event(&self, stream: &StreamName, event: &MarketEvent);
}

impl<F> StreamHandler for F
where
    F: Fn(&StreamName, &MarketEvent) + Send + Sync,
{
    fn on_event(&self, stream: &StreamName, event: &MarketEvent) {
        self(stream, event);
    }
}

/// Identifies one handler registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

/// Outcome of registering a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    /// Id of the (possibly pre-existing) registration
    pub id: HandlerId,
    /// Whether the channel had no handlers before this call
    pub new_channel: bool,
}

type HandlerList = Vec<(HandlerId, Arc<dyn StreamHandler>)>;

/// Active channels, their handlers and per-symbol reference counts
#[derive(Default)]
pub struct SubscriptionRegistry {
    channels: BTreeMap<StreamName, HandlerList>,
    symbol_refs: FxHashMap<String, usize>,
    next_handler: u64,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("channels", &self.channels.keys().map(ToString::to_string).collect::<Vec<_>>())
            .field("symbol_refs", &self.symbol_refs)
            .finish()
    }
}

impl SubscriptionRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `channel`
    ///
    /// Registering the same handler instance twice on one channel returns
    /// the existing id instead of adding a duplicate.
    pub fn add_handler(&mut self, channel: StreamName, handler: Arc<dyn StreamHandler>) -> Registration {
        let handlers = self.channels.entry(channel).or_default();
        let new_channel = handlers.is_empty();

        if let Some((id, _)) = handlers.iter().find(|(_, h)| Arc::ptr_eq(h, &handler)) {
            return Registration {
                id: *id,
                new_channel: false,
            };
        }

        self.next_handler += 1;
        let id = HandlerId(self.next_handler);
        handlers.push((id, handler));
        Registration { id, new_channel }
    }

    /// Remove one handler; returns `Some(true)` when the channel became empty
    /// and was dropped, `None` when the handler was not registered
    pub fn remove_handler(&mut self, channel: &StreamName, id: HandlerId) -> Option<bool> {
        let handlers = self.channels.get_mut(channel)?;
        let before = handlers.len();
        handlers.retain(|(hid, _)| *hid != id);
        if handlers.len() == before {
            return None;
        }
        if handlers.is_empty() {
            self.channels.remove(channel);
            return Some(true);
        }
        Some(false)
    }

    /// Drop a channel and all its handlers
    pub fn remove_channel(&mut self, channel: &StreamName) -> bool {
        self.channels.remove(channel).is_some()
    }

    /// Handlers of a channel in registration order
    #[must_use]
    pub fn handlers(&self, channel: &StreamName) -> Vec<Arc<dyn StreamHandler>> {
        self.channels
            .get(channel)
            .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    /// Number of handlers on a channel
    #[must_use]
    pub fn handler_count(&self, channel: &StreamName) -> usize {
        self.channels.get(channel).map_or(0, Vec::len)
    }

    /// All active channels
    #[must_use]
    pub fn channels(&self) -> Vec<StreamName> {
        self.channels.keys().cloned().collect()
    }

    /// Whether a channel has at least one handler
    #[must_use]
    pub fn is_active(&self, channel: &StreamName) -> bool {
        self.channels.contains_key(channel)
    }

    /// Take a reference on a symbol; true for the first reference
    pub fn acquire_symbol(&mut self, symbol: &str) -> bool {
        let count = self.symbol_refs.entry(symbol.to_ascii_uppercase()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Release a reference on a symbol; true when the last one is released
    pub fn release_symbol(&mut self, symbol: &str) -> bool {
        let key = symbol.to_ascii_uppercase();
        match self.symbol_refs.get_mut(&key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.symbol_refs.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Current reference count of a symbol
    #[must_use]
    pub fn symbol_refs(&self, symbol: &str) -> usize {
        self.symbol_refs
            .get(&symbol.to_ascii_uppercase())
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::StreamKind;

    fn noop() -> Arc<dyn StreamHandler> {
        Arc::new(|_: &StreamName, _: &MarketEvent| {})
    }

    #[test]
    fn test_first_handler_creates_channel() {
        let mut registry = SubscriptionRegistry::new();
        let channel = StreamName::new("btcusdt", StreamKind::Trade);

        let first = registry.add_handler(channel.clone(), noop());
        let second = registry.add_handler(channel.clone(), noop());

        assert!(first.new_channel);
        assert!(!second.new_channel);
        assert_ne!(first.id, second.id);
        assert_eq!(registry.handler_count(&channel), 2);
    }

    #[test]
    fn test_same_handler_is_not_registered_twice() {
        let mut registry = SubscriptionRegistry::new();
        let channel = StreamName::new("btcusdt", StreamKind::Ticker);
        let handler = noop();

        let a = registry.add_handler(channel.clone(), Arc::clone(&handler));
        let b = registry.add_handler(channel.clone(), handler);

        assert_eq!(a.id, b.id);
        assert_eq!(registry.handler_count(&channel), 1);
    }

    #[test]
    fn test_removing_last_handler_drops_channel() {
        let mut registry = SubscriptionRegistry::new();
        let channel = StreamName::new("btcusdt", StreamKind::BookTicker);
        let a = registry.add_handler(channel.clone(), noop());
        let b = registry.add_handler(channel.clone(), noop());

        assert_eq!(registry.remove_handler(&channel, a.id), Some(false));
        assert_eq!(registry.remove_handler(&channel, a.id), None);
        assert_eq!(registry.remove_handler(&channel, b.id), Some(true));
        assert!(!registry.is_active(&channel));
    }

    #[test]
    fn test_symbol_reference_counting() {
        let mut registry = SubscriptionRegistry::new();
        assert!(registry.acquire_symbol("btcusdt"));
        assert!(!registry.acquire_symbol("BTCUSDT"));
        assert_eq!(registry.symbol_refs("BTCUSDT"), 2);
        assert!(!registry.release_symbol("BTCUSDT"));
        assert!(registry.release_symbol("btcusdt"));
        assert!(!registry.release_symbol("btcusdt"));
        assert_eq!(registry.symbol_refs("BTCUSDT"), 0);
    }
}
