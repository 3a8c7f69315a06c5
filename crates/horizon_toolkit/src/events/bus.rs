use super::{Event, EventHandler, HandlerId, NotificationSource, TypedEventHandler};
use crate::error::EventError;
use compact_str::CompactString;
use dashmap::DashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Counters kept by an [`EventBus`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventBusStats {
    /// Total number of registered event handlers
    pub total_handlers: usize,
    /// Total number of events emitted since creation
    pub events_emitted: u64,
    /// Handler invocations that returned an error
    pub handler_failures: u64,
}

/// In-process notification source keyed by `K`.
///
/// Emission is synchronous: handlers run on the emitting thread, in
/// registration order. The handler list is copied out of the map before
/// dispatch, so handlers may register or unregister freely while running.
pub struct EventBus<K = CompactString> {
    handlers: DashMap<K, Vec<(HandlerId, Arc<dyn EventHandler>)>>,
    next_id: AtomicU64,
    events_emitted: AtomicU64,
    handler_failures: AtomicU64,
}

impl<K> EventBus<K>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
            next_id: AtomicU64::new(1),
            events_emitted: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
        }
    }

    /// Registers a typed callback for `kind`.
    pub fn on<T, F>(&self, kind: K, handler: F) -> Result<HandlerId, EventError>
    where
        T: Event,
        F: Fn(T) -> Result<(), EventError> + Send + Sync + 'static,
    {
        let name = format!("{}::{}", kind, T::type_name());
        self.register(kind, Arc::new(TypedEventHandler::new(name, handler)))
    }

    /// Delivers `event` to every handler registered for `kind` and returns
    /// how many handlers were invoked.
    pub fn emit<T: Event>(&self, kind: &K, event: &T) -> Result<usize, EventError> {
        let data = event.serialize()?;
        let handlers = self
            .handlers
            .get(kind)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();

        self.events_emitted.fetch_add(1, Ordering::Relaxed);
        if handlers.is_empty() {
            trace!("No handlers for event: {}", kind);
            return Ok(0);
        }

        if cfg!(debug_assertions) {
            debug!("📤 Emitting {} to {} handlers", kind, handlers.len());
        }

        for (_, handler) in &handlers {
            if let Err(e) = handler.handle(&data) {
                self.handler_failures.fetch_add(1, Ordering::Relaxed);
                error!("❌ Handler {} failed: {}", handler.handler_name(), e);
            }
        }
        Ok(handlers.len())
    }

    pub fn handler_count(&self, kind: &K) -> usize {
        self.handlers.get(kind).map(|entry| entry.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            total_handlers: self.handlers.iter().map(|entry| entry.len()).sum(),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }
}

impl<K> NotificationSource<K> for EventBus<K>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
{
    fn register(&self, kind: K, handler: Arc<dyn EventHandler>) -> Result<HandlerId, EventError> {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        trace!("📝 Registered {} '{}' for {}", id, handler.handler_name(), kind);
        self.handlers.entry(kind).or_default().push((id, handler));
        Ok(id)
    }

    fn unregister(&self, kind: &K, id: HandlerId) -> bool {
        let removed = match self.handlers.get_mut(kind) {
            Some(mut entry) => {
                let before = entry.len();
                entry.retain(|(handler_id, _)| *handler_id != id);
                entry.len() != before
            }
            None => false,
        };
        self.handlers.remove_if(kind, |_, handlers| handlers.is_empty());
        if removed {
            trace!("🗑️ Unregistered {} from {}", id, kind);
        }
        removed
    }
}

impl<K> Default for EventBus<K>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> fmt::Debug for EventBus<K>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("kinds", &self.handlers.len())
            .field("stats", &self.stats())
            .finish()
    }
}
