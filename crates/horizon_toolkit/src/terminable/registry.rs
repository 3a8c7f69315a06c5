use super::{Ownership, Terminable, TerminableModule, Transfer};
use crate::error::{CompositeCloseError, ExecutionError, RegistryError};
use crate::report::{panic_message, ExecutionFailure, FailureOrigin, Reporter};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a slot in a [`TerminableRegistry`].
///
/// Ids are never reused. Once the slot is closed, released, or the registry
/// shuts down, the id is stale and every use of it is a checked error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingId {
    registry: u64,
    slot: u64,
}

impl fmt::Display for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.registry, self.slot)
    }
}

struct Entry {
    terminable: Arc<dyn Terminable>,
    /// Ownership id of the terminable, when it carries a marker.
    tag: Option<u64>,
}

struct RegistryInner {
    closed: bool,
    next_slot: u64,
    /// Slot order is registration order.
    entries: BTreeMap<u64, Entry>,
}

pub(crate) struct RegistryShared {
    id: u64,
    name: String,
    inner: Mutex<RegistryInner>,
    ownership: Ownership,
}

impl RegistryShared {
    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Whether the terminable tagged `tag` is this registry or one of the
    /// registries it is bound under.
    fn is_self_or_ancestor(self: &Arc<Self>, tag: u64) -> bool {
        let mut visited = HashSet::new();
        let mut current = Some(self.clone());
        while let Some(registry) = current {
            if registry.ownership.id() == tag {
                return true;
            }
            if !visited.insert(registry.id) {
                return false;
            }
            current = registry.ownership.owner();
        }
        false
    }

    /// Drops the entry carrying `tag` without closing it.
    fn forget(&self, tag: u64) {
        let mut inner = self.lock();
        inner.entries.retain(|_, entry| entry.tag != Some(tag));
        trace!("📤 Registry '{}' released terminable #{}", self.name, tag);
    }
}

/// Ordered, closable collection of terminables.
///
/// Close is idempotent and safe to call from several threads at once: the
/// first caller takes every entry out of the slot table and closes them in
/// reverse registration order (last bound, first closed); later callers see
/// an empty table. A registry is itself a terminable, so binding one registry
/// into another builds a shutdown hierarchy.
///
/// Cloning a `TerminableRegistry` clones the handle, not the contents.
#[derive(Clone)]
pub struct TerminableRegistry {
    shared: Arc<RegistryShared>,
}

impl TerminableRegistry {
    pub fn new() -> Self {
        Self::named("anonymous")
    }

    /// Creates a registry whose name appears in log output.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                inner: Mutex::new(RegistryInner {
                    closed: false,
                    next_slot: 0,
                    entries: BTreeMap::new(),
                }),
                ownership: Ownership::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Binds a terminable and hands the same handle back.
    ///
    /// If the registry is already closed the terminable is closed right away.
    pub fn bind<T>(&self, terminable: T) -> T
    where
        T: Terminable + Clone + 'static,
    {
        self.insert(Arc::new(terminable.clone()));
        terminable
    }

    /// Binds a terminable the registry alone will own.
    ///
    /// The returned id can close it early through [`close_binding`](Self::close_binding).
    pub fn bind_owned<T>(&self, terminable: T) -> BindingId
    where
        T: Terminable + 'static,
    {
        self.insert(Arc::new(terminable))
    }

    /// Creates a child registry bound into this one.
    pub fn child(&self, name: impl Into<String>) -> TerminableRegistry {
        self.bind(TerminableRegistry::named(name))
    }

    /// Lets `module` bind its resources into this registry.
    pub fn bind_module<M: TerminableModule>(&self, module: M) -> M {
        module.setup(self);
        module
    }

    fn insert(&self, terminable: Arc<dyn Terminable>) -> BindingId {
        let tag = terminable.ownership().map(Ownership::id);

        if tag.is_some_and(|tag| self.shared.is_self_or_ancestor(tag)) {
            warn!(
                "⚠️ Registry '{}' cannot hold itself or a registry it is bound under",
                self.shared.name
            );
            return self.stale_id();
        }

        if let Some(ownership) = terminable.ownership() {
            match ownership.transfer_to(&self.shared) {
                Transfer::Unchanged => {
                    let inner = self.shared.lock();
                    let existing = inner
                        .entries
                        .iter()
                        .find(|(_, entry)| entry.tag == tag)
                        .map(|(slot, _)| *slot);
                    if let Some(slot) = existing {
                        return self.id_for(slot);
                    }
                }
                Transfer::Moved(Some(previous)) => {
                    if let Some(tag) = tag {
                        previous.forget(tag);
                    }
                }
                Transfer::Moved(None) => {}
            }
        }

        let mut inner = self.shared.lock();
        if inner.closed {
            drop(inner);
            debug!(
                "🔒 Registry '{}' is closed, closing newly bound terminable immediately",
                self.shared.name
            );
            if let Err(error) = close_guarded(terminable.as_ref()) {
                warn!(
                    "⚠️ Terminable bound to closed registry '{}' failed to close: {:#}",
                    self.shared.name, error
                );
            }
            return self.stale_id();
        }

        let slot = inner.next_slot;
        inner.next_slot += 1;
        inner.entries.insert(slot, Entry { terminable, tag });
        self.id_for(slot)
    }

    fn id_for(&self, slot: u64) -> BindingId {
        BindingId {
            registry: self.shared.id,
            slot,
        }
    }

    fn stale_id(&self) -> BindingId {
        let mut inner = self.shared.lock();
        let slot = inner.next_slot;
        inner.next_slot += 1;
        self.id_for(slot)
    }

    /// Closes one binding ahead of the registry.
    pub fn close_binding(&self, id: BindingId) -> Result<(), RegistryError> {
        if id.registry != self.shared.id {
            return Err(RegistryError::StaleBinding(id));
        }
        let entry = self
            .shared
            .lock()
            .entries
            .remove(&id.slot)
            .ok_or(RegistryError::StaleBinding(id))?;
        close_guarded(entry.terminable.as_ref())
            .map_err(|error| RegistryError::CloseFailed { id, error })
    }

    /// Whether `id` still refers to a live slot.
    pub fn contains(&self, id: BindingId) -> bool {
        id.registry == self.shared.id && self.shared.lock().entries.contains_key(&id.slot)
    }

    /// Closes every bound terminable, newest first, and returns every failure.
    ///
    /// Only the first call does any work; later calls return an empty list.
    pub fn close_and_report(&self) -> Vec<anyhow::Error> {
        let entries = {
            let mut inner = self.shared.lock();
            if inner.closed {
                return Vec::new();
            }
            inner.closed = true;
            std::mem::take(&mut inner.entries)
        };

        debug!(
            "🧹 Closing registry '{}' ({} terminables)",
            self.shared.name,
            entries.len()
        );

        let mut errors = Vec::new();
        for (_, entry) in entries.into_iter().rev() {
            if let Err(error) = close_guarded(entry.terminable.as_ref()) {
                errors.push(error);
            }
        }

        if !errors.is_empty() {
            warn!(
                "⚠️ Registry '{}' closed with {} failure(s)",
                self.shared.name,
                errors.len()
            );
        }
        errors
    }

    /// Closes the registry and hands each failure to `reporter`, tagged with
    /// this registry's name. Returns how many failures were reported.
    pub fn close_and_report_to(&self, reporter: &Reporter) -> usize {
        let errors = self.close_and_report();
        let count = errors.len();
        for error in errors {
            reporter.report(ExecutionFailure::new(
                FailureOrigin::Registry {
                    name: self.shared.name.clone(),
                },
                None,
                ExecutionError::from(error),
            ));
        }
        count
    }

    /// Closes the registry and logs any failures at `warn` level.
    pub fn close_and_log(&self) {
        for error in self.close_and_report() {
            warn!("⚠️ [{}] close failure: {:#}", self.shared.name, error);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Number of live bindings.
    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes entries whose terminable already reports closed, recursing
    /// into child registries.
    ///
    /// Entries are inspected without holding the slot table lock, so their
    /// `cleanup` and `is_closed` may call back into this registry.
    pub fn cleanup(&self) {
        let snapshot: Vec<(u64, Arc<dyn Terminable>)> = self
            .shared
            .lock()
            .entries
            .iter()
            .map(|(slot, entry)| (*slot, entry.terminable.clone()))
            .collect();

        let closed: Vec<u64> = snapshot
            .into_iter()
            .filter_map(|(slot, terminable)| {
                terminable.cleanup();
                terminable.is_closed().then_some(slot)
            })
            .collect();

        let mut inner = self.shared.lock();
        let removed = closed
            .iter()
            .filter(|slot| inner.entries.remove(*slot).is_some())
            .count();
        drop(inner);
        if removed > 0 {
            trace!(
                "🧽 Registry '{}' dropped {} closed terminable(s)",
                self.shared.name,
                removed
            );
        }
    }
}

/// Closes one entry, turning a panic into an ordinary close failure.
pub(super) fn close_guarded(terminable: &dyn Terminable) -> anyhow::Result<()> {
    match catch_unwind(AssertUnwindSafe(|| terminable.close())) {
        Ok(result) => result,
        Err(payload) => Err(anyhow::anyhow!("close panicked: {}", panic_message(payload))),
    }
}

impl Default for TerminableRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Terminable for TerminableRegistry {
    fn close(&self) -> anyhow::Result<()> {
        let errors = self.close_and_report();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CompositeCloseError::new(errors).into())
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    fn ownership(&self) -> Option<&Ownership> {
        Some(&self.shared.ownership)
    }

    fn cleanup(&self) {
        TerminableRegistry::cleanup(self)
    }
}

impl fmt::Debug for TerminableRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("TerminableRegistry")
            .field("name", &self.shared.name)
            .field("closed", &inner.closed)
            .field("entries", &inner.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminable::{terminable_fn, TerminableExt};
    use std::sync::atomic::AtomicUsize;

    fn recording(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> crate::terminable::FnTerminable {
        let log = log.clone();
        terminable_fn(move || {
            log.lock().unwrap().push(name);
            Ok(())
        })
    }

    #[test]
    fn closes_in_reverse_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = TerminableRegistry::named("order");
        registry.bind(recording(&log, "a"));
        registry.bind(recording(&log, "b"));
        registry.bind(recording(&log, "c"));

        assert!(registry.close_and_report().is_empty());
        assert_eq!(*log.lock().unwrap(), vec!["c", "b", "a"]);
    }

    #[test]
    fn second_close_is_a_no_op() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let registry = TerminableRegistry::new();
        registry.bind_owned(terminable_fn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("first close fails"))
        }));

        assert_eq!(registry.close_and_report().len(), 1);
        assert!(registry.close_and_report().is_empty());
        assert!(registry.is_closed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failures_do_not_stop_the_teardown() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = TerminableRegistry::new();
        registry.bind(terminable_fn(|| Err(anyhow::anyhow!("A failed"))));
        registry.bind(recording(&log, "b"));

        let errors = registry.close_and_report();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].to_string(), "A failed");
        assert_eq!(*log.lock().unwrap(), vec!["b"]);
    }

    #[test]
    fn panicking_close_is_reported() {
        let registry = TerminableRegistry::new();
        registry.bind(terminable_fn(|| panic!("close exploded")));
        let errors = registry.close_and_report();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("close exploded"));
    }

    #[test]
    fn bind_after_close_closes_immediately() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = TerminableRegistry::new();
        registry.close_and_report();

        let late = registry.bind(recording(&log, "late"));
        assert!(late.is_closed());
        assert_eq!(*log.lock().unwrap(), vec!["late"]);
        assert!(registry.is_empty());
    }

    #[test]
    fn rebinding_moves_ownership() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = TerminableRegistry::named("first");
        let second = TerminableRegistry::named("second");

        let terminable = recording(&log, "moved").bind_with(&first);
        second.bind(terminable.clone());
        assert_eq!(first.len(), 0);
        assert_eq!(second.len(), 1);

        assert!(first.close_and_report().is_empty());
        assert!(log.lock().unwrap().is_empty());

        second.close_and_report();
        assert_eq!(*log.lock().unwrap(), vec!["moved"]);
    }

    #[test]
    fn rebinding_into_the_same_registry_keeps_one_entry() {
        let registry = TerminableRegistry::new();
        let terminable = terminable_fn(|| Ok(()));
        let first = registry.bind_owned(terminable.clone());
        let second = registry.bind_owned(terminable);
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn nested_registries_close_hierarchically() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let parent = TerminableRegistry::named("parent");
        parent.bind(recording(&log, "parent-first"));
        let child = parent.child("child");
        child.bind(recording(&log, "child-entry"));
        child.bind(terminable_fn(|| Err(anyhow::anyhow!("child failure"))));

        let errors = parent.close_and_report();
        assert!(child.is_closed());
        assert_eq!(*log.lock().unwrap(), vec!["child-entry", "parent-first"]);
        assert_eq!(errors.len(), 1);
        let composite = errors[0].downcast_ref::<CompositeCloseError>().unwrap();
        assert_eq!(composite.len(), 1);
    }

    #[test]
    fn close_binding_is_checked() {
        let registry = TerminableRegistry::new();
        let id = registry.bind_owned(terminable_fn(|| Ok(())));
        assert!(registry.contains(id));
        registry.close_binding(id).unwrap();
        assert!(matches!(
            registry.close_binding(id),
            Err(RegistryError::StaleBinding(stale)) if stale == id
        ));

        let other = TerminableRegistry::new();
        let foreign = other.bind_owned(terminable_fn(|| Ok(())));
        assert!(matches!(
            registry.close_binding(foreign),
            Err(RegistryError::StaleBinding(_))
        ));

        let live = registry.bind_owned(terminable_fn(|| Ok(())));
        registry.close_and_report();
        assert!(matches!(
            registry.close_binding(live),
            Err(RegistryError::StaleBinding(_))
        ));
    }

    #[test]
    fn cleanup_drops_closed_entries() {
        let registry = TerminableRegistry::new();
        let closed = registry.bind(terminable_fn(|| Ok(())));
        registry.bind(terminable_fn(|| Ok(())));
        let child = registry.child("child");
        let inner = child.bind(terminable_fn(|| Ok(())));

        closed.close().unwrap();
        inner.close().unwrap();
        registry.cleanup();

        assert_eq!(registry.len(), 2);
        assert!(child.is_empty());
    }

    #[test]
    fn ancestors_cannot_be_bound_below_themselves() {
        let parent = TerminableRegistry::named("parent");
        let child = parent.child("child");
        let grandchild = child.child("grandchild");

        let id = grandchild.bind_owned(parent.clone());
        assert!(!grandchild.contains(id));
        child.bind(parent.clone());
        assert!(child.is_empty());
        assert_eq!(parent.len(), 1);

        parent.cleanup();
        assert_eq!(parent.len(), 1);
        assert!(parent.close_and_report().is_empty());
        assert!(grandchild.is_closed());
    }

    struct Inspecting {
        registry: TerminableRegistry,
        closed: std::sync::atomic::AtomicBool,
    }

    impl Terminable for Inspecting {
        fn close(&self) -> anyhow::Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn is_closed(&self) -> bool {
            // Reaches back into the registry holding this entry.
            self.registry.len() > 0 && self.closed.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn cleanup_lets_entries_query_their_registry() {
        let registry = TerminableRegistry::named("reentrant");
        let entry = Arc::new(Inspecting {
            registry: registry.clone(),
            closed: std::sync::atomic::AtomicBool::new(false),
        });
        registry.bind(entry.clone());
        registry.bind(terminable_fn(|| Ok(())));

        registry.cleanup();
        assert_eq!(registry.len(), 2);

        entry.close().unwrap();
        registry.cleanup();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn close_failures_can_be_routed_to_a_reporter() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reporter = Reporter::default();
        reporter.set_handler(Arc::new(move |failure: &ExecutionFailure| {
            sink.lock().unwrap().push(failure.to_string());
        }));

        let registry = TerminableRegistry::named("world");
        registry.bind(terminable_fn(|| Err(anyhow::anyhow!("chunk save failed"))));
        registry.bind(terminable_fn(|| Ok(())));

        assert_eq!(registry.close_and_report_to(&reporter), 1);
        assert_eq!(registry.close_and_report_to(&reporter), 0);
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["Exception occurred in terminable registry 'world': chunk save failed".to_string()]
        );
    }

    #[test]
    fn concurrent_close_closes_each_entry_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = TerminableRegistry::new();
        for _ in 0..64 {
            let counter = calls.clone();
            registry.bind(terminable_fn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.close_and_report().len())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 0);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 64);
    }
}
