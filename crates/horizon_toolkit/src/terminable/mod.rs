//! # Terminables
//!
//! A [`Terminable`] is anything with an idempotent `close`: a scheduled task,
//! a subscription, a pending promise, a whole registry. Plugins hand their
//! terminables to a [`TerminableRegistry`], which closes everything it owns
//! exactly once when the plugin (or a narrower scope) shuts down.
//!
//! Terminables built by this crate carry an [`Ownership`] marker. Binding
//! such a terminable into a second registry *moves* it: the first registry
//! forgets it and will not close it. Foreign terminables without a marker are
//! tracked exactly as they are given.
//!
//! A [`WeakTerminableRegistry`] closes what it tracks without keeping it
//! alive; entries dropped elsewhere are skipped.

mod module;
mod registry;
mod weak;

pub use module::TerminableModule;
pub use registry::{BindingId, TerminableRegistry};
pub use weak::WeakTerminableRegistry;

pub(crate) use registry::RegistryShared;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::debug;

static NEXT_OWNERSHIP_ID: AtomicU64 = AtomicU64::new(1);

/// A resource with an idempotent close operation.
pub trait Terminable: Send + Sync {
    /// Releases the resource. Calling it again after a successful close must
    /// be a no-op that returns `Ok(())`.
    fn close(&self) -> anyhow::Result<()>;

    /// Whether the resource has already been released.
    fn is_closed(&self) -> bool {
        false
    }

    /// Ownership marker used to move the terminable between registries.
    fn ownership(&self) -> Option<&Ownership> {
        None
    }

    /// Drops internally tracked resources that have already closed.
    /// Only containers override this.
    fn cleanup(&self) {}

    /// Closes the resource, logging instead of returning a failure.
    fn close_silently(&self) {
        if let Err(error) = self.close() {
            debug!("🔇 Ignoring close failure: {:#}", error);
        }
    }
}

impl<T: Terminable + ?Sized> Terminable for Arc<T> {
    fn close(&self) -> anyhow::Result<()> {
        (**self).close()
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }

    fn ownership(&self) -> Option<&Ownership> {
        (**self).ownership()
    }

    fn cleanup(&self) {
        (**self).cleanup()
    }
}

/// Fluent binding for cloneable terminable handles.
pub trait TerminableExt: Terminable + Clone + Sized + 'static {
    /// Binds this handle into `registry` and returns it.
    fn bind_with(self, registry: &TerminableRegistry) -> Self {
        registry.bind(self)
    }
}

impl<T: Terminable + Clone + 'static> TerminableExt for T {}

/// Records which registry currently owns a terminable.
pub struct Ownership {
    id: u64,
    owner: Mutex<Option<Weak<RegistryShared>>>,
}

pub(crate) enum Transfer {
    /// The terminable already belongs to the target registry.
    Unchanged,
    /// Ownership moved; holds the registry that must forget the terminable.
    Moved(Option<Arc<RegistryShared>>),
}

impl Ownership {
    pub fn new() -> Self {
        Self {
            id: NEXT_OWNERSHIP_ID.fetch_add(1, Ordering::Relaxed),
            owner: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether an open registry currently owns the terminable.
    pub fn is_owned(&self) -> bool {
        self.owner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|registry| !registry.is_closed())
    }

    /// The registry currently owning the terminable, if it is still alive.
    pub(crate) fn owner(&self) -> Option<Arc<RegistryShared>> {
        self.owner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    pub(crate) fn transfer_to(&self, target: &Arc<RegistryShared>) -> Transfer {
        let mut owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = owner.as_ref().and_then(Weak::upgrade);
        if let Some(previous) = &previous {
            if Arc::ptr_eq(previous, target) {
                return Transfer::Unchanged;
            }
        }
        *owner = Some(Arc::downgrade(target));
        Transfer::Moved(previous)
    }
}

impl Default for Ownership {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Ownership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ownership")
            .field("id", &self.id)
            .field("owned", &self.is_owned())
            .finish()
    }
}

type CloseAction = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// A terminable backed by a one-shot close action.
#[derive(Clone)]
pub struct FnTerminable {
    action: Arc<Mutex<Option<CloseAction>>>,
    ownership: Arc<Ownership>,
}

/// Wraps `action` as a terminable that runs it on the first close.
pub fn terminable_fn<F>(action: F) -> FnTerminable
where
    F: FnOnce() -> anyhow::Result<()> + Send + 'static,
{
    FnTerminable {
        action: Arc::new(Mutex::new(Some(Box::new(action)))),
        ownership: Arc::new(Ownership::new()),
    }
}

impl Terminable for FnTerminable {
    fn close(&self) -> anyhow::Result<()> {
        let action = self
            .action
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match action {
            Some(action) => action(),
            None => Ok(()),
        }
    }

    fn is_closed(&self) -> bool {
        self.action
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    fn ownership(&self) -> Option<&Ownership> {
        Some(&self.ownership)
    }
}

impl fmt::Debug for FnTerminable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTerminable")
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn fn_terminable_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let terminable = terminable_fn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(!terminable.is_closed());
        terminable.close().unwrap();
        terminable.clone().close().unwrap();
        assert!(terminable.is_closed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_silently_swallows_failures() {
        let terminable = terminable_fn(|| Err(anyhow::anyhow!("already gone")));
        terminable.close_silently();
        assert!(terminable.is_closed());
    }

    #[test]
    fn ownership_ids_are_unique() {
        assert_ne!(Ownership::new().id(), Ownership::new().id());
        assert!(!Ownership::new().is_owned());
    }
}
