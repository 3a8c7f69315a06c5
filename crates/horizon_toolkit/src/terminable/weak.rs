use super::registry::close_guarded;
use super::{Ownership, Terminable};
use crate::error::CompositeCloseError;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, trace, warn};

struct WeakInner {
    closed: bool,
    /// Registration order.
    entries: Vec<Weak<dyn Terminable>>,
}

struct WeakShared {
    name: String,
    inner: Mutex<WeakInner>,
    /// Set while a cleanup pass is running, so a cycle through a strong
    /// registry ends instead of recursing.
    cleaning: AtomicBool,
    ownership: Ownership,
}

/// A registry that closes terminables without keeping them alive.
///
/// Entries are held as [`Weak`] references. Whatever has been dropped by the
/// time the registry closes is skipped; everything still alive is closed
/// newest first, exactly as [`TerminableRegistry`](super::TerminableRegistry)
/// does. Useful for short-lived resources that may be released elsewhere,
/// where a strong registry would otherwise pin them until shutdown.
#[derive(Clone)]
pub struct WeakTerminableRegistry {
    shared: Arc<WeakShared>,
}

impl WeakTerminableRegistry {
    pub fn new() -> Self {
        Self::named("weak")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(WeakShared {
                name: name.into(),
                inner: Mutex::new(WeakInner {
                    closed: false,
                    entries: Vec::new(),
                }),
                cleaning: AtomicBool::new(false),
                ownership: Ownership::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WeakInner> {
        self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Tracks `terminable` without taking ownership of it. If the registry is
    /// already closed the terminable is closed right away.
    pub fn bind<T>(&self, terminable: &Arc<T>) -> Arc<T>
    where
        T: Terminable + 'static,
    {
        let strong: Arc<dyn Terminable> = terminable.clone();
        let mut inner = self.lock();
        if inner.closed {
            drop(inner);
            if let Err(error) = close_guarded(strong.as_ref()) {
                warn!(
                    "⚠️ Terminable bound to closed registry '{}' failed to close: {:#}",
                    self.shared.name, error
                );
            }
        } else {
            inner.entries.push(Arc::downgrade(&strong));
        }
        terminable.clone()
    }

    /// Closes every entry that is still alive, newest first, and returns the
    /// failures. Only the first call does any work.
    pub fn close_and_report(&self) -> Vec<anyhow::Error> {
        let entries = {
            let mut inner = self.lock();
            if inner.closed {
                return Vec::new();
            }
            inner.closed = true;
            std::mem::take(&mut inner.entries)
        };

        let total = entries.len();
        let mut skipped = 0;
        let mut errors = Vec::new();
        for entry in entries.into_iter().rev() {
            let Some(terminable) = entry.upgrade() else {
                skipped += 1;
                continue;
            };
            if let Err(error) = close_guarded(terminable.as_ref()) {
                errors.push(error);
            }
        }

        debug!(
            "🧹 Closed weak registry '{}' ({} of {} still alive)",
            self.shared.name,
            total - skipped,
            total
        );
        errors
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of tracked references, dropped ones included until the next
    /// [`cleanup`](Self::cleanup).
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets references whose terminable was dropped or already closed.
    pub fn cleanup(&self) {
        if self.shared.cleaning.swap(true, Ordering::AcqRel) {
            return;
        }

        let entries = std::mem::take(&mut self.lock().entries);
        let before = entries.len();
        let mut kept: Vec<_> = entries
            .into_iter()
            .filter(|entry| match entry.upgrade() {
                Some(terminable) => {
                    terminable.cleanup();
                    !terminable.is_closed()
                }
                None => false,
            })
            .collect();

        let mut inner = self.lock();
        let removed = before - kept.len();
        // Keep anything bound while the pass ran, after the survivors.
        kept.append(&mut inner.entries);
        inner.entries = kept;
        drop(inner);
        self.shared.cleaning.store(false, Ordering::Release);

        if removed > 0 {
            trace!(
                "🧽 Weak registry '{}' dropped {} reference(s)",
                self.shared.name,
                removed
            );
        }
    }
}

impl Default for WeakTerminableRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Terminable for WeakTerminableRegistry {
    fn close(&self) -> anyhow::Result<()> {
        let errors = self.close_and_report();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CompositeCloseError::new(errors).into())
        }
    }

    fn is_closed(&self) -> bool {
        WeakTerminableRegistry::is_closed(self)
    }

    fn ownership(&self) -> Option<&Ownership> {
        Some(&self.shared.ownership)
    }

    fn cleanup(&self) {
        WeakTerminableRegistry::cleanup(self)
    }
}

impl fmt::Debug for WeakTerminableRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("WeakTerminableRegistry")
            .field("name", &self.shared.name)
            .field("closed", &inner.closed)
            .field("entries", &inner.entries.len())
            .finish()
    }
}
