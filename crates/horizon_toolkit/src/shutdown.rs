//! Host shutdown coordination.

use crate::terminable::{Terminable, TerminableRegistry};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Two-phase shutdown flag shared between the host and plugin scopes.
///
/// Top-level registries attach themselves here; initiating shutdown closes
/// every attached registry, newest first.
#[derive(Debug, Clone)]
pub struct ShutdownState {
    /// Set once shutdown starts; no new work should be accepted.
    shutdown_initiated: Arc<AtomicBool>,
    /// Set once every attached resource has been released.
    shutdown_complete: Arc<AtomicBool>,
    root: TerminableRegistry,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self {
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            shutdown_complete: Arc::new(AtomicBool::new(false)),
            root: TerminableRegistry::named("shutdown"),
        }
    }

    /// Closes `terminable` when shutdown is initiated. Attaching after
    /// shutdown started closes it right away.
    pub fn attach<T>(&self, terminable: T) -> T
    where
        T: Terminable + Clone + 'static,
    {
        self.root.bind(terminable)
    }

    /// Registry whose contents close on shutdown.
    pub fn registry(&self) -> &TerminableRegistry {
        &self.root
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Acquire)
    }

    pub fn is_shutdown_complete(&self) -> bool {
        self.shutdown_complete.load(Ordering::Acquire)
    }

    /// Starts shutdown and closes everything attached. Only the first call
    /// does any work; it returns the close failures it collected.
    pub fn initiate_shutdown(&self) -> Vec<anyhow::Error> {
        if self.shutdown_initiated.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }
        info!("🛑 Shutdown initiated - closing {} attached scope(s)", self.root.len());

        let errors = self.root.close_and_report();
        for error in &errors {
            warn!("⚠️ Failure while closing during shutdown: {:#}", error);
        }
        errors
    }

    pub fn complete_shutdown(&self) {
        self.shutdown_complete.store(true, Ordering::Release);
        info!("✅ Shutdown complete - all scopes released");
    }
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}
