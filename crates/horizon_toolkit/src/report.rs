//! # Failure reporting
//!
//! Every callback the toolkit runs on behalf of a plugin (task bodies, promise
//! stages, subscription handlers) is executed behind [`guard`], which turns
//! both returned errors and panics into an [`ExecutionError`]. Failures that
//! have nowhere else to go are handed to an [`ErrorHandler`] together with
//! their origin and the context they ran on.
//!
//! The default handler, [`TracingErrorHandler`], logs through `tracing`.
//! Hosts that want failures routed elsewhere (metrics, a crash reporter, a
//! test collector) install their own handler on the scheduler with
//! [`Scheduler::set_error_handler`](crate::Scheduler::set_error_handler).

use crate::context::ExecutionContext;
use crate::error::ExecutionError;
use crate::scheduler::TaskId;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::error;

/// Which component a failure came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOrigin {
    SchedulerTask { task_id: TaskId },
    PromiseChain,
    Subscription { name: String },
    Registry { name: String },
}

impl fmt::Display for FailureOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureOrigin::SchedulerTask { task_id } => write!(f, "scheduler task #{task_id}"),
            FailureOrigin::PromiseChain => f.write_str("promise chain"),
            FailureOrigin::Subscription { name } => write!(f, "subscription '{name}'"),
            FailureOrigin::Registry { name } => write!(f, "terminable registry '{name}'"),
        }
    }
}

/// A caught failure together with where it happened.
#[derive(Debug, Clone)]
pub struct ExecutionFailure {
    pub origin: FailureOrigin,
    /// `None` when the failure happened on a thread that belongs to neither context.
    pub context: Option<ExecutionContext>,
    pub error: ExecutionError,
}

impl ExecutionFailure {
    pub fn new(origin: FailureOrigin, context: Option<ExecutionContext>, error: ExecutionError) -> Self {
        Self {
            origin,
            context,
            error,
        }
    }
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.context {
            Some(context) => write!(f, "Exception occurred in {} ({context}): {}", self.origin, self.error),
            None => write!(f, "Exception occurred in {}: {}", self.origin, self.error),
        }
    }
}

/// Sink for failures caught at a dispatch boundary.
///
/// Implementations must not panic; the toolkit calls them from inside the sync
/// tick loop and from worker threads.
pub trait ErrorHandler: Send + Sync + 'static {
    fn handle(&self, failure: &ExecutionFailure);
}

impl<F> ErrorHandler for F
where
    F: Fn(&ExecutionFailure) + Send + Sync + 'static,
{
    fn handle(&self, failure: &ExecutionFailure) {
        self(failure)
    }
}

/// Logs every failure at `error` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorHandler;

impl ErrorHandler for TracingErrorHandler {
    fn handle(&self, failure: &ExecutionFailure) {
        error!(
            origin = %failure.origin,
            context = failure.context.map(ExecutionContext::as_str).unwrap_or("external"),
            panicked = failure.error.is_panic(),
            "❌ {}",
            failure
        );
    }
}

/// Shared, swappable handle to the active [`ErrorHandler`].
///
/// Cloned into every job the scheduler dispatches so that swapping the handler
/// affects work that is already queued.
#[derive(Clone)]
pub struct Reporter {
    handler: Arc<RwLock<Arc<dyn ErrorHandler>>>,
}

impl Reporter {
    pub fn new(handler: Arc<dyn ErrorHandler>) -> Self {
        Self {
            handler: Arc::new(RwLock::new(handler)),
        }
    }

    pub fn set_handler(&self, handler: Arc<dyn ErrorHandler>) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = handler;
    }

    pub fn report(&self, failure: ExecutionFailure) {
        let handler = self
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        // A panicking handler must not unwind into the dispatch loop.
        if catch_unwind(AssertUnwindSafe(|| handler.handle(&failure))).is_err() {
            error!("❌ Error handler panicked while reporting: {}", failure);
        }
    }
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new(Arc::new(TracingErrorHandler))
    }
}

impl fmt::Debug for Reporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reporter").finish_non_exhaustive()
    }
}

/// Extracts the message from a panic payload.
pub fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Runs a user callback, converting returned errors and panics into an
/// [`ExecutionError`].
pub fn guard<R>(f: impl FnOnce() -> anyhow::Result<R>) -> Result<R, ExecutionError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(ExecutionError::from(error)),
        Err(payload) => Err(ExecutionError::Panicked(panic_message(payload))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn guard_converts_errors_and_panics() {
        assert_eq!(guard(|| Ok(7)).ok(), Some(7));

        let failed = guard::<()>(|| Err(anyhow::anyhow!("boom"))).unwrap_err();
        assert!(matches!(failed, ExecutionError::Failed(_)));
        assert_eq!(failed.to_string(), "boom");

        let panicked = guard::<()>(|| panic!("kaboom")).unwrap_err();
        match panicked {
            ExecutionError::Panicked(message) => assert_eq!(message, "kaboom"),
            other => panic!("expected a panic, got {other:?}"),
        }
    }

    #[test]
    fn reporter_uses_the_installed_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reporter = Reporter::default();
        reporter.set_handler(Arc::new(move |failure: &ExecutionFailure| {
            sink.lock().unwrap().push(failure.origin.clone());
        }));

        reporter.report(ExecutionFailure::new(
            FailureOrigin::SchedulerTask { task_id: 3 },
            Some(ExecutionContext::Sync),
            ExecutionError::Panicked("x".into()),
        ));

        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[FailureOrigin::SchedulerTask { task_id: 3 }]
        );
    }

    #[test]
    fn panicking_handler_is_contained() {
        let reporter = Reporter::new(Arc::new(|_: &ExecutionFailure| panic!("bad handler")));
        reporter.report(ExecutionFailure::new(
            FailureOrigin::PromiseChain,
            None,
            ExecutionError::Panicked("x".into()),
        ));
    }

    #[test]
    fn failure_display_names_origin_and_context() {
        let failure = ExecutionFailure::new(
            FailureOrigin::Subscription { name: "chat".into() },
            Some(ExecutionContext::Async),
            ExecutionError::failed(anyhow::anyhow!("bad input")),
        );
        assert_eq!(
            failure.to_string(),
            "Exception occurred in subscription 'chat' (async): bad input"
        );
    }
}
