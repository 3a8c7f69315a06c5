//! Error taxonomy shared by every toolkit component.
//!
//! Each component owns one `thiserror` enum. User callbacks report failures as
//! `anyhow::Error`; those are wrapped into [`ExecutionError`] at the dispatch
//! boundary and shared behind an `Arc` so a single failure can fan out to
//! every downstream promise stage.

use crate::context::ExecutionContext;
use crate::terminable::BindingId;
use std::sync::Arc;
use std::time::Duration;

/// Malformed input, rejected synchronously at the call site.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Delay must not be negative (got {0} ticks)")]
    NegativeDelay(i64),
    #[error("Repeat interval must be at least one tick (got {0})")]
    InvalidInterval(i64),
    #[error("Expiry call count must be at least 1")]
    InvalidExpiryCount,
    #[error("Expiry duration must be greater than zero")]
    InvalidExpiryDuration,
    #[error("Ticks per second must be between 1 and 1000 (got {0})")]
    InvalidTickRate(u32),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("A merged subscription needs at least one bound notification kind")]
    NoBoundKinds,
}

/// A user callback failed at a dispatch boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutionError {
    #[error("{0:#}")]
    Failed(Arc<anyhow::Error>),
    #[error("Callback panicked: {0}")]
    Panicked(String),
}

impl ExecutionError {
    pub fn failed(error: impl Into<anyhow::Error>) -> Self {
        ExecutionError::Failed(Arc::new(error.into()))
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, ExecutionError::Panicked(_))
    }
}

impl From<anyhow::Error> for ExecutionError {
    fn from(error: anyhow::Error) -> Self {
        ExecutionError::Failed(Arc::new(error))
    }
}

/// Terminal failure kinds of a promise, plus the errors of blocking waits.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PromiseError {
    #[error("Promise was cancelled")]
    Cancelled,
    #[error("Promise stage failed: {0}")]
    Execution(#[from] ExecutionError),
    #[error("Timed out after {0:?} waiting for promise")]
    Timeout(Duration),
    #[error("Blocking the sync thread would deadlock: the promise can only complete once the sync context advances")]
    WouldDeadlock,
    #[error("The {0} context is unavailable")]
    ContextUnavailable(ExecutionContext),
}

impl PromiseError {
    /// Wraps an arbitrary failure the way a failing stage would.
    pub fn execution(error: impl Into<anyhow::Error>) -> Self {
        PromiseError::Execution(ExecutionError::failed(error))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PromiseError::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, PromiseError::Timeout(_))
    }

    pub fn as_execution(&self) -> Option<&ExecutionError> {
        match self {
            PromiseError::Execution(error) => Some(error),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for PromiseError {
    fn from(error: anyhow::Error) -> Self {
        PromiseError::Execution(error.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("The {0} context is unavailable")]
    ContextUnavailable(ExecutionContext),
    #[error("Sync context is bound to another thread")]
    ForeignThread,
    #[error("Failed to start worker runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Binding {0} is stale: it was already closed or the registry has shut down")]
    StaleBinding(BindingId),
    #[error("Closing binding {id} failed: {error:#}")]
    CloseFailed { id: BindingId, error: anyhow::Error },
}

/// Aggregated close failures of a registry that was closed as a child of
/// another registry (or through [`Terminable::close`](crate::Terminable::close)).
#[derive(Debug, thiserror::Error)]
#[error("{} terminable(s) failed to close", .errors.len())]
pub struct CompositeCloseError {
    pub errors: Vec<anyhow::Error>,
}

impl CompositeCloseError {
    pub fn new(errors: Vec<anyhow::Error>) -> Self {
        Self { errors }
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Errors that can occur during event bus operations.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// Serialization failed when converting event to bytes
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Deserialization failed when converting bytes to event
    #[error("Deserialization error: {0}")]
    Deserialization(serde_json::Error),
    #[error("Handler execution error: {0}")]
    HandlerExecution(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Failed to register with notification source: {0}")]
    Registration(#[from] EventError),
}

/// Errors raised while enabling or disabling plugins.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("Plugin initialization failed: {0}")]
    InitializationFailed(String),
    #[error("Plugin execution error: {0}")]
    ExecutionError(String),
    #[error("Plugin not found: {0}")]
    NotFound(String),
    #[error("Plugin already enabled: {0}")]
    AlreadyEnabled(String),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
}
