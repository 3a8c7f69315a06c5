//! # Horizon Toolkit
//!
//! Scheduling and resource-lifecycle building blocks for plugins running on a
//! tick-based, single-threaded game-server host.
//!
//! ## Core Features
//!
//! - **Two execution contexts**: the host's main thread (sync) and a worker
//!   pool (async), selected explicitly with [`ExecutionContext`]
//! - **Scheduler**: one-shot, delayed and repeating tasks measured in [`Ticks`]
//! - **Promises**: single-assignment results whose continuations hop between
//!   contexts with ordering and failure propagation preserved
//! - **Lifecycle registries**: everything a plugin creates is closed exactly
//!   once when its scope ends
//! - **Subscriptions**: fluent filters, call budgets and expiry on top of any
//!   [`NotificationSource`]
//!
//! ## Architecture Overview
//!
//! - [`terminable`]: the [`Terminable`] contract, [`TerminableRegistry`] and
//!   [`WeakTerminableRegistry`]
//! - [`scheduler`]: [`Scheduler`], [`SyncContext`], [`AsyncContext`], [`Task`]
//! - [`promise`]: [`Promise`] and its continuation stages
//! - [`events`]: the notification seam plus the in-process [`EventBus`]
//! - [`subscription`]: [`Subscription`], [`SubscriptionBuilder`] and
//!   [`MergedSubscriptionBuilder`]
//! - [`plugin`]: [`PluginScope`] and [`PluginManager`]
//! - [`shutdown`]: [`ShutdownState`], the host's two-phase shutdown flag
//!
//! ## Quick Start Example
//!
//! ```rust,no_run
//! use horizon_toolkit::events::core_key;
//! use horizon_toolkit::{EventBus, Promise, Scheduler, SchedulerConfig, Ticks, TerminableRegistry};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let scheduler = Scheduler::new(SchedulerConfig::default())?;
//! let events = Arc::new(EventBus::new());
//! let registry = TerminableRegistry::named("leaderboard");
//!
//! let tasks = scheduler.clone();
//! events
//!     .subscribe::<String>(core_key("player_joined"))
//!     .bind_with(&registry)
//!     .handler(move |player| {
//!         let player = player.clone();
//!         Promise::supplying_async(&tasks, move || Ok(player.len() as u64))
//!             .then_accept_sync(|score| {
//!                 tracing::info!("score loaded: {score}");
//!                 Ok(())
//!             });
//!         Ok(())
//!     })?;
//!
//! registry.bind(scheduler.run_repeating_sync(|_| Ok(()), Ticks::ONE, Ticks::seconds(5))?);
//!
//! // The host's main loop drives the sync context...
//! scheduler.tick()?;
//! // ...and plugin shutdown releases everything at once.
//! registry.close_and_log();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod plugin;
pub mod promise;
pub mod report;
pub mod scheduler;
pub mod shutdown;
pub mod subscription;
pub mod terminable;
pub mod ticks;

pub use config::{LifecycleConfig, SchedulerConfig, ToolkitConfig};
pub use context::ExecutionContext;
pub use error::{
    CompositeCloseError, EventError, ExecutionError, PluginError, PromiseError, RegistryError,
    SchedulerError, SubscriptionError, ValidationError,
};
pub use events::{EventBus, NotificationSource};
pub use plugin::{Plugin, PluginManager, PluginScope};
pub use promise::Promise;
pub use report::{ErrorHandler, ExecutionFailure, FailureOrigin, TracingErrorHandler};
pub use scheduler::{AsyncContext, Scheduler, SyncContext, Task, TaskId, TaskState};
pub use shutdown::ShutdownState;
pub use subscription::{MergedSubscriptionBuilder, Subscription, SubscriptionBuilder};
pub use terminable::{
    terminable_fn, Terminable, TerminableExt, TerminableRegistry, WeakTerminableRegistry,
};
pub use ticks::{TickRate, Ticks, TICKS_PER_SECOND};

/// Re-export for plugins implementing [`Plugin`].
pub use async_trait::async_trait;
