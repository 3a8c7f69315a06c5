//! # Subscriptions
//!
//! A [`Subscription`] is one handler attached to one notification kind of a
//! [`NotificationSource`](crate::events::NotificationSource), plus the rules
//! deciding when it stops: filters, a call budget, a deadline, and arbitrary
//! expiry predicates. Subscriptions are built with a [`SubscriptionBuilder`]
//! and are [`Terminable`], so binding one into a registry guarantees it is
//! unregistered when the owning scope closes.
//!
//! A [`MergedSubscriptionBuilder`] builds one subscription over several
//! kinds at once, mapping each kind's payload into a common type.
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use horizon_toolkit::events::{core_key, EventBus};
//! # use horizon_toolkit::TerminableRegistry;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = Arc::new(EventBus::new());
//! let registry = TerminableRegistry::named("greeter");
//!
//! bus.subscribe::<String>(core_key("chat"))
//!     .filter(|line| !line.is_empty())
//!     .expire_after(3)
//!     .bind_with(&registry)
//!     .handler(|line| {
//!         println!("chat: {line}");
//!         Ok(())
//!     })?;
//! # Ok(())
//! # }
//! ```

mod builder;
mod merged;

pub use builder::SubscriptionBuilder;
pub use merged::MergedSubscriptionBuilder;

use crate::error::ExecutionError;
use crate::events::{log_type_mismatch, Event, EventHandler};
use crate::report::{guard, ExecutionFailure, FailureOrigin, Reporter};
use crate::scheduler::Scheduler;
use crate::terminable::{Ownership, Terminable};
use std::any::TypeId;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, trace};

pub(crate) type Filter<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;
pub(crate) type ExpiryTest<E> = Box<dyn Fn(&Subscription<E>, &E) -> bool + Send + Sync>;
pub(crate) type Handler<E> = Box<dyn Fn(&Subscription<E>, &E) -> anyhow::Result<()> + Send + Sync>;
type Unregister = Box<dyn FnOnce() -> bool + Send>;

/// A live registration with a notification source.
pub struct Subscription<E> {
    shared: Arc<SubscriptionShared<E>>,
}

pub(crate) struct SubscriptionShared<E> {
    name: String,
    active: AtomicBool,
    /// Handler invocations that have finished.
    calls: AtomicU64,
    /// Handler invocations admitted against `max_calls`.
    reserved: AtomicU64,
    max_calls: Option<u64>,
    expires_at: Option<Instant>,
    filters: Vec<Filter<E>>,
    expiry: Vec<ExpiryTest<E>>,
    handler: Handler<E>,
    deactivate_on_error: bool,
    reporter: Reporter,
    scheduler: Option<Scheduler>,
    unregister: Mutex<Option<Unregister>>,
    ownership: Ownership,
}

pub(crate) struct SubscriptionParts<E> {
    pub(crate) name: String,
    pub(crate) max_calls: Option<u64>,
    pub(crate) expires_at: Option<Instant>,
    pub(crate) filters: Vec<Filter<E>>,
    pub(crate) expiry: Vec<ExpiryTest<E>>,
    pub(crate) handler: Handler<E>,
    pub(crate) deactivate_on_error: bool,
    pub(crate) reporter: Reporter,
    pub(crate) scheduler: Option<Scheduler>,
}

impl<E: Send + Sync + 'static> Subscription<E> {
    pub(crate) fn new(parts: SubscriptionParts<E>) -> Self {
        Self {
            shared: Arc::new(SubscriptionShared {
                name: parts.name,
                active: AtomicBool::new(true),
                calls: AtomicU64::new(0),
                reserved: AtomicU64::new(0),
                max_calls: parts.max_calls,
                expires_at: parts.expires_at,
                filters: parts.filters,
                expiry: parts.expiry,
                handler: parts.handler,
                deactivate_on_error: parts.deactivate_on_error,
                reporter: parts.reporter,
                scheduler: parts.scheduler,
                unregister: Mutex::new(None),
                ownership: Ownership::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Number of times the handler has been invoked, successful or not.
    pub fn call_count(&self) -> u64 {
        self.shared.calls.load(Ordering::Acquire)
    }

    /// Deactivates the subscription and detaches it from its source.
    ///
    /// Returns `true` only for the call that actually deactivated it.
    pub fn unregister(&self) -> bool {
        let was_active = self.shared.active.swap(false, Ordering::AcqRel);
        self.detach();
        if was_active {
            debug!("🔕 Subscription '{}' unregistered after {} call(s)", self.name(), self.call_count());
        }
        was_active
    }

    fn detach(&self) {
        let unregister = self
            .shared
            .unregister
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(unregister) = unregister {
            unregister();
        }
    }

    /// Installs the source-side unregistration once registration succeeded.
    pub(crate) fn attach(&self, unregister: Unregister) {
        *self
            .shared
            .unregister
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(unregister);
        // Expired while registration was still in flight.
        if !self.is_active() {
            self.detach();
        }
    }

    fn expired_before(&self, event: &E) -> bool {
        if self.shared.expires_at.is_some_and(|deadline| Instant::now() >= deadline) {
            return true;
        }
        self.shared.expiry.iter().any(|test| test(self, event))
    }

    fn expired_after(&self, event: &E) -> bool {
        if let Some(max) = self.shared.max_calls {
            if self.call_count() >= max {
                return true;
            }
        }
        self.shared.expiry.iter().any(|test| test(self, event))
    }

    /// Takes one slot of the call budget, if any is left.
    fn reserve_call(&self) -> bool {
        let Some(max) = self.shared.max_calls else {
            return true;
        };
        self.shared
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |reserved| {
                (reserved < max).then_some(reserved + 1)
            })
            .is_ok()
    }

    fn report(&self, error: ExecutionError) {
        let context = self
            .shared
            .scheduler
            .as_ref()
            .map(Scheduler::current_context);
        self.shared.reporter.report(ExecutionFailure::new(
            FailureOrigin::Subscription {
                name: self.shared.name.clone(),
            },
            context,
            error,
        ));
    }

    /// Runs one notification through the subscription.
    pub(crate) fn dispatch(&self, event: &E) {
        if !self.is_active() {
            return;
        }

        let admitted = guard(|| {
            if self.expired_before(event) {
                return Ok(None);
            }
            Ok(Some(self.shared.filters.iter().all(|filter| filter(event))))
        });
        match admitted {
            Ok(Some(true)) => {}
            Ok(Some(false)) => return,
            Ok(None) => {
                self.unregister();
                return;
            }
            Err(error) => {
                self.report(error);
                return;
            }
        }

        if !self.reserve_call() {
            self.unregister();
            return;
        }

        let outcome = guard(|| (self.shared.handler)(self, event));
        self.shared.calls.fetch_add(1, Ordering::AcqRel);

        if let Err(error) = outcome {
            self.report(error);
            if self.shared.deactivate_on_error {
                self.unregister();
                return;
            }
        }

        match guard(|| Ok(self.expired_after(event))) {
            Ok(true) => {
                self.unregister();
            }
            Ok(false) => {}
            Err(error) => self.report(error),
        }
    }
}

impl<E> Clone for Subscription<E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<E: Send + Sync + 'static> Terminable for Subscription<E> {
    fn close(&self) -> anyhow::Result<()> {
        self.unregister();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        !self.is_active()
    }

    fn ownership(&self) -> Option<&Ownership> {
        Some(&self.shared.ownership)
    }
}

impl<E: Send + Sync + 'static> fmt::Debug for Subscription<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name())
            .field("active", &self.is_active())
            .field("calls", &self.call_count())
            .field("max_calls", &self.shared.max_calls)
            .finish()
    }
}

/// Decodes raw notifications and feeds them to a subscription.
pub(crate) struct SubscriptionHandler<E> {
    subscription: Subscription<E>,
}

impl<E: Event> SubscriptionHandler<E> {
    pub(crate) fn new(subscription: Subscription<E>) -> Self {
        Self { subscription }
    }
}

impl<E: Event> EventHandler for SubscriptionHandler<E> {
    fn handle(&self, data: &[u8]) -> Result<(), crate::error::EventError> {
        if !self.subscription.is_active() {
            trace!("Skipping inactive subscription '{}'", self.subscription.name());
            return Ok(());
        }
        match E::deserialize(data) {
            Ok(event) => self.subscription.dispatch(&event),
            Err(e) => log_type_mismatch(self.subscription.name(), E::type_name(), data, &e),
        }
        Ok(())
    }

    fn expected_type_id(&self) -> TypeId {
        TypeId::of::<E>()
    }

    fn handler_name(&self) -> &str {
        self.subscription.name()
    }
}
