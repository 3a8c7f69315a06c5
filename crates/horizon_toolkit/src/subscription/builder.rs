use super::{ExpiryTest, Filter, Handler, Subscription, SubscriptionHandler, SubscriptionParts};
use crate::error::{SubscriptionError, ValidationError};
use crate::events::{Event, EventBus, NotificationSource};
use crate::report::{ErrorHandler, Reporter};
use crate::scheduler::Scheduler;
use crate::terminable::TerminableRegistry;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Settings shared by every subscription builder, collected until the
/// handler is supplied.
pub(crate) struct SubscriptionRules<E> {
    pub(super) name: Option<String>,
    pub(super) filters: Vec<Filter<E>>,
    pub(super) expiry: Vec<ExpiryTest<E>>,
    pub(super) max_calls: Option<u64>,
    pub(super) lifetime: Option<Duration>,
    pub(super) error_handler: Option<Arc<dyn ErrorHandler>>,
    pub(super) deactivate_on_error: bool,
    pub(super) scheduler: Option<Scheduler>,
    pub(super) registry: Option<TerminableRegistry>,
    pub(super) invalid: Option<ValidationError>,
}

impl<E: Send + Sync + 'static> SubscriptionRules<E> {
    pub(crate) fn new() -> Self {
        Self {
            name: None,
            filters: Vec::new(),
            expiry: Vec::new(),
            max_calls: None,
            lifetime: None,
            error_handler: None,
            deactivate_on_error: false,
            scheduler: None,
            registry: None,
            invalid: None,
        }
    }

    pub(crate) fn reject(&mut self, error: ValidationError) {
        self.invalid.get_or_insert(error);
    }

    pub(super) fn expire_after(&mut self, calls: u64) {
        if calls == 0 {
            self.reject(ValidationError::InvalidExpiryCount);
        } else {
            self.max_calls = Some(self.max_calls.map_or(calls, |max| max.min(calls)));
        }
    }

    pub(super) fn expire_after_duration(&mut self, lifetime: Duration) {
        if lifetime.is_zero() {
            self.reject(ValidationError::InvalidExpiryDuration);
        } else {
            self.lifetime = Some(self.lifetime.map_or(lifetime, |current| current.min(lifetime)));
        }
    }

    /// Builds the inactive-until-attached subscription, or the first
    /// configuration error.
    pub(crate) fn build(
        self,
        handler: Handler<E>,
        default_name: impl FnOnce() -> String,
    ) -> Result<Subscription<E>, SubscriptionError> {
        if let Some(error) = self.invalid {
            return Err(error.into());
        }

        let reporter = match (self.error_handler, &self.scheduler) {
            (Some(handler), _) => Reporter::new(handler),
            (None, Some(scheduler)) => scheduler.reporter(),
            (None, None) => Reporter::default(),
        };

        Ok(Subscription::new(SubscriptionParts {
            name: self.name.unwrap_or_else(default_name),
            max_calls: self.max_calls,
            expires_at: self.lifetime.map(|lifetime| Instant::now() + lifetime),
            filters: self.filters,
            expiry: self.expiry,
            handler,
            deactivate_on_error: self.deactivate_on_error,
            reporter,
            scheduler: self.scheduler,
        }))
    }

    /// Binds the registered subscription into the requested registry, if any.
    pub(crate) fn finish(registry: Option<TerminableRegistry>, subscription: &Subscription<E>) {
        if let Some(registry) = registry {
            registry.bind(subscription.clone());
        }
    }

    pub(crate) fn take_registry(&mut self) -> Option<TerminableRegistry> {
        self.registry.take()
    }
}

impl<E> fmt::Debug for SubscriptionRules<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRules")
            .field("name", &self.name)
            .field("filters", &self.filters.len())
            .field("max_calls", &self.max_calls)
            .field("lifetime", &self.lifetime)
            .field("invalid", &self.invalid)
            .finish_non_exhaustive()
    }
}

/// Fluent setters shared by [`SubscriptionBuilder`] and
/// [`MergedSubscriptionBuilder`](super::MergedSubscriptionBuilder).
macro_rules! subscription_rules {
    ($event:ty) => {
        /// Name used in logs and failure reports.
        pub fn name(mut self, name: impl Into<String>) -> Self {
            self.rules.name = Some(name.into());
            self
        }

        /// Only notifications passing every filter reach the handler.
        pub fn filter<F>(mut self, filter: F) -> Self
        where
            F: Fn(&$event) -> bool + Send + Sync + 'static,
        {
            self.rules.filters.push(Box::new(filter));
            self
        }

        /// Expires after the handler has been invoked `calls` times.
        pub fn expire_after(mut self, calls: u64) -> Self {
            self.rules.expire_after(calls);
            self
        }

        /// Expires once `lifetime` has elapsed since the subscription was built.
        pub fn expire_after_duration(mut self, lifetime: std::time::Duration) -> Self {
            self.rules.expire_after_duration(lifetime);
            self
        }

        /// Expires as soon as `test` holds, checked before and after each dispatch.
        pub fn expire_if<F>(mut self, test: F) -> Self
        where
            F: Fn(&Subscription<$event>, &$event) -> bool + Send + Sync + 'static,
        {
            self.rules.expiry.push(Box::new(test));
            self
        }

        /// Routes handler failures to `handler` instead of the scheduler's sink.
        pub fn error_handler(mut self, handler: impl crate::report::ErrorHandler) -> Self {
            self.rules.error_handler = Some(std::sync::Arc::new(handler));
            self
        }

        /// Unregisters the subscription after the first handler failure.
        pub fn deactivate_on_error(mut self) -> Self {
            self.rules.deactivate_on_error = true;
            self
        }

        /// Reports failures through `scheduler`, tagged with the context the
        /// handler ran on.
        pub fn with_scheduler(mut self, scheduler: &crate::scheduler::Scheduler) -> Self {
            self.rules.scheduler = Some(scheduler.clone());
            self
        }

        /// Binds the built subscription into `registry`.
        pub fn bind_with(mut self, registry: &crate::terminable::TerminableRegistry) -> Self {
            self.rules.registry = Some(registry.clone());
            self
        }

        /// Registers `handler` and returns the live subscription.
        pub fn handler<F>(self, handler: F) -> Result<Subscription<$event>, crate::error::SubscriptionError>
        where
            F: Fn(&$event) -> anyhow::Result<()> + Send + Sync + 'static,
        {
            self.bi_handler(move |_, event| handler(event))
        }
    };
}

pub(crate) use subscription_rules;

/// Fluent construction of a [`Subscription`].
///
/// Configuration errors are remembered and surface from the terminal
/// [`handler`](Self::handler) call, so chains never need intermediate `?`.
pub struct SubscriptionBuilder<K, E> {
    source: Arc<dyn NotificationSource<K>>,
    kind: K,
    rules: SubscriptionRules<E>,
}

impl<K, E> SubscriptionBuilder<K, E>
where
    K: Clone + Send + Sync + 'static,
    E: Event,
{
    pub fn new(source: Arc<dyn NotificationSource<K>>, kind: K) -> Self {
        Self {
            source,
            kind,
            rules: SubscriptionRules::new(),
        }
    }

    subscription_rules!(E);

    /// Like [`handler`](Self::handler), with access to the subscription itself.
    pub fn bi_handler<F>(mut self, handler: F) -> Result<Subscription<E>, SubscriptionError>
    where
        F: Fn(&Subscription<E>, &E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let registry = self.rules.take_registry();
        let subscription = self
            .rules
            .build(Box::new(handler), || format!("{}-listener", E::type_name()))?;

        let dispatcher = Arc::new(SubscriptionHandler::new(subscription.clone()));
        let id = self.source.register(self.kind.clone(), dispatcher)?;
        let source = self.source;
        let kind = self.kind;
        subscription.attach(Box::new(move || source.unregister(&kind, id)));
        debug!("🔔 Subscription '{}' registered as {}", subscription.name(), id);

        SubscriptionRules::finish(registry, &subscription);
        Ok(subscription)
    }
}

impl<K, E> fmt::Debug for SubscriptionBuilder<K, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionBuilder")
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}

impl<K> EventBus<K>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
{
    /// Starts a subscription to `kind` on this bus.
    pub fn subscribe<E: Event>(self: &Arc<Self>, kind: K) -> SubscriptionBuilder<K, E> {
        let source: Arc<dyn NotificationSource<K>> = self.clone();
        SubscriptionBuilder::new(source, kind)
    }
}
