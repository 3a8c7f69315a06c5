use super::builder::{subscription_rules, SubscriptionRules};
use super::Subscription;
use crate::error::{EventError, SubscriptionError, ValidationError};
use crate::events::{log_type_mismatch, Event, EventBus, EventHandler, HandlerId, NotificationSource};
use std::any::TypeId;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, trace};

type MakeHandler<T> = Box<dyn FnOnce(Subscription<T>) -> Arc<dyn EventHandler> + Send>;

struct Binding<K, T> {
    kind: K,
    type_name: &'static str,
    make: MakeHandler<T>,
}

/// Builds one [`Subscription`] fed by several notification kinds.
///
/// Each kind is bound with its own payload type and a mapping into the
/// common type `T` the handler sees. Filters, expiry and the call budget
/// apply to the merged stream: a subscription limited to three calls stops
/// after three notifications in total, whichever kinds they came from.
/// Unregistering detaches it from every bound kind.
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use horizon_toolkit::events::{core_key, EventBus};
/// # #[derive(Debug, serde::Serialize, serde::Deserialize)]
/// # struct Joined { player: String }
/// # #[derive(Debug, serde::Serialize, serde::Deserialize)]
/// # struct Left { player: String, reason: String }
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = Arc::new(EventBus::new());
/// bus.merge::<String>()
///     .bind_kind(core_key("player_joined"), |event: Joined| event.player)
///     .bind_kind(core_key("player_left"), |event: Left| event.player)
///     .handler(|player| {
///         println!("roster changed: {player}");
///         Ok(())
///     })?;
/// # Ok(())
/// # }
/// ```
pub struct MergedSubscriptionBuilder<K, T> {
    source: Arc<dyn NotificationSource<K>>,
    bindings: Vec<Binding<K, T>>,
    rules: SubscriptionRules<T>,
}

impl<K, T> MergedSubscriptionBuilder<K, T>
where
    K: Clone + fmt::Display + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    pub fn new(source: Arc<dyn NotificationSource<K>>) -> Self {
        Self {
            source,
            bindings: Vec::new(),
            rules: SubscriptionRules::new(),
        }
    }

    /// Feeds notifications of `kind`, decoded as `E` and converted by `map`,
    /// into the subscription.
    pub fn bind_kind<E, M>(mut self, kind: K, map: M) -> Self
    where
        E: Event,
        M: Fn(E) -> T + Send + Sync + 'static,
    {
        let map = Arc::new(map);
        self.bindings.push(Binding {
            kind,
            type_name: E::type_name(),
            make: Box::new(move |subscription: Subscription<T>| {
                let handler: Arc<dyn EventHandler> = Arc::new(MappedHandler {
                    subscription,
                    map,
                    _event: PhantomData::<fn(E)>,
                });
                handler
            }),
        });
        self
    }

    subscription_rules!(T);

    /// Like [`handler`](Self::handler), with access to the subscription itself.
    ///
    /// Registration is all or nothing: if any kind fails to register, the
    /// kinds registered before it are unregistered again.
    pub fn bi_handler<F>(mut self, handler: F) -> Result<Subscription<T>, SubscriptionError>
    where
        F: Fn(&Subscription<T>, &T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        if self.bindings.is_empty() {
            self.rules.reject(ValidationError::NoBoundKinds);
        }
        let registry = self.rules.take_registry();
        let kinds = self
            .bindings
            .iter()
            .map(|binding| format!("{}({})", binding.kind, binding.type_name))
            .collect::<Vec<_>>()
            .join("+");
        let subscription = self.rules.build(Box::new(handler), || format!("merged-{kinds}-listener"))?;

        let source = self.source;
        let mut registered: Vec<(K, HandlerId)> = Vec::with_capacity(self.bindings.len());
        for binding in self.bindings {
            let dispatcher = (binding.make)(subscription.clone());
            match source.register(binding.kind.clone(), dispatcher) {
                Ok(id) => registered.push((binding.kind, id)),
                Err(error) => {
                    for (kind, id) in &registered {
                        source.unregister(kind, *id);
                    }
                    subscription.unregister();
                    return Err(SubscriptionError::Registration(error));
                }
            }
        }

        let count = registered.len();
        subscription.attach(Box::new(move || {
            registered
                .iter()
                .fold(false, |any, (kind, id)| source.unregister(kind, *id) || any)
        }));
        debug!(
            "🔔 Merged subscription '{}' registered for {} kind(s)",
            subscription.name(),
            count
        );

        SubscriptionRules::finish(registry, &subscription);
        Ok(subscription)
    }
}

impl<K, T> fmt::Debug for MergedSubscriptionBuilder<K, T>
where
    K: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: Vec<String> = self.bindings.iter().map(|binding| binding.kind.to_string()).collect();
        f.debug_struct("MergedSubscriptionBuilder")
            .field("kinds", &kinds)
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}

/// Decodes one bound kind and converts it into the merged type.
struct MappedHandler<E, T, M> {
    subscription: Subscription<T>,
    map: Arc<M>,
    _event: PhantomData<fn(E)>,
}

impl<E, T, M> EventHandler for MappedHandler<E, T, M>
where
    E: Event,
    T: Send + Sync + 'static,
    M: Fn(E) -> T + Send + Sync + 'static,
{
    fn handle(&self, data: &[u8]) -> Result<(), EventError> {
        if !self.subscription.is_active() {
            trace!("Skipping inactive subscription '{}'", self.subscription.name());
            return Ok(());
        }
        match E::deserialize(data) {
            Ok(event) => self.subscription.dispatch(&(self.map)(event)),
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

impl<K> EventBus<K>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
{
    /// Starts a subscription fed by several kinds of this bus.
    pub fn merge<T: Send + Sync + 'static>(self: &Arc<Self>) -> MergedSubscriptionBuilder<K, T> {
        let source: Arc<dyn NotificationSource<K>> = self.clone();
        MergedSubscriptionBuilder::new(source)
    }
}
