//! # Plugin scopes
//!
//! A [`PluginScope`] is what a plugin sees of the host while it is enabled:
//! its own top-level [`TerminableRegistry`], the shared [`Scheduler`] and the
//! host [`EventBus`]. Everything the plugin binds into its scope is released
//! when the plugin is disabled or the host shuts down, whichever happens
//! first.
//!
//! [`PluginManager`] enables plugins in order and disables them in reverse.

use crate::config::LifecycleConfig;
use crate::error::PluginError;
use crate::events::{Event, EventBus};
use crate::scheduler::{Scheduler, Task};
use crate::shutdown::ShutdownState;
use crate::subscription::{MergedSubscriptionBuilder, SubscriptionBuilder};
use crate::terminable::{BindingId, Terminable, TerminableModule, TerminableRegistry};
use async_trait::async_trait;
use compact_str::CompactString;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, trace, warn};
use uuid::Uuid;

/// A plugin hosted on the tick thread.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique, stable name used for logging and event keys.
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    /// Sets the plugin up. Anything bound into `scope` lives until the plugin
    /// is disabled.
    async fn on_enable(&mut self, scope: &PluginScope) -> Result<(), PluginError>;

    /// Called before the scope closes.
    async fn on_disable(&mut self, _scope: &PluginScope) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Resources owned by one enabled plugin.
#[derive(Clone)]
pub struct PluginScope {
    id: Uuid,
    name: String,
    registry: TerminableRegistry,
    scheduler: Scheduler,
    events: Arc<EventBus>,
}

impl PluginScope {
    /// Opens a scope that closes on host shutdown and, when enabled,
    /// periodically drops closed entries from its registry.
    pub fn new(
        name: impl Into<String>,
        scheduler: &Scheduler,
        events: &Arc<EventBus>,
        shutdown: &ShutdownState,
        lifecycle: &LifecycleConfig,
    ) -> Result<Self, PluginError> {
        let name = name.into();
        let registry = shutdown.attach(TerminableRegistry::named(name.clone()));
        let scope = Self {
            id: Uuid::new_v4(),
            name,
            registry,
            scheduler: scheduler.clone(),
            events: events.clone(),
        };

        if lifecycle.cleanup_enabled() {
            scope.schedule_cleanup(lifecycle)?;
        }
        Ok(scope)
    }

    fn schedule_cleanup(&self, lifecycle: &LifecycleConfig) -> Result<Task, PluginError> {
        let rate = self.scheduler.tick_rate();
        let delay = rate.ticks_in(Duration::from_secs(lifecycle.cleanup_delay_secs));
        let interval = rate.ticks_in(Duration::from_secs(lifecycle.cleanup_interval_secs));
        let registry = self.registry.clone();
        let task = self.scheduler.run_repeating_async(
            move |_| {
                registry.cleanup();
                trace!("🧽 [{}] registry sweep done, {} live", registry.name(), registry.len());
                Ok(())
            },
            delay,
            interval,
        )?;
        Ok(self.registry.bind(task))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &TerminableRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Ties `terminable` to the plugin's lifetime.
    pub fn bind<T>(&self, terminable: T) -> T
    where
        T: Terminable + Clone + 'static,
    {
        self.registry.bind(terminable)
    }

    pub fn bind_owned<T>(&self, terminable: T) -> BindingId
    where
        T: Terminable + 'static,
    {
        self.registry.bind_owned(terminable)
    }

    pub fn bind_module<M: TerminableModule>(&self, module: M) -> M {
        self.registry.bind_module(module)
    }

    /// Starts a subscription on the host bus that reports through the
    /// scheduler and is bound to this scope.
    pub fn subscribe<E: Event>(&self, kind: CompactString) -> SubscriptionBuilder<CompactString, E> {
        let name = format!("{}:{}", self.name, kind);
        self.events
            .subscribe::<E>(kind)
            .name(name)
            .with_scheduler(&self.scheduler)
            .bind_with(&self.registry)
    }

    /// Starts a merged subscription on the host bus, reporting and bound the
    /// same way as [`subscribe`](Self::subscribe).
    pub fn merge<T: Send + Sync + 'static>(&self, name: &str) -> MergedSubscriptionBuilder<CompactString, T> {
        self.events
            .merge::<T>()
            .name(format!("{}:{}", self.name, name))
            .with_scheduler(&self.scheduler)
            .bind_with(&self.registry)
    }

    pub fn is_closed(&self) -> bool {
        self.registry.is_closed()
    }

    /// Releases everything the plugin bound and returns the close failures.
    pub fn close(&self) -> Vec<anyhow::Error> {
        self.registry.close_and_report()
    }

    /// Releases everything the plugin bound, sending each close failure to
    /// the scheduler's error handler. Returns the number of failures.
    pub fn close_reported(&self) -> usize {
        self.registry.close_and_report_to(&self.scheduler.reporter())
    }
}

impl fmt::Debug for PluginScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginScope")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("bindings", &self.registry.len())
            .field("closed", &self.registry.is_closed())
            .finish()
    }
}

struct LoadedPlugin {
    plugin: Box<dyn Plugin>,
    scope: PluginScope,
}

/// Enables plugins against a shared scheduler and event bus.
pub struct PluginManager {
    scheduler: Scheduler,
    events: Arc<EventBus>,
    shutdown: ShutdownState,
    lifecycle: LifecycleConfig,
    /// In enable order.
    plugins: Vec<LoadedPlugin>,
}

impl PluginManager {
    pub fn new(
        scheduler: Scheduler,
        events: Arc<EventBus>,
        shutdown: ShutdownState,
        lifecycle: LifecycleConfig,
    ) -> Self {
        Self {
            scheduler,
            events,
            shutdown,
            lifecycle,
            plugins: Vec::new(),
        }
    }

    /// Opens a scope for `plugin` and enables it. A plugin that fails to
    /// enable has its scope closed before the error is returned.
    pub async fn enable(&mut self, mut plugin: Box<dyn Plugin>) -> Result<(), PluginError> {
        let name = plugin.name().to_string();
        if self.is_plugin_enabled(&name) {
            return Err(PluginError::AlreadyEnabled(name));
        }
        if self.shutdown.is_shutdown_initiated() {
            return Err(PluginError::InitializationFailed(format!(
                "{name}: host is shutting down"
            )));
        }

        info!("🔧 Enabling plugin: {} v{}", name, plugin.version());
        let scope = PluginScope::new(
            name.clone(),
            &self.scheduler,
            &self.events,
            &self.shutdown,
            &self.lifecycle,
        )?;

        if let Err(e) = plugin.on_enable(&scope).await {
            error!("❌ Plugin {} failed to enable: {}", name, e);
            scope.close_reported();
            self.shutdown.registry().cleanup();
            return Err(e);
        }

        info!("✅ Plugin enabled: {} ({} bindings)", name, scope.registry().len());
        self.plugins.push(LoadedPlugin { plugin, scope });
        Ok(())
    }

    /// Enables every plugin in order, stopping at the first failure.
    pub async fn enable_all(&mut self, plugins: Vec<Box<dyn Plugin>>) -> Result<(), PluginError> {
        for plugin in plugins {
            self.enable(plugin).await?;
        }
        info!("🎉 {} plugin(s) enabled", self.plugins.len());
        Ok(())
    }

    /// Disables one plugin and closes its scope.
    pub async fn disable(&mut self, name: &str) -> Result<(), PluginError> {
        let index = self
            .plugins
            .iter()
            .position(|loaded| loaded.plugin.name() == name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        let loaded = self.plugins.remove(index);
        Self::shut_down(loaded).await;
        self.shutdown.registry().cleanup();
        Ok(())
    }

    /// Disables every plugin, most recently enabled first.
    pub async fn disable_all(&mut self) {
        info!("🛑 Disabling {} plugins", self.plugins.len());
        while let Some(loaded) = self.plugins.pop() {
            Self::shut_down(loaded).await;
        }
        self.shutdown.registry().cleanup();
    }

    async fn shut_down(mut loaded: LoadedPlugin) {
        let name = loaded.plugin.name().to_string();
        info!("🛑 Disabling plugin: {}", name);
        if let Err(e) = loaded.plugin.on_disable(&loaded.scope).await {
            error!("❌ Plugin {} failed to disable cleanly: {}", name, e);
        }
        match loaded.scope.close_reported() {
            0 => info!("✅ Plugin disabled: {}", name),
            failures => warn!("⚠️ Plugin {} disabled with {} close failure(s)", name, failures),
        }
    }

    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins
            .iter()
            .map(|loaded| loaded.plugin.name().to_string())
            .collect()
    }

    pub fn is_plugin_enabled(&self, name: &str) -> bool {
        self.plugins.iter().any(|loaded| loaded.plugin.name() == name)
    }

    pub fn scope(&self, name: &str) -> Option<&PluginScope> {
        self.plugins
            .iter()
            .find(|loaded| loaded.plugin.name() == name)
            .map(|loaded| &loaded.scope)
    }
}

impl fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugins", &self.plugin_names())
            .finish_non_exhaustive()
    }
}
