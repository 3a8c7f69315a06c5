//! Main application logic and lifecycle management.
//!
//! The `Application` owns the scheduler, the event bus and the plugin manager.
//! A dedicated `horizon-main` thread acts as the sync context: it emits
//! `core:server_tick` and drains the scheduler's sync queue once per tick.

use crate::{
    cli::CliArgs,
    config::AppConfig,
    logging::display_banner,
    signals::{wait_for_shutdown_signal, wait_for_shutdown_signal_silent},
};
use horizon_toolkit::events::core_key;
use horizon_toolkit::{EventBus, Plugin, PluginManager, Scheduler, ShutdownState};
use plugin_greeter::GreeterPlugin;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Emitted on `core:server_tick` at the start of every main loop iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerTickEvent {
    pub tick: u64,
}

/// The host's main thread.
///
/// Owns the sync context for its whole life; nothing else may call
/// [`Scheduler::tick`] while it runs.
pub struct MainLoop {
    stop: Arc<AtomicBool>,
    ticks: Arc<AtomicU64>,
    overruns: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl MainLoop {
    pub fn start(
        scheduler: Scheduler,
        events: Arc<EventBus>,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let ticks = Arc::new(AtomicU64::new(0));
        let overruns = Arc::new(AtomicU64::new(0));

        let handle = {
            let (stop, ticks, overruns) = (stop.clone(), ticks.clone(), overruns.clone());
            std::thread::Builder::new()
                .name("horizon-main".to_string())
                .spawn(move || run_main_loop(scheduler, events, interval, stop, ticks, overruns))?
        };

        Ok(Self {
            stop,
            ticks,
            overruns,
            handle: Some(handle),
        })
    }

    /// Ticks completed so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops after the current tick and waits for the thread to exit.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("❌ Main loop thread panicked");
            }
        }
    }
}

impl Drop for MainLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_main_loop(
    scheduler: Scheduler,
    events: Arc<EventBus>,
    interval: Duration,
    stop: Arc<AtomicBool>,
    ticks: Arc<AtomicU64>,
    overruns: Arc<AtomicU64>,
) {
    if let Err(e) = scheduler.sync_context().bind_current_thread() {
        error!("❌ Main loop could not claim the sync context: {}", e);
        return;
    }
    info!("⏱️ Main loop started ({:?} per tick)", interval);

    let tick_event = core_key("server_tick");
    while !stop.load(Ordering::Acquire) {
        let started = Instant::now();
        let tick = ticks.load(Ordering::Relaxed) + 1;

        if let Err(e) = events.emit(&tick_event, &ServerTickEvent { tick }) {
            warn!("⚠️ Failed to emit tick {}: {}", tick, e);
        }
        match scheduler.tick() {
            Ok(ran) if ran > 0 => debug!("Tick {} ran {} sync job(s)", tick, ran),
            Ok(_) => {}
            Err(e) => {
                error!("❌ Sync context rejected tick {}: {}", tick, e);
                break;
            }
        }
        ticks.store(tick, Ordering::Release);

        let elapsed = started.elapsed();
        if elapsed > interval {
            overruns.fetch_add(1, Ordering::Relaxed);
            warn!("⚠️ Tick {} overran its budget: {:?} > {:?}", tick, elapsed, interval);
        } else {
            std::thread::sleep(interval - elapsed);
        }
    }

    info!("⏱️ Main loop stopped after {} ticks", ticks.load(Ordering::Acquire));
}

/// Instantiates a built-in plugin by its configured name.
fn builtin_plugin(name: &str, config: &AppConfig, scheduler: &Scheduler) -> Option<Box<dyn Plugin>> {
    match name {
        "greeter" => {
            let every = scheduler
                .tick_rate()
                .ticks_in(Duration::from_secs(config.plugins.announce_interval_secs));
            Some(Box::new(GreeterPlugin::with_announcements(every)))
        }
        _ => None,
    }
}

/// Main application struct.
pub struct Application {
    config: AppConfig,
    scheduler: Scheduler,
    events: Arc<EventBus>,
    shutdown: ShutdownState,
    plugins: PluginManager,
}

impl Application {
    /// Loads configuration, applies CLI overrides and enables the configured plugins.
    pub async fn new(args: CliArgs) -> Result<Self, Box<dyn std::error::Error>> {
        info!("🔧 Loading configuration from: {}", args.config_path.display());
        let mut config = AppConfig::load_from_file(&args.config_path).await?;
        info!("✅ Configuration loaded successfully from {}", args.config_path.display());

        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }
        if args.json_logs {
            config.logging.json_format = true;
        }
        if let Some(tps) = args.ticks_per_second {
            config.set_ticks_per_second(tps);
        }
        if let Some(workers) = args.worker_threads {
            config.scheduler.worker_threads = workers;
        }

        display_banner();
        Self::with_config(config).await
    }

    /// Builds the host from an already-merged configuration.
    pub async fn with_config(config: AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        if let Err(e) = config.validate() {
            return Err(format!("Configuration validation failed: {e}").into());
        }
        info!("✅ Configuration loaded and validated successfully");

        let scheduler = Scheduler::new(config.scheduler.clone())?;
        let events = Arc::new(EventBus::new());
        let shutdown = ShutdownState::new();
        let mut plugins = PluginManager::new(
            scheduler.clone(),
            events.clone(),
            shutdown.clone(),
            config.lifecycle.clone(),
        );

        for name in &config.plugins.enabled {
            match builtin_plugin(name, &config, &scheduler) {
                Some(plugin) => {
                    if let Err(e) = plugins.enable(plugin).await {
                        error!("❌ Failed to enable plugin {}: {}", name, e);
                    }
                }
                None => warn!("⚠️ Unknown plugin '{}' in configuration, skipping", name),
            }
        }

        info!(
            "🔌 {} plugin(s) enabled: {:?}",
            plugins.plugin_count(),
            plugins.plugin_names()
        );

        Ok(Self {
            config,
            scheduler,
            events,
            shutdown,
            plugins,
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn plugins(&self) -> &PluginManager {
        &self.plugins
    }

    pub fn shutdown_state(&self) -> &ShutdownState {
        &self.shutdown
    }

    /// Starts the main thread.
    pub fn start_main_loop(&self) -> std::io::Result<MainLoop> {
        MainLoop::start(
            self.scheduler.clone(),
            self.events.clone(),
            Duration::from_millis(self.config.server.tick_interval_ms),
        )
    }

    /// Runs until a termination signal arrives, then shuts down in order.
    pub async fn run(mut self) -> Result<(), Box<dyn std::error::Error>> {
        info!("🌟 Starting {}", self.config.server.name);
        self.log_configuration_summary();

        let mut main_loop = self.start_main_loop()?;

        let monitoring_handle = {
            let events = self.events.clone();
            let scheduler = self.scheduler.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(60));
                interval.tick().await;
                let mut last_events_emitted = 0u64;

                loop {
                    interval.tick().await;

                    let stats = events.stats();
                    let events_this_period = stats.events_emitted - last_events_emitted;
                    last_events_emitted = stats.events_emitted;

                    info!(
                        "📊 Host Health - {} events/min | {} handlers | {} live tasks | {} handler failures",
                        events_this_period,
                        stats.total_handlers,
                        scheduler.live_tasks(),
                        stats.handler_failures
                    );
                }
            })
        };

        info!("✅ Horizon is now running!");
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        wait_for_shutdown_signal().await?;

        // merciless shutdown
        tokio::spawn(async move {
            if let Err(e) = wait_for_shutdown_signal_silent().await {
                error!("Failed to set up merciless shutdown signal handler: {e}");
                return;
            }

            warn!("Shutdown handler received again! I'll make this quick.");
            std::process::exit(1);
        });

        monitoring_handle.abort();
        self.shut_down(&mut main_loop).await;
        Ok(())
    }

    /// Orderly teardown.
    ///
    /// Plugins are disabled while the main loop is still ticking so that sync
    /// work queued by their cleanup can run. Only then does the loop stop and
    /// the scheduler release its workers.
    pub async fn shut_down(&mut self, main_loop: &mut MainLoop) {
        info!("🔌 Phase 1: Disabling plugins...");
        self.plugins.disable_all().await;

        info!("🧹 Phase 2: Closing remaining host resources...");
        let errors = self.shutdown.initiate_shutdown();
        if !errors.is_empty() {
            warn!("⚠️ {} resource(s) failed to close cleanly", errors.len());
        }

        info!("⏱️ Phase 3: Stopping main loop...");
        main_loop.stop();
        self.shutdown.complete_shutdown();

        info!("⚡ Phase 4: Stopping scheduler...");
        self.scheduler.shutdown();

        self.log_final_statistics(main_loop);
        info!("✅ Horizon shutdown complete");
    }

    fn log_configuration_summary(&self) {
        info!("📋 Configuration Summary:");
        info!(
            "  ⏱️ Tick rate: {} tps ({}ms)",
            self.config.scheduler.ticks_per_second, self.config.server.tick_interval_ms
        );
        info!(
            "  ⚡ Workers: {} ({} max blocking)",
            self.config.scheduler.worker_threads, self.config.scheduler.max_blocking_threads
        );
        info!(
            "  🧹 Registry cleanup: {} (every {}s)",
            self.config.lifecycle.cleanup_enabled(),
            self.config.lifecycle.cleanup_interval_secs
        );
        info!("  🔌 Plugins: {:?}", self.plugins.plugin_names());
    }

    fn log_final_statistics(&self, main_loop: &MainLoop) {
        let stats = self.events.stats();
        info!("📊 Final Statistics:");
        info!("  - Ticks run: {} ({} overruns)", main_loop.ticks(), main_loop.overruns());
        info!("  - Total events emitted: {}", stats.events_emitted);
        info!("  - Handler failures: {}", stats.handler_failures);
        info!("  - Handlers still registered: {}", stats.total_handlers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fast_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.set_ticks_per_second(100);
        config.scheduler.worker_threads = 2;
        config.scheduler.shutdown_timeout_ms = 500;
        config
    }

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[tokio::test]
    async fn test_main_loop_emits_ticks_and_drains_sync_work() {
        let config = fast_config();
        let scheduler = Scheduler::new(config.scheduler.clone()).unwrap();
        let events = Arc::new(EventBus::new());

        let seen = Arc::new(AtomicU64::new(0));
        let last = seen.clone();
        events
            .on(core_key("server_tick"), move |event: ServerTickEvent| {
                last.store(event.tick, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let ran_on_main = Arc::new(AtomicBool::new(false));
        let flag = ran_on_main.clone();
        let observer = scheduler.clone();
        scheduler.run_sync(move || {
            flag.store(observer.is_sync_thread(), Ordering::SeqCst);
            Ok(())
        });

        let mut main_loop =
            MainLoop::start(scheduler.clone(), events, Duration::from_millis(10)).unwrap();
        assert!(wait_until(|| seen.load(Ordering::SeqCst) >= 3));
        assert!(wait_until(|| ran_on_main.load(Ordering::SeqCst)));

        main_loop.stop();
        assert!(!main_loop.is_running());
        assert!(main_loop.ticks() >= 3);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_plugins_are_skipped() {
        let mut config = fast_config();
        config.plugins.enabled = vec!["greeter".to_string(), "nonexistent".to_string()];

        let app = Application::with_config(config).await.unwrap();
        assert_eq!(app.plugins().plugin_names(), vec!["greeter".to_string()]);

        let mut main_loop = app.start_main_loop().unwrap();
        let mut app = app;
        app.shut_down(&mut main_loop).await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = fast_config();
        config.server.tick_interval_ms = 7;
        assert!(Application::with_config(config).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let mut app = Application::with_config(fast_config()).await.unwrap();
        let mut main_loop = app.start_main_loop().unwrap();

        let host_beats = Arc::new(AtomicUsize::new(0));
        let counter = host_beats.clone();
        let heartbeat = app.shutdown_state().attach(
            app.scheduler()
                .run_repeating_sync(
                    move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    },
                    horizon_toolkit::Ticks::ONE,
                    horizon_toolkit::Ticks::ONE,
                )
                .unwrap(),
        );
        assert!(wait_until(|| host_beats.load(Ordering::SeqCst) >= 2));

        app.shut_down(&mut main_loop).await;

        assert!(app.plugins().plugin_count() == 0);
        assert!(heartbeat.is_cancelled());
        assert!(app.shutdown_state().is_shutdown_complete());
        assert!(app.scheduler().is_shut_down());
        assert_eq!(app.events().handler_count(&core_key("server_tick")), 0);
        assert_eq!(app.scheduler().live_tasks(), 0);
    }
}
