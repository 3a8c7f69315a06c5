use async_trait::async_trait;
use horizon_toolkit::events::{core_key, plugin_key};
use horizon_toolkit::{Plugin, PluginError, PluginScope, Promise, Ticks};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// A simple greeter plugin that welcomes players and announces activities
pub struct GreeterPlugin {
    name: String,
    announce_every: Ticks,
    welcome_count: Arc<AtomicU32>,
}

impl GreeterPlugin {
    pub fn new() -> Self {
        Self::with_announcements(Ticks::seconds(60))
    }

    /// Announces the welcome tally every `interval` ticks.
    pub fn with_announcements(interval: Ticks) -> Self {
        info!("🎉 GreeterPlugin: Creating new instance");
        Self {
            name: "greeter".to_string(),
            announce_every: interval,
            welcome_count: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Shared counter of players welcomed so far.
    pub fn welcome_count(&self) -> Arc<AtomicU32> {
        self.welcome_count.clone()
    }
}

impl Default for GreeterPlugin {
    fn default() -> Self {
        Self::new()
    }
}

/// Emitted by the host once per game tick as `core:server_tick`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerTick {
    pub tick: u64,
}

/// Emitted by the host as `core:player_joined`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerJoined {
    pub player: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WelcomeEvent {
    pub player: String,
    pub welcome_message: String,
    pub welcome_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GreeterOnline {
    pub plugin: String,
    pub version: String,
    pub message: String,
}

fn welcome_message(player: &str, count: u32) -> String {
    match count {
        1 => format!("Welcome, {player}! You are our very first visitor."),
        n => format!("Welcome, {player}! You are visitor #{n}."),
    }
}

#[async_trait]
impl Plugin for GreeterPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    async fn on_enable(&mut self, scope: &PluginScope) -> Result<(), PluginError> {
        info!("👋 GreeterPlugin: Registering event handlers...");

        scope
            .subscribe::<ServerTick>(core_key("server_tick"))
            .name("greeter:first-tick")
            .expire_after(1)
            .handler(|tick| {
                info!("👋 GreeterPlugin: Server is live (tick {}). Ready to welcome players!", tick.tick);
                Ok(())
            })?;

        let welcomes = self.welcome_count.clone();
        let handler_scope = scope.clone();
        scope
            .subscribe::<PlayerJoined>(core_key("player_joined"))
            .filter(|event| !event.player.trim().is_empty())
            .handler(move |event| {
                let count = welcomes.fetch_add(1, Ordering::SeqCst) + 1;
                let player = event.player.clone();
                debug!("👋 GreeterPlugin: Preparing welcome for {}", player);

                let events = handler_scope.events().clone();
                let welcome = Promise::supplying_async(handler_scope.scheduler(), move || {
                    Ok(WelcomeEvent {
                        welcome_message: welcome_message(&player, count),
                        player,
                        welcome_count: count,
                    })
                })
                .then_accept_sync(move |welcome| {
                    info!("👋 GreeterPlugin: {}", welcome.welcome_message);
                    events.emit(&plugin_key("greeter", "welcome"), &welcome)?;
                    Ok(())
                });
                handler_scope.bind(welcome);
                Ok(())
            })?;

        let tally = self.welcome_count.clone();
        scope.bind(scope.scheduler().run_repeating_sync(
            move |task| {
                info!(
                    "📣 GreeterPlugin: {} player(s) welcomed so far (announcement #{})",
                    tally.load(Ordering::SeqCst),
                    task.times_ran() + 1
                );
                Ok(())
            },
            self.announce_every,
            self.announce_every,
        )?);

        scope
            .events()
            .emit(
                &plugin_key("greeter", "startup"),
                &GreeterOnline {
                    plugin: self.name.clone(),
                    version: self.version().to_string(),
                    message: "Greeter plugin is now online!".to_string(),
                },
            )
            .map_err(|e| PluginError::InitializationFailed(e.to_string()))?;

        info!("👋 GreeterPlugin: ✅ All handlers registered successfully!");
        Ok(())
    }

    async fn on_disable(&mut self, _scope: &PluginScope) -> Result<(), PluginError> {
        info!(
            "👋 GreeterPlugin: Shutting down after welcoming {} player(s). Farewell!",
            self.welcome_count.load(Ordering::SeqCst)
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use horizon_toolkit::{
        EventBus, LifecycleConfig, PluginManager, Scheduler, SchedulerConfig, ShutdownState,
    };
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    fn scheduler() -> Scheduler {
        Scheduler::new(SchedulerConfig {
            ticks_per_second: 100,
            worker_threads: 2,
            shutdown_timeout_ms: 500,
            ..SchedulerConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_welcome_message() {
        assert!(welcome_message("alex", 1).contains("very first"));
        assert!(welcome_message("sam", 7).contains("#7"));
    }

    #[tokio::test]
    async fn test_greeter_welcomes_players() {
        let scheduler = scheduler();
        let events = Arc::new(EventBus::new());
        let shutdown = ShutdownState::new();
        let mut manager = PluginManager::new(
            scheduler.clone(),
            events.clone(),
            shutdown.clone(),
            LifecycleConfig::default(),
        );

        let welcomed = Arc::new(Mutex::new(Vec::new()));
        let sink = welcomed.clone();
        events
            .on(plugin_key("greeter", "welcome"), move |event: WelcomeEvent| {
                sink.lock().unwrap().push(event);
                Ok(())
            })
            .unwrap();

        let plugin = GreeterPlugin::with_announcements(Ticks(5));
        let count = plugin.welcome_count();
        manager.enable(Box::new(plugin)).await.unwrap();

        scheduler.tick().unwrap();
        events
            .emit(&core_key("player_joined"), &PlayerJoined { player: "alex".into() })
            .unwrap();
        events
            .emit(&core_key("player_joined"), &PlayerJoined { player: "  ".into() })
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while welcomed.lock().unwrap().is_empty() {
            assert!(Instant::now() < deadline, "welcome never arrived");
            scheduler.tick().unwrap();
            std::thread::sleep(Duration::from_millis(2));
        }

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(welcomed.lock().unwrap()[0].player, "alex");

        manager.disable_all().await;
        events
            .emit(&core_key("player_joined"), &PlayerJoined { player: "sam".into() })
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        info!("✅ Greeter plugin test passed");
    }
}
