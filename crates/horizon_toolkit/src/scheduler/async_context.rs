//! The worker pool.
//!
//! Async-context work runs on the blocking pool of a tokio runtime, so plugin
//! code is free to block on I/O or burn CPU without stalling the reactor.
//! Delays and intervals are turned into wall-clock timers.

use super::Job;
use crate::config::SchedulerConfig;
use crate::context::ExecutionContext;
use crate::error::SchedulerError;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};
use tokio::task::AbortHandle;
use tracing::{debug, info};

pub struct AsyncContext {
    handle: Handle,
    /// Present when the context built its own runtime.
    runtime: Mutex<Option<Runtime>>,
    available: Arc<AtomicBool>,
    shutdown_timeout: Duration,
}

impl AsyncContext {
    /// Builds a dedicated multi-threaded runtime from `config`.
    pub(crate) fn new(config: &SchedulerConfig) -> Result<Self, SchedulerError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .max_blocking_threads(config.max_blocking_threads)
            .thread_name(config.worker_thread_name.clone())
            .enable_all()
            .build()?;

        info!(
            "🧵 Worker pool started ({} worker threads, up to {} blocking threads)",
            config.worker_threads, config.max_blocking_threads
        );

        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            available: Arc::new(AtomicBool::new(true)),
            shutdown_timeout: config.shutdown_timeout(),
        })
    }

    /// Runs on a runtime owned by someone else.
    pub(crate) fn with_handle(handle: Handle, config: &SchedulerConfig) -> Self {
        Self {
            handle,
            runtime: Mutex::new(None),
            available: Arc::new(AtomicBool::new(true)),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn owns_runtime(&self) -> bool {
        self.runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub(crate) fn availability(&self) -> Arc<AtomicBool> {
        self.available.clone()
    }

    fn unavailable(&self) -> SchedulerError {
        SchedulerError::ContextUnavailable(ExecutionContext::Async)
    }

    /// Runs `job` on the blocking pool as soon as a thread is free.
    pub(crate) fn execute(&self, job: Job) -> Result<(), SchedulerError> {
        if !self.is_available() {
            drop(job);
            return Err(self.unavailable());
        }
        self.handle.spawn_blocking(move || job.run());
        Ok(())
    }

    /// Runs `job` on the blocking pool once `delay` has elapsed.
    pub(crate) fn execute_after(&self, job: Job, delay: Duration) -> Result<AbortHandle, SchedulerError> {
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(error) = tokio::task::spawn_blocking(move || job.run()).await {
                debug!("Delayed job did not complete: {}", error);
            }
        })
    }

    pub(crate) fn spawn<F>(&self, future: F) -> Result<AbortHandle, SchedulerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.is_available() {
            drop(future);
            return Err(self.unavailable());
        }
        Ok(self.handle.spawn(future).abort_handle())
    }

    /// Marks the context unavailable and stops an owned runtime.
    pub(crate) fn shutdown(&self) {
        self.available.store(false, Ordering::Release);
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            // Blocking on shutdown is not allowed from inside a runtime.
            if Handle::try_current().is_ok() {
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(self.shutdown_timeout);
            }
            debug!("🧵 Worker pool stopped");
        }
    }
}

impl Drop for AsyncContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            worker_threads: 2,
            shutdown_timeout_ms: 500,
            ..SchedulerConfig::default()
        }
    }

    #[test]
    fn executes_on_named_worker_threads() {
        let context = AsyncContext::new(&config()).unwrap();
        let (tx, rx) = mpsc::channel();
        context
            .execute(Job::new(move || {
                let name = std::thread::current().name().map(str::to_string);
                tx.send(name).unwrap();
            }))
            .unwrap();

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("horizon-worker"));
    }

    #[test]
    fn delayed_job_waits_for_its_delay() {
        let context = AsyncContext::new(&config()).unwrap();
        let (tx, rx) = mpsc::channel();
        let started = std::time::Instant::now();
        context
            .execute_after(
                Job::new(move || tx.send(()).unwrap()),
                Duration::from_millis(60),
            )
            .unwrap();

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn shutdown_rejects_new_work() {
        let context = AsyncContext::new(&config()).unwrap();
        context.shutdown();
        assert!(!context.is_available());
        assert!(!context.owns_runtime());

        let (tx, rx) = mpsc::channel();
        let result = context.execute(Job::with_abandon(|| {}, move || tx.send(()).unwrap()));
        assert!(matches!(result, Err(SchedulerError::ContextUnavailable(_))));
        assert!(rx.try_recv().is_ok());
    }
}
