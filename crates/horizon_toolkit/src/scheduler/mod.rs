//! # Context-switching scheduler
//!
//! Runs one-shot and repeating work on either [`ExecutionContext`]:
//!
//! - **Sync**: the host's main thread. Jobs wait in a tick queue
//!   ([`SyncContext`]) which the host drains once per game tick.
//! - **Async**: a tokio blocking pool ([`AsyncContext`]). Delays are measured
//!   in wall-clock time converted from ticks at the configured rate.
//!
//! Every submission returns a [`Task`] handle that can be cancelled from any
//! thread. Task bodies that fail or panic are reported through the
//! scheduler's [`ErrorHandler`] and never take the scheduler down; a failing
//! repeating task keeps its schedule.
//!
//! ## Example
//!
//! ```rust,no_run
//! use horizon_toolkit::{Scheduler, SchedulerConfig, Ticks};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let scheduler = Scheduler::new(SchedulerConfig::default())?;
//!
//! scheduler.run_async(|| {
//!     // blocking I/O is fine here
//!     Ok(())
//! });
//!
//! let autosave = scheduler.run_repeating_sync(
//!     |task| {
//!         tracing::info!("autosave #{}", task.times_ran());
//!         Ok(())
//!     },
//!     Ticks::seconds(60),
//!     Ticks::seconds(60),
//! )?;
//!
//! // The host's main loop:
//! loop {
//!     scheduler.tick()?;
//!     # break;
//! }
//! autosave.cancel();
//! # Ok(())
//! # }
//! ```

mod async_context;
mod builder;
mod sync_context;
mod task;

pub use async_context::AsyncContext;
pub use builder::{DelayedTaskBuilder, ImmediateTaskBuilder, RepeatingTaskBuilder, TaskBuilder, TaskContextBuilder};
pub use sync_context::SyncContext;
pub use task::{Task, TaskId, TaskOutcome, TaskState};

use crate::config::SchedulerConfig;
use crate::context::ExecutionContext;
use crate::error::{SchedulerError, ValidationError};
use crate::report::{guard, ErrorHandler, ExecutionFailure, FailureOrigin, Reporter};
use crate::terminable::Terminable;
use crate::ticks::{TickRate, Ticks};
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use task::TaskTable;
use tracing::{debug, info};

type JobFn = Box<dyn FnOnce() + Send>;

/// A unit of work queued on one of the contexts.
///
/// A job that is dropped without running (its context shut down, its timer
/// was aborted) runs its `abandon` hook instead, so nothing waiting on it is
/// left hanging.
pub(crate) struct Job {
    run: Option<JobFn>,
    abandon: Option<JobFn>,
}

impl Job {
    pub(crate) fn new(run: impl FnOnce() + Send + 'static) -> Self {
        Self {
            run: Some(Box::new(run)),
            abandon: None,
        }
    }

    pub(crate) fn with_abandon(
        run: impl FnOnce() + Send + 'static,
        abandon: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            run: Some(Box::new(run)),
            abandon: Some(Box::new(abandon)),
        }
    }

    pub(crate) fn run(mut self) {
        self.abandon = None;
        if let Some(run) = self.run.take() {
            run();
        }
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        if self.run.take().is_some() {
            if let Some(abandon) = self.abandon.take() {
                abandon();
            }
        }
    }
}

fn validate_delay(delay: Ticks) -> Result<(), ValidationError> {
    if delay.is_negative() {
        return Err(ValidationError::NegativeDelay(delay.get()));
    }
    Ok(())
}

fn validate_interval(interval: Ticks) -> Result<(), ValidationError> {
    if interval.get() < 1 {
        return Err(ValidationError::InvalidInterval(interval.get()));
    }
    Ok(())
}

struct SchedulerInner {
    sync: Arc<SyncContext>,
    worker: AsyncContext,
    tasks: Arc<TaskTable>,
    next_task_id: AtomicU64,
    reporter: Reporter,
    tick_rate: TickRate,
    shut_down: AtomicBool,
}

impl SchedulerInner {
    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let tasks: Vec<Task> = self.tasks.iter().map(|entry| entry.value().clone()).collect();
        info!(
            "🛑 Scheduler shutting down ({} live tasks, {} queued sync jobs)",
            tasks.len(),
            self.sync.pending()
        );

        self.sync.close();
        self.worker.shutdown();
        for task in tasks {
            task.cancel();
        }

        info!("✅ Scheduler shut down");
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Entry point for running work on the sync or async context.
///
/// Cloning is cheap and every clone drives the same contexts.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Creates a scheduler with its own worker runtime.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;
        let worker = AsyncContext::new(&config)?;
        Ok(Self::assemble(&config, worker))
    }

    /// Creates a scheduler whose async context runs on an existing runtime.
    pub fn with_handle(config: SchedulerConfig, handle: Handle) -> Result<Self, SchedulerError> {
        config.validate()?;
        let worker = AsyncContext::with_handle(handle, &config);
        Ok(Self::assemble(&config, worker))
    }

    fn assemble(config: &SchedulerConfig, worker: AsyncContext) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                sync: Arc::new(SyncContext::new()),
                worker,
                tasks: Arc::new(DashMap::new()),
                next_task_id: AtomicU64::new(1),
                reporter: Reporter::default(),
                tick_rate: config.tick_rate(),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn sync_context(&self) -> &SyncContext {
        &self.inner.sync
    }

    pub fn async_context(&self) -> &AsyncContext {
        &self.inner.worker
    }

    /// Drains the sync queue for one tick. Called by the host's main loop.
    pub fn tick(&self) -> Result<usize, SchedulerError> {
        self.inner.sync.tick()
    }

    pub fn tick_rate(&self) -> TickRate {
        self.inner.tick_rate
    }

    pub fn is_sync_thread(&self) -> bool {
        self.inner.sync.is_current_thread()
    }

    /// Context of the calling thread. Any thread other than the sync thread
    /// counts as async.
    pub fn current_context(&self) -> ExecutionContext {
        if self.is_sync_thread() {
            ExecutionContext::Sync
        } else {
            ExecutionContext::Async
        }
    }

    pub fn is_available(&self, context: ExecutionContext) -> bool {
        match context {
            ExecutionContext::Sync => self.inner.sync.is_open(),
            ExecutionContext::Async => self.inner.worker.is_available(),
        }
    }

    /// Replaces the handler that receives failures from task bodies, promise
    /// chains and subscriptions built with this scheduler.
    pub fn set_error_handler(&self, handler: impl ErrorHandler) {
        self.inner.reporter.set_handler(Arc::new(handler));
    }

    pub fn reporter(&self) -> Reporter {
        self.inner.reporter.clone()
    }

    /// Number of tasks that are neither completed nor cancelled.
    pub fn live_tasks(&self) -> usize {
        self.inner.tasks.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Fluent front end for scheduling work.
    pub fn builder(&self) -> TaskBuilder {
        TaskBuilder::new(self.clone())
    }

    pub fn run_sync<F>(&self, f: F) -> Task
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.run(ExecutionContext::Sync, f)
    }

    pub fn run_async<F>(&self, f: F) -> Task
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.run(ExecutionContext::Async, f)
    }

    /// Runs `f` once on `context`, as soon as possible.
    pub fn run<F>(&self, context: ExecutionContext, f: F) -> Task
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let task = self.register_task(context, Ticks::ZERO, None);
        self.schedule_once(&task, f);
        task
    }

    pub fn run_later_sync<F>(&self, f: F, delay: Ticks) -> Result<Task, SchedulerError>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.run_later(ExecutionContext::Sync, f, delay)
    }

    pub fn run_later_async<F>(&self, f: F, delay: Ticks) -> Result<Task, SchedulerError>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.run_later(ExecutionContext::Async, f, delay)
    }

    /// Runs `f` once on `context` after `delay` ticks.
    pub fn run_later<F>(&self, context: ExecutionContext, f: F, delay: Ticks) -> Result<Task, SchedulerError>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        validate_delay(delay)?;
        let task = self.register_task(context, delay, None);
        self.schedule_once(&task, f);
        Ok(task)
    }

    pub fn run_repeating_sync<F>(&self, f: F, delay: Ticks, interval: Ticks) -> Result<Task, SchedulerError>
    where
        F: FnMut(&Task) -> anyhow::Result<()> + Send + 'static,
    {
        self.run_repeating(ExecutionContext::Sync, f, delay, interval)
    }

    pub fn run_repeating_async<F>(&self, f: F, delay: Ticks, interval: Ticks) -> Result<Task, SchedulerError>
    where
        F: FnMut(&Task) -> anyhow::Result<()> + Send + 'static,
    {
        self.run_repeating(ExecutionContext::Async, f, delay, interval)
    }

    /// Runs `f` on `context` after `delay` ticks, then every `interval`
    /// ticks until the task is cancelled.
    ///
    /// Async runs never overlap: the next interval starts counting once the
    /// previous run has returned.
    pub fn run_repeating<F>(
        &self,
        context: ExecutionContext,
        f: F,
        delay: Ticks,
        interval: Ticks,
    ) -> Result<Task, SchedulerError>
    where
        F: FnMut(&Task) -> anyhow::Result<()> + Send + 'static,
    {
        validate_delay(delay)?;
        validate_interval(interval)?;
        let task = self.register_task(context, delay, Some(interval));
        if task.is_cancelled() {
            return Ok(task);
        }

        match context {
            ExecutionContext::Sync => {
                let job = repeating_sync_job(
                    self.inner.sync.clone(),
                    task.clone(),
                    f,
                    self.inner.reporter.clone(),
                );
                self.submit(&task, job);
            }
            ExecutionContext::Async => self.spawn_repeating_async(&task, f),
        }
        Ok(task)
    }

    /// Cancels every live task and stops both contexts. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    fn register_task(&self, context: ExecutionContext, delay: Ticks, interval: Option<Ticks>) -> Task {
        let id = self.inner.next_task_id.fetch_add(1, Ordering::Relaxed);
        if self.is_shut_down() || !self.is_available(context) {
            debug!("⏸️ {} context unavailable, task #{} starts cancelled", context, id);
            return Task::cancelled(id, context, delay, interval);
        }
        Task::new(id, context, delay, interval, &self.inner.tasks)
    }

    fn schedule_once<F>(&self, task: &Task, f: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        if task.is_cancelled() {
            return;
        }
        let reporter = self.inner.reporter.clone();
        let runner = task.clone();
        let abandoned = task.clone();
        let job = Job::with_abandon(
            move || {
                if !runner.begin_run() {
                    return;
                }
                let outcome = guard(f);
                if let Err(error) = &outcome {
                    report_task_failure(&reporter, &runner, error.clone());
                }
                runner.finish_run(outcome);
            },
            move || {
                abandoned.cancel();
            },
        );
        self.submit(task, job);
    }

    fn submit(&self, task: &Task, job: Job) {
        match self.dispatch(task.context(), job, task.delay()) {
            Ok(Some(handle)) => task.set_abort_handle(handle),
            Ok(None) => {}
            Err(error) => debug!("⏸️ Task #{} was not scheduled: {}", task.id(), error),
        }
    }

    /// Queues `job` on `context`. Rejected jobs are abandoned before this returns.
    pub(crate) fn dispatch(
        &self,
        context: ExecutionContext,
        job: Job,
        delay: Ticks,
    ) -> Result<Option<AbortHandle>, SchedulerError> {
        validate_delay(delay)?;
        match context {
            ExecutionContext::Sync => {
                self.inner.sync.post(job, delay.get() as u64)?;
                Ok(None)
            }
            ExecutionContext::Async if delay == Ticks::ZERO => {
                self.inner.worker.execute(job)?;
                Ok(None)
            }
            ExecutionContext::Async => {
                let delay = self.inner.tick_rate.duration_of(delay);
                self.inner.worker.execute_after(job, delay).map(Some)
            }
        }
    }

    fn spawn_repeating_async<F>(&self, task: &Task, f: F)
    where
        F: FnMut(&Task) -> anyhow::Result<()> + Send + 'static,
    {
        let rate = self.inner.tick_rate;
        let delay = rate.duration_of(task.delay());
        let period = rate.duration_of(task.interval().unwrap_or(Ticks::ONE));
        let available = self.inner.worker.availability();
        let reporter = self.inner.reporter.clone();
        let runner = task.clone();

        let future = async move {
            let mut f = f;
            let mut ticker = tokio::time::interval_at(Instant::now() + delay, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !available.load(Ordering::Acquire) {
                    runner.cancel();
                    break;
                }
                if !runner.begin_run() {
                    break;
                }

                let current = runner.clone();
                let joined = tokio::task::spawn_blocking(move || {
                    let outcome = guard(|| f(&current));
                    (f, outcome)
                })
                .await;

                let (returned, outcome) = match joined {
                    Ok(result) => result,
                    Err(error) => {
                        debug!("Repeating task #{} lost its worker: {}", runner.id(), error);
                        runner.cancel();
                        break;
                    }
                };
                f = returned;

                if let Err(error) = &outcome {
                    report_task_failure(&reporter, &runner, error.clone());
                }
                if !runner.finish_run(outcome) {
                    break;
                }
            }
        };

        match self.inner.worker.spawn(future) {
            Ok(handle) => task.set_abort_handle(handle),
            Err(error) => {
                debug!("⏸️ Task #{} was not scheduled: {}", task.id(), error);
                task.cancel();
            }
        }
    }
}

fn report_task_failure(reporter: &Reporter, task: &Task, error: crate::error::ExecutionError) {
    reporter.report(ExecutionFailure::new(
        FailureOrigin::SchedulerTask { task_id: task.id() },
        Some(task.context()),
        error,
    ));
}

/// One iteration of a repeating sync task; each run queues the next.
fn repeating_sync_job<F>(sync: Arc<SyncContext>, task: Task, mut f: F, reporter: Reporter) -> Job
where
    F: FnMut(&Task) -> anyhow::Result<()> + Send + 'static,
{
    let abandoned = task.clone();
    Job::with_abandon(
        move || {
            if !task.begin_run() {
                return;
            }
            let outcome = guard(|| f(&task));
            if let Err(error) = &outcome {
                report_task_failure(&reporter, &task, error.clone());
            }
            if task.finish_run(outcome) {
                let interval = task.interval().unwrap_or(Ticks::ONE).get() as u64;
                let next = repeating_sync_job(sync.clone(), task.clone(), f, reporter);
                if let Err(error) = sync.post(next, interval) {
                    debug!("⏸️ Repeating task #{} stopped: {}", task.id(), error);
                }
            }
        },
        move || {
            abandoned.cancel();
        },
    )
}

impl Terminable for Scheduler {
    fn close(&self) -> anyhow::Result<()> {
        self.shutdown();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.is_shut_down()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("tick_rate", &self.inner.tick_rate)
            .field("current_tick", &self.inner.sync.current_tick())
            .field("live_tasks", &self.inner.tasks.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ExecutionError;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{mpsc, Mutex};
    use std::time::Duration;

    pub(crate) fn test_scheduler() -> Scheduler {
        Scheduler::new(SchedulerConfig {
            ticks_per_second: 100,
            worker_threads: 2,
            shutdown_timeout_ms: 500,
            ..SchedulerConfig::default()
        })
        .unwrap()
    }

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn sync_work_runs_on_the_next_tick() {
        let scheduler = test_scheduler();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let task = scheduler.run_sync(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(task.state(), TaskState::Pending);
        assert_eq!(scheduler.tick().unwrap(), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(task.state(), TaskState::Completed);
        assert_eq!(scheduler.live_tasks(), 0);
    }

    #[test]
    fn delayed_sync_work_honours_the_delay() {
        let scheduler = test_scheduler();
        let task = scheduler.run_later_sync(|| Ok(()), Ticks(3)).unwrap();
        scheduler.tick().unwrap();
        scheduler.tick().unwrap();
        assert_eq!(task.times_ran(), 0);
        scheduler.tick().unwrap();
        assert_eq!(task.times_ran(), 1);
    }

    #[test]
    fn invalid_timing_is_rejected_synchronously() {
        let scheduler = test_scheduler();
        assert!(matches!(
            scheduler.run_later_sync(|| Ok(()), Ticks(-1)),
            Err(SchedulerError::Validation(ValidationError::NegativeDelay(-1)))
        ));
        assert!(matches!(
            scheduler.run_repeating_async(|_| Ok(()), Ticks::ZERO, Ticks::ZERO),
            Err(SchedulerError::Validation(ValidationError::InvalidInterval(0)))
        ));
        assert_eq!(scheduler.live_tasks(), 0);
    }

    #[test]
    fn repeating_sync_task_survives_a_failing_iteration() {
        let scheduler = test_scheduler();
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = failures.clone();
        scheduler.set_error_handler(move |failure: &ExecutionFailure| {
            sink.lock().unwrap().push(failure.origin.clone());
        });

        let task = scheduler
            .run_repeating_sync(
                |task| {
                    if task.times_ran() == 1 {
                        anyhow::bail!("second iteration fails");
                    }
                    Ok(())
                },
                Ticks::ZERO,
                Ticks::ONE,
            )
            .unwrap();

        for _ in 0..4 {
            scheduler.tick().unwrap();
        }

        assert_eq!(task.times_ran(), 4);
        assert!(task.last_outcome().unwrap().is_success());
        assert_eq!(
            failures.lock().unwrap().as_slice(),
            &[FailureOrigin::SchedulerTask { task_id: task.id() }]
        );
        assert!(task.cancel());
        scheduler.tick().unwrap();
        assert_eq!(task.times_ran(), 4);
    }

    #[test]
    fn repeating_async_task_survives_a_failing_iteration() {
        let scheduler = test_scheduler();
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = failures.clone();
        scheduler.set_error_handler(move |failure: &ExecutionFailure| {
            sink.lock().unwrap().push((failure.origin.clone(), failure.context));
        });

        let task = scheduler
            .run_repeating_async(
                |task| {
                    if task.times_ran() == 1 {
                        anyhow::bail!("second iteration fails");
                    }
                    Ok(())
                },
                Ticks::ZERO,
                Ticks::ONE,
            )
            .unwrap();

        assert!(wait_until(|| task.times_ran() >= 3));
        assert!(task.cancel());

        assert_eq!(
            failures.lock().unwrap().as_slice(),
            &[(
                FailureOrigin::SchedulerTask { task_id: task.id() },
                Some(ExecutionContext::Async)
            )]
        );
    }

    #[test]
    fn repeating_sync_task_can_stop_itself() {
        let scheduler = test_scheduler();
        let task = scheduler
            .run_repeating_sync(
                |task| {
                    if task.times_ran() == 2 {
                        task.cancel();
                    }
                    Ok(())
                },
                Ticks::ONE,
                Ticks(2),
            )
            .unwrap();

        for _ in 0..10 {
            scheduler.tick().unwrap();
        }
        assert_eq!(task.times_ran(), 3);
        assert!(task.is_cancelled());
    }

    #[test]
    fn panicking_task_is_reported_not_propagated() {
        let scheduler = test_scheduler();
        let (tx, rx) = mpsc::channel();
        scheduler.set_error_handler(move |failure: &ExecutionFailure| {
            tx.send(failure.error.clone()).unwrap();
        });

        let task = scheduler.run_async(|| panic!("worker exploded"));
        let error = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(error, ExecutionError::Panicked(message) if message == "worker exploded"));
        assert!(wait_until(|| task.state() == TaskState::Completed));
        assert!(matches!(task.last_outcome(), Some(TaskOutcome::Failed(_))));
    }

    #[test]
    fn async_work_runs_off_the_sync_thread() {
        let scheduler = test_scheduler();
        scheduler.tick().unwrap();
        let (tx, rx) = mpsc::channel();
        let observer = scheduler.clone();
        scheduler.run_async(move || {
            tx.send(observer.current_context()).unwrap();
            Ok(())
        });
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            ExecutionContext::Async
        );
        assert_eq!(scheduler.current_context(), ExecutionContext::Sync);
    }

    #[test]
    fn repeating_async_runs_never_overlap() {
        let scheduler = test_scheduler();
        let running = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));
        let (active, flag) = (running.clone(), overlapped.clone());

        let task = scheduler
            .run_repeating_async(
                move |_| {
                    if active.fetch_add(1, Ordering::SeqCst) > 0 {
                        flag.store(true, Ordering::SeqCst);
                    }
                    std::thread::sleep(Duration::from_millis(25));
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                },
                Ticks::ZERO,
                Ticks::ONE,
            )
            .unwrap();

        assert!(wait_until(|| task.times_ran() >= 4));
        task.cancel();
        assert!(!overlapped.load(Ordering::SeqCst));
    }

    #[test]
    fn cancelled_delayed_task_never_runs() {
        let scheduler = test_scheduler();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let task = scheduler
            .run_later_async(
                move || {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                },
                Ticks(20),
            )
            .unwrap();

        assert!(task.cancel());
        std::thread::sleep(Duration::from_millis(300));
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(task.times_ran(), 0);
    }

    #[test]
    fn shutdown_cancels_everything() {
        let scheduler = test_scheduler();
        let sync_task = scheduler
            .run_repeating_sync(|_| Ok(()), Ticks::ONE, Ticks::ONE)
            .unwrap();
        let async_task = scheduler
            .run_repeating_async(|_| Ok(()), Ticks(50), Ticks(50))
            .unwrap();

        scheduler.shutdown();
        assert!(sync_task.is_cancelled());
        assert!(async_task.is_cancelled());
        assert_eq!(scheduler.live_tasks(), 0);

        let late = scheduler.run_sync(|| Ok(()));
        assert!(late.is_cancelled());
        let late_repeating = scheduler
            .run_repeating_async(|_| Ok(()), Ticks::ZERO, Ticks::ONE)
            .unwrap();
        assert!(late_repeating.is_cancelled());
    }

    #[tokio::test]
    async fn borrowed_runtime_runs_async_work() {
        let scheduler = Scheduler::with_handle(SchedulerConfig::default(), Handle::current()).unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        scheduler.run_async(move || {
            let _ = tx.send(42);
            Ok(())
        });
        assert_eq!(rx.await.unwrap(), 42);
        assert!(!scheduler.async_context().owns_runtime());
    }
}
