//! # Promises
//!
//! [`Promise<T>`] is a single-assignment result shared by a producer and any
//! number of continuation stages. Each stage is pinned to an
//! [`ExecutionContext`], which is how a workflow hops between the worker pool
//! and the main thread:
//!
//! ```rust,no_run
//! use horizon_toolkit::{Promise, Scheduler, SchedulerConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let scheduler = Scheduler::new(SchedulerConfig::default())?;
//! Promise::supplying_async(&scheduler, || Ok(std::fs::read_to_string("motd.txt")?))
//!     .then_apply_async(|text| Ok(text.lines().count()))
//!     .then_accept_sync(|lines| {
//!         // back on the main thread, safe to touch world state
//!         tracing::info!("motd has {} lines", lines);
//!         Ok(())
//!     });
//! # Ok(())
//! # }
//! ```
//!
//! ## Failure propagation
//!
//! A stage only runs when its upstream succeeded. An upstream failure is
//! copied to every downstream stage without invoking its function, until an
//! [`exceptionally`](Promise::exceptionally) stage recovers from it.
//!
//! ## Cancellation
//!
//! [`cancel`](Promise::cancel) fails the promise with
//! [`PromiseError::Cancelled`]. Stages that have not started yet are skipped.
//! A stage already running on a worker may finish, but its result is
//! discarded. Promises are terminables, so binding one to a registry cancels
//! it when the registry closes.

mod state;

use crate::context::ExecutionContext;
use crate::error::{ExecutionError, PromiseError, SchedulerError, ValidationError};
use crate::report::{guard, ExecutionFailure, FailureOrigin};
use crate::scheduler::{Job, Scheduler};
use crate::terminable::{Ownership, Terminable};
use crate::ticks::Ticks;
use state::{Continuation, Outcome, Shared, SyncDependency};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Deferred result of a computation that may run on either context.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
    scheduler: Scheduler,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    fn with_shared(scheduler: &Scheduler, sync_stage: bool, upstream: Option<Arc<dyn SyncDependency>>) -> Self {
        Self {
            shared: Arc::new(Shared::new(sync_stage, upstream)),
            scheduler: scheduler.clone(),
        }
    }

    /// An unset promise, completed by hand.
    ///
    /// Nothing is known about who will complete it, so blocking on it from
    /// the sync thread is allowed; doing so while the completer itself waits
    /// for the sync thread will hang.
    pub fn empty(scheduler: &Scheduler) -> Self {
        Self::with_shared(scheduler, false, None)
    }

    pub fn completed(scheduler: &Scheduler, value: T) -> Self {
        let promise = Self::empty(scheduler);
        promise.complete(value);
        promise
    }

    pub fn failed(scheduler: &Scheduler, error: PromiseError) -> Self {
        let promise = Self::empty(scheduler);
        promise.fail(error);
        promise
    }

    /// Runs `f` on `context` and completes the promise with its result.
    pub fn supplying<F>(scheduler: &Scheduler, context: ExecutionContext, f: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let promise = Self::with_shared(scheduler, context.is_sync(), None);
        promise.schedule_stage(context, Ticks::ZERO, move |stage| {
            stage.settle_stage(context, guard(f))
        });
        promise
    }

    pub fn supplying_sync<F>(scheduler: &Scheduler, f: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Self::supplying(scheduler, ExecutionContext::Sync, f)
    }

    pub fn supplying_async<F>(scheduler: &Scheduler, f: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Self::supplying(scheduler, ExecutionContext::Async, f)
    }

    /// Like [`supplying`](Self::supplying), after `delay` ticks.
    pub fn supplying_delayed<F>(
        scheduler: &Scheduler,
        context: ExecutionContext,
        f: F,
        delay: Ticks,
    ) -> Result<Self, SchedulerError>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        if delay.is_negative() {
            return Err(ValidationError::NegativeDelay(delay.get()).into());
        }
        let promise = Self::with_shared(scheduler, context.is_sync(), None);
        promise.schedule_stage(context, delay, move |stage| {
            stage.settle_stage(context, guard(f))
        });
        Ok(promise)
    }

    /// Sets the value. Returns `false` if the promise was already terminal.
    pub fn complete(&self, value: T) -> bool {
        self.shared.settle(Ok(value))
    }

    /// Fails the promise with `error`. Returns `false` if the promise was
    /// already terminal.
    pub fn complete_exceptionally(&self, error: impl Into<anyhow::Error>) -> bool {
        self.fail(PromiseError::execution(error))
    }

    /// Fails the promise with an explicit failure kind.
    pub fn fail(&self, error: PromiseError) -> bool {
        self.shared.settle(Err(error))
    }

    /// Fails the promise with [`PromiseError::Cancelled`].
    pub fn cancel(&self) -> bool {
        self.fail(PromiseError::Cancelled)
    }

    pub fn is_done(&self) -> bool {
        self.shared.is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.shared.peek(), Some(Err(PromiseError::Cancelled)))
    }

    /// The terminal outcome, without blocking.
    pub fn try_get(&self) -> Option<Result<T, PromiseError>> {
        self.shared.peek()
    }

    /// Blocks until the promise is terminal.
    ///
    /// Fails fast with [`PromiseError::WouldDeadlock`] when called on the
    /// sync thread while completion still needs the sync context to run.
    pub fn join(&self) -> Result<T, PromiseError> {
        self.block(None)
    }

    /// Blocks for at most `timeout`.
    pub fn get(&self, timeout: Duration) -> Result<T, PromiseError> {
        self.block(Some(timeout))
    }

    fn block(&self, timeout: Option<Duration>) -> Result<T, PromiseError> {
        self.shared.block(timeout, self.scheduler.is_sync_thread())
    }

    /// Waits for the promise from async code.
    pub async fn wait(&self) -> Result<T, PromiseError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.shared.on_complete(Box::new(move |outcome: &Outcome<T>| {
            let _ = tx.send(outcome.clone());
        }));
        rx.await.unwrap_or(Err(PromiseError::Cancelled))
    }

    /// Observes the terminal outcome on whichever thread completes the
    /// promise, or immediately if it is already terminal.
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(&Result<T, PromiseError>) + Send + 'static,
    {
        self.shared.on_complete(Box::new(f));
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Transforms the value on `context`.
    pub fn then_apply<U, F>(&self, context: ExecutionContext, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> anyhow::Result<U> + Send + 'static,
    {
        self.apply_after(context, Ticks::ZERO, f)
    }

    pub fn then_apply_sync<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> anyhow::Result<U> + Send + 'static,
    {
        self.then_apply(ExecutionContext::Sync, f)
    }

    pub fn then_apply_async<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> anyhow::Result<U> + Send + 'static,
    {
        self.then_apply(ExecutionContext::Async, f)
    }

    /// Transforms the value on `context`, `delay` ticks after it arrives.
    pub fn then_apply_delayed<U, F>(
        &self,
        context: ExecutionContext,
        f: F,
        delay: Ticks,
    ) -> Result<Promise<U>, SchedulerError>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> anyhow::Result<U> + Send + 'static,
    {
        if delay.is_negative() {
            return Err(ValidationError::NegativeDelay(delay.get()).into());
        }
        Ok(self.apply_after(context, delay, f))
    }

    pub fn then_apply_delayed_sync<U, F>(&self, f: F, delay: Ticks) -> Result<Promise<U>, SchedulerError>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> anyhow::Result<U> + Send + 'static,
    {
        self.then_apply_delayed(ExecutionContext::Sync, f, delay)
    }

    pub fn then_apply_delayed_async<U, F>(&self, f: F, delay: Ticks) -> Result<Promise<U>, SchedulerError>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> anyhow::Result<U> + Send + 'static,
    {
        self.then_apply_delayed(ExecutionContext::Async, f, delay)
    }

    fn apply_after<U, F>(&self, context: ExecutionContext, delay: Ticks, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> anyhow::Result<U> + Send + 'static,
    {
        let downstream = self.derive::<U>(context);
        let target = downstream.clone();
        self.continue_with(move |outcome| match outcome {
            Ok(value) => {
                let value = value.clone();
                target.schedule_stage(context, delay, move |stage| {
                    stage.settle_stage(context, guard(|| f(value)))
                });
            }
            Err(error) => {
                target.fail(error.clone());
            }
        });
        downstream
    }

    /// Consumes the value on `context`.
    pub fn then_accept<F>(&self, context: ExecutionContext, f: F) -> Promise<()>
    where
        F: FnOnce(T) -> anyhow::Result<()> + Send + 'static,
    {
        self.then_apply(context, f)
    }

    pub fn then_accept_sync<F>(&self, f: F) -> Promise<()>
    where
        F: FnOnce(T) -> anyhow::Result<()> + Send + 'static,
    {
        self.then_accept(ExecutionContext::Sync, f)
    }

    pub fn then_accept_async<F>(&self, f: F) -> Promise<()>
    where
        F: FnOnce(T) -> anyhow::Result<()> + Send + 'static,
    {
        self.then_accept(ExecutionContext::Async, f)
    }

    /// Consumes the value on `context`, `delay` ticks after it arrives.
    pub fn then_accept_delayed<F>(
        &self,
        context: ExecutionContext,
        f: F,
        delay: Ticks,
    ) -> Result<Promise<()>, SchedulerError>
    where
        F: FnOnce(T) -> anyhow::Result<()> + Send + 'static,
    {
        self.then_apply_delayed(context, f, delay)
    }

    pub fn then_accept_delayed_sync<F>(&self, f: F, delay: Ticks) -> Result<Promise<()>, SchedulerError>
    where
        F: FnOnce(T) -> anyhow::Result<()> + Send + 'static,
    {
        self.then_accept_delayed(ExecutionContext::Sync, f, delay)
    }

    pub fn then_accept_delayed_async<F>(&self, f: F, delay: Ticks) -> Result<Promise<()>, SchedulerError>
    where
        F: FnOnce(T) -> anyhow::Result<()> + Send + 'static,
    {
        self.then_accept_delayed(ExecutionContext::Async, f, delay)
    }

    /// Runs `f` on `context` once the value arrives, ignoring the value.
    pub fn then_run<F>(&self, context: ExecutionContext, f: F) -> Promise<()>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.apply_after(context, Ticks::ZERO, move |_| f())
    }

    pub fn then_run_sync<F>(&self, f: F) -> Promise<()>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.then_run(ExecutionContext::Sync, f)
    }

    pub fn then_run_async<F>(&self, f: F) -> Promise<()>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.then_run(ExecutionContext::Async, f)
    }

    pub fn then_run_delayed<F>(
        &self,
        context: ExecutionContext,
        f: F,
        delay: Ticks,
    ) -> Result<Promise<()>, SchedulerError>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.then_apply_delayed(context, move |_| f(), delay)
    }

    pub fn then_run_delayed_sync<F>(&self, f: F, delay: Ticks) -> Result<Promise<()>, SchedulerError>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.then_run_delayed(ExecutionContext::Sync, f, delay)
    }

    pub fn then_run_delayed_async<F>(&self, f: F, delay: Ticks) -> Result<Promise<()>, SchedulerError>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.then_run_delayed(ExecutionContext::Async, f, delay)
    }

    /// Chains a step that itself produces a promise; the returned promise
    /// settles with that inner promise.
    pub fn then_compose<U, F>(&self, context: ExecutionContext, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> anyhow::Result<Promise<U>> + Send + 'static,
    {
        self.compose_after(context, Ticks::ZERO, f)
    }

    /// Like [`then_compose`](Self::then_compose), `delay` ticks after the
    /// value arrives.
    pub fn then_compose_delayed<U, F>(
        &self,
        context: ExecutionContext,
        f: F,
        delay: Ticks,
    ) -> Result<Promise<U>, SchedulerError>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> anyhow::Result<Promise<U>> + Send + 'static,
    {
        if delay.is_negative() {
            return Err(ValidationError::NegativeDelay(delay.get()).into());
        }
        Ok(self.compose_after(context, delay, f))
    }

    pub fn then_compose_delayed_sync<U, F>(&self, f: F, delay: Ticks) -> Result<Promise<U>, SchedulerError>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> anyhow::Result<Promise<U>> + Send + 'static,
    {
        self.then_compose_delayed(ExecutionContext::Sync, f, delay)
    }

    pub fn then_compose_delayed_async<U, F>(&self, f: F, delay: Ticks) -> Result<Promise<U>, SchedulerError>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> anyhow::Result<Promise<U>> + Send + 'static,
    {
        self.then_compose_delayed(ExecutionContext::Async, f, delay)
    }

    fn compose_after<U, F>(&self, context: ExecutionContext, delay: Ticks, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> anyhow::Result<Promise<U>> + Send + 'static,
    {
        let downstream = self.derive::<U>(context);
        let target = downstream.clone();
        self.continue_with(move |outcome| match outcome {
            Ok(value) => {
                let value = value.clone();
                target.schedule_stage(context, delay, move |stage| {
                    match guard(|| f(value)) {
                        Ok(inner) => stage.adopt(inner),
                        Err(error) => stage.settle_stage(context, Err(error)),
                    }
                });
            }
            Err(error) => {
                target.fail(error.clone());
            }
        });
        downstream
    }

    pub fn then_compose_sync<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> anyhow::Result<Promise<U>> + Send + 'static,
    {
        self.then_compose(ExecutionContext::Sync, f)
    }

    pub fn then_compose_async<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> anyhow::Result<Promise<U>> + Send + 'static,
    {
        self.then_compose(ExecutionContext::Async, f)
    }

    /// Recovers from a failure on `context`. A successful value passes
    /// through untouched.
    pub fn exceptionally<F>(&self, context: ExecutionContext, f: F) -> Promise<T>
    where
        F: FnOnce(PromiseError) -> anyhow::Result<T> + Send + 'static,
    {
        self.recover_after(context, Ticks::ZERO, f)
    }

    /// Like [`exceptionally`](Self::exceptionally), `delay` ticks after the
    /// failure arrives. A successful value still passes through at once.
    pub fn exceptionally_delayed<F>(
        &self,
        context: ExecutionContext,
        f: F,
        delay: Ticks,
    ) -> Result<Promise<T>, SchedulerError>
    where
        F: FnOnce(PromiseError) -> anyhow::Result<T> + Send + 'static,
    {
        if delay.is_negative() {
            return Err(ValidationError::NegativeDelay(delay.get()).into());
        }
        Ok(self.recover_after(context, delay, f))
    }

    pub fn exceptionally_delayed_sync<F>(&self, f: F, delay: Ticks) -> Result<Promise<T>, SchedulerError>
    where
        F: FnOnce(PromiseError) -> anyhow::Result<T> + Send + 'static,
    {
        self.exceptionally_delayed(ExecutionContext::Sync, f, delay)
    }

    pub fn exceptionally_delayed_async<F>(&self, f: F, delay: Ticks) -> Result<Promise<T>, SchedulerError>
    where
        F: FnOnce(PromiseError) -> anyhow::Result<T> + Send + 'static,
    {
        self.exceptionally_delayed(ExecutionContext::Async, f, delay)
    }

    fn recover_after<F>(&self, context: ExecutionContext, delay: Ticks, f: F) -> Promise<T>
    where
        F: FnOnce(PromiseError) -> anyhow::Result<T> + Send + 'static,
    {
        let downstream = self.derive::<T>(context);
        let target = downstream.clone();
        self.continue_with(move |outcome| match outcome {
            Ok(value) => {
                target.complete(value.clone());
            }
            Err(error) => {
                let error = error.clone();
                target.schedule_stage(context, delay, move |stage| {
                    stage.settle_stage(context, guard(|| f(error)))
                });
            }
        });
        downstream
    }

    pub fn exceptionally_sync<F>(&self, f: F) -> Promise<T>
    where
        F: FnOnce(PromiseError) -> anyhow::Result<T> + Send + 'static,
    {
        self.exceptionally(ExecutionContext::Sync, f)
    }

    pub fn exceptionally_async<F>(&self, f: F) -> Promise<T>
    where
        F: FnOnce(PromiseError) -> anyhow::Result<T> + Send + 'static,
    {
        self.exceptionally(ExecutionContext::Async, f)
    }

    fn derive<U: Clone + Send + 'static>(&self, context: ExecutionContext) -> Promise<U> {
        let upstream: Arc<dyn SyncDependency> = self.shared.clone();
        Promise::with_shared(&self.scheduler, context.is_sync(), Some(upstream))
    }

    fn continue_with<F>(&self, f: F)
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        let continuation: Continuation<T> = Box::new(f);
        self.shared.on_complete(continuation);
    }

    /// Queues `work` on `context`. The stage is skipped if this promise is
    /// already terminal by the time it runs, and fails with
    /// [`PromiseError::ContextUnavailable`] if the context never runs it.
    fn schedule_stage<W>(&self, context: ExecutionContext, delay: Ticks, work: W)
    where
        W: FnOnce(&Promise<T>) + Send + 'static,
    {
        let runner = self.clone();
        let abandoned = self.clone();
        let job = Job::with_abandon(
            move || {
                if runner.is_done() {
                    trace!("⏭️ Skipping stage of a settled promise");
                    return;
                }
                work(&runner);
            },
            move || {
                abandoned.fail(PromiseError::ContextUnavailable(context));
            },
        );
        if let Err(error) = self.scheduler.dispatch(context, job, delay) {
            trace!("Promise stage was not scheduled: {}", error);
        }
    }

    /// Settles with a stage result. A failure that arrives after the promise
    /// was cancelled is reported instead of dropped.
    fn settle_stage(&self, context: ExecutionContext, result: Result<T, ExecutionError>) {
        match result {
            Ok(value) => {
                self.complete(value);
            }
            Err(error) => {
                if !self.fail(PromiseError::Execution(error.clone())) {
                    self.scheduler.reporter().report(ExecutionFailure::new(
                        FailureOrigin::PromiseChain,
                        Some(context),
                        error,
                    ));
                }
            }
        }
    }

    /// Settles with whatever `inner` settles with.
    fn adopt(&self, inner: Promise<T>) {
        let upstream: Arc<dyn SyncDependency> = inner.shared.clone();
        self.shared.follow(upstream);
        let target = self.clone();
        inner.continue_with(move |outcome| {
            target.shared.settle(outcome.clone());
        });
    }
}

impl Scheduler {
    /// Shorthand for [`Promise::supplying`].
    pub fn supply<T, F>(&self, context: ExecutionContext, f: F) -> Promise<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Promise::supplying(self, context, f)
    }

    /// Runs the infallible `f` on `context` after `delay` ticks.
    pub fn supply_later<T, F>(&self, context: ExecutionContext, f: F, delay: Ticks) -> Result<Promise<T>, SchedulerError>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        Promise::supplying_delayed(self, context, move || Ok(f()), delay)
    }

    /// Runs the fallible `f` on `context` after `delay` ticks; an error fails
    /// the returned promise.
    pub fn call_later<T, F>(&self, context: ExecutionContext, f: F, delay: Ticks) -> Result<Promise<T>, SchedulerError>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Promise::supplying_delayed(self, context, f, delay)
    }
}

impl<T: Clone + Send + 'static> Terminable for Promise<T> {
    fn close(&self) -> anyhow::Result<()> {
        self.cancel();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.is_done()
    }

    fn ownership(&self) -> Option<&Ownership> {
        Some(&self.shared.ownership)
    }
}

impl<T: Clone + Send + 'static> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.shared.peek() {
            None => "pending",
            Some(Ok(_)) => "completed",
            Some(Err(PromiseError::Cancelled)) => "cancelled",
            Some(Err(_)) => "failed",
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::tests::test_scheduler;
    use crate::terminable::TerminableRegistry;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const WAIT: Duration = Duration::from_secs(5);

    fn tick_until_done<T: Clone + Send + 'static>(scheduler: &Scheduler, promise: &Promise<T>) {
        for _ in 0..500 {
            scheduler.tick().unwrap();
            if promise.is_done() {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("promise did not settle");
    }

    #[test]
    fn first_completion_wins() {
        let scheduler = test_scheduler();
        let promise = Promise::empty(&scheduler);
        assert!(promise.complete(1));
        assert!(!promise.complete(2));
        assert!(!promise.complete_exceptionally(anyhow::anyhow!("late")));
        assert_eq!(promise.try_get().unwrap().unwrap(), 1);

        let failed = Promise::<i32>::empty(&scheduler);
        assert!(failed.complete_exceptionally(anyhow::anyhow!("first")));
        assert!(!failed.complete(5));
        assert!(failed.try_get().unwrap().unwrap_err().to_string().contains("first"));
    }

    #[test]
    fn continuations_see_the_value_exactly_once() {
        let scheduler = test_scheduler();
        let promise = Promise::empty(&scheduler);
        let seen = Arc::new(AtomicUsize::new(0));

        let before = seen.clone();
        promise.on_complete(move |outcome| {
            assert_eq!(*outcome.as_ref().unwrap(), 5);
            before.fetch_add(1, Ordering::SeqCst);
        });
        promise.complete(5);
        promise.complete(6);
        let after = seen.clone();
        promise.on_complete(move |outcome| {
            assert_eq!(*outcome.as_ref().unwrap(), 5);
            after.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failure_skips_every_downstream_stage() {
        let scheduler = test_scheduler();
        let root = Promise::<i32>::empty(&scheduler);
        let f1_ran = Arc::new(AtomicBool::new(false));
        let f2_ran = Arc::new(AtomicBool::new(false));
        let (f1, f2) = (f1_ran.clone(), f2_ran.clone());

        let last = root
            .then_apply_sync(move |v| {
                f1.store(true, Ordering::SeqCst);
                Ok(v + 1)
            })
            .then_apply_async(move |v| {
                f2.store(true, Ordering::SeqCst);
                Ok(v * 2)
            });

        root.complete_exceptionally(anyhow::anyhow!("root cause"));
        scheduler.tick().unwrap();

        let root_error = root.try_get().unwrap().unwrap_err();
        let last_error = last.get(WAIT).unwrap_err();
        match (root_error, last_error) {
            (
                PromiseError::Execution(ExecutionError::Failed(root_cause)),
                PromiseError::Execution(ExecutionError::Failed(last_cause)),
            ) => assert!(Arc::ptr_eq(&root_cause, &last_cause)),
            other => panic!("unexpected outcomes: {other:?}"),
        }
        assert!(!f1_ran.load(Ordering::SeqCst));
        assert!(!f2_ran.load(Ordering::SeqCst));
    }

    #[test]
    fn sync_stages_advance_one_tick_at_a_time() {
        let scheduler = test_scheduler();
        let first = Promise::supplying_sync(&scheduler, || Ok(2));
        let second = first.then_apply_sync(|v| Ok(v * 10));

        scheduler.tick().unwrap();
        assert_eq!(first.try_get().unwrap().unwrap(), 2);
        assert!(!second.is_done());

        scheduler.tick().unwrap();
        assert_eq!(second.try_get().unwrap().unwrap(), 20);
    }

    #[test]
    fn async_chain_completes_off_the_main_thread() {
        let scheduler = test_scheduler();
        let result = Promise::supplying_async(&scheduler, || Ok("horizon".to_string()))
            .then_apply_async(|s| Ok(s.len()))
            .get(WAIT);
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn joining_a_sync_dependent_promise_on_the_sync_thread_fails_fast() {
        let scheduler = test_scheduler();
        scheduler.tick().unwrap();

        let pending = Promise::supplying_async(&scheduler, || Ok(1)).then_apply_sync(|v| Ok(v + 1));
        assert!(matches!(pending.join(), Err(PromiseError::WouldDeadlock)));
        assert!(matches!(
            pending.get(Duration::from_millis(10)),
            Err(PromiseError::WouldDeadlock)
        ));

        tick_until_done(&scheduler, &pending);
        assert_eq!(pending.join().unwrap(), 2);
    }

    #[test]
    fn joining_async_work_on_the_sync_thread_is_allowed() {
        let scheduler = test_scheduler();
        scheduler.tick().unwrap();
        let value = Promise::supplying_async(&scheduler, || Ok(9)).join();
        assert_eq!(value.unwrap(), 9);
    }

    #[test]
    fn bounded_wait_times_out() {
        let scheduler = test_scheduler();
        let promise = Promise::<u8>::empty(&scheduler);
        let error = promise.get(Duration::from_millis(30)).unwrap_err();
        assert!(error.is_timeout());
        assert!(!promise.is_done());
    }

    #[test]
    fn cancellation_skips_pending_stages() {
        let scheduler = test_scheduler();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let source = Promise::supplying_sync(&scheduler, || Ok(1));
        let stage = source.then_apply_sync(move |v| {
            flag.store(true, Ordering::SeqCst);
            Ok(v)
        });

        assert!(stage.cancel());
        for _ in 0..3 {
            scheduler.tick().unwrap();
        }

        assert_eq!(source.try_get().unwrap().unwrap(), 1);
        assert!(stage.is_cancelled());
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn exceptionally_recovers_and_passes_values_through() {
        let scheduler = test_scheduler();
        let recovered = Promise::<i32>::failed(&scheduler, PromiseError::execution(anyhow::anyhow!("nope")))
            .exceptionally_sync(|error| {
                assert!(error.to_string().contains("nope"));
                Ok(-1)
            });
        scheduler.tick().unwrap();
        assert_eq!(recovered.try_get().unwrap().unwrap(), -1);

        let untouched = Promise::completed(&scheduler, 3).exceptionally_sync(|_| Ok(0));
        assert_eq!(untouched.try_get().unwrap().unwrap(), 3);
    }

    #[test]
    fn compose_flattens_nested_promises() {
        let scheduler = test_scheduler();
        let inner_scheduler = scheduler.clone();
        let result = Promise::supplying_async(&scheduler, || Ok(3))
            .then_compose_async(move |v| Ok(Promise::supplying_async(&inner_scheduler, move || Ok(v + 1))))
            .get(WAIT);
        assert_eq!(result.unwrap(), 4);
    }

    #[test]
    fn composing_onto_sync_work_is_detected_on_the_sync_thread() {
        let scheduler = test_scheduler();
        scheduler.tick().unwrap();

        let inner_scheduler = scheduler.clone();
        let composed = Promise::supplying_async(&scheduler, || Ok(3))
            .then_compose_async(move |v| Ok(Promise::supplying_sync(&inner_scheduler, move || Ok(v + 1))));

        assert!(matches!(composed.get(WAIT), Err(PromiseError::WouldDeadlock)));
        assert!(matches!(composed.join(), Err(PromiseError::WouldDeadlock)));

        tick_until_done(&scheduler, &composed);
        assert_eq!(composed.join().unwrap(), 4);
    }

    #[test]
    fn then_run_ignores_the_value_and_keeps_failures() {
        let scheduler = test_scheduler();
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = ran.clone();
        let done = Promise::completed(&scheduler, "ignored").then_run_sync(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        scheduler.tick().unwrap();
        assert!(done.try_get().unwrap().is_ok());

        let counter = ran.clone();
        let skipped = Promise::<u8>::failed(&scheduler, PromiseError::execution(anyhow::anyhow!("upstream")))
            .then_run_async(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        assert!(skipped.get(WAIT).unwrap_err().to_string().contains("upstream"));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delayed_stages_wait_for_their_tick() {
        let scheduler = test_scheduler();
        let seen = Arc::new(AtomicUsize::new(0));

        let sink = seen.clone();
        let accepted = Promise::completed(&scheduler, 7)
            .then_accept_delayed_sync(
                move |v| {
                    sink.store(v, Ordering::SeqCst);
                    Ok(())
                },
                Ticks(2),
            )
            .unwrap();
        let ran = Promise::completed(&scheduler, ()).then_run_delayed_sync(|| Ok(()), Ticks(2)).unwrap();
        let recovered = Promise::<i32>::failed(&scheduler, PromiseError::execution(anyhow::anyhow!("boom")))
            .exceptionally_delayed_sync(|_| Ok(-1), Ticks(2))
            .unwrap();

        scheduler.tick().unwrap();
        assert!(!accepted.is_done());
        assert!(!ran.is_done());
        assert!(!recovered.is_done());

        scheduler.tick().unwrap();
        assert!(accepted.try_get().unwrap().is_ok());
        assert_eq!(seen.load(Ordering::SeqCst), 7);
        assert!(ran.try_get().unwrap().is_ok());
        assert_eq!(recovered.try_get().unwrap().unwrap(), -1);

        let passthrough = Promise::completed(&scheduler, 5)
            .exceptionally_delayed_sync(|_| Ok(0), Ticks(4))
            .unwrap();
        assert_eq!(passthrough.try_get().unwrap().unwrap(), 5);
    }

    #[test]
    fn delayed_compose_adopts_the_inner_promise() {
        let scheduler = test_scheduler();
        let inner_scheduler = scheduler.clone();
        let composed = Promise::completed(&scheduler, 20)
            .then_compose_delayed_sync(move |v| Ok(Promise::completed(&inner_scheduler, v + 1)), Ticks(2))
            .unwrap();

        scheduler.tick().unwrap();
        assert!(!composed.is_done());
        scheduler.tick().unwrap();
        assert_eq!(composed.try_get().unwrap().unwrap(), 21);
    }

    #[test]
    fn negative_stage_delays_are_rejected() {
        let scheduler = test_scheduler();
        let promise = Promise::completed(&scheduler, 1);
        assert!(promise.then_run_delayed_async(|| Ok(()), Ticks(-1)).is_err());
        assert!(promise.then_accept_delayed_async(|_| Ok(()), Ticks(-1)).is_err());
        let inner_scheduler = scheduler.clone();
        assert!(promise
            .then_compose_delayed_async(move |v| Ok(Promise::completed(&inner_scheduler, v)), Ticks(-1))
            .is_err());
        assert!(promise.exceptionally_delayed_async(|_| Ok(0), Ticks(-1)).is_err());
        assert!(promise.then_apply_delayed_async(|v| Ok(v), Ticks(-1)).is_err());
    }

    #[test]
    fn scheduler_supplies_values_later() {
        let scheduler = test_scheduler();
        let supplied = scheduler.supply_later(ExecutionContext::Sync, || 11, Ticks(1)).unwrap();
        let called = scheduler
            .call_later(ExecutionContext::Sync, || -> anyhow::Result<u8> { anyhow::bail!("no value") }, Ticks(1))
            .unwrap();

        scheduler.tick().unwrap();
        assert_eq!(supplied.try_get().unwrap().unwrap(), 11);
        assert!(called.try_get().unwrap().unwrap_err().to_string().contains("no value"));

        assert!(scheduler.supply_later(ExecutionContext::Async, || 0, Ticks(-2)).is_err());
        let async_value = scheduler.call_later(ExecutionContext::Async, || Ok(8), Ticks::ZERO).unwrap();
        assert_eq!(async_value.get(WAIT).unwrap(), 8);
    }

    #[test]
    fn panicking_stage_fails_the_promise() {
        let scheduler = test_scheduler();
        let result = Promise::supplying_async(&scheduler, || Ok(1))
            .then_apply_async(|_: i32| -> anyhow::Result<i32> { panic!("stage blew up") })
            .get(WAIT);
        match result {
            Err(PromiseError::Execution(ExecutionError::Panicked(message))) => {
                assert_eq!(message, "stage blew up")
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn delayed_supply_waits_for_its_tick() {
        let scheduler = test_scheduler();
        let promise =
            Promise::supplying_delayed(&scheduler, ExecutionContext::Sync, || Ok("late"), Ticks(2)).unwrap();
        scheduler.tick().unwrap();
        assert!(!promise.is_done());
        scheduler.tick().unwrap();
        assert_eq!(promise.try_get().unwrap().unwrap(), "late");

        assert!(Promise::<u8>::supplying_delayed(&scheduler, ExecutionContext::Sync, || Ok(0), Ticks(-3)).is_err());
    }

    #[test]
    fn registry_close_cancels_bound_promises() {
        let scheduler = test_scheduler();
        let registry = TerminableRegistry::new();
        let promise = registry.bind(Promise::<u32>::empty(&scheduler));
        registry.close_and_report();
        assert!(promise.is_cancelled());
    }

    #[test]
    fn shutdown_fails_queued_stages() {
        let scheduler = test_scheduler();
        let promise = Promise::supplying_sync(&scheduler, || Ok(1));
        scheduler.shutdown();
        assert!(matches!(
            promise.try_get(),
            Some(Err(PromiseError::ContextUnavailable(ExecutionContext::Sync)))
        ));
    }

    #[tokio::test]
    async fn wait_bridges_into_async_code() {
        let scheduler =
            Scheduler::with_handle(crate::config::SchedulerConfig::default(), tokio::runtime::Handle::current())
                .unwrap();
        let value = scheduler
            .supply(ExecutionContext::Async, || Ok(21))
            .then_apply_async(|v| Ok(v * 2))
            .wait()
            .await;
        assert_eq!(value.unwrap(), 42);
    }
}
