//! Fluent front end over [`Scheduler`] and [`Promise`].
//!
//! ```rust,no_run
//! # use horizon_toolkit::{Scheduler, SchedulerConfig, Ticks};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let scheduler = Scheduler::new(SchedulerConfig::default())?;
//! let greeting = scheduler.builder().async_().now().supply(|| Ok("hello".to_string()));
//!
//! scheduler
//!     .builder()
//!     .sync()
//!     .after(Ticks::seconds(1))
//!     .every(Ticks(5))
//!     .run(|| Ok(()))?;
//! # Ok(())
//! # }
//! ```

use super::{Scheduler, Task};
use crate::context::ExecutionContext;
use crate::error::SchedulerError;
use crate::promise::Promise;
use crate::ticks::Ticks;

pub struct TaskBuilder {
    scheduler: Scheduler,
}

impl TaskBuilder {
    pub(crate) fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }

    /// Targets the main thread.
    pub fn sync(self) -> TaskContextBuilder {
        self.on(ExecutionContext::Sync)
    }

    /// Targets the worker pool.
    pub fn async_(self) -> TaskContextBuilder {
        self.on(ExecutionContext::Async)
    }

    pub fn on(self, context: ExecutionContext) -> TaskContextBuilder {
        TaskContextBuilder {
            scheduler: self.scheduler,
            context,
        }
    }
}

pub struct TaskContextBuilder {
    scheduler: Scheduler,
    context: ExecutionContext,
}

impl TaskContextBuilder {
    pub fn now(self) -> ImmediateTaskBuilder {
        ImmediateTaskBuilder {
            scheduler: self.scheduler,
            context: self.context,
        }
    }

    pub fn after(self, delay: Ticks) -> DelayedTaskBuilder {
        DelayedTaskBuilder {
            scheduler: self.scheduler,
            context: self.context,
            delay,
        }
    }

    /// Repeats every `interval` ticks, starting with the next tick.
    pub fn every(self, interval: Ticks) -> RepeatingTaskBuilder {
        RepeatingTaskBuilder {
            scheduler: self.scheduler,
            context: self.context,
            delay: Ticks::ZERO,
            interval,
        }
    }

    /// Waits `ticks`, then repeats every `ticks`.
    pub fn after_and_every(self, ticks: Ticks) -> RepeatingTaskBuilder {
        RepeatingTaskBuilder {
            scheduler: self.scheduler,
            context: self.context,
            delay: ticks,
            interval: ticks,
        }
    }
}

pub struct ImmediateTaskBuilder {
    scheduler: Scheduler,
    context: ExecutionContext,
}

impl ImmediateTaskBuilder {
    pub fn supply<T, F>(self, f: F) -> Promise<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Promise::supplying(&self.scheduler, self.context, f)
    }

    pub fn run<F>(self, f: F) -> Promise<()>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.supply(f)
    }
}

pub struct DelayedTaskBuilder {
    scheduler: Scheduler,
    context: ExecutionContext,
    delay: Ticks,
}

impl DelayedTaskBuilder {
    pub fn supply<T, F>(self, f: F) -> Result<Promise<T>, SchedulerError>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Promise::supplying_delayed(&self.scheduler, self.context, f, self.delay)
    }

    pub fn run<F>(self, f: F) -> Result<Promise<()>, SchedulerError>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.supply(f)
    }

    /// Keeps the initial delay and repeats every `interval` ticks after it.
    pub fn every(self, interval: Ticks) -> RepeatingTaskBuilder {
        RepeatingTaskBuilder {
            scheduler: self.scheduler,
            context: self.context,
            delay: self.delay,
            interval,
        }
    }
}

pub struct RepeatingTaskBuilder {
    scheduler: Scheduler,
    context: ExecutionContext,
    delay: Ticks,
    interval: Ticks,
}

impl RepeatingTaskBuilder {
    pub fn run<F>(self, mut f: F) -> Result<Task, SchedulerError>
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        self.consume(move |_| f())
    }

    /// Like [`run`](Self::run), with access to the task handle.
    pub fn consume<F>(self, f: F) -> Result<Task, SchedulerError>
    where
        F: FnMut(&Task) -> anyhow::Result<()> + Send + 'static,
    {
        self.scheduler
            .run_repeating(self.context, f, self.delay, self.interval)
    }
}

#[cfg(test)]
mod tests {
    use crate::scheduler::tests::test_scheduler;
    use crate::ticks::Ticks;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn now_supplies_a_promise() {
        let scheduler = test_scheduler();
        let promise = scheduler.builder().async_().now().supply(|| Ok(5u8));
        assert_eq!(promise.get(Duration::from_secs(5)).unwrap(), 5);
    }

    #[test]
    fn after_and_every_schedule_repeating_sync_work() {
        let scheduler = test_scheduler();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let task = scheduler
            .builder()
            .sync()
            .after_and_every(Ticks(2))
            .run(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        for _ in 0..6 {
            scheduler.tick().unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(task.interval(), Some(Ticks(2)));
        task.cancel();
    }

    #[test]
    fn delayed_builder_validates_timing() {
        let scheduler = test_scheduler();
        assert!(scheduler.builder().sync().after(Ticks(-1)).run(|| Ok(())).is_err());
        assert!(scheduler
            .builder()
            .async_()
            .after(Ticks::ONE)
            .every(Ticks::ZERO)
            .run(|| Ok(()))
            .is_err());
    }
}
