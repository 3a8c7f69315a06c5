use crate::context::ExecutionContext;
use crate::error::ExecutionError;
use crate::terminable::{Ownership, Terminable};
use crate::ticks::Ticks;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::task::AbortHandle;
use tracing::trace;

pub type TaskId = u64;

pub(crate) type TaskTable = DashMap<TaskId, Task>;

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const COMPLETED: u8 = 2;
const CANCELLED: u8 = 3;

/// Lifecycle of a scheduled task.
///
/// `Pending → Running → Pending` for repeating work, `Pending → Running →
/// Completed` for one-shot work. `Cancelled` is terminal and reachable from
/// any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Cancelled,
}

impl TaskState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            PENDING => TaskState::Pending,
            RUNNING => TaskState::Running,
            COMPLETED => TaskState::Completed,
            _ => TaskState::Cancelled,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Cancelled)
    }
}

/// Result of the most recent run of a task.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Succeeded,
    Failed(ExecutionError),
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded)
    }
}

struct TaskShared {
    id: TaskId,
    context: ExecutionContext,
    delay: Ticks,
    interval: Option<Ticks>,
    state: AtomicU8,
    times_ran: AtomicU64,
    last_outcome: Mutex<Option<TaskOutcome>>,
    /// Handle of the timer future that will start the next run, when there is one.
    abort: Mutex<Option<AbortHandle>>,
    table: Weak<TaskTable>,
    ownership: Ownership,
}

/// Handle to work submitted to the [`Scheduler`](super::Scheduler).
///
/// Cheap to clone; every clone controls the same task.
#[derive(Clone)]
pub struct Task {
    shared: Arc<TaskShared>,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        context: ExecutionContext,
        delay: Ticks,
        interval: Option<Ticks>,
        table: &Arc<TaskTable>,
    ) -> Self {
        let task = Self::with_state(id, context, delay, interval, PENDING, Arc::downgrade(table));
        table.insert(id, task.clone());
        task
    }

    /// A task that was never scheduled because its context is gone.
    pub(crate) fn cancelled(
        id: TaskId,
        context: ExecutionContext,
        delay: Ticks,
        interval: Option<Ticks>,
    ) -> Self {
        Self::with_state(id, context, delay, interval, CANCELLED, Weak::new())
    }

    fn with_state(
        id: TaskId,
        context: ExecutionContext,
        delay: Ticks,
        interval: Option<Ticks>,
        state: u8,
        table: Weak<TaskTable>,
    ) -> Self {
        Self {
            shared: Arc::new(TaskShared {
                id,
                context,
                delay,
                interval,
                state: AtomicU8::new(state),
                times_ran: AtomicU64::new(0),
                last_outcome: Mutex::new(None),
                abort: Mutex::new(None),
                table,
                ownership: Ownership::new(),
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    pub fn context(&self) -> ExecutionContext {
        self.shared.context
    }

    pub fn delay(&self) -> Ticks {
        self.shared.delay
    }

    pub fn interval(&self) -> Option<Ticks> {
        self.shared.interval
    }

    pub fn is_repeating(&self) -> bool {
        self.shared.interval.is_some()
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_raw(self.shared.state.load(Ordering::Acquire))
    }

    /// Number of completed runs, successful or not.
    pub fn times_ran(&self) -> u64 {
        self.shared.times_ran.load(Ordering::Acquire)
    }

    pub fn last_outcome(&self) -> Option<TaskOutcome> {
        self.shared
            .last_outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == TaskState::Cancelled
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    /// Stops the task. Returns `true` only for the call that actually
    /// cancelled it.
    ///
    /// A run that is already in progress finishes; no further runs start.
    pub fn cancel(&self) -> bool {
        let mut current = self.shared.state.load(Ordering::Acquire);
        loop {
            if TaskState::from_raw(current).is_terminal() {
                return false;
            }
            match self.shared.state.compare_exchange(
                current,
                CANCELLED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        // Only a waiting timer is aborted; an in-flight run notices the state change itself.
        if current == PENDING {
            let handle = self
                .shared
                .abort
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(handle) = handle {
                handle.abort();
            }
        }

        trace!("⛔ Task #{} cancelled", self.shared.id);
        self.retire();
        true
    }

    /// Claims the next run. Fails once the task is cancelled.
    pub(crate) fn begin_run(&self) -> bool {
        self.shared
            .state
            .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Records a finished run. Returns `true` when a repeating task should be
    /// rescheduled.
    pub(crate) fn finish_run(&self, outcome: Result<(), ExecutionError>) -> bool {
        let outcome = match outcome {
            Ok(()) => TaskOutcome::Succeeded,
            Err(error) => TaskOutcome::Failed(error),
        };
        *self
            .shared
            .last_outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(outcome);
        self.shared.times_ran.fetch_add(1, Ordering::AcqRel);

        let next = if self.is_repeating() { PENDING } else { COMPLETED };
        let rescheduled = self
            .shared
            .state
            .compare_exchange(RUNNING, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            && next == PENDING;

        if !rescheduled {
            self.retire();
        }
        rescheduled
    }

    pub(crate) fn set_abort_handle(&self, handle: AbortHandle) {
        let mut slot = self
            .shared
            .abort
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.state().is_terminal() {
            handle.abort();
        } else {
            *slot = Some(handle);
        }
    }

    fn retire(&self) {
        if let Some(table) = self.shared.table.upgrade() {
            table.remove(&self.shared.id);
        }
    }
}

impl Terminable for Task {
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

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.shared.id)
            .field("context", &self.shared.context)
            .field("delay", &self.shared.delay)
            .field("interval", &self.shared.interval)
            .field("state", &self.state())
            .field("times_ran", &self.times_ran())
            .finish()
    }
}
