//! The main-thread tick queue.

use super::Job;
use crate::error::SchedulerError;
use crate::report::panic_message;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, ThreadId};
use tracing::{debug, error};

struct Scheduled {
    due: u64,
    seq: u64,
    job: Job,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed so the max-heap pops the earliest (due, seq) first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.due, other.seq).cmp(&(self.due, self.seq))
    }
}

struct Queue {
    open: bool,
    next_seq: u64,
    heap: BinaryHeap<Scheduled>,
}

/// Work queue drained by the host's main thread, once per tick.
///
/// The first thread to call [`tick`](Self::tick) (or
/// [`bind_current_thread`](Self::bind_current_thread)) becomes the sync
/// thread for the lifetime of the context. Work submitted while tick `t` is
/// current with a delay of `d` ticks runs during tick `t + max(d, 1)`; work
/// due on the same tick runs in submission order.
pub struct SyncContext {
    queue: Mutex<Queue>,
    current_tick: AtomicU64,
    thread: OnceLock<ThreadId>,
}

impl SyncContext {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(Queue {
                open: true,
                next_seq: 0,
                heap: BinaryHeap::new(),
            }),
            current_tick: AtomicU64::new(0),
            thread: OnceLock::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the calling thread the sync thread.
    pub fn bind_current_thread(&self) -> Result<(), SchedulerError> {
        let current = thread::current().id();
        if *self.thread.get_or_init(|| current) == current {
            Ok(())
        } else {
            Err(SchedulerError::ForeignThread)
        }
    }

    /// Whether the calling thread is the sync thread.
    pub fn is_current_thread(&self) -> bool {
        self.thread.get() == Some(&thread::current().id())
    }

    /// The last tick that started.
    pub fn current_tick(&self) -> u64 {
        self.current_tick.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    /// Jobs waiting for a future tick.
    pub fn pending(&self) -> usize {
        self.lock().heap.len()
    }

    pub(crate) fn post(&self, job: Job, delay_ticks: u64) -> Result<(), SchedulerError> {
        let rejected = {
            let mut queue = self.lock();
            if queue.open {
                let due = self.current_tick().saturating_add(delay_ticks.max(1));
                let seq = queue.next_seq;
                queue.next_seq += 1;
                queue.heap.push(Scheduled { due, seq, job });
                None
            } else {
                Some(job)
            }
        };

        match rejected {
            // Dropped outside the lock; abandoning a job may post follow-up work.
            Some(job) => {
                drop(job);
                Err(SchedulerError::ContextUnavailable(
                    crate::context::ExecutionContext::Sync,
                ))
            }
            None => Ok(()),
        }
    }

    /// Advances one tick and runs every job that is due. Returns the number
    /// of jobs run.
    ///
    /// Must be called from the sync thread; a panicking job is logged and
    /// does not stop the rest of the tick.
    pub fn tick(&self) -> Result<usize, SchedulerError> {
        self.bind_current_thread()?;
        let tick = self.current_tick.fetch_add(1, Ordering::AcqRel) + 1;

        let due = {
            let mut queue = self.lock();
            let mut due = Vec::new();
            while queue.heap.peek().is_some_and(|next| next.due <= tick) {
                if let Some(next) = queue.heap.pop() {
                    due.push(next.job);
                }
            }
            due
        };

        let count = due.len();
        for job in due {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| job.run())) {
                error!(
                    "❌ Sync job panicked on tick {}: {}",
                    tick,
                    panic_message(payload)
                );
            }
        }
        Ok(count)
    }

    /// Stops accepting work and abandons everything still queued.
    pub(crate) fn close(&self) {
        let abandoned = {
            let mut queue = self.lock();
            queue.open = false;
            std::mem::take(&mut queue.heap)
        };
        if !abandoned.is_empty() {
            debug!("🗑️ Abandoning {} queued sync job(s)", abandoned.len());
        }
        drop(abandoned);
    }
}
