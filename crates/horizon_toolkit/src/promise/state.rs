use crate::error::PromiseError;
use crate::terminable::Ownership;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Longest a sync-thread wait goes without re-checking the dependency chain.
const SYNC_RECHECK: Duration = Duration::from_millis(10);

pub(crate) type Outcome<T> = Result<T, PromiseError>;

pub(crate) type Continuation<T> = Box<dyn FnOnce(&Outcome<T>) + Send>;

enum State<T> {
    Pending(Vec<Continuation<T>>),
    Done(Outcome<T>),
}

/// Answers whether a pending promise can only complete once the sync
/// context advances.
pub(crate) trait SyncDependency: Send + Sync {
    fn depends_on_sync(&self) -> bool;
}

pub(crate) struct Shared<T> {
    state: Mutex<State<T>>,
    done: Condvar,
    /// The stage producing this promise is queued on the sync context.
    sync_stage: AtomicBool,
    /// The promise this one is waiting on, if any.
    upstream: Mutex<Option<Arc<dyn SyncDependency>>>,
    pub(crate) ownership: Ownership,
}

impl<T: Clone + Send + 'static> Shared<T> {
    pub(crate) fn new(sync_stage: bool, upstream: Option<Arc<dyn SyncDependency>>) -> Self {
        Self {
            state: Mutex::new(State::Pending(Vec::new())),
            done: Condvar::new(),
            sync_stage: AtomicBool::new(sync_stage),
            upstream: Mutex::new(upstream),
            ownership: Ownership::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves the promise to its terminal state. Only the first call succeeds.
    ///
    /// Continuations run on the calling thread, after the lock is released.
    pub(crate) fn settle(&self, outcome: Outcome<T>) -> bool {
        let continuations = {
            let mut state = self.lock();
            let waiting = match &mut *state {
                State::Done(_) => return false,
                State::Pending(waiting) => std::mem::take(waiting),
            };
            *state = State::Done(outcome.clone());
            waiting
        };

        self.sync_stage.store(false, Ordering::Release);
        self.upstream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.done.notify_all();

        for continuation in continuations {
            continuation(&outcome);
        }
        true
    }

    /// Runs `continuation` once the promise is terminal; immediately if it
    /// already is.
    pub(crate) fn on_complete(&self, continuation: Continuation<T>) {
        let outcome = {
            let mut state = self.lock();
            match &mut *state {
                State::Pending(waiting) => {
                    waiting.push(continuation);
                    return;
                }
                State::Done(outcome) => outcome.clone(),
            }
        };
        continuation(&outcome);
    }

    pub(crate) fn peek(&self) -> Option<Outcome<T>> {
        match &*self.lock() {
            State::Done(outcome) => Some(outcome.clone()),
            State::Pending(_) => None,
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        matches!(&*self.lock(), State::Done(_))
    }

    /// Re-points the dependency chain once a stage has run.
    ///
    /// Blocked readers are woken so they re-evaluate the new chain.
    pub(crate) fn follow(&self, upstream: Arc<dyn SyncDependency>) {
        *self.upstream.lock().unwrap_or_else(PoisonError::into_inner) = Some(upstream);
        self.sync_stage.store(false, Ordering::Release);
        let _state = self.lock();
        self.done.notify_all();
    }

    /// Same as [`SyncDependency::depends_on_sync`], for callers already
    /// holding the state lock on a pending promise.
    fn pending_depends_on_sync(&self) -> bool {
        if self.sync_stage.load(Ordering::Acquire) {
            return true;
        }
        let upstream = self
            .upstream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        upstream.is_some_and(|upstream| upstream.depends_on_sync())
    }

    /// Blocks until terminal, or until `timeout` elapses.
    ///
    /// With `on_sync_thread` set, the wait gives up with
    /// [`PromiseError::WouldDeadlock`] as soon as the chain comes to need the
    /// sync context. Links further up the chain can be re-pointed without
    /// waking this promise, so the sync thread waits in short slices.
    pub(crate) fn block(&self, timeout: Option<Duration>, on_sync_thread: bool) -> Outcome<T> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.lock();
        loop {
            if let State::Done(outcome) = &*state {
                return outcome.clone();
            }
            if on_sync_thread && self.pending_depends_on_sync() {
                return Err(PromiseError::WouldDeadlock);
            }
            let slice = match (deadline, timeout) {
                (Some(deadline), Some(timeout)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PromiseError::Timeout(timeout));
                    }
                    Some(deadline - now)
                }
                _ => None,
            };
            let slice = match (slice, on_sync_thread) {
                (Some(remaining), true) => Some(remaining.min(SYNC_RECHECK)),
                (None, true) => Some(SYNC_RECHECK),
                (slice, false) => slice,
            };
            state = match slice {
                Some(slice) => {
                    self.done
                        .wait_timeout(state, slice)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .done
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }
}

impl<T: Clone + Send + 'static> SyncDependency for Shared<T> {
    fn depends_on_sync(&self) -> bool {
        !self.is_done() && self.pending_depends_on_sync()
    }
}
