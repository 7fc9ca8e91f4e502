//! Fair Lock
//!
//! A reentrant mutual-exclusion lock that hands ownership to waiting threads
//! in the exact order they asked for it.
//!
//! # Hand-off
//!
//! Ownership passes to the head of the wait queue *inside* `release()`, under
//! the same internal guard. A thread that releases and immediately
//! re-acquires (a `run()` loop between steps) queues behind everyone already
//! waiting.
//!
//! ```text
//!   acquire(t2)  acquire(t3)          release(t1)
//!        │            │                    │
//!        ▼            ▼                    ▼
//!   ┌─────────┬─────────┐   owner=t1  ──►  owner=t2, queue=[t3]
//!   │   t2    │   t3    │
//!   └─────────┴─────────┘
//! ```

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Errors raised by [`FairLock`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    /// `release()` was called by a thread that does not own the lock
    #[error("cannot release lock not owned by current thread")]
    NotOwner,
}

/// One blocked `acquire()` call
#[derive(Debug)]
struct Waiter {
    /// Unique per call, used to find ourselves in the queue on timeout
    ticket: u64,
    thread: ThreadId,
    wake: Condvar,
}

#[derive(Debug, Default)]
struct LockState {
    owner: Option<ThreadId>,
    count: usize,
    waiters: VecDeque<Arc<Waiter>>,
}

/// Reentrant lock with strict FIFO hand-off
#[derive(Debug, Default)]
pub struct FairLock {
    state: Mutex<LockState>,
    next_ticket: AtomicU64,
}

impl FairLock {
    /// Create a new, unowned lock
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock.
    ///
    /// Returns `true` once the calling thread owns the lock. With
    /// `blocking = false` the call never waits. `timeout = None` waits forever;
    /// a timed-out waiter leaves the queue and gets `false`, unless ownership
    /// was handed to it in the meantime, in which case it keeps it.
    pub fn acquire(&self, blocking: bool, timeout: Option<Duration>) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();

        if state.owner == Some(me) {
            state.count += 1;
            return true;
        }

        if state.owner.is_none() {
            state.owner = Some(me);
            state.count = 1;
            return true;
        }

        if !blocking {
            return false;
        }

        let waiter = Arc::new(Waiter {
            ticket: self.next_ticket.fetch_add(1, Ordering::Relaxed),
            thread: me,
            wake: Condvar::new(),
        });
        state.waiters.push_back(Arc::clone(&waiter));

        let deadline = timeout.map(|t| Instant::now() + t);

        // Ownership is assigned to us by release(); loop guards against spurious wakeups.
        while state.owner != Some(me) {
            match deadline {
                None => waiter.wake.wait(&mut state),
                Some(deadline) => {
                    if waiter.wake.wait_until(&mut state, deadline).timed_out()
                        && state.owner != Some(me)
                    {
                        state.waiters.retain(|w| w.ticket != waiter.ticket);
                        tracing::trace!(ticket = waiter.ticket, "Fair lock acquire timed out");
                        return false;
                    }
                }
            }
        }

        debug_assert_eq!(state.count, 1);
        true
    }

    /// Release one level of ownership.
    ///
    /// When the reentrancy count reaches zero, ownership passes directly to
    /// the longest-waiting thread (if any).
    ///
    /// # Errors
    ///
    /// Returns [`LockError::NotOwner`] if the calling thread does not own the lock.
    pub fn release(&self) -> Result<(), LockError> {
        let me = thread::current().id();
        let mut state = self.state.lock();

        if state.owner != Some(me) {
            return Err(LockError::NotOwner);
        }

        state.count -= 1;
        if state.count > 0 {
            return Ok(());
        }

        state.owner = None;
        if let Some(next) = state.waiters.pop_front() {
            state.owner = Some(next.thread);
            state.count = 1;
            next.wake.notify_one();
        }
        Ok(())
    }

    /// Block until the lock is owned and return a guard that releases it on drop
    pub fn lock(&self) -> FairLockGuard<'_> {
        self.acquire(true, None);
        FairLockGuard::new(self)
    }

    /// Try to take the lock without waiting
    pub fn try_lock(&self) -> Option<FairLockGuard<'_>> {
        self.acquire(false, None).then(|| FairLockGuard::new(self))
    }

    /// Wait at most `timeout` for the lock
    pub fn try_lock_for(&self, timeout: Duration) -> Option<FairLockGuard<'_>> {
        self.acquire(true, Some(timeout))
            .then(|| FairLockGuard::new(self))
    }

    /// Whether any thread currently owns the lock
    #[must_use]
    pub fn locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    /// Whether the calling thread owns the lock
    #[must_use]
    pub fn owned(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }

    /// Number of threads queued behind the current owner
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

/// Scoped ownership of a [`FairLock`].
///
/// Not `Send`: the lock must be released by the thread that acquired it.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct FairLockGuard<'a> {
    lock: &'a FairLock,
    _not_send: PhantomData<*const ()>,
}

impl<'a> FairLockGuard<'a> {
    fn new(lock: &'a FairLock) -> Self {
        Self {
            lock,
            _not_send: PhantomData,
        }
    }
}

impl Drop for FairLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release() {
            tracing::error!(error = %e, "Fair lock guard released by non-owner");
        }
    }
}

impl std::fmt::Debug for FairLockGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FairLockGuard").finish_non_exhaustive()
    }
}
