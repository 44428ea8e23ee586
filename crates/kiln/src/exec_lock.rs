//! The cooperative lock that serializes bytecode execution across contexts.
//!
//! Only the holder runs bytecode. A context that has waited a full switch interval
//! without the holder changing sets [`DROP_REQUEST`] on the eval breaker; the holder
//! notices at its next maintenance checkpoint, releases the lock and waits until some
//! other context has taken it before queueing up again. This keeps a busy context from
//! immediately re-taking the lock it just released.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::{
    context::ContextId,
    eval_breaker::{DROP_REQUEST, EvalBreaker},
};

#[derive(Debug, Default)]
struct LockState {
    holder: Option<ContextId>,
    /// Most recent context to take the lock, kept after release.
    last_holder: Option<ContextId>,
    /// Bumped every time the lock changes hands between different contexts.
    switch_number: u64,
    waiters: usize,
}

#[derive(Debug)]
pub(crate) struct ExecLock {
    state: Mutex<LockState>,
    /// Signalled when the lock is released.
    available: Condvar,
    /// Signalled when a different context takes the lock.
    switched: Condvar,
    interval: Duration,
}

impl ExecLock {
    pub fn new(interval: Duration) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            available: Condvar::new(),
            switched: Condvar::new(),
            interval,
        }
    }

    /// Blocks until `id` holds the lock.
    pub fn acquire(&self, id: ContextId, breaker: &EvalBreaker) {
        let mut state = self.state.lock();
        state.waiters += 1;
        while state.holder.is_some() {
            let switches = state.switch_number;
            let timed_out = self.available.wait_for(&mut state, self.interval).timed_out();
            if timed_out && state.holder.is_some() && state.switch_number == switches {
                tracing::trace!(?id, holder = ?state.holder, "requesting execution lock drop");
                breaker.set(DROP_REQUEST);
            }
        }
        state.waiters -= 1;
        state.holder = Some(id);
        if state.last_holder != Some(id) {
            state.last_holder = Some(id);
            state.switch_number += 1;
            self.switched.notify_all();
        }
        breaker.clear(DROP_REQUEST);
    }

    pub fn release(&self, id: ContextId) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.holder, Some(id), "released by a context that does not hold it");
        state.holder = None;
        self.available.notify_one();
    }

    /// Releases the lock and takes it back, letting a waiting context run in between.
    ///
    /// When a drop was requested and someone is waiting, the caller does not re-queue
    /// until the lock has actually changed hands.
    pub fn hand_off(&self, id: ContextId, breaker: &EvalBreaker) {
        {
            let mut state = self.state.lock();
            debug_assert_eq!(state.holder, Some(id), "handed off by a context that does not hold it");
            state.holder = None;
            self.available.notify_one();
            if breaker.contains(DROP_REQUEST) && state.waiters > 0 && state.last_holder == Some(id) {
                breaker.clear(DROP_REQUEST);
                let switches = state.switch_number;
                tracing::debug!(?id, waiters = state.waiters, "handing off execution lock");
                while state.switch_number == switches {
                    self.switched.wait(&mut state);
                }
            }
        }
        self.acquire(id, breaker);
    }

    /// Takes the lock for the lifetime of the returned guard.
    pub fn lock<'a>(&'a self, id: ContextId, breaker: &'a EvalBreaker) -> ExecGuard<'a> {
        self.acquire(id, breaker);
        ExecGuard { lock: self, id }
    }

    #[cfg(test)]
    fn holder(&self) -> Option<ContextId> {
        self.state.lock().holder
    }
}

/// Holds the execution lock until dropped.
#[derive(Debug)]
pub(crate) struct ExecGuard<'a> {
    lock: &'a ExecLock,
    id: ContextId,
}

impl Drop for ExecGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        thread,
    };

    use super::*;

    #[test]
    fn guard_releases_on_drop() {
        let lock = ExecLock::new(Duration::from_millis(1));
        let breaker = EvalBreaker::new();
        {
            let _guard = lock.lock(ContextId::new(1), &breaker);
            assert_eq!(lock.holder(), Some(ContextId::new(1)));
        }
        assert_eq!(lock.holder(), None);
    }

    #[test]
    fn waiter_requests_a_drop_and_gets_the_lock() {
        let lock = Arc::new(ExecLock::new(Duration::from_millis(1)));
        let breaker = Arc::new(EvalBreaker::new());
        let first = ContextId::new(1);
        let second = ContextId::new(2);
        lock.acquire(first, &breaker);

        let ran = Arc::new(AtomicBool::new(false));
        let waiter = {
            let (lock, breaker, ran) = (Arc::clone(&lock), Arc::clone(&breaker), Arc::clone(&ran));
            thread::spawn(move || {
                let _guard = lock.lock(second, &breaker);
                ran.store(true, Ordering::SeqCst);
            })
        };

        // a running context polls the breaker at its checkpoints
        while !breaker.contains(DROP_REQUEST) {
            thread::yield_now();
        }
        lock.hand_off(first, &breaker);
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(lock.holder(), Some(first));
        lock.release(first);
        waiter.join().unwrap();
    }
}
