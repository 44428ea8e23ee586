//! Bounded FIFO of callbacks deferred to the next maintenance checkpoint.
//!
//! Any thread may enqueue. Only the primary execution context drains the queue, from
//! inside its dispatch loop, so callbacks always run while the execution lock is held.

use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;

use crate::{
    eval_breaker::{EvalBreaker, PENDING_CALLS},
    exception_public::Exception,
};

/// A deferred callback. Returning an error raises it in the primary context.
pub type PendingCallback = fn(usize) -> Result<(), Exception>;

/// Why [`crate::Interpreter::add_pending_call`] could not enqueue a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingCallError {
    /// Every slot is occupied.
    QueueFull,
    /// The queue lock stayed contended for all retries.
    Busy,
}

impl fmt::Display for PendingCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull => f.write_str("pending call queue is full"),
            Self::Busy => f.write_str("pending call queue is busy"),
        }
    }
}

impl std::error::Error for PendingCallError {}

#[derive(Debug)]
struct Ring {
    slots: Box<[Option<(PendingCallback, usize)>]>,
    head: usize,
    len: usize,
}

impl Ring {
    fn push(&mut self, entry: (PendingCallback, usize)) -> bool {
        if self.len == self.slots.len() {
            return false;
        }
        let tail = (self.head + self.len) % self.slots.len();
        self.slots[tail] = Some(entry);
        self.len += 1;
        true
    }

    fn pop(&mut self) -> Option<(PendingCallback, usize)> {
        if self.len == 0 {
            return None;
        }
        let entry = self.slots[self.head].take();
        self.head = (self.head + 1) % self.slots.len();
        self.len -= 1;
        entry
    }
}

#[derive(Debug)]
pub(crate) struct PendingCalls {
    ring: Mutex<Ring>,
    /// Set while a drain is running, so a callback cannot start a nested one.
    busy: AtomicBool,
    lock_retries: usize,
}

impl PendingCalls {
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize, lock_retries: usize) -> Self {
        assert!(capacity > 0, "pending call queue needs at least one slot");
        Self {
            ring: Mutex::new(Ring {
                slots: vec![None; capacity].into_boxed_slice(),
                head: 0,
                len: 0,
            }),
            busy: AtomicBool::new(false),
            lock_retries,
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().slots.len()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len
    }

    /// Enqueues a callback without allocating and without blocking indefinitely.
    pub fn push(&self, callback: PendingCallback, arg: usize, breaker: &EvalBreaker) -> Result<(), PendingCallError> {
        let mut ring = None;
        for _ in 0..=self.lock_retries {
            if let Some(guard) = self.ring.try_lock() {
                ring = Some(guard);
                break;
            }
            std::hint::spin_loop();
        }
        let mut ring = ring.ok_or(PendingCallError::Busy)?;
        if !ring.push((callback, arg)) {
            return Err(PendingCallError::QueueFull);
        }
        breaker.set(PENDING_CALLS);
        Ok(())
    }

    /// Runs queued callbacks in order, at most one queue's worth per call.
    ///
    /// The first failing callback stops the drain; the remaining entries stay queued and
    /// the pending bit stays set for the next checkpoint.
    pub fn make_pending_calls(&self, breaker: &EvalBreaker) -> Result<(), Exception> {
        if self.busy.swap(true, Ordering::Acquire) {
            return Ok(());
        }
        let result = self.drain(breaker);
        self.busy.store(false, Ordering::Release);
        result
    }

    fn drain(&self, breaker: &EvalBreaker) -> Result<(), Exception> {
        let capacity = self.capacity();
        let mut ran = 0;
        for _ in 0..capacity {
            let entry = {
                let mut ring = self.ring.lock();
                let entry = ring.pop();
                if ring.len == 0 {
                    breaker.clear(PENDING_CALLS);
                } else {
                    breaker.set(PENDING_CALLS);
                }
                entry
            };
            let Some((callback, arg)) = entry else {
                break;
            };
            ran += 1;
            if let Err(exc) = callback(arg) {
                tracing::debug!(ran, error = %exc.summary(), "pending call failed");
                return Err(exc);
            }
        }
        tracing::trace!(ran, "pending calls drained");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use proptest::prelude::*;

    use super::*;
    use crate::exception_private::ExcType;

    static SEEN: StdMutex<Vec<usize>> = StdMutex::new(Vec::new());

    fn record(arg: usize) -> Result<(), Exception> {
        SEEN.lock().unwrap().push(arg);
        Ok(())
    }

    fn fail_on_odd(arg: usize) -> Result<(), Exception> {
        if arg % 2 == 1 {
            Err(Exception::new(ExcType::ValueError, Some(format!("odd {arg}"))))
        } else {
            Ok(())
        }
    }

    fn noop(_: usize) -> Result<(), Exception> {
        Ok(())
    }

    #[test]
    fn full_queue_rejects_without_corruption() {
        let breaker = EvalBreaker::new();
        let queue = PendingCalls::new(2, 10);
        queue.push(noop, 1, &breaker).unwrap();
        queue.push(noop, 2, &breaker).unwrap();
        assert_eq!(queue.push(noop, 3, &breaker), Err(PendingCallError::QueueFull));
        assert_eq!(queue.len(), 2);
        assert!(breaker.contains(PENDING_CALLS));
        queue.make_pending_calls(&breaker).unwrap();
        assert_eq!(queue.len(), 0);
        assert!(!breaker.contains(PENDING_CALLS));
    }

    #[test]
    fn failing_callback_stops_the_drain() {
        let breaker = EvalBreaker::new();
        let queue = PendingCalls::new(4, 10);
        for arg in [0, 1, 2] {
            queue.push(fail_on_odd, arg, &breaker).unwrap();
        }
        let err = queue.make_pending_calls(&breaker).unwrap_err();
        assert_eq!(err.message(), Some("odd 1"));
        assert_eq!(queue.len(), 1);
        assert!(breaker.contains(PENDING_CALLS));
        queue.make_pending_calls(&breaker).unwrap();
        assert!(!breaker.contains(PENDING_CALLS));
    }

    #[test]
    fn contended_lock_reports_busy() {
        let breaker = EvalBreaker::new();
        let queue = PendingCalls::new(4, 3);
        let _held = queue.ring.lock();
        assert_eq!(queue.push(noop, 1, &breaker), Err(PendingCallError::Busy));
    }

    proptest! {
        #[test]
        fn drains_in_fifo_order(capacity in 1usize..16, rounds in 1usize..4, seed in 0usize..1000) {
            let breaker = EvalBreaker::new();
            let queue = PendingCalls::new(capacity, 10);
            for round in 0..rounds {
                let expected: Vec<usize> = (0..capacity).map(|i| seed + round * 100 + i).collect();
                for &arg in &expected {
                    queue.push(record, arg, &breaker).unwrap();
                }
                prop_assert_eq!(queue.push(record, 0, &breaker), Err(PendingCallError::QueueFull));
                SEEN.lock().unwrap().clear();
                queue.make_pending_calls(&breaker).unwrap();
                let seen = std::mem::take(&mut *SEEN.lock().unwrap());
                prop_assert_eq!(seen, expected);
            }
        }
    }
}
