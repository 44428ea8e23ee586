//! The aggregate "leave the fast path" flag polled by the dispatch loop.

use std::sync::atomic::{AtomicU8, Ordering};

/// Pending calls are queued.
pub(crate) const PENDING_CALLS: u8 = 1 << 0;
/// A waiting context asked the running one to release the execution lock.
pub(crate) const DROP_REQUEST: u8 = 1 << 1;
/// An asynchronous exception was injected into some context.
pub(crate) const ASYNC_EXC: u8 = 1 << 2;

/// Bitmask of maintenance requests shared by every context of an interpreter.
///
/// The dispatch loop only tests [`EvalBreaker::is_set`]; the individual bits are read
/// at the maintenance checkpoint.
#[derive(Debug, Default)]
pub(crate) struct EvalBreaker {
    bits: AtomicU8,
}

impl EvalBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any maintenance is requested.
    #[inline]
    pub fn is_set(&self) -> bool {
        self.bits.load(Ordering::Relaxed) != 0
    }

    #[inline]
    pub fn contains(&self, bit: u8) -> bool {
        self.bits.load(Ordering::Acquire) & bit != 0
    }

    pub fn set(&self, bit: u8) {
        self.bits.fetch_or(bit, Ordering::Release);
    }

    pub fn clear(&self, bit: u8) {
        self.bits.fetch_and(!bit, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_are_independent() {
        let breaker = EvalBreaker::new();
        assert!(!breaker.is_set());
        breaker.set(PENDING_CALLS);
        breaker.set(ASYNC_EXC);
        assert!(breaker.contains(PENDING_CALLS));
        assert!(!breaker.contains(DROP_REQUEST));
        breaker.clear(PENDING_CALLS);
        assert!(breaker.is_set());
        breaker.clear(ASYNC_EXC);
        assert!(!breaker.is_set());
    }
}
