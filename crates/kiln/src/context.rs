//! Execution contexts: the per-thread side of an [`Interpreter`](crate::Interpreter).
//!
//! Each context owns its recursion bookkeeping and call statistics, and runs programs
//! while holding the interpreter's execution lock. Contexts cooperate through the
//! maintenance checkpoint in the dispatch loop: that is where pending calls are
//! drained, the lock is handed to a waiting context and injected exceptions surface.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    bytecode::VM,
    eval_breaker::{ASYNC_EXC, DROP_REQUEST, PENDING_CALLS},
    exception_private::{ExcType, RunError, RunResult, SimpleException},
    exception_public::Exception,
    heap::Heap,
    interpreter::SharedState,
    io::PrintWriter,
    object::Object,
    program::Program,
    resource::ResourceTracker,
    tracer::{NoopTracer, VmTracer},
};

/// Identifies an execution context within its interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(u64);

impl ContextId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Counters for the paths calls take through the call protocol.
///
/// Purely diagnostic: nothing in the VM reads them back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStats {
    /// User functions bound through the general argument binding algorithm.
    pub direct: u64,
    /// User functions whose positional arguments were copied straight into locals.
    pub fast_path: u64,
    /// Native methods of lists, dicts and context managers.
    pub method: u64,
    /// Generator `send`, `throw` and `close`.
    pub bound_method: u64,
    /// Builtin functions and host functions.
    pub builtin: u64,
    /// Calls that created a generator instead of running a body.
    pub generator: u64,
    /// Everything else, e.g. instantiating exception types.
    pub other: u64,
}

impl CallStats {
    /// Total number of calls counted.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.direct + self.fast_path + self.method + self.bound_method + self.builtin + self.generator + self.other
    }
}

/// Mutable per-context state threaded through the VM.
#[derive(Debug, Default)]
pub(crate) struct ThreadState {
    /// Number of frames currently executing, the module frame included.
    pub recursion_depth: usize,
    /// Set once the recursion limit was hit, until the stack has unwound well below it.
    pub overflowed: bool,
    pub stats: CallStats,
}

#[derive(Debug, Default)]
struct SignalSlot {
    exc: Option<ExcType>,
    closed: bool,
}

/// Asynchronous exception mailbox of one context.
#[derive(Debug, Default)]
pub(crate) struct ContextSignals {
    slot: Mutex<SignalSlot>,
}

impl ContextSignals {
    /// Stores `exc` for delivery, replacing an undelivered one.
    ///
    /// Returns false once the context is gone.
    fn raise(&self, exc: ExcType, shared: &SharedState) -> bool {
        let mut slot = self.slot.lock();
        if slot.closed {
            return false;
        }
        if slot.exc.replace(exc).is_none() {
            shared.async_raised();
        }
        true
    }

    /// Takes the pending asynchronous exception, if any.
    fn take(&self, shared: &SharedState) -> Option<ExcType> {
        let exc = self.slot.lock().exc.take()?;
        shared.async_consumed();
        Some(exc)
    }

    fn close(&self, shared: &SharedState) {
        let mut slot = self.slot.lock();
        slot.closed = true;
        if slot.exc.take().is_some() {
            shared.async_consumed();
        }
    }
}

/// A `Send + Sync` handle for poking a context from other threads.
#[derive(Debug, Clone)]
pub struct ContextHandle {
    shared: Arc<SharedState>,
    signals: Arc<ContextSignals>,
    id: ContextId,
}

impl ContextHandle {
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Injects an exception of kind `exc_type` into the context.
    ///
    /// It is raised at the context's next maintenance checkpoint, at an instruction
    /// boundary. Returns false if the context no longer exists.
    pub fn raise_async(&self, exc_type: ExcType) -> bool {
        let delivered = self.signals.raise(exc_type, &self.shared);
        tracing::debug!(context = ?self.id, %exc_type, delivered, "asynchronous exception injected");
        delivered
    }
}

/// The dispatch loop's view of the shared maintenance state.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Checkpoint<'a> {
    shared: &'a SharedState,
    signals: &'a ContextSignals,
    id: ContextId,
    primary: bool,
}

impl Checkpoint<'_> {
    /// Whether maintenance is requested. Cheap enough to test before every instruction.
    #[inline]
    pub fn is_pending(&self) -> bool {
        self.shared.breaker.is_set()
    }

    /// Services whatever the eval breaker asks for.
    ///
    /// Only the primary context runs pending calls; the others leave them queued. A
    /// failing pending call or an injected exception is raised in the running frame.
    pub fn run(&self) -> RunResult<()> {
        let breaker = &self.shared.breaker;
        if self.primary && breaker.contains(PENDING_CALLS) {
            self.shared.pending.make_pending_calls(breaker).map_err(RunError::from)?;
        }
        if breaker.contains(DROP_REQUEST) {
            self.shared.lock.hand_off(self.id, breaker);
        }
        if breaker.contains(ASYNC_EXC)
            && let Some(exc_type) = self.signals.take(self.shared)
        {
            tracing::debug!(context = ?self.id, %exc_type, "raising asynchronous exception");
            return Err(SimpleException::new(exc_type, None).into());
        }
        Ok(())
    }
}

/// A thread of execution within an [`Interpreter`](crate::Interpreter).
///
/// Runs are serialized across all contexts of the interpreter by the execution lock;
/// a running context hands the lock over at its maintenance checkpoints when another
/// context has been waiting for a full switch interval.
///
/// An internal error or an unrecoverable stack overflow terminates the context: later
/// runs fail immediately.
#[derive(Debug)]
pub struct ExecutionContext {
    shared: Arc<SharedState>,
    id: ContextId,
    primary: bool,
    signals: Arc<ContextSignals>,
    thread: ThreadState,
    terminated: bool,
}

impl ExecutionContext {
    pub(crate) fn new(shared: Arc<SharedState>, id: ContextId, primary: bool) -> Self {
        Self {
            shared,
            id,
            primary,
            signals: Arc::new(ContextSignals::default()),
            thread: ThreadState::default(),
            terminated: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Whether this context drains the interpreter's pending calls.
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    #[must_use]
    pub fn handle(&self) -> ContextHandle {
        ContextHandle {
            shared: Arc::clone(&self.shared),
            signals: Arc::clone(&self.signals),
            id: self.id,
        }
    }

    /// Call path counters accumulated over every run of this context.
    #[must_use]
    pub fn call_stats(&self) -> CallStats {
        self.thread.stats
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Runs `program`'s module code to completion.
    ///
    /// Returns the module's return value, or the exception that escaped it.
    pub fn run<T: ResourceTracker>(
        &mut self,
        program: &Program,
        tracker: T,
        print: &mut impl PrintWriter,
    ) -> Result<Object, Exception> {
        self.run_with_tracer(program, tracker, print, NoopTracer).0
    }

    /// Like [`Self::run`], observing execution with `tracer`, which is handed back.
    pub fn run_with_tracer<T: ResourceTracker, P: PrintWriter, Tr: VmTracer>(
        &mut self,
        program: &Program,
        tracker: T,
        print: &mut P,
        tracer: Tr,
    ) -> (Result<Object, Exception>, Tr) {
        if self.terminated {
            return (
                Err(Exception::fatal("execution context has been terminated")),
                tracer,
            );
        }
        let shared = &*self.shared;
        let _guard = shared.lock.lock(self.id, &shared.breaker);
        let checkpoint = Checkpoint {
            shared,
            signals: &self.signals,
            id: self.id,
            primary: self.primary,
        };
        let mut vm = VM::new(
            Heap::new(tracker),
            program.interns(),
            print,
            tracer,
            program.host_functions(),
            &mut self.thread,
            checkpoint,
        );
        let result = vm.run_module(program.module());
        let terminal = result.as_ref().is_err_and(RunError::is_terminal);
        let (result, tracer) = vm.finish(result);

        self.thread.recursion_depth = 0;
        self.thread.overflowed = false;
        if terminal {
            self.terminated = true;
            if let Err(exc) = &result {
                tracing::warn!(context = ?self.id, error = %exc.summary(), "execution context terminated");
            }
        }
        (result, tracer)
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.signals.close(&self.shared);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Interpreter;

    #[test]
    fn async_flag_tracks_undelivered_exceptions() {
        let interp = Interpreter::new();
        let ctx = interp.new_context();
        let other = interp.new_context();
        assert!(ctx.handle().raise_async(ExcType::KeyboardInterrupt));
        assert!(other.handle().raise_async(ExcType::SystemExit));
        let shared = &*interp.shared;
        assert!(shared.breaker.contains(ASYNC_EXC));

        assert_eq!(ctx.signals.take(shared), Some(ExcType::KeyboardInterrupt));
        assert!(shared.breaker.contains(ASYNC_EXC));
        drop(other);
        assert!(!shared.breaker.contains(ASYNC_EXC));
    }

    #[test]
    fn raising_into_a_dropped_context_fails() {
        let interp = Interpreter::new();
        let handle = interp.new_context().handle();
        assert!(!handle.raise_async(ExcType::KeyboardInterrupt));
        assert!(!interp.shared.breaker.is_set());
    }

    #[test]
    fn second_raise_replaces_the_first() {
        let interp = Interpreter::new();
        let ctx = interp.new_context();
        let handle = ctx.handle();
        handle.raise_async(ExcType::KeyboardInterrupt);
        handle.raise_async(ExcType::SystemExit);
        assert_eq!(ctx.signals.take(&interp.shared), Some(ExcType::SystemExit));
        assert!(!interp.shared.breaker.is_set());
    }
}
