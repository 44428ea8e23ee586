//! The interpreter: state shared by every execution context.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    context::{ContextId, ExecutionContext},
    eval_breaker::{ASYNC_EXC, DROP_REQUEST, EvalBreaker},
    exec_lock::ExecLock,
    pending::{PendingCallError, PendingCallback, PendingCalls},
};

/// Tunables of an [`Interpreter`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    /// Slots in the pending call queue.
    pub pending_capacity: usize,
    /// How long a context waits for the execution lock before asking the holder to drop it.
    pub switch_interval: Duration,
    /// Attempts at the queue lock before [`Interpreter::add_pending_call`] gives up.
    pub pending_lock_retries: usize,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            pending_capacity: 32,
            switch_interval: Duration::from_millis(5),
            pending_lock_retries: 100,
        }
    }
}

#[derive(Debug)]
pub(crate) struct SharedState {
    pub config: InterpreterConfig,
    pub breaker: EvalBreaker,
    pub lock: ExecLock,
    pub pending: PendingCalls,
    /// Number of contexts holding an undelivered asynchronous exception.
    async_pending: Mutex<usize>,
    next_context: AtomicU64,
}

impl SharedState {
    fn new(config: InterpreterConfig) -> Self {
        Self {
            breaker: EvalBreaker::new(),
            lock: ExecLock::new(config.switch_interval),
            pending: PendingCalls::new(config.pending_capacity.max(1), config.pending_lock_retries),
            async_pending: Mutex::new(0),
            next_context: AtomicU64::new(0),
            config,
        }
    }

    pub fn async_raised(&self) {
        let mut count = self.async_pending.lock();
        *count += 1;
        self.breaker.set(ASYNC_EXC);
    }

    pub fn async_consumed(&self) {
        let mut count = self.async_pending.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.breaker.clear(ASYNC_EXC);
        }
    }
}

/// A bytecode interpreter shared by any number of execution contexts.
///
/// Cloning is cheap and yields a handle to the same interpreter, so it can be passed
/// to other threads to create contexts there or to enqueue pending calls.
///
/// ```
/// use kiln::{CodeBuilder, Interpreter, NoLimitTracker, NoPrint, Object, Opcode, Program};
///
/// let mut builder = CodeBuilder::new("<module>");
/// builder.load_const(20).load_const(22).emit(Opcode::BinaryAdd).emit(Opcode::ReturnValue);
/// let program = Program::from_builder(builder).unwrap();
///
/// let interp = Interpreter::new();
/// let mut ctx = interp.new_context();
/// let result = ctx.run(&program, NoLimitTracker::new(), &mut NoPrint).unwrap();
/// assert_eq!(result, Object::Int(42));
/// ```
#[derive(Debug, Clone)]
pub struct Interpreter {
    pub(crate) shared: Arc<SharedState>,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(InterpreterConfig::default())
    }

    #[must_use]
    pub fn with_config(config: InterpreterConfig) -> Self {
        Self {
            shared: Arc::new(SharedState::new(config)),
        }
    }

    #[must_use]
    pub fn config(&self) -> &InterpreterConfig {
        &self.shared.config
    }

    /// Creates an execution context. The first one created is the primary context.
    #[must_use]
    pub fn new_context(&self) -> ExecutionContext {
        let raw = self.shared.next_context.fetch_add(1, Ordering::Relaxed);
        let id = ContextId::new(raw);
        tracing::debug!(context = ?id, primary = raw == 0, "execution context created");
        ExecutionContext::new(Arc::clone(&self.shared), id, raw == 0)
    }

    /// Queues `callback(arg)` to run in the primary context at its next checkpoint.
    ///
    /// Never allocates and never blocks for long, so it may be called from contexts
    /// that must not, such as signal handlers.
    pub fn add_pending_call(&self, callback: PendingCallback, arg: usize) -> Result<(), PendingCallError> {
        self.shared.pending.push(callback, arg, &self.shared.breaker)
    }

    /// Number of callbacks waiting to run.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }

    /// Asks the running context to hand the execution lock over at its next checkpoint.
    pub fn request_lock_drop(&self) {
        self.shared.breaker.set(DROP_REQUEST);
    }
}
