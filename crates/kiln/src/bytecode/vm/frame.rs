//! Activation records and the block stack.

use std::sync::Arc;

use crate::{
    bytecode::{Code, Instruction, Opcode},
    exception_private::{RawStackFrame, RunError, RunResult},
    heap::{DropWithHeap, Heap, HeapId},
    resource::ResourceTracker,
    value::Value,
};

/// Maximum nesting of blocks within one frame.
const MAX_BLOCKS: usize = 20;

/// Kind of structured-control region tracked on the block stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    /// `SETUP_LOOP`: `break` jumps to the handler, `continue` stays inside.
    Loop,
    /// `SETUP_EXCEPT`: exceptions jump to the handler.
    Except,
    /// `SETUP_FINALLY` and `SETUP_WITH`: every way out runs the handler.
    Finally,
    /// Pushed while an exception is being handled; owns the saved exception triple.
    ExceptHandler,
}

/// One entry of a frame's block stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Block {
    pub kind: BlockKind,
    /// Absolute offset of the handler (loop exit for `Loop`).
    pub handler: usize,
    /// Value stack depth when the block was entered.
    pub level: usize,
}

/// Why the current instruction stream is being left.
///
/// Pushed onto the value stack as `Value::Reason` when a `finally` handler is entered
/// for a non-exceptional exit, and read back by `END_FINALLY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnwindReason {
    Exception,
    Reraise,
    Return,
    Break,
    Continue,
    Yield,
    /// A `with` block's `__exit__` swallowed the exception.
    Silenced,
}

/// The exception currently being handled: the `(type, value, traceback)` triple.
///
/// All three are `None` when no exception is being handled.
#[derive(Debug)]
pub(crate) struct ExcInfo {
    pub exc_type: Value,
    pub value: Value,
    pub traceback: Value,
}

impl Default for ExcInfo {
    fn default() -> Self {
        Self {
            exc_type: Value::None,
            value: Value::None,
            traceback: Value::None,
        }
    }
}

impl ExcInfo {
    pub fn is_active(&self) -> bool {
        !self.exc_type.is_none()
    }

    pub fn clone_with_heap(&self, heap: &Heap<impl ResourceTracker>) -> Self {
        Self {
            exc_type: self.exc_type.clone_with_heap(heap),
            value: self.value.clone_with_heap(heap),
            traceback: self.traceback.clone_with_heap(heap),
        }
    }

    pub fn py_dec_ref_ids(&mut self, stack: &mut Vec<HeapId>) {
        self.exc_type.py_dec_ref_ids(stack);
        self.value.py_dec_ref_ids(stack);
        self.traceback.py_dec_ref_ids(stack);
    }
}

impl<T: ResourceTracker> DropWithHeap<T> for ExcInfo {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        self.exc_type.drop_with_heap(heap);
        self.value.drop_with_heap(heap);
        self.traceback.drop_with_heap(heap);
    }
}

/// Execution state of one function or module activation.
///
/// A generator owns its frame between resumptions; otherwise the frame lives on the
/// Rust stack of the call that runs it.
#[derive(Debug)]
pub(crate) struct Frame {
    pub code: Arc<Code>,
    /// Offset of the next instruction to decode.
    pub ip: usize,
    /// Offset of the instruction being executed, used for tracebacks and line events.
    pub lasti: usize,
    pub stack: Vec<Value>,
    /// Fast locals: arguments first, then the other locals. `Undefined` when unbound.
    pub locals: Vec<Value>,
    /// Cell variables followed by free variables. Each id holds one reference.
    pub cells: Vec<HeapId>,
    pub blocks: Vec<Block>,
    /// For generators: the exception state put aside while suspended.
    pub exc_state: ExcInfo,
    /// Set while suspended at `YIELD_VALUE`; the re-executed yield then just continues.
    pub resume_pending: bool,
    /// Last line reported to the tracer.
    pub last_line: Option<u32>,
}

impl Frame {
    pub fn new(code: Arc<Code>, locals: Vec<Value>, cells: Vec<HeapId>) -> Self {
        let stack = Vec::with_capacity(code.stack_size() as usize);
        Self {
            code,
            ip: 0,
            lasti: 0,
            stack,
            locals,
            cells,
            blocks: Vec::new(),
            exc_state: ExcInfo::default(),
            resume_pending: false,
            last_line: None,
        }
    }

    #[inline]
    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    pub fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    /// Pops `n` values, returned in stack order (deepest first).
    pub fn pop_n(&mut self, n: usize) -> Vec<Value> {
        let at = self.stack.len().checked_sub(n).expect("value stack underflow");
        self.stack.split_off(at)
    }

    /// The value `depth` slots below the top; `peek(1)` is the top.
    #[inline]
    pub fn peek(&self, depth: usize) -> &Value {
        &self.stack[self.stack.len() - depth]
    }

    #[inline]
    pub fn peek_mut(&mut self, depth: usize) -> &mut Value {
        let len = self.stack.len();
        &mut self.stack[len - depth]
    }

    /// Decodes the instruction at `ip` and advances past it.
    pub fn fetch(&mut self) -> RunResult<Instruction> {
        let (instr, next) = Instruction::decode(self.code.instructions(), self.ip)
            .map_err(|err| RunError::internal(format!("malformed bytecode: {err}")))?;
        self.lasti = instr.offset;
        self.ip = next;
        Ok(instr)
    }

    /// Opcode at `ip` without decoding its argument.
    pub fn next_opcode(&self) -> Option<Opcode> {
        self.code.instructions().get(self.ip).and_then(|b| Opcode::from_repr(*b))
    }

    pub fn push_block(&mut self, kind: BlockKind, handler: usize, level: usize) -> RunResult<()> {
        if self.blocks.len() >= MAX_BLOCKS {
            return Err(RunError::internal("too many statically nested blocks"));
        }
        self.blocks.push(Block { kind, handler, level });
        Ok(())
    }

    /// Pops values down to `level`, releasing them.
    pub fn unwind_stack(&mut self, level: usize, heap: &mut Heap<impl ResourceTracker>) {
        while self.stack.len() > level {
            self.pop().drop_with_heap(heap);
        }
    }

    /// The iterator a suspended `YIELD_FROM` is delegating to.
    pub fn yield_from_target(&self) -> Option<&Value> {
        if self.resume_pending || self.next_opcode() != Some(Opcode::YieldFrom) {
            return None;
        }
        self.stack.last()
    }

    /// Traceback entry for the instruction being executed.
    pub fn position(&self) -> RawStackFrame {
        RawStackFrame {
            filename: self.code.filename(),
            name: self.code.name(),
            line: self.code.line_for(self.lasti),
        }
    }

    pub fn estimate_size(&self) -> usize {
        let value_size = std::mem::size_of::<Value>();
        std::mem::size_of::<Self>()
            + (self.stack.capacity() + self.locals.len()) * value_size
            + self.cells.len() * std::mem::size_of::<HeapId>()
    }

    pub fn py_dec_ref_ids(&mut self, stack: &mut Vec<HeapId>) {
        for value in &mut self.stack {
            value.py_dec_ref_ids(stack);
        }
        for value in &mut self.locals {
            value.py_dec_ref_ids(stack);
        }
        stack.append(&mut self.cells);
        self.exc_state.py_dec_ref_ids(stack);
    }
}

impl<T: ResourceTracker> DropWithHeap<T> for Frame {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        self.stack.drop_with_heap(heap);
        self.locals.drop_with_heap(heap);
        for id in self.cells {
            heap.dec_ref(id);
        }
        self.exc_state.drop_with_heap(heap);
    }
}
