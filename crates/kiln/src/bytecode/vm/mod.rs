//! The bytecode virtual machine.
//!
//! Every frame is run by its own invocation of [`VM::eval_frame`], so a call made by
//! bytecode recurses on the Rust stack and the recursion limit bounds how deep that
//! goes. An instruction either continues, jumps, or starts an unwind (exception,
//! return, `break`, `continue`) which the frame's block stack resolves in
//! `exceptions.rs`.

mod attr;
mod binary;
mod binding;
mod call;
mod collections;
mod compare;
mod exceptions;
mod frame;
mod generator;

use std::sync::Arc;

use ahash::AHashMap;

use frame::Block;
pub use frame::BlockKind;
pub(crate) use frame::{ExcInfo, Frame, UnwindReason};

use crate::{
    builtins::Builtins,
    bytecode::{Code, Const, Instruction, Opcode},
    context::{Checkpoint, ThreadState},
    exception_private::{ExcType, RunError, RunResult},
    exception_public::Exception,
    function::Function,
    heap::{ContainsHeap, DropWithHeap, Heap, HeapData, HeapId},
    host::HostFunctions,
    intern::{Interns, StringId},
    io::PrintWriter,
    object::Object,
    resource::{RECURSION_HEADROOM, ResourceError, ResourceTracker},
    tracer::{NoopTracer, VmTracer},
    types::Dict,
    value::Value,
};

/// How a frame stopped executing.
#[derive(Debug)]
pub(crate) enum FrameExit {
    Return(Value),
    /// A generator frame suspended at `YIELD_VALUE` or `YIELD_FROM`.
    Yield(Value),
}

/// Outcome of executing one instruction.
#[derive(Debug)]
enum Control {
    Next,
    Unwind(Unwind),
    Yield(Value),
}

/// Why the block stack is being unwound.
#[derive(Debug)]
enum Unwind {
    Exception(RunError),
    /// An exception raised again by `raise` or `END_FINALLY`; its traceback already
    /// includes this frame.
    Reraise(RunError),
    Return(Value),
    Break,
    /// `continue` out of a `try` region: the absolute offset of the loop head.
    Continue(usize),
}

/// Executes code objects against one run's heap and globals.
pub(crate) struct VM<'a, T: ResourceTracker, P: PrintWriter, Tr: VmTracer = NoopTracer> {
    pub(crate) heap: Heap<T>,
    pub(crate) interns: &'a Interns,
    pub(crate) print: &'a mut P,
    tracer: Tr,
    host: &'a HostFunctions,
    /// Module namespace, shared by every frame of the run.
    globals: AHashMap<StringId, Value>,
    /// The exception currently being handled, as seen by a bare `raise`.
    exc_info: ExcInfo,
    thread: &'a mut ThreadState,
    checkpoint: Checkpoint<'a>,
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> ContainsHeap<T> for VM<'_, T, P, Tr> {
    #[inline]
    fn heap_mut(&mut self) -> &mut Heap<T> {
        &mut self.heap
    }
}

impl<'a, T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'a, T, P, Tr> {
    #[expect(clippy::too_many_arguments, reason = "each collaborator is borrowed for the run")]
    pub fn new(
        heap: Heap<T>,
        interns: &'a Interns,
        print: &'a mut P,
        tracer: Tr,
        host: &'a HostFunctions,
        thread: &'a mut ThreadState,
        checkpoint: Checkpoint<'a>,
    ) -> Self {
        Self {
            heap,
            interns,
            print,
            tracer,
            host,
            globals: AHashMap::new(),
            exc_info: ExcInfo::default(),
            thread,
            checkpoint,
        }
    }

    /// Runs a module body to completion, returning its return value.
    pub fn run_module(&mut self, code: &Arc<Code>) -> RunResult<Value> {
        tracing::debug!(module = self.interns.get_str(code.name()), "running module");
        let locals = (0..code.nlocals()).map(|_| Value::Undefined).collect();
        let cells = self.new_cells(code.ncells())?;
        self.run_frame(Frame::new(Arc::clone(code), locals, cells))
    }

    /// Converts the outcome of a run for the public API and releases everything the run
    /// still holds.
    pub fn finish(mut self, result: RunResult<Value>) -> (Result<Object, Exception>, Tr) {
        let public = match result {
            Ok(value) => {
                let object = Object::from_value(&value, &self.heap, self.interns);
                value.drop_with_heap(&mut self.heap);
                Ok(object)
            }
            Err(err) => Err(err.into_public(&mut self.heap, self.interns)),
        };
        for (_, value) in self.globals.drain() {
            value.drop_with_heap(&mut self.heap);
        }
        std::mem::take(&mut self.exc_info).drop_with_heap(&mut self.heap);
        tracing::debug!(live_objects = self.heap.live_count(), stats = ?self.thread.stats, "run finished");
        (public, self.tracer)
    }

    fn new_cells(&mut self, count: usize) -> RunResult<Vec<HeapId>> {
        let mut cells = Vec::with_capacity(count);
        for _ in 0..count {
            match self.heap.allocate(HeapData::Cell(Value::Undefined)) {
                Ok(id) => cells.push(id),
                Err(err) => {
                    for id in cells {
                        self.heap.dec_ref(id);
                    }
                    return Err(err.into());
                }
            }
        }
        Ok(cells)
    }

    // ========================================================================
    // Recursion accounting
    // ========================================================================

    /// Frames a run may hold: the module frame plus `limit` nested calls.
    fn frame_budget(&self) -> usize {
        self.heap.tracker().max_recursion_depth() + 1
    }

    /// Counts a frame entering execution.
    ///
    /// Past the limit a `RecursionError` is raised once; while it unwinds, handlers get
    /// [`RECURSION_HEADROOM`] extra frames, and overflowing those is fatal.
    fn enter_recursion(&mut self) -> RunResult<()> {
        let limit = self.heap.tracker().max_recursion_depth();
        let budget = self.frame_budget();
        let thread = &mut *self.thread;
        thread.recursion_depth += 1;
        if thread.recursion_depth <= budget {
            return Ok(());
        }
        let depth = thread.recursion_depth;
        if thread.overflowed {
            if depth > budget + RECURSION_HEADROOM {
                thread.recursion_depth -= 1;
                tracing::warn!(depth, limit, "stack overflow while handling a recursion error");
                return Err(RunError::fatal("Cannot recover from stack overflow."));
            }
            return Ok(());
        }
        thread.recursion_depth -= 1;
        thread.overflowed = true;
        tracing::debug!(depth, limit, "recursion limit exceeded");
        Err(ResourceError::Recursion { limit, depth }.into())
    }

    fn leave_recursion(&mut self) {
        let budget = self.frame_budget();
        let thread = &mut *self.thread;
        thread.recursion_depth = thread.recursion_depth.saturating_sub(1);
        let low_water = if budget > 101 { budget - 50 } else { 3 * (budget >> 2) };
        if thread.recursion_depth < low_water {
            thread.overflowed = false;
        }
    }

    // ========================================================================
    // Frame execution
    // ========================================================================

    /// Runs a non-generator frame and releases it.
    fn run_frame(&mut self, mut frame: Frame) -> RunResult<Value> {
        if let Err(err) = self.enter_recursion() {
            frame.drop_with_heap(&mut self.heap);
            return Err(err);
        }
        let interns = self.interns;
        self.tracer
            .on_call(Some(interns.get_str(frame.code.name())), self.thread.recursion_depth);
        let result = self.eval_frame(&mut frame, None);
        self.leave_recursion();
        self.tracer.on_return(self.thread.recursion_depth);
        frame.drop_with_heap(&mut self.heap);
        match result? {
            FrameExit::Return(value) => Ok(value),
            FrameExit::Yield(value) => {
                value.drop_with_heap(&mut self.heap);
                Err(RunError::internal("yield outside a generator"))
            }
        }
    }

    /// The dispatch loop.
    ///
    /// `throw` starts the frame by raising that error at the current instruction, which
    /// is how exceptions are thrown into suspended generators.
    fn eval_frame(&mut self, frame: &mut Frame, throw: Option<RunError>) -> RunResult<FrameExit> {
        let mut pending = match throw {
            Some(err) => Some(self.on_error(frame, err)?),
            None => None,
        };
        loop {
            let why = match pending.take() {
                Some(why) => why,
                None => match self.step(frame) {
                    Ok(Control::Next) => continue,
                    Ok(Control::Unwind(why)) => why,
                    Ok(Control::Yield(value)) => return Ok(FrameExit::Yield(value)),
                    Err(err) => self.on_error(frame, err)?,
                },
            };
            if let Some(exit) = self.unwind(frame, why)? {
                return Ok(exit);
            }
        }
    }

    /// One iteration of the loop: maintenance, fetch, trace, execute.
    fn step(&mut self, frame: &mut Frame) -> RunResult<Control> {
        self.heap.tracker_mut().check_time()?;
        // entering a finally region must not be interrupted
        if self.checkpoint.is_pending() && frame.next_opcode() != Some(Opcode::SetupFinally) {
            self.checkpoint.run()?;
        }
        let instr = frame.fetch()?;
        if self.tracer.is_active() {
            self.trace_instruction(frame, instr);
        }
        self.execute(frame, instr)
    }

    fn trace_instruction(&mut self, frame: &mut Frame, instr: Instruction) {
        let depth = self.thread.recursion_depth;
        let line = frame.code.line_for(instr.offset);
        if frame.last_line != Some(line) {
            frame.last_line = Some(line);
            self.tracer.on_line(line, depth);
        }
        self.tracer
            .on_instruction(instr.offset, instr.opcode, frame.stack.len(), depth);
    }

    /// Executes the next instruction straight away when it is one of `expected`.
    ///
    /// Skipped while maintenance is pending or a tracer is watching, so neither ever
    /// misses an instruction.
    fn predict(&mut self, frame: &mut Frame, expected: &[Opcode]) -> RunResult<Control> {
        if self.checkpoint.is_pending() || self.tracer.is_active() {
            return Ok(Control::Next);
        }
        if !frame.next_opcode().is_some_and(|op| expected.contains(&op)) {
            return Ok(Control::Next);
        }
        self.heap.tracker_mut().check_time()?;
        let instr = frame.fetch()?;
        self.execute(frame, instr)
    }

    fn execute(&mut self, frame: &mut Frame, instr: Instruction) -> RunResult<Control> {
        let arg = instr.arg as usize;
        match instr.opcode {
            // Stack Operations
            Opcode::Nop => {}
            Opcode::PopTop => frame.pop().drop_with_heap(&mut self.heap),
            Opcode::RotTwo => rotate(frame, 2)?,
            Opcode::RotThree => rotate(frame, 3)?,
            Opcode::DupTop => {
                let top = frame.peek(1).clone_with_heap(&self.heap);
                frame.push(top);
            }
            Opcode::DupTopTwo => {
                let second = frame.peek(2).clone_with_heap(&self.heap);
                let top = frame.peek(1).clone_with_heap(&self.heap);
                frame.push(second);
                frame.push(top);
            }

            // Arithmetic and Comparison
            Opcode::UnaryPositive | Opcode::UnaryNegative | Opcode::UnaryNot | Opcode::UnaryInvert => {
                self.unary_op(frame, instr.opcode)?;
            }
            Opcode::BinaryPower
            | Opcode::BinaryMultiply
            | Opcode::BinaryModulo
            | Opcode::BinaryAdd
            | Opcode::BinarySubtract
            | Opcode::BinaryFloorDivide
            | Opcode::BinaryTrueDivide
            | Opcode::BinaryLshift
            | Opcode::BinaryRshift
            | Opcode::BinaryAnd
            | Opcode::BinaryXor
            | Opcode::BinaryOr
            | Opcode::InplaceFloorDivide
            | Opcode::InplaceTrueDivide
            | Opcode::InplaceAdd
            | Opcode::InplaceSubtract
            | Opcode::InplaceMultiply
            | Opcode::InplaceModulo
            | Opcode::InplacePower
            | Opcode::InplaceLshift
            | Opcode::InplaceRshift
            | Opcode::InplaceAnd
            | Opcode::InplaceXor
            | Opcode::InplaceOr => self.binary_op(frame, instr.opcode)?,
            Opcode::CompareOp => {
                self.compare_op(frame, instr.arg)?;
                return self.predict(frame, &[Opcode::PopJumpIfFalse, Opcode::PopJumpIfTrue]);
            }

            // Collections, Subscripts and Iteration
            Opcode::BinarySubscr => self.binary_subscr(frame)?,
            Opcode::StoreSubscr => self.store_subscr(frame)?,
            Opcode::DeleteSubscr => self.delete_subscr(frame)?,
            Opcode::BuildTuple => {
                let items = frame.pop_n(arg);
                let id = self.heap.allocate(HeapData::Tuple(items))?;
                frame.push(Value::Ref(id));
            }
            Opcode::BuildList => {
                let items = frame.pop_n(arg);
                let id = self.heap.allocate(HeapData::List(items))?;
                frame.push(Value::Ref(id));
            }
            Opcode::BuildMap => {
                let id = self.heap.allocate(HeapData::Dict(Dict::new()))?;
                frame.push(Value::Ref(id));
            }
            Opcode::StoreMap => self.store_map(frame)?,
            Opcode::ListAppend => self.list_append(frame, arg)?,
            Opcode::UnpackSequence => self.unpack_sequence(frame, arg)?,
            Opcode::GetIter => {
                let iterable = frame.pop();
                let iterator = self.get_iter(iterable)?;
                frame.push(iterator);
                return self.predict(frame, &[Opcode::ForIter]);
            }
            Opcode::ForIter => {
                if self.for_iter(frame, arg)? {
                    return self.predict(frame, &[Opcode::StoreFast, Opcode::UnpackSequence]);
                }
            }

            // Names
            Opcode::LoadConst => {
                let value = self.load_const(&frame.code, arg)?;
                frame.push(value);
            }
            Opcode::LoadName | Opcode::LoadGlobal => {
                let name = name_at(frame, arg)?;
                let value = self.load_global(name)?;
                frame.push(value);
            }
            Opcode::StoreName | Opcode::StoreGlobal => {
                let name = name_at(frame, arg)?;
                let value = frame.pop();
                if let Some(old) = self.globals.insert(name, value) {
                    old.drop_with_heap(&mut self.heap);
                }
            }
            Opcode::DeleteName | Opcode::DeleteGlobal => {
                let name = name_at(frame, arg)?;
                match self.globals.remove(&name) {
                    Some(old) => old.drop_with_heap(&mut self.heap),
                    None => return Err(ExcType::name_error(self.interns.get_str(name))),
                }
            }
            Opcode::LoadFast => {
                let value = local_mut(frame, arg)?;
                if value.is_undefined() {
                    return Err(self.unbound_local(frame, arg));
                }
                let value = value.clone_with_heap(&self.heap);
                frame.push(value);
            }
            Opcode::StoreFast => {
                let value = frame.pop();
                match frame.locals.get_mut(arg) {
                    Some(slot) => std::mem::replace(slot, value).drop_with_heap(&mut self.heap),
                    None => {
                        value.drop_with_heap(&mut self.heap);
                        return Err(bad_slot("local"));
                    }
                }
            }
            Opcode::DeleteFast => {
                let old = std::mem::replace(local_mut(frame, arg)?, Value::Undefined);
                if old.is_undefined() {
                    return Err(self.unbound_local(frame, arg));
                }
                old.drop_with_heap(&mut self.heap);
            }
            Opcode::LoadClosure => {
                let cell = cell_at(frame, arg)?;
                self.heap.inc_ref(cell);
                frame.push(Value::Ref(cell));
            }
            Opcode::LoadDeref => {
                let cell = cell_at(frame, arg)?;
                self.tracer.on_cell_load(instr.arg, frame.cells.len());
                let value = self.heap.get_cell_value(cell);
                if value.is_undefined() {
                    return Err(self.unbound_deref(frame, arg));
                }
                frame.push(value);
            }
            Opcode::StoreDeref => {
                let cell = cell_at(frame, arg)?;
                self.tracer.on_cell_store(instr.arg, frame.cells.len());
                let value = frame.pop();
                self.heap.set_cell_value(cell, value);
            }
            Opcode::DeleteDeref => {
                let cell = cell_at(frame, arg)?;
                let old = self.heap.get_cell_value(cell);
                if old.is_undefined() {
                    return Err(self.unbound_deref(frame, arg));
                }
                old.drop_with_heap(&mut self.heap);
                self.heap.set_cell_value(cell, Value::Undefined);
            }

            // Attributes
            Opcode::LoadAttr => {
                let name = name_at(frame, arg)?;
                let owner = frame.pop();
                let value = self.load_attr_op(owner, name)?;
                frame.push(value);
            }
            Opcode::StoreAttr => {
                let name = name_at(frame, arg)?;
                let owner = frame.pop();
                let value = frame.pop();
                self.store_attr(owner, name, value)?;
            }
            Opcode::DeleteAttr => {
                let name = name_at(frame, arg)?;
                let owner = frame.pop();
                self.delete_attr(owner, name)?;
            }

            // Control Flow
            Opcode::JumpForward => frame.ip += arg,
            Opcode::JumpAbsolute => frame.ip = arg,
            Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => {
                let condition = frame.pop();
                let truthy = condition.py_bool(&self.heap, self.interns);
                condition.drop_with_heap(&mut self.heap);
                if truthy == (instr.opcode == Opcode::PopJumpIfTrue) {
                    frame.ip = arg;
                }
            }
            Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop => {
                let truthy = frame.peek(1).py_bool(&self.heap, self.interns);
                if truthy == (instr.opcode == Opcode::JumpIfTrueOrPop) {
                    frame.ip = arg;
                } else {
                    frame.pop().drop_with_heap(&mut self.heap);
                }
            }

            // Blocks
            Opcode::SetupLoop | Opcode::SetupExcept | Opcode::SetupFinally => {
                let kind = match instr.opcode {
                    Opcode::SetupLoop => BlockKind::Loop,
                    Opcode::SetupExcept => BlockKind::Except,
                    _ => BlockKind::Finally,
                };
                let handler = frame.ip + arg;
                self.push_block(frame, kind, handler)?;
            }
            Opcode::SetupWith => {
                let handler = frame.ip + arg;
                self.setup_with(frame, handler)?;
            }
            Opcode::PopBlock => {
                let block = self.pop_block(frame)?;
                frame.unwind_stack(block.level, &mut self.heap);
            }
            Opcode::PopExcept => self.pop_except(frame)?,
            Opcode::EndFinally => return self.end_finally(frame),
            Opcode::WithCleanup => self.with_cleanup(frame)?,
            Opcode::BreakLoop => return Ok(Control::Unwind(Unwind::Break)),
            Opcode::ContinueLoop => return Ok(Control::Unwind(Unwind::Continue(arg))),
            Opcode::RaiseVarargs => return self.raise_varargs(frame, arg),

            // Functions and Generators
            Opcode::CallFunction | Opcode::CallFunctionVar | Opcode::CallFunctionKw | Opcode::CallFunctionVarKw => {
                let result = self.call_function_op(frame, instr.opcode, instr.arg)?;
                frame.push(result);
            }
            Opcode::MakeFunction | Opcode::MakeClosure => {
                self.make_function(frame, instr.opcode == Opcode::MakeClosure, instr.arg)?;
            }
            Opcode::ReturnValue => return Ok(Control::Unwind(Unwind::Return(frame.pop()))),
            Opcode::YieldValue => {
                if frame.resume_pending {
                    // resumed: the sent value is already on the stack
                    frame.resume_pending = false;
                } else {
                    let value = frame.pop();
                    frame.ip = instr.offset;
                    frame.resume_pending = true;
                    return Ok(Control::Yield(value));
                }
            }
            Opcode::YieldFrom => return self.yield_from(frame, instr),

            Opcode::ExtendedArg => return Err(RunError::internal("EXTENDED_ARG reached dispatch")),
        }
        Ok(Control::Next)
    }

    fn push_block(&mut self, frame: &mut Frame, kind: BlockKind, handler: usize) -> RunResult<()> {
        let level = frame.stack.len();
        frame.push_block(kind, handler, level)?;
        self.tracer.on_block_push(kind, frame.blocks.len());
        Ok(())
    }

    fn pop_block(&mut self, frame: &mut Frame) -> RunResult<Block> {
        let block = frame
            .blocks
            .pop()
            .ok_or_else(|| RunError::internal("block stack underflow"))?;
        self.tracer.on_block_pop(block.kind, frame.blocks.len());
        Ok(block)
    }

    // ========================================================================
    // Names and constants
    // ========================================================================

    fn load_const(&mut self, code: &Code, index: usize) -> RunResult<Value> {
        let constant = code
            .constants()
            .get(index)
            .ok_or_else(|| RunError::internal("constant index out of range"))?;
        self.const_value(constant)
    }

    fn const_value(&mut self, constant: &Const) -> RunResult<Value> {
        Ok(match constant {
            Const::None => Value::None,
            Const::Bool(b) => Value::Bool(*b),
            Const::Int(i) => Value::Int(*i),
            Const::Float(f) => Value::Float(*f),
            Const::Str(id) => Value::InternString(*id),
            Const::Tuple(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    match self.const_value(item) {
                        Ok(value) => values.push(value),
                        Err(err) => {
                            values.drop_with_heap(&mut self.heap);
                            return Err(err);
                        }
                    }
                }
                Value::Ref(self.heap.allocate(HeapData::Tuple(values))?)
            }
            Const::Code(code) => Value::Ref(self.heap.allocate(HeapData::Code(Arc::clone(code)))?),
        })
    }

    /// Resolves a name through the module globals, then host functions, then builtins.
    fn load_global(&self, name: StringId) -> RunResult<Value> {
        if let Some(value) = self.globals.get(&name) {
            return Ok(value.clone_with_heap(&self.heap));
        }
        let name = self.interns.get_str(name);
        if let Some(id) = self.host.lookup(name) {
            return Ok(Value::HostFunction(id));
        }
        name.parse::<Builtins>()
            .map(Value::Builtin)
            .map_err(|()| ExcType::name_error(name))
    }

    fn unbound_local(&self, frame: &Frame, index: usize) -> RunError {
        let name = frame
            .code
            .varnames
            .get(index)
            .map_or("<unknown>", |id| self.interns.get_str(*id));
        ExcType::unbound_local(name)
    }

    fn unbound_deref(&self, frame: &Frame, index: usize) -> RunError {
        let name = self.interns.get_str(frame.code.deref_name(index));
        if index < frame.code.cellvars.len() {
            ExcType::unbound_local(name)
        } else {
            ExcType::unbound_free_var(name)
        }
    }

    // ========================================================================
    // Function creation
    // ========================================================================

    /// `MAKE_FUNCTION` / `MAKE_CLOSURE`.
    ///
    /// Pops the qualified name, the code object, the closure tuple (closures only), the
    /// keyword-only default pairs and then the positional defaults.
    fn make_function(&mut self, frame: &mut Frame, closure: bool, arg: u32) -> RunResult<()> {
        let ndefaults = (arg & 0xff) as usize;
        let nkw = ((arg >> 8) & 0xff) as usize;
        let qualname = frame.pop();
        let code_value = frame.pop();
        let closure_value = if closure { frame.pop() } else { Value::None };
        let kw_flat = frame.pop_n(2 * nkw);
        let defaults = frame.pop_n(ndefaults);

        let parts = self.function_parts(&code_value, &closure_value, &kw_flat, ndefaults);
        let qualname_id = match &qualname {
            Value::InternString(id) => Some(*id),
            _ => None,
        };
        qualname.drop_with_heap(&mut self.heap);
        code_value.drop_with_heap(&mut self.heap);
        closure_value.drop_with_heap(&mut self.heap);
        let (code, cells) = match parts {
            Ok(parts) => parts,
            Err(err) => {
                kw_flat.drop_with_heap(&mut self.heap);
                defaults.drop_with_heap(&mut self.heap);
                return Err(err);
            }
        };

        let mut kw_defaults = Vec::with_capacity(nkw);
        let mut flat = kw_flat.into_iter();
        while let (Some(key), Some(value)) = (flat.next(), flat.next()) {
            // keys were checked to be interned names
            if let Value::InternString(name) = key {
                kw_defaults.push((name, value));
            }
        }
        let cell_count = cells.len();
        let function = Function {
            qualname: qualname_id.unwrap_or_else(|| code.name()),
            code,
            defaults,
            kw_defaults,
            closure: cells,
        };
        let id = self.heap.allocate(HeapData::Function(function))?;
        self.tracer.on_make_function(cell_count, ndefaults + nkw);
        frame.push(Value::Ref(id));
        Ok(())
    }

    /// Validates the operands of a function definition, returning the code and the
    /// closure cells with a reference taken on each.
    fn function_parts(
        &self,
        code_value: &Value,
        closure_value: &Value,
        kw_flat: &[Value],
        ndefaults: usize,
    ) -> RunResult<(Arc<Code>, Vec<HeapId>)> {
        let Some(HeapData::Code(code)) = code_value.ref_id().map(|id| self.heap.get(id)) else {
            return Err(RunError::internal("MAKE_FUNCTION expects a code object"));
        };
        if ndefaults > code.argcount() as usize {
            return Err(RunError::internal("more defaults than positional parameters"));
        }
        if kw_flat
            .chunks(2)
            .any(|pair| !matches!(pair.first(), Some(Value::InternString(_))))
        {
            return Err(RunError::internal("keyword-only default names must be interned strings"));
        }
        let mut cells = Vec::new();
        if let Some(id) = closure_value.ref_id() {
            let HeapData::Tuple(items) = self.heap.get(id) else {
                return Err(RunError::internal("MAKE_CLOSURE expects a tuple of cells"));
            };
            for item in items {
                match item.ref_id().map(|cell| (cell, self.heap.get(cell))) {
                    Some((cell, HeapData::Cell(_))) => cells.push(cell),
                    _ => return Err(RunError::internal("closure tuple holds a non-cell")),
                }
            }
        }
        if cells.len() != code.freevars.len() {
            return Err(RunError::internal("closure size does not match free variables"));
        }
        for cell in &cells {
            self.heap.inc_ref(*cell);
        }
        Ok((Arc::clone(code), cells))
    }
}

fn rotate(frame: &mut Frame, n: usize) -> RunResult<()> {
    let len = frame.stack.len();
    if len < n {
        return Err(RunError::internal("value stack underflow"));
    }
    frame.stack[len - n..].rotate_right(1);
    Ok(())
}

fn name_at(frame: &Frame, index: usize) -> RunResult<StringId> {
    frame
        .code
        .names
        .get(index)
        .copied()
        .ok_or_else(|| bad_slot("name"))
}

fn local_mut(frame: &mut Frame, index: usize) -> RunResult<&mut Value> {
    frame.locals.get_mut(index).ok_or_else(|| bad_slot("local"))
}

fn cell_at(frame: &Frame, index: usize) -> RunResult<HeapId> {
    frame.cells.get(index).copied().ok_or_else(|| bad_slot("cell"))
}

fn bad_slot(kind: &str) -> RunError {
    RunError::internal(format!("{kind} index out of range"))
}
