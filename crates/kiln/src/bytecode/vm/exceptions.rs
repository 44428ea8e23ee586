//! Block stack unwinding, exception handlers and `with` statements.

use std::mem;

use super::{Block, BlockKind, Control, ExcInfo, Frame, FrameExit, Unwind, UnwindReason, VM};
use crate::{
    args::CallArgs,
    builtins::Builtins,
    defer_drop,
    exception_private::{ExcType, ExceptionRaise, RunError, RunResult, SimpleException},
    heap::{DropWithHeap, HeapData},
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::ExceptionObject,
    value::Value,
};

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    /// Turns an error raised by an instruction into an unwind of the current frame.
    ///
    /// Internal errors, fatal errors and uncatchable exceptions leave the frame without
    /// running any handler.
    pub(super) fn on_error(&mut self, frame: &Frame, mut err: RunError) -> RunResult<Unwind> {
        let Some(exc_type) = err.exc_type() else {
            return Err(err);
        };
        err.push_frame(frame.position());
        self.tracer.on_exception(exc_type, self.thread.recursion_depth);
        if err.is_catchable() {
            Ok(Unwind::Exception(err))
        } else {
            Err(err)
        }
    }

    /// Pops blocks until one handles `why`.
    ///
    /// Returns `None` when execution continues in this frame, or how the frame exits
    /// when the block stack runs out.
    pub(super) fn unwind(&mut self, frame: &mut Frame, mut why: Unwind) -> RunResult<Option<FrameExit>> {
        while let Some(top) = frame.blocks.last() {
            if top.kind == BlockKind::Loop
                && let Unwind::Continue(target) = why
            {
                frame.ip = target;
                return Ok(None);
            }
            let block = self.pop_block(frame)?;
            if block.kind == BlockKind::ExceptHandler {
                self.unwind_except_handler(frame, block)?;
                continue;
            }
            frame.unwind_stack(block.level, &mut self.heap);
            why = match (block.kind, why) {
                (BlockKind::Loop, Unwind::Break) => {
                    frame.ip = block.handler;
                    return Ok(None);
                }
                (BlockKind::Except | BlockKind::Finally, Unwind::Exception(err) | Unwind::Reraise(err)) => {
                    self.enter_handler(frame, block.handler, err)?;
                    return Ok(None);
                }
                (BlockKind::Finally, Unwind::Return(value)) => {
                    frame.push(value);
                    frame.push(Value::Reason(UnwindReason::Return));
                    frame.ip = block.handler;
                    return Ok(None);
                }
                (BlockKind::Finally, Unwind::Continue(target)) => {
                    let target = i64::try_from(target).map_err(|_| RunError::internal("jump target out of range"))?;
                    frame.push(Value::Int(target));
                    frame.push(Value::Reason(UnwindReason::Continue));
                    frame.ip = block.handler;
                    return Ok(None);
                }
                (BlockKind::Finally, Unwind::Break) => {
                    frame.push(Value::Reason(UnwindReason::Break));
                    frame.ip = block.handler;
                    return Ok(None);
                }
                (_, why) => why,
            };
        }
        match why {
            Unwind::Return(value) => Ok(Some(FrameExit::Return(value))),
            Unwind::Exception(err) | Unwind::Reraise(err) => Err(err),
            Unwind::Break | Unwind::Continue(_) => Err(RunError::internal("'break' or 'continue' outside a loop")),
        }
    }

    /// Enters an `except` or `finally` handler for `err`.
    ///
    /// Saves the previously handled exception under an `ExceptHandler` block and pushes
    /// `traceback, value, type` for the handler to inspect.
    fn enter_handler(&mut self, frame: &mut Frame, handler: usize, err: RunError) -> RunResult<()> {
        let RunError::Exc(raise) = err else {
            return Err(err);
        };
        let ExceptionRaise {
            exc,
            traceback,
            instance,
        } = *raise;
        if let Err(err) = self.push_block(frame, BlockKind::ExceptHandler, handler) {
            if let Some(id) = instance {
                self.heap.dec_ref(id);
            }
            return Err(err);
        }
        let exc_type = exc.exc_type();
        let traceback_id = match self.heap.allocate(HeapData::Traceback(traceback)) {
            Ok(id) => id,
            Err(err) => {
                if let Some(id) = instance {
                    self.heap.dec_ref(id);
                }
                return Err(err.into());
            }
        };
        let value_id = match instance {
            Some(id) => id,
            None => match self.heap.allocate(HeapData::Exception(ExceptionObject::new(exc))) {
                Ok(id) => id,
                Err(err) => {
                    self.heap.dec_ref(traceback_id);
                    return Err(err.into());
                }
            },
        };

        let previous = mem::take(&mut self.exc_info);
        frame.push(previous.traceback);
        frame.push(previous.value);
        frame.push(previous.exc_type);

        self.heap.inc_ref(traceback_id);
        self.heap.inc_ref(value_id);
        self.exc_info = ExcInfo {
            exc_type: Value::Builtin(Builtins::ExcType(exc_type)),
            value: Value::Ref(value_id),
            traceback: Value::Ref(traceback_id),
        };
        frame.push(Value::Ref(traceback_id));
        frame.push(Value::Ref(value_id));
        frame.push(Value::Builtin(Builtins::ExcType(exc_type)));
        frame.ip = handler;
        Ok(())
    }

    /// Leaves an exception handler, restoring the exception state it saved.
    pub(super) fn unwind_except_handler(&mut self, frame: &mut Frame, block: Block) -> RunResult<()> {
        if frame.stack.len() < block.level + 3 {
            return Err(RunError::internal("except handler block below its saved state"));
        }
        frame.unwind_stack(block.level + 3, &mut self.heap);
        let exc_type = frame.pop();
        let value = frame.pop();
        let traceback = frame.pop();
        let handled = mem::replace(
            &mut self.exc_info,
            ExcInfo {
                exc_type,
                value,
                traceback,
            },
        );
        handled.drop_with_heap(&mut self.heap);
        Ok(())
    }

    /// Rebuilds a raisable error from a handler's `type, value, traceback` triple.
    fn error_from_triple(&mut self, exc_type: Value, value: Value, traceback: Value) -> RunError {
        let frames = match traceback.ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::Traceback(frames)) => frames.clone(),
            _ => Vec::new(),
        };
        traceback.drop_with_heap(&mut self.heap);
        let kind = exc_type.as_exc_type().unwrap_or(ExcType::RuntimeError);
        exc_type.drop_with_heap(&mut self.heap);

        let instance = match value.ref_id().map(|id| (id, self.heap.get(id))) {
            Some((id, HeapData::Exception(object))) => Some((id, object.exc.clone())),
            _ => None,
        };
        let raise = match instance {
            Some((id, exc)) => {
                // the raise takes over the handler's reference
                self.heap.inc_ref(id);
                ExceptionRaise {
                    exc,
                    traceback: frames,
                    instance: Some(id),
                }
            }
            None => ExceptionRaise {
                exc: SimpleException::new(kind, None),
                traceback: frames,
                instance: None,
            },
        };
        value.drop_with_heap(&mut self.heap);
        raise.into()
    }

    /// `RAISE_VARARGS`: `raise`, `raise exc` and `raise exc from cause`.
    pub(super) fn raise_varargs(&mut self, frame: &mut Frame, argc: usize) -> RunResult<Control> {
        match argc {
            0 => {
                if !self.exc_info.is_active() {
                    return Err(ExcType::runtime_error("No active exception to reraise"));
                }
                let ExcInfo {
                    exc_type,
                    value,
                    traceback,
                } = self.exc_info.clone_with_heap(&self.heap);
                let err = self.error_from_triple(exc_type, value, traceback);
                Ok(Control::Unwind(Unwind::Reraise(err)))
            }
            1 | 2 => {
                if argc == 2 {
                    let cause = frame.pop();
                    let valid = cause.is_none() || cause.as_exc_type().is_some() || self.is_exception_instance(&cause);
                    cause.drop_with_heap(&mut self.heap);
                    if !valid {
                        frame.pop().drop_with_heap(&mut self.heap);
                        return Err(ExcType::type_error("exception causes must derive from BaseException"));
                    }
                }
                let exc = frame.pop();
                Err(self.make_raise(exc))
            }
            _ => Err(RunError::internal("bad RAISE_VARARGS oparg")),
        }
    }

    pub(super) fn is_exception_instance(&self, value: &Value) -> bool {
        value
            .ref_id()
            .is_some_and(|id| matches!(self.heap.get(id), HeapData::Exception(_)))
    }

    /// Converts the operand of `raise` into an error, consuming it.
    pub(super) fn make_raise(&mut self, exc: Value) -> RunError {
        if let Some(exc_type) = exc.as_exc_type() {
            return SimpleException::new(exc_type, None).into();
        }
        let instance = match exc.ref_id().map(|id| (id, self.heap.get(id))) {
            Some((id, HeapData::Exception(object))) => Some((id, object.exc.clone())),
            _ => None,
        };
        match instance {
            Some((id, simple)) => {
                self.heap.inc_ref(id);
                exc.drop_with_heap(&mut self.heap);
                ExceptionRaise {
                    exc: simple,
                    traceback: Vec::new(),
                    instance: Some(id),
                }
                .into()
            }
            None => {
                exc.drop_with_heap(&mut self.heap);
                ExcType::type_error("exceptions must derive from BaseException")
            }
        }
    }

    /// `END_FINALLY`: resumes whatever the `finally` handler interrupted.
    pub(super) fn end_finally(&mut self, frame: &mut Frame) -> RunResult<Control> {
        let top = frame.pop();
        let reason = match &top {
            Value::None => return Ok(Control::Next),
            Value::Reason(reason) => Some(Some(*reason)),
            Value::Builtin(Builtins::ExcType(_)) => Some(None),
            _ => None,
        };
        let Some(reason) = reason else {
            top.drop_with_heap(&mut self.heap);
            return Err(RunError::internal("'finally' pops bad exception"));
        };
        match reason {
            Some(UnwindReason::Return) => Ok(Control::Unwind(Unwind::Return(frame.pop()))),
            Some(UnwindReason::Continue) => {
                let target = frame.pop();
                match target.as_int().and_then(|t| usize::try_from(t).ok()) {
                    Some(target) => Ok(Control::Unwind(Unwind::Continue(target))),
                    None => {
                        target.drop_with_heap(&mut self.heap);
                        Err(RunError::internal("'continue' target is not an offset"))
                    }
                }
            }
            Some(UnwindReason::Break) => Ok(Control::Unwind(Unwind::Break)),
            Some(UnwindReason::Silenced) => {
                let block = self.pop_block(frame)?;
                if block.kind != BlockKind::ExceptHandler {
                    return Err(RunError::internal("silenced exception outside an except handler"));
                }
                self.unwind_except_handler(frame, block)?;
                Ok(Control::Next)
            }
            Some(_) => Err(RunError::internal("'finally' pops bad unwind reason")),
            None => {
                let value = frame.pop();
                let traceback = frame.pop();
                let err = self.error_from_triple(top, value, traceback);
                Ok(Control::Unwind(Unwind::Reraise(err)))
            }
        }
    }

    /// `POP_EXCEPT`: the end of an `except` clause body.
    pub(super) fn pop_except(&mut self, frame: &mut Frame) -> RunResult<()> {
        let block = self.pop_block(frame)?;
        if block.kind != BlockKind::ExceptHandler {
            return Err(RunError::internal("popped block is not an except handler"));
        }
        self.unwind_except_handler(frame, block)
    }

    /// `SETUP_WITH`: pushes the manager's `__exit__`, calls `__enter__` and guards the
    /// body with a `finally` block.
    pub(super) fn setup_with(&mut self, frame: &mut Frame, handler: usize) -> RunResult<()> {
        let manager = frame.pop();
        let this = self;
        defer_drop!(manager, this);
        let enter = this.special_method(manager, "__enter__")?;
        let exit = match this.special_method(manager, "__exit__") {
            Ok(exit) => exit,
            Err(err) => {
                enter.drop_with_heap(&mut this.heap);
                return Err(err);
            }
        };
        frame.push(exit);
        let entered = this.call_value(enter, CallArgs::default())?;
        if let Err(err) = this.push_block(frame, BlockKind::Finally, handler) {
            entered.drop_with_heap(&mut this.heap);
            return Err(err);
        }
        frame.push(entered);
        Ok(())
    }

    fn special_method(&mut self, owner: &Value, name: &str) -> RunResult<Value> {
        match self.load_attr(owner, name) {
            Err(err) if err.matches(ExcType::AttributeError) => {
                err.drop_with_heap(&mut self.heap);
                Err(SimpleException::new_msg(ExcType::AttributeError, name).into())
            }
            result => result,
        }
    }

    /// `WITH_CLEANUP`: calls `__exit__` as the `with` body is left.
    ///
    /// The top of the stack says how the body was left: `None` for falling off the end,
    /// an unwind reason for `return`/`break`/`continue`, or an exception triple. The
    /// `__exit__` callable is removed from underneath it, and a truthy result with an
    /// exception pushes a `Silenced` reason for `END_FINALLY`.
    pub(super) fn with_cleanup(&mut self, frame: &mut Frame) -> RunResult<()> {
        enum Exit {
            Normal,
            Reason(UnwindReason),
            Exception,
        }

        let how = match frame.peek(1) {
            Value::None => Exit::Normal,
            Value::Reason(reason) => Exit::Reason(*reason),
            _ => Exit::Exception,
        };
        let (exit, args) = match how {
            Exit::Normal => {
                let none = frame.pop();
                let exit = frame.pop();
                frame.push(none);
                (exit, None)
            }
            Exit::Reason(reason) => {
                let marker = frame.pop();
                let exit = if matches!(reason, UnwindReason::Return | UnwindReason::Continue) {
                    let retval = frame.pop();
                    let exit = frame.pop();
                    frame.push(retval);
                    exit
                } else {
                    frame.pop()
                };
                frame.push(marker);
                (exit, None)
            }
            Exit::Exception => {
                let len = frame.stack.len();
                if len < 7 {
                    return Err(RunError::internal("WITH_CLEANUP below the exception triple"));
                }
                match frame.blocks.last_mut() {
                    Some(block) if block.kind == BlockKind::ExceptHandler => block.level -= 1,
                    _ => return Err(RunError::internal("WITH_CLEANUP outside an except handler")),
                }
                // shift the saved exception state down over the `__exit__` slot
                let exit = mem::replace(&mut frame.stack[len - 7], Value::Undefined);
                frame.stack[len - 7..len - 3].rotate_left(1);
                let args = [
                    frame.peek(1).clone_with_heap(&self.heap),
                    frame.peek(2).clone_with_heap(&self.heap),
                    frame.peek(3).clone_with_heap(&self.heap),
                ];
                (exit, Some(args))
            }
        };
        let had_exception = args.is_some();
        let args = CallArgs::from_values(args.unwrap_or([Value::None, Value::None, Value::None]));
        let result = self.call_value(exit, args)?;
        let silenced = had_exception && result.py_bool(&self.heap, self.interns);
        result.drop_with_heap(&mut self.heap);
        if silenced {
            frame.push(Value::Reason(UnwindReason::Silenced));
        }
        Ok(())
    }
}
