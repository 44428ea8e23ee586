//! Resuming, throwing into and closing generators, and `yield from` delegation.

use std::mem;

use super::{BlockKind, Control, Frame, FrameExit, VM};
use crate::{
    bytecode::Instruction,
    defer_drop,
    exception_private::{ExcType, ExceptionRaise, RunError, RunResult, SimpleException},
    heap::{DropWithHeap, Heap, HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{ExceptionObject, GeneratorState},
    value::Value,
};

/// What a resumption delivers to the generator.
#[derive(Debug)]
pub(crate) enum GenInput {
    /// Becomes the result of the suspended yield.
    Send(Value),
    /// Raised at the suspended yield.
    Throw(RunError),
}

impl<T: ResourceTracker> DropWithHeap<T> for GenInput {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        match self {
            Self::Send(value) => value.drop_with_heap(heap),
            Self::Throw(err) => err.drop_with_heap(heap),
        }
    }
}

/// How a resumed generator stopped.
#[derive(Debug)]
pub(crate) enum GenOutcome {
    Yielded(Value),
    /// The generator finished; the value is its return value.
    Returned(Value),
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    /// Runs the generator at `id` until it yields or finishes.
    pub(crate) fn resume_generator(&mut self, id: HeapId, input: GenInput) -> RunResult<GenOutcome> {
        match input {
            GenInput::Throw(err) => self.throw_into(id, err),
            send => self.resume_frame(id, send),
        }
    }

    /// Raises `err` inside the generator, forwarding it to the generator it is
    /// delegating to with `yield from`, if any.
    fn throw_into(&mut self, id: HeapId, err: RunError) -> RunResult<GenOutcome> {
        let delegate = match self.heap.get(id) {
            HeapData::Generator(generator) if generator.state == GeneratorState::Suspended => generator
                .frame
                .as_ref()
                .and_then(|frame| frame.yield_from_target())
                .map(|target| target.clone_with_heap(&self.heap)),
            _ => None,
        };
        let Some(delegate) = delegate else {
            return self.resume_frame(id, GenInput::Throw(err));
        };
        let this = self;
        defer_drop!(delegate, this);
        let sub = delegate
            .ref_id()
            .filter(|sub| matches!(this.heap.get(*sub), HeapData::Generator(_)));

        if err.matches(ExcType::GeneratorExit) {
            let mut err = err;
            if let Some(sub) = sub {
                this.set_generator_state(id, GeneratorState::Running);
                let closed = this.close_generator(sub);
                this.set_generator_state(id, GeneratorState::Suspended);
                if let Err(close_err) = closed {
                    err.drop_with_heap(&mut this.heap);
                    err = close_err;
                }
            }
            return this.resume_frame(id, GenInput::Throw(err));
        }

        let Some(sub) = sub else {
            return this.resume_frame(id, GenInput::Throw(err));
        };
        this.set_generator_state(id, GeneratorState::Running);
        let outcome = this.throw_into(sub, err);
        this.set_generator_state(id, GeneratorState::Suspended);
        let input = match outcome {
            Ok(GenOutcome::Yielded(value)) => return Ok(GenOutcome::Yielded(value)),
            Ok(GenOutcome::Returned(value)) => GenInput::Send(value),
            Err(err) if err.matches(ExcType::StopIteration) => GenInput::Send(this.stop_iteration_value(err)),
            Err(err) => GenInput::Throw(err),
        };
        // the delegate is done: drop it and step past the YIELD_FROM
        this.finish_yield_from(id);
        this.resume_frame(id, input)
    }

    fn set_generator_state(&mut self, id: HeapId, state: GeneratorState) {
        if let HeapData::Generator(generator) = self.heap.get_mut(id) {
            generator.state = state;
        }
    }

    fn finish_yield_from(&mut self, id: HeapId) {
        let receiver = match self.heap.get_mut(id) {
            HeapData::Generator(generator) => generator.frame.as_mut().and_then(|frame| {
                frame.ip += 1;
                frame.stack.pop()
            }),
            _ => None,
        };
        receiver.drop_with_heap(&mut self.heap);
    }

    /// Checks the generator out of the heap and runs its frame.
    fn resume_frame(&mut self, id: HeapId, input: GenInput) -> RunResult<GenOutcome> {
        let state = match self.heap.get(id) {
            HeapData::Generator(generator) => generator.state,
            _ => {
                input.drop_with_heap(&mut self.heap);
                return Err(RunError::internal("resumed a non-generator"));
            }
        };
        match (state, input) {
            (GeneratorState::Running, input) => {
                input.drop_with_heap(&mut self.heap);
                Err(ExcType::generator_already_executing())
            }
            (GeneratorState::Finished, GenInput::Send(value)) => {
                value.drop_with_heap(&mut self.heap);
                Ok(GenOutcome::Returned(Value::None))
            }
            (GeneratorState::Finished, GenInput::Throw(err)) => Err(err),
            (GeneratorState::Created, GenInput::Send(value)) if !value.is_none() => {
                value.drop_with_heap(&mut self.heap);
                Err(ExcType::type_error("can't send non-None value to a just-started generator"))
            }
            (_, input) => self.run_generator(id, input),
        }
    }

    fn run_generator(&mut self, id: HeapId, input: GenInput) -> RunResult<GenOutcome> {
        if let Err(err) = self.enter_recursion() {
            input.drop_with_heap(&mut self.heap);
            return Err(err);
        }
        let checked_out = match self.heap.get_mut(id) {
            HeapData::Generator(generator) => {
                let started = generator.state != GeneratorState::Created;
                generator.state = GeneratorState::Running;
                generator.frame.take().map(|frame| (frame, started, generator.name))
            }
            _ => None,
        };
        let Some((mut frame, started, name)) = checked_out else {
            self.leave_recursion();
            self.set_generator_state(id, GeneratorState::Finished);
            input.drop_with_heap(&mut self.heap);
            return Err(RunError::internal("generator without a frame"));
        };
        // held while running so dropping the last outside reference cannot free it
        self.heap.inc_ref(id);

        let throw = match input {
            GenInput::Send(value) => {
                if started {
                    frame.push(value);
                } else {
                    value.drop_with_heap(&mut self.heap);
                }
                None
            }
            GenInput::Throw(err) => {
                frame.resume_pending = false;
                Some(err)
            }
        };

        if frame.exc_state.is_active() {
            mem::swap(&mut frame.exc_state, &mut self.exc_info);
        } else {
            let caller = self.exc_info.clone_with_heap(&self.heap);
            mem::replace(&mut frame.exc_state, caller).drop_with_heap(&mut self.heap);
        }

        let interns = self.interns;
        self.tracer.on_call(Some(interns.get_str(name)), self.thread.recursion_depth);
        let result = self.eval_frame(&mut frame, throw);
        self.leave_recursion();
        self.tracer.on_return(self.thread.recursion_depth);

        if frame.blocks.iter().any(|block| block.kind == BlockKind::ExceptHandler) {
            mem::swap(&mut frame.exc_state, &mut self.exc_info);
        } else {
            let caller = mem::take(&mut frame.exc_state);
            mem::replace(&mut self.exc_info, caller).drop_with_heap(&mut self.heap);
        }

        let outcome = match result {
            Ok(FrameExit::Yield(value)) => {
                if let HeapData::Generator(generator) = self.heap.get_mut(id) {
                    generator.frame = Some(frame);
                    generator.state = GeneratorState::Suspended;
                } else {
                    (*frame).drop_with_heap(&mut self.heap);
                }
                Ok(GenOutcome::Yielded(value))
            }
            Ok(FrameExit::Return(value)) => {
                self.set_generator_state(id, GeneratorState::Finished);
                (*frame).drop_with_heap(&mut self.heap);
                Ok(GenOutcome::Returned(value))
            }
            Err(err) => {
                self.set_generator_state(id, GeneratorState::Finished);
                (*frame).drop_with_heap(&mut self.heap);
                Err(err)
            }
        };
        self.heap.dec_ref(id);
        outcome
    }

    /// `generator.close()`: raises `GeneratorExit` inside the generator and expects it
    /// to finish.
    pub(crate) fn close_generator(&mut self, id: HeapId) -> RunResult<()> {
        let exit = SimpleException::new(ExcType::GeneratorExit, None).into();
        match self.throw_into(id, exit) {
            Ok(GenOutcome::Yielded(value)) => {
                value.drop_with_heap(&mut self.heap);
                Err(ExcType::runtime_error("generator ignored GeneratorExit"))
            }
            Ok(GenOutcome::Returned(value)) => {
                value.drop_with_heap(&mut self.heap);
                Ok(())
            }
            Err(err) if err.matches(ExcType::GeneratorExit) || err.matches(ExcType::StopIteration) => {
                err.drop_with_heap(&mut self.heap);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// The `StopIteration` that reports a generator's return value.
    pub(crate) fn stop_iteration_with(&mut self, value: Value) -> RunError {
        if value.is_none() {
            return ExcType::stop_iteration();
        }
        let message = value.py_str(&self.heap, self.interns);
        let exc = SimpleException::new(ExcType::StopIteration, Some(message));
        let object = ExceptionObject::with_payload(exc.clone(), value);
        match self.heap.allocate(HeapData::Exception(object)) {
            Ok(id) => ExceptionRaise {
                exc,
                traceback: Vec::new(),
                instance: Some(id),
            }
            .into(),
            Err(err) => err.into(),
        }
    }

    /// The value carried by a `StopIteration` error, consuming the error.
    pub(crate) fn stop_iteration_value(&mut self, err: RunError) -> Value {
        let value = match &err {
            RunError::Exc(raise) => raise.instance.and_then(|id| match self.heap.get(id) {
                HeapData::Exception(object) => Some(object.payload.clone_with_heap(&self.heap)),
                _ => None,
            }),
            _ => None,
        };
        err.drop_with_heap(&mut self.heap);
        value.unwrap_or(Value::None)
    }

    /// `YIELD_FROM`: sends the value on top of the stack to the iterator below it.
    ///
    /// While the iterator keeps yielding, this frame yields the same values and stays
    /// on this instruction. When it finishes, its return value replaces it on the stack.
    pub(super) fn yield_from(&mut self, frame: &mut Frame, instr: Instruction) -> RunResult<Control> {
        let sent = frame.pop();
        let receiver = frame.peek(1);
        let generator = receiver
            .ref_id()
            .filter(|id| matches!(self.heap.get(*id), HeapData::Generator(_)));
        let outcome = match generator {
            Some(id) => self.resume_generator(id, GenInput::Send(sent)),
            None if sent.is_none() => match self.advance(frame.peek(1)) {
                Ok(Some(value)) => Ok(GenOutcome::Yielded(value)),
                Ok(None) => Ok(GenOutcome::Returned(Value::None)),
                Err(err) => Err(err),
            },
            None => {
                let type_name = receiver.type_name(&self.heap);
                sent.drop_with_heap(&mut self.heap);
                Err(ExcType::attribute_error(type_name, "send"))
            }
        };
        let result = match outcome {
            Ok(GenOutcome::Yielded(value)) => {
                frame.ip = instr.offset;
                return Ok(Control::Yield(value));
            }
            Ok(GenOutcome::Returned(value)) => value,
            Err(err) if err.matches(ExcType::StopIteration) => self.stop_iteration_value(err),
            Err(err) => return Err(err),
        };
        frame.pop().drop_with_heap(&mut self.heap);
        frame.push(result);
        Ok(Control::Next)
    }
}
