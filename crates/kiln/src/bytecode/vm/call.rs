//! The call protocol: collecting arguments at the call site and dispatching on the
//! kind of callable.

use std::sync::Arc;

use super::{Frame, VM, generator::GenInput, generator::GenOutcome};
use crate::{
    args::CallArgs,
    builtins::Builtins,
    bytecode::Opcode,
    defer_drop,
    exception_private::{ExcType, RunError, RunResult, SimpleException},
    heap::{DropWithHeap, HeapData, HeapId},
    host::HostFunctionId,
    io::PrintWriter,
    object::Object,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{Generator, MethodKind},
    value::Value,
};

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    /// The `CALL_FUNCTION` family.
    ///
    /// The low byte of the argument counts positional arguments and the next byte
    /// keyword pairs. Above them sit the `*args` value and then the `**kwargs` value,
    /// for the opcodes that take them.
    pub(super) fn call_function_op(&mut self, frame: &mut Frame, opcode: Opcode, arg: u32) -> RunResult<Value> {
        let npos = (arg & 0xff) as usize;
        let nkw = ((arg >> 8) & 0xff) as usize;
        let kwargs = matches!(opcode, Opcode::CallFunctionKw | Opcode::CallFunctionVarKw).then(|| frame.pop());
        let varargs = matches!(opcode, Opcode::CallFunctionVar | Opcode::CallFunctionVarKw).then(|| frame.pop());
        let kw_flat = frame.pop_n(2 * nkw);
        let positional = frame.pop_n(npos);
        let callable = frame.pop();

        match self.collect_call_args(&callable, positional, kw_flat, varargs, kwargs) {
            Ok(args) => self.call_value(callable, args),
            Err(err) => {
                callable.drop_with_heap(&mut self.heap);
                Err(err)
            }
        }
    }

    fn collect_call_args(
        &mut self,
        callable: &Value,
        positional: Vec<Value>,
        kw_flat: Vec<Value>,
        varargs: Option<Value>,
        kwargs: Option<Value>,
    ) -> RunResult<CallArgs> {
        let mut args = CallArgs::new(positional.into_iter().collect(), Vec::with_capacity(kw_flat.len() / 2));
        let mut flat = kw_flat.into_iter();
        while let (Some(key), Some(value)) = (flat.next(), flat.next()) {
            args.keywords.push((key, value));
        }
        if let Some(star) = varargs {
            match self.star_args(callable, star) {
                Ok(items) => args.positional.extend(items),
                Err(err) => {
                    args.drop_with_heap(&mut self.heap);
                    kwargs.drop_with_heap(&mut self.heap);
                    return Err(err);
                }
            }
        }
        if let Some(mapping) = kwargs {
            let pairs = self.star_kwargs(callable, &mapping, &args.keywords);
            mapping.drop_with_heap(&mut self.heap);
            match pairs {
                Ok(pairs) => args.keywords.extend(pairs),
                Err(err) => {
                    args.drop_with_heap(&mut self.heap);
                    return Err(err);
                }
            }
        }
        Ok(args)
    }

    /// Expands the `*args` operand of a call.
    fn star_args(&mut self, callable: &Value, star: Value) -> RunResult<Vec<Value>> {
        let type_name = star.type_name(&self.heap);
        match self.collect_iterable(star) {
            Err(err) if err.matches(ExcType::TypeError) => {
                err.drop_with_heap(&mut self.heap);
                Err(ExcType::type_error(format!(
                    "{}() argument after * must be a sequence, not {type_name}",
                    self.callable_name(callable)
                )))
            }
            result => result,
        }
    }

    /// Validates the `**kwargs` operand of a call and copies out its pairs.
    fn star_kwargs(&self, callable: &Value, mapping: &Value, explicit: &[(Value, Value)]) -> RunResult<Vec<(Value, Value)>> {
        let Some(HeapData::Dict(dict)) = mapping.ref_id().map(|id| self.heap.get(id)) else {
            return Err(ExcType::type_error(format!(
                "{}() argument after ** must be a mapping, not {}",
                self.callable_name(callable),
                mapping.type_name(&self.heap)
            )));
        };
        for (key, _) in dict.iter() {
            let Some(name) = key.as_str(&self.heap, self.interns) else {
                return Err(ExcType::type_error_keywords_must_be_strings(&self.callable_name(callable)));
            };
            if explicit
                .iter()
                .any(|(existing, _)| existing.as_str(&self.heap, self.interns) == Some(name))
            {
                return Err(ExcType::type_error(format!(
                    "{}() got multiple values for keyword argument '{name}'",
                    self.callable_name(callable)
                )));
            }
        }
        Ok(dict
            .iter()
            .map(|(key, value)| (key.clone_with_heap(&self.heap), value.clone_with_heap(&self.heap)))
            .collect())
    }

    /// Name of a callable as it appears in call errors.
    pub(super) fn callable_name(&self, callable: &Value) -> String {
        match callable {
            Value::Builtin(Builtins::Function(function)) => function.to_string(),
            Value::Builtin(Builtins::ExcType(exc_type)) => exc_type.to_string(),
            Value::HostFunction(id) => self.host.name(*id).to_owned(),
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Function(function) => self.interns.get_str(function.qualname).to_owned(),
                HeapData::BoundMethod(bound) => bound.method.to_string(),
                other => other.type_name().to_owned(),
            },
            other => other.type_name(&self.heap).to_owned(),
        }
    }

    /// Calls any callable value, consuming it and the arguments.
    pub(crate) fn call_value(&mut self, callable: Value, args: CallArgs) -> RunResult<Value> {
        let this = self;
        defer_drop!(callable, this);
        match callable {
            Value::Builtin(builtin) => {
                if matches!(builtin, Builtins::ExcType(_)) {
                    this.thread.stats.other += 1;
                } else {
                    this.thread.stats.builtin += 1;
                }
                (*builtin).call(this, args)
            }
            Value::HostFunction(id) => {
                this.thread.stats.builtin += 1;
                this.call_host(*id, args)
            }
            Value::Ref(id) => match this.heap.get(*id) {
                HeapData::Function(_) => this.call_function(*id, args),
                HeapData::BoundMethod(_) => this.call_method(*id, args),
                other => {
                    let type_name = other.type_name();
                    args.drop_with_heap(&mut this.heap);
                    Err(ExcType::not_callable(type_name))
                }
            },
            other => {
                let type_name = other.type_name(&this.heap);
                args.drop_with_heap(&mut this.heap);
                Err(ExcType::not_callable(type_name))
            }
        }
    }

    /// Calls a host function: arguments leave the heap as [`Object`]s and the result
    /// comes back the same way.
    fn call_host(&mut self, id: HostFunctionId, args: CallArgs) -> RunResult<Value> {
        let host = self.host;
        let name = host.name(id);
        let positional = args.into_positional(name, 0, usize::MAX, &mut self.heap)?;
        let objects: Vec<Object> = positional
            .iter()
            .map(|value| Object::from_value(value, &self.heap, self.interns))
            .collect();
        for value in positional {
            value.drop_with_heap(&mut self.heap);
        }
        tracing::trace!(function = name, args = objects.len(), "calling host function");
        let function = host.get(id);
        let result = function(&objects)?;
        result.into_value(&mut self.heap, self.interns)
    }

    /// Calls a user function, or creates a generator if its code is a generator.
    fn call_function(&mut self, id: HeapId, args: CallArgs) -> RunResult<Value> {
        let HeapData::Function(function) = self.heap.get(id) else {
            args.drop_with_heap(&mut self.heap);
            return Err(RunError::internal("call_function on a non-function"));
        };
        let code = Arc::clone(&function.code);
        let qualname = function.qualname;
        let fast = function.is_simple() && args.keywords.is_empty() && args.positional.len() == code.argcount() as usize;

        let frame = if fast {
            let mut locals: Vec<Value> = args.positional.into_iter().collect();
            locals.resize_with(code.nlocals(), || Value::Undefined);
            Frame::new(code, locals, Vec::new())
        } else {
            self.bind_arguments(id, &code, args)?
        };

        if frame.code.is_generator() {
            self.thread.stats.generator += 1;
            let generator = self.heap.allocate(HeapData::Generator(Generator::new(frame, qualname)))?;
            return Ok(Value::Ref(generator));
        }
        if fast {
            self.thread.stats.fast_path += 1;
        } else {
            self.thread.stats.direct += 1;
        }
        self.run_frame(frame)
    }

    /// Calls a native method bound to its receiver.
    fn call_method(&mut self, id: HeapId, args: CallArgs) -> RunResult<Value> {
        let HeapData::BoundMethod(bound) = self.heap.get(id) else {
            args.drop_with_heap(&mut self.heap);
            return Err(RunError::internal("call_method on a non-method"));
        };
        let method = bound.method;
        let Some(receiver) = bound.receiver.ref_id() else {
            args.drop_with_heap(&mut self.heap);
            return Err(RunError::internal("native method bound to an immediate value"));
        };
        if method.is_generator_method() {
            self.thread.stats.bound_method += 1;
        } else {
            self.thread.stats.method += 1;
        }
        let name: &'static str = method.into();

        match method {
            MethodKind::GeneratorSend => {
                let value = args.into_one(name, &mut self.heap)?;
                match self.resume_generator(receiver, GenInput::Send(value))? {
                    GenOutcome::Yielded(value) => Ok(value),
                    GenOutcome::Returned(value) => Err(self.stop_iteration_with(value)),
                }
            }
            MethodKind::GeneratorThrow => {
                let mut positional = args.into_positional(name, 1, 3, &mut self.heap)?;
                if positional.len() == 3 {
                    // tracebacks are rebuilt from the frames the exception unwinds
                    positional.pop().drop_with_heap(&mut self.heap);
                }
                let value = if positional.len() == 2 { positional.pop() } else { None };
                let exc_type = positional.pop().expect("length checked above");
                let err = self.throw_error(exc_type, value)?;
                match self.resume_generator(receiver, GenInput::Throw(err))? {
                    GenOutcome::Yielded(value) => Ok(value),
                    GenOutcome::Returned(value) => Err(self.stop_iteration_with(value)),
                }
            }
            MethodKind::GeneratorClose => {
                args.into_positional(name, 0, 0, &mut self.heap)?;
                self.close_generator(receiver)?;
                Ok(Value::None)
            }
            MethodKind::ListAppend => {
                let value = args.into_one(name, &mut self.heap)?;
                match self.heap.get_mut(receiver) {
                    HeapData::List(items) => {
                        items.push(value);
                        Ok(Value::None)
                    }
                    _ => {
                        value.drop_with_heap(&mut self.heap);
                        Err(RunError::internal("append bound to a non-list"))
                    }
                }
            }
            MethodKind::DictGet => {
                let mut positional = args.into_positional(name, 1, 2, &mut self.heap)?;
                let default = if positional.len() == 2 { positional.pop() } else { None };
                let key = positional.pop().expect("length checked above");
                let hashed = key.dict_key(&self.heap, self.interns);
                key.drop_with_heap(&mut self.heap);
                let hashed = match hashed {
                    Ok(hashed) => hashed,
                    Err(err) => {
                        default.drop_with_heap(&mut self.heap);
                        return Err(err);
                    }
                };
                let found = match self.heap.get(receiver) {
                    HeapData::Dict(dict) => dict.get(&hashed).map(|value| value.clone_with_heap(&self.heap)),
                    _ => None,
                };
                match found {
                    Some(value) => {
                        default.drop_with_heap(&mut self.heap);
                        Ok(value)
                    }
                    None => Ok(default.unwrap_or(Value::None)),
                }
            }
            MethodKind::DictKeys => {
                args.into_positional(name, 0, 0, &mut self.heap)?;
                let keys: Vec<Value> = match self.heap.get(receiver) {
                    HeapData::Dict(dict) => dict.iter().map(|(key, _)| key.clone_with_heap(&self.heap)).collect(),
                    _ => Vec::new(),
                };
                Ok(Value::Ref(self.heap.allocate(HeapData::List(keys))?))
            }
            MethodKind::SuppressEnter => {
                args.into_positional(name, 0, 0, &mut self.heap)?;
                Ok(Value::None)
            }
            MethodKind::SuppressExit => {
                let positional = args.into_positional(name, 3, 3, &mut self.heap)?;
                let exc_type = positional[0].as_exc_type();
                for value in positional {
                    value.drop_with_heap(&mut self.heap);
                }
                let suppressed = match (exc_type, self.heap.get(receiver)) {
                    (Some(exc_type), HeapData::Suppress(kinds)) => kinds.iter().any(|kind| exc_type.is_subclass_of(*kind)),
                    _ => false,
                };
                Ok(Value::Bool(suppressed))
            }
        }
    }

    /// Builds the error `generator.throw(type[, value])` raises inside the generator.
    fn throw_error(&mut self, exc_type: Value, value: Option<Value>) -> RunResult<RunError> {
        let has_value = value.as_ref().is_some_and(|v| !v.is_none());
        if let Some(kind) = exc_type.as_exc_type() {
            let message = match &value {
                Some(v) if has_value => Some(v.py_str(&self.heap, self.interns)),
                _ => None,
            };
            value.drop_with_heap(&mut self.heap);
            return Ok(SimpleException::new(kind, message).into());
        }
        if self.is_exception_instance(&exc_type) {
            value.drop_with_heap(&mut self.heap);
            if has_value {
                exc_type.drop_with_heap(&mut self.heap);
                return Err(ExcType::type_error("instance exception may not have a separate value"));
            }
            return Ok(self.make_raise(exc_type));
        }
        let type_name = exc_type.type_name(&self.heap);
        exc_type.drop_with_heap(&mut self.heap);
        value.drop_with_heap(&mut self.heap);
        Err(ExcType::type_error(format!(
            "exceptions must be classes or instances deriving from BaseException, not {type_name}"
        )))
    }
}
