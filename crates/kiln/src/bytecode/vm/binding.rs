//! Binding call arguments to a function's parameters.
//!
//! Parameters occupy the first local slots in this order: positional parameters,
//! keyword-only parameters, then `*args` and `**kwargs` when the code accepts them.
//! Binding fills those slots from the call's positional and keyword arguments and the
//! function's defaults, then moves captured arguments into their cells.

use std::{mem, sync::Arc};

use super::{Frame, VM};
use crate::{
    args::CallArgs,
    bytecode::{Code, CodeFlags},
    defer_drop_mut,
    exception_private::{ExcType, RunError, RunResult},
    heap::{DropWithHeap, HeapData, HeapId},
    intern::Interns,
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::Dict,
    value::Value,
};

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    /// Builds the frame for a call of the function at `function_id` through the general
    /// binding algorithm.
    pub(super) fn bind_arguments(&mut self, function_id: HeapId, code: &Arc<Code>, args: CallArgs) -> RunResult<Frame> {
        let mut locals: Vec<Value> = (0..code.nlocals()).map(|_| Value::Undefined).collect();
        if let Err(err) = self.bind_parameters(function_id, code, args, &mut locals) {
            locals.drop_with_heap(&mut self.heap);
            return Err(err);
        }
        match self.make_cells(function_id, code, &mut locals) {
            Ok(cells) => Ok(Frame::new(Arc::clone(code), locals, cells)),
            Err(err) => {
                locals.drop_with_heap(&mut self.heap);
                Err(err)
            }
        }
    }

    fn bind_parameters(
        &mut self,
        function_id: HeapId,
        code: &Code,
        args: CallArgs,
        locals: &mut [Value],
    ) -> RunResult<()> {
        if locals.len() < code.total_args() {
            args.drop_with_heap(&mut self.heap);
            return Err(RunError::internal("fewer locals than parameters"));
        }
        let interns = self.interns;
        let name = interns.get_str(code.name());
        let argcount = code.argcount() as usize;
        let nparams = argcount + code.kwonlyargcount() as usize;
        let has_varargs = code.flags().contains(CodeFlags::VARARGS);
        let has_varkw = code.flags().contains(CodeFlags::VARKEYWORDS);

        let CallArgs { positional, keywords } = args;
        let given = positional.len();
        let positional = positional.into_vec().into_iter();
        let keywords = keywords.into_iter();
        let this = self;
        defer_drop_mut!(positional, this);
        defer_drop_mut!(keywords, this);

        let kwdict = if has_varkw {
            let id = this.heap.allocate(HeapData::Dict(Dict::new()))?;
            locals[nparams + usize::from(has_varargs)] = Value::Ref(id);
            Some(id)
        } else {
            None
        };

        for (slot, value) in locals.iter_mut().zip(positional.by_ref().take(given.min(argcount))) {
            *slot = value;
        }
        if has_varargs {
            let rest: Vec<Value> = positional.by_ref().collect();
            let id = this.heap.allocate(HeapData::Tuple(rest))?;
            locals[nparams] = Value::Ref(id);
        }

        for (key, value) in keywords.by_ref() {
            // Ok(None) sends the pair to **kwargs
            let target = match key.as_str(&this.heap, interns) {
                None => Err(ExcType::type_error_keywords_must_be_strings(name)),
                Some(key_str) => match find_parameter(code, nparams, &key, key_str, interns) {
                    Some(slot) if !locals[slot].is_undefined() => Err(ExcType::type_error_duplicate_arg(name, key_str)),
                    Some(slot) => Ok(Some(slot)),
                    None if kwdict.is_some() => Ok(None),
                    None => Err(ExcType::type_error_unexpected_keyword(name, key_str)),
                },
            };
            match target {
                Ok(Some(slot)) => {
                    key.drop_with_heap(&mut this.heap);
                    locals[slot] = value;
                }
                Ok(None) => {
                    let hashed = match key.dict_key(&this.heap, interns) {
                        Ok(hashed) => hashed,
                        Err(err) => {
                            key.drop_with_heap(&mut this.heap);
                            value.drop_with_heap(&mut this.heap);
                            return Err(err);
                        }
                    };
                    let replaced = match kwdict.map(|id| this.heap.get_mut(id)) {
                        Some(HeapData::Dict(dict)) => dict.insert(hashed, key, value),
                        _ => Some((key, value)),
                    };
                    replaced.drop_with_heap(&mut this.heap);
                }
                Err(err) => {
                    key.drop_with_heap(&mut this.heap);
                    value.drop_with_heap(&mut this.heap);
                    return Err(err);
                }
            }
        }

        let HeapData::Function(function) = this.heap.get(function_id) else {
            return Err(RunError::internal("binding arguments for a non-function"));
        };
        let defcount = function.defaults.len();

        if given > argcount && !has_varargs {
            let kwonly_given = locals[argcount..nparams].iter().filter(|v| !v.is_undefined()).count();
            return Err(ExcType::type_error_too_many_positional(
                name,
                argcount - defcount,
                argcount,
                given,
                kwonly_given,
            ));
        }

        if given < argcount {
            let required = argcount - defcount;
            let missing: Vec<&str> = (given..required)
                .filter(|&i| locals[i].is_undefined())
                .map(|i| interns.get_str(code.varnames[i]))
                .collect();
            if !missing.is_empty() {
                return Err(ExcType::type_error_missing_positional_with_names(name, &missing));
            }
            let first = given.saturating_sub(required);
            for (i, default) in function.defaults.iter().enumerate().skip(first) {
                let slot = &mut locals[required + i];
                if slot.is_undefined() {
                    *slot = default.clone_with_heap(&this.heap);
                }
            }
        }

        if nparams > argcount {
            let mut missing = Vec::new();
            for slot in argcount..nparams {
                if !locals[slot].is_undefined() {
                    continue;
                }
                let param = code.varnames[slot];
                match function.kw_default(param) {
                    Some(default) => locals[slot] = default.clone_with_heap(&this.heap),
                    None => missing.push(interns.get_str(param)),
                }
            }
            if !missing.is_empty() {
                return Err(ExcType::type_error_missing_kwonly_with_names(name, &missing));
            }
        }
        Ok(())
    }

    /// Creates the frame's cells: fresh cells for the code's cell variables (seeded from
    /// the argument they capture) followed by the function's closure.
    fn make_cells(&mut self, function_id: HeapId, code: &Code, locals: &mut [Value]) -> RunResult<Vec<HeapId>> {
        let mut cells = Vec::with_capacity(code.ncells());
        for arg in &code.cell_args {
            let value = arg
                .and_then(|slot| locals.get_mut(slot as usize))
                .map_or(Value::Undefined, |local| mem::replace(local, Value::Undefined));
            match self.heap.allocate(HeapData::Cell(value)) {
                Ok(id) => cells.push(id),
                Err(err) => {
                    release_cells(self, cells);
                    return Err(err.into());
                }
            }
        }
        let closure = match self.heap.get(function_id) {
            HeapData::Function(function) => function.closure_with_refs(&self.heap),
            _ => Vec::new(),
        };
        if closure.len() != code.freevars.len() {
            release_cells(self, cells);
            release_cells(self, closure);
            return Err(RunError::internal("closure size does not match free variables"));
        }
        cells.extend(closure);
        Ok(cells)
    }
}

fn release_cells<T: ResourceTracker, P: PrintWriter, Tr: VmTracer>(vm: &mut VM<'_, T, P, Tr>, cells: Vec<HeapId>) {
    for id in cells {
        vm.heap.dec_ref(id);
    }
}

/// Finds the parameter slot named by a keyword argument.
///
/// Interned names compare by id; anything else falls back to comparing text.
fn find_parameter(
    code: &Code,
    nparams: usize,
    key: &Value,
    key_str: &str,
    interns: &Interns,
) -> Option<usize> {
    let params = &code.varnames[..nparams];
    if let Value::InternString(id) = key
        && let Some(slot) = params.iter().position(|param| param == id)
    {
        return Some(slot);
    }
    params.iter().position(|param| interns.get_str(*param) == key_str)
}
