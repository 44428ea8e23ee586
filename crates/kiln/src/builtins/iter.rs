//! Implementation of the iter() and next() builtin functions.

use crate::{
    args::CallArgs,
    bytecode::VM,
    exception_private::{ExcType, RunResult},
    heap::DropWithHeap,
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    value::Value,
};

pub fn builtin_iter<T: ResourceTracker, P: PrintWriter, Tr: VmTracer>(
    vm: &mut VM<'_, T, P, Tr>,
    args: CallArgs,
) -> RunResult<Value> {
    let value = args.into_one("iter", &mut vm.heap)?;
    vm.get_iter(value)
}

/// `next(iterator[, default])`.
///
/// Exhaustion raises StopIteration (carrying a generator's return value) unless a
/// default is supplied.
pub fn builtin_next<T: ResourceTracker, P: PrintWriter, Tr: VmTracer>(
    vm: &mut VM<'_, T, P, Tr>,
    args: CallArgs,
) -> RunResult<Value> {
    let mut positional = args.into_positional("next", 1, 2, &mut vm.heap)?;
    let default = if positional.len() == 2 { positional.pop() } else { None };
    let iterator = positional.pop().expect("length checked above");
    let result = vm.next_item(&iterator);
    iterator.drop_with_heap(&mut vm.heap);
    match (result, default) {
        (Ok(value), default) => {
            default.drop_with_heap(&mut vm.heap);
            Ok(value)
        }
        (Err(err), Some(default)) if err.matches(ExcType::StopIteration) => {
            err.drop_with_heap(&mut vm.heap);
            Ok(default)
        }
        (Err(err), default) => {
            default.drop_with_heap(&mut vm.heap);
            Err(err)
        }
    }
}
