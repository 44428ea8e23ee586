//! The list() and tuple() constructors.

use crate::{
    args::CallArgs,
    bytecode::VM,
    exception_private::RunResult,
    heap::HeapData,
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    value::Value,
};

pub fn builtin_list<T: ResourceTracker, P: PrintWriter, Tr: VmTracer>(
    vm: &mut VM<'_, T, P, Tr>,
    args: CallArgs,
) -> RunResult<Value> {
    let items = collect_arg("list", vm, args)?;
    Ok(Value::Ref(vm.heap.allocate(HeapData::List(items))?))
}

pub fn builtin_tuple<T: ResourceTracker, P: PrintWriter, Tr: VmTracer>(
    vm: &mut VM<'_, T, P, Tr>,
    args: CallArgs,
) -> RunResult<Value> {
    let items = collect_arg("tuple", vm, args)?;
    Ok(Value::Ref(vm.heap.allocate(HeapData::Tuple(items))?))
}

/// Drains the optional iterable argument into a vector.
fn collect_arg<T: ResourceTracker, P: PrintWriter, Tr: VmTracer>(
    name: &str,
    vm: &mut VM<'_, T, P, Tr>,
    args: CallArgs,
) -> RunResult<Vec<Value>> {
    let mut positional = args.into_positional(name, 0, 1, &mut vm.heap)?;
    match positional.pop() {
        Some(iterable) => vm.collect_iterable(iterable),
        None => Ok(Vec::new()),
    }
}
