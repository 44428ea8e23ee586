//! Builtin functions and exception constructors.
//!
//! Each builtin function has its own submodule; the enums here give them the names
//! bytecode resolves through `LOAD_GLOBAL`/`LOAD_NAME`.

mod abs;
mod collect;
mod iter;
mod len;
mod namespace;
mod print;
mod range;

use std::str::FromStr;

use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    args::CallArgs,
    bytecode::VM,
    exception_private::{ExcType, RunResult, SimpleException},
    heap::{DropWithHeap, HeapData},
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::ExceptionObject,
    value::Value,
};

/// Anything bytecode can find in the builtins namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Builtins {
    /// A builtin function like `print` or `len`.
    Function(BuiltinFunction),
    /// An exception type; calling it creates an exception instance.
    ExcType(ExcType),
}

impl FromStr for Builtins {
    type Err = ();

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        if let Ok(function) = BuiltinFunction::from_str(name) {
            Ok(Self::Function(function))
        } else if let Ok(exc_type) = ExcType::from_str(name) {
            Ok(Self::ExcType(exc_type))
        } else {
            Err(())
        }
    }
}

impl Builtins {
    /// Calls this builtin with the given arguments.
    pub fn call<T: ResourceTracker, P: PrintWriter, Tr: VmTracer>(
        self,
        vm: &mut VM<'_, T, P, Tr>,
        args: CallArgs,
    ) -> RunResult<Value> {
        match self {
            Self::Function(function) => function.call(vm, args),
            Self::ExcType(exc_type) => call_exc_type(exc_type, vm, args),
        }
    }
}

/// Builtin functions.
///
/// All variants serialize to lowercase (e.g., `Print` -> "print").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum BuiltinFunction {
    Abs,
    Iter,
    Len,
    List,
    Namespace,
    Next,
    Print,
    Range,
    Repr,
    Suppress,
    Tuple,
}

impl BuiltinFunction {
    pub fn call<T: ResourceTracker, P: PrintWriter, Tr: VmTracer>(
        self,
        vm: &mut VM<'_, T, P, Tr>,
        args: CallArgs,
    ) -> RunResult<Value> {
        match self {
            Self::Abs => abs::builtin_abs(&mut vm.heap, args),
            Self::Iter => iter::builtin_iter(vm, args),
            Self::Len => len::builtin_len(&mut vm.heap, vm.interns, args),
            Self::List => collect::builtin_list(vm, args),
            Self::Namespace => namespace::builtin_namespace(&mut vm.heap, vm.interns, args),
            Self::Next => iter::builtin_next(vm, args),
            Self::Print => print::builtin_print(&mut vm.heap, vm.interns, &mut *vm.print, args),
            Self::Range => range::builtin_range(&mut vm.heap, args),
            Self::Repr => {
                let value = args.into_one("repr", &mut vm.heap)?;
                let repr = value.py_repr(&vm.heap, vm.interns);
                value.drop_with_heap(&mut vm.heap);
                Ok(Value::Ref(vm.heap.allocate(HeapData::Str(repr))?))
            }
            Self::Suppress => namespace::builtin_suppress(&mut vm.heap, args),
            Self::Tuple => collect::builtin_tuple(vm, args),
        }
    }
}

/// Instantiates an exception: `ValueError("bad")`.
///
/// The message is `str()` of a single argument, or the `repr()` of the argument tuple
/// when several are given. `StopIteration` keeps its first argument as the payload
/// that `yield from` and `e.value` expose.
fn call_exc_type<T: ResourceTracker, P: PrintWriter, Tr: VmTracer>(
    exc_type: ExcType,
    vm: &mut VM<'_, T, P, Tr>,
    args: CallArgs,
) -> RunResult<Value> {
    let name: &'static str = exc_type.into();
    let mut positional = args.into_positional(name, 0, usize::MAX, &mut vm.heap)?;
    let message = match positional.len() {
        0 => None,
        1 => Some(positional[0].py_str(&vm.heap, vm.interns)),
        _ => {
            let items: Vec<String> = positional.iter().map(|v| v.py_repr(&vm.heap, vm.interns)).collect();
            Some(format!("({})", items.join(", ")))
        }
    };
    let payload = if exc_type == ExcType::StopIteration && !positional.is_empty() {
        positional.remove(0)
    } else {
        Value::None
    };
    for value in positional {
        value.drop_with_heap(&mut vm.heap);
    }
    let exc = ExceptionObject::with_payload(SimpleException::new(exc_type, message), payload);
    Ok(Value::Ref(vm.heap.allocate(HeapData::Exception(exc))?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_resolve_to_builtins() {
        assert_eq!("print".parse(), Ok(Builtins::Function(BuiltinFunction::Print)));
        assert_eq!("KeyError".parse(), Ok(Builtins::ExcType(ExcType::KeyError)));
        assert_eq!("printf".parse::<Builtins>(), Err(()));
        assert_eq!(BuiltinFunction::Namespace.to_string(), "namespace");
    }
}
