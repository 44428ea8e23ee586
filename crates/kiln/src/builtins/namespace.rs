//! The namespace() and suppress() builtins: small objects used as attribute bags and
//! context managers.

use crate::{
    args::CallArgs,
    exception_private::{ExcType, RunResult},
    heap::{DropWithHeap, Heap, HeapData},
    intern::Interns,
    resource::ResourceTracker,
    types::SimpleNamespace,
    value::Value,
};

/// `namespace(**kwargs)`: an object whose attributes are the keyword arguments.
pub fn builtin_namespace(heap: &mut Heap<impl ResourceTracker>, interns: &Interns, args: CallArgs) -> RunResult<Value> {
    if !args.positional.is_empty() {
        args.drop_with_heap(heap);
        return Err(ExcType::type_error("no positional arguments expected"));
    }
    let mut namespace = SimpleNamespace::new();
    for (key, value) in args.keywords {
        // call sites only pass string keywords
        let name = key.as_str(heap, interns).unwrap_or_default().to_owned();
        if let Some(old) = namespace.set(&name, value) {
            old.drop_with_heap(heap);
        }
        key.drop_with_heap(heap);
    }
    Ok(Value::Ref(heap.allocate(HeapData::Namespace(namespace))?))
}

/// `suppress(*exc_types)`: a context manager whose `__exit__` swallows the given kinds.
pub fn builtin_suppress(heap: &mut Heap<impl ResourceTracker>, args: CallArgs) -> RunResult<Value> {
    let positional = args.into_positional("suppress", 0, usize::MAX, heap)?;
    let kinds: Option<Vec<ExcType>> = positional.iter().map(Value::as_exc_type).collect();
    for value in positional {
        value.drop_with_heap(heap);
    }
    let Some(kinds) = kinds else {
        return Err(ExcType::type_error("suppress() arguments must be exception types"));
    };
    Ok(Value::Ref(heap.allocate(HeapData::Suppress(kinds))?))
}
