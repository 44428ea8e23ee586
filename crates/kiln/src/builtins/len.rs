//! Implementation of the len() builtin function.

use crate::{
    args::CallArgs,
    exception_private::{ExcType, RunResult},
    heap::{Heap, HeapData},
    intern::Interns,
    resource::ResourceTracker,
    value::Value,
};

pub fn builtin_len(heap: &mut Heap<impl ResourceTracker>, interns: &Interns, args: CallArgs) -> RunResult<Value> {
    let value = args.into_one("len", heap)?;
    let len = match &value {
        Value::InternString(id) => Some(interns.get_str(*id).chars().count()),
        Value::Ref(id) => match heap.get(*id) {
            HeapData::Str(s) => Some(s.chars().count()),
            HeapData::Tuple(items) | HeapData::List(items) => Some(items.len()),
            HeapData::Dict(dict) => Some(dict.len()),
            HeapData::Range(range) => Some(range.len()),
            _ => None,
        },
        _ => None,
    };
    let type_name = value.type_name(heap);
    value.drop_with_heap(heap);
    match len {
        Some(len) => i64::try_from(len).map(Value::Int).map_err(|_| ExcType::overflow()),
        None => Err(ExcType::type_error(format!("object of type '{type_name}' has no len()"))),
    }
}
