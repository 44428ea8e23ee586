//! Implementation of the range() builtin function.

use crate::{
    args::CallArgs,
    exception_private::{ExcType, RunResult},
    heap::{Heap, HeapData},
    resource::ResourceTracker,
    types::Range,
    value::Value,
};

/// `range(stop)`, `range(start, stop)` or `range(start, stop, step)`.
pub fn builtin_range(heap: &mut Heap<impl ResourceTracker>, args: CallArgs) -> RunResult<Value> {
    let positional = args.into_positional("range", 1, 3, heap)?;
    let mut bounds = [0_i64; 3];
    for (slot, value) in bounds.iter_mut().zip(&positional) {
        match value.as_int() {
            Some(i) => *slot = i,
            None => {
                let type_name = value.type_name(heap);
                for value in positional {
                    value.drop_with_heap(heap);
                }
                return Err(ExcType::type_error(format!(
                    "'{type_name}' object cannot be interpreted as an integer"
                )));
            }
        }
    }
    let range = match positional.len() {
        1 => Range::new(0, bounds[0], 1)?,
        2 => Range::new(bounds[0], bounds[1], 1)?,
        _ => Range::new(bounds[0], bounds[1], bounds[2])?,
    };
    Ok(Value::Ref(heap.allocate(HeapData::Range(range))?))
}
