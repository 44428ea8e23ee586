//! Implementation of the abs() builtin function.

use crate::{
    args::CallArgs,
    exception_private::{ExcType, RunResult},
    heap::Heap,
    resource::ResourceTracker,
    value::Value,
};

/// Returns the absolute value of a number.
///
/// `abs(i64::MIN)` has no `i64` representation and raises OverflowError.
pub fn builtin_abs(heap: &mut Heap<impl ResourceTracker>, args: CallArgs) -> RunResult<Value> {
    let value = args.into_one("abs", heap)?;
    match value {
        Value::Int(n) => n.checked_abs().map(Value::Int).ok_or_else(ExcType::overflow),
        Value::Bool(b) => Ok(Value::Int(i64::from(b))),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        other => {
            let type_name = other.type_name(heap);
            other.drop_with_heap(heap);
            Err(ExcType::type_error(format!("bad operand type for abs(): '{type_name}'")))
        }
    }
}
