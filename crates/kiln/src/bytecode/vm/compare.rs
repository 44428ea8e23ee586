//! `COMPARE_OP`: rich comparisons, identity, membership and exception matching.

use std::cmp::Ordering;

use super::{Frame, VM};
use crate::{
    builtins::Builtins,
    bytecode::CompareOp,
    exception_private::{ExcType, RunError, RunResult},
    heap::{DropWithHeap, HeapData},
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    value::Value,
};

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    pub(super) fn compare_op(&mut self, frame: &mut Frame, arg: u32) -> RunResult<()> {
        let op = u8::try_from(arg)
            .ok()
            .and_then(CompareOp::from_repr)
            .ok_or_else(|| RunError::internal("bad COMPARE_OP argument"))?;
        let right = frame.pop();
        let left = frame.pop();
        let result = self.compare_values(op, &left, &right);
        left.drop_with_heap(&mut self.heap);
        right.drop_with_heap(&mut self.heap);
        frame.push(Value::Bool(result?));
        Ok(())
    }

    fn compare_values(&mut self, op: CompareOp, left: &Value, right: &Value) -> RunResult<bool> {
        let heap = &self.heap;
        let interns = self.interns;
        let ordered = |accept: fn(Ordering) -> bool| match left.py_cmp(right, heap, interns) {
            Some(ordering) => Ok(accept(ordering)),
            // NaN compares false with everything
            None if is_number(left) && is_number(right) => Ok(false),
            None => Err(ExcType::compare_type_error(
                <&'static str>::from(op),
                left.type_name(heap),
                right.type_name(heap),
            )),
        };
        match op {
            CompareOp::Lt => ordered(Ordering::is_lt),
            CompareOp::Le => ordered(Ordering::is_le),
            CompareOp::Gt => ordered(Ordering::is_gt),
            CompareOp::Ge => ordered(Ordering::is_ge),
            CompareOp::Eq => Ok(left.py_eq(right, heap, interns)),
            CompareOp::Ne => Ok(!left.py_eq(right, heap, interns)),
            CompareOp::Is => Ok(left.is(right)),
            CompareOp::IsNot => Ok(!left.is(right)),
            CompareOp::In => self.contains(right, left),
            CompareOp::NotIn => self.contains(right, left).map(|found| !found),
            CompareOp::ExceptionMatch => self.exception_match(left, right),
        }
    }

    /// The `in` operator: whether `container` holds `item`.
    fn contains(&mut self, container: &Value, item: &Value) -> RunResult<bool> {
        if let Some(haystack) = container.as_str(&self.heap, self.interns) {
            return match item.as_str(&self.heap, self.interns) {
                Some(needle) => Ok(haystack.contains(needle)),
                None => Err(ExcType::type_error(format!(
                    "'in <string>' requires string as left operand, not {}",
                    item.type_name(&self.heap)
                ))),
            };
        }
        let Some(id) = container.ref_id() else {
            return Err(not_a_container(container.type_name(&self.heap)));
        };
        match self.heap.get(id) {
            HeapData::List(items) | HeapData::Tuple(items) => Ok(items
                .iter()
                .any(|candidate| candidate.is(item) || candidate.py_eq(item, &self.heap, self.interns))),
            HeapData::Dict(dict) => {
                let key = item.dict_key(&self.heap, self.interns)?;
                Ok(dict.contains_key(&key))
            }
            HeapData::Range(range) => Ok(match (item, item.as_int()) {
                (Value::Float(_), _) | (_, None) => false,
                (_, Some(i)) => {
                    let (start, step, i) = (i128::from(range.start), i128::from(range.step), i128::from(i));
                    let offset = i - start;
                    offset % step == 0 && usize::try_from(offset / step).is_ok_and(|index| index < range.len())
                }
            }),
            HeapData::Iter(_) | HeapData::Generator(_) => {
                // consumes the iterator up to the first match
                while let Some(candidate) = self.advance(container)? {
                    let found = candidate.is(item) || candidate.py_eq(item, &self.heap, self.interns);
                    candidate.drop_with_heap(&mut self.heap);
                    if found {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            other => Err(not_a_container(other.type_name())),
        }
    }

    /// `except` clause matching: `right` must be an exception type or a tuple of them.
    fn exception_match(&self, left: &Value, right: &Value) -> RunResult<bool> {
        let raised = match left {
            Value::Builtin(Builtins::ExcType(exc_type)) => Some(*exc_type),
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Exception(object) => Some(object.exc.exc_type()),
                _ => None,
            },
            _ => None,
        };
        let handlers: Vec<ExcType> = match right {
            Value::Builtin(Builtins::ExcType(exc_type)) => vec![*exc_type],
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Tuple(items) => items
                    .iter()
                    .map(Value::as_exc_type)
                    .collect::<Option<_>>()
                    .ok_or_else(catching_non_exception)?,
                _ => return Err(catching_non_exception()),
            },
            _ => return Err(catching_non_exception()),
        };
        Ok(raised.is_some_and(|raised| handlers.iter().any(|handler| raised.is_subclass_of(*handler))))
    }
}

fn is_number(value: &Value) -> bool {
    matches!(value, Value::Bool(_) | Value::Int(_) | Value::Float(_))
}

fn not_a_container(type_name: &str) -> RunError {
    ExcType::type_error(format!("argument of type '{type_name}' is not iterable"))
}

fn catching_non_exception() -> RunError {
    ExcType::type_error("catching classes that do not inherit from BaseException is not allowed")
}
