//! Iteration, unpacking and subscripts.

use std::mem;

use super::{Frame, VM, generator::GenInput, generator::GenOutcome};
use crate::{
    defer_drop,
    exception_private::{ExcType, RunError, RunResult},
    heap::{DropWithHeap, HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{Iter, Range, iter_next},
    value::Value,
};

/// What `iter()` does with a value.
enum IterSource {
    Sequence,
    Chars,
    DictKeys,
    Range(Range),
    /// Already an iterator.
    Itself,
    NotIterable(&'static str),
}

/// Container kinds that support item assignment or deletion.
enum ItemTarget {
    List(HeapId),
    Dict(HeapId),
    Other(&'static str),
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    /// `iter(value)`, consuming the value.
    pub(crate) fn get_iter(&mut self, value: Value) -> RunResult<Value> {
        let source = match &value {
            Value::InternString(_) => IterSource::Chars,
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::List(_) | HeapData::Tuple(_) => IterSource::Sequence,
                HeapData::Str(_) => IterSource::Chars,
                HeapData::Dict(_) => IterSource::DictKeys,
                HeapData::Range(range) => IterSource::Range(*range),
                HeapData::Iter(_) | HeapData::Generator(_) => IterSource::Itself,
                other => IterSource::NotIterable(other.type_name()),
            },
            other => IterSource::NotIterable(other.type_name(&self.heap)),
        };
        let iter = match source {
            IterSource::Itself => return Ok(value),
            IterSource::NotIterable(type_name) => {
                value.drop_with_heap(&mut self.heap);
                return Err(ExcType::not_iterable(type_name));
            }
            IterSource::Sequence => Iter::Sequence { source: value, index: 0 },
            IterSource::Chars => Iter::Chars { source: value, offset: 0 },
            IterSource::DictKeys => Iter::DictKeys { source: value, index: 0 },
            IterSource::Range(range) => {
                value.drop_with_heap(&mut self.heap);
                Iter::over_range(range)
            }
        };
        Ok(Value::Ref(self.heap.allocate(HeapData::Iter(iter))?))
    }

    /// Advances an iterator, returning `None` once it is exhausted.
    ///
    /// A generator that raises `StopIteration` counts as exhausted.
    pub(super) fn advance(&mut self, iterator: &Value) -> RunResult<Option<Value>> {
        let Some(id) = iterator.ref_id() else {
            return Err(ExcType::not_an_iterator(iterator.type_name(&self.heap)));
        };
        match self.heap.get(id) {
            HeapData::Iter(_) => iter_next(&mut self.heap, self.interns, id),
            HeapData::Generator(_) => match self.resume_generator(id, GenInput::Send(Value::None)) {
                Ok(GenOutcome::Yielded(value)) => Ok(Some(value)),
                Ok(GenOutcome::Returned(value)) => {
                    value.drop_with_heap(&mut self.heap);
                    Ok(None)
                }
                Err(err) if err.matches(ExcType::StopIteration) => {
                    err.drop_with_heap(&mut self.heap);
                    Ok(None)
                }
                Err(err) => Err(err),
            },
            other => Err(ExcType::not_an_iterator(other.type_name())),
        }
    }

    /// `next(iterator)`: the next item, or `StopIteration` carrying a generator's
    /// return value.
    pub(crate) fn next_item(&mut self, iterator: &Value) -> RunResult<Value> {
        if let Some(id) = iterator.ref_id()
            && matches!(self.heap.get(id), HeapData::Generator(_))
        {
            return match self.resume_generator(id, GenInput::Send(Value::None))? {
                GenOutcome::Yielded(value) => Ok(value),
                GenOutcome::Returned(value) => Err(self.stop_iteration_with(value)),
            };
        }
        self.advance(iterator)?.ok_or_else(ExcType::stop_iteration)
    }

    /// Drains an iterable into a vector, consuming it.
    pub(crate) fn collect_iterable(&mut self, iterable: Value) -> RunResult<Vec<Value>> {
        let copied = match iterable.ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::List(items) | HeapData::Tuple(items)) => {
                Some(items.iter().map(|item| item.clone_with_heap(&self.heap)).collect())
            }
            _ => None,
        };
        if let Some(items) = copied {
            iterable.drop_with_heap(&mut self.heap);
            return Ok(items);
        }
        let iterator = self.get_iter(iterable)?;
        let this = self;
        defer_drop!(iterator, this);
        let mut items = Vec::new();
        loop {
            match this.advance(iterator) {
                Ok(Some(item)) => items.push(item),
                Ok(None) => return Ok(items),
                Err(err) => {
                    items.drop_with_heap(&mut this.heap);
                    return Err(err);
                }
            }
        }
    }

    /// `FOR_ITER`: pushes the next item, or pops the exhausted iterator and jumps
    /// `delta` bytes forward. Returns whether an item was pushed.
    pub(super) fn for_iter(&mut self, frame: &mut Frame, delta: usize) -> RunResult<bool> {
        match self.advance(frame.peek(1))? {
            Some(item) => {
                frame.push(item);
                Ok(true)
            }
            None => {
                frame.pop().drop_with_heap(&mut self.heap);
                frame.ip += delta;
                Ok(false)
            }
        }
    }

    /// `UNPACK_SEQUENCE`: replaces the top of the stack with exactly `count` items,
    /// first item on top.
    pub(super) fn unpack_sequence(&mut self, frame: &mut Frame, count: usize) -> RunResult<()> {
        let sequence = frame.pop();
        let copied = match sequence.ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::List(items) | HeapData::Tuple(items)) => Some(if items.len() == count {
                Ok(items.iter().map(|item| item.clone_with_heap(&self.heap)).collect())
            } else {
                Err(items.len())
            }),
            _ => None,
        };
        let items = match copied {
            Some(Ok(items)) => {
                sequence.drop_with_heap(&mut self.heap);
                items
            }
            Some(Err(len)) => {
                sequence.drop_with_heap(&mut self.heap);
                return Err(unpack_error(count, len));
            }
            None => self.unpack_iterable(sequence, count)?,
        };
        for item in items.into_iter().rev() {
            frame.push(item);
        }
        Ok(())
    }

    fn unpack_iterable(&mut self, iterable: Value, count: usize) -> RunResult<Vec<Value>> {
        let iterator = self.get_iter(iterable)?;
        let this = self;
        defer_drop!(iterator, this);
        let mut items: Vec<Value> = Vec::with_capacity(count);
        loop {
            match this.advance(iterator) {
                Ok(Some(item)) => {
                    items.push(item);
                    if items.len() > count {
                        items.drop_with_heap(&mut this.heap);
                        return Err(unpack_error(count, count + 1));
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    items.drop_with_heap(&mut this.heap);
                    return Err(err);
                }
            }
        }
        if items.len() < count {
            let len = items.len();
            items.drop_with_heap(&mut this.heap);
            return Err(unpack_error(count, len));
        }
        Ok(items)
    }

    /// `BINARY_SUBSCR`: `container[key]`.
    pub(super) fn binary_subscr(&mut self, frame: &mut Frame) -> RunResult<()> {
        let key = frame.pop();
        let container = frame.pop();
        let result = self.subscript(&container, &key);
        key.drop_with_heap(&mut self.heap);
        container.drop_with_heap(&mut self.heap);
        frame.push(result?);
        Ok(())
    }

    fn subscript(&mut self, container: &Value, key: &Value) -> RunResult<Value> {
        if let Some(text) = container.as_str(&self.heap, self.interns) {
            let Some(index) = key.as_int() else {
                return Err(ExcType::type_error("string indices must be integers"));
            };
            let Some(c) = normalize_index(index, text.chars().count()).and_then(|i| text.chars().nth(i)) else {
                return Err(ExcType::index_error("string"));
            };
            return Ok(Value::Ref(self.heap.allocate(HeapData::Str(c.to_string()))?));
        }
        let Some(id) = container.ref_id() else {
            return Err(not_subscriptable(container.type_name(&self.heap)));
        };
        match self.heap.get(id) {
            HeapData::List(items) | HeapData::Tuple(items) => {
                let type_name = self.heap.get(id).type_name();
                let Some(index) = key.as_int() else {
                    return Err(ExcType::type_error(format!(
                        "{type_name} indices must be integers, not {}",
                        key.type_name(&self.heap)
                    )));
                };
                match normalize_index(index, items.len()) {
                    Some(i) => Ok(items[i].clone_with_heap(&self.heap)),
                    None => Err(ExcType::index_error(type_name)),
                }
            }
            HeapData::Dict(dict) => {
                let hashed = key.dict_key(&self.heap, self.interns)?;
                match dict.get(&hashed) {
                    Some(value) => Ok(value.clone_with_heap(&self.heap)),
                    None => Err(ExcType::key_error(key.py_repr(&self.heap, self.interns))),
                }
            }
            HeapData::Range(range) => {
                let Some(index) = key.as_int() else {
                    return Err(ExcType::type_error(format!(
                        "range indices must be integers, not {}",
                        key.type_name(&self.heap)
                    )));
                };
                let Some(i) = normalize_index(index, range.len()) else {
                    return Err(ExcType::index_error("range object"));
                };
                let offset = i64::try_from(i).map_err(|_| ExcType::overflow())?;
                Ok(Value::Int(range.start + offset * range.step))
            }
            other => Err(not_subscriptable(other.type_name())),
        }
    }

    fn item_target(&self, container: &Value) -> ItemTarget {
        match container.ref_id().map(|id| (id, self.heap.get(id))) {
            Some((id, HeapData::List(_))) => ItemTarget::List(id),
            Some((id, HeapData::Dict(_))) => ItemTarget::Dict(id),
            _ => ItemTarget::Other(container.type_name(&self.heap)),
        }
    }

    /// `STORE_SUBSCR`: `container[key] = value`.
    pub(super) fn store_subscr(&mut self, frame: &mut Frame) -> RunResult<()> {
        let key = frame.pop();
        let container = frame.pop();
        let value = frame.pop();
        let target = self.item_target(&container);
        container.drop_with_heap(&mut self.heap);
        match target {
            ItemTarget::List(id) => {
                let index = self.list_index(&key);
                key.drop_with_heap(&mut self.heap);
                let index = match index.and_then(|index| self.list_slot(id, index)) {
                    Ok(i) => i,
                    Err(err) => {
                        value.drop_with_heap(&mut self.heap);
                        return Err(err);
                    }
                };
                let old = match self.heap.get_mut(id) {
                    HeapData::List(items) => mem::replace(&mut items[index], value),
                    _ => value,
                };
                old.drop_with_heap(&mut self.heap);
                Ok(())
            }
            ItemTarget::Dict(id) => self.dict_set(id, key, value),
            ItemTarget::Other(type_name) => {
                key.drop_with_heap(&mut self.heap);
                value.drop_with_heap(&mut self.heap);
                Err(ExcType::type_error(format!(
                    "'{type_name}' object does not support item assignment"
                )))
            }
        }
    }

    /// `DELETE_SUBSCR`: `del container[key]`.
    pub(super) fn delete_subscr(&mut self, frame: &mut Frame) -> RunResult<()> {
        let key = frame.pop();
        let container = frame.pop();
        let target = self.item_target(&container);
        container.drop_with_heap(&mut self.heap);
        let this = self;
        defer_drop!(key, this);
        match target {
            ItemTarget::List(id) => {
                let index = this.list_index(key).and_then(|index| this.list_slot(id, index))?;
                let removed = match this.heap.get_mut(id) {
                    HeapData::List(items) => Some(items.remove(index)),
                    _ => None,
                };
                removed.drop_with_heap(&mut this.heap);
                Ok(())
            }
            ItemTarget::Dict(id) => {
                let hashed = key.dict_key(&this.heap, this.interns)?;
                let removed = match this.heap.get_mut(id) {
                    HeapData::Dict(dict) => dict.remove(&hashed),
                    _ => None,
                };
                match removed {
                    Some(pair) => {
                        pair.drop_with_heap(&mut this.heap);
                        Ok(())
                    }
                    None => Err(ExcType::key_error(key.py_repr(&this.heap, this.interns))),
                }
            }
            ItemTarget::Other(type_name) => Err(ExcType::type_error(format!(
                "'{type_name}' object doesn't support item deletion"
            ))),
        }
    }

    fn list_index(&self, key: &Value) -> RunResult<i64> {
        key.as_int().ok_or_else(|| {
            ExcType::type_error(format!(
                "list indices must be integers, not {}",
                key.type_name(&self.heap)
            ))
        })
    }

    fn list_slot(&self, id: HeapId, index: i64) -> RunResult<usize> {
        let len = match self.heap.get(id) {
            HeapData::List(items) => items.len(),
            _ => 0,
        };
        normalize_index(index, len).ok_or_else(|| ExcType::index_error("list assignment"))
    }

    /// Inserts into the dict at `id`, consuming key and value.
    fn dict_set(&mut self, id: HeapId, key: Value, value: Value) -> RunResult<()> {
        let hashed = match key.dict_key(&self.heap, self.interns) {
            Ok(hashed) => hashed,
            Err(err) => {
                key.drop_with_heap(&mut self.heap);
                value.drop_with_heap(&mut self.heap);
                return Err(err);
            }
        };
        let replaced = match self.heap.get_mut(id) {
            HeapData::Dict(dict) => dict.insert(hashed, key, value),
            _ => Some((key, value)),
        };
        replaced.drop_with_heap(&mut self.heap);
        Ok(())
    }

    /// `STORE_MAP`: pops a key and then a value into the dict beneath them.
    pub(super) fn store_map(&mut self, frame: &mut Frame) -> RunResult<()> {
        let key = frame.pop();
        let value = frame.pop();
        match frame.peek(1).ref_id() {
            Some(id) if matches!(self.heap.get(id), HeapData::Dict(_)) => self.dict_set(id, key, value),
            _ => {
                key.drop_with_heap(&mut self.heap);
                value.drop_with_heap(&mut self.heap);
                Err(RunError::internal("STORE_MAP without a dict"))
            }
        }
    }

    /// `LIST_APPEND`: pops a value onto the list `depth` slots down.
    pub(super) fn list_append(&mut self, frame: &mut Frame, depth: usize) -> RunResult<()> {
        let value = frame.pop();
        let list = frame.stack.len().checked_sub(depth).and_then(|i| frame.stack[i].ref_id());
        match list.map(|id| self.heap.get_mut(id)) {
            Some(HeapData::List(items)) => {
                items.push(value);
                Ok(())
            }
            _ => {
                value.drop_with_heap(&mut self.heap);
                Err(RunError::internal("LIST_APPEND without a list"))
            }
        }
    }
}

/// Maps a possibly negative index onto `0..len`.
fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let index = if index < 0 { index.checked_add(len)? } else { index };
    if index < len { usize::try_from(index).ok() } else { None }
}

fn unpack_error(expected: usize, actual: usize) -> RunError {
    if actual > expected {
        ExcType::value_error(format!("too many values to unpack (expected {expected})"))
    } else {
        let plural = if actual == 1 { "" } else { "s" };
        ExcType::value_error(format!("need more than {actual} value{plural} to unpack"))
    }
}

fn not_subscriptable(type_name: &str) -> RunError {
    ExcType::type_error(format!("'{type_name}' object is not subscriptable"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_indices_count_from_the_end() {
        assert_eq!(normalize_index(0, 3), Some(0));
        assert_eq!(normalize_index(-1, 3), Some(2));
        assert_eq!(normalize_index(-3, 3), Some(0));
        assert_eq!(normalize_index(-4, 3), None);
        assert_eq!(normalize_index(3, 3), None);
        assert_eq!(normalize_index(i64::MIN, 3), None);
    }

    fn message(err: RunError) -> String {
        match err {
            RunError::Exc(exc) => exc.exc.to_string(),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn unpack_messages() {
        assert_eq!(message(unpack_error(2, 3)), "ValueError: too many values to unpack (expected 2)");
        assert_eq!(message(unpack_error(2, 1)), "ValueError: need more than 1 value to unpack");
        assert_eq!(message(unpack_error(3, 0)), "ValueError: need more than 0 values to unpack");
    }
}
