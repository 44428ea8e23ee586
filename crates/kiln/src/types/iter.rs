use std::fmt;

use crate::{
    exception_private::{ExcType, RunError, RunResult},
    heap::{Heap, HeapData, HeapId},
    intern::Interns,
    resource::ResourceTracker,
    value::Value,
};

/// The object returned by `range()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Range {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl Range {
    pub fn new(start: i64, stop: i64, step: i64) -> RunResult<Self> {
        if step == 0 {
            return Err(ExcType::value_error("range() arg 3 must not be zero"));
        }
        Ok(Self { start, stop, step })
    }

    /// Number of elements the range produces.
    pub fn len(&self) -> usize {
        let (start, stop, step) = (i128::from(self.start), i128::from(self.stop), i128::from(self.step));
        let len = if step > 0 && start < stop {
            (stop - start - 1) / step + 1
        } else if step < 0 && start > stop {
            (start - stop - 1) / (-step) + 1
        } else {
            0
        };
        usize::try_from(len).unwrap_or(usize::MAX)
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.step == 1 {
            write!(f, "range({}, {})", self.start, self.stop)
        } else {
            write!(f, "range({}, {}, {})", self.start, self.stop, self.step)
        }
    }
}

/// Iterator state over a builtin iterable.
///
/// Container sources hold one reference to the container, released with the iterator.
#[derive(Debug)]
pub(crate) enum Iter {
    Range { next: i64, remaining: usize, step: i64 },
    /// Over a list or tuple, by index so mutation during iteration cannot invalidate it.
    Sequence { source: Value, index: usize },
    /// Over a string, `offset` is a byte offset into it.
    Chars { source: Value, offset: usize },
    DictKeys { source: Value, index: usize },
}

impl Iter {
    pub fn over_range(range: Range) -> Self {
        Self::Range {
            next: range.start,
            remaining: range.len(),
            step: range.step,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Range { .. } => "range_iterator",
            Self::Sequence { .. } => "sequence_iterator",
            Self::Chars { .. } => "str_iterator",
            Self::DictKeys { .. } => "dict_keyiterator",
        }
    }

    pub fn py_dec_ref_ids(&mut self, stack: &mut Vec<HeapId>) {
        match self {
            Self::Range { .. } => {}
            Self::Sequence { source, .. } | Self::Chars { source, .. } | Self::DictKeys { source, .. } => {
                source.py_dec_ref_ids(stack);
            }
        }
    }
}

/// Advances the iterator stored at `iter_id`, returning `None` once it is exhausted.
pub(crate) fn iter_next<T: ResourceTracker>(
    heap: &mut Heap<T>,
    interns: &Interns,
    iter_id: HeapId,
) -> RunResult<Option<Value>> {
    let HeapData::Iter(iter) = heap.get_mut(iter_id) else {
        return Err(RunError::internal("iter_next called on a non-iterator"));
    };
    match iter {
        Iter::Range { next, remaining, step } => {
            if *remaining == 0 {
                return Ok(None);
            }
            let value = *next;
            *remaining -= 1;
            *next = next.wrapping_add(*step);
            Ok(Some(Value::Int(value)))
        }
        Iter::Sequence { source, index } => {
            let Some(source_id) = source.ref_id() else {
                return Err(RunError::internal("sequence iterator without a heap source"));
            };
            let i = *index;
            *index += 1;
            match heap.get(source_id) {
                HeapData::List(items) | HeapData::Tuple(items) => Ok(items.get(i).map(|item| item.clone_with_heap(heap))),
                _ => Err(RunError::internal("sequence iterator over a non-sequence")),
            }
        }
        Iter::DictKeys { source, index } => {
            let Some(source_id) = source.ref_id() else {
                return Err(RunError::internal("dict iterator without a heap source"));
            };
            let i = *index;
            *index += 1;
            match heap.get(source_id) {
                HeapData::Dict(dict) => Ok(dict.key_at(i).map(|key| key.clone_with_heap(heap))),
                _ => Err(RunError::internal("dict iterator over a non-dict")),
            }
        }
        Iter::Chars { source, offset } => {
            let start = *offset;
            let next_char = match source {
                Value::InternString(id) => interns.get_str(*id)[start..].chars().next(),
                Value::Ref(id) => {
                    let id = *id;
                    match heap.get(id) {
                        HeapData::Str(s) => s[start..].chars().next(),
                        _ => None,
                    }
                }
                _ => None,
            };
            let Some(c) = next_char else {
                return Ok(None);
            };
            if let HeapData::Iter(Iter::Chars { offset, .. }) = heap.get_mut(iter_id) {
                *offset += c.len_utf8();
            }
            let id = heap.allocate(HeapData::Str(c.to_string()))?;
            Ok(Some(Value::Ref(id)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{heap::DropWithHeap, resource::NoLimitTracker};

    #[test]
    fn range_len_handles_steps() {
        assert_eq!(Range::new(0, 5, 1).unwrap().len(), 5);
        assert_eq!(Range::new(0, 5, 2).unwrap().len(), 3);
        assert_eq!(Range::new(5, 0, -2).unwrap().len(), 3);
        assert_eq!(Range::new(5, 0, 1).unwrap().len(), 0);
        assert!(Range::new(0, 1, 0).is_err());
    }

    #[test]
    fn range_iterator_yields_values() {
        let mut heap = Heap::new(NoLimitTracker::new());
        let interns = Interns::new();
        let id = heap
            .allocate(HeapData::Iter(Iter::over_range(Range::new(3, 0, -1).unwrap())))
            .unwrap();
        let mut out = Vec::new();
        while let Some(v) = iter_next(&mut heap, &interns, id).unwrap() {
            out.push(v.as_int().unwrap());
        }
        assert_eq!(out, vec![3, 2, 1]);
        heap.dec_ref(id);
    }

    #[test]
    fn string_iterator_yields_chars() {
        let mut heap = Heap::new(NoLimitTracker::new());
        let mut interns = Interns::new();
        let s = interns.intern("hé");
        let id = heap
            .allocate(HeapData::Iter(Iter::Chars {
                source: Value::InternString(s),
                offset: 0,
            }))
            .unwrap();
        let mut out = Vec::new();
        while let Some(v) = iter_next(&mut heap, &interns, id).unwrap() {
            out.push(v.py_str(&heap, &interns));
            v.drop_with_heap(&mut heap);
        }
        assert_eq!(out, vec!["h", "é"]);
        heap.dec_ref(id);
        assert_eq!(heap.live_count(), 0);
    }
}
