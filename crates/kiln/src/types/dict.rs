use indexmap::IndexMap;

use crate::{
    builtins::Builtins,
    heap::{DropWithHeap, Heap, HeapId},
    resource::ResourceTracker,
    value::Value,
};

/// Hashable projection of a key value.
///
/// Values that compare equal map to the same key: `True`, `1` and `1.0` all become
/// `Int(1)`, and interned and heap strings with the same contents collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum DictKey {
    None,
    Int(i64),
    /// Bit pattern of a non-integral float.
    Float(u64),
    Str(Box<str>),
    Tuple(Vec<DictKey>),
    Builtin(Builtins),
    /// Objects hashed by identity, e.g. functions.
    Identity(HeapId),
}

/// Insertion-ordered dictionary.
///
/// Each entry keeps the original key value next to the mapped value so iteration and
/// `repr()` can hand back the key as it was inserted.
#[derive(Debug, Default)]
pub(crate) struct Dict {
    entries: IndexMap<DictKey, (Value, Value), ahash::RandomState>,
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, key: &DictKey) -> Option<&Value> {
        self.entries.get(key).map(|(_, value)| value)
    }

    pub fn contains_key(&self, key: &DictKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Inserts a pair, taking ownership of both values.
    ///
    /// Returns the replaced pair (original key and old value) for the caller to release.
    pub fn insert(&mut self, hashed: DictKey, key: Value, value: Value) -> Option<(Value, Value)> {
        if let Some(slot) = self.entries.get_mut(&hashed) {
            let old_value = std::mem::replace(&mut slot.1, value);
            // the first inserted key object is kept
            return Some((key, old_value));
        }
        self.entries.insert(hashed, (key, value));
        None
    }

    /// Removes an entry, preserving the order of the remaining ones.
    pub fn remove(&mut self, key: &DictKey) -> Option<(Value, Value)> {
        self.entries.shift_remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries.values().map(|(k, v)| (k, v))
    }

    /// Key value at `index` in insertion order.
    pub fn key_at(&self, index: usize) -> Option<&Value> {
        self.entries.get_index(index).map(|(_, (key, _))| key)
    }

    pub fn py_eq(&self, other: &Self, mut value_eq: impl FnMut(&Value, &Value) -> bool) -> bool {
        self.len() == other.len()
            && self
                .entries
                .iter()
                .all(|(hashed, (_, value))| other.entries.get(hashed).is_some_and(|(_, o)| value_eq(value, o)))
    }

    pub fn py_dec_ref_ids(&mut self, stack: &mut Vec<HeapId>) {
        for (key, value) in self.entries.values_mut() {
            key.py_dec_ref_ids(stack);
            value.py_dec_ref_ids(stack);
        }
    }
}

impl<T: ResourceTracker> DropWithHeap<T> for Dict {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        for (_, pair) in self.entries {
            pair.drop_with_heap(heap);
        }
    }
}
