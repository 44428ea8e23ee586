use indexmap::IndexMap;

use crate::{
    heap::{DropWithHeap, Heap, HeapId},
    resource::ResourceTracker,
    value::Value,
};

/// A plain attribute bag created by the `namespace(**kwargs)` builtin.
///
/// Objects that provide `__enter__`/`__exit__` attributes act as context managers;
/// the attribute functions are called without an implicit receiver.
#[derive(Debug, Default)]
pub(crate) struct SimpleNamespace {
    attrs: IndexMap<String, Value, ahash::RandomState>,
}

impl SimpleNamespace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attrs.get(name)
    }

    /// Sets an attribute, returning the previous value for the caller to release.
    pub fn set(&mut self, name: &str, value: Value) -> Option<Value> {
        if let Some(slot) = self.attrs.get_mut(name) {
            return Some(std::mem::replace(slot, value));
        }
        self.attrs.insert(name.to_owned(), value);
        None
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.attrs.shift_remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn py_dec_ref_ids(&mut self, stack: &mut Vec<HeapId>) {
        for value in self.attrs.values_mut() {
            value.py_dec_ref_ids(stack);
        }
    }
}

impl<T: ResourceTracker> DropWithHeap<T> for SimpleNamespace {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        for (_, value) in self.attrs {
            value.drop_with_heap(heap);
        }
    }
}
