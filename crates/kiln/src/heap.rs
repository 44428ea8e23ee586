use std::{
    mem::ManuallyDrop,
    ptr::addr_of,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    vec,
};

use crate::{
    bytecode::Code,
    exception_private::{ExcType, RawStackFrame},
    function::Function,
    resource::{ResourceError, ResourceTracker},
    types::{BoundMethod, Dict, ExceptionObject, Generator, Iter, Range, SimpleNamespace},
    value::Value,
};

/// Unique identifier for values stored inside the heap arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(usize);

impl HeapId {
    /// Returns the raw index value.
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Data stored in a heap slot.
#[derive(Debug)]
pub(crate) enum HeapData {
    Str(String),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Dict(Dict),
    /// A shared variable slot for closures; `Value::Undefined` while empty.
    Cell(Value),
    Function(Function),
    Code(Arc<Code>),
    Generator(Generator),
    Exception(ExceptionObject),
    Traceback(Vec<RawStackFrame>),
    Iter(Iter),
    Range(Range),
    BoundMethod(BoundMethod),
    Namespace(SimpleNamespace),
    /// Context manager which swallows the listed exception kinds.
    Suppress(Vec<ExcType>),
}

impl HeapData {
    /// Name of the type, as reported by error messages and `repr()`.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "str",
            Self::Tuple(_) => "tuple",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
            Self::Cell(_) => "cell",
            Self::Function(_) => "function",
            Self::Code(_) => "code",
            Self::Generator(_) => "generator",
            Self::Exception(exc) => exc.exc.exc_type().into(),
            Self::Traceback(_) => "traceback",
            Self::Iter(iter) => iter.type_name(),
            Self::Range(_) => "range",
            Self::BoundMethod(_) => "builtin_function_or_method",
            Self::Namespace(_) => "namespace",
            Self::Suppress(_) => "suppress",
        }
    }

    /// Approximate size in bytes, used for memory limits.
    fn estimate_size(&self) -> usize {
        let value_size = std::mem::size_of::<Value>();
        std::mem::size_of::<Self>()
            + match self {
                Self::Str(s) => s.len(),
                Self::Tuple(items) | Self::List(items) => items.len() * value_size,
                Self::Dict(dict) => dict.len() * 3 * value_size,
                Self::Generator(generator) => generator.estimate_size(),
                Self::Traceback(frames) => frames.len() * std::mem::size_of::<RawStackFrame>(),
                Self::Namespace(ns) => ns.len() * 2 * value_size,
                Self::Function(function) => (function.defaults.len() + function.kw_defaults.len()) * value_size,
                _ => 0,
            }
    }

    /// Moves every heap reference held by this object into `stack`.
    fn py_dec_ref_ids(&mut self, stack: &mut Vec<HeapId>) {
        match self {
            Self::Str(_) | Self::Code(_) | Self::Traceback(_) | Self::Range(_) | Self::Suppress(_) => {}
            Self::Tuple(items) | Self::List(items) => {
                for item in items {
                    item.py_dec_ref_ids(stack);
                }
            }
            Self::Dict(dict) => dict.py_dec_ref_ids(stack),
            Self::Cell(value) => value.py_dec_ref_ids(stack),
            Self::Function(function) => function.py_dec_ref_ids(stack),
            Self::Generator(generator) => generator.py_dec_ref_ids(stack),
            Self::Exception(exc) => exc.py_dec_ref_ids(stack),
            Self::Iter(iter) => iter.py_dec_ref_ids(stack),
            Self::BoundMethod(method) => method.receiver.py_dec_ref_ids(stack),
            Self::Namespace(ns) => ns.py_dec_ref_ids(stack),
        }
    }
}

/// A heap slot: reference count plus payload.
#[derive(Debug)]
struct HeapValue {
    refcount: AtomicUsize,
    data: HeapData,
}

/// Reference-counted arena that backs all heap-only runtime values.
///
/// Uses a free list to reuse slots from freed values, keeping memory usage
/// constant for long-running loops that repeatedly allocate and free values.
///
/// Generic over `T: ResourceTracker`; with `NoLimitTracker` all resource checks
/// compile away to no-ops. Each run gets a fresh heap, so reference cycles are
/// reclaimed when the run's heap is dropped.
#[derive(Debug)]
pub(crate) struct Heap<T: ResourceTracker> {
    entries: Vec<Option<HeapValue>>,
    /// IDs of freed slots available for reuse. Populated by `dec_ref`, consumed by `allocate`.
    free_list: Vec<HeapId>,
    tracker: T,
}

impl<T: ResourceTracker> Heap<T> {
    pub fn new(tracker: T) -> Self {
        Self {
            entries: Vec::with_capacity(64),
            free_list: Vec::new(),
            tracker,
        }
    }

    /// Allocates a new heap entry with a reference count of one.
    ///
    /// Returns `Err(ResourceError)` if allocation would exceed configured limits, in which
    /// case the references held by `data` are released.
    pub fn allocate(&mut self, mut data: HeapData) -> Result<HeapId, ResourceError> {
        if let Err(err) = self.tracker.on_allocate(|| data.estimate_size()) {
            let mut child_ids = Vec::new();
            data.py_dec_ref_ids(&mut child_ids);
            drop(data);
            for child_id in child_ids {
                self.dec_ref(child_id);
            }
            return Err(err);
        }
        let new_entry = HeapValue {
            refcount: AtomicUsize::new(1),
            data,
        };
        let id = if let Some(id) = self.free_list.pop() {
            self.entries[id.index()] = Some(new_entry);
            id
        } else {
            let id = HeapId(self.entries.len());
            self.entries.push(Some(new_entry));
            id
        };
        Ok(id)
    }

    /// Increments the reference count for an existing heap entry.
    ///
    /// # Panics
    /// Panics if the value ID is invalid or the value has already been freed.
    pub fn inc_ref(&self, id: HeapId) {
        let value = self
            .entries
            .get(id.index())
            .expect("Heap::inc_ref: slot missing")
            .as_ref()
            .expect("Heap::inc_ref: object already freed");
        value.refcount.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrements the reference count and frees the value (plus children) once it hits zero.
    ///
    /// # Panics
    /// Panics if the value ID is invalid or the value has already been freed.
    pub fn dec_ref(&mut self, id: HeapId) {
        let value = {
            let slot = self.entries.get_mut(id.index()).expect("Heap::dec_ref: slot missing");
            let entry = slot.as_mut().expect("Heap::dec_ref: object already freed");
            let count = entry.refcount.load(Ordering::Relaxed);
            if count > 1 {
                entry.refcount.store(count - 1, Ordering::Relaxed);
                return;
            }
            slot.take().expect("Heap::dec_ref: object already freed")
        };
        self.free_list.push(id);
        self.tracker.on_free(|| value.data.estimate_size());

        let mut data = value.data;
        let mut child_ids = Vec::new();
        data.py_dec_ref_ids(&mut child_ids);
        drop(data);
        for child_id in child_ids {
            self.dec_ref(child_id);
        }
    }

    /// Returns an immutable reference to the heap data stored at the given ID.
    ///
    /// # Panics
    /// Panics if the value ID is invalid or the value has already been freed.
    #[must_use]
    pub fn get(&self, id: HeapId) -> &HeapData {
        &self
            .entries
            .get(id.index())
            .expect("Heap::get: slot missing")
            .as_ref()
            .expect("Heap::get: object already freed")
            .data
    }

    /// Returns a mutable reference to the heap data stored at the given ID.
    ///
    /// # Panics
    /// Panics if the value ID is invalid or the value has already been freed.
    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        &mut self
            .entries
            .get_mut(id.index())
            .expect("Heap::get_mut: slot missing")
            .as_mut()
            .expect("Heap::get_mut: object already freed")
            .data
    }

    /// Returns the current reference count of a live value, or 0 once freed.
    #[must_use]
    pub fn refcount(&self, id: HeapId) -> usize {
        self.entries
            .get(id.index())
            .and_then(Option::as_ref)
            .map_or(0, |entry| entry.refcount.load(Ordering::Relaxed))
    }

    /// Number of live objects in the arena.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.entries.len() - self.free_list.len()
    }

    /// Reads the contents of a cell.
    ///
    /// # Panics
    /// Panics if `id` does not refer to a cell.
    pub fn get_cell_value(&self, id: HeapId) -> Value {
        match self.get(id) {
            HeapData::Cell(value) => value.clone_with_heap(self),
            other => panic!("Heap::get_cell_value: expected cell, found {}", other.type_name()),
        }
    }

    /// Replaces the contents of a cell, releasing the previous value.
    pub fn set_cell_value(&mut self, id: HeapId, value: Value) {
        let old = match self.get_mut(id) {
            HeapData::Cell(slot) => std::mem::replace(slot, value),
            other => panic!("Heap::set_cell_value: expected cell, found {}", other.type_name()),
        };
        old.drop_with_heap(self);
    }

    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut T {
        &mut self.tracker
    }
}

/// Marks every remaining value as released before the arena goes away, so reference
/// cycles left behind by a run do not trip the `ref-count-panic` check.
#[cfg(feature = "ref-count-panic")]
impl<T: ResourceTracker> Drop for Heap<T> {
    fn drop(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        let mut ignored = Vec::new();
        for value in self.entries.iter_mut().flatten() {
            value.data.py_dec_ref_ids(&mut ignored);
        }
    }
}

/// This trait represents types that contain a `Heap`; it allows for more complex structures
/// to participate in the `HeapGuard` pattern.
pub(crate) trait ContainsHeap<T: ResourceTracker> {
    fn heap_mut(&mut self) -> &mut Heap<T>;
}

impl<T: ResourceTracker> ContainsHeap<T> for Heap<T> {
    #[inline]
    fn heap_mut(&mut self) -> &mut Self {
        self
    }
}

/// Trait for types that require heap access for proper cleanup.
///
/// Rust's standard `Drop` trait cannot decrement heap reference counts because it has no
/// access to the `Heap`. This trait provides an explicit drop-with-heap method so that
/// ref-counted values (and containers of them) can properly decrement their counts when
/// they are no longer needed.
///
/// **All types implementing this trait must be cleaned up on every code path.** A missed
/// call on any branch leaks reference counts. Prefer [`defer_drop!`] or [`HeapGuard`] to
/// guarantee cleanup automatically.
pub(crate) trait DropWithHeap<T: ResourceTracker> {
    /// Consume `self` and decrement reference counts for any heap-allocated values contained within.
    fn drop_with_heap(self, heap: &mut Heap<T>);
}

impl<T: ResourceTracker> DropWithHeap<T> for Value {
    #[inline]
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        Self::drop_with_heap(self, heap);
    }
}

impl<T: ResourceTracker, U: DropWithHeap<T>> DropWithHeap<T> for Option<U> {
    #[inline]
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        if let Some(value) = self {
            value.drop_with_heap(heap);
        }
    }
}

impl<T: ResourceTracker, U: DropWithHeap<T>> DropWithHeap<T> for Vec<U> {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        for value in self {
            value.drop_with_heap(heap);
        }
    }
}

impl<T: ResourceTracker, U: DropWithHeap<T>> DropWithHeap<T> for vec::IntoIter<U> {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        for value in self {
            value.drop_with_heap(heap);
        }
    }
}

impl<T: ResourceTracker> DropWithHeap<T> for (Value, Value) {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        let (key, value) = self;
        key.drop_with_heap(heap);
        value.drop_with_heap(heap);
    }
}

/// RAII guard that ensures a [`DropWithHeap`] value is cleaned up on every code path.
///
/// The guard's `Drop` impl calls [`DropWithHeap::drop_with_heap`] automatically, so
/// cleanup happens whether the scope exits normally, via `?`, early return, or any
/// other branch. Use [`into_inner`](Self::into_inner) to reclaim the value on the
/// success path.
pub(crate) struct HeapGuard<'a, T: ResourceTracker, H: ContainsHeap<T>, V: DropWithHeap<T>> {
    // manually dropped because it needs to be dropped by move.
    value: ManuallyDrop<V>,
    heap: &'a mut H,
    _tracker: std::marker::PhantomData<T>,
}

impl<'a, T: ResourceTracker, H: ContainsHeap<T>, V: DropWithHeap<T>> HeapGuard<'a, T, H, V> {
    #[inline]
    pub fn new(value: V, heap: &'a mut H) -> Self {
        Self {
            value: ManuallyDrop::new(value),
            heap,
            _tracker: std::marker::PhantomData,
        }
    }

    /// Consumes the guard and returns the contained value without dropping it.
    #[inline]
    pub fn into_inner(self) -> V {
        let mut this = ManuallyDrop::new(self);
        // SAFETY: `ManuallyDrop::new(self)` prevents `Drop` on self, so we can take the value out
        unsafe { ManuallyDrop::take(&mut this.value) }
    }

    /// Borrows the value (immutably) and heap (mutably) out of the guard.
    #[inline]
    pub fn as_parts(&mut self) -> (&V, &mut H) {
        (&self.value, self.heap)
    }

    /// Borrows the value (mutably) and heap (mutably) out of the guard.
    #[inline]
    pub fn as_parts_mut(&mut self) -> (&mut V, &mut H) {
        (&mut self.value, self.heap)
    }

    /// Consumes the guard and returns the value and heap separately, without dropping.
    #[inline]
    pub fn into_parts(self) -> (V, &'a mut H) {
        let mut this = ManuallyDrop::new(self);
        // SAFETY: `ManuallyDrop` prevents `Drop` on self, so we can recover the parts
        unsafe { (ManuallyDrop::take(&mut this.value), addr_of!(this.heap).read()) }
    }

    /// Borrows just the heap out of the guard
    #[inline]
    pub fn heap(&mut self) -> &mut H {
        self.heap
    }
}

impl<T: ResourceTracker, H: ContainsHeap<T>, V: DropWithHeap<T>> Drop for HeapGuard<'_, T, H, V> {
    fn drop(&mut self) {
        // SAFETY: value is never manually dropped until this point
        unsafe { ManuallyDrop::take(&mut self.value) }.drop_with_heap(self.heap.heap_mut());
    }
}

/// The preferred way to ensure a [`DropWithHeap`] value is cleaned up on every code path.
///
/// Creates a [`HeapGuard`] and immediately rebinds `$value` as `&V` and `$heap` as
/// `&mut H` via [`HeapGuard::as_parts`].
///
/// # Limitation
///
/// The macro rebinds `$heap` as a new `let` binding, so it cannot be used when `$heap`
/// is `self`. In `&mut self` methods, first assign `let this = self;` and pass `this`.
#[macro_export]
macro_rules! defer_drop {
    ($value:ident, $heap:ident) => {
        let mut _guard = $crate::heap::HeapGuard::new($value, $heap);
        #[allow(
            clippy::allow_attributes,
            reason = "the reborrowed parts may not both be used in every case, so allow unused vars to avoid warnings"
        )]
        #[allow(unused_variables)]
        let ($value, $heap) = _guard.as_parts();
    };
}

/// Like [`defer_drop!`], but rebinds `$value` as `&mut V` via [`HeapGuard::as_parts_mut`].
#[macro_export]
macro_rules! defer_drop_mut {
    ($value:ident, $heap:ident) => {
        let mut _guard = $crate::heap::HeapGuard::new($value, $heap);
        #[allow(
            clippy::allow_attributes,
            reason = "the reborrowed parts may not both be used in every case, so allow unused vars to avoid warnings"
        )]
        #[allow(unused_variables)]
        let ($value, $heap) = _guard.as_parts_mut();
    };
}
