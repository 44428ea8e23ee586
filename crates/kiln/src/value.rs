use std::{cmp::Ordering, fmt::Write};

use crate::{
    builtins::Builtins,
    bytecode::UnwindReason,
    exception_private::{ExcType, RunResult},
    heap::{Heap, HeapData, HeapId},
    host::HostFunctionId,
    intern::{Interns, StringId},
    resource::{MAX_DATA_RECURSION_DEPTH, ResourceTracker},
    types::DictKey,
};

/// Primary value type representing objects at runtime.
///
/// Small values are stored inline; everything else lives in the [`Heap`] and is
/// referenced through `Ref`. `Value` deliberately does not implement `Clone`: copies
/// of `Ref` must go through [`Value::clone_with_heap`] and every owned value must be
/// released with [`Value::drop_with_heap`] so reference counts stay balanced.
#[derive(Debug)]
pub(crate) enum Value {
    /// An empty slot: unbound local, empty cell, or a hole left on the value stack.
    Undefined,
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// A string constant or name from the intern table.
    InternString(StringId),
    Builtin(Builtins),
    HostFunction(HostFunctionId),
    /// Marker pushed by the unwinder before entering a `finally` handler.
    ///
    /// Only ever produced and consumed by the VM, never visible to bytecode as data.
    Reason(UnwindReason),
    Ref(HeapId),
    /// Sentinel left behind once a `Ref` has been released, see the `ref-count-panic` feature.
    #[cfg(feature = "ref-count-panic")]
    Dereferenced,
}

#[cfg(feature = "ref-count-panic")]
impl Drop for Value {
    fn drop(&mut self) {
        if let Self::Ref(id) = self {
            panic!("Value::Ref({id:?}) dropped without calling drop_with_heap() - this is a reference counting bug");
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl Value {
    /// Copies the value, incrementing the reference count of heap values.
    pub fn clone_with_heap(&self, heap: &Heap<impl ResourceTracker>) -> Self {
        match self {
            Self::Ref(id) => {
                heap.inc_ref(*id);
                Self::Ref(*id)
            }
            other => other.clone_immediate(),
        }
    }

    /// Copies an immediate value.
    ///
    /// # Panics
    /// Panics for `Ref`: those must go through `clone_with_heap` to maintain refcounts.
    pub fn clone_immediate(&self) -> Self {
        match self {
            Self::Undefined => Self::Undefined,
            Self::None => Self::None,
            Self::Bool(b) => Self::Bool(*b),
            Self::Int(i) => Self::Int(*i),
            Self::Float(f) => Self::Float(*f),
            Self::InternString(id) => Self::InternString(*id),
            Self::Builtin(b) => Self::Builtin(*b),
            Self::HostFunction(id) => Self::HostFunction(*id),
            Self::Reason(reason) => Self::Reason(*reason),
            Self::Ref(_) => panic!("Ref clones must go through clone_with_heap to maintain refcounts"),
            #[cfg(feature = "ref-count-panic")]
            Self::Dereferenced => panic!("Cannot clone Dereferenced object"),
        }
    }

    /// Drops a value, decrementing its heap reference count if applicable.
    #[cfg(not(feature = "ref-count-panic"))]
    #[inline]
    pub fn drop_with_heap(self, heap: &mut Heap<impl ResourceTracker>) {
        if let Self::Ref(id) = self {
            heap.dec_ref(id);
        }
    }

    /// With `ref-count-panic` enabled, `Ref` variants are replaced with `Dereferenced` and
    /// the original is forgotten to prevent the Drop impl from panicking.
    #[cfg(feature = "ref-count-panic")]
    pub fn drop_with_heap(mut self, heap: &mut Heap<impl ResourceTracker>) {
        let old = std::mem::replace(&mut self, Self::Dereferenced);
        if let Self::Ref(id) = &old {
            heap.dec_ref(*id);
            std::mem::forget(old);
        }
    }

    /// Moves the heap reference (if any) into `stack` for deferred release.
    pub fn py_dec_ref_ids(&mut self, stack: &mut Vec<HeapId>) {
        if let Self::Ref(id) = self {
            stack.push(*id);
            let old = std::mem::replace(self, Self::Undefined);
            std::mem::forget(old);
        }
    }

    #[inline]
    pub fn ref_id(&self) -> Option<HeapId> {
        match self {
            Self::Ref(id) => Some(*id),
            _ => None,
        }
    }

    #[inline]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Identity comparison, the `is` operator.
    pub fn is(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Ref(a), Self::Ref(b)) => a == b,
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::InternString(a), Self::InternString(b)) => a == b,
            (Self::Builtin(a), Self::Builtin(b)) => a == b,
            (Self::HostFunction(a), Self::HostFunction(b)) => a == b,
            _ => false,
        }
    }

    /// Integer view of ints and bools.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Borrows the contents of interned or heap strings.
    pub fn as_str<'a>(&self, heap: &'a Heap<impl ResourceTracker>, interns: &'a Interns) -> Option<&'a str> {
        match self {
            Self::InternString(id) => Some(interns.get_str(*id)),
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Str(s) => Some(s.as_str()),
                _ => None,
            },
            _ => None,
        }
    }

    /// The exception kind this value names, if it is an exception type.
    pub fn as_exc_type(&self) -> Option<ExcType> {
        match self {
            Self::Builtin(Builtins::ExcType(exc_type)) => Some(*exc_type),
            _ => None,
        }
    }

    /// Name of the value's type, as used in error messages.
    pub fn type_name(&self, heap: &Heap<impl ResourceTracker>) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::InternString(_) => "str",
            Self::Builtin(Builtins::Function(_)) | Self::HostFunction(_) => "builtin_function_or_method",
            Self::Builtin(Builtins::ExcType(_)) => "type",
            Self::Reason(_) => "unwind marker",
            Self::Ref(id) => heap.get(*id).type_name(),
            #[cfg(feature = "ref-count-panic")]
            Self::Dereferenced => "dereferenced",
        }
    }

    /// Truthiness, as used by conditional jumps and `not`.
    pub fn py_bool(&self, heap: &Heap<impl ResourceTracker>, interns: &Interns) -> bool {
        match self {
            Self::Undefined | Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::InternString(id) => !interns.get_str(*id).is_empty(),
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Str(s) => !s.is_empty(),
                HeapData::Tuple(items) | HeapData::List(items) => !items.is_empty(),
                HeapData::Dict(dict) => dict.len() > 0,
                HeapData::Range(range) => range.len() > 0,
                _ => true,
            },
            _ => true,
        }
    }

    /// Equality, the `==` operator.
    pub fn py_eq(&self, other: &Self, heap: &Heap<impl ResourceTracker>, interns: &Interns) -> bool {
        self.py_eq_depth(other, heap, interns, 0)
    }

    fn py_eq_depth(&self, other: &Self, heap: &Heap<impl ResourceTracker>, interns: &Interns, depth: u16) -> bool {
        if depth > MAX_DATA_RECURSION_DEPTH {
            return false;
        }
        if let (Some(a), Some(b)) = (self.as_number(), other.as_number()) {
            return a.eq(&b);
        }
        if let (Some(a), Some(b)) = (self.as_str(heap, interns), other.as_str(heap, interns)) {
            return a == b;
        }
        match (self, other) {
            (Self::Ref(a), Self::Ref(b)) => {
                if a == b {
                    return true;
                }
                match (heap.get(*a), heap.get(*b)) {
                    (HeapData::Tuple(x), HeapData::Tuple(y)) | (HeapData::List(x), HeapData::List(y)) => {
                        x.len() == y.len()
                            && x.iter()
                                .zip(y)
                                .all(|(l, r)| l.py_eq_depth(r, heap, interns, depth + 1))
                    }
                    (HeapData::Dict(x), HeapData::Dict(y)) => x.py_eq(y, |l, r| l.py_eq_depth(r, heap, interns, depth + 1)),
                    (HeapData::Range(x), HeapData::Range(y)) => x == y,
                    _ => false,
                }
            }
            _ => self.is(other),
        }
    }

    /// Ordering for `<`, `<=`, `>` and `>=`; `None` when the types are not orderable.
    pub fn py_cmp(&self, other: &Self, heap: &Heap<impl ResourceTracker>, interns: &Interns) -> Option<Ordering> {
        self.py_cmp_depth(other, heap, interns, 0)
    }

    fn py_cmp_depth(
        &self,
        other: &Self,
        heap: &Heap<impl ResourceTracker>,
        interns: &Interns,
        depth: u16,
    ) -> Option<Ordering> {
        if depth > MAX_DATA_RECURSION_DEPTH {
            return None;
        }
        if let (Some(a), Some(b)) = (self.as_number(), other.as_number()) {
            return a.partial_cmp(&b);
        }
        if let (Some(a), Some(b)) = (self.as_str(heap, interns), other.as_str(heap, interns)) {
            return Some(a.cmp(b));
        }
        let (Self::Ref(a), Self::Ref(b)) = (self, other) else {
            return None;
        };
        match (heap.get(*a), heap.get(*b)) {
            (HeapData::Tuple(x), HeapData::Tuple(y)) | (HeapData::List(x), HeapData::List(y)) => {
                for (l, r) in x.iter().zip(y) {
                    if !l.py_eq_depth(r, heap, interns, depth + 1) {
                        return l.py_cmp_depth(r, heap, interns, depth + 1);
                    }
                }
                Some(x.len().cmp(&y.len()))
            }
            _ => None,
        }
    }

    /// Converts the value into a dictionary key, failing for unhashable types.
    #[expect(clippy::cast_possible_truncation, reason = "only integral floats in range are folded")]
    pub fn dict_key(&self, heap: &Heap<impl ResourceTracker>, interns: &Interns) -> RunResult<DictKey> {
        match self {
            Self::None => Ok(DictKey::None),
            Self::Bool(b) => Ok(DictKey::Int(i64::from(*b))),
            Self::Int(i) => Ok(DictKey::Int(*i)),
            Self::Float(f) => {
                if f.fract() == 0.0 && f.abs() < 9.0e15 {
                    Ok(DictKey::Int(*f as i64))
                } else {
                    Ok(DictKey::Float(f.to_bits()))
                }
            }
            Self::InternString(id) => Ok(DictKey::Str(interns.get_str(*id).into())),
            Self::Builtin(b) => Ok(DictKey::Builtin(*b)),
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Str(s) => Ok(DictKey::Str(s.as_str().into())),
                HeapData::Tuple(items) => {
                    let keys = items
                        .iter()
                        .map(|item| item.dict_key(heap, interns))
                        .collect::<RunResult<Vec<_>>>()?;
                    Ok(DictKey::Tuple(keys))
                }
                HeapData::List(_) | HeapData::Dict(_) | HeapData::Namespace(_) => {
                    Err(ExcType::unhashable(self.type_name(heap)))
                }
                _ => Ok(DictKey::Identity(*id)),
            },
            other => Err(ExcType::unhashable(other.type_name(heap))),
        }
    }

    /// `repr()` of the value.
    pub fn py_repr(&self, heap: &Heap<impl ResourceTracker>, interns: &Interns) -> String {
        let mut out = String::new();
        self.repr_into(&mut out, heap, interns, 0);
        out
    }

    /// `str()` of the value: like `repr()` except strings are not quoted.
    pub fn py_str(&self, heap: &Heap<impl ResourceTracker>, interns: &Interns) -> String {
        if let Some(s) = self.as_str(heap, interns) {
            return s.to_owned();
        }
        if let Self::Ref(id) = self
            && let HeapData::Exception(exc) = heap.get(*id)
        {
            return exc.exc.py_str();
        }
        self.py_repr(heap, interns)
    }

    fn repr_into(&self, out: &mut String, heap: &Heap<impl ResourceTracker>, interns: &Interns, depth: u16) {
        match self {
            Self::Undefined => out.push_str("<undefined>"),
            Self::None => out.push_str("None"),
            Self::Bool(true) => out.push_str("True"),
            Self::Bool(false) => out.push_str("False"),
            Self::Int(i) => {
                let _ = write!(out, "{i}");
            }
            Self::Float(f) => out.push_str(&float_repr(*f)),
            Self::InternString(id) => out.push_str(&string_repr(interns.get_str(*id))),
            Self::Builtin(Builtins::Function(f)) => {
                let _ = write!(out, "<built-in function {f}>");
            }
            Self::Builtin(Builtins::ExcType(t)) => {
                let _ = write!(out, "<class '{t}'>");
            }
            Self::HostFunction(id) => {
                let _ = write!(out, "<host function #{}>", id.index());
            }
            Self::Reason(reason) => {
                let _ = write!(out, "<unwind {reason:?}>");
            }
            Self::Ref(id) => heap_repr_into(*id, out, heap, interns, depth),
            #[cfg(feature = "ref-count-panic")]
            Self::Dereferenced => out.push_str("<dereferenced>"),
        }
    }

    fn as_number(&self) -> Option<Number> {
        match self {
            Self::Bool(b) => Some(Number::Int(i64::from(*b))),
            Self::Int(i) => Some(Number::Int(*i)),
            Self::Float(f) => Some(Number::Float(*f)),
            _ => None,
        }
    }
}

/// A numeric operand, used so int/float/bool comparisons share one code path.
#[derive(Debug, Clone, Copy)]
enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Int(a), Self::Float(b)) | (Self::Float(b), Self::Int(a)) => (*a as f64) == *b,
            (Self::Float(a), Self::Float(b)) => a == b,
        }
    }

    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Int(a), Self::Float(b)) => (*a as f64).partial_cmp(b),
            (Self::Float(a), Self::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(b),
        }
    }
}

fn heap_repr_into(id: HeapId, out: &mut String, heap: &Heap<impl ResourceTracker>, interns: &Interns, depth: u16) {
    let data = heap.get(id);
    let too_deep = depth >= MAX_DATA_RECURSION_DEPTH;
    match data {
        HeapData::Str(s) => out.push_str(&string_repr(s)),
        HeapData::List(items) => {
            if too_deep {
                out.push_str("[...]");
                return;
            }
            out.push('[');
            repr_items(items, out, heap, interns, depth);
            out.push(']');
        }
        HeapData::Tuple(items) => {
            if too_deep {
                out.push_str("(...)");
                return;
            }
            out.push('(');
            repr_items(items, out, heap, interns, depth);
            if items.len() == 1 {
                out.push(',');
            }
            out.push(')');
        }
        HeapData::Dict(dict) => {
            if too_deep {
                out.push_str("{...}");
                return;
            }
            out.push('{');
            for (i, (key, value)) in dict.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                key.repr_into(out, heap, interns, depth + 1);
                out.push_str(": ");
                value.repr_into(out, heap, interns, depth + 1);
            }
            out.push('}');
        }
        HeapData::Namespace(ns) => {
            if too_deep {
                out.push_str("namespace(...)");
                return;
            }
            out.push_str("namespace(");
            for (i, (name, value)) in ns.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(name);
                out.push('=');
                value.repr_into(out, heap, interns, depth + 1);
            }
            out.push(')');
        }
        HeapData::Cell(_) => {
            let _ = write!(out, "<cell at #{}>", id.index());
        }
        HeapData::Function(function) => {
            let _ = write!(out, "<function {}>", interns.get_str(function.qualname));
        }
        HeapData::Code(code) => {
            let _ = write!(out, "<code object {}>", interns.get_str(code.name()));
        }
        HeapData::Generator(generator) => {
            let _ = write!(out, "<generator object {}>", interns.get_str(generator.name));
        }
        HeapData::Exception(exc) => out.push_str(&exc.exc.py_repr()),
        HeapData::Range(range) => out.push_str(&range.to_string()),
        HeapData::BoundMethod(method) => {
            let _ = write!(
                out,
                "<built-in method {} of {} object>",
                method.method,
                method.receiver.type_name(heap)
            );
        }
        HeapData::Suppress(_) | HeapData::Traceback(_) | HeapData::Iter(_) => {
            let _ = write!(out, "<{} object at #{}>", data.type_name(), id.index());
        }
    }
}

fn repr_items(items: &[Value], out: &mut String, heap: &Heap<impl ResourceTracker>, interns: &Interns, depth: u16) {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        item.repr_into(out, heap, interns, depth + 1);
    }
}

/// Quotes a string for `repr()`, preferring single quotes.
pub(crate) fn string_repr(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_control() => {
                let _ = write!(out, "\\x{:02x}", u32::from(c));
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

/// Float text for `repr()`: the shortest round-trip form, with `.0` added to whole numbers.
pub(crate) fn float_repr(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_owned();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf".to_owned() } else { "-inf".to_owned() };
    }
    let s = f.to_string();
    if s.contains('.') || s.contains('e') {
        s
    } else {
        format!("{s}.0")
    }
}
