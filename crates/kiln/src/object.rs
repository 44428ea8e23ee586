use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    exception_private::RunResult,
    heap::{DropWithHeap, Heap, HeapData},
    intern::Interns,
    resource::{MAX_DATA_RECURSION_DEPTH, ResourceTracker},
    types::Dict,
    value::{Value, float_repr, string_repr},
};

/// A value passed across the public API: run results and host function arguments.
///
/// Plain data is converted structurally. Anything without a data representation
/// (functions, generators, iterators...) is reported as `Repr` holding its `repr()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Object {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Tuple(Vec<Object>),
    List(Vec<Object>),
    /// Key/value pairs in insertion order.
    Dict(Vec<(Object, Object)>),
    Repr(String),
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => f.write_str(&float_repr(*v)),
            Self::String(s) => f.write_str(&string_repr(s)),
            Self::Tuple(items) => {
                f.write_str("(")?;
                write_items(f, items)?;
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
            Self::List(items) => {
                f.write_str("[")?;
                write_items(f, items)?;
                f.write_str("]")
            }
            Self::Dict(pairs) => {
                f.write_str("{")?;
                for (i, (key, value)) in pairs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                f.write_str("}")
            }
            Self::Repr(s) => f.write_str(s),
        }
    }
}

fn write_items(f: &mut fmt::Formatter<'_>, items: &[Object]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl From<i64> for Object {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for Object {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Object {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl Object {
    /// Converts a VM value without consuming it.
    pub(crate) fn from_value(value: &Value, heap: &Heap<impl ResourceTracker>, interns: &Interns) -> Self {
        Self::from_value_depth(value, heap, interns, 0)
    }

    fn from_value_depth(value: &Value, heap: &Heap<impl ResourceTracker>, interns: &Interns, depth: u16) -> Self {
        if depth > MAX_DATA_RECURSION_DEPTH {
            return Self::Repr("...".to_owned());
        }
        let convert = |v: &Value| Self::from_value_depth(v, heap, interns, depth + 1);
        match value {
            Value::None => Self::None,
            Value::Bool(b) => Self::Bool(*b),
            Value::Int(i) => Self::Int(*i),
            Value::Float(f) => Self::Float(*f),
            Value::InternString(id) => Self::String(interns.get_str(*id).to_owned()),
            Value::Ref(id) => match heap.get(*id) {
                HeapData::Str(s) => Self::String(s.clone()),
                HeapData::Tuple(items) => Self::Tuple(items.iter().map(convert).collect()),
                HeapData::List(items) => Self::List(items.iter().map(convert).collect()),
                HeapData::Dict(dict) => Self::Dict(dict.iter().map(|(k, v)| (convert(k), convert(v))).collect()),
                _ => Self::Repr(value.py_repr(heap, interns)),
            },
            other => Self::Repr(other.py_repr(heap, interns)),
        }
    }

    /// Converts into a VM value, allocating containers on `heap`.
    ///
    /// `Repr` objects become plain strings.
    pub(crate) fn into_value(self, heap: &mut Heap<impl ResourceTracker>, interns: &Interns) -> RunResult<Value> {
        let value = match self {
            Self::None => Value::None,
            Self::Bool(b) => Value::Bool(b),
            Self::Int(i) => Value::Int(i),
            Self::Float(f) => Value::Float(f),
            Self::String(s) | Self::Repr(s) => Value::Ref(heap.allocate(HeapData::Str(s))?),
            Self::Tuple(items) => {
                let values = into_values(items, heap, interns)?;
                Value::Ref(heap.allocate(HeapData::Tuple(values))?)
            }
            Self::List(items) => {
                let values = into_values(items, heap, interns)?;
                Value::Ref(heap.allocate(HeapData::List(values))?)
            }
            Self::Dict(pairs) => {
                let mut dict = Dict::new();
                for (key, value) in pairs {
                    let key = match key.into_value(heap, interns) {
                        Ok(key) => key,
                        Err(err) => {
                            DropWithHeap::drop_with_heap(dict, heap);
                            return Err(err);
                        }
                    };
                    let hashed = match key.dict_key(heap, interns) {
                        Ok(hashed) => hashed,
                        Err(err) => {
                            key.drop_with_heap(heap);
                            DropWithHeap::drop_with_heap(dict, heap);
                            return Err(err);
                        }
                    };
                    let value = match value.into_value(heap, interns) {
                        Ok(value) => value,
                        Err(err) => {
                            key.drop_with_heap(heap);
                            DropWithHeap::drop_with_heap(dict, heap);
                            return Err(err);
                        }
                    };
                    if let Some(replaced) = dict.insert(hashed, key, value) {
                        DropWithHeap::drop_with_heap(replaced, heap);
                    }
                }
                Value::Ref(heap.allocate(HeapData::Dict(dict))?)
            }
        };
        Ok(value)
    }
}

fn into_values(items: Vec<Object>, heap: &mut Heap<impl ResourceTracker>, interns: &Interns) -> RunResult<Vec<Value>> {
    let mut values = Vec::with_capacity(items.len());
    for item in items {
        match item.into_value(heap, interns) {
            Ok(value) => values.push(value),
            Err(err) => {
                DropWithHeap::drop_with_heap(values, heap);
                return Err(err);
            }
        }
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NoLimitTracker;

    #[test]
    fn display_matches_repr() {
        let obj = Object::Dict(vec![(
            Object::String("k".to_owned()),
            Object::Tuple(vec![Object::Int(1)]),
        )]);
        assert_eq!(obj.to_string(), "{'k': (1,)}");
        assert_eq!(Object::Float(2.0).to_string(), "2.0");
    }

    #[test]
    fn values_round_trip_through_heap() {
        let mut heap = Heap::new(NoLimitTracker::new());
        let interns = Interns::new();
        let obj = Object::List(vec![Object::None, Object::String("x".to_owned()), Object::Bool(true)]);
        let value = obj.clone().into_value(&mut heap, &interns).unwrap();
        assert_eq!(Object::from_value(&value, &heap, &interns), obj);
        value.drop_with_heap(&mut heap);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn list_keys_are_rejected() {
        let mut heap = Heap::new(NoLimitTracker::new());
        let interns = Interns::new();
        let obj = Object::Dict(vec![(Object::List(vec![]), Object::None)]);
        assert!(obj.into_value(&mut heap, &interns).is_err());
        assert_eq!(heap.live_count(), 0);
    }
}
