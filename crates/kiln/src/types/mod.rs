//! Heap object types that are not plain containers of values.

mod dict;
mod exception;
mod generator;
mod iter;
mod method;
mod namespace;

pub(crate) use dict::{Dict, DictKey};
pub(crate) use exception::ExceptionObject;
pub(crate) use generator::{Generator, GeneratorState};
pub(crate) use iter::{Iter, Range, iter_next};
pub(crate) use method::{BoundMethod, MethodKind};
pub(crate) use namespace::SimpleNamespace;
