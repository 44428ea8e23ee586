//! Attribute access: namespace fields, exception fields and native methods.

use std::str::FromStr;

use super::VM;
use crate::{
    exception_private::{ExcType, RunResult},
    heap::{DropWithHeap, HeapData},
    intern::StringId,
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{BoundMethod, MethodKind},
    value::Value,
};

/// What an attribute lookup resolved to before anything is allocated.
enum Lookup {
    Found(Value),
    ExceptionArgs(Option<String>),
    Method(MethodKind),
    Missing(&'static str),
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    /// `owner.name`.
    pub(super) fn load_attr(&mut self, owner: &Value, name: &str) -> RunResult<Value> {
        let type_name = owner.type_name(&self.heap);
        let lookup = match owner.ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::Namespace(namespace)) => match namespace.get(name) {
                Some(value) => Lookup::Found(value.clone_with_heap(&self.heap)),
                None => Lookup::Missing(type_name),
            },
            Some(HeapData::Exception(object)) if name == "value" && object.exc.exc_type() == ExcType::StopIteration => {
                Lookup::Found(object.payload.clone_with_heap(&self.heap))
            }
            Some(HeapData::Exception(object)) if name == "args" => {
                Lookup::ExceptionArgs(object.exc.arg().map(str::to_owned))
            }
            _ => match MethodKind::from_str(name) {
                Ok(method) if method.applies_to(type_name) => Lookup::Method(method),
                _ => Lookup::Missing(type_name),
            },
        };
        match lookup {
            Lookup::Found(value) => Ok(value),
            Lookup::ExceptionArgs(arg) => {
                let items = match arg {
                    Some(arg) => vec![Value::Ref(self.heap.allocate(HeapData::Str(arg))?)],
                    None => Vec::new(),
                };
                Ok(Value::Ref(self.heap.allocate(HeapData::Tuple(items))?))
            }
            Lookup::Method(method) => {
                let receiver = owner.clone_with_heap(&self.heap);
                let bound = BoundMethod { receiver, method };
                Ok(Value::Ref(self.heap.allocate(HeapData::BoundMethod(bound))?))
            }
            Lookup::Missing(type_name) => Err(ExcType::attribute_error(type_name, name)),
        }
    }

    /// `LOAD_ATTR`, consuming the owner.
    pub(super) fn load_attr_op(&mut self, owner: Value, name: StringId) -> RunResult<Value> {
        let interns = self.interns;
        let result = self.load_attr(&owner, interns.get_str(name));
        owner.drop_with_heap(&mut self.heap);
        result
    }

    /// `STORE_ATTR`: only namespaces accept new attributes.
    pub(super) fn store_attr(&mut self, owner: Value, name: StringId, value: Value) -> RunResult<()> {
        let interns = self.interns;
        let name = interns.get_str(name);
        let type_name = owner.type_name(&self.heap);
        let outcome = match owner.ref_id().map(|id| self.heap.get_mut(id)) {
            Some(HeapData::Namespace(namespace)) => Ok(namespace.set(name, value)),
            _ => Err(value),
        };
        owner.drop_with_heap(&mut self.heap);
        match outcome {
            Ok(replaced) => {
                replaced.drop_with_heap(&mut self.heap);
                Ok(())
            }
            Err(value) => {
                value.drop_with_heap(&mut self.heap);
                Err(ExcType::attribute_error(type_name, name))
            }
        }
    }

    /// `DELETE_ATTR`.
    pub(super) fn delete_attr(&mut self, owner: Value, name: StringId) -> RunResult<()> {
        let interns = self.interns;
        let name = interns.get_str(name);
        let type_name = owner.type_name(&self.heap);
        let removed = match owner.ref_id().map(|id| self.heap.get_mut(id)) {
            Some(HeapData::Namespace(namespace)) => namespace.remove(name),
            _ => None,
        };
        owner.drop_with_heap(&mut self.heap);
        match removed {
            Some(old) => {
                old.drop_with_heap(&mut self.heap);
                Ok(())
            }
            None => Err(ExcType::attribute_error(type_name, name)),
        }
    }
}
