//! Function objects created by `MAKE_FUNCTION` and `MAKE_CLOSURE`.

use std::sync::Arc;

use crate::{
    bytecode::{Code, CodeFlags},
    heap::{Heap, HeapId},
    intern::StringId,
    resource::ResourceTracker,
    value::Value,
};

/// A user function: shared code plus the values captured when it was defined.
#[derive(Debug)]
pub(crate) struct Function {
    pub code: Arc<Code>,
    /// Qualified name, used by `repr()` and generator names.
    pub qualname: StringId,
    /// Defaults for the trailing positional parameters, in parameter order.
    pub defaults: Vec<Value>,
    /// Defaults for keyword-only parameters, by parameter name.
    pub kw_defaults: Vec<(StringId, Value)>,
    /// Cells for the code's free variables, in `freevars` order. Each id holds one reference.
    pub closure: Vec<HeapId>,
}

impl Function {
    /// Name used in argument binding errors.
    pub fn name(&self) -> StringId {
        self.code.name()
    }

    /// Whether a call can bypass the general binding algorithm.
    ///
    /// True when the code takes exactly its positional parameters with no defaults,
    /// keyword-only parameters, `*args`/`**kwargs`, cells or generator behaviour.
    pub fn is_simple(&self) -> bool {
        self.defaults.is_empty()
            && self.code.kwonlyargcount() == 0
            && self.code.flags() == CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS | CodeFlags::NOFREE
    }

    pub fn py_dec_ref_ids(&mut self, stack: &mut Vec<HeapId>) {
        for value in &mut self.defaults {
            value.py_dec_ref_ids(stack);
        }
        for (_, value) in &mut self.kw_defaults {
            value.py_dec_ref_ids(stack);
        }
        stack.append(&mut self.closure);
    }

    /// Looks up the keyword-only default for `name`.
    pub fn kw_default(&self, name: StringId) -> Option<&Value> {
        self.kw_defaults.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    /// Copies the closure cells, taking a reference on each.
    pub fn closure_with_refs(&self, heap: &Heap<impl ResourceTracker>) -> Vec<HeapId> {
        for id in &self.closure {
            heap.inc_ref(*id);
        }
        self.closure.clone()
    }
}
