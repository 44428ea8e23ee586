//! Functions supplied by the embedding application.
//!
//! Host functions are registered on a [`crate::Program`] by name and become visible to
//! bytecode like builtins. Arguments and results cross the boundary as [`Object`]s, so
//! a call into host code never sees the VM heap.

use std::{fmt, sync::Arc};

use crate::{exception_public::Exception, object::Object};

/// Signature of a host function.
pub type HostFn = dyn Fn(&[Object]) -> Result<Object, Exception> + Send + Sync;

/// Index of a registered host function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct HostFunctionId(u32);

impl HostFunctionId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Registry of host functions, in registration order.
#[derive(Clone, Default)]
pub(crate) struct HostFunctions {
    entries: Vec<(String, Arc<HostFn>)>,
}

impl fmt::Debug for HostFunctions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.iter().map(|(name, _)| name)).finish()
    }
}

impl HostFunctions {
    /// Registers `function` under `name`, replacing an earlier registration of the same name.
    pub fn register(&mut self, name: &str, function: Arc<HostFn>) -> HostFunctionId {
        if let Some(id) = self.lookup(name) {
            self.entries[id.index()].1 = function;
            return id;
        }
        let id = HostFunctionId(u32::try_from(self.entries.len()).expect("too many host functions"));
        self.entries.push((name.to_owned(), function));
        id
    }

    pub fn lookup(&self, name: &str) -> Option<HostFunctionId> {
        self.entries
            .iter()
            .position(|(n, _)| n == name)
            .map(|i| HostFunctionId(u32::try_from(i).expect("too many host functions")))
    }

    pub fn name(&self, id: HostFunctionId) -> &str {
        &self.entries[id.index()].0
    }

    pub fn get(&self, id: HostFunctionId) -> Arc<HostFn> {
        Arc::clone(&self.entries[id.index()].1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registering_twice_replaces() {
        let mut functions = HostFunctions::default();
        let a = functions.register("f", Arc::new(|_: &[Object]| Ok(Object::Int(1))));
        let b = functions.register("f", Arc::new(|_: &[Object]| Ok(Object::Int(2))));
        assert_eq!(a, b);
        assert_eq!(functions.len(), 1);
        assert_eq!((functions.get(a))(&[]), Ok(Object::Int(2)));
        assert_eq!(functions.lookup("g"), None);
    }
}
