use crate::{exception_private::SimpleException, heap::HeapId, value::Value};

/// A materialized exception instance, as bound by `except ... as e` or returned by `ExcType(...)`.
#[derive(Debug)]
pub(crate) struct ExceptionObject {
    pub exc: SimpleException,
    /// Value carried by `StopIteration`, `None` for other kinds.
    pub payload: Value,
}

impl ExceptionObject {
    pub fn new(exc: SimpleException) -> Self {
        Self {
            exc,
            payload: Value::None,
        }
    }

    pub fn with_payload(exc: SimpleException, payload: Value) -> Self {
        Self { exc, payload }
    }

    pub fn py_dec_ref_ids(&mut self, stack: &mut Vec<HeapId>) {
        self.payload.py_dec_ref_ids(stack);
    }
}
