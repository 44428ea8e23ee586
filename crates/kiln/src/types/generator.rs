//! Generator objects.
//!
//! Calling a function whose code is flagged as a generator does not run its body.
//! Instead the fully bound frame is parked inside a `Generator` on the heap and each
//! resumption (`next()`, `send()`, `throw()`, iteration) runs it until the next
//! yield or until it returns.

use crate::{bytecode::Frame, heap::HeapId, intern::StringId};

/// Generator execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GeneratorState {
    /// Created but never resumed; the frame has not executed an instruction.
    Created,
    /// Currently executing. The frame is checked out of the generator while running.
    Running,
    /// Parked at a yield.
    Suspended,
    /// Returned or raised; the frame has been released.
    Finished,
}

/// A suspended generator function.
#[derive(Debug)]
pub(crate) struct Generator {
    /// The parked frame, `None` while running or after finishing.
    pub frame: Option<Box<Frame>>,
    pub state: GeneratorState,
    /// Qualified name of the generator function, for `repr()` and tracebacks.
    pub name: StringId,
}

impl Generator {
    pub fn new(frame: Frame, name: StringId) -> Self {
        Self {
            frame: Some(Box::new(frame)),
            state: GeneratorState::Created,
            name,
        }
    }

    pub fn estimate_size(&self) -> usize {
        self.frame.as_ref().map_or(0, |frame| frame.estimate_size())
    }

    pub fn py_dec_ref_ids(&mut self, stack: &mut Vec<HeapId>) {
        if let Some(frame) = &mut self.frame {
            frame.py_dec_ref_ids(stack);
        }
    }
}
