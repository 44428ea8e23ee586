use smallvec::SmallVec;

use crate::{
    exception_private::{ExcType, RunResult},
    heap::{DropWithHeap, Heap},
    resource::ResourceTracker,
    value::Value,
};

/// Positional arguments of a call; most calls pass only a few.
pub(crate) type Positional = SmallVec<[Value; 4]>;

/// Arguments collected for a call, in the order they appeared at the call site.
///
/// Keyword names are string values (interned names from `CALL_FUNCTION`, or keys of an
/// unpacked `**kwargs` dict). Every value is owned; all paths must release them.
#[derive(Debug, Default)]
pub(crate) struct CallArgs {
    pub positional: Positional,
    pub keywords: Vec<(Value, Value)>,
}

impl CallArgs {
    pub fn new(positional: Positional, keywords: Vec<(Value, Value)>) -> Self {
        Self { positional, keywords }
    }

    pub fn from_values(values: impl IntoIterator<Item = Value>) -> Self {
        Self {
            positional: values.into_iter().collect(),
            keywords: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.positional.len() + self.keywords.len()
    }

    /// Checks that no keyword arguments were passed and the positional count is in
    /// `min..=max`, returning the positional values.
    ///
    /// On error, properly drops all contained values to maintain reference counts.
    pub fn into_positional(
        self,
        name: &str,
        min: usize,
        max: usize,
        heap: &mut Heap<impl ResourceTracker>,
    ) -> RunResult<Positional> {
        if !self.keywords.is_empty() {
            self.drop_with_heap(heap);
            return Err(ExcType::type_error_no_kwargs(name));
        }
        let count = self.positional.len();
        if count < min || count > max {
            self.drop_with_heap(heap);
            return Err(ExcType::type_error_arg_count(name, &expected_count(min, max), count));
        }
        Ok(self.positional)
    }

    /// Checks that exactly one positional argument was passed, returning it.
    pub fn into_one(self, name: &str, heap: &mut Heap<impl ResourceTracker>) -> RunResult<Value> {
        let mut args = self.into_positional(name, 1, 1, heap)?;
        Ok(args.pop().expect("length checked above"))
    }
}

impl<T: ResourceTracker> DropWithHeap<T> for CallArgs {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        for value in self.positional {
            value.drop_with_heap(heap);
        }
        self.keywords.drop_with_heap(heap);
    }
}

fn expected_count(min: usize, max: usize) -> String {
    let plural = |n: usize| if n == 1 { "argument" } else { "arguments" };
    if min == max {
        format!("exactly {min} {}", plural(min))
    } else if max == usize::MAX {
        format!("at least {min} {}", plural(min))
    } else {
        format!("from {min} to {max} arguments")
    }
}
