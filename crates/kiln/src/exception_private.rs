use std::{borrow::Cow, fmt};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    exception_public::{Exception, StackFrame},
    heap::{DropWithHeap, Heap, HeapId},
    intern::{Interns, StringId},
    resource::ResourceTracker,
};

/// Result type alias for operations that can produce a runtime error.
pub(crate) type RunResult<T> = Result<T, RunError>;

/// Exception kinds known to the VM.
///
/// Uses strum derives for automatic `Display`, `FromStr`, and `Into<&'static str>` implementations.
/// The string representation matches the variant name exactly (e.g., `ValueError` -> "ValueError"),
/// which is also the global name bytecode uses to reference the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, Serialize, Deserialize)]
pub enum ExcType {
    /// Root of the hierarchy, matches everything.
    BaseException,
    SystemExit,
    KeyboardInterrupt,
    /// Raised inside a generator by `close()`. Not a subclass of `Exception`.
    GeneratorExit,
    /// Matches everything except the direct `BaseException` subclasses above.
    Exception,
    StopIteration,

    ArithmeticError,
    OverflowError,
    ZeroDivisionError,

    LookupError,
    IndexError,
    KeyError,

    RuntimeError,
    NotImplementedError,
    RecursionError,

    NameError,
    UnboundLocalError,

    AssertionError,
    AttributeError,
    MemoryError,
    SystemError,
    TimeoutError,
    TypeError,
    ValueError,
}

impl ExcType {
    /// Checks whether an exception of kind `self` is matched by a handler for `handler_type`.
    #[must_use]
    pub fn is_subclass_of(self, handler_type: Self) -> bool {
        if self == handler_type {
            return true;
        }
        match handler_type {
            Self::BaseException => true,
            Self::Exception => !matches!(
                self,
                Self::BaseException | Self::KeyboardInterrupt | Self::SystemExit | Self::GeneratorExit
            ),
            Self::ArithmeticError => matches!(self, Self::ZeroDivisionError | Self::OverflowError),
            Self::LookupError => matches!(self, Self::KeyError | Self::IndexError),
            Self::RuntimeError => matches!(self, Self::RecursionError | Self::NotImplementedError),
            Self::NameError => matches!(self, Self::UnboundLocalError),
            _ => false,
        }
    }

    #[must_use]
    pub(crate) fn type_error(msg: impl fmt::Display) -> RunError {
        SimpleException::new_msg(Self::TypeError, msg).into()
    }

    #[must_use]
    pub(crate) fn value_error(msg: impl fmt::Display) -> RunError {
        SimpleException::new_msg(Self::ValueError, msg).into()
    }

    #[must_use]
    pub(crate) fn runtime_error(msg: impl fmt::Display) -> RunError {
        SimpleException::new_msg(Self::RuntimeError, msg).into()
    }

    #[must_use]
    pub(crate) fn name_error(name: &str) -> RunError {
        SimpleException::new_msg(Self::NameError, format!("name '{name}' is not defined")).into()
    }

    #[must_use]
    pub(crate) fn unbound_local(name: &str) -> RunError {
        SimpleException::new_msg(
            Self::UnboundLocalError,
            format!("local variable '{name}' referenced before assignment"),
        )
        .into()
    }

    #[must_use]
    pub(crate) fn unbound_free_var(name: &str) -> RunError {
        SimpleException::new_msg(
            Self::NameError,
            format!("free variable '{name}' referenced before assignment in enclosing scope"),
        )
        .into()
    }

    #[must_use]
    pub(crate) fn attribute_error(type_name: &str, attr: &str) -> RunError {
        SimpleException::new_msg(
            Self::AttributeError,
            format!("'{type_name}' object has no attribute '{attr}'"),
        )
        .into()
    }

    #[must_use]
    pub(crate) fn not_callable(type_name: &str) -> RunError {
        Self::type_error(format!("'{type_name}' object is not callable"))
    }

    #[must_use]
    pub(crate) fn not_iterable(type_name: &str) -> RunError {
        Self::type_error(format!("'{type_name}' object is not iterable"))
    }

    #[must_use]
    pub(crate) fn not_an_iterator(type_name: &str) -> RunError {
        Self::type_error(format!("'{type_name}' object is not an iterator"))
    }

    #[must_use]
    pub(crate) fn unhashable(type_name: &str) -> RunError {
        Self::type_error(format!("unhashable type: '{type_name}'"))
    }

    #[must_use]
    pub(crate) fn binary_type_error(op: &str, left: &str, right: &str) -> RunError {
        Self::type_error(format!(
            "unsupported operand type(s) for {op}: '{left}' and '{right}'"
        ))
    }

    #[must_use]
    pub(crate) fn unary_type_error(op: &str, operand: &str) -> RunError {
        Self::type_error(format!("bad operand type for unary {op}: '{operand}'"))
    }

    #[must_use]
    pub(crate) fn compare_type_error(op: &str, left: &str, right: &str) -> RunError {
        Self::type_error(format!("unorderable types: {left}() {op} {right}()"))
    }

    #[must_use]
    pub(crate) fn zero_division(msg: &'static str) -> RunError {
        SimpleException::new_msg(Self::ZeroDivisionError, msg).into()
    }

    #[must_use]
    pub(crate) fn overflow() -> RunError {
        SimpleException::new_msg(Self::OverflowError, "integer overflow").into()
    }

    #[must_use]
    pub(crate) fn index_error(type_name: &str) -> RunError {
        SimpleException::new_msg(Self::IndexError, format!("{type_name} index out of range")).into()
    }

    #[must_use]
    pub(crate) fn key_error(key_repr: String) -> RunError {
        SimpleException::new(Self::KeyError, Some(key_repr)).into()
    }

    #[must_use]
    pub(crate) fn stop_iteration() -> RunError {
        SimpleException::new(Self::StopIteration, None).into()
    }

    #[must_use]
    pub(crate) fn generator_already_executing() -> RunError {
        Self::value_error("generator already executing")
    }

    /// `{name}() missing {count} required positional argument(s): 'a' and 'b'`
    #[must_use]
    pub(crate) fn type_error_missing_positional_with_names(name: &str, missing_names: &[&str]) -> RunError {
        let count = missing_names.len();
        let names_str = format_param_names(missing_names);
        let plural = if count == 1 { "argument" } else { "arguments" };
        Self::type_error(format!(
            "{name}() missing {count} required positional {plural}: {names_str}"
        ))
    }

    /// `{name}() missing {count} required keyword-only argument(s): 'a' and 'b'`
    #[must_use]
    pub(crate) fn type_error_missing_kwonly_with_names(name: &str, missing_names: &[&str]) -> RunError {
        let count = missing_names.len();
        let names_str = format_param_names(missing_names);
        let plural = if count == 1 { "argument" } else { "arguments" };
        Self::type_error(format!(
            "{name}() missing {count} required keyword-only {plural}: {names_str}"
        ))
    }

    /// Creates a TypeError for too many positional arguments.
    ///
    /// Formats:
    /// - `{name}() takes {max} positional argument(s) but {actual} were given`
    /// - `{name}() takes from {min} to {max} positional arguments but {actual} were given`
    /// - with keyword-only arguments supplied the given count is spelled out:
    ///   `... but {actual} positional argument(s) (and N keyword-only argument(s)) were given`
    #[must_use]
    pub(crate) fn type_error_too_many_positional(
        name: &str,
        min: usize,
        max: usize,
        actual: usize,
        kwonly_given: usize,
    ) -> RunError {
        let takes = if min == max {
            let takes_word = if max == 1 { "argument" } else { "arguments" };
            format!("{max} positional {takes_word}")
        } else {
            format!("from {min} to {max} positional arguments")
        };
        if kwonly_given > 0 {
            let given_word = if actual == 1 { "argument" } else { "arguments" };
            let kwonly_word = if kwonly_given == 1 { "argument" } else { "arguments" };
            Self::type_error(format!(
                "{name}() takes {takes} but {actual} positional {given_word} (and {kwonly_given} keyword-only {kwonly_word}) were given"
            ))
        } else {
            let verb = if actual == 1 { "was" } else { "were" };
            Self::type_error(format!("{name}() takes {takes} but {actual} {verb} given"))
        }
    }

    /// `{name}() got multiple values for argument '{param}'`
    #[must_use]
    pub(crate) fn type_error_duplicate_arg(name: &str, param: &str) -> RunError {
        Self::type_error(format!("{name}() got multiple values for argument '{param}'"))
    }

    /// `{name}() got an unexpected keyword argument '{key}'`
    #[must_use]
    pub(crate) fn type_error_unexpected_keyword(name: &str, key: &str) -> RunError {
        Self::type_error(format!("{name}() got an unexpected keyword argument '{key}'"))
    }

    #[must_use]
    pub(crate) fn type_error_keywords_must_be_strings(name: &str) -> RunError {
        Self::type_error(format!("{name}() keywords must be strings"))
    }

    /// Error for builtins called with the wrong number of arguments.
    #[must_use]
    pub(crate) fn type_error_arg_count(name: &str, expected: &str, actual: usize) -> RunError {
        Self::type_error(format!("{name}() takes {expected} but {actual} were given"))
    }

    #[must_use]
    pub(crate) fn type_error_no_kwargs(name: &str) -> RunError {
        Self::type_error(format!("{name}() takes no keyword arguments"))
    }
}

/// Formats a list of parameter names for error messages.
///
/// Examples:
/// - `["a"]` -> `'a'`
/// - `["a", "b"]` -> `'a' and 'b'`
/// - `["a", "b", "c"]` -> `'a', 'b' and 'c'`
fn format_param_names(names: &[&str]) -> String {
    match names {
        [] => String::new(),
        [only] => format!("'{only}'"),
        [rest @ .., last] => {
            let rest: Vec<_> = rest.iter().map(|n| format!("'{n}'")).collect();
            format!("{} and '{last}'", rest.join(", "))
        }
    }
}

/// Simple lightweight representation of an exception: its kind and optional message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) struct SimpleException {
    exc_type: ExcType,
    arg: Option<String>,
}

impl fmt::Display for SimpleException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.arg {
            Some(arg) => write!(f, "{}: {arg}", self.exc_type),
            None => write!(f, "{}", self.exc_type),
        }
    }
}

impl SimpleException {
    #[must_use]
    pub fn new(exc_type: ExcType, arg: Option<String>) -> Self {
        Self { exc_type, arg }
    }

    #[must_use]
    pub fn new_msg(exc_type: ExcType, msg: impl fmt::Display) -> Self {
        Self::new(exc_type, Some(msg.to_string()))
    }

    #[must_use]
    pub fn exc_type(&self) -> ExcType {
        self.exc_type
    }

    #[must_use]
    pub fn arg(&self) -> Option<&str> {
        self.arg.as_deref()
    }

    /// `repr()` of the exception instance, e.g. `ValueError('bad')`.
    #[must_use]
    pub fn py_repr(&self) -> String {
        match &self.arg {
            Some(arg) => format!("{}({})", self.exc_type, crate::value::string_repr(arg)),
            None => format!("{}()", self.exc_type),
        }
    }

    /// `str()` of the exception instance: the message or an empty string.
    #[must_use]
    pub fn py_str(&self) -> String {
        self.arg.clone().unwrap_or_default()
    }
}

/// One traceback entry: where a frame was when the exception passed through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RawStackFrame {
    pub filename: StringId,
    pub name: StringId,
    pub line: u32,
}

impl RawStackFrame {
    fn into_public(self, interns: &Interns) -> StackFrame {
        StackFrame {
            filename: interns.get_str(self.filename).to_owned(),
            name: interns.get_str(self.name).to_owned(),
            line: self.line,
        }
    }
}

/// An exception in flight through the VM.
#[derive(Debug)]
pub(crate) struct ExceptionRaise {
    pub exc: SimpleException,
    /// Frames the exception has passed through, innermost first.
    pub traceback: Vec<RawStackFrame>,
    /// The heap exception object this raise carries, if one has been materialized.
    ///
    /// Holds one reference. Set when an instance is raised explicitly or re-raised
    /// from a handler, so identity and payload (`StopIteration` values) survive.
    pub instance: Option<HeapId>,
}

impl From<SimpleException> for ExceptionRaise {
    fn from(exc: SimpleException) -> Self {
        Self {
            exc,
            traceback: Vec::new(),
            instance: None,
        }
    }
}

impl ExceptionRaise {
    fn into_public(self, interns: &Interns) -> Exception {
        // tracebacks read outermost call first
        let traceback = self
            .traceback
            .into_iter()
            .rev()
            .map(|frame| frame.into_public(interns))
            .collect();
        Exception::with_traceback(self.exc.exc_type, self.exc.arg, traceback)
    }
}

impl<T: ResourceTracker> DropWithHeap<T> for ExceptionRaise {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        if let Some(id) = self.instance {
            heap.dec_ref(id);
        }
    }
}

/// Runtime error types that can occur during execution.
///
/// - `Internal`: a bug in the VM or malformed bytecode, never caught by handlers
/// - `Exc`: an exception that handlers may catch
/// - `UncatchableExc`: resource exhaustion which unwinds without running handlers
/// - `Fatal`: an unrecoverable condition, the execution context is terminated
#[derive(Debug)]
pub(crate) enum RunError {
    Internal(Cow<'static, str>),
    Exc(Box<ExceptionRaise>),
    UncatchableExc(Box<ExceptionRaise>),
    Fatal(Cow<'static, str>),
}

impl From<ExceptionRaise> for RunError {
    fn from(exc: ExceptionRaise) -> Self {
        Self::Exc(Box::new(exc))
    }
}

impl From<SimpleException> for RunError {
    fn from(exc: SimpleException) -> Self {
        Self::Exc(Box::new(exc.into()))
    }
}

impl From<Exception> for RunError {
    fn from(exc: Exception) -> Self {
        let (exc_type, message) = exc.into_parts();
        SimpleException::new(exc_type, message).into()
    }
}

impl RunError {
    pub fn internal(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn fatal(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Whether exception handlers in bytecode may see this error.
    #[must_use]
    pub fn is_catchable(&self) -> bool {
        matches!(self, Self::Exc(_))
    }

    /// Whether this error ends the execution context rather than just the run.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Internal(_) | Self::Fatal(_))
    }

    /// The exception kind, for errors that carry one.
    #[must_use]
    pub fn exc_type(&self) -> Option<ExcType> {
        match self {
            Self::Exc(exc) | Self::UncatchableExc(exc) => Some(exc.exc.exc_type()),
            Self::Internal(_) | Self::Fatal(_) => None,
        }
    }

    /// Returns true if this error is a catchable exception matched by `handler_type`.
    #[must_use]
    pub fn matches(&self, handler_type: ExcType) -> bool {
        match self {
            Self::Exc(exc) => exc.exc.exc_type().is_subclass_of(handler_type),
            _ => false,
        }
    }

    /// Records that the exception passed through `frame`.
    pub fn push_frame(&mut self, frame: RawStackFrame) {
        if let Self::Exc(exc) | Self::UncatchableExc(exc) = self {
            exc.traceback.push(frame);
        }
    }

    /// Converts this runtime error to an [`Exception`] for the public API, releasing
    /// any heap object it holds.
    pub fn into_public<T: ResourceTracker>(self, heap: &mut Heap<T>, interns: &Interns) -> Exception {
        match self {
            Self::Exc(exc) | Self::UncatchableExc(exc) => {
                let mut exc = *exc;
                if let Some(id) = exc.instance.take() {
                    heap.dec_ref(id);
                }
                exc.into_public(interns)
            }
            Self::Internal(err) => Exception::runtime_error(format!("internal error: {err}")),
            Self::Fatal(err) => Exception::fatal(err.into_owned()),
        }
    }
}

impl<T: ResourceTracker> DropWithHeap<T> for RunError {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        if let Self::Exc(exc) | Self::UncatchableExc(exc) = self {
            exc.drop_with_heap(heap);
        }
    }
}
