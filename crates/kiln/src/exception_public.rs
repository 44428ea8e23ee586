use std::fmt;

use serde::{Deserialize, Serialize};

use crate::exception_private::ExcType;

/// An exception which escaped a run, or was raised by host code.
///
/// Host functions and pending callbacks return this type to raise into the VM;
/// [`crate::ExecutionContext::run`] returns it when bytecode raises and nothing
/// catches it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exception {
    exc_type: ExcType,
    message: Option<String>,
    /// Outermost frame first, the way tracebacks are printed.
    traceback: Vec<StackFrame>,
    /// Set when the error was unrecoverable and the context has been terminated.
    fatal: bool,
}

/// One entry in an exception traceback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub filename: String,
    pub name: String,
    pub line: u32,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "  File \"{}\", line {}, in {}", self.filename, self.line, self.name)
    }
}

impl Exception {
    #[must_use]
    pub fn new(exc_type: ExcType, message: Option<String>) -> Self {
        Self {
            exc_type,
            message,
            traceback: Vec::new(),
            fatal: false,
        }
    }

    pub(crate) fn with_traceback(exc_type: ExcType, message: Option<String>, traceback: Vec<StackFrame>) -> Self {
        Self {
            exc_type,
            message,
            traceback,
            fatal: false,
        }
    }

    #[must_use]
    pub fn runtime_error(message: impl Into<String>) -> Self {
        Self::new(ExcType::RuntimeError, Some(message.into()))
    }

    /// An unrecoverable error, e.g. overflowing the stack while handling a `RecursionError`.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            exc_type: ExcType::SystemError,
            message: Some(message.into()),
            traceback: Vec::new(),
            fatal: true,
        }
    }

    #[must_use]
    pub fn exc_type(&self) -> ExcType {
        self.exc_type
    }

    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    #[must_use]
    pub fn into_message(self) -> Option<String> {
        self.message
    }

    pub(crate) fn into_parts(self) -> (ExcType, Option<String>) {
        (self.exc_type, self.message)
    }

    #[must_use]
    pub fn traceback(&self) -> &[StackFrame] {
        &self.traceback
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    /// `ExcType: message` without the traceback.
    #[must_use]
    pub fn summary(&self) -> String {
        match &self.message {
            Some(msg) if !msg.is_empty() => format!("{}: {msg}", self.exc_type),
            _ => self.exc_type.to_string(),
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fatal {
            return write!(f, "Fatal error: {}", self.message.as_deref().unwrap_or_default());
        }
        if !self.traceback.is_empty() {
            writeln!(f, "Traceback (most recent call last):")?;
            for frame in &self.traceback {
                writeln!(f, "{frame}")?;
            }
        }
        f.write_str(&self.summary())
    }
}

impl std::error::Error for Exception {}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn display_includes_traceback() {
        let exc = Exception::with_traceback(
            ExcType::ValueError,
            Some("bad".to_owned()),
            vec![
                StackFrame {
                    filename: "main.kiln".to_owned(),
                    name: "<module>".to_owned(),
                    line: 4,
                },
                StackFrame {
                    filename: "main.kiln".to_owned(),
                    name: "f".to_owned(),
                    line: 2,
                },
            ],
        );
        assert_eq!(
            exc.to_string(),
            "Traceback (most recent call last):\n  File \"main.kiln\", line 4, in <module>\n  File \"main.kiln\", line 2, in f\nValueError: bad"
        );
    }

    #[test]
    fn summary_without_message() {
        assert_eq!(Exception::new(ExcType::StopIteration, None).summary(), "StopIteration");
    }
}
