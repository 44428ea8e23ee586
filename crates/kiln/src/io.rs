//! Where `print()` output goes.

use std::io::{self, Write as _};

use crate::exception_public::Exception;

/// Receives the output of `print()` calls.
///
/// Each call hands over one complete `print()`: the arguments already joined by `sep`,
/// then the `end` string. A failed write is raised inside the program as the error returned.
pub trait PrintWriter {
    fn print(&mut self, text: &str, end: &str) -> Result<(), Exception>;
}

/// Writes to the process's stdout, flushing after every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdPrint;

impl PrintWriter for StdPrint {
    fn print(&mut self, text: &str, end: &str) -> Result<(), Exception> {
        let mut stdout = io::stdout().lock();
        stdout
            .write_all(text.as_bytes())
            .and_then(|()| stdout.write_all(end.as_bytes()))
            .and_then(|()| stdout.flush())
            .map_err(|err| Exception::runtime_error(format!("print failed: {err}")))
    }
}

/// Collects output in memory.
#[derive(Debug, Default)]
pub struct CollectStringPrint(String);

impl CollectStringPrint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn output(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_output(self) -> String {
        self.0
    }
}

impl PrintWriter for CollectStringPrint {
    fn print(&mut self, text: &str, end: &str) -> Result<(), Exception> {
        self.0.push_str(text);
        self.0.push_str(end);
        Ok(())
    }
}

/// Discards output.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn print(&mut self, _text: &str, _end: &str) -> Result<(), Exception> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collected_output_keeps_ends() {
        let mut print = CollectStringPrint::new();
        print.print("a b", "\n").unwrap();
        print.print("c", "").unwrap();
        assert_eq!(print.output(), "a b\nc");
    }
}
