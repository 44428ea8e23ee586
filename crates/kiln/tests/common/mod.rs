//! Helpers shared by the integration tests.
#![allow(dead_code, reason = "each test binary uses a different subset")]

use kiln::{CollectStringPrint, Exception, Interpreter, NoLimitTracker, NoPrint, Object, Program};

/// Assembles a JSON assembly document, panicking with the assembler's message on failure.
pub fn program(source: &str) -> Program {
    Program::from_asm(source).unwrap_or_else(|err| panic!("bad assembly: {err}"))
}

pub fn run(source: &str) -> Result<Object, Exception> {
    run_program(&program(source))
}

pub fn run_program(program: &Program) -> Result<Object, Exception> {
    Interpreter::new().new_context().run(program, NoLimitTracker::new(), &mut NoPrint)
}

/// Runs with a small recursion limit so overflow tests stay shallow on the Rust stack.
pub fn run_with_limit(source: &str, limit: usize) -> Result<Object, Exception> {
    Interpreter::new()
        .new_context()
        .run(&program(source), NoLimitTracker::with_recursion_limit(limit), &mut NoPrint)
}

pub fn run_with_output(source: &str) -> (Result<Object, Exception>, String) {
    let mut print = CollectStringPrint::new();
    let result = Interpreter::new()
        .new_context()
        .run(&program(source), NoLimitTracker::new(), &mut print);
    (result, print.into_output())
}

/// `ExcType: message` of the exception a run raised.
pub fn error_summary(result: Result<Object, Exception>) -> String {
    match result {
        Ok(value) => panic!("expected an exception, got {value:?}"),
        Err(exc) => exc.summary(),
    }
}

pub fn ints(values: &[i64]) -> Object {
    Object::Tuple(values.iter().copied().map(Object::Int).collect())
}

/// Runs `f` on a thread with a generous stack, for tests that recurse deeply.
pub fn on_big_stack<R: Send + 'static>(f: impl FnOnce() -> R + Send + 'static) -> R {
    std::thread::Builder::new()
        .stack_size(256 << 20)
        .spawn(f)
        .expect("failed to spawn test thread")
        .join()
        .unwrap_or_else(|payload| std::panic::resume_unwind(payload))
}
