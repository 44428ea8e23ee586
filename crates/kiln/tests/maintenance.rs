//! Work done at maintenance checkpoints: pending calls, asynchronous exceptions and
//! handing the execution lock between contexts.

mod common;

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use common::{error_summary, program};
use kiln::{
    ExcType, Exception, Interpreter, InterpreterConfig, LimitedTracker, NoLimitTracker, NoPrint, Object,
    PendingCallError, ResourceLimits,
};
use pretty_assertions::assert_eq;

const SHORT: &str = r#"{"code": [["LOAD_CONST", 1], ["LOAD_CONST", 2], "BINARY_ADD", "RETURN_VALUE"]}"#;
const SPIN: &str = r#"{"code": ["spin:", ["JUMP_ABSOLUTE", "spin"]]}"#;

static FIFO_SEEN: Mutex<Vec<usize>> = Mutex::new(Vec::new());

fn record_fifo(arg: usize) -> Result<(), Exception> {
    FIFO_SEEN.lock().unwrap().push(arg);
    Ok(())
}

#[test]
fn pending_calls_run_in_fifo_order_at_the_first_checkpoint() {
    let interpreter = Interpreter::new();
    let mut context = interpreter.new_context();
    for arg in [1, 2, 3] {
        interpreter.add_pending_call(record_fifo, arg).unwrap();
    }
    assert_eq!(interpreter.pending_calls(), 3);

    let result = context.run(&program(SHORT), NoLimitTracker::new(), &mut NoPrint);
    assert_eq!(result.unwrap(), Object::Int(3));
    assert_eq!(*FIFO_SEEN.lock().unwrap(), vec![1, 2, 3]);
    assert_eq!(interpreter.pending_calls(), 0);
}

static AFTER_FAILURE: Mutex<Vec<usize>> = Mutex::new(Vec::new());

fn interrupt(_: usize) -> Result<(), Exception> {
    Err(Exception::new(ExcType::KeyboardInterrupt, None))
}

fn record_after_failure(arg: usize) -> Result<(), Exception> {
    AFTER_FAILURE.lock().unwrap().push(arg);
    Ok(())
}

#[test]
fn failing_pending_call_raises_and_leaves_the_rest_queued() {
    let interpreter = Interpreter::new();
    let mut context = interpreter.new_context();
    interpreter.add_pending_call(interrupt, 0).unwrap();
    interpreter.add_pending_call(record_after_failure, 7).unwrap();

    let program = program(SHORT);
    let first = context.run(&program, NoLimitTracker::new(), &mut NoPrint);
    assert_eq!(error_summary(first), "KeyboardInterrupt");
    assert_eq!(interpreter.pending_calls(), 1);
    assert!(AFTER_FAILURE.lock().unwrap().is_empty());

    let second = context.run(&program, NoLimitTracker::new(), &mut NoPrint);
    assert_eq!(second.unwrap(), Object::Int(3));
    assert_eq!(*AFTER_FAILURE.lock().unwrap(), vec![7]);
}

fn noop(_: usize) -> Result<(), Exception> {
    Ok(())
}

#[test]
fn full_queue_rejects_new_calls() {
    let interpreter = Interpreter::with_config(InterpreterConfig {
        pending_capacity: 2,
        ..InterpreterConfig::default()
    });
    interpreter.add_pending_call(noop, 1).unwrap();
    interpreter.add_pending_call(noop, 2).unwrap();
    assert_eq!(interpreter.add_pending_call(noop, 3), Err(PendingCallError::QueueFull));
    assert_eq!(interpreter.pending_calls(), 2);
}

#[test]
fn only_the_primary_context_runs_pending_calls() {
    let interpreter = Interpreter::new();
    let primary = interpreter.new_context();
    let mut secondary = interpreter.new_context();
    assert!(primary.is_primary());
    assert!(!secondary.is_primary());

    interpreter.add_pending_call(interrupt, 0).unwrap();
    let result = secondary.run(&program(SHORT), NoLimitTracker::new(), &mut NoPrint);
    assert_eq!(result.unwrap(), Object::Int(3));
    assert_eq!(interpreter.pending_calls(), 1);
}

#[test]
fn checkpoint_is_deferred_past_setup_finally() {
    // try:
    //     pass          # the interrupt lands here, inside the try
    // finally:
    //     mark()
    let source = r#"{"code": [
        ["SETUP_FINALLY", "fin"],
        ["LOAD_CONST", null], "POP_TOP",
        "POP_BLOCK",
        ["LOAD_CONST", null],
        "fin:",
        ["LOAD_NAME", "mark"], ["CALL_FUNCTION", 0], "POP_TOP",
        "END_FINALLY",
        ["LOAD_CONST", null], "RETURN_VALUE"
    ]}"#;
    let marked = Arc::new(AtomicBool::new(false));
    let mut program = program(source);
    let flag = Arc::clone(&marked);
    program.register_host_function("mark", move |_| {
        flag.store(true, Ordering::SeqCst);
        Ok(Object::None)
    });

    let interpreter = Interpreter::new();
    let mut context = interpreter.new_context();
    interpreter.add_pending_call(interrupt, 0).unwrap();
    let result = context.run(&program, NoLimitTracker::new(), &mut NoPrint);
    assert_eq!(error_summary(result), "KeyboardInterrupt");
    assert!(marked.load(Ordering::SeqCst), "finally block must run");
}

#[test]
fn async_exception_is_raised_at_the_next_checkpoint() {
    let interpreter = Interpreter::new();
    let mut context = interpreter.new_context();
    assert!(context.handle().raise_async(ExcType::SystemExit));
    let result = context.run(&program(SHORT), NoLimitTracker::new(), &mut NoPrint);
    assert_eq!(result.unwrap_err().exc_type(), ExcType::SystemExit);

    // delivered once only
    let again = context.run(&program(SHORT), NoLimitTracker::new(), &mut NoPrint);
    assert_eq!(again.unwrap(), Object::Int(3));
}

#[test]
fn async_exception_interrupts_a_running_loop() {
    let interpreter = Interpreter::new();
    let mut context = interpreter.new_context();
    let handle = context.handle();
    let runner = thread::spawn(move || context.run(&program(SPIN), NoLimitTracker::new(), &mut NoPrint));

    thread::sleep(Duration::from_millis(20));
    assert!(handle.raise_async(ExcType::KeyboardInterrupt));
    let result = runner.join().unwrap();
    assert_eq!(result.unwrap_err().exc_type(), ExcType::KeyboardInterrupt);
}

#[test]
fn handle_outliving_its_context_reports_failure() {
    let interpreter = Interpreter::new();
    let context = interpreter.new_context();
    let handle = context.handle();
    drop(context);
    assert!(!handle.raise_async(ExcType::KeyboardInterrupt));
}

#[test]
fn waiting_context_gets_the_lock_from_a_busy_one() {
    // context A spins until context B has run; B can only run if A hands over the lock
    let spinner = r#"{"code": [
        "spin:",
        ["LOAD_NAME", "finished"], ["CALL_FUNCTION", 0], ["POP_JUMP_IF_FALSE", "spin"],
        ["LOAD_CONST", "a"], "RETURN_VALUE"
    ]}"#;
    let finisher = r#"{"code": [["LOAD_NAME", "finish"], ["CALL_FUNCTION", 0], "POP_TOP", ["LOAD_CONST", "b"], "RETURN_VALUE"]}"#;

    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));

    let mut spin_program = program(spinner);
    let (started_flag, finished_flag) = (Arc::clone(&started), Arc::clone(&finished));
    spin_program.register_host_function("finished", move |_| {
        started_flag.store(true, Ordering::SeqCst);
        Ok(Object::Bool(finished_flag.load(Ordering::SeqCst)))
    });
    let mut finish_program = program(finisher);
    let finished_flag = Arc::clone(&finished);
    finish_program.register_host_function("finish", move |_| {
        finished_flag.store(true, Ordering::SeqCst);
        Ok(Object::None)
    });

    let interpreter = Interpreter::with_config(InterpreterConfig {
        switch_interval: Duration::from_millis(1),
        ..InterpreterConfig::default()
    });
    let mut a = interpreter.new_context();
    let mut b = interpreter.new_context();

    let spinner = thread::spawn(move || {
        // bounded so a broken hand-off fails instead of hanging
        let tracker = LimitedTracker::new(ResourceLimits::new().max_operations(50_000_000));
        a.run(&spin_program, tracker, &mut NoPrint)
    });
    while !started.load(Ordering::SeqCst) {
        thread::yield_now();
    }
    let finisher = thread::spawn(move || b.run(&finish_program, NoLimitTracker::new(), &mut NoPrint));

    assert_eq!(finisher.join().unwrap().unwrap(), Object::String("b".to_owned()));
    assert_eq!(spinner.join().unwrap().unwrap(), Object::String("a".to_owned()));
}
