//! Block stack unwinding: `try`/`except`/`finally`, loops and `with` statements.

mod common;

use common::{error_summary, ints, run};
use kiln::{ExcType, Object, StackFrame};
use pretty_assertions::assert_eq;

#[test]
fn return_in_finally_overrides_the_pending_return() {
    // def f():
    //     try:
    //         return 1
    //     finally:
    //         return 2
    let source = r#"{"code": [
        ["LOAD_CONST", {"code": {"name": "f", "code": [
            ["SETUP_FINALLY", "fin"],
            ["LOAD_CONST", 1], "RETURN_VALUE",
            "fin:",
            ["LOAD_CONST", 2], "RETURN_VALUE"
        ]}}],
        ["LOAD_CONST", "f"], ["MAKE_FUNCTION", 0], ["CALL_FUNCTION", 0],
        "RETURN_VALUE"
    ]}"#;
    assert_eq!(run(source).unwrap(), Object::Int(2));
}

/// ```text
/// def f():
///     try:
///         raise ValueError
///     except:
///         try:
///             raise KeyError
///         finally:
///             return 7
/// ```
const SWALLOWING_FINALLY: &str = r#"
    ["LOAD_CONST", {"code": {"name": "f", "code": [
        ["SETUP_EXCEPT", "h"],
        ["LOAD_GLOBAL", "ValueError"], ["RAISE_VARARGS", 1],
        "h:",
        "POP_TOP", "POP_TOP", "POP_TOP",
        ["SETUP_FINALLY", "fin"],
        ["LOAD_GLOBAL", "KeyError"], ["RAISE_VARARGS", 1],
        "fin:",
        ["LOAD_CONST", 7], "RETURN_VALUE"
    ]}}],
    ["LOAD_CONST", "f"], ["MAKE_FUNCTION", 0], ["CALL_FUNCTION", 0],
"#;

#[test]
fn return_in_finally_discards_the_exception_being_handled() {
    let returned = format!(r#"{{"code": [{SWALLOWING_FINALLY} "RETURN_VALUE"]}}"#);
    assert_eq!(run(&returned).unwrap(), Object::Int(7));

    // f(); raise
    let reraised = format!(r#"{{"code": [{SWALLOWING_FINALLY} "POP_TOP", ["RAISE_VARARGS", 0]]}}"#);
    assert_eq!(
        error_summary(run(&reraised)),
        "RuntimeError: No active exception to reraise"
    );
}

#[test]
fn finally_runs_before_the_function_returns() {
    let source = r#"{"code": [
        ["BUILD_LIST", 0], ["STORE_NAME", "log"],
        ["LOAD_CONST", {"code": {"name": "f", "code": [
            ["SETUP_FINALLY", "fin"],
            ["LOAD_CONST", "body"], "RETURN_VALUE",
            "fin:",
            ["LOAD_GLOBAL", "log"], ["LOAD_ATTR", "append"], ["LOAD_CONST", "fin"], ["CALL_FUNCTION", 1], "POP_TOP",
            "END_FINALLY",
            ["LOAD_CONST", null], "RETURN_VALUE"
        ]}}],
        ["LOAD_CONST", "f"], ["MAKE_FUNCTION", 0], ["CALL_FUNCTION", 0],
        ["LOAD_NAME", "log"],
        ["BUILD_TUPLE", 2],
        "RETURN_VALUE"
    ]}"#;
    assert_eq!(
        run(source).unwrap(),
        Object::Tuple(vec![
            Object::String("body".to_owned()),
            Object::List(vec![Object::String("fin".to_owned())]),
        ])
    );
}

#[test]
fn break_runs_enclosing_finally_then_leaves_the_loop() {
    // total = 0
    // for i in range(10):
    //     try:
    //         if i == 3:
    //             break
    //         total += i
    //     finally:
    //         total += 100
    let source = r#"{"code": [
        ["LOAD_CONST", 0], ["STORE_NAME", "total"],
        ["SETUP_LOOP", "after"],
        ["LOAD_NAME", "range"], ["LOAD_CONST", 10], ["CALL_FUNCTION", 1], "GET_ITER",
        "loop:",
        ["FOR_ITER", "exhausted"],
        ["STORE_NAME", "i"],
        ["SETUP_FINALLY", "fin"],
        ["LOAD_NAME", "i"], ["LOAD_CONST", 3], ["COMPARE_OP", "=="], ["POP_JUMP_IF_FALSE", "body"],
        "BREAK_LOOP",
        "body:",
        ["LOAD_NAME", "total"], ["LOAD_NAME", "i"], "INPLACE_ADD", ["STORE_NAME", "total"],
        "POP_BLOCK",
        ["LOAD_CONST", null],
        "fin:",
        ["LOAD_NAME", "total"], ["LOAD_CONST", 100], "INPLACE_ADD", ["STORE_NAME", "total"],
        "END_FINALLY",
        ["JUMP_ABSOLUTE", "loop"],
        "exhausted:",
        "POP_BLOCK",
        "after:",
        ["LOAD_NAME", "total"], "RETURN_VALUE"
    ]}"#;
    assert_eq!(run(source).unwrap(), Object::Int(403));
}

#[test]
fn continue_runs_enclosing_finally_then_resumes_the_loop() {
    // total = count = 0
    // for i in range(4):
    //     try:
    //         if i % 2:
    //             continue
    //         total += i
    //     finally:
    //         count += 1
    let source = r#"{"code": [
        ["LOAD_CONST", 0], ["STORE_NAME", "total"],
        ["LOAD_CONST", 0], ["STORE_NAME", "count"],
        ["SETUP_LOOP", "after"],
        ["LOAD_NAME", "range"], ["LOAD_CONST", 4], ["CALL_FUNCTION", 1], "GET_ITER",
        "loop:",
        ["FOR_ITER", "exhausted"],
        ["STORE_NAME", "i"],
        ["SETUP_FINALLY", "fin"],
        ["LOAD_NAME", "i"], ["LOAD_CONST", 2], "BINARY_MODULO", ["POP_JUMP_IF_FALSE", "body"],
        ["CONTINUE_LOOP", "loop"],
        "body:",
        ["LOAD_NAME", "total"], ["LOAD_NAME", "i"], "INPLACE_ADD", ["STORE_NAME", "total"],
        "POP_BLOCK",
        ["LOAD_CONST", null],
        "fin:",
        ["LOAD_NAME", "count"], ["LOAD_CONST", 1], "INPLACE_ADD", ["STORE_NAME", "count"],
        "END_FINALLY",
        ["JUMP_ABSOLUTE", "loop"],
        "exhausted:",
        "POP_BLOCK",
        "after:",
        ["LOAD_NAME", "total"], ["LOAD_NAME", "count"], ["BUILD_TUPLE", 2], "RETURN_VALUE"
    ]}"#;
    assert_eq!(run(source).unwrap(), ints(&[2, 4]));
}

#[test]
fn except_clause_matches_a_tuple_of_types() {
    // try:
    //     raise ValueError("bad")
    // except (TypeError, ValueError) as e:
    //     r = e.args
    let source = r#"{"code": [
        ["SETUP_EXCEPT", "handler"],
        ["LOAD_NAME", "ValueError"], ["LOAD_CONST", "bad"], ["CALL_FUNCTION", 1], ["RAISE_VARARGS", 1],
        "handler:",
        "DUP_TOP",
        ["LOAD_NAME", "TypeError"], ["LOAD_NAME", "ValueError"], ["BUILD_TUPLE", 2],
        ["COMPARE_OP", "exception match"], ["POP_JUMP_IF_FALSE", "reraise"],
        "POP_TOP", ["STORE_NAME", "e"], "POP_TOP",
        ["LOAD_NAME", "e"], ["LOAD_ATTR", "args"], ["STORE_NAME", "r"],
        "POP_EXCEPT",
        ["JUMP_FORWARD", "done"],
        "reraise:",
        "END_FINALLY",
        "done:",
        ["LOAD_NAME", "r"], "RETURN_VALUE"
    ]}"#;
    assert_eq!(
        run(source).unwrap(),
        Object::Tuple(vec![Object::String("bad".to_owned())])
    );
}

#[test]
fn unmatched_exception_is_reraised_by_end_finally() {
    let source = r#"{"code": [
        ["SETUP_EXCEPT", "handler"],
        ["LOAD_CONST", 1], ["LOAD_CONST", 0], "BINARY_TRUE_DIVIDE", "POP_TOP",
        "POP_BLOCK",
        ["JUMP_FORWARD", "done"],
        "handler:",
        "DUP_TOP", ["LOAD_NAME", "KeyError"], ["COMPARE_OP", "exception match"], ["POP_JUMP_IF_FALSE", "reraise"],
        "POP_TOP", "POP_TOP", "POP_TOP",
        "POP_EXCEPT",
        ["JUMP_FORWARD", "done"],
        "reraise:",
        "END_FINALLY",
        "done:",
        ["LOAD_CONST", null], "RETURN_VALUE"
    ]}"#;
    assert_eq!(error_summary(run(source)), "ZeroDivisionError: division by zero");
}

#[test]
fn catching_a_non_exception_is_a_type_error() {
    let source = r#"{"code": [
        ["SETUP_EXCEPT", "handler"],
        ["LOAD_NAME", "KeyError"], ["RAISE_VARARGS", 1],
        "handler:",
        "DUP_TOP", ["LOAD_CONST", 5], ["COMPARE_OP", "exception match"], ["POP_JUMP_IF_FALSE", "reraise"],
        "POP_TOP", "POP_TOP", "POP_TOP",
        "POP_EXCEPT",
        ["LOAD_CONST", null], "RETURN_VALUE",
        "reraise:",
        "END_FINALLY",
        ["LOAD_CONST", null], "RETURN_VALUE"
    ]}"#;
    assert_eq!(
        error_summary(run(source)),
        "TypeError: catching classes that do not inherit from BaseException is not allowed"
    );
}

#[test]
fn bare_raise_without_active_exception_fails() {
    let source = r#"{"code": [["RAISE_VARARGS", 0]]}"#;
    assert_eq!(
        error_summary(run(source)),
        "RuntimeError: No active exception to reraise"
    );
}

#[test]
fn raising_a_non_exception_is_a_type_error() {
    let source = r#"{"code": [["LOAD_CONST", 3], ["RAISE_VARARGS", 1]]}"#;
    assert_eq!(
        error_summary(run(source)),
        "TypeError: exceptions must derive from BaseException"
    );
}

#[test]
fn handler_state_is_restored_after_the_except_clause() {
    // try:
    //     raise KeyError
    // except KeyError:
    //     pass
    // raise          # nothing is being handled any more
    let source = r#"{"code": [
        ["SETUP_EXCEPT", "handler"],
        ["LOAD_NAME", "KeyError"], ["RAISE_VARARGS", 1],
        "handler:",
        "POP_TOP", "POP_TOP", "POP_TOP",
        "POP_EXCEPT",
        ["RAISE_VARARGS", 0]
    ]}"#;
    assert_eq!(
        error_summary(run(source)),
        "RuntimeError: No active exception to reraise"
    );
}

#[test]
fn traceback_lists_frames_outermost_first() {
    let source = r#"{"filename": "calc.py", "code": [
        {"line": 1},
        ["LOAD_CONST", {"code": {"name": "divide", "args": ["a", "b"], "filename": "calc.py", "first_line": 1, "code": [
            {"line": 2},
            ["LOAD_FAST", "a"], ["LOAD_FAST", "b"], "BINARY_FLOOR_DIVIDE", "RETURN_VALUE"
        ]}}],
        ["LOAD_CONST", "divide"], ["MAKE_FUNCTION", 0], ["STORE_NAME", "divide"],
        {"line": 4},
        ["LOAD_NAME", "divide"], ["LOAD_CONST", 1], ["LOAD_CONST", 0], ["CALL_FUNCTION", 2],
        "RETURN_VALUE"
    ]}"#;
    let err = run(source).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::ZeroDivisionError);
    assert_eq!(err.message(), Some("integer division or modulo by zero"));
    assert_eq!(
        err.traceback(),
        [
            StackFrame {
                filename: "calc.py".to_owned(),
                name: "<module>".to_owned(),
                line: 4,
            },
            StackFrame {
                filename: "calc.py".to_owned(),
                name: "divide".to_owned(),
                line: 2,
            },
        ]
    );
}

/// `with suppress(KeyError): <body>` followed by `return "after"`.
fn with_suppress(body: &str) -> String {
    format!(
        r#"{{"code": [
            ["LOAD_NAME", "suppress"], ["LOAD_NAME", "KeyError"], ["CALL_FUNCTION", 1],
            ["SETUP_WITH", "cleanup"],
            "POP_TOP",
            {body}
            "POP_BLOCK",
            ["LOAD_CONST", null],
            "cleanup:",
            "WITH_CLEANUP",
            "END_FINALLY",
            ["LOAD_CONST", "after"], "RETURN_VALUE"
        ]}}"#
    )
}

#[test]
fn with_suppress_silences_matching_exceptions() {
    let source = with_suppress(r#"["BUILD_MAP", 0], ["LOAD_CONST", "x"], "BINARY_SUBSCR", "POP_TOP","#);
    assert_eq!(run(&source).unwrap(), Object::String("after".to_owned()));
}

#[test]
fn with_suppress_lets_other_exceptions_through() {
    let source = with_suppress(r#"["LOAD_NAME", "ValueError"], ["LOAD_CONST", "nope"], ["CALL_FUNCTION", 1], ["RAISE_VARARGS", 1],"#);
    assert_eq!(error_summary(run(&source)), "ValueError: nope");
}

#[test]
fn with_body_completing_normally_calls_exit() {
    let source = with_suppress(r#"["LOAD_CONST", 1], "POP_TOP","#);
    assert_eq!(run(&source).unwrap(), Object::String("after".to_owned()));
}

#[test]
fn with_requires_a_context_manager() {
    let source = r#"{"code": [
        ["LOAD_CONST", 3],
        ["SETUP_WITH", "cleanup"],
        "POP_TOP",
        "POP_BLOCK",
        ["LOAD_CONST", null],
        "cleanup:",
        "WITH_CLEANUP",
        "END_FINALLY",
        ["LOAD_CONST", null], "RETURN_VALUE"
    ]}"#;
    assert_eq!(error_summary(run(source)), "AttributeError: __enter__");
}
