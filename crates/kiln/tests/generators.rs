//! Generators: `send`, `throw`, `close`, `yield from` and their exception state.

mod common;

use common::{error_summary, ints, run};
use kiln::Object;
use pretty_assertions::assert_eq;

#[test]
fn send_delivers_values_and_return_becomes_stop_iteration_value() {
    // def gen():
    //     x = yield 1
    //     y = yield x * 10
    //     return y + 5
    let source = r#"{"code": [
        ["LOAD_CONST", {"code": {"name": "gen", "generator": true, "code": [
            ["LOAD_CONST", 1], "YIELD_VALUE", ["STORE_FAST", "x"],
            ["LOAD_FAST", "x"], ["LOAD_CONST", 10], "BINARY_MULTIPLY", "YIELD_VALUE", ["STORE_FAST", "y"],
            ["LOAD_FAST", "y"], ["LOAD_CONST", 5], "BINARY_ADD", "RETURN_VALUE"
        ]}}],
        ["LOAD_CONST", "gen"], ["MAKE_FUNCTION", 0], ["CALL_FUNCTION", 0], ["STORE_NAME", "g"],
        ["LOAD_NAME", "next"], ["LOAD_NAME", "g"], ["CALL_FUNCTION", 1], ["STORE_NAME", "a"],
        ["LOAD_NAME", "g"], ["LOAD_ATTR", "send"], ["LOAD_CONST", 1], ["CALL_FUNCTION", 1], ["STORE_NAME", "b"],
        ["SETUP_EXCEPT", "handler"],
        ["LOAD_NAME", "g"], ["LOAD_ATTR", "send"], ["LOAD_CONST", 2], ["CALL_FUNCTION", 1], "POP_TOP",
        "POP_BLOCK",
        ["JUMP_FORWARD", "done"],
        "handler:",
        "DUP_TOP", ["LOAD_NAME", "StopIteration"], ["COMPARE_OP", "exception match"], ["POP_JUMP_IF_FALSE", "reraise"],
        "POP_TOP", ["STORE_NAME", "e"], "POP_TOP",
        ["LOAD_NAME", "e"], ["LOAD_ATTR", "value"], ["STORE_NAME", "c"],
        "POP_EXCEPT",
        ["JUMP_FORWARD", "done"],
        "reraise:",
        "END_FINALLY",
        "done:",
        ["LOAD_NAME", "a"], ["LOAD_NAME", "b"], ["LOAD_NAME", "c"], ["BUILD_TUPLE", 3],
        "RETURN_VALUE"
    ]}"#;
    assert_eq!(run(source).unwrap(), ints(&[1, 10, 7]));
}

#[test]
fn sent_values_update_a_cell_across_suspensions() {
    // def gen():
    //     n = 0
    //     def bump(v):
    //         nonlocal n
    //         n += v
    //     while True:
    //         bump((yield n))
    // g = gen()
    // return (next(g), g.send(5), g.send(10), g.send(20))
    let source = r#"{"code": [
        ["LOAD_CONST", {"code": {"name": "gen", "generator": true, "cellvars": ["n"], "code": [
            ["LOAD_CONST", 0], ["STORE_DEREF", "n"],
            ["LOAD_CLOSURE", "n"], ["BUILD_TUPLE", 1],
            ["LOAD_CONST", {"code": {"name": "bump", "args": ["v"], "freevars": ["n"], "code": [
                ["LOAD_DEREF", "n"], ["LOAD_FAST", "v"], "BINARY_ADD", ["STORE_DEREF", "n"],
                ["LOAD_CONST", null], "RETURN_VALUE"
            ]}}],
            ["LOAD_CONST", "gen.<locals>.bump"], ["MAKE_CLOSURE", 0], ["STORE_FAST", "bump"],
            "top:",
            ["LOAD_FAST", "bump"], ["LOAD_DEREF", "n"], "YIELD_VALUE", ["CALL_FUNCTION", 1], "POP_TOP",
            ["JUMP_ABSOLUTE", "top"]
        ]}}],
        ["LOAD_CONST", "gen"], ["MAKE_FUNCTION", 0], ["CALL_FUNCTION", 0], ["STORE_NAME", "g"],
        ["LOAD_NAME", "next"], ["LOAD_NAME", "g"], ["CALL_FUNCTION", 1],
        ["LOAD_NAME", "g"], ["LOAD_ATTR", "send"], ["LOAD_CONST", 5], ["CALL_FUNCTION", 1],
        ["LOAD_NAME", "g"], ["LOAD_ATTR", "send"], ["LOAD_CONST", 10], ["CALL_FUNCTION", 1],
        ["LOAD_NAME", "g"], ["LOAD_ATTR", "send"], ["LOAD_CONST", 20], ["CALL_FUNCTION", 1],
        ["BUILD_TUPLE", 4],
        "RETURN_VALUE"
    ]}"#;
    assert_eq!(run(source).unwrap(), ints(&[0, 5, 15, 35]));
}

#[test]
fn generators_drive_for_loops_and_list() {
    // def count(n):
    //     i = 0
    //     while i < n:
    //         yield i
    //         i += 1
    let count = r#"["LOAD_CONST", {"code": {"name": "count", "args": ["n"], "generator": true, "code": [
            ["LOAD_CONST", 0], ["STORE_FAST", "i"],
            "top:",
            ["LOAD_FAST", "i"], ["LOAD_FAST", "n"], ["COMPARE_OP", "<"], ["POP_JUMP_IF_FALSE", "end"],
            ["LOAD_FAST", "i"], "YIELD_VALUE", "POP_TOP",
            ["LOAD_FAST", "i"], ["LOAD_CONST", 1], "INPLACE_ADD", ["STORE_FAST", "i"],
            ["JUMP_ABSOLUTE", "top"],
            "end:",
            ["LOAD_CONST", null], "RETURN_VALUE"
        ]}}],
        ["LOAD_CONST", "count"], ["MAKE_FUNCTION", 0], ["STORE_NAME", "count"],"#;

    let listed = format!(
        r#"{{"code": [{count}
            ["LOAD_NAME", "list"], ["LOAD_NAME", "count"], ["LOAD_CONST", 4], ["CALL_FUNCTION", 1], ["CALL_FUNCTION", 1],
            "RETURN_VALUE"
        ]}}"#
    );
    assert_eq!(
        run(&listed).unwrap(),
        Object::List(vec![Object::Int(0), Object::Int(1), Object::Int(2), Object::Int(3)])
    );

    let summed = format!(
        r#"{{"code": [{count}
            ["LOAD_CONST", 0], ["STORE_NAME", "total"],
            ["SETUP_LOOP", "after"],
            ["LOAD_NAME", "count"], ["LOAD_CONST", 5], ["CALL_FUNCTION", 1], "GET_ITER",
            "loop:",
            ["FOR_ITER", "exhausted"],
            ["STORE_NAME", "x"],
            ["LOAD_NAME", "total"], ["LOAD_NAME", "x"], "INPLACE_ADD", ["STORE_NAME", "total"],
            ["JUMP_ABSOLUTE", "loop"],
            "exhausted:",
            "POP_BLOCK",
            "after:",
            ["LOAD_NAME", "total"], "RETURN_VALUE"
        ]}}"#
    );
    assert_eq!(run(&summed).unwrap(), Object::Int(10));
}

#[test]
fn throw_is_handled_inside_the_generator() {
    // def gen():
    //     try:
    //         yield 1
    //     except ValueError:
    //         yield 2
    let source = r#"{"code": [
        ["LOAD_CONST", {"code": {"name": "gen", "generator": true, "code": [
            ["SETUP_EXCEPT", "h"],
            ["LOAD_CONST", 1], "YIELD_VALUE", "POP_TOP",
            "POP_BLOCK",
            ["JUMP_FORWARD", "done"],
            "h:",
            "DUP_TOP", ["LOAD_GLOBAL", "ValueError"], ["COMPARE_OP", "exception match"], ["POP_JUMP_IF_FALSE", "re"],
            "POP_TOP", "POP_TOP", "POP_TOP",
            ["LOAD_CONST", 2], "YIELD_VALUE", "POP_TOP",
            "POP_EXCEPT",
            ["JUMP_FORWARD", "done"],
            "re:",
            "END_FINALLY",
            "done:",
            ["LOAD_CONST", null], "RETURN_VALUE"
        ]}}],
        ["LOAD_CONST", "gen"], ["MAKE_FUNCTION", 0], ["CALL_FUNCTION", 0], ["STORE_NAME", "g"],
        ["LOAD_NAME", "next"], ["LOAD_NAME", "g"], ["CALL_FUNCTION", 1],
        ["LOAD_NAME", "g"], ["LOAD_ATTR", "throw"], ["LOAD_NAME", "ValueError"], ["CALL_FUNCTION", 1],
        ["LOAD_NAME", "g"], ["LOAD_ATTR", "close"], ["CALL_FUNCTION", 0],
        ["BUILD_TUPLE", 3],
        "RETURN_VALUE"
    ]}"#;
    assert_eq!(
        run(source).unwrap(),
        Object::Tuple(vec![Object::Int(1), Object::Int(2), Object::None])
    );
}

#[test]
fn uncaught_throw_propagates_to_the_caller() {
    let source = r#"{"code": [
        ["LOAD_CONST", {"code": {"name": "gen", "generator": true, "code": [
            ["LOAD_CONST", 1], "YIELD_VALUE", "POP_TOP",
            ["LOAD_CONST", null], "RETURN_VALUE"
        ]}}],
        ["LOAD_CONST", "gen"], ["MAKE_FUNCTION", 0], ["CALL_FUNCTION", 0], ["STORE_NAME", "g"],
        ["LOAD_NAME", "next"], ["LOAD_NAME", "g"], ["CALL_FUNCTION", 1], "POP_TOP",
        ["LOAD_NAME", "g"], ["LOAD_ATTR", "throw"], ["LOAD_NAME", "KeyError"], ["LOAD_CONST", "lost"], ["CALL_FUNCTION", 2],
        "RETURN_VALUE"
    ]}"#;
    let err = run(source).unwrap_err();
    assert_eq!(err.exc_type(), kiln::ExcType::KeyError);
    assert_eq!(err.message(), Some("lost"));
}

#[test]
fn close_runs_finally_blocks() {
    // def gen():
    //     try:
    //         yield 1
    //     finally:
    //         log.append("closed")
    let source = r#"{"code": [
        ["BUILD_LIST", 0], ["STORE_NAME", "log"],
        ["LOAD_CONST", {"code": {"name": "gen", "generator": true, "code": [
            ["SETUP_FINALLY", "fin"],
            ["LOAD_CONST", 1], "YIELD_VALUE", "POP_TOP",
            "POP_BLOCK",
            ["LOAD_CONST", null],
            "fin:",
            ["LOAD_GLOBAL", "log"], ["LOAD_ATTR", "append"], ["LOAD_CONST", "closed"], ["CALL_FUNCTION", 1], "POP_TOP",
            "END_FINALLY",
            ["LOAD_CONST", null], "RETURN_VALUE"
        ]}}],
        ["LOAD_CONST", "gen"], ["MAKE_FUNCTION", 0], ["CALL_FUNCTION", 0], ["STORE_NAME", "g"],
        ["LOAD_NAME", "next"], ["LOAD_NAME", "g"], ["CALL_FUNCTION", 1], "POP_TOP",
        ["LOAD_NAME", "g"], ["LOAD_ATTR", "close"], ["CALL_FUNCTION", 0], "POP_TOP",
        ["LOAD_NAME", "g"], ["LOAD_ATTR", "close"], ["CALL_FUNCTION", 0], "POP_TOP",
        ["LOAD_NAME", "log"],
        "RETURN_VALUE"
    ]}"#;
    assert_eq!(
        run(source).unwrap(),
        Object::List(vec![Object::String("closed".to_owned())])
    );
}

#[test]
fn ignoring_generator_exit_is_an_error() {
    // def gen():
    //     try:
    //         yield 1
    //     except:
    //         pass
    //     yield 2
    let source = r#"{"code": [
        ["LOAD_CONST", {"code": {"name": "gen", "generator": true, "code": [
            ["SETUP_EXCEPT", "h"],
            ["LOAD_CONST", 1], "YIELD_VALUE", "POP_TOP",
            "POP_BLOCK",
            ["JUMP_FORWARD", "done"],
            "h:",
            "POP_TOP", "POP_TOP", "POP_TOP",
            "POP_EXCEPT",
            "done:",
            ["LOAD_CONST", 2], "YIELD_VALUE", "POP_TOP",
            ["LOAD_CONST", null], "RETURN_VALUE"
        ]}}],
        ["LOAD_CONST", "gen"], ["MAKE_FUNCTION", 0], ["CALL_FUNCTION", 0], ["STORE_NAME", "g"],
        ["LOAD_NAME", "next"], ["LOAD_NAME", "g"], ["CALL_FUNCTION", 1], "POP_TOP",
        ["LOAD_NAME", "g"], ["LOAD_ATTR", "close"], ["CALL_FUNCTION", 0],
        "RETURN_VALUE"
    ]}"#;
    assert_eq!(
        error_summary(run(source)),
        "RuntimeError: generator ignored GeneratorExit"
    );
}

#[test]
fn sending_a_value_to_a_fresh_generator_is_rejected() {
    let source = r#"{"code": [
        ["LOAD_CONST", {"code": {"name": "gen", "generator": true, "code": [
            ["LOAD_CONST", 1], "YIELD_VALUE", "RETURN_VALUE"
        ]}}],
        ["LOAD_CONST", "gen"], ["MAKE_FUNCTION", 0], ["CALL_FUNCTION", 0],
        ["LOAD_ATTR", "send"], ["LOAD_CONST", 3], ["CALL_FUNCTION", 1],
        "RETURN_VALUE"
    ]}"#;
    assert_eq!(
        error_summary(run(source)),
        "TypeError: can't send non-None value to a just-started generator"
    );
}

#[test]
fn resuming_a_running_generator_fails() {
    // def gen():
    //     yield next(g)
    let source = r#"{"code": [
        ["LOAD_CONST", {"code": {"name": "gen", "generator": true, "code": [
            ["LOAD_GLOBAL", "next"], ["LOAD_GLOBAL", "g"], ["CALL_FUNCTION", 1],
            "YIELD_VALUE", "POP_TOP",
            ["LOAD_CONST", null], "RETURN_VALUE"
        ]}}],
        ["LOAD_CONST", "gen"], ["MAKE_FUNCTION", 0], ["CALL_FUNCTION", 0], ["STORE_NAME", "g"],
        ["LOAD_NAME", "next"], ["LOAD_NAME", "g"], ["CALL_FUNCTION", 1],
        "RETURN_VALUE"
    ]}"#;
    assert_eq!(error_summary(run(source)), "ValueError: generator already executing");
}

#[test]
fn exhausted_generator_raises_stop_iteration() {
    let source = r#"{"code": [
        ["LOAD_CONST", {"code": {"name": "gen", "generator": true, "code": [
            ["LOAD_CONST", null], "RETURN_VALUE"
        ]}}],
        ["LOAD_CONST", "gen"], ["MAKE_FUNCTION", 0], ["CALL_FUNCTION", 0], ["STORE_NAME", "g"],
        ["LOAD_NAME", "next"], ["LOAD_NAME", "g"], ["CALL_FUNCTION", 1],
        "RETURN_VALUE"
    ]}"#;
    assert_eq!(run(source).unwrap_err().exc_type(), kiln::ExcType::StopIteration);
}

/// `def inner(): a = yield 1; yield a; return 100`, with `outer` delegating to it.
const DELEGATION: &str = r#"
    ["LOAD_CONST", {"code": {"name": "inner", "generator": true, "code": [
        ["SETUP_EXCEPT", "h"],
        ["LOAD_CONST", 1], "YIELD_VALUE", ["STORE_FAST", "a"],
        "POP_BLOCK",
        ["LOAD_FAST", "a"], "YIELD_VALUE", "POP_TOP",
        ["LOAD_CONST", 100], "RETURN_VALUE",
        "h:",
        "POP_TOP", "POP_TOP", "POP_TOP",
        "POP_EXCEPT",
        ["LOAD_CONST", "caught"], "YIELD_VALUE", "POP_TOP",
        ["LOAD_CONST", -1], "RETURN_VALUE"
    ]}}],
    ["LOAD_CONST", "inner"], ["MAKE_FUNCTION", 0], ["STORE_NAME", "inner"],
    ["LOAD_CONST", {"code": {"name": "outer", "generator": true, "code": [
        ["LOAD_GLOBAL", "inner"], ["CALL_FUNCTION", 0], "GET_ITER", ["LOAD_CONST", null], "YIELD_FROM",
        ["STORE_FAST", "r"],
        ["LOAD_FAST", "r"], "YIELD_VALUE", "POP_TOP",
        ["LOAD_CONST", null], "RETURN_VALUE"
    ]}}],
    ["LOAD_CONST", "outer"], ["MAKE_FUNCTION", 0], ["CALL_FUNCTION", 0], ["STORE_NAME", "g"],
"#;

#[test]
fn yield_from_forwards_sends_and_returns_the_result() {
    let source = format!(
        r#"{{"code": [{DELEGATION}
            ["LOAD_NAME", "next"], ["LOAD_NAME", "g"], ["CALL_FUNCTION", 1],
            ["LOAD_NAME", "g"], ["LOAD_ATTR", "send"], ["LOAD_CONST", 42], ["CALL_FUNCTION", 1],
            ["LOAD_NAME", "next"], ["LOAD_NAME", "g"], ["CALL_FUNCTION", 1],
            ["BUILD_TUPLE", 3],
            "RETURN_VALUE"
        ]}}"#
    );
    assert_eq!(run(&source).unwrap(), ints(&[1, 42, 100]));
}

#[test]
fn yield_from_forwards_throw_to_the_delegate() {
    let source = format!(
        r#"{{"code": [{DELEGATION}
            ["LOAD_NAME", "next"], ["LOAD_NAME", "g"], ["CALL_FUNCTION", 1], "POP_TOP",
            ["LOAD_NAME", "g"], ["LOAD_ATTR", "throw"], ["LOAD_NAME", "ValueError"], ["CALL_FUNCTION", 1],
            ["LOAD_NAME", "next"], ["LOAD_NAME", "g"], ["CALL_FUNCTION", 1],
            ["BUILD_TUPLE", 2],
            "RETURN_VALUE"
        ]}}"#
    );
    assert_eq!(
        run(&source).unwrap(),
        Object::Tuple(vec![Object::String("caught".to_owned()), Object::Int(-1)])
    );
}

#[test]
fn handled_exception_survives_a_suspension() {
    // def gen():
    //     try:
    //         raise ValueError("boom")
    //     except ValueError:
    //         yield 1
    //         raise
    let source = r#"{"code": [
        ["LOAD_CONST", {"code": {"name": "gen", "generator": true, "code": [
            ["SETUP_EXCEPT", "h"],
            ["LOAD_GLOBAL", "ValueError"], ["LOAD_CONST", "boom"], ["CALL_FUNCTION", 1], ["RAISE_VARARGS", 1],
            "h:",
            "POP_TOP", "POP_TOP", "POP_TOP",
            ["LOAD_CONST", 1], "YIELD_VALUE", "POP_TOP",
            ["RAISE_VARARGS", 0]
        ]}}],
        ["LOAD_CONST", "gen"], ["MAKE_FUNCTION", 0], ["CALL_FUNCTION", 0], ["STORE_NAME", "g"],
        ["LOAD_NAME", "next"], ["LOAD_NAME", "g"], ["CALL_FUNCTION", 1], "POP_TOP",
        ["LOAD_NAME", "next"], ["LOAD_NAME", "g"], ["CALL_FUNCTION", 1],
        "RETURN_VALUE"
    ]}"#;
    assert_eq!(error_summary(run(source)), "ValueError: boom");
}
