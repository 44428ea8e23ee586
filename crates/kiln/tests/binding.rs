//! Binding call arguments to parameters: defaults, keyword-only parameters,
//! `*args`/`**kwargs` and the errors reported for bad calls.

mod common;

use common::{error_summary, ints, run, run_program};
use kiln::{CodeBuilder, ConstValue, Object, Opcode, Program};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

/// Module defining `def f(a, b, c=3, *, d, e=5): return (a, b, c, d, e)` and then
/// evaluating `call` against it.
fn with_f(call: &str) -> String {
    let def = r#"{"code": [
        ["LOAD_CONST", 3],
        ["LOAD_CONST", "e"], ["LOAD_CONST", 5],
        ["LOAD_CONST", {"code": {"name": "f", "args": ["a", "b", "c"], "kwonly": ["d", "e"], "code": [
            ["LOAD_FAST", "a"], ["LOAD_FAST", "b"], ["LOAD_FAST", "c"], ["LOAD_FAST", "d"], ["LOAD_FAST", "e"],
            ["BUILD_TUPLE", 5],
            "RETURN_VALUE"
        ]}}],
        ["LOAD_CONST", "f"],
        ["MAKE_FUNCTION", 257],
        ["STORE_NAME", "f"],
        ["LOAD_NAME", "f"],
    "#;
    format!("{def}{call}, \"RETURN_VALUE\"]}}")
}

#[test]
fn defaults_fill_missing_parameters() {
    let source = with_f(r#"["LOAD_CONST", 1], ["LOAD_CONST", 2], ["LOAD_CONST", "d"], ["LOAD_CONST", 4], ["CALL_FUNCTION", 258]"#);
    assert_eq!(run(&source).unwrap(), ints(&[1, 2, 3, 4, 5]));
}

#[test]
fn explicit_arguments_override_defaults() {
    let source = with_f(
        r#"["LOAD_CONST", 1], ["LOAD_CONST", 2], ["LOAD_CONST", 30],
           ["LOAD_CONST", "d"], ["LOAD_CONST", 4], ["LOAD_CONST", "e"], ["LOAD_CONST", 50],
           ["CALL_FUNCTION", 515]"#,
    );
    assert_eq!(run(&source).unwrap(), ints(&[1, 2, 30, 4, 50]));
}

#[test]
fn positional_parameters_accept_keywords() {
    let source = with_f(
        r#"["LOAD_CONST", "b"], ["LOAD_CONST", 2], ["LOAD_CONST", "a"], ["LOAD_CONST", 1],
           ["LOAD_CONST", "d"], ["LOAD_CONST", 4],
           ["CALL_FUNCTION", 768]"#,
    );
    assert_eq!(run(&source).unwrap(), ints(&[1, 2, 3, 4, 5]));
}

#[test]
fn missing_positional_is_named() {
    let source = with_f(r#"["LOAD_CONST", 1], ["CALL_FUNCTION", 1]"#);
    assert_eq!(
        error_summary(run(&source)),
        "TypeError: f() missing 1 required positional argument: 'b'"
    );
}

#[test]
fn every_missing_positional_is_reported_at_once() {
    let source = with_f(r#"["CALL_FUNCTION", 0]"#);
    assert_eq!(
        error_summary(run(&source)),
        "TypeError: f() missing 2 required positional arguments: 'a' and 'b'"
    );
}

#[test]
fn missing_keyword_only_is_named() {
    let source = with_f(r#"["LOAD_CONST", 1], ["LOAD_CONST", 2], ["CALL_FUNCTION", 2]"#);
    assert_eq!(
        error_summary(run(&source)),
        "TypeError: f() missing 1 required keyword-only argument: 'd'"
    );
}

#[test]
fn too_many_positional_reports_the_accepted_range() {
    let source = with_f(
        r#"["LOAD_CONST", 1], ["LOAD_CONST", 2], ["LOAD_CONST", 3], ["LOAD_CONST", 4], ["CALL_FUNCTION", 4]"#,
    );
    assert_eq!(
        error_summary(run(&source)),
        "TypeError: f() takes from 2 to 3 positional arguments but 4 were given"
    );
}

#[test]
fn too_many_positional_mentions_keyword_only_arguments() {
    let source = with_f(
        r#"["LOAD_CONST", 1], ["LOAD_CONST", 2], ["LOAD_CONST", 3], ["LOAD_CONST", 4],
           ["LOAD_CONST", "d"], ["LOAD_CONST", 1],
           ["CALL_FUNCTION", 260]"#,
    );
    assert_eq!(
        error_summary(run(&source)),
        "TypeError: f() takes from 2 to 3 positional arguments but 4 positional arguments \
         (and 1 keyword-only argument) were given"
    );
}

#[test]
fn keyword_for_filled_parameter_is_a_duplicate() {
    let source = with_f(
        r#"["LOAD_CONST", 1], ["LOAD_CONST", 2], ["LOAD_CONST", "a"], ["LOAD_CONST", 5],
           ["LOAD_CONST", "d"], ["LOAD_CONST", 4],
           ["CALL_FUNCTION", 514]"#,
    );
    assert_eq!(
        error_summary(run(&source)),
        "TypeError: f() got multiple values for argument 'a'"
    );
}

#[test]
fn unknown_keyword_is_rejected() {
    let source = with_f(
        r#"["LOAD_CONST", 1], ["LOAD_CONST", 2], ["LOAD_CONST", "d"], ["LOAD_CONST", 4],
           ["LOAD_CONST", "z"], ["LOAD_CONST", 0],
           ["CALL_FUNCTION", 514]"#,
    );
    assert_eq!(
        error_summary(run(&source)),
        "TypeError: f() got an unexpected keyword argument 'z'"
    );
}

/// Module defining `def g(a, *rest, **extra): return (a, rest, extra)`.
fn with_g(call: &str) -> String {
    let def = r#"{"code": [
        ["LOAD_CONST", {"code": {"name": "g", "args": ["a"], "varargs": "rest", "varkw": "extra", "code": [
            ["LOAD_FAST", "a"], ["LOAD_FAST", "rest"], ["LOAD_FAST", "extra"],
            ["BUILD_TUPLE", 3],
            "RETURN_VALUE"
        ]}}],
        ["LOAD_CONST", "g"],
        ["MAKE_FUNCTION", 0],
        ["STORE_NAME", "g"],
        ["LOAD_NAME", "g"],
    "#;
    format!("{def}{call}, \"RETURN_VALUE\"]}}")
}

#[test]
fn extra_arguments_are_collected() {
    let source = with_g(
        r#"["LOAD_CONST", 1], ["LOAD_CONST", 2], ["LOAD_CONST", 3],
           ["LOAD_CONST", "x"], ["LOAD_CONST", 4],
           ["CALL_FUNCTION", 259]"#,
    );
    assert_eq!(
        run(&source).unwrap(),
        Object::Tuple(vec![
            Object::Int(1),
            ints(&[2, 3]),
            Object::Dict(vec![(Object::String("x".to_owned()), Object::Int(4))]),
        ])
    );
}

#[test]
fn surplus_positionals_follow_the_named_parameters_into_varargs() {
    // def h(a, b, *rest): return (a, b, rest)
    // h(1, 2, 3, 4)
    let source = r#"{"code": [
        ["LOAD_CONST", {"code": {"name": "h", "args": ["a", "b"], "varargs": "rest", "code": [
            ["LOAD_FAST", "a"], ["LOAD_FAST", "b"], ["LOAD_FAST", "rest"], ["BUILD_TUPLE", 3], "RETURN_VALUE"
        ]}}],
        ["LOAD_CONST", "h"], ["MAKE_FUNCTION", 0],
        ["LOAD_CONST", 1], ["LOAD_CONST", 2], ["LOAD_CONST", 3], ["LOAD_CONST", 4], ["CALL_FUNCTION", 4],
        "RETURN_VALUE"
    ]}"#;
    assert_eq!(
        run(source).unwrap(),
        Object::Tuple(vec![Object::Int(1), Object::Int(2), ints(&[3, 4])])
    );
}

#[test]
fn star_and_double_star_arguments_are_expanded() {
    let source = with_g(
        r#"["LOAD_CONST", 1], ["LOAD_CONST", 2], ["BUILD_LIST", 2],
           ["BUILD_MAP", 1], ["LOAD_CONST", 3], ["LOAD_CONST", "y"], "STORE_MAP",
           ["CALL_FUNCTION_VAR_KW", 0]"#,
    );
    assert_eq!(
        run(&source).unwrap(),
        Object::Tuple(vec![
            Object::Int(1),
            ints(&[2]),
            Object::Dict(vec![(Object::String("y".to_owned()), Object::Int(3))]),
        ])
    );
}

#[test]
fn star_argument_must_be_iterable() {
    let source = with_g(r#"["LOAD_CONST", 5], ["CALL_FUNCTION_VAR", 0]"#);
    assert_eq!(
        error_summary(run(&source)),
        "TypeError: g() argument after * must be a sequence, not int"
    );
}

#[test]
fn double_star_argument_must_be_a_mapping() {
    let source = with_g(r#"["LOAD_CONST", 1], ["LOAD_CONST", 5], ["CALL_FUNCTION_KW", 1]"#);
    assert_eq!(
        error_summary(run(&source)),
        "TypeError: g() argument after ** must be a mapping, not int"
    );
}

#[test]
fn extra_keywords_without_varkw_are_unexpected() {
    let source = r#"{"code": [
        ["LOAD_CONST", {"code": {"name": "h", "args": ["a"], "code": [["LOAD_FAST", "a"], "RETURN_VALUE"]}}],
        ["LOAD_CONST", "h"],
        ["MAKE_FUNCTION", 0],
        ["LOAD_CONST", "b"], ["LOAD_CONST", 1],
        ["CALL_FUNCTION", 256],
        "RETURN_VALUE"
    ]}"#;
    assert_eq!(
        error_summary(run(source)),
        "TypeError: h() got an unexpected keyword argument 'b'"
    );
}

/// `h(a, b, c)` called with the first `split` arguments positionally and the rest by keyword.
fn split_call(values: [i64; 3], split: usize) -> Program {
    let names = ["a", "b", "c"];
    let mut h = CodeBuilder::function("h", &names);
    h.load_fast("a")
        .load_fast("b")
        .load_fast("c")
        .emit_arg(Opcode::BuildTuple, 3)
        .emit(Opcode::ReturnValue);

    let mut module = CodeBuilder::new("<module>");
    module
        .load_const(ConstValue::from(h))
        .load_const("h")
        .emit_arg(Opcode::MakeFunction, 0);
    for value in &values[..split] {
        module.load_const(*value);
    }
    for (name, value) in names.iter().zip(&values).skip(split) {
        module.load_const(*name).load_const(*value);
    }
    let positional = u8::try_from(split).unwrap();
    module.call(positional, 3 - positional).emit(Opcode::ReturnValue);
    Program::from_builder(module).unwrap()
}

proptest! {
    #[test]
    fn keyword_and_positional_calls_agree(a in -1000i64..1000, b in -1000i64..1000, c in -1000i64..1000, split in 0usize..=3) {
        let result = run_program(&split_call([a, b, c], split)).unwrap();
        prop_assert_eq!(result, ints(&[a, b, c]));
    }
}
