//! Whole programs: closures, printing, host functions, snapshots and disassembly.

mod common;

use common::{error_summary, ints, program, run, run_program, run_with_output};
use kiln::{CodeBuilder, ExcType, Exception, Interpreter, NoLimitTracker, NoPrint, Object, Opcode, Program};
use pretty_assertions::assert_eq;

/// ```text
/// def make():
///     n = 0
///     def bump():
///         nonlocal n
///         n += 1
///         return n
///     return bump
/// b = make()
/// b(); b()
/// return b()
/// ```
const COUNTER: &str = r#"{"code": [
    ["LOAD_CONST", {"code": {"name": "make", "cellvars": ["n"], "code": [
        ["LOAD_CONST", 0], ["STORE_DEREF", "n"],
        ["LOAD_CLOSURE", "n"], ["BUILD_TUPLE", 1],
        ["LOAD_CONST", {"code": {"name": "bump", "freevars": ["n"], "code": [
            ["LOAD_DEREF", "n"], ["LOAD_CONST", 1], "BINARY_ADD", ["STORE_DEREF", "n"],
            ["LOAD_DEREF", "n"], "RETURN_VALUE"
        ]}}],
        ["LOAD_CONST", "make.<locals>.bump"], ["MAKE_CLOSURE", 0],
        "RETURN_VALUE"
    ]}}],
    ["LOAD_CONST", "make"], ["MAKE_FUNCTION", 0], ["STORE_NAME", "make"],
    ["LOAD_NAME", "make"], ["CALL_FUNCTION", 0], ["STORE_NAME", "b"],
    ["LOAD_NAME", "b"], ["CALL_FUNCTION", 0], "POP_TOP",
    ["LOAD_NAME", "b"], ["CALL_FUNCTION", 0], "POP_TOP",
    ["LOAD_NAME", "b"], ["CALL_FUNCTION", 0], "RETURN_VALUE"
]}"#;

#[test]
fn closure_cells_are_shared_between_calls() {
    assert_eq!(run(COUNTER).unwrap(), Object::Int(3));
}

#[test]
fn free_variable_read_before_assignment() {
    // def outer():
    //     def inner(): return x
    //     inner()
    //     x = 1
    let source = r#"{"code": [
        ["LOAD_CONST", {"code": {"name": "outer", "cellvars": ["x"], "code": [
            ["LOAD_CLOSURE", "x"], ["BUILD_TUPLE", 1],
            ["LOAD_CONST", {"code": {"name": "inner", "freevars": ["x"], "code": [["LOAD_DEREF", "x"], "RETURN_VALUE"]}}],
            ["LOAD_CONST", "inner"], ["MAKE_CLOSURE", 0],
            ["CALL_FUNCTION", 0], "POP_TOP",
            ["LOAD_CONST", 1], ["STORE_DEREF", "x"],
            ["LOAD_CONST", null], "RETURN_VALUE"
        ]}}],
        ["LOAD_CONST", "outer"], ["MAKE_FUNCTION", 0], ["CALL_FUNCTION", 0], "RETURN_VALUE"
    ]}"#;
    assert_eq!(
        error_summary(run(source)),
        "NameError: free variable 'x' referenced before assignment in enclosing scope"
    );
}

#[test]
fn unbound_names_and_locals() {
    let local = r#"{"code": [
        ["LOAD_CONST", {"code": {"name": "f", "locals": ["y"], "code": [["LOAD_FAST", "y"], "RETURN_VALUE"]}}],
        ["LOAD_CONST", "f"], ["MAKE_FUNCTION", 0], ["CALL_FUNCTION", 0], "RETURN_VALUE"
    ]}"#;
    assert_eq!(
        error_summary(run(local)),
        "UnboundLocalError: local variable 'y' referenced before assignment"
    );

    let global = r#"{"code": [["LOAD_NAME", "missing"], "RETURN_VALUE"]}"#;
    assert_eq!(error_summary(run(global)), "NameError: name 'missing' is not defined");
}

#[test]
fn int_arithmetic_overflows_instead_of_wrapping() {
    let source = r#"{"code": [["LOAD_CONST", 9223372036854775807], ["LOAD_CONST", 1], "BINARY_ADD", "RETURN_VALUE"]}"#;
    assert_eq!(run(source).unwrap_err().exc_type(), ExcType::OverflowError);
}

#[test]
fn print_writes_through_the_print_writer() {
    // print(1, "a", sep="-"); print("done")
    let source = r#"{"code": [
        ["LOAD_NAME", "print"], ["LOAD_CONST", 1], ["LOAD_CONST", "a"], ["LOAD_CONST", "sep"], ["LOAD_CONST", "-"],
        ["CALL_FUNCTION", 258], "POP_TOP",
        ["LOAD_NAME", "print"], ["LOAD_CONST", "done"], ["CALL_FUNCTION", 1],
        "RETURN_VALUE"
    ]}"#;
    let (result, output) = run_with_output(source);
    assert_eq!(result.unwrap(), Object::None);
    assert_eq!(output, "1-a\ndone\n");
}

#[test]
fn host_functions_take_and_return_objects() {
    let source = r#"{"code": [
        ["LOAD_NAME", "pair"], ["LOAD_CONST", 4], ["LOAD_CONST", "x"], ["CALL_FUNCTION", 2], "RETURN_VALUE"
    ]}"#;
    let mut program = program(source);
    program.register_host_function("pair", |args| Ok(Object::List(args.to_vec())));
    assert_eq!(
        run_program(&program).unwrap(),
        Object::List(vec![Object::Int(4), Object::String("x".to_owned())])
    );
}

#[test]
fn host_function_errors_are_catchable() {
    // try:
    //     fail()
    // except ValueError as e:
    //     return e.args
    let source = r#"{"code": [
        ["SETUP_EXCEPT", "h"],
        ["LOAD_NAME", "fail"], ["CALL_FUNCTION", 0], "RETURN_VALUE",
        "h:",
        "DUP_TOP", ["LOAD_NAME", "ValueError"], ["COMPARE_OP", "exception match"], ["POP_JUMP_IF_FALSE", "reraise"],
        "POP_TOP", ["STORE_NAME", "e"], "POP_TOP",
        ["LOAD_NAME", "e"], ["LOAD_ATTR", "args"], "RETURN_VALUE",
        "reraise:",
        "END_FINALLY",
        ["LOAD_CONST", null], "RETURN_VALUE"
    ]}"#;
    let mut program = program(source);
    program.register_host_function("fail", |_| Err(Exception::new(ExcType::ValueError, Some("bad".to_owned()))));
    assert_eq!(
        run_program(&program).unwrap(),
        Object::Tuple(vec![Object::String("bad".to_owned())])
    );
}

#[test]
fn host_functions_do_not_shadow_globals() {
    let source = r#"{"code": [
        ["LOAD_CONST", 1], ["STORE_NAME", "value"],
        ["LOAD_NAME", "value"], "RETURN_VALUE"
    ]}"#;
    let mut program = program(source);
    program.register_host_function("value", |_| Ok(Object::Int(2)));
    assert_eq!(run_program(&program).unwrap(), Object::Int(1));
}

#[test]
fn loaded_snapshot_runs_the_same() {
    let source = program(COUNTER);
    let loaded = Program::load(&source.dump().unwrap()).unwrap();
    assert_eq!(source.disassemble(), loaded.disassemble());
    assert_eq!(run_program(&loaded).unwrap(), Object::Int(3));
}

#[test]
fn disassembly_lists_nested_code() {
    let listing = program(COUNTER).disassemble();
    assert!(listing.starts_with("Disassembly of <module>"), "{listing}");
    assert!(listing.contains("Disassembly of make"), "{listing}");
    assert!(listing.contains("Disassembly of bump"), "{listing}");
    assert!(listing.contains("(<code make>)"), "{listing}");
    assert!(listing.contains("LOAD_DEREF"), "{listing}");
}

#[test]
fn wide_local_indexes_use_extended_arg() {
    let mut builder = CodeBuilder::new("<module>");
    for i in 0..=0x1_0000 {
        builder.local_index(&format!("v{i}"));
    }
    builder
        .load_const(7_i64)
        .store_fast("v65536")
        .load_fast("v65536")
        .emit(Opcode::ReturnValue);
    let program = Program::from_builder(builder).unwrap();
    assert_eq!(program.module().nlocals(), 0x1_0001);
    assert!(program.disassemble().contains("65536 (v65536)"));
    assert_eq!(run_program(&program).unwrap(), Object::Int(7));
}

#[test]
fn one_program_runs_on_many_contexts() {
    let program = program(r#"{"code": [["LOAD_CONST", [1, 2]], "RETURN_VALUE"]}"#);
    let interpreter = Interpreter::new();
    let mut first = interpreter.new_context();
    let mut second = interpreter.new_context();
    for context in [&mut first, &mut second] {
        assert_eq!(context.run(&program, NoLimitTracker::new(), &mut NoPrint).unwrap(), ints(&[1, 2]));
    }
}
