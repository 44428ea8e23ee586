#![doc = include_str!("../../../README.md")]
// first to include defer_drop macro
mod heap;

mod args;
mod builtins;
mod bytecode;
mod context;
mod eval_breaker;
mod exception_private;
mod exception_public;
mod exec_lock;
mod function;
mod host;
mod intern;
mod interpreter;
mod io;
mod object;
mod pending;
mod program;
mod resource;
pub mod tracer;
mod types;
mod value;

pub use crate::{
    bytecode::{
        ArgKind, AsmError, BlockKind, BuildError, Code, CodeBuilder, CodeFlags, CompareOp, Const, ConstValue,
        DecodeError, HAVE_ARGUMENT, Instruction, Label, LineEntry, Opcode, assemble, call_arg, instructions,
    },
    context::{CallStats, ContextHandle, ContextId, ExecutionContext},
    exception_private::ExcType,
    exception_public::{Exception, StackFrame},
    host::HostFn,
    intern::{Interns, StringId},
    interpreter::{Interpreter, InterpreterConfig},
    io::{CollectStringPrint, NoPrint, PrintWriter, StdPrint},
    object::Object,
    pending::{PendingCallError, PendingCallback},
    program::{Program, ProgramError},
    resource::{
        DEFAULT_MAX_RECURSION_DEPTH, LimitedTracker, NoLimitTracker, ResourceError, ResourceLimits, ResourceTracker,
    },
};
