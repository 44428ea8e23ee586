//! Bytecode representation and the virtual machine that runs it.
//!
//! # Module Structure
//!
//! - `op` - opcode enum, instruction decoding and stack effects
//! - `code` - immutable code objects
//! - `builder` - [`CodeBuilder`] for emitting bytecode programmatically
//! - `asm` - the JSON assembly format
//! - `vm` - the dispatch loop, unwinding, calls and generators

pub use asm::{AsmError, assemble};
pub use builder::{BuildError, CodeBuilder, ConstValue, Label, call_arg};
pub use code::{Code, CodeFlags, Const, LineEntry};
pub use op::{ArgKind, CompareOp, DecodeError, HAVE_ARGUMENT, Instruction, Opcode, instructions};
pub use vm::BlockKind;
pub(crate) use vm::{ExcInfo, Frame, FrameExit, UnwindReason, VM};

mod asm;
mod builder;
mod code;
mod op;
mod vm;
