//! Compiled code objects.

use std::{fmt::Write, sync::Arc};

use serde::{Deserialize, Serialize};

use super::op::{ArgKind, CompareOp, Opcode, instructions};
use crate::intern::{Interns, StringId};

/// Code object flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodeFlags(u32);

impl CodeFlags {
    /// Locals live in fast slots.
    pub const OPTIMIZED: Self = Self(0x0001);
    /// A fresh local namespace is created for each call.
    pub const NEWLOCALS: Self = Self(0x0002);
    /// Accepts extra positional arguments as a tuple.
    pub const VARARGS: Self = Self(0x0004);
    /// Accepts extra keyword arguments as a dict.
    pub const VARKEYWORDS: Self = Self(0x0008);
    /// Calling returns a generator instead of running the body.
    pub const GENERATOR: Self = Self(0x0020);
    /// No cell or free variables.
    pub const NOFREE: Self = Self(0x0040);

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for CodeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A compile-time constant referenced by `LOAD_CONST`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Const {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(StringId),
    Tuple(Vec<Const>),
    /// A nested code object, consumed by `MAKE_FUNCTION`/`MAKE_CLOSURE`.
    Code(Arc<Code>),
}

/// Maps an instruction offset to the source line it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineEntry {
    pub offset: u32,
    pub line: u32,
}

/// Immutable compiled function or module body.
///
/// Created by [`super::CodeBuilder`] or the assembler; shared by every function object
/// and frame that runs it.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Code {
    pub(crate) name: StringId,
    pub(crate) filename: StringId,
    pub(crate) first_line: u32,
    pub(crate) instructions: Vec<u8>,
    pub(crate) constants: Vec<Const>,
    pub(crate) names: Vec<StringId>,
    /// Arguments first (positional, keyword-only, `*args`, `**kwargs`), then other locals.
    pub(crate) varnames: Vec<StringId>,
    pub(crate) cellvars: Vec<StringId>,
    pub(crate) freevars: Vec<StringId>,
    /// For each cell variable, the argument slot whose value seeds it.
    pub(crate) cell_args: Vec<Option<u32>>,
    pub(crate) flags: CodeFlags,
    pub(crate) argcount: u32,
    pub(crate) kwonlyargcount: u32,
    /// Maximum value stack depth any execution can reach.
    pub(crate) stack_size: u32,
    pub(crate) line_table: Vec<LineEntry>,
}

impl Code {
    #[must_use]
    pub fn name(&self) -> StringId {
        self.name
    }

    #[must_use]
    pub fn filename(&self) -> StringId {
        self.filename
    }

    #[must_use]
    pub fn instructions(&self) -> &[u8] {
        &self.instructions
    }

    #[must_use]
    pub fn constants(&self) -> &[Const] {
        &self.constants
    }

    #[must_use]
    pub fn flags(&self) -> CodeFlags {
        self.flags
    }

    #[must_use]
    pub fn argcount(&self) -> u32 {
        self.argcount
    }

    #[must_use]
    pub fn kwonlyargcount(&self) -> u32 {
        self.kwonlyargcount
    }

    #[must_use]
    pub fn stack_size(&self) -> u32 {
        self.stack_size
    }

    #[must_use]
    pub fn nlocals(&self) -> usize {
        self.varnames.len()
    }

    /// Number of cell plus free variable slots.
    #[must_use]
    pub fn ncells(&self) -> usize {
        self.cellvars.len() + self.freevars.len()
    }

    #[must_use]
    pub fn is_generator(&self) -> bool {
        self.flags.contains(CodeFlags::GENERATOR)
    }

    /// Total argument slots, including `*args` and `**kwargs`.
    #[must_use]
    pub fn total_args(&self) -> usize {
        let mut n = (self.argcount + self.kwonlyargcount) as usize;
        if self.flags.contains(CodeFlags::VARARGS) {
            n += 1;
        }
        if self.flags.contains(CodeFlags::VARKEYWORDS) {
            n += 1;
        }
        n
    }

    /// Name of a cell or free variable slot.
    pub(crate) fn deref_name(&self, index: usize) -> StringId {
        if index < self.cellvars.len() {
            self.cellvars[index]
        } else {
            self.freevars[index - self.cellvars.len()]
        }
    }

    /// Source line of the instruction at `offset`.
    #[must_use]
    pub fn line_for(&self, offset: usize) -> u32 {
        let idx = self
            .line_table
            .partition_point(|entry| entry.offset as usize <= offset);
        if idx == 0 {
            self.first_line
        } else {
            self.line_table[idx - 1].line
        }
    }

    /// Human readable listing of the instructions, recursing into nested code objects.
    #[must_use]
    pub fn disassemble(&self, interns: &Interns) -> String {
        let mut out = String::new();
        self.disassemble_into(&mut out, interns);
        out
    }

    fn disassemble_into(&self, out: &mut String, interns: &Interns) {
        let _ = writeln!(
            out,
            "Disassembly of {} (stack size {}):",
            interns.get_str(self.name),
            self.stack_size
        );
        let mut last_line = None;
        for decoded in instructions(&self.instructions) {
            let Ok((instr, next)) = decoded else {
                let _ = writeln!(out, "  <malformed bytecode>");
                break;
            };
            let line = self.line_for(instr.offset);
            let line_col = if last_line == Some(line) {
                String::new()
            } else {
                last_line = Some(line);
                line.to_string()
            };
            let _ = write!(out, "{line_col:>4} {:>6} {:<22}", instr.offset, instr.opcode.to_string());
            if instr.opcode.has_arg() {
                let _ = write!(out, " {}", instr.arg);
                if let Some(detail) = self.describe_arg(instr.opcode, instr.arg, next, interns) {
                    let _ = write!(out, " ({detail})");
                }
            }
            out.push('\n');
        }
        for constant in &self.constants {
            if let Const::Code(code) = constant {
                out.push('\n');
                code.disassemble_into(out, interns);
            }
        }
    }

    fn describe_arg(&self, opcode: Opcode, arg: u32, next: usize, interns: &Interns) -> Option<String> {
        let index = arg as usize;
        match opcode.arg_kind() {
            ArgKind::Const => self.constants.get(index).map(|c| describe_const(c, interns)),
            ArgKind::Name => self.names.get(index).map(|id| interns.get_str(*id).to_owned()),
            ArgKind::Local => self.varnames.get(index).map(|id| interns.get_str(*id).to_owned()),
            ArgKind::Deref => (index < self.ncells()).then(|| interns.get_str(self.deref_name(index)).to_owned()),
            ArgKind::RelativeJump => Some(format!("to {}", next + index)),
            ArgKind::Compare => CompareOp::from_repr(u8::try_from(arg).ok()?).map(|op| op.to_string()),
            ArgKind::AbsoluteJump | ArgKind::Int | ArgKind::None => None,
        }
    }
}

fn describe_const(constant: &Const, interns: &Interns) -> String {
    match constant {
        Const::None => "None".to_owned(),
        Const::Bool(true) => "True".to_owned(),
        Const::Bool(false) => "False".to_owned(),
        Const::Int(i) => i.to_string(),
        Const::Float(f) => crate::value::float_repr(*f),
        Const::Str(id) => crate::value::string_repr(interns.get_str(*id)),
        Const::Tuple(items) => {
            let inner: Vec<_> = items.iter().map(|c| describe_const(c, interns)).collect();
            if inner.len() == 1 {
                format!("({},)", inner[0])
            } else {
                format!("({})", inner.join(", "))
            }
        }
        Const::Code(code) => format!("<code {}>", interns.get_str(code.name)),
    }
}
