//! Incremental construction of [`Code`] objects.
//!
//! The builder keeps names, locals and constants as plain strings until [`CodeBuilder::build`]
//! interns them, so nested function bodies can be assembled independently and stitched in
//! as constants. Jumps are emitted against [`Label`]s and patched once every label is bound.

use std::{fmt, sync::Arc};

use indexmap::IndexSet;

use super::{
    code::{Code, CodeFlags, Const, LineEntry},
    op::{CompareOp, DecodeError, Instruction, Opcode},
};
use crate::intern::Interns;

/// A jump target inside a [`CodeBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

/// A constant as seen by the builder, before strings are interned.
#[derive(Debug, Clone)]
pub enum ConstValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<ConstValue>),
    /// Body of a nested function, built together with its parent.
    Code(Box<CodeBuilder>),
}

impl ConstValue {
    /// Identity used to share constant slots; nested code is never shared.
    fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Tuple(a), Self::Tuple(b)) => a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_as(y)),
            _ => false,
        }
    }

    fn build(self, interns: &mut Interns) -> Result<Const, BuildError> {
        Ok(match self {
            Self::None => Const::None,
            Self::Bool(b) => Const::Bool(b),
            Self::Int(i) => Const::Int(i),
            Self::Float(f) => Const::Float(f),
            Self::Str(s) => Const::Str(interns.intern(&s)),
            Self::Tuple(items) => Const::Tuple(
                items
                    .into_iter()
                    .map(|item| item.build(interns))
                    .collect::<Result<_, _>>()?,
            ),
            Self::Code(builder) => Const::Code(builder.build(interns)?),
        })
    }
}

impl From<bool> for ConstValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for ConstValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for ConstValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for ConstValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<String> for ConstValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<CodeBuilder> for ConstValue {
    fn from(builder: CodeBuilder) -> Self {
        Self::Code(Box::new(builder))
    }
}

/// Error produced when a code object cannot be finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// A jump refers to a label that was never bound.
    UnboundLabel { code: String },
    /// A jump target does not fit in the 16-bit jump operand.
    JumpTooFar { code: String, offset: usize },
    /// A relative jump points backwards.
    BackwardJump { code: String, offset: usize },
    /// A deref instruction names neither a cell nor a free variable.
    UnknownDeref { code: String, name: String },
    /// Some path pops more values than it pushed.
    StackUnderflow { code: String, offset: usize },
    /// Stack depth grows without bound around a loop.
    UnbalancedStack { code: String, offset: usize },
    /// The emitted bytes do not decode.
    Decode { code: String, error: DecodeError },
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnboundLabel { code } => write!(f, "{code}: jump to unbound label"),
            Self::JumpTooFar { code, offset } => write!(f, "{code}: jump at offset {offset} is out of range"),
            Self::BackwardJump { code, offset } => {
                write!(f, "{code}: relative jump at offset {offset} points backwards")
            }
            Self::UnknownDeref { code, name } => write!(f, "{code}: '{name}' is not a cell or free variable"),
            Self::StackUnderflow { code, offset } => write!(f, "{code}: stack underflow at offset {offset}"),
            Self::UnbalancedStack { code, offset } => write!(f, "{code}: unbalanced stack at offset {offset}"),
            Self::Decode { code, error } => write!(f, "{code}: {error}"),
        }
    }
}

impl std::error::Error for BuildError {}

/// Stack depths above this are treated as a loop that keeps pushing.
const MAX_STACK_DEPTH: i32 = 0xffff;

#[derive(Debug, Clone, Copy)]
struct JumpFixup {
    /// Position of the 16-bit operand.
    arg_pos: usize,
    /// Offset of the instruction after the jump.
    next: usize,
    label: Label,
    relative: bool,
}

/// Builds a [`Code`] object instruction by instruction.
///
/// Signature methods (`kwonly`, `varargs`, `cellvars`...) fix slot numbering and must be
/// called before any instruction is emitted.
#[derive(Debug, Clone)]
pub struct CodeBuilder {
    name: String,
    filename: String,
    first_line: u32,
    current_line: Option<u32>,
    flags: CodeFlags,
    args: Vec<String>,
    kwonly: Vec<String>,
    varargs: Option<String>,
    varkw: Option<String>,
    locals: IndexSet<String>,
    cellvars: IndexSet<String>,
    freevars: IndexSet<String>,
    names: IndexSet<String>,
    constants: Vec<ConstValue>,
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<JumpFixup>,
    line_table: Vec<LineEntry>,
    error: Option<BuildError>,
}

impl CodeBuilder {
    /// Starts a module-level body; names resolve through `LOAD_NAME`/`STORE_NAME`.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            filename: "<kiln>".to_owned(),
            first_line: 1,
            current_line: None,
            flags: CodeFlags::empty(),
            args: Vec::new(),
            kwonly: Vec::new(),
            varargs: None,
            varkw: None,
            locals: IndexSet::new(),
            cellvars: IndexSet::new(),
            freevars: IndexSet::new(),
            names: IndexSet::new(),
            constants: Vec::new(),
            code: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
            line_table: Vec::new(),
            error: None,
        }
    }

    /// Starts a function body with the given positional parameters.
    #[must_use]
    pub fn function(name: &str, args: &[&str]) -> Self {
        let mut builder = Self::new(name);
        builder.flags = CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS;
        builder.args = args.iter().map(|&a| a.to_owned()).collect();
        builder
    }

    fn assert_unemitted(&self) {
        assert!(self.code.is_empty(), "signature must be configured before emitting code");
    }

    /// # Panics
    /// Panics if instructions were already emitted.
    #[must_use]
    pub fn kwonly(mut self, names: &[&str]) -> Self {
        self.assert_unemitted();
        self.kwonly = names.iter().map(|&a| a.to_owned()).collect();
        self
    }

    /// # Panics
    /// Panics if instructions were already emitted.
    #[must_use]
    pub fn varargs(mut self, name: &str) -> Self {
        self.assert_unemitted();
        self.varargs = Some(name.to_owned());
        self.flags.insert(CodeFlags::VARARGS);
        self
    }

    /// # Panics
    /// Panics if instructions were already emitted.
    #[must_use]
    pub fn varkw(mut self, name: &str) -> Self {
        self.assert_unemitted();
        self.varkw = Some(name.to_owned());
        self.flags.insert(CodeFlags::VARKEYWORDS);
        self
    }

    #[must_use]
    pub fn generator(mut self) -> Self {
        self.flags.insert(CodeFlags::GENERATOR);
        self
    }

    /// # Panics
    /// Panics if instructions were already emitted.
    #[must_use]
    pub fn cellvars(mut self, names: &[&str]) -> Self {
        self.assert_unemitted();
        self.cellvars = names.iter().map(|&a| a.to_owned()).collect();
        self
    }

    /// # Panics
    /// Panics if instructions were already emitted.
    #[must_use]
    pub fn freevars(mut self, names: &[&str]) -> Self {
        self.assert_unemitted();
        self.freevars = names.iter().map(|&a| a.to_owned()).collect();
        self
    }

    #[must_use]
    pub fn filename(mut self, filename: &str) -> Self {
        self.filename = filename.to_owned();
        self
    }

    #[must_use]
    pub fn first_line(mut self, line: u32) -> Self {
        self.first_line = line;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current end of the instruction stream.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    /// Attributes the following instructions to `line`.
    pub fn set_line(&mut self, line: u32) {
        if self.current_line == Some(line) {
            return;
        }
        self.current_line = Some(line);
        let offset = u32::try_from(self.code.len()).unwrap_or(u32::MAX);
        match self.line_table.last_mut() {
            Some(last) if last.offset == offset => last.line = line,
            _ => self.line_table.push(LineEntry { offset, line }),
        }
    }

    /// Emits an instruction without an argument.
    ///
    /// # Panics
    /// Panics if `op` takes an argument.
    pub fn emit(&mut self, op: Opcode) -> &mut Self {
        assert!(!op.has_arg(), "{op} needs an argument");
        self.code.push(op as u8);
        self
    }

    /// Emits an instruction with an argument, prefixing `EXTENDED_ARG` when it needs more than 16 bits.
    ///
    /// # Panics
    /// Panics if `op` takes no argument.
    pub fn emit_arg(&mut self, op: Opcode, arg: u32) -> &mut Self {
        assert!(op.has_arg(), "{op} takes no argument");
        let high = arg >> 16;
        if high > 0 {
            self.push_raw(Opcode::ExtendedArg, high);
        }
        self.push_raw(op, arg & 0xffff);
        self
    }

    fn push_raw(&mut self, op: Opcode, arg: u32) {
        self.code.push(op as u8);
        let arg = u16::try_from(arg).unwrap_or(u16::MAX);
        self.code.extend_from_slice(&arg.to_le_bytes());
    }

    #[must_use]
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Binds `label` to the current offset.
    pub fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.code.len());
    }

    /// Emits a jump (or block setup) whose target is `label`.
    ///
    /// # Panics
    /// Panics if `op` is not a jump.
    pub fn emit_jump(&mut self, op: Opcode, label: Label) -> &mut Self {
        let relative = match op.arg_kind() {
            super::op::ArgKind::RelativeJump => true,
            super::op::ArgKind::AbsoluteJump => false,
            _ => panic!("{op} is not a jump"),
        };
        self.code.push(op as u8);
        let arg_pos = self.code.len();
        self.code.extend_from_slice(&[0, 0]);
        self.fixups.push(JumpFixup {
            arg_pos,
            next: self.code.len(),
            label,
            relative,
        });
        self
    }

    /// Index of a constant, sharing slots for equal scalar constants.
    pub fn add_const(&mut self, value: impl Into<ConstValue>) -> u32 {
        let value = value.into();
        let index = match self.constants.iter().position(|c| c.same_as(&value)) {
            Some(index) => index,
            None => {
                self.constants.push(value);
                self.constants.len() - 1
            }
        };
        slot(index)
    }

    pub fn load_const(&mut self, value: impl Into<ConstValue>) -> &mut Self {
        let index = self.add_const(value);
        self.emit_arg(Opcode::LoadConst, index)
    }

    pub fn load_none(&mut self) -> &mut Self {
        self.load_const(ConstValue::None)
    }

    /// Index of `name` in the names table used by global, attribute and name opcodes.
    pub fn name_index(&mut self, name: &str) -> u32 {
        slot(self.names.insert_full(name.to_owned()).0)
    }

    /// Slot of a local variable, declaring it if needed.
    pub fn local_index(&mut self, name: &str) -> u32 {
        let params = self
            .args
            .iter()
            .chain(&self.kwonly)
            .chain(&self.varargs)
            .chain(&self.varkw);
        let mut nparams = 0;
        for (i, param) in params.enumerate() {
            if param == name {
                return slot(i);
            }
            nparams += 1;
        }
        slot(nparams + self.locals.insert_full(name.to_owned()).0)
    }

    fn deref_index(&mut self, name: &str) -> u32 {
        if let Some(index) = self.cellvars.get_index_of(name) {
            slot(index)
        } else if let Some(index) = self.freevars.get_index_of(name) {
            slot(self.cellvars.len() + index)
        } else {
            if self.error.is_none() {
                self.error = Some(BuildError::UnknownDeref {
                    code: self.name.clone(),
                    name: name.to_owned(),
                });
            }
            0
        }
    }

    /// Emits an opcode whose argument is a name-table index.
    pub fn emit_name(&mut self, op: Opcode, name: &str) -> &mut Self {
        let index = self.name_index(name);
        self.emit_arg(op, index)
    }

    /// Emits an opcode whose argument is a local slot.
    pub fn emit_local(&mut self, op: Opcode, name: &str) -> &mut Self {
        let index = self.local_index(name);
        self.emit_arg(op, index)
    }

    /// Emits an opcode whose argument is a cell or free variable slot.
    pub fn emit_deref(&mut self, op: Opcode, name: &str) -> &mut Self {
        let index = self.deref_index(name);
        self.emit_arg(op, index)
    }

    pub fn load_fast(&mut self, name: &str) -> &mut Self {
        self.emit_local(Opcode::LoadFast, name)
    }

    pub fn store_fast(&mut self, name: &str) -> &mut Self {
        self.emit_local(Opcode::StoreFast, name)
    }

    pub fn load_name(&mut self, name: &str) -> &mut Self {
        self.emit_name(Opcode::LoadName, name)
    }

    pub fn store_name(&mut self, name: &str) -> &mut Self {
        self.emit_name(Opcode::StoreName, name)
    }

    pub fn load_global(&mut self, name: &str) -> &mut Self {
        self.emit_name(Opcode::LoadGlobal, name)
    }

    pub fn load_attr(&mut self, name: &str) -> &mut Self {
        self.emit_name(Opcode::LoadAttr, name)
    }

    pub fn compare(&mut self, op: CompareOp) -> &mut Self {
        self.emit_arg(Opcode::CompareOp, u32::from(op as u8))
    }

    /// Emits `CALL_FUNCTION` for `positional` arguments and `keywords` name/value pairs.
    pub fn call(&mut self, positional: u8, keywords: u8) -> &mut Self {
        self.emit_arg(Opcode::CallFunction, call_arg(positional, keywords))
    }

    /// Finalizes the code object, interning its strings and computing the stack size.
    pub fn build(mut self, interns: &mut Interns) -> Result<Arc<Code>, BuildError> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }
        for fixup in &self.fixups {
            let target = self.labels[fixup.label.0].ok_or_else(|| BuildError::UnboundLabel {
                code: self.name.clone(),
            })?;
            let arg = if fixup.relative {
                target.checked_sub(fixup.next).ok_or_else(|| BuildError::BackwardJump {
                    code: self.name.clone(),
                    offset: fixup.arg_pos - 1,
                })?
            } else {
                target
            };
            let arg = u16::try_from(arg).map_err(|_| BuildError::JumpTooFar {
                code: self.name.clone(),
                offset: fixup.arg_pos - 1,
            })?;
            self.code[fixup.arg_pos..fixup.arg_pos + 2].copy_from_slice(&arg.to_le_bytes());
        }

        let stack_size = compute_stack_size(&self.code, &self.name)?;

        let varnames: Vec<String> = self
            .args
            .iter()
            .chain(&self.kwonly)
            .chain(&self.varargs)
            .chain(&self.varkw)
            .chain(&self.locals)
            .cloned()
            .collect();
        let nargs = self.args.len()
            + self.kwonly.len()
            + usize::from(self.varargs.is_some())
            + usize::from(self.varkw.is_some());
        let cell_args = self
            .cellvars
            .iter()
            .map(|cell| varnames[..nargs].iter().position(|v| v == cell).map(slot))
            .collect();
        let mut flags = self.flags;
        if self.cellvars.is_empty() && self.freevars.is_empty() {
            flags.insert(CodeFlags::NOFREE);
        }

        let constants = self
            .constants
            .into_iter()
            .map(|c| c.build(interns))
            .collect::<Result<_, _>>()?;

        Ok(Arc::new(Code {
            name: interns.intern(&self.name),
            filename: interns.intern(&self.filename),
            first_line: self.first_line,
            instructions: self.code,
            constants,
            names: self.names.iter().map(|n| interns.intern(n)).collect(),
            varnames: varnames.iter().map(|n| interns.intern(n)).collect(),
            cellvars: self.cellvars.iter().map(|n| interns.intern(n)).collect(),
            freevars: self.freevars.iter().map(|n| interns.intern(n)).collect(),
            cell_args,
            flags,
            argcount: slot(self.args.len()),
            kwonlyargcount: slot(self.kwonly.len()),
            stack_size,
            line_table: self.line_table,
        }))
    }
}

/// Packs a call operand: low byte positional count, next byte keyword pairs.
#[must_use]
pub fn call_arg(positional: u8, keywords: u8) -> u32 {
    u32::from(positional) | (u32::from(keywords) << 8)
}

fn slot(index: usize) -> u32 {
    u32::try_from(index).expect("table index exceeds u32")
}

/// Maximum stack depth over every path through `code`, found by walking the control flow graph.
fn compute_stack_size(code: &[u8], name: &str) -> Result<u32, BuildError> {
    let decode_err = |error| BuildError::Decode {
        code: name.to_owned(),
        error,
    };
    let mut seen: Vec<Option<i32>> = vec![None; code.len()];
    let mut work = vec![(0usize, 0i32)];
    let mut max_depth = 0;
    while let Some((offset, depth)) = work.pop() {
        if offset >= code.len() {
            continue;
        }
        if seen[offset].is_some_and(|d| d >= depth) {
            continue;
        }
        seen[offset] = Some(depth);
        let (instr, next) = Instruction::decode(code, offset).map_err(decode_err)?;
        if let Some(target) = instr.jump_target(next) {
            let jumped = depth + instr.opcode.stack_effect(instr.arg, true);
            check_depth(jumped, name, offset)?;
            max_depth = max_depth.max(jumped);
            work.push((target, jumped));
        }
        if !instr.opcode.is_terminator() {
            let fell = depth + instr.opcode.stack_effect(instr.arg, false);
            check_depth(fell, name, offset)?;
            max_depth = max_depth.max(fell);
            work.push((next, fell));
        }
    }
    Ok(u32::try_from(max_depth).unwrap_or(0))
}

fn check_depth(depth: i32, name: &str, offset: usize) -> Result<(), BuildError> {
    if depth < 0 {
        Err(BuildError::StackUnderflow {
            code: name.to_owned(),
            offset,
        })
    } else if depth > MAX_STACK_DEPTH {
        Err(BuildError::UnbalancedStack {
            code: name.to_owned(),
            offset,
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_size_tracks_deepest_path() {
        let mut interns = Interns::new();
        let mut b = CodeBuilder::new("<module>");
        b.load_const(1).load_const(2).load_const(3);
        b.emit(Opcode::BinaryAdd).emit(Opcode::BinaryAdd).emit(Opcode::ReturnValue);
        let code = b.build(&mut interns).unwrap();
        assert_eq!(code.stack_size(), 3);
        assert_eq!(code.constants().len(), 3);
    }

    #[test]
    fn equal_constants_share_a_slot() {
        let mut b = CodeBuilder::new("<module>");
        assert_eq!(b.add_const(7), 0);
        assert_eq!(b.add_const("x"), 1);
        assert_eq!(b.add_const(7), 0);
        assert_eq!(b.add_const(true), 2);
        assert_eq!(b.add_const(0.0), 3);
        assert_eq!(b.add_const(-0.0), 4);
    }

    #[test]
    fn large_arguments_get_extended_arg() {
        let mut b = CodeBuilder::new("<module>");
        b.emit_arg(Opcode::LoadFast, 0x0002_0003);
        assert_eq!(b.offset(), 6);
        let (instr, next) = Instruction::decode(&b.code, 0).unwrap();
        assert_eq!(instr.opcode, Opcode::LoadFast);
        assert_eq!(instr.arg, 0x0002_0003);
        assert_eq!(next, 6);
    }

    #[test]
    fn forward_jumps_are_patched() {
        let mut interns = Interns::new();
        let mut b = CodeBuilder::new("<module>");
        let end = b.new_label();
        b.load_const(true);
        b.emit_jump(Opcode::PopJumpIfFalse, end);
        b.load_const(1).emit(Opcode::PopTop);
        b.bind(end);
        b.load_none().emit(Opcode::ReturnValue);
        let code = b.build(&mut interns).unwrap();
        let (instr, _) = Instruction::decode(code.instructions(), 3).unwrap();
        assert_eq!(instr.opcode, Opcode::PopJumpIfFalse);
        assert_eq!(instr.arg, 10);
    }

    #[test]
    fn unbound_label_is_an_error() {
        let mut interns = Interns::new();
        let mut b = CodeBuilder::new("f");
        let nowhere = b.new_label();
        b.emit_jump(Opcode::JumpAbsolute, nowhere);
        assert!(matches!(b.build(&mut interns), Err(BuildError::UnboundLabel { .. })));
    }

    #[test]
    fn unknown_deref_is_reported() {
        let mut interns = Interns::new();
        let mut b = CodeBuilder::function("f", &[]);
        b.emit_deref(Opcode::LoadDeref, "missing");
        b.emit(Opcode::ReturnValue);
        assert_eq!(
            b.build(&mut interns).unwrap_err(),
            BuildError::UnknownDeref {
                code: "f".to_owned(),
                name: "missing".to_owned()
            }
        );
    }

    #[test]
    fn underflow_is_detected() {
        let mut interns = Interns::new();
        let mut b = CodeBuilder::new("f");
        b.emit(Opcode::PopTop);
        assert!(matches!(b.build(&mut interns), Err(BuildError::StackUnderflow { .. })));
    }

    #[test]
    fn locals_follow_parameters() {
        let mut interns = Interns::new();
        let mut b = CodeBuilder::function("f", &["a", "b"]).kwonly(&["k"]).varargs("rest").cellvars(&["b"]);
        assert_eq!(b.local_index("tmp"), 4);
        assert_eq!(b.local_index("rest"), 3);
        assert_eq!(b.local_index("k"), 2);
        b.load_none().emit(Opcode::ReturnValue);
        let code = b.build(&mut interns).unwrap();
        assert_eq!(code.total_args(), 4);
        assert_eq!(code.nlocals(), 5);
        assert_eq!(code.cell_args, vec![Some(1)]);
        assert!(!code.flags().contains(CodeFlags::NOFREE));
    }

    #[test]
    fn handler_entry_depth_counts_exception_triples() {
        let mut interns = Interns::new();
        let mut b = CodeBuilder::function("f", &[]);
        let handler = b.new_label();
        let end = b.new_label();
        b.emit_jump(Opcode::SetupExcept, handler);
        b.load_none().emit(Opcode::PopTop).emit(Opcode::PopBlock);
        b.emit_jump(Opcode::JumpForward, end);
        b.bind(handler);
        b.emit(Opcode::PopTop).emit(Opcode::PopTop).emit(Opcode::PopTop);
        b.emit(Opcode::PopExcept);
        b.bind(end);
        b.load_none().emit(Opcode::ReturnValue);
        let code = b.build(&mut interns).unwrap();
        assert_eq!(code.stack_size(), 6);
    }
}
