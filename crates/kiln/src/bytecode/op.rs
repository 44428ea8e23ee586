//! Opcode definitions and instruction decoding.
//!
//! Instructions are one opcode byte, followed by a 16-bit little-endian argument when
//! the opcode is at or above [`HAVE_ARGUMENT`]. `EXTENDED_ARG` supplies the high 16 bits
//! of the following instruction's argument.

use std::fmt;

use strum::{Display, EnumString, FromRepr, IntoStaticStr};

/// Opcodes at or above this value carry a 16-bit argument.
pub const HAVE_ARGUMENT: u8 = 90;

/// VM opcodes.
///
/// The discriminant is the byte stored in the instruction stream.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    // stack manipulation
    PopTop = 1,
    RotTwo = 2,
    RotThree = 3,
    DupTop = 4,
    DupTopTwo = 5,
    Nop = 9,

    // unary
    UnaryPositive = 10,
    UnaryNegative = 11,
    UnaryNot = 12,
    UnaryInvert = 15,

    // binary and in-place
    BinaryPower = 19,
    BinaryMultiply = 20,
    BinaryModulo = 22,
    BinaryAdd = 23,
    BinarySubtract = 24,
    BinarySubscr = 25,
    BinaryFloorDivide = 26,
    BinaryTrueDivide = 27,
    InplaceFloorDivide = 28,
    InplaceTrueDivide = 29,
    StoreMap = 54,
    InplaceAdd = 55,
    InplaceSubtract = 56,
    InplaceMultiply = 57,
    InplaceModulo = 59,
    StoreSubscr = 60,
    DeleteSubscr = 61,
    BinaryLshift = 62,
    BinaryRshift = 63,
    BinaryAnd = 64,
    BinaryXor = 65,
    BinaryOr = 66,
    InplacePower = 67,
    GetIter = 68,
    YieldFrom = 72,
    InplaceLshift = 75,
    InplaceRshift = 76,
    InplaceAnd = 77,
    InplaceXor = 78,
    InplaceOr = 79,

    // block and control flow without arguments
    BreakLoop = 80,
    WithCleanup = 81,
    ReturnValue = 83,
    YieldValue = 86,
    PopBlock = 87,
    EndFinally = 88,
    PopExcept = 89,

    // opcodes with an argument
    StoreName = 90,
    DeleteName = 91,
    UnpackSequence = 92,
    ForIter = 93,
    StoreAttr = 95,
    DeleteAttr = 96,
    StoreGlobal = 97,
    DeleteGlobal = 98,
    LoadConst = 100,
    LoadName = 101,
    BuildTuple = 102,
    BuildList = 103,
    BuildMap = 105,
    LoadAttr = 106,
    CompareOp = 107,
    JumpForward = 110,
    JumpIfFalseOrPop = 111,
    JumpIfTrueOrPop = 112,
    JumpAbsolute = 113,
    PopJumpIfFalse = 114,
    PopJumpIfTrue = 115,
    LoadGlobal = 116,
    ContinueLoop = 119,
    SetupLoop = 120,
    SetupExcept = 121,
    SetupFinally = 122,
    LoadFast = 124,
    StoreFast = 125,
    DeleteFast = 126,
    RaiseVarargs = 130,
    CallFunction = 131,
    MakeFunction = 132,
    MakeClosure = 134,
    LoadClosure = 135,
    LoadDeref = 136,
    StoreDeref = 137,
    DeleteDeref = 138,
    CallFunctionVar = 140,
    CallFunctionKw = 141,
    CallFunctionVarKw = 142,
    SetupWith = 143,
    ExtendedArg = 144,
    ListAppend = 145,
}

/// How an opcode's argument is interpreted, used by the assembler and disassembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    None,
    /// Plain integer (counts, flags).
    Int,
    Const,
    /// Index into the code object's `names`.
    Name,
    /// Index into `varnames`.
    Local,
    /// Index into `cellvars` followed by `freevars`.
    Deref,
    /// Jump target relative to the next instruction.
    RelativeJump,
    /// Absolute jump target.
    AbsoluteJump,
    Compare,
}

impl Opcode {
    /// Whether the opcode carries a 16-bit argument.
    #[inline]
    #[must_use]
    pub fn has_arg(self) -> bool {
        self as u8 >= HAVE_ARGUMENT
    }

    #[must_use]
    pub fn arg_kind(self) -> ArgKind {
        match self {
            Self::LoadConst => ArgKind::Const,
            Self::StoreName
            | Self::DeleteName
            | Self::LoadName
            | Self::StoreGlobal
            | Self::DeleteGlobal
            | Self::LoadGlobal
            | Self::StoreAttr
            | Self::DeleteAttr
            | Self::LoadAttr => ArgKind::Name,
            Self::LoadFast | Self::StoreFast | Self::DeleteFast => ArgKind::Local,
            Self::LoadClosure | Self::LoadDeref | Self::StoreDeref | Self::DeleteDeref => ArgKind::Deref,
            Self::JumpForward
            | Self::ForIter
            | Self::SetupLoop
            | Self::SetupExcept
            | Self::SetupFinally
            | Self::SetupWith => ArgKind::RelativeJump,
            Self::JumpAbsolute
            | Self::PopJumpIfFalse
            | Self::PopJumpIfTrue
            | Self::JumpIfFalseOrPop
            | Self::JumpIfTrueOrPop
            | Self::ContinueLoop => ArgKind::AbsoluteJump,
            Self::CompareOp => ArgKind::Compare,
            op if op.has_arg() => ArgKind::Int,
            _ => ArgKind::None,
        }
    }

    /// Whether execution never falls through to the next instruction.
    #[must_use]
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Self::ReturnValue
                | Self::RaiseVarargs
                | Self::JumpForward
                | Self::JumpAbsolute
                | Self::BreakLoop
                | Self::ContinueLoop
        )
    }

    /// Net change in stack depth when the instruction executes.
    ///
    /// `jump` selects the effect when the branch (or handler) is taken. Values are an
    /// upper bound where the runtime effect varies (e.g. `END_FINALLY`), which is what
    /// stack size computation needs.
    #[must_use]
    pub fn stack_effect(self, arg: u32, jump: bool) -> i32 {
        let arg = i32::try_from(arg).unwrap_or(i32::MAX);
        let low = arg & 0xff;
        let high = (arg >> 8) & 0xff;
        match self {
            Self::Nop | Self::RotTwo | Self::RotThree | Self::ExtendedArg => 0,
            Self::PopTop => -1,
            Self::DupTop => 1,
            Self::DupTopTwo => 2,
            Self::UnaryPositive | Self::UnaryNegative | Self::UnaryNot | Self::UnaryInvert => 0,
            Self::BinaryPower
            | Self::BinaryMultiply
            | Self::BinaryModulo
            | Self::BinaryAdd
            | Self::BinarySubtract
            | Self::BinarySubscr
            | Self::BinaryFloorDivide
            | Self::BinaryTrueDivide
            | Self::BinaryLshift
            | Self::BinaryRshift
            | Self::BinaryAnd
            | Self::BinaryXor
            | Self::BinaryOr
            | Self::InplaceFloorDivide
            | Self::InplaceTrueDivide
            | Self::InplaceAdd
            | Self::InplaceSubtract
            | Self::InplaceMultiply
            | Self::InplaceModulo
            | Self::InplacePower
            | Self::InplaceLshift
            | Self::InplaceRshift
            | Self::InplaceAnd
            | Self::InplaceXor
            | Self::InplaceOr => -1,
            Self::StoreMap => -2,
            Self::StoreSubscr => -3,
            Self::DeleteSubscr => -2,
            Self::GetIter => 0,
            Self::ForIter => {
                if jump {
                    -1
                } else {
                    1
                }
            }
            Self::YieldValue => 0,
            Self::YieldFrom => -1,
            Self::BreakLoop | Self::PopBlock | Self::PopExcept => 0,
            Self::WithCleanup | Self::EndFinally => -1,
            Self::ReturnValue => -1,
            Self::StoreName | Self::StoreGlobal | Self::StoreFast | Self::StoreDeref => -1,
            Self::DeleteName | Self::DeleteGlobal | Self::DeleteFast | Self::DeleteDeref => 0,
            Self::UnpackSequence => arg - 1,
            Self::StoreAttr => -2,
            Self::DeleteAttr => -1,
            Self::LoadConst | Self::LoadName | Self::LoadGlobal | Self::LoadFast | Self::LoadClosure | Self::LoadDeref => 1,
            Self::BuildTuple | Self::BuildList => 1 - arg,
            Self::BuildMap => 1,
            Self::LoadAttr => 0,
            Self::CompareOp => -1,
            Self::JumpForward | Self::JumpAbsolute | Self::ContinueLoop | Self::SetupLoop => 0,
            Self::PopJumpIfFalse | Self::PopJumpIfTrue => -1,
            Self::JumpIfFalseOrPop | Self::JumpIfTrueOrPop => {
                if jump {
                    0
                } else {
                    -1
                }
            }
            // the unwinder pushes the saved and the current exception triples
            Self::SetupExcept | Self::SetupFinally => {
                if jump {
                    6
                } else {
                    0
                }
            }
            Self::SetupWith => {
                if jump {
                    6
                } else {
                    1
                }
            }
            Self::RaiseVarargs => -arg,
            Self::CallFunction => -(low + 2 * high),
            Self::CallFunctionVar | Self::CallFunctionKw => -(low + 2 * high) - 1,
            Self::CallFunctionVarKw => -(low + 2 * high) - 2,
            Self::MakeFunction => -1 - low - 2 * high,
            Self::MakeClosure => -2 - low - 2 * high,
            Self::ListAppend => -1,
        }
    }
}

/// Comparison selected by the `COMPARE_OP` argument.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, Display, EnumString, IntoStaticStr)]
pub enum CompareOp {
    #[strum(serialize = "<")]
    Lt = 0,
    #[strum(serialize = "<=")]
    Le = 1,
    #[strum(serialize = "==")]
    Eq = 2,
    #[strum(serialize = "!=")]
    Ne = 3,
    #[strum(serialize = ">")]
    Gt = 4,
    #[strum(serialize = ">=")]
    Ge = 5,
    #[strum(serialize = "in")]
    In = 6,
    #[strum(serialize = "not in")]
    NotIn = 7,
    #[strum(serialize = "is")]
    Is = 8,
    #[strum(serialize = "is not")]
    IsNot = 9,
    #[strum(serialize = "exception match")]
    ExceptionMatch = 10,
}

/// A decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub arg: u32,
    /// Offset of the opcode byte, after any `EXTENDED_ARG` prefixes.
    pub offset: usize,
}

/// Malformed instruction stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnknownOpcode { offset: usize, byte: u8 },
    Truncated { offset: usize },
    ArgOverflow { offset: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOpcode { offset, byte } => write!(f, "unknown opcode {byte} at offset {offset}"),
            Self::Truncated { offset } => write!(f, "truncated instruction at offset {offset}"),
            Self::ArgOverflow { offset } => write!(f, "EXTENDED_ARG overflow at offset {offset}"),
        }
    }
}

impl std::error::Error for DecodeError {}

impl Instruction {
    /// Decodes the instruction starting at `offset`, folding any `EXTENDED_ARG` prefixes.
    ///
    /// Returns the instruction and the offset of the next one.
    pub fn decode(bytes: &[u8], offset: usize) -> Result<(Self, usize), DecodeError> {
        let mut pos = offset;
        let mut extended: u32 = 0;
        loop {
            let byte = *bytes.get(pos).ok_or(DecodeError::Truncated { offset: pos })?;
            let opcode = Opcode::from_repr(byte).ok_or(DecodeError::UnknownOpcode { offset: pos, byte })?;
            let start = pos;
            pos += 1;
            let mut arg = 0;
            if opcode.has_arg() {
                let raw = bytes.get(pos..pos + 2).ok_or(DecodeError::Truncated { offset: start })?;
                arg = u32::from(u16::from_le_bytes([raw[0], raw[1]]));
                pos += 2;
            }
            if extended > 0xffff {
                return Err(DecodeError::ArgOverflow { offset: start });
            }
            let arg = (extended << 16) | arg;
            if opcode == Opcode::ExtendedArg {
                extended = arg;
                continue;
            }
            return Ok((
                Self {
                    opcode,
                    arg,
                    offset: start,
                },
                pos,
            ));
        }
    }

    /// Target offset of a jump given the offset of the following instruction.
    #[must_use]
    pub fn jump_target(&self, next: usize) -> Option<usize> {
        match self.opcode.arg_kind() {
            ArgKind::RelativeJump => Some(next + self.arg as usize),
            ArgKind::AbsoluteJump => Some(self.arg as usize),
            _ => None,
        }
    }
}

/// Iterates over the instructions of a code buffer.
pub fn instructions(bytes: &[u8]) -> impl Iterator<Item = Result<(Instruction, usize), DecodeError>> + '_ {
    let mut offset = 0;
    let mut failed = false;
    std::iter::from_fn(move || {
        if failed || offset >= bytes.len() {
            return None;
        }
        let result = Instruction::decode(bytes, offset);
        match &result {
            Ok((_, next)) => offset = *next,
            Err(_) => failed = true,
        }
        Some(result)
    })
}
