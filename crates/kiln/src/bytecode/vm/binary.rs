//! Unary and binary arithmetic.
//!
//! Ints are 64-bit: results that do not fit raise `OverflowError` instead of promoting.

use strum::Display;

use super::{Frame, VM};
use crate::{
    bytecode::Opcode,
    exception_private::{ExcType, RunError, RunResult, SimpleException},
    heap::{DropWithHeap, HeapData},
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    value::Value,
};

/// Largest sequence `*` will build, counted in items (or bytes for strings).
const MAX_REPEAT_LEN: usize = 1 << 26;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
enum BinOp {
    #[strum(serialize = "**")]
    Pow,
    #[strum(serialize = "*")]
    Mul,
    #[strum(serialize = "%")]
    Mod,
    #[strum(serialize = "+")]
    Add,
    #[strum(serialize = "-")]
    Sub,
    #[strum(serialize = "//")]
    FloorDiv,
    #[strum(serialize = "/")]
    TrueDiv,
    #[strum(serialize = "<<")]
    Lshift,
    #[strum(serialize = ">>")]
    Rshift,
    #[strum(serialize = "&")]
    And,
    #[strum(serialize = "^")]
    Xor,
    #[strum(serialize = "|")]
    Or,
}

impl BinOp {
    /// The operator and whether it is the in-place form.
    fn from_opcode(opcode: Opcode) -> Option<(Self, bool)> {
        let op = match opcode {
            Opcode::BinaryPower => (Self::Pow, false),
            Opcode::BinaryMultiply => (Self::Mul, false),
            Opcode::BinaryModulo => (Self::Mod, false),
            Opcode::BinaryAdd => (Self::Add, false),
            Opcode::BinarySubtract => (Self::Sub, false),
            Opcode::BinaryFloorDivide => (Self::FloorDiv, false),
            Opcode::BinaryTrueDivide => (Self::TrueDiv, false),
            Opcode::BinaryLshift => (Self::Lshift, false),
            Opcode::BinaryRshift => (Self::Rshift, false),
            Opcode::BinaryAnd => (Self::And, false),
            Opcode::BinaryXor => (Self::Xor, false),
            Opcode::BinaryOr => (Self::Or, false),
            Opcode::InplacePower => (Self::Pow, true),
            Opcode::InplaceMultiply => (Self::Mul, true),
            Opcode::InplaceModulo => (Self::Mod, true),
            Opcode::InplaceAdd => (Self::Add, true),
            Opcode::InplaceSubtract => (Self::Sub, true),
            Opcode::InplaceFloorDivide => (Self::FloorDiv, true),
            Opcode::InplaceTrueDivide => (Self::TrueDiv, true),
            Opcode::InplaceLshift => (Self::Lshift, true),
            Opcode::InplaceRshift => (Self::Rshift, true),
            Opcode::InplaceAnd => (Self::And, true),
            Opcode::InplaceXor => (Self::Xor, true),
            Opcode::InplaceOr => (Self::Or, true),
            _ => return None,
        };
        Some(op)
    }

    /// Operator as it appears in "unsupported operand" messages.
    fn message_symbol(self, inplace: bool) -> String {
        match (self, inplace) {
            (Self::Pow, false) => "** or pow()".to_owned(),
            (op, false) => op.to_string(),
            (op, true) => format!("{op}="),
        }
    }
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    pub(super) fn unary_op(&mut self, frame: &mut Frame, opcode: Opcode) -> RunResult<()> {
        let operand = frame.pop();
        let result = match opcode {
            Opcode::UnaryNot => Ok(Value::Bool(!operand.py_bool(&self.heap, self.interns))),
            Opcode::UnaryPositive => match &operand {
                Value::Float(f) => Ok(Value::Float(*f)),
                other => match other.as_int() {
                    Some(i) => Ok(Value::Int(i)),
                    None => Err(ExcType::unary_type_error("+", other.type_name(&self.heap))),
                },
            },
            Opcode::UnaryNegative => match &operand {
                Value::Float(f) => Ok(Value::Float(-*f)),
                other => match other.as_int() {
                    Some(i) => i.checked_neg().map(Value::Int).ok_or_else(ExcType::overflow),
                    None => Err(ExcType::unary_type_error("-", other.type_name(&self.heap))),
                },
            },
            Opcode::UnaryInvert => match operand.as_int() {
                Some(i) => Ok(Value::Int(!i)),
                None => Err(ExcType::unary_type_error("~", operand.type_name(&self.heap))),
            },
            _ => Err(RunError::internal("not a unary opcode")),
        };
        operand.drop_with_heap(&mut self.heap);
        frame.push(result?);
        Ok(())
    }

    pub(super) fn binary_op(&mut self, frame: &mut Frame, opcode: Opcode) -> RunResult<()> {
        let Some((op, inplace)) = BinOp::from_opcode(opcode) else {
            return Err(RunError::internal("not a binary opcode"));
        };
        let right = frame.pop();
        let left = frame.pop();
        if inplace && op == BinOp::Add && self.extend_list(&left, &right) {
            right.drop_with_heap(&mut self.heap);
            frame.push(left);
            return Ok(());
        }
        let left_type = left.type_name(&self.heap);
        let right_type = right.type_name(&self.heap);
        let result = self.binary_value(op, &left, &right);
        left.drop_with_heap(&mut self.heap);
        right.drop_with_heap(&mut self.heap);
        match result? {
            Some(value) => {
                frame.push(value);
                Ok(())
            }
            None => Err(ExcType::binary_type_error(&op.message_symbol(inplace), left_type, right_type)),
        }
    }

    /// `list += iterable` for list and tuple operands, mutating the list in place.
    fn extend_list(&mut self, left: &Value, right: &Value) -> bool {
        let Some(target) = left.ref_id() else {
            return false;
        };
        if !matches!(self.heap.get(target), HeapData::List(_)) {
            return false;
        }
        let items: Vec<Value> = match right.ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::List(items) | HeapData::Tuple(items)) => {
                items.iter().map(|item| item.clone_with_heap(&self.heap)).collect()
            }
            _ => return false,
        };
        if let HeapData::List(list) = self.heap.get_mut(target) {
            list.extend(items);
        }
        true
    }

    /// The result of a binary operator, or `None` when the operand types do not
    /// support it.
    fn binary_value(&mut self, op: BinOp, left: &Value, right: &Value) -> RunResult<Option<Value>> {
        if let (Value::Bool(a), Value::Bool(b)) = (left, right) {
            match op {
                BinOp::And => return Ok(Some(Value::Bool(a & b))),
                BinOp::Or => return Ok(Some(Value::Bool(a | b))),
                BinOp::Xor => return Ok(Some(Value::Bool(a ^ b))),
                _ => {}
            }
        }
        if let (Some(a), Some(b)) = (left.as_int(), right.as_int()) {
            return int_op(op, a, b).map(Some);
        }
        if let (Some(a), Some(b)) = (as_float(left), as_float(right)) {
            return float_op(op, a, b);
        }
        self.sequence_op(op, left, right)
    }

    fn sequence_op(&mut self, op: BinOp, left: &Value, right: &Value) -> RunResult<Option<Value>> {
        match op {
            BinOp::Add => {
                if let (Some(a), Some(b)) = (left.as_str(&self.heap, self.interns), right.as_str(&self.heap, self.interns)) {
                    let joined = format!("{a}{b}");
                    return Ok(Some(Value::Ref(self.heap.allocate(HeapData::Str(joined))?)));
                }
                let joined = match (self.ref_data(left), self.ref_data(right)) {
                    (Some(HeapData::List(a)), Some(HeapData::List(b))) => {
                        HeapData::List(a.iter().chain(b).map(|v| v.clone_with_heap(&self.heap)).collect())
                    }
                    (Some(HeapData::Tuple(a)), Some(HeapData::Tuple(b))) => {
                        HeapData::Tuple(a.iter().chain(b).map(|v| v.clone_with_heap(&self.heap)).collect())
                    }
                    _ => return Ok(None),
                };
                Ok(Some(Value::Ref(self.heap.allocate(joined)?)))
            }
            BinOp::Mul => {
                let (sequence, count) = match (left.as_int(), right.as_int()) {
                    (None, Some(count)) => (left, count),
                    (Some(count), None) => (right, count),
                    _ => return Ok(None),
                };
                let count = usize::try_from(count).unwrap_or(0);
                if let Some(text) = sequence.as_str(&self.heap, self.interns) {
                    check_repeat(text.len(), count)?;
                    let repeated = text.repeat(count);
                    return Ok(Some(Value::Ref(self.heap.allocate(HeapData::Str(repeated))?)));
                }
                let repeated = match self.ref_data(sequence) {
                    Some(HeapData::List(items)) => {
                        check_repeat(items.len(), count)?;
                        HeapData::List(self.repeat_items(items, count))
                    }
                    Some(HeapData::Tuple(items)) => {
                        check_repeat(items.len(), count)?;
                        HeapData::Tuple(self.repeat_items(items, count))
                    }
                    _ => return Ok(None),
                };
                Ok(Some(Value::Ref(self.heap.allocate(repeated)?)))
            }
            _ => Ok(None),
        }
    }

    fn ref_data(&self, value: &Value) -> Option<&HeapData> {
        value.ref_id().map(|id| self.heap.get(id))
    }

    fn repeat_items(&self, items: &[Value], count: usize) -> Vec<Value> {
        let mut out = Vec::with_capacity(items.len() * count);
        for _ in 0..count {
            out.extend(items.iter().map(|item| item.clone_with_heap(&self.heap)));
        }
        out
    }
}

fn check_repeat(len: usize, count: usize) -> RunResult<()> {
    match len.checked_mul(count) {
        Some(total) if total <= MAX_REPEAT_LEN => Ok(()),
        _ => Err(SimpleException::new_msg(ExcType::MemoryError, "repeated sequence is too long").into()),
    }
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Float(f) => Some(*f),
        other => other.as_int().map(|i| i as f64),
    }
}

fn int_op(op: BinOp, a: i64, b: i64) -> RunResult<Value> {
    let int = |result: Option<i64>| result.map(Value::Int).ok_or_else(ExcType::overflow);
    match op {
        BinOp::Add => int(a.checked_add(b)),
        BinOp::Sub => int(a.checked_sub(b)),
        BinOp::Mul => int(a.checked_mul(b)),
        BinOp::TrueDiv => {
            if b == 0 {
                return Err(ExcType::zero_division("division by zero"));
            }
            Ok(Value::Float(a as f64 / b as f64))
        }
        BinOp::FloorDiv => {
            if b == 0 {
                return Err(ExcType::zero_division("integer division or modulo by zero"));
            }
            let quotient = a.checked_div(b).ok_or_else(ExcType::overflow)?;
            let adjust = a.wrapping_rem(b) != 0 && ((a < 0) != (b < 0));
            Ok(Value::Int(if adjust { quotient - 1 } else { quotient }))
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(ExcType::zero_division("integer division or modulo by zero"));
            }
            let rem = a.wrapping_rem(b);
            Ok(Value::Int(if rem != 0 && ((rem < 0) != (b < 0)) { rem + b } else { rem }))
        }
        BinOp::Pow => int_pow(a, b),
        BinOp::Lshift => {
            if b < 0 {
                return Err(ExcType::value_error("negative shift count"));
            }
            if a == 0 {
                return Ok(Value::Int(0));
            }
            let shift = u32::try_from(b).ok().filter(|&s| s < 64).ok_or_else(ExcType::overflow)?;
            let shifted = a << shift;
            if shifted >> shift == a {
                Ok(Value::Int(shifted))
            } else {
                Err(ExcType::overflow())
            }
        }
        BinOp::Rshift => {
            if b < 0 {
                return Err(ExcType::value_error("negative shift count"));
            }
            let shift = u32::try_from(b.min(63)).unwrap_or(63);
            Ok(Value::Int(a >> shift))
        }
        BinOp::And => Ok(Value::Int(a & b)),
        BinOp::Xor => Ok(Value::Int(a ^ b)),
        BinOp::Or => Ok(Value::Int(a | b)),
    }
}

fn int_pow(base: i64, exp: i64) -> RunResult<Value> {
    if exp < 0 {
        if base == 0 {
            return Err(ExcType::zero_division("0.0 cannot be raised to a negative power"));
        }
        return Ok(Value::Float((base as f64).powf(exp as f64)));
    }
    match base {
        0 | 1 => return Ok(Value::Int(if exp == 0 { 1 } else { base })),
        -1 => return Ok(Value::Int(if exp % 2 == 0 { 1 } else { -1 })),
        _ => {}
    }
    u32::try_from(exp)
        .ok()
        .and_then(|exp| base.checked_pow(exp))
        .map(Value::Int)
        .ok_or_else(ExcType::overflow)
}

fn float_op(op: BinOp, a: f64, b: f64) -> RunResult<Option<Value>> {
    let value = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::TrueDiv => {
            if b == 0.0 {
                return Err(ExcType::zero_division("float division by zero"));
            }
            a / b
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return Err(ExcType::zero_division("float divmod()"));
            }
            (a / b).floor()
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Err(ExcType::zero_division("float modulo"));
            }
            let rem = a % b;
            if rem != 0.0 && ((rem < 0.0) != (b < 0.0)) { rem + b } else { rem }
        }
        BinOp::Pow => {
            if a == 0.0 && b < 0.0 {
                return Err(ExcType::zero_division("0.0 cannot be raised to a negative power"));
            }
            if a < 0.0 && b.fract() != 0.0 {
                return Err(ExcType::value_error("negative number cannot be raised to a fractional power"));
            }
            a.powf(b)
        }
        BinOp::Lshift | BinOp::Rshift | BinOp::And | BinOp::Xor | BinOp::Or => return Ok(None),
    };
    Ok(Some(Value::Float(value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(value: RunResult<Value>) -> i64 {
        match value {
            Ok(Value::Int(i)) => i,
            other => panic!("expected an int, got {other:?}"),
        }
    }

    #[test]
    fn floor_division_and_modulo_round_toward_negative_infinity() {
        assert_eq!(int(int_op(BinOp::FloorDiv, 7, 2)), 3);
        assert_eq!(int(int_op(BinOp::FloorDiv, -7, 2)), -4);
        assert_eq!(int(int_op(BinOp::FloorDiv, 7, -2)), -4);
        assert_eq!(int(int_op(BinOp::Mod, -7, 2)), 1);
        assert_eq!(int(int_op(BinOp::Mod, 7, -2)), -1);
        assert_eq!(int(int_op(BinOp::Mod, i64::MIN, -1)), 0);
    }

    #[test]
    fn integer_overflow_raises() {
        for result in [
            int_op(BinOp::Add, i64::MAX, 1),
            int_op(BinOp::Mul, i64::MAX, 2),
            int_op(BinOp::FloorDiv, i64::MIN, -1),
            int_op(BinOp::Lshift, 1, 64),
            int_op(BinOp::Pow, 2, 64),
        ] {
            assert!(matches!(result, Err(err) if err.matches(ExcType::OverflowError)));
        }
    }

    #[test]
    fn shifts_and_powers() {
        assert_eq!(int(int_op(BinOp::Lshift, 3, 4)), 48);
        assert_eq!(int(int_op(BinOp::Rshift, -1, 100)), -1);
        assert_eq!(int(int_op(BinOp::Pow, -1, i64::MAX)), -1);
        assert_eq!(int(int_op(BinOp::Pow, 3, 4)), 81);
        assert!(matches!(int_op(BinOp::Pow, 2, -1), Ok(Value::Float(f)) if (f - 0.5).abs() < f64::EPSILON));
        assert!(matches!(int_op(BinOp::Lshift, 1, -1), Err(err) if err.matches(ExcType::ValueError)));
    }

    #[test]
    fn division_by_zero() {
        assert!(matches!(int_op(BinOp::TrueDiv, 1, 0), Err(err) if err.matches(ExcType::ZeroDivisionError)));
        assert!(matches!(float_op(BinOp::Mod, 1.0, 0.0), Err(err) if err.matches(ExcType::ZeroDivisionError)));
        assert!(matches!(float_op(BinOp::And, 1.0, 0.0), Ok(None)));
    }

    #[test]
    fn message_symbols() {
        assert_eq!(BinOp::Pow.message_symbol(false), "** or pow()");
        assert_eq!(BinOp::Pow.message_symbol(true), "**=");
        assert_eq!(BinOp::FloorDiv.message_symbol(false), "//");
    }
}
