use serde::{Deserialize, Serialize};

use crate::lang::operator::{BinaryOp, UnaryOp};

// =============================================================================
// OPCODE - Instruction kinds
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    Nop,

    // literals
    NewString,
    NewInteger,
    NewFloat,
    NewTrue,
    NewFalse,
    NewNone,
    /// `Integer(n)`: pops n elements, first popped becomes element 0.
    NewArray,
    NewTuple,

    // ==========================================================================
    // Definitions
    // ==========================================================================
    /// `Pair(len, arity)`: captures the `len` following instructions as a
    /// function body and skips over them.
    NewFunction,
    /// As `NewFunction`, but the function binds `self` when read off an instance.
    NewClassFunction,
    /// `Names(params)`: pops one argument per parameter into the call scope.
    LoadFunctionArguments,
    /// `Pair(len, bases)`: pops the class name and its bases, then runs the
    /// `len` following instructions as the class body.
    NewClass,
    /// `Integer(len)`: pops the module name, runs the body in a fresh namespace.
    NewModule,

    // access
    Identifier,
    Selector,
    Index,

    // ==========================================================================
    // Calls
    // ==========================================================================
    /// `Integer(argc)`: pops the callee; arguments stay on the stack for the
    /// callee's `LoadFunctionArguments`.
    Call,
    /// `Integer(n)`: returns n results to the caller.
    Return,
    Pop,
    Raise,

    // assignment
    AssignIdentifier,
    AssignSelector,
    AssignIndex,
    DeleteIdentifier,
    DeleteSelector,
    DeleteIndex,

    // unary
    Not,
    Negative,
    NegateBits,

    // arithmetic
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,

    // bitwise
    BitAnd,
    BitOr,
    BitXor,
    ShiftLeft,
    ShiftRight,

    // logic
    And,
    Or,
    Xor,

    // comparison
    Equals,
    NotEquals,
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
    Implements,

    // ==========================================================================
    // Jumps. Offsets are relative to the ip of the jump instruction itself.
    // ==========================================================================
    /// Unconditional relative jump. Jump(1) is a no-op, Jump(0) loops forever.
    Jump,

    /// Pop a value, jump if it is falsy. Otherwise continue to the next instruction.
    JumpIfFalse,

    /// Pop a value, jump if it is truthy. Otherwise continue to the next instruction.
    JumpIfTrue,

    /// Loop exits. Emitted without an offset, patched by the enclosing loop.
    Break,
    Continue,
    Redo,

    /// `Names(receivers)`: binds the next element of the source on top of the
    /// stack and skips the exit jump that follows. Once the source is
    /// exhausted, falls through to that exit jump; the source stays on the
    /// stack for the `Pop` after the loop.
    ForLoop,
}

impl Opcode {
    pub fn from_binary(op: BinaryOp) -> Opcode {
        match op {
            BinaryOp::Add => Opcode::Add,
            BinaryOp::Sub => Opcode::Sub,
            BinaryOp::Mul => Opcode::Mul,
            BinaryOp::Div => Opcode::Div,
            BinaryOp::FloorDiv => Opcode::FloorDiv,
            BinaryOp::Mod => Opcode::Mod,
            BinaryOp::Pow => Opcode::Pow,
            BinaryOp::BitAnd => Opcode::BitAnd,
            BinaryOp::BitOr => Opcode::BitOr,
            BinaryOp::BitXor => Opcode::BitXor,
            BinaryOp::ShiftLeft => Opcode::ShiftLeft,
            BinaryOp::ShiftRight => Opcode::ShiftRight,
            BinaryOp::And => Opcode::And,
            BinaryOp::Or => Opcode::Or,
            BinaryOp::Xor => Opcode::Xor,
            BinaryOp::Equals => Opcode::Equals,
            BinaryOp::NotEquals => Opcode::NotEquals,
            BinaryOp::Greater => Opcode::Greater,
            BinaryOp::GreaterOrEqual => Opcode::GreaterOrEqual,
            BinaryOp::Less => Opcode::Less,
            BinaryOp::LessOrEqual => Opcode::LessOrEqual,
        }
    }

    pub fn binary_op(self) -> Option<BinaryOp> {
        BinaryOp::ALL
            .into_iter()
            .find(|op| Opcode::from_binary(*op) == self)
    }

    pub fn from_unary(op: UnaryOp) -> Opcode {
        match op {
            UnaryOp::Not => Opcode::Not,
            UnaryOp::Negative => Opcode::Negative,
            UnaryOp::NegateBits => Opcode::NegateBits,
        }
    }

    pub fn is_jump(self) -> bool {
        matches!(
            self,
            Opcode::Jump
                | Opcode::JumpIfFalse
                | Opcode::JumpIfTrue
                | Opcode::Break
                | Opcode::Continue
                | Opcode::Redo
        )
    }

    pub fn is_loop_marker(self) -> bool {
        matches!(self, Opcode::Break | Opcode::Continue | Opcode::Redo)
    }
}

// =============================================================================
// INSTRUCTION
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    None,
    /// Jump offsets, counts and integer literals.
    Integer(i64),
    Text(String),
    Names(Vec<String>),
    Pair(usize, usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: Opcode,
    pub line: usize,
    pub operand: Operand,
}

impl Instruction {
    pub fn new(opcode: Opcode, operand: Operand, line: usize) -> Self {
        Instruction {
            opcode,
            line,
            operand,
        }
    }

    pub fn bare(opcode: Opcode) -> Self {
        Instruction::new(opcode, Operand::None, 0)
    }

    pub fn with_integer(opcode: Opcode, value: i64) -> Self {
        Instruction::new(opcode, Operand::Integer(value), 0)
    }

    pub fn with_text(opcode: Opcode, text: &str) -> Self {
        Instruction::new(opcode, Operand::Text(text.to_string()), 0)
    }

    /// Resolved offset of a jump; `None` for loop markers not yet patched.
    pub fn offset(&self) -> Option<i64> {
        match (&self.operand, self.opcode.is_jump()) {
            (Operand::Integer(offset), true) => Some(*offset),
            _ => None,
        }
    }

    pub fn is_unresolved_marker(&self) -> bool {
        self.opcode.is_loop_marker() && self.operand == Operand::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_opcode_mapping_round_trips() {
        for op in BinaryOp::ALL {
            assert_eq!(Opcode::from_binary(op).binary_op(), Some(op));
        }
        assert_eq!(Opcode::Jump.binary_op(), None);
    }

    #[test]
    fn test_unresolved_marker() {
        assert!(Instruction::bare(Opcode::Break).is_unresolved_marker());
        assert!(!Instruction::with_integer(Opcode::Break, 3).is_unresolved_marker());
        assert!(!Instruction::bare(Opcode::Jump).is_unresolved_marker());
    }

    #[test]
    fn test_offset_only_for_jumps() {
        assert_eq!(Instruction::with_integer(Opcode::Jump, -4).offset(), Some(-4));
        assert_eq!(Instruction::with_integer(Opcode::NewInteger, 4).offset(), None);
        assert_eq!(Instruction::bare(Opcode::Continue).offset(), None);
    }
}
