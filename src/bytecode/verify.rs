use crate::bytecode::{Instruction, Opcode, Operand, Program};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VerifyError {
    #[error("verify error at {ip:04}: jump by {offset} leaves program of {len} instructions")]
    JumpOutOfRange { ip: usize, offset: i64, len: usize },

    #[error("verify error at {ip:04}: unresolved {opcode:?} marker")]
    UnresolvedMarker { ip: usize, opcode: Opcode },

    #[error("verify error at {ip:04}: body of {body} instructions runs past the end of the program")]
    BodyOutOfRange { ip: usize, body: usize },

    #[error("verify error at {ip:04}: {opcode:?} expects {expected} operand")]
    BadOperand {
        ip: usize,
        opcode: Opcode,
        expected: &'static str,
    },

    #[error("verify error: handler region {start}..{end} -> {target} outside program of {len} instructions")]
    HandlerOutOfRange {
        start: usize,
        end: usize,
        target: usize,
        len: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum OperandShape {
    None,
    Integer,
    Count,
    Text,
    Names,
    Pair,
    /// Loop markers: nothing before patching, an offset after.
    Marker,
}

impl OperandShape {
    fn describe(self) -> &'static str {
        match self {
            OperandShape::None => "no",
            OperandShape::Integer => "an integer",
            OperandShape::Count => "a non-negative count",
            OperandShape::Text => "a text",
            OperandShape::Names => "a name list",
            OperandShape::Pair => "a pair",
            OperandShape::Marker => "an offset",
        }
    }

    fn accepts(self, operand: &Operand) -> bool {
        match (self, operand) {
            (OperandShape::None, Operand::None) => true,
            (OperandShape::Integer, Operand::Integer(_)) => true,
            (OperandShape::Count, Operand::Integer(n)) => *n >= 0,
            (OperandShape::Text, Operand::Text(_)) => true,
            (OperandShape::Names, Operand::Names(_)) => true,
            (OperandShape::Pair, Operand::Pair(..)) => true,
            (OperandShape::Marker, Operand::None | Operand::Integer(_)) => true,
            _ => false,
        }
    }
}

fn shape(opcode: Opcode) -> OperandShape {
    use Opcode::*;
    match opcode {
        NewInteger | Jump | JumpIfFalse | JumpIfTrue => OperandShape::Integer,
        NewArray | NewTuple | NewModule | Call | Return => OperandShape::Count,
        NewString | NewFloat | Identifier | Selector | AssignIdentifier | AssignSelector
        | DeleteIdentifier | DeleteSelector => OperandShape::Text,
        LoadFunctionArguments | ForLoop => OperandShape::Names,
        NewFunction | NewClassFunction | NewClass => OperandShape::Pair,
        Break | Continue | Redo => OperandShape::Marker,
        _ => OperandShape::None,
    }
}

/// Check a program before it runs: operand shapes, jump targets, embedded
/// body ranges and handler regions. Targets may equal the program length
/// (falling off the end terminates execution).
pub fn check_program(program: &Program) -> Result<(), VerifyError> {
    check_instructions(&program.instructions)?;

    let len = program.len();
    for handler in &program.handlers {
        if handler.start > handler.end || handler.end > len || handler.target >= len {
            return Err(VerifyError::HandlerOutOfRange {
                start: handler.start,
                end: handler.end,
                target: handler.target,
                len,
            });
        }
    }
    Ok(())
}

pub fn check_instructions(instructions: &[Instruction]) -> Result<(), VerifyError> {
    let len = instructions.len();

    for (ip, instruction) in instructions.iter().enumerate() {
        let expected = shape(instruction.opcode);
        if !expected.accepts(&instruction.operand) {
            return Err(VerifyError::BadOperand {
                ip,
                opcode: instruction.opcode,
                expected: expected.describe(),
            });
        }

        if instruction.is_unresolved_marker() {
            return Err(VerifyError::UnresolvedMarker {
                ip,
                opcode: instruction.opcode,
            });
        }

        if let Some(offset) = instruction.offset() {
            let in_range = (ip as i64)
                .checked_add(offset)
                .is_some_and(|target| (0..=len as i64).contains(&target));
            if !in_range {
                return Err(VerifyError::JumpOutOfRange { ip, offset, len });
            }
        }

        let body = match instruction.operand {
            Operand::Pair(body, _) => Some(body),
            Operand::Integer(body) if instruction.opcode == Opcode::NewModule => {
                Some(body as usize)
            }
            _ => None,
        };
        if let Some(body) = body {
            // ip < len, so the remaining count can't underflow.
            if body > len - ip - 1 {
                return Err(VerifyError::BodyOutOfRange { ip, body });
            }
        }
    }

    Ok(())
}
