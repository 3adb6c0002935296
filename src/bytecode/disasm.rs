use std::collections::BTreeSet;
use std::fmt::Write;

use crate::bytecode::{Instruction, Opcode, Operand, Program};

/// Render a program as text, one instruction per line.
///
/// Jump targets are marked with `►`; function and class bodies are indented
/// under the instruction that defines them.
pub fn disassemble(program: &Program) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "════════════════════════════════════════");
    let _ = writeln!(out, " {} instructions", program.len());
    let _ = writeln!(out, "════════════════════════════════════════");
    disassemble_instructions(&mut out, &program.instructions);

    if !program.handlers.is_empty() {
        let _ = writeln!(out, "handlers:");
        for handler in &program.handlers {
            let _ = writeln!(
                out,
                "  {:04}..{:04} -> {:04}{}",
                handler.start,
                handler.end,
                handler.target,
                handler
                    .capture
                    .as_ref()
                    .map(|name| format!(" as {}", name))
                    .unwrap_or_default()
            );
        }
    }

    out
}

fn disassemble_instructions(out: &mut String, instructions: &[Instruction]) {
    let jump_targets = collect_jump_targets(instructions);

    // Ends of the bodies we are currently inside, innermost last.
    let mut body_ends: Vec<usize> = Vec::new();

    for (ip, instruction) in instructions.iter().enumerate() {
        while body_ends.last().is_some_and(|end| *end <= ip) {
            body_ends.pop();
        }

        let prefix = "  ".repeat(body_ends.len());

        if jump_targets.contains(&ip) {
            let _ = writeln!(out, "{}      ┌──────────────────────────────────", prefix);
        }

        let marker = if jump_targets.contains(&ip) { "► " } else { "  " };
        let _ = writeln!(
            out,
            "{}{:04} {}{}",
            prefix,
            ip,
            marker,
            format_instruction(instruction, ip)
        );

        if let Some(len) = body_length(instruction) {
            body_ends.push(ip.saturating_add(1).saturating_add(len));
        }
    }
}

fn body_length(instruction: &Instruction) -> Option<usize> {
    match (instruction.opcode, &instruction.operand) {
        (
            Opcode::NewFunction | Opcode::NewClassFunction | Opcode::NewClass,
            Operand::Pair(len, _),
        ) => Some(*len),
        (Opcode::NewModule, Operand::Integer(len)) => usize::try_from(*len).ok(),
        _ => None,
    }
}

fn collect_jump_targets(instructions: &[Instruction]) -> BTreeSet<usize> {
    instructions
        .iter()
        .enumerate()
        .filter_map(|(ip, instruction)| {
            let offset = instruction.offset()?;
            usize::try_from((ip as i64).checked_add(offset)?).ok()
        })
        .collect()
}

fn mnemonic(opcode: Opcode) -> &'static str {
    match opcode {
        Opcode::Nop => "NOP",
        Opcode::NewString => "NEW_STRING",
        Opcode::NewInteger => "NEW_INTEGER",
        Opcode::NewFloat => "NEW_FLOAT",
        Opcode::NewTrue => "NEW_TRUE",
        Opcode::NewFalse => "NEW_FALSE",
        Opcode::NewNone => "NEW_NONE",
        Opcode::NewArray => "NEW_ARRAY",
        Opcode::NewTuple => "NEW_TUPLE",
        Opcode::NewFunction => "NEW_FUNCTION",
        Opcode::NewClassFunction => "NEW_CLASS_FUNCTION",
        Opcode::LoadFunctionArguments => "LOAD_FUNCTION_ARGS",
        Opcode::NewClass => "NEW_CLASS",
        Opcode::NewModule => "NEW_MODULE",
        Opcode::Identifier => "IDENTIFIER",
        Opcode::Selector => "SELECTOR",
        Opcode::Index => "INDEX",
        Opcode::Call => "CALL",
        Opcode::Return => "RETURN",
        Opcode::Pop => "POP",
        Opcode::Raise => "RAISE",
        Opcode::AssignIdentifier => "ASSIGN_IDENTIFIER",
        Opcode::AssignSelector => "ASSIGN_SELECTOR",
        Opcode::AssignIndex => "ASSIGN_INDEX",
        Opcode::DeleteIdentifier => "DELETE_IDENTIFIER",
        Opcode::DeleteSelector => "DELETE_SELECTOR",
        Opcode::DeleteIndex => "DELETE_INDEX",
        Opcode::Not => "NOT",
        Opcode::Negative => "NEGATIVE",
        Opcode::NegateBits => "NEGATE_BITS",
        Opcode::Add => "ADD",
        Opcode::Sub => "SUB",
        Opcode::Mul => "MUL",
        Opcode::Div => "DIV",
        Opcode::FloorDiv => "FLOOR_DIV",
        Opcode::Mod => "MOD",
        Opcode::Pow => "POW",
        Opcode::BitAnd => "BIT_AND",
        Opcode::BitOr => "BIT_OR",
        Opcode::BitXor => "BIT_XOR",
        Opcode::ShiftLeft => "SHIFT_LEFT",
        Opcode::ShiftRight => "SHIFT_RIGHT",
        Opcode::And => "AND",
        Opcode::Or => "OR",
        Opcode::Xor => "XOR",
        Opcode::Equals => "EQUALS",
        Opcode::NotEquals => "NOT_EQUALS",
        Opcode::Greater => "GREATER",
        Opcode::GreaterOrEqual => "GREATER_OR_EQUAL",
        Opcode::Less => "LESS",
        Opcode::LessOrEqual => "LESS_OR_EQUAL",
        Opcode::Implements => "IMPLEMENTS",
        Opcode::Jump => "JUMP",
        Opcode::JumpIfFalse => "JUMP_IF_FALSE",
        Opcode::JumpIfTrue => "JUMP_IF_TRUE",
        Opcode::Break => "BREAK",
        Opcode::Continue => "CONTINUE",
        Opcode::Redo => "REDO",
        Opcode::ForLoop => "FOR_LOOP",
    }
}

fn format_instruction(instruction: &Instruction, ip: usize) -> String {
    let name = mnemonic(instruction.opcode);

    let operand = match &instruction.operand {
        Operand::None if instruction.opcode.is_loop_marker() => "?".to_string(),
        Operand::None => String::new(),
        Operand::Integer(offset) if instruction.opcode.is_jump() => {
            match (ip as i64).checked_add(*offset) {
                Some(target) => format!("{:+}  ; -> {:04}", offset, target),
                None => format!("{:+}  ; -> ?", offset),
            }
        }
        Operand::Integer(value) => value.to_string(),
        Operand::Text(text) if instruction.opcode == Opcode::NewString => format!("{:?}", text),
        Operand::Text(text) => text.clone(),
        Operand::Names(names) => format!("({})", names.join(", ")),
        Operand::Pair(len, count) => match instruction.opcode {
            Opcode::NewClass => format!("len={} bases={}", len, count),
            _ => format!("len={} arity={}", len, count),
        },
    };

    if operand.is_empty() {
        name.to_string()
    } else {
        format!("{:<20}{}", name, operand)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::compile::Compiler;
    use crate::lang::node::{Expression, Node, Statement};

    #[test]
    fn test_marks_jump_targets() {
        let nodes: Vec<Node> = vec![
            Statement::While {
                condition: Expression::True,
                body: vec![Statement::Break.into()],
            }
            .into(),
        ];
        let program = Compiler::new().compile_program(&nodes).unwrap();
        let text = disassemble(&program);

        assert!(text.contains("0000 ► NEW_TRUE"));
        assert!(text.contains("JUMP_IF_FALSE       +3  ; -> 0004"));
        assert!(text.contains("BREAK               +2  ; -> 0004"));
    }

    #[test]
    fn test_indents_function_bodies() {
        let nodes: Vec<Node> = vec![Statement::function("f", &["a"], vec![]).into()];
        let program = Compiler::new().compile_program(&nodes).unwrap();
        let text = disassemble(&program);

        assert!(text.contains("0000   NEW_FUNCTION        len=2 arity=1"));
        assert!(text.contains("  0001   LOAD_FUNCTION_ARGS  (a)"));
        assert!(text.contains("\n0003   ASSIGN_IDENTIFIER   f"));
    }

    #[test]
    fn test_overflowing_operands_still_render() {
        let program = Program::new(vec![
            Instruction::with_integer(Opcode::Jump, i64::MAX),
            Instruction::new(Opcode::NewFunction, Operand::Pair(usize::MAX, 0), 1),
            Instruction::bare(Opcode::Nop),
        ]);
        let text = disassemble(&program);

        assert!(text.contains(&format!("JUMP                +{}  ; -> ?", i64::MAX)));
        assert!(text.contains("\n  0002   NOP"));
    }

    #[test]
    fn test_unresolved_marker_shows_placeholder() {
        let program = Program::new(vec![Instruction::bare(Opcode::Continue)]);
        assert!(disassemble(&program).contains("CONTINUE            ?"));
    }
}
