use tracing::{debug, trace};

use crate::{
    bytecode::{Instruction, Opcode, Operand, Program, compile_error::CompileError},
    lang::{
        node::{Expression, FunctionDefinition, Node, NodeKind, Statement},
        operator::AssignOp,
        protocol::Protocol,
    },
};

/// Lowers the simplified syntax tree into a flat instruction stream.
///
/// Nodes lower independently and compose by concatenation. Control-flow
/// targets are relative offsets, computed once a body has been emitted and
/// its length is known.
pub struct Compiler {
    /// Source line stamped on emitted instructions.
    line: usize,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

/// Lower a single node.
pub fn compile(node: &Node) -> Result<Vec<Instruction>, CompileError> {
    Compiler::new().compile_nodes(std::slice::from_ref(node))
}

impl Compiler {
    pub fn new() -> Self {
        Compiler { line: 0 }
    }

    /// Compile a top-level program.
    pub fn compile_program(mut self, nodes: &[Node]) -> Result<Program, CompileError> {
        let instructions = self.compile_nodes(nodes)?;
        ensure_no_markers(&instructions)?;

        debug!(instructions = instructions.len(), "compiled program");
        Ok(Program::new(instructions))
    }

    pub fn compile_nodes(&mut self, nodes: &[Node]) -> Result<Vec<Instruction>, CompileError> {
        let mut ops = Vec::new();
        for node in nodes {
            self.compile_node(node, &mut ops)?;
        }
        Ok(ops)
    }

    pub fn compile_node(
        &mut self,
        node: &Node,
        ops: &mut Vec<Instruction>,
    ) -> Result<(), CompileError> {
        self.line = node.line;

        match &node.kind {
            NodeKind::Expression(expression) => {
                self.compile_expression(expression, ops)?;
                ops.push(self.emit(Opcode::Pop));
                Ok(())
            }
            NodeKind::Statement(statement) => self.compile_statement(statement, &node.kind, ops),
        }
    }

    fn emit(&self, opcode: Opcode) -> Instruction {
        Instruction::new(opcode, Operand::None, self.line)
    }

    fn emit_with(&self, opcode: Opcode, operand: Operand) -> Instruction {
        Instruction::new(opcode, operand, self.line)
    }

    fn emit_text(&self, opcode: Opcode, text: &str) -> Instruction {
        self.emit_with(opcode, Operand::Text(text.to_string()))
    }

    fn emit_integer(&self, opcode: Opcode, value: i64) -> Instruction {
        self.emit_with(opcode, Operand::Integer(value))
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn compile_statement(
        &mut self,
        statement: &Statement,
        kind: &NodeKind,
        ops: &mut Vec<Instruction>,
    ) -> Result<(), CompileError> {
        match statement {
            Statement::Assignment { target, op, value } => {
                self.compile_assignment(target, *op, value, ops)
            }
            Statement::Delete(target) => self.compile_delete(target, ops),

            Statement::If {
                condition,
                body,
                else_body,
            } => {
                self.compile_expression(condition, ops)?;
                let jumps = if else_body.is_empty() {
                    self.compile_when_jumps(body)?
                } else {
                    self.compile_if_jumps(body, else_body)?
                };
                ops.extend(jumps);
                Ok(())
            }

            Statement::While { condition, body } => {
                let result = self.compile_while_jumps(condition, body, Opcode::JumpIfFalse)?;
                ops.extend(result);
                Ok(())
            }
            Statement::Until { condition, body } => {
                let result = self.compile_while_jumps(condition, body, Opcode::JumpIfTrue)?;
                ops.extend(result);
                Ok(())
            }
            Statement::DoWhile { body, condition } => {
                let result = self.compile_do_while_jumps(body, condition)?;
                ops.extend(result);
                Ok(())
            }
            Statement::For {
                receivers,
                source,
                body,
            } => {
                self.compile_expression(source, ops)?;
                let result = self.compile_for_jumps(receivers, body)?;
                ops.extend(result);
                Ok(())
            }

            // Targets are filled in by the enclosing loop.
            Statement::Break => {
                ops.push(self.emit(Opcode::Break));
                Ok(())
            }
            Statement::Continue => {
                ops.push(self.emit(Opcode::Continue));
                Ok(())
            }
            Statement::Redo => {
                ops.push(self.emit(Opcode::Redo));
                Ok(())
            }

            Statement::Pass => {
                ops.push(self.emit(Opcode::Nop));
                Ok(())
            }
            Statement::Block(body) => {
                let result = self.compile_nodes(body)?;
                ops.extend(result);
                Ok(())
            }

            Statement::Return(results) => {
                // Reverse order, so the receiving side pops them in declaration order.
                for result in results.iter().rev() {
                    self.compile_expression(result, ops)?;
                }
                ops.push(self.emit_integer(Opcode::Return, results.len() as i64));
                Ok(())
            }
            Statement::Raise(value) => {
                self.compile_expression(value, ops)?;
                ops.push(self.emit(Opcode::Raise));
                Ok(())
            }

            Statement::FunctionDefinition(definition) => {
                self.compile_function(definition, Opcode::NewFunction, ops)
            }
            Statement::Class { name, bases, body } => self.compile_class(name, bases, body, ops),
            Statement::Module { name, body } => self.compile_module(name, body, ops),

            Statement::GeneratorDefinition(_) | Statement::Yield(_) => {
                Err(CompileError::unsupported(
                    kind,
                    self.line,
                    "functions run to completion; generators need a suspension primitive",
                ))
            }
            Statement::Defer(_) => Err(CompileError::unsupported(
                kind,
                self.line,
                "deferred calls are not lowered by this backend",
            )),
            Statement::Require(_) => Err(CompileError::unsupported(
                kind,
                self.line,
                "module loading belongs to the host; pass the loaded module in as a binding",
            )),
        }
    }

    fn compile_assignment(
        &mut self,
        target: &Expression,
        op: AssignOp,
        value: &Expression,
        ops: &mut Vec<Instruction>,
    ) -> Result<(), CompileError> {
        self.compile_expression(value, ops)?;

        if let AssignOp::Compound(op) = op {
            // Current value goes on top, so it becomes the left operand.
            self.compile_expression(target, ops)?;
            ops.push(self.emit(Opcode::from_binary(op)));
        }

        match target {
            Expression::Identifier(name) => {
                ops.push(self.emit_text(Opcode::AssignIdentifier, name));
            }
            Expression::Selector { receiver, name } => {
                self.compile_expression(receiver, ops)?;
                ops.push(self.emit_text(Opcode::AssignSelector, name));
            }
            Expression::Index { source, index } => {
                self.compile_expression(source, ops)?;
                self.compile_expression(index, ops)?;
                ops.push(self.emit(Opcode::AssignIndex));
            }
            other => return Err(CompileError::invalid_target(other, "assignment", self.line)),
        }
        Ok(())
    }

    fn compile_delete(
        &mut self,
        target: &Expression,
        ops: &mut Vec<Instruction>,
    ) -> Result<(), CompileError> {
        match target {
            Expression::Identifier(name) => {
                ops.push(self.emit_text(Opcode::DeleteIdentifier, name));
            }
            Expression::Selector { receiver, name } => {
                self.compile_expression(receiver, ops)?;
                ops.push(self.emit_text(Opcode::DeleteSelector, name));
            }
            Expression::Index { source, index } => {
                self.compile_expression(source, ops)?;
                self.compile_expression(index, ops)?;
                ops.push(self.emit(Opcode::DeleteIndex));
            }
            other => return Err(CompileError::invalid_target(other, "delete", self.line)),
        }
        Ok(())
    }

    // =========================================================================
    // Definitions
    // =========================================================================

    /// Emits:
    ///
    /// ```text
    /// NEW_FUNCTION          (len, arity)
    /// LOAD_FUNCTION_ARGS    params        ┐
    /// ...body...                          │ len instructions
    /// RETURN 0              (implicit)    ┘
    /// ASSIGN_IDENTIFIER     name
    /// ```
    fn compile_function(
        &mut self,
        definition: &FunctionDefinition,
        opcode: Opcode,
        ops: &mut Vec<Instruction>,
    ) -> Result<(), CompileError> {
        let line = self.line;

        let mut body = vec![self.emit_with(
            Opcode::LoadFunctionArguments,
            Operand::Names(definition.parameters.clone()),
        )];
        body.extend(self.compile_nodes(&definition.body)?);
        ensure_no_markers(&body)?;

        self.line = line;
        let ends_with_return = matches!(
            definition.body.last(),
            Some(Node {
                kind: NodeKind::Statement(Statement::Return(_)),
                ..
            })
        );
        if !ends_with_return {
            body.push(self.emit_integer(Opcode::Return, 0));
        }

        ops.push(self.emit_with(
            opcode,
            Operand::Pair(body.len(), definition.parameters.len()),
        ));
        ops.extend(body);
        ops.push(self.emit_text(Opcode::AssignIdentifier, &definition.name));
        Ok(())
    }

    /// Bases are pushed last-first, then the name, then the body follows
    /// `NEW_CLASS (len, base_count)` inline and runs at definition time.
    fn compile_class(
        &mut self,
        name: &str,
        bases: &[Expression],
        body: &[Node],
        ops: &mut Vec<Instruction>,
    ) -> Result<(), CompileError> {
        let line = self.line;

        for base in bases.iter().rev() {
            self.compile_expression(base, ops)?;
        }
        ops.push(self.emit_text(Opcode::NewString, name));

        let body_ops = self.compile_class_body(body)?;
        self.line = line;

        ops.push(self.emit_with(Opcode::NewClass, Operand::Pair(body_ops.len(), bases.len())));
        ops.extend(body_ops);
        ops.push(self.emit_text(Opcode::AssignIdentifier, name));
        Ok(())
    }

    fn compile_class_body(&mut self, body: &[Node]) -> Result<Vec<Instruction>, CompileError> {
        let mut ops = Vec::new();
        let mut has_initializer = false;

        for node in body {
            match &node.kind {
                NodeKind::Statement(Statement::FunctionDefinition(definition)) => {
                    self.line = node.line;
                    if definition.name == Protocol::Initialize.name() {
                        has_initializer = true;
                    }
                    self.compile_function(definition, Opcode::NewClassFunction, &mut ops)?;
                }
                _ => self.compile_node(node, &mut ops)?,
            }
        }

        if !has_initializer {
            let initializer = FunctionDefinition {
                name: Protocol::Initialize.name().to_string(),
                parameters: Vec::new(),
                body: Vec::new(),
            };
            self.compile_function(&initializer, Opcode::NewClassFunction, &mut ops)?;
        }

        ensure_no_markers(&ops)?;
        ops.push(self.emit_integer(Opcode::Return, 0));
        Ok(ops)
    }

    fn compile_module(
        &mut self,
        name: &str,
        body: &[Node],
        ops: &mut Vec<Instruction>,
    ) -> Result<(), CompileError> {
        let line = self.line;
        ops.push(self.emit_text(Opcode::NewString, name));

        let mut body_ops = self.compile_nodes(body)?;
        ensure_no_markers(&body_ops)?;
        self.line = line;
        body_ops.push(self.emit_integer(Opcode::Return, 0));

        ops.push(self.emit_integer(Opcode::NewModule, body_ops.len() as i64));
        ops.extend(body_ops);
        ops.push(self.emit_text(Opcode::AssignIdentifier, name));
        Ok(())
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    pub fn compile_expression(
        &mut self,
        expression: &Expression,
        ops: &mut Vec<Instruction>,
    ) -> Result<(), CompileError> {
        match expression {
            Expression::Integer(value) => ops.push(self.emit_integer(Opcode::NewInteger, *value)),
            Expression::Float(text) => ops.push(self.emit_text(Opcode::NewFloat, text)),
            Expression::String(text) => ops.push(self.emit_text(Opcode::NewString, text)),
            Expression::True => ops.push(self.emit(Opcode::NewTrue)),
            Expression::False => ops.push(self.emit(Opcode::NewFalse)),
            Expression::None => ops.push(self.emit(Opcode::NewNone)),

            Expression::Array(items) | Expression::Tuple(items) => {
                for item in items.iter().rev() {
                    self.compile_expression(item, ops)?;
                }
                let opcode = if matches!(expression, Expression::Array(_)) {
                    Opcode::NewArray
                } else {
                    Opcode::NewTuple
                };
                ops.push(self.emit_integer(opcode, items.len() as i64));
            }

            Expression::Identifier(name) => ops.push(self.emit_text(Opcode::Identifier, name)),

            Expression::Selector { receiver, name } => {
                self.compile_expression(receiver, ops)?;
                ops.push(self.emit_text(Opcode::Selector, name));
            }

            Expression::Index { source, index } => {
                self.compile_expression(source, ops)?;
                self.compile_expression(index, ops)?;
                ops.push(self.emit(Opcode::Index));
            }

            Expression::Call {
                function,
                arguments,
            } => {
                for argument in arguments.iter().rev() {
                    self.compile_expression(argument, ops)?;
                }
                self.compile_expression(function, ops)?;
                ops.push(self.emit_integer(Opcode::Call, arguments.len() as i64));
            }

            Expression::Unary { op, operand } => {
                self.compile_expression(operand, ops)?;
                ops.push(self.emit(Opcode::from_unary(*op)));
            }

            Expression::Binary { left, op, right } => {
                self.compile_expression(right, ops)?;
                self.compile_expression(left, ops)?;
                ops.push(self.emit(Opcode::from_binary(*op)));
            }

            Expression::Implements { value, class } => {
                self.compile_expression(class, ops)?;
                self.compile_expression(value, ops)?;
                ops.push(self.emit(Opcode::Implements));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Jump layouts
    // =========================================================================

    /// Condition is already on the stack.
    pub fn compile_if_jumps(
        &mut self,
        then_body: &[Node],
        else_body: &[Node],
    ) -> Result<Vec<Instruction>, CompileError> {
        let then_ops = self.compile_nodes(then_body)?;
        let else_ops = self.compile_nodes(else_body)?;

        let then_len = then_ops.len() as i64;
        let else_len = else_ops.len() as i64;

        let mut result = Vec::new();
        result.push(self.emit_integer(Opcode::JumpIfFalse, then_len + 2));
        result.extend(then_ops);
        result.push(self.emit_integer(Opcode::Jump, else_len + 1));
        result.extend(else_ops);
        Ok(result)
    }

    pub fn compile_when_jumps(
        &mut self,
        then_body: &[Node],
    ) -> Result<Vec<Instruction>, CompileError> {
        let then_ops = self.compile_nodes(then_body)?;
        let then_len = then_ops.len() as i64;

        let mut result = Vec::new();
        result.push(self.emit_integer(Opcode::JumpIfFalse, then_len + 1));
        result.extend(then_ops);
        Ok(result)
    }

    /// `while` (exit on `JumpIfFalse`) and `until` (exit on `JumpIfTrue`).
    ///
    /// ```text
    /// 0 .. c-1        condition
    /// c               exit jump (b + 2)      -> past the back jump
    /// c+1 .. c+b      body
    /// c+b+1           JUMP -(c + b + 1)      -> condition
    /// ```
    pub fn compile_while_jumps(
        &mut self,
        condition: &Expression,
        loop_body: &[Node],
        exit: Opcode,
    ) -> Result<Vec<Instruction>, CompileError> {
        let mut cond_ops = Vec::new();
        self.compile_expression(condition, &mut cond_ops)?;
        let line = self.line;
        let mut body_ops = self.compile_nodes(loop_body)?;
        self.line = line;

        let cond_len = cond_ops.len() as i64;
        let body_len = body_ops.len() as i64;

        // Body instruction i sits at c+1+i.
        patch_loop_markers(&mut body_ops, |marker, i| match marker {
            Opcode::Break => body_len + 1 - i,
            Opcode::Continue => -(cond_len + 1 + i),
            _ => -i,
        });

        let mut result = Vec::new();
        result.extend(cond_ops);
        result.push(self.emit_integer(exit, body_len + 2));
        result.extend(body_ops);
        result.push(self.emit_integer(Opcode::Jump, -(cond_len + 1 + body_len)));
        Ok(result)
    }

    /// ```text
    /// 0 .. b-1        body
    /// b .. b+c-1      condition
    /// b+c             JUMP_IF_TRUE -(b + c)  -> body
    /// ```
    pub fn compile_do_while_jumps(
        &mut self,
        loop_body: &[Node],
        condition: &Expression,
    ) -> Result<Vec<Instruction>, CompileError> {
        let line = self.line;
        let mut body_ops = self.compile_nodes(loop_body)?;
        self.line = line;
        let mut cond_ops = Vec::new();
        self.compile_expression(condition, &mut cond_ops)?;

        let cond_len = cond_ops.len() as i64;
        let body_len = body_ops.len() as i64;

        patch_loop_markers(&mut body_ops, |marker, i| match marker {
            Opcode::Break => body_len + cond_len + 1 - i,
            Opcode::Continue => body_len - i,
            _ => -i,
        });

        let mut result = Vec::new();
        result.extend(body_ops);
        result.extend(cond_ops);
        result.push(self.emit_integer(Opcode::JumpIfTrue, -(body_len + cond_len)));
        Ok(result)
    }

    /// Source is already on the stack.
    ///
    /// ```text
    /// 0               FOR_LOOP receivers     next element -> 2, exhausted -> 1
    /// 1               JUMP b + 2             -> POP
    /// 2 .. b+1        body
    /// b+2             JUMP -(b + 2)          -> FOR_LOOP
    /// b+3             POP                    discard the source
    /// ```
    pub fn compile_for_jumps(
        &mut self,
        receivers: &[String],
        loop_body: &[Node],
    ) -> Result<Vec<Instruction>, CompileError> {
        let line = self.line;
        let mut body_ops = self.compile_nodes(loop_body)?;
        self.line = line;

        let body_len = body_ops.len() as i64;

        // Body instruction i sits at 2+i.
        patch_loop_markers(&mut body_ops, |marker, i| match marker {
            Opcode::Break => body_len + 1 - i,
            Opcode::Continue => -(2 + i),
            _ => -i,
        });

        let mut result = Vec::new();
        result.push(self.emit_with(Opcode::ForLoop, Operand::Names(receivers.to_vec())));
        result.push(self.emit_integer(Opcode::Jump, body_len + 2));
        result.extend(body_ops);
        result.push(self.emit_integer(Opcode::Jump, -(body_len + 2)));
        result.push(self.emit(Opcode::Pop));
        Ok(result)
    }
}

/// Resolve the `break`/`continue`/`redo` markers a body left open.
///
/// Markers of inner loops were already resolved when those loops were
/// lowered, so only this loop's own markers are touched.
fn patch_loop_markers(body: &mut [Instruction], offset_for: impl Fn(Opcode, i64) -> i64) {
    for (i, instruction) in body.iter_mut().enumerate() {
        if instruction.is_unresolved_marker() {
            let offset = offset_for(instruction.opcode, i as i64);
            trace!(marker = ?instruction.opcode, index = i, offset, "patched loop marker");
            instruction.operand = Operand::Integer(offset);
        }
    }
}

fn ensure_no_markers(ops: &[Instruction]) -> Result<(), CompileError> {
    match ops.iter().find(|op| op.is_unresolved_marker()) {
        Some(op) => Err(CompileError::MarkerOutsideLoop {
            marker: match op.opcode {
                Opcode::Break => "break",
                Opcode::Continue => "continue",
                _ => "redo",
            },
            line: op.line,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::operator::{BinaryOp, UnaryOp};

    fn int(value: i64) -> Expression {
        Expression::Integer(value)
    }

    fn ident(name: &str) -> Expression {
        Expression::identifier(name)
    }

    fn stmt(statement: Statement) -> Node {
        statement.into()
    }

    fn opcodes(ops: &[Instruction]) -> Vec<Opcode> {
        ops.iter().map(|op| op.opcode).collect()
    }

    /// Absolute target of the jump at `pos`.
    fn target(ops: &[Instruction], pos: usize) -> usize {
        let offset = ops[pos].offset().expect("jump should be resolved");
        (pos as i64 + offset) as usize
    }

    fn position(ops: &[Instruction], opcode: Opcode) -> usize {
        ops.iter()
            .position(|op| op.opcode == opcode)
            .expect("opcode should be present")
    }

    // =========================================================================
    // Expressions and assignment
    // =========================================================================

    #[test]
    fn test_expression_statement_pops_result() {
        let ops = compile(&Expression::Integer(1).into()).unwrap();
        assert_eq!(opcodes(&ops), vec![Opcode::NewInteger, Opcode::Pop]);
    }

    #[test]
    fn test_binary_pushes_right_then_left() {
        let mut ops = Vec::new();
        Compiler::new()
            .compile_expression(&Expression::binary(int(1), BinaryOp::Sub, int(2)), &mut ops)
            .unwrap();

        assert_eq!(ops[0].operand, Operand::Integer(2));
        assert_eq!(ops[1].operand, Operand::Integer(1));
        assert_eq!(ops[2].opcode, Opcode::Sub);
    }

    #[test]
    fn test_call_pushes_arguments_reversed_then_callee() {
        let mut ops = Vec::new();
        Compiler::new()
            .compile_expression(&Expression::call(ident("f"), vec![int(1), int(2)]), &mut ops)
            .unwrap();

        assert_eq!(ops[0].operand, Operand::Integer(2));
        assert_eq!(ops[1].operand, Operand::Integer(1));
        assert_eq!(ops[2].operand, Operand::Text("f".into()));
        assert_eq!(ops[3].opcode, Opcode::Call);
        assert_eq!(ops[3].operand, Operand::Integer(2));
    }

    #[test]
    fn test_unary() {
        let mut ops = Vec::new();
        Compiler::new()
            .compile_expression(&Expression::unary(UnaryOp::Negative, int(3)), &mut ops)
            .unwrap();
        assert_eq!(opcodes(&ops), vec![Opcode::NewInteger, Opcode::Negative]);
    }

    #[test]
    fn test_plain_assignment() {
        let ops = compile(&stmt(Statement::assign("x", int(5)))).unwrap();
        assert_eq!(opcodes(&ops), vec![Opcode::NewInteger, Opcode::AssignIdentifier]);
        assert_eq!(ops[1].operand, Operand::Text("x".into()));
    }

    #[test]
    fn test_compound_assignment_pushes_rhs_then_current_value() {
        // x -= 3
        let ops = compile(&stmt(Statement::Assignment {
            target: ident("x"),
            op: AssignOp::Compound(BinaryOp::Sub),
            value: int(3),
        }))
        .unwrap();

        assert_eq!(
            opcodes(&ops),
            vec![
                Opcode::NewInteger,
                Opcode::Identifier,
                Opcode::Sub,
                Opcode::AssignIdentifier
            ]
        );
        assert_eq!(ops[0].operand, Operand::Integer(3));
    }

    #[test]
    fn test_selector_and_index_store_forms() {
        let ops = compile(&stmt(Statement::Assignment {
            target: Expression::selector(ident("p"), "x"),
            op: AssignOp::Assign,
            value: int(1),
        }))
        .unwrap();
        assert_eq!(
            opcodes(&ops),
            vec![Opcode::NewInteger, Opcode::Identifier, Opcode::AssignSelector]
        );
        assert_eq!(ops[2].operand, Operand::Text("x".into()));

        let ops = compile(&stmt(Statement::Assignment {
            target: Expression::index(ident("a"), int(0)),
            op: AssignOp::Assign,
            value: int(1),
        }))
        .unwrap();
        assert_eq!(
            opcodes(&ops),
            vec![
                Opcode::NewInteger,
                Opcode::Identifier,
                Opcode::NewInteger,
                Opcode::AssignIndex
            ]
        );
    }

    #[test]
    fn test_invalid_assignment_target() {
        let err = compile(&stmt(Statement::Assignment {
            target: Expression::call(ident("f"), vec![]),
            op: AssignOp::Assign,
            value: int(1),
        }))
        .unwrap_err();

        assert!(matches!(
            err,
            CompileError::InvalidTarget {
                node_type: "call",
                ..
            }
        ));
    }

    #[test]
    fn test_delete_forms() {
        let ops = compile(&stmt(Statement::Delete(ident("x")))).unwrap();
        assert_eq!(opcodes(&ops), vec![Opcode::DeleteIdentifier]);

        let ops = compile(&stmt(Statement::Delete(Expression::index(ident("a"), int(1))))).unwrap();
        assert_eq!(
            opcodes(&ops),
            vec![Opcode::Identifier, Opcode::NewInteger, Opcode::DeleteIndex]
        );

        assert!(compile(&stmt(Statement::Delete(int(1)))).is_err());
    }

    #[test]
    fn test_return_pushes_results_reversed() {
        let ops = compile(&stmt(Statement::Return(vec![int(1), int(2)]))).unwrap();
        assert_eq!(ops[0].operand, Operand::Integer(2));
        assert_eq!(ops[1].operand, Operand::Integer(1));
        assert_eq!(ops[2].opcode, Opcode::Return);
        assert_eq!(ops[2].operand, Operand::Integer(2));
    }

    #[test]
    fn test_pass_and_raise() {
        let ops = compile(&stmt(Statement::Pass)).unwrap();
        assert_eq!(opcodes(&ops), vec![Opcode::Nop]);

        let ops = compile(&stmt(Statement::Raise(Expression::string("boom")))).unwrap();
        assert_eq!(opcodes(&ops), vec![Opcode::NewString, Opcode::Raise]);
    }

    #[test]
    fn test_lines_are_stamped() {
        let ops = compile(&Node::at(12, Statement::assign("x", int(1)))).unwrap();
        assert!(ops.iter().all(|op| op.line == 12));
    }

    // =========================================================================
    // Conditionals
    // =========================================================================

    #[test]
    fn test_if_else_structure() {
        let ops = compile(&stmt(Statement::If {
            condition: Expression::True,
            body: vec![stmt(Statement::assign("x", int(10)))],
            else_body: vec![stmt(Statement::assign("x", int(20)))],
        }))
        .unwrap();

        // NewTrue, JumpIfFalse, NewInteger 10, Assign, Jump, NewInteger 20, Assign
        assert_eq!(ops.len(), 7);
        assert_eq!(ops[1].opcode, Opcode::JumpIfFalse);
        assert_eq!(target(&ops, 1), 5); // else branch
        assert_eq!(ops[4].opcode, Opcode::Jump);
        assert_eq!(target(&ops, 4), 7); // past the else branch
    }

    #[test]
    fn test_if_without_else() {
        let ops = compile(&stmt(Statement::If {
            condition: Expression::True,
            body: vec![stmt(Statement::assign("x", int(10)))],
            else_body: vec![],
        }))
        .unwrap();

        assert_eq!(ops.len(), 4);
        assert_eq!(target(&ops, 1), 4);
    }

    // =========================================================================
    // Loops
    // =========================================================================

    fn while_with(body: Vec<Node>) -> Vec<Instruction> {
        // while x < 3 { body }
        compile(&stmt(Statement::While {
            condition: Expression::binary(ident("x"), BinaryOp::Less, int(3)),
            body,
        }))
        .unwrap()
    }

    #[test]
    fn test_while_structure() {
        let ops = while_with(vec![stmt(Statement::assign("x", int(1)))]);

        // cond(3) JumpIfFalse body(2) Jump
        assert_eq!(ops.len(), 7);
        assert_eq!(ops[3].opcode, Opcode::JumpIfFalse);
        assert_eq!(target(&ops, 3), 7);
        assert_eq!(ops[6].opcode, Opcode::Jump);
        assert_eq!(target(&ops, 6), 0);
    }

    #[test]
    fn test_while_break_lands_past_loop() {
        let ops = while_with(vec![
            stmt(Statement::assign("x", int(1))),
            stmt(Statement::Break),
            stmt(Statement::Pass),
        ]);

        let pos = position(&ops, Opcode::Break);
        assert_eq!(target(&ops, pos), ops.len());
    }

    #[test]
    fn test_while_continue_reenters_condition() {
        let ops = while_with(vec![stmt(Statement::Pass), stmt(Statement::Continue)]);

        let pos = position(&ops, Opcode::Continue);
        assert_eq!(target(&ops, pos), 0);
    }

    #[test]
    fn test_while_redo_reenters_body() {
        let ops = while_with(vec![stmt(Statement::Pass), stmt(Statement::Redo)]);

        let pos = position(&ops, Opcode::Redo);
        let body_start = position(&ops, Opcode::JumpIfFalse) + 1;
        assert_eq!(target(&ops, pos), body_start);
    }

    #[test]
    fn test_until_uses_inverted_exit() {
        let ops = compile(&stmt(Statement::Until {
            condition: Expression::True,
            body: vec![stmt(Statement::Break)],
        }))
        .unwrap();

        assert_eq!(ops[1].opcode, Opcode::JumpIfTrue);
        assert_eq!(target(&ops, 1), ops.len());
        assert_eq!(target(&ops, 2), ops.len());
    }

    #[test]
    fn test_do_while_structure() {
        // do { x = 1; continue; redo; break } while x < 3
        let ops = compile(&stmt(Statement::DoWhile {
            body: vec![
                stmt(Statement::assign("x", int(1))),
                stmt(Statement::Continue),
                stmt(Statement::Redo),
                stmt(Statement::Break),
            ],
            condition: Expression::binary(ident("x"), BinaryOp::Less, int(3)),
        }))
        .unwrap();

        // body(5) cond(3) JumpIfTrue
        assert_eq!(ops.len(), 9);
        let back = ops.len() - 1;
        assert_eq!(ops[back].opcode, Opcode::JumpIfTrue);
        assert_eq!(target(&ops, back), 0);

        let condition_start = 5;
        assert_eq!(target(&ops, position(&ops, Opcode::Continue)), condition_start);
        assert_eq!(target(&ops, position(&ops, Opcode::Redo)), 0);
        assert_eq!(target(&ops, position(&ops, Opcode::Break)), ops.len());
    }

    #[test]
    fn test_nested_loops_resolve_innermost_first() {
        // while a { while b { break }; break }
        let inner = stmt(Statement::While {
            condition: ident("b"),
            body: vec![stmt(Statement::Break)],
        });
        let ops = compile(&stmt(Statement::While {
            condition: ident("a"),
            body: vec![inner, stmt(Statement::Break)],
        }))
        .unwrap();

        // a, JumpIfFalse, [b, JumpIfFalse, Break, Jump], Break, Jump
        assert_eq!(ops.len(), 8);
        let breaks: Vec<usize> = ops
            .iter()
            .enumerate()
            .filter(|(_, op)| op.opcode == Opcode::Break)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(breaks, vec![4, 6]);

        // Inner break lands one past the inner loop, outer break past everything.
        assert_eq!(target(&ops, 4), 6);
        assert_eq!(target(&ops, 6), 8);
    }

    #[test]
    fn test_break_inside_if_inside_loop() {
        let ops = while_with(vec![stmt(Statement::If {
            condition: Expression::True,
            body: vec![stmt(Statement::Break)],
            else_body: vec![stmt(Statement::Continue)],
        })]);

        assert_eq!(target(&ops, position(&ops, Opcode::Break)), ops.len());
        assert_eq!(target(&ops, position(&ops, Opcode::Continue)), 0);
    }

    #[test]
    fn test_for_structure() {
        let ops = compile(&stmt(Statement::For {
            receivers: vec!["item".into()],
            source: ident("items"),
            body: vec![stmt(Statement::Continue), stmt(Statement::Break)],
        }))
        .unwrap();

        // source, ForLoop, Jump, Continue, Break, Jump, Pop
        assert_eq!(
            opcodes(&ops),
            vec![
                Opcode::Identifier,
                Opcode::ForLoop,
                Opcode::Jump,
                Opcode::Continue,
                Opcode::Break,
                Opcode::Jump,
                Opcode::Pop
            ]
        );
        assert_eq!(target(&ops, 2), 6); // exhausted -> Pop
        assert_eq!(target(&ops, 3), 1); // continue -> ForLoop
        assert_eq!(target(&ops, 4), 6); // break -> Pop
        assert_eq!(target(&ops, 5), 1);
    }

    #[test]
    fn test_break_outside_loop_is_rejected() {
        let err = Compiler::new()
            .compile_program(&[Node::at(3, Statement::Break)])
            .unwrap_err();
        assert_eq!(
            err,
            CompileError::MarkerOutsideLoop {
                marker: "break",
                line: 3
            }
        );
    }

    #[test]
    fn test_break_in_function_does_not_escape_to_enclosing_loop() {
        let err = compile(&stmt(Statement::While {
            condition: Expression::True,
            body: vec![stmt(Statement::function(
                "f",
                &[],
                vec![stmt(Statement::Break)],
            ))],
        }))
        .unwrap_err();
        assert!(matches!(err, CompileError::MarkerOutsideLoop { .. }));
    }

    // =========================================================================
    // Definitions
    // =========================================================================

    #[test]
    fn test_function_layout() {
        let ops = compile(&stmt(Statement::function(
            "add",
            &["a", "b"],
            vec![stmt(Statement::Return(vec![Expression::binary(
                ident("a"),
                BinaryOp::Add,
                ident("b"),
            )]))],
        )))
        .unwrap();

        assert_eq!(ops[0].opcode, Opcode::NewFunction);
        assert_eq!(ops[1].opcode, Opcode::LoadFunctionArguments);
        assert_eq!(ops[1].operand, Operand::Names(vec!["a".into(), "b".into()]));

        let Operand::Pair(len, arity) = ops[0].operand else {
            panic!("expected pair operand");
        };
        assert_eq!(arity, 2);
        // Explicit return: no implicit one appended.
        assert_eq!(ops[len].opcode, Opcode::Return);
        assert_eq!(ops[len].operand, Operand::Integer(1));
        assert_eq!(ops[len + 1].opcode, Opcode::AssignIdentifier);
        assert_eq!(ops.len(), len + 2);
    }

    #[test]
    fn test_function_gets_implicit_return() {
        let body = vec![stmt(Statement::assign("x", int(1)))];
        let ops = compile(&stmt(Statement::function("f", &[], body))).unwrap();

        // Body of two instructions, plus argument loading and the implicit return.
        assert_eq!(ops[0].operand, Operand::Pair(2 + 2, 0));
        assert_eq!(ops[4].opcode, Opcode::Return);
        assert_eq!(ops[4].operand, Operand::Integer(0));
    }

    #[test]
    fn test_class_without_initializer_gets_one() {
        let ops = compile(&stmt(Statement::Class {
            name: "Point".into(),
            bases: vec![],
            body: vec![],
        }))
        .unwrap();

        assert_eq!(
            opcodes(&ops),
            vec![
                Opcode::NewString,
                Opcode::NewClass,
                Opcode::NewClassFunction,
                Opcode::LoadFunctionArguments,
                Opcode::Return,
                Opcode::AssignIdentifier,
                Opcode::Return,
                Opcode::AssignIdentifier,
            ]
        );
        // Zero-arity initializer with an empty body.
        assert_eq!(ops[2].operand, Operand::Pair(2, 0));
        assert_eq!(ops[3].operand, Operand::Names(vec![]));
        assert_eq!(ops[5].operand, Operand::Text("__init__".into()));
        assert_eq!(ops[1].operand, Operand::Pair(5, 0));
    }

    #[test]
    fn test_class_with_initializer_is_not_given_another() {
        let ops = compile(&stmt(Statement::Class {
            name: "Point".into(),
            bases: vec![ident("Base")],
            body: vec![stmt(Statement::function(
                "__init__",
                &["x"],
                vec![stmt(Statement::Assignment {
                    target: Expression::selector(ident("self"), "x"),
                    op: AssignOp::Assign,
                    value: ident("x"),
                })],
            ))],
        }))
        .unwrap();

        let initializers = ops
            .iter()
            .filter(|op| op.operand == Operand::Text("__init__".into()))
            .count();
        assert_eq!(initializers, 1);

        assert_eq!(ops[0].opcode, Opcode::Identifier); // base
        assert_eq!(ops[1].operand, Operand::Text("Point".into()));
        let Operand::Pair(len, bases) = ops[2].operand else {
            panic!("expected pair operand");
        };
        assert_eq!(bases, 1);
        assert_eq!(ops[2 + len].opcode, Opcode::Return);
        assert_eq!(ops[3 + len].opcode, Opcode::AssignIdentifier);
    }

    #[test]
    fn test_module_layout() {
        let ops = compile(&stmt(Statement::Module {
            name: "m".into(),
            body: vec![stmt(Statement::assign("x", int(1)))],
        }))
        .unwrap();

        assert_eq!(
            opcodes(&ops),
            vec![
                Opcode::NewString,
                Opcode::NewModule,
                Opcode::NewInteger,
                Opcode::AssignIdentifier,
                Opcode::Return,
                Opcode::AssignIdentifier,
            ]
        );
        assert_eq!(ops[1].operand, Operand::Integer(3));
    }

    #[test]
    fn test_unsupported_nodes() {
        for statement in [
            Statement::Yield(vec![]),
            Statement::Defer(ident("f")),
            Statement::Require(Expression::string("lib")),
        ] {
            let err = compile(&stmt(statement)).unwrap_err();
            assert!(matches!(err, CompileError::Unsupported { .. }));
        }
    }
}
