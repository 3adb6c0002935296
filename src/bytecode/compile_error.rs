use crate::lang::node::{Expression, NodeKind, Statement};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    /// A node kind this backend does not lower.
    #[error("compile error: cannot compile '{node_type}' node (line {line})\n  hint: {hint}")]
    Unsupported {
        node_type: &'static str,
        line: usize,
        hint: &'static str,
    },

    /// A node that can't be assigned to or deleted. Frontends never produce
    /// these, so this indicates a bug upstream.
    #[error("compile error: '{node_type}' is not a valid {action} target (line {line})")]
    InvalidTarget {
        node_type: &'static str,
        action: &'static str,
        line: usize,
    },

    #[error("compile error: '{marker}' outside of a loop (line {line})")]
    MarkerOutsideLoop { marker: &'static str, line: usize },
}

impl CompileError {
    pub fn unsupported(kind: &NodeKind, line: usize, hint: &'static str) -> Self {
        CompileError::Unsupported {
            node_type: node_type_name(kind),
            line,
            hint,
        }
    }

    pub fn invalid_target(target: &Expression, action: &'static str, line: usize) -> Self {
        CompileError::InvalidTarget {
            node_type: expression_type_name(target),
            action,
            line,
        }
    }
}

pub fn node_type_name(kind: &NodeKind) -> &'static str {
    match kind {
        NodeKind::Expression(expression) => expression_type_name(expression),
        NodeKind::Statement(statement) => match statement {
            Statement::Assignment { .. } => "assignment",
            Statement::Delete(_) => "delete",
            Statement::If { .. } => "if",
            Statement::While { .. } => "while",
            Statement::Until { .. } => "until",
            Statement::DoWhile { .. } => "do-while",
            Statement::For { .. } => "for",
            Statement::Break => "break",
            Statement::Continue => "continue",
            Statement::Redo => "redo",
            Statement::Pass => "pass",
            Statement::Block(_) => "block",
            Statement::Return(_) => "return",
            Statement::Yield(_) => "yield",
            Statement::Raise(_) => "raise",
            Statement::Defer(_) => "defer",
            Statement::Require(_) => "require",
            Statement::FunctionDefinition(_) => "function",
            Statement::GeneratorDefinition(_) => "generator",
            Statement::Class { .. } => "class",
            Statement::Module { .. } => "module",
        },
    }
}

pub fn expression_type_name(expression: &Expression) -> &'static str {
    match expression {
        Expression::Integer(_) => "integer",
        Expression::Float(_) => "float",
        Expression::String(_) => "string",
        Expression::True | Expression::False => "bool",
        Expression::None => "none",
        Expression::Array(_) => "array",
        Expression::Tuple(_) => "tuple",
        Expression::Identifier(_) => "identifier",
        Expression::Selector { .. } => "selector",
        Expression::Index { .. } => "index",
        Expression::Call { .. } => "call",
        Expression::Unary { .. } => "unary",
        Expression::Binary { .. } => "binary",
        Expression::Implements { .. } => "implements",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_display() {
        let err = CompileError::unsupported(
            &NodeKind::Statement(Statement::Yield(vec![])),
            7,
            "generators are not supported by this backend",
        );
        let msg = err.to_string();
        assert!(msg.starts_with("compile error:"));
        assert!(msg.contains("'yield'"));
        assert!(msg.contains("line 7"));
        assert!(msg.contains("hint: generators"));
    }

    #[test]
    fn test_invalid_target_display() {
        let err = CompileError::invalid_target(&Expression::Integer(3), "assignment", 2);
        assert_eq!(
            err.to_string(),
            "compile error: 'integer' is not a valid assignment target (line 2)"
        );
    }

    #[test]
    fn test_marker_outside_loop_display() {
        let err = CompileError::MarkerOutsideLoop {
            marker: "break",
            line: 4,
        };
        assert!(err.to_string().contains("'break' outside of a loop"));
    }
}
