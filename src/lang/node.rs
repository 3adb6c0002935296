use super::operator::{AssignOp, BinaryOp, UnaryOp};

/// A node of the simplified syntax tree, tagged with its source line.
///
/// The tree arrives already desugared: `for` loops over the iteration
/// protocol, tuple unpacking and similar constructs have been rewritten into
/// the closed set of statements below.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub line: usize,
    pub kind: NodeKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Statement(Statement),
    /// An expression evaluated for its effect; its value is discarded.
    Expression(Expression),
}

impl Node {
    pub fn at(line: usize, kind: impl Into<NodeKind>) -> Self {
        Node {
            line,
            kind: kind.into(),
        }
    }
}

impl From<Statement> for NodeKind {
    fn from(statement: Statement) -> Self {
        NodeKind::Statement(statement)
    }
}

impl From<Expression> for NodeKind {
    fn from(expression: Expression) -> Self {
        NodeKind::Expression(expression)
    }
}

impl From<Statement> for Node {
    fn from(statement: Statement) -> Self {
        Node::at(0, statement)
    }
}

impl From<Expression> for Node {
    fn from(expression: Expression) -> Self {
        Node::at(0, expression)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDefinition {
    pub name: String,
    pub parameters: Vec<String>,
    pub body: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    // ───────────────────────────── Bindings ─────────────────────────────
    /// `target = value` or a compound form such as `target += value`.
    ///
    /// Only identifiers, selectors and index expressions are assignable.
    Assignment {
        target: Expression,
        op: AssignOp,
        value: Expression,
    },

    /// Remove a binding, an attribute or an indexed element.
    Delete(Expression),

    // ─────────────────────────── Control flow ───────────────────────────
    If {
        condition: Expression,
        body: Vec<Node>,
        else_body: Vec<Node>,
    },

    /// Condition checked before each iteration; loops while it holds.
    While {
        condition: Expression,
        body: Vec<Node>,
    },

    /// Condition checked before each iteration; loops until it holds.
    Until {
        condition: Expression,
        body: Vec<Node>,
    },

    /// Body runs once before the condition is first checked.
    DoWhile {
        body: Vec<Node>,
        condition: Expression,
    },

    /// Native iteration over `source`, binding each element to `receivers`.
    ///
    /// With several receivers every element is destructured positionally.
    For {
        receivers: Vec<String>,
        source: Expression,
        body: Vec<Node>,
    },

    Break,
    Continue,
    /// Restart the current iteration without re-checking the condition.
    Redo,
    Pass,
    Block(Vec<Node>),

    Return(Vec<Expression>),
    Yield(Vec<Expression>),
    Raise(Expression),
    Defer(Expression),
    Require(Expression),

    // ──────────────────────────── Definitions ───────────────────────────
    FunctionDefinition(FunctionDefinition),
    GeneratorDefinition(FunctionDefinition),

    Class {
        name: String,
        bases: Vec<Expression>,
        body: Vec<Node>,
    },

    Module {
        name: String,
        body: Vec<Node>,
    },
}

impl Statement {
    /// Plain assignment to an identifier.
    pub fn assign(name: &str, value: Expression) -> Self {
        Statement::Assignment {
            target: Expression::identifier(name),
            op: AssignOp::Assign,
            value,
        }
    }

    pub fn function(name: &str, parameters: &[&str], body: Vec<Node>) -> Self {
        Statement::FunctionDefinition(FunctionDefinition {
            name: name.to_string(),
            parameters: parameters.iter().map(|p| p.to_string()).collect(),
            body,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    // ───────────────────────────── Literals ─────────────────────────────
    Integer(i64),
    /// Decimal text; parsed when the constant is materialized.
    Float(String),
    String(String),
    True,
    False,
    None,
    Array(Vec<Expression>),
    Tuple(Vec<Expression>),

    // ───────────────────────────── Access ───────────────────────────────
    Identifier(String),

    /// `receiver.name`
    Selector {
        receiver: Box<Expression>,
        name: String,
    },

    /// `source[index]`
    Index {
        source: Box<Expression>,
        index: Box<Expression>,
    },

    Call {
        function: Box<Expression>,
        arguments: Vec<Expression>,
    },

    // ──────────────────────────── Operators ─────────────────────────────
    Unary {
        op: UnaryOp,
        operand: Box<Expression>,
    },

    Binary {
        left: Box<Expression>,
        op: BinaryOp,
        right: Box<Expression>,
    },

    /// `value implements class`
    Implements {
        value: Box<Expression>,
        class: Box<Expression>,
    },
}

impl Expression {
    pub fn identifier(name: &str) -> Self {
        Expression::Identifier(name.to_string())
    }

    pub fn string(text: &str) -> Self {
        Expression::String(text.to_string())
    }

    pub fn float(text: &str) -> Self {
        Expression::Float(text.to_string())
    }

    pub fn selector(receiver: Expression, name: &str) -> Self {
        Expression::Selector {
            receiver: Box::new(receiver),
            name: name.to_string(),
        }
    }

    pub fn index(source: Expression, index: Expression) -> Self {
        Expression::Index {
            source: Box::new(source),
            index: Box::new(index),
        }
    }

    pub fn call(function: Expression, arguments: Vec<Expression>) -> Self {
        Expression::Call {
            function: Box::new(function),
            arguments,
        }
    }

    pub fn binary(left: Expression, op: BinaryOp, right: Expression) -> Self {
        Expression::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    pub fn unary(op: UnaryOp, operand: Expression) -> Self {
        Expression::Unary {
            op,
            operand: Box::new(operand),
        }
    }
}
