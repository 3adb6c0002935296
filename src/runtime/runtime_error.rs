//! Runtime errors.
//!
//! # Error Categories
//!
//! - **Type errors**: non-callable dispatch targets, arity mismatches,
//!   operand kinds an operator can't combine
//! - **Attribute errors**: undefined names, missing attributes and protocol
//!   methods, indices out of range
//! - **Arithmetic errors**: division by zero, repetitions too large to build
//! - **Raised values**: produced by `RAISE`
//! - **Resource exhaustion**: a full operand or scope stack
//! - **Invalid bytecode**: malformed programs
//!
//! Everything except resource exhaustion and invalid bytecode can be caught
//! by a handler region.

use crate::runtime::value::Value;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ErrorKind {
    #[error("name '{0}' is not defined")]
    UndefinedName(String),

    #[error("'{type_name}' has no attribute '{name}'")]
    MissingAttribute { type_name: String, name: String },

    #[error("method not implemented: {0}")]
    MethodNotImplemented(String),

    #[error("type error: expected callable, found attribute of type {0}")]
    NotCallable(String),

    #[error("type error: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("type error: unsupported operand types for {op}: {left} and {right}")]
    UnsupportedOperand {
        op: &'static str,
        left: String,
        right: String,
    },

    #[error("type error: expected {expected} arguments, found {found}")]
    ArityMismatch { expected: usize, found: usize },

    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("division by zero")]
    DivisionByZero,

    #[error("repetition too large: {count} copies of {len} items")]
    RepeatTooLarge { len: usize, count: i64 },

    #[error("unhandled exception: {0}")]
    Raised(Value),

    #[error("{stack} stack full (limit {limit})")]
    StackFull { stack: &'static str, limit: usize },

    #[error("invalid bytecode: {0}")]
    InvalidBytecode(String),
}

#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub kind: ErrorKind,
    /// Source line of the instruction that failed.
    pub line: Option<usize>,
    pub call_stack: Vec<String>,
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "runtime error: {}", self.kind)?;

        if let Some(line) = self.line {
            write!(f, " (line {})", line)?;
        }

        if !self.call_stack.is_empty() {
            write!(f, "\n  call stack:")?;

            for (i, frame) in self.call_stack.iter().rev().enumerate() {
                write!(f, "\n    {}: {}", i, frame)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

impl From<ErrorKind> for RuntimeError {
    fn from(kind: ErrorKind) -> Self {
        RuntimeError::new(kind)
    }
}

impl RuntimeError {
    pub fn new(kind: ErrorKind) -> Self {
        RuntimeError {
            kind,
            line: None,
            call_stack: Vec::new(),
        }
    }

    /// Records the line unless an inner frame already did.
    pub fn at_line(mut self, line: usize) -> Self {
        self.line.get_or_insert(line);
        self
    }

    pub fn with_context(mut self, context: &str) -> Self {
        self.call_stack.push(context.to_string());
        self
    }

    /// Fatal errors bypass handler regions.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::StackFull { .. } | ErrorKind::InvalidBytecode(_)
        )
    }

    pub fn message(&self) -> String {
        self.kind.to_string()
    }

    /// The value a handler binds to its capture name.
    pub fn into_value(self) -> Value {
        match self.kind {
            ErrorKind::Raised(value) => value,
            kind => Value::string(&kind.to_string()),
        }
    }
}

pub fn type_mismatch(expected: &str, found: &Value) -> RuntimeError {
    ErrorKind::TypeMismatch {
        expected: expected.to_string(),
        found: found.type_name(),
    }
    .into()
}

pub fn arity_mismatch(expected: usize, found: usize) -> RuntimeError {
    ErrorKind::ArityMismatch { expected, found }.into()
}

pub fn invalid_bytecode(message: impl Into<String>) -> RuntimeError {
    ErrorKind::InvalidBytecode(message.into()).into()
}
