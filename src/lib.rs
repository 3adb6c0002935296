//! Cinder: a bytecode backend and stack machine for a small dynamic language.
//!
//! [`lang`] is the syntax contract handed over by a frontend, [`bytecode`]
//! lowers it into a flat instruction stream with handler regions, and
//! [`runtime`] executes that stream.
//!
//! ```
//! use cinder::bytecode::compile::Compiler;
//! use cinder::lang::node::{Expression, Node};
//! use cinder::lang::operator::BinaryOp;
//! use cinder::runtime::{Value, Vm};
//!
//! let nodes: Vec<Node> = vec![
//!     Expression::binary(Expression::Integer(3), BinaryOp::Add, Expression::float("1.5")).into(),
//! ];
//! let program = Compiler::new().compile_program(&nodes).unwrap();
//! let result = Vm::new().run_compiled(&program).unwrap();
//! assert_eq!(result, Value::Float(4.5));
//! ```

pub mod bytecode;
pub mod lang;
pub mod runtime;
