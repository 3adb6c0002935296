//! # Cinder syntax contract
//!
//! This module defines the simplified syntax tree consumed by the bytecode
//! compiler, the operator enumerations shared with the engine, and the
//! reserved protocol names user types bind to take part in operators.
//!
//! The tree is produced by an external frontend; nothing here parses text.

pub mod node;
pub mod operator;
pub mod protocol;
