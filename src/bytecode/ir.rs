use std::ops::Range;

use crate::bytecode::Instruction;
use serde::{Deserialize, Serialize};

/// A compiled program: one flat instruction stream plus its handler regions.
///
/// Function and class bodies are embedded in the stream; their code is an
/// index range into `instructions`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub instructions: Vec<Instruction>,
    pub handlers: Vec<HandlerRegion>,
}

/// A protected instruction range.
///
/// A catchable error raised while `start <= ip < end` resumes at `target`,
/// with the raised value bound to `capture` when one is given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerRegion {
    pub start: usize,
    pub end: usize,
    pub capture: Option<String>,
    pub target: usize,
}

impl Program {
    pub fn new(instructions: Vec<Instruction>) -> Self {
        Program {
            instructions,
            handlers: Vec::new(),
        }
    }

    pub fn with_handler(mut self, handler: HandlerRegion) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Innermost handler region covering `ip` that lies entirely inside
    /// `code`, the instruction range of the running body, together with its
    /// index in `handlers`.
    pub fn handler_within(
        &self,
        ip: usize,
        code: &Range<usize>,
    ) -> Option<(usize, &HandlerRegion)> {
        self.handlers
            .iter()
            .enumerate()
            .filter(|(_, h)| h.start <= ip && ip < h.end)
            .filter(|(_, h)| code.start <= h.start && h.end <= code.end)
            .min_by_key(|(_, h)| h.end - h.start)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}
