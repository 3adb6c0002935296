use serde::{Deserialize, Serialize};

use super::protocol::Protocol;

/// Binary operators shared by the lowering pass and the engine.
///
/// Each operator owns a forward protocol slot (`self OP other`) and a
/// reflected one (`other OP self`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
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
}

impl BinaryOp {
    pub const ALL: [BinaryOp; 21] = [
        BinaryOp::Add,
        BinaryOp::Sub,
        BinaryOp::Mul,
        BinaryOp::Div,
        BinaryOp::FloorDiv,
        BinaryOp::Mod,
        BinaryOp::Pow,
        BinaryOp::BitAnd,
        BinaryOp::BitOr,
        BinaryOp::BitXor,
        BinaryOp::ShiftLeft,
        BinaryOp::ShiftRight,
        BinaryOp::And,
        BinaryOp::Or,
        BinaryOp::Xor,
        BinaryOp::Equals,
        BinaryOp::NotEquals,
        BinaryOp::Greater,
        BinaryOp::GreaterOrEqual,
        BinaryOp::Less,
        BinaryOp::LessOrEqual,
    ];

    /// Source-level spelling, used in diagnostics.
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::FloorDiv => "//",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "**",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::ShiftLeft => "<<",
            BinaryOp::ShiftRight => ">>",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Xor => "xor",
            BinaryOp::Equals => "==",
            BinaryOp::NotEquals => "!=",
            BinaryOp::Greater => ">",
            BinaryOp::GreaterOrEqual => ">=",
            BinaryOp::Less => "<",
            BinaryOp::LessOrEqual => "<=",
        }
    }

    pub fn forward(self) -> Protocol {
        match self {
            BinaryOp::Add => Protocol::Add,
            BinaryOp::Sub => Protocol::Sub,
            BinaryOp::Mul => Protocol::Mul,
            BinaryOp::Div => Protocol::Div,
            BinaryOp::FloorDiv => Protocol::FloorDiv,
            BinaryOp::Mod => Protocol::Mod,
            BinaryOp::Pow => Protocol::Pow,
            BinaryOp::BitAnd => Protocol::BitwiseAnd,
            BinaryOp::BitOr => Protocol::BitwiseOr,
            BinaryOp::BitXor => Protocol::BitwiseXor,
            BinaryOp::ShiftLeft => Protocol::BitwiseLeft,
            BinaryOp::ShiftRight => Protocol::BitwiseRight,
            BinaryOp::And => Protocol::And,
            BinaryOp::Or => Protocol::Or,
            BinaryOp::Xor => Protocol::Xor,
            BinaryOp::Equals => Protocol::Equals,
            BinaryOp::NotEquals => Protocol::NotEquals,
            BinaryOp::Greater => Protocol::GreaterThan,
            BinaryOp::GreaterOrEqual => Protocol::GreaterOrEqualThan,
            BinaryOp::Less => Protocol::LessThan,
            BinaryOp::LessOrEqual => Protocol::LessOrEqualThan,
        }
    }

    pub fn reflected(self) -> Protocol {
        match self {
            BinaryOp::Add => Protocol::RightAdd,
            BinaryOp::Sub => Protocol::RightSub,
            BinaryOp::Mul => Protocol::RightMul,
            BinaryOp::Div => Protocol::RightDiv,
            BinaryOp::FloorDiv => Protocol::RightFloorDiv,
            BinaryOp::Mod => Protocol::RightMod,
            BinaryOp::Pow => Protocol::RightPow,
            BinaryOp::BitAnd => Protocol::RightBitwiseAnd,
            BinaryOp::BitOr => Protocol::RightBitwiseOr,
            BinaryOp::BitXor => Protocol::RightBitwiseXor,
            BinaryOp::ShiftLeft => Protocol::RightBitwiseLeft,
            BinaryOp::ShiftRight => Protocol::RightBitwiseRight,
            BinaryOp::And => Protocol::RightAnd,
            BinaryOp::Or => Protocol::RightOr,
            BinaryOp::Xor => Protocol::RightXor,
            BinaryOp::Equals => Protocol::RightEquals,
            BinaryOp::NotEquals => Protocol::RightNotEquals,
            BinaryOp::Greater => Protocol::RightGreaterThan,
            BinaryOp::GreaterOrEqual => Protocol::RightGreaterOrEqualThan,
            BinaryOp::Less => Protocol::RightLessThan,
            BinaryOp::LessOrEqual => Protocol::RightLessOrEqualThan,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Negative,
    NegateBits,
}

impl UnaryOp {
    pub fn protocol(self) -> Protocol {
        match self {
            UnaryOp::Not => Protocol::Not,
            UnaryOp::Negative => Protocol::Negative,
            UnaryOp::NegateBits => Protocol::NegateBits,
        }
    }
}

/// `=` or one of the compound forms such as `+=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    Compound(BinaryOp),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_and_reflected_names_differ() {
        for op in BinaryOp::ALL {
            assert_ne!(op.forward().name(), op.reflected().name(), "{:?}", op);
            assert!(op.reflected().name().starts_with("__right_"));
        }
    }

    #[test]
    fn test_add_slots() {
        assert_eq!(BinaryOp::Add.forward().name(), "__add__");
        assert_eq!(BinaryOp::Add.reflected().name(), "__right_add__");
    }
}
