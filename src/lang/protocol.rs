//! Reserved protocol names.
//!
//! Every operator and language protocol has exactly one reserved attribute
//! name. These names are the interop boundary between compiled bytecode and
//! user-defined types: a class participates in `+` by binding `__add__`
//! (forward) or `__right_add__` (reflected), in iteration by binding
//! `__has_next__` and `__next__`, and so on.

/// Name bound to the receiver inside a method body.
pub const SELF: &str = "self";

macro_rules! protocols {
    ($($variant:ident => $name:literal,)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Protocol {
            $($variant,)*
        }

        impl Protocol {
            pub const ALL: &'static [Protocol] = &[$(Protocol::$variant,)*];

            pub const fn name(self) -> &'static str {
                match self {
                    $(Protocol::$variant => $name,)*
                }
            }
        }
    };
}

protocols! {
    // construction and class access
    Initialize => "__init__",
    Class => "__class__",
    Copy => "__copy__",
    Call => "__call__",

    // conversion
    String => "__string__",
    Bool => "__bool__",
    Length => "__len__",

    // iteration
    HasNext => "__has_next__",
    Next => "__next__",

    // indexing
    Get => "__get__",
    Set => "__set__",
    Del => "__del__",

    // unary
    Not => "__not__",
    Positive => "__positive__",
    Negative => "__negative__",
    NegateBits => "__negate_bits__",

    // membership and identity
    In => "__in__",
    Is => "__is__",
    Implements => "__implements__",

    // logic
    And => "__and__",
    Or => "__or__",
    Xor => "__xor__",
    RightAnd => "__right_and__",
    RightOr => "__right_or__",
    RightXor => "__right_xor__",

    // comparison
    Equals => "__equals__",
    NotEquals => "__not_equal__",
    GreaterThan => "__greater_than__",
    GreaterOrEqualThan => "__greater_or_equal_than__",
    LessThan => "__less_than__",
    LessOrEqualThan => "__less_or_equal_than__",
    RightEquals => "__right_equals__",
    RightNotEquals => "__right_not_equal__",
    RightGreaterThan => "__right_greater_than__",
    RightGreaterOrEqualThan => "__right_greater_or_equal_than__",
    RightLessThan => "__right_less_than__",
    RightLessOrEqualThan => "__right_less_or_equal_than__",

    // bitwise
    BitwiseOr => "__bitwise_or__",
    BitwiseXor => "__bitwise_xor__",
    BitwiseAnd => "__bitwise_and__",
    BitwiseLeft => "__bitwise_left__",
    BitwiseRight => "__bitwise_right__",
    RightBitwiseOr => "__right_bitwise_or__",
    RightBitwiseXor => "__right_bitwise_xor__",
    RightBitwiseAnd => "__right_bitwise_and__",
    RightBitwiseLeft => "__right_bitwise_left__",
    RightBitwiseRight => "__right_bitwise_right__",

    // arithmetic
    Add => "__add__",
    Sub => "__sub__",
    Mul => "__mul__",
    Div => "__div__",
    FloorDiv => "__floor_div__",
    Mod => "__mod__",
    Pow => "__pow__",
    RightAdd => "__right_add__",
    RightSub => "__right_sub__",
    RightMul => "__right_mul__",
    RightDiv => "__right_div__",
    RightFloorDiv => "__right_floor_div__",
    RightMod => "__right_mod__",
    RightPow => "__right_pow__",
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_names_are_unique() {
        let names: HashSet<_> = Protocol::ALL.iter().map(|p| p.name()).collect();
        assert_eq!(names.len(), Protocol::ALL.len());
    }

    #[test]
    fn test_names_are_dunder_words() {
        for protocol in Protocol::ALL {
            let name = protocol.name();
            let word = name
                .strip_prefix("__")
                .and_then(|rest| rest.strip_suffix("__"))
                .unwrap_or_default();
            assert!(!word.is_empty(), "{}", name);
            assert!(word.chars().all(|c| c.is_ascii_lowercase() || c == '_'), "{}", name);
        }
    }

    #[test]
    fn test_unary_names() {
        assert_eq!(Protocol::Not.name(), "__not__");
        assert_eq!(Protocol::Negative.name(), "__negative__");
        assert_eq!(Protocol::NegateBits.name(), "__negate_bits__");
    }

    #[test]
    fn test_iteration_names() {
        assert_eq!(Protocol::HasNext.name(), "__has_next__");
        assert_eq!(Protocol::Next.name(), "__next__");
        assert_eq!(Protocol::Initialize.to_string(), "__init__");
    }
}
