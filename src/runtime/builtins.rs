//! Built-in kinds and their native method tables.
//!
//! Every built-in value kind has a `Type` object bound by name in the root
//! scope. Its attributes hold native functions for the operator protocols
//! (forward and reflected) plus the conversion, indexing and iteration
//! protocols that kind supports, so `(1).__add__(2)` and `1 + 2` agree.

use std::rc::Rc;

use crate::lang::operator::BinaryOp;
use crate::lang::protocol::Protocol;
use crate::runtime::dispatch;
use crate::runtime::runtime_error::{ErrorKind, RuntimeError, arity_mismatch, type_mismatch};
use crate::runtime::value::{Constructor, Function, NativeFn, Type, Value};
use crate::runtime::vm::Vm;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinKind {
    None,
    Bool,
    Integer,
    Float,
    String,
    Array,
    Tuple,
    Function,
    Type,
    Iterator,
    Module,
    Object,
}

impl BuiltinKind {
    /// In declaration order, so `kind as usize` indexes this table.
    pub const ALL: [BuiltinKind; 12] = [
        BuiltinKind::None,
        BuiltinKind::Bool,
        BuiltinKind::Integer,
        BuiltinKind::Float,
        BuiltinKind::String,
        BuiltinKind::Array,
        BuiltinKind::Tuple,
        BuiltinKind::Function,
        BuiltinKind::Type,
        BuiltinKind::Iterator,
        BuiltinKind::Module,
        BuiltinKind::Object,
    ];

    /// Name the type object is bound to in the root scope.
    pub fn name(self) -> &'static str {
        match self {
            BuiltinKind::None => "NoneType",
            BuiltinKind::Bool => "Bool",
            BuiltinKind::Integer => "Integer",
            BuiltinKind::Float => "Float",
            BuiltinKind::String => "String",
            BuiltinKind::Array => "Array",
            BuiltinKind::Tuple => "Tuple",
            BuiltinKind::Function => "Function",
            BuiltinKind::Type => "Type",
            BuiltinKind::Iterator => "Iterator",
            BuiltinKind::Module => "Module",
            BuiltinKind::Object => "Object",
        }
    }

    fn has_operators(self) -> bool {
        matches!(
            self,
            BuiltinKind::None
                | BuiltinKind::Bool
                | BuiltinKind::Integer
                | BuiltinKind::Float
                | BuiltinKind::String
                | BuiltinKind::Array
                | BuiltinKind::Tuple
        )
    }

    fn is_sequence(self) -> bool {
        matches!(
            self,
            BuiltinKind::String | BuiltinKind::Array | BuiltinKind::Tuple
        )
    }
}

/// The type objects of the built-in kinds.
pub struct Builtins {
    types: Vec<Rc<Type>>,
}

impl Default for Builtins {
    fn default() -> Self {
        Self::new()
    }
}

impl Builtins {
    pub fn new() -> Self {
        let types = BuiltinKind::ALL
            .iter()
            .map(|kind| Rc::new(build_type(*kind)))
            .collect();
        Builtins { types }
    }

    pub fn type_of(&self, kind: BuiltinKind) -> &Rc<Type> {
        &self.types[kind as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = (BuiltinKind, &Rc<Type>)> {
        BuiltinKind::ALL.into_iter().zip(self.types.iter())
    }
}

fn build_type(kind: BuiltinKind) -> Type {
    let constructor = match kind {
        BuiltinKind::Bool => Constructor::Native(construct_bool),
        BuiltinKind::Integer => Constructor::Native(construct_integer),
        BuiltinKind::Float => Constructor::Native(construct_float),
        BuiltinKind::String => Constructor::Native(construct_string),
        BuiltinKind::Array => Constructor::Native(construct_array),
        BuiltinKind::Tuple => Constructor::Native(construct_tuple),
        BuiltinKind::Object => Constructor::Instance,
        _ => Constructor::Native(not_constructible),
    };
    let class = Type::new(kind.name(), Vec::new(), constructor);

    if kind.has_operators() {
        for &(op, forward, reflected) in OPERATOR_NATIVES {
            register(&class, op.forward(), Some(1), forward);
            register(&class, op.reflected(), Some(1), reflected);
        }
        register(&class, Protocol::Bool, Some(0), native_bool);
    }

    if kind.is_sequence() {
        register(&class, Protocol::Length, Some(0), native_length);
        register(&class, Protocol::Get, Some(1), native_get);
    }

    match kind {
        BuiltinKind::Array => {
            register(&class, Protocol::Set, Some(2), native_set);
            register(&class, Protocol::Del, Some(1), native_del);
            register(&class, Protocol::Copy, Some(0), native_copy);
        }
        BuiltinKind::Tuple => register(&class, Protocol::Copy, Some(0), native_copy),
        BuiltinKind::Iterator => {
            register(&class, Protocol::HasNext, Some(0), native_has_next);
            register(&class, Protocol::Next, Some(0), native_next);
        }
        _ => {}
    }

    class
}

fn register(class: &Type, protocol: Protocol, arity: Option<usize>, call: NativeFn) {
    class.set_attribute(
        protocol.name(),
        Value::Function(Rc::new(Function::native(protocol.name(), arity, call))),
    );
}

fn expect_args<const N: usize>(args: &[Value]) -> Result<&[Value; N], RuntimeError> {
    args.try_into()
        .map_err(|_| arity_mismatch(N, args.len()))
}

// =============================================================================
// Operator natives
// =============================================================================

macro_rules! operator_natives {
    ($($op:ident => $forward:ident, $reflected:ident;)*) => {
        $(
            fn $forward(vm: &mut Vm, this: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
                let [other] = expect_args::<1>(args)?;
                dispatch::builtin_operator(vm, BinaryOp::$op, this, other)
            }

            fn $reflected(vm: &mut Vm, this: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
                let [other] = expect_args::<1>(args)?;
                dispatch::builtin_operator(vm, BinaryOp::$op, other, this)
            }
        )*

        const OPERATOR_NATIVES: &[(BinaryOp, NativeFn, NativeFn)] = &[
            $((BinaryOp::$op, $forward as NativeFn, $reflected as NativeFn),)*
        ];
    };
}

operator_natives! {
    Add => native_add, native_right_add;
    Sub => native_sub, native_right_sub;
    Mul => native_mul, native_right_mul;
    Div => native_div, native_right_div;
    FloorDiv => native_floor_div, native_right_floor_div;
    Mod => native_mod, native_right_mod;
    Pow => native_pow, native_right_pow;
    BitAnd => native_bit_and, native_right_bit_and;
    BitOr => native_bit_or, native_right_bit_or;
    BitXor => native_bit_xor, native_right_bit_xor;
    ShiftLeft => native_shift_left, native_right_shift_left;
    ShiftRight => native_shift_right, native_right_shift_right;
    And => native_and, native_right_and;
    Or => native_or, native_right_or;
    Xor => native_xor, native_right_xor;
    Equals => native_equals, native_right_equals;
    NotEquals => native_not_equals, native_right_not_equals;
    Greater => native_greater, native_right_greater;
    GreaterOrEqual => native_greater_or_equal, native_right_greater_or_equal;
    Less => native_less, native_right_less;
    LessOrEqual => native_less_or_equal, native_right_less_or_equal;
}

// =============================================================================
// Protocol natives
// =============================================================================

/// `__string__` every type starts with: the value's display form.
pub fn default_string(_vm: &mut Vm, this: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::string(&this.to_string()))
}

fn native_bool(vm: &mut Vm, this: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Bool(vm.truthy(this)?))
}

fn native_length(_vm: &mut Vm, this: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    let len = match this {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.borrow().len(),
        Value::Tuple(items) => items.len(),
        other => return Err(type_mismatch("sequence", other)),
    };
    Ok(Value::Integer(len as i64))
}

fn native_get(vm: &mut Vm, this: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    let [index] = expect_args::<1>(args)?;
    dispatch::get_index(vm, this, index)
}

fn native_set(vm: &mut Vm, this: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    let [index, value] = expect_args::<2>(args)?;
    dispatch::set_index(vm, this, index, value.clone())?;
    Ok(Value::None)
}

fn native_del(vm: &mut Vm, this: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    let [index] = expect_args::<1>(args)?;
    dispatch::delete_index(vm, this, index)?;
    Ok(Value::None)
}

/// Shallow copy. Tuples are immutable, so they copy to themselves.
fn native_copy(_vm: &mut Vm, this: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    match this {
        Value::Array(items) => Ok(Value::array(items.borrow().clone())),
        other => Ok(other.clone()),
    }
}

fn native_has_next(vm: &mut Vm, this: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Bool(dispatch::has_next(vm, this)?))
}

fn native_next(vm: &mut Vm, this: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    dispatch::next(vm, this)
}

// =============================================================================
// Constructors
// =============================================================================

fn construct_bool(vm: &mut Vm, _this: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    match args {
        [] => Ok(Value::Bool(false)),
        [value] => Ok(Value::Bool(vm.truthy(value)?)),
        _ => Err(arity_mismatch(1, args.len())),
    }
}

fn construct_integer(_vm: &mut Vm, _this: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    match args {
        [] => Ok(Value::Integer(0)),
        [Value::Integer(n)] => Ok(Value::Integer(*n)),
        [Value::Float(x)] => Ok(Value::Integer(*x as i64)),
        [Value::Bool(b)] => Ok(Value::Integer(*b as i64)),
        [value @ Value::String(s)] => s
            .trim()
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| type_mismatch("integer literal", value)),
        [other] => Err(type_mismatch("number or string", other)),
        _ => Err(arity_mismatch(1, args.len())),
    }
}

fn construct_float(_vm: &mut Vm, _this: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    match args {
        [] => Ok(Value::Float(0.0)),
        [Value::Integer(n)] => Ok(Value::Float(*n as f64)),
        [Value::Float(x)] => Ok(Value::Float(*x)),
        [Value::Bool(b)] => Ok(Value::Float(if *b { 1.0 } else { 0.0 })),
        [value @ Value::String(s)] => s
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| type_mismatch("float literal", value)),
        [other] => Err(type_mismatch("number or string", other)),
        _ => Err(arity_mismatch(1, args.len())),
    }
}

fn construct_string(vm: &mut Vm, _this: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    match args {
        [] => Ok(Value::string("")),
        [value] => Ok(Value::string(&vm.stringify(value)?)),
        _ => Err(arity_mismatch(1, args.len())),
    }
}

fn construct_array(vm: &mut Vm, _this: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    match args {
        [] => Ok(Value::array(Vec::new())),
        [value] => Ok(Value::array(dispatch::collect_items(vm, value)?)),
        _ => Err(arity_mismatch(1, args.len())),
    }
}

fn construct_tuple(vm: &mut Vm, _this: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    match args {
        [] => Ok(Value::tuple(Vec::new())),
        [value] => Ok(Value::tuple(dispatch::collect_items(vm, value)?)),
        _ => Err(arity_mismatch(1, args.len())),
    }
}

fn not_constructible(_vm: &mut Vm, this: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    Err(ErrorKind::TypeMismatch {
        expected: "constructible type".to_string(),
        found: this.to_string(),
    }
    .into())
}
