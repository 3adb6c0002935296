//! Operator dispatch.
//!
//! A binary operator on two values resolves in a fixed order:
//!
//! 1. an `Object` on the left answers through its forward protocol method
//!    (`__add__`)
//! 2. two built-in values use native semantics when the kinds combine
//! 3. otherwise the right operand's reflected method (`__right_add__`) is
//!    called with the left operand as argument
//! 4. with no reflected method either, `==`/`!=` fall back to identity and
//!    every other operator fails with "method not implemented"
//!
//! The reflected natives of built-in kinds only know built-in semantics, so
//! two built-in values that don't combine end in an unsupported-operand
//! error raised by the right operand's reflected native.
//!
//! Indexing, iteration, `implements` and the unary operators follow the same
//! pattern: native for built-in kinds, a reserved attribute for objects.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

use crate::lang::operator::{BinaryOp, UnaryOp};
use crate::lang::protocol::Protocol;
use crate::runtime::runtime_error::{ErrorKind, RuntimeError, type_mismatch};
use crate::runtime::value::{SequenceIter, Value};
use crate::runtime::vm::Vm;

/// Largest number of items (or bytes, for strings) a repetition may build.
pub const MAX_REPEAT_LEN: usize = 1 << 28;

pub fn binary(
    vm: &mut Vm,
    op: BinaryOp,
    left: &Value,
    right: &Value,
) -> Result<Value, RuntimeError> {
    if left.is_object() {
        let forward = op.forward().name();
        if let Some(method) = vm.lookup_attribute(left, forward) {
            return vm.call_value(&method, vec![right.clone()]);
        }
        if !right.is_object() {
            return identity_fallback(op, left, right, forward);
        }
    } else if let Some(result) = native_binary(vm, op, left, right)? {
        return Ok(result);
    }

    let reflected = op.reflected().name();
    match vm.lookup_attribute(right, reflected) {
        Some(method @ Value::Function(_)) => vm.call_value(&method, vec![left.clone()]),
        Some(other) => Err(ErrorKind::NotCallable(other.type_name()).into()),
        None => identity_fallback(op, left, right, reflected),
    }
}

/// Operator natives of the built-in kinds: native semantics for two
/// built-in operands, full dispatch as soon as an object is involved.
pub fn builtin_operator(
    vm: &mut Vm,
    op: BinaryOp,
    left: &Value,
    right: &Value,
) -> Result<Value, RuntimeError> {
    if left.is_object() || right.is_object() {
        return binary(vm, op, left, right);
    }
    native_binary(vm, op, left, right)?.ok_or_else(|| {
        ErrorKind::UnsupportedOperand {
            op: op.symbol(),
            left: left.type_name(),
            right: right.type_name(),
        }
        .into()
    })
}

fn identity_fallback(
    op: BinaryOp,
    left: &Value,
    right: &Value,
    method: &str,
) -> Result<Value, RuntimeError> {
    match op {
        BinaryOp::Equals => Ok(Value::Bool(left.is(right))),
        BinaryOp::NotEquals => Ok(Value::Bool(!left.is(right))),
        _ => Err(ErrorKind::MethodNotImplemented(method.to_string()).into()),
    }
}

/// `a == b` reduced to a bool, through dispatch.
pub fn equals(vm: &mut Vm, left: &Value, right: &Value) -> Result<bool, RuntimeError> {
    let result = binary(vm, BinaryOp::Equals, left, right)?;
    vm.truthy(&result)
}

/// Built-in semantics for two non-object operands; `None` when the kinds
/// don't combine under `op`.
fn native_binary(
    vm: &mut Vm,
    op: BinaryOp,
    left: &Value,
    right: &Value,
) -> Result<Option<Value>, RuntimeError> {
    if right.is_object() {
        return Ok(None);
    }

    match op {
        BinaryOp::Equals => Ok(Some(Value::Bool(values_equal(vm, left, right)?))),
        BinaryOp::NotEquals => Ok(Some(Value::Bool(!values_equal(vm, left, right)?))),
        BinaryOp::And => Ok(Some(Value::Bool(vm.truthy(left)? && vm.truthy(right)?))),
        BinaryOp::Or => Ok(Some(Value::Bool(vm.truthy(left)? || vm.truthy(right)?))),
        BinaryOp::Xor => Ok(Some(Value::Bool(vm.truthy(left)? != vm.truthy(right)?))),
        BinaryOp::Greater
        | BinaryOp::GreaterOrEqual
        | BinaryOp::Less
        | BinaryOp::LessOrEqual => Ok(compare(op, left, right)),
        _ => arithmetic(vm, op, left, right),
    }
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Integer(n) => Some(*n as f64),
        Value::Float(x) => Some(*x),
        _ => None,
    }
}

/// Structural equality between built-in values. Numbers compare across
/// Integer and Float; containers compare element-wise, going through
/// dispatch only for object elements.
fn values_equal(vm: &mut Vm, left: &Value, right: &Value) -> Result<bool, RuntimeError> {
    values_equal_within(vm, left, right, &mut Vec::new())
}

/// `open` holds the array pairs being compared further up; meeting one of
/// them again means a cycle, which compares equal.
fn values_equal_within(
    vm: &mut Vm,
    left: &Value,
    right: &Value,
    open: &mut Vec<(usize, usize)>,
) -> Result<bool, RuntimeError> {
    match (left, right) {
        (Value::Integer(a), Value::Integer(b)) => Ok(a == b),
        (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_)) => {
            Ok(as_float(left) == as_float(right))
        }
        (Value::Array(a), Value::Array(b)) => {
            let key = (Rc::as_ptr(a) as usize, Rc::as_ptr(b) as usize);
            if Rc::ptr_eq(a, b) || open.contains(&key) {
                return Ok(true);
            }
            // Element comparison may run user code, so no borrow is held across it.
            let a = a.borrow().clone();
            let b = b.borrow().clone();
            open.push(key);
            let equal = elements_equal(vm, &a, &b, open);
            open.pop();
            equal
        }
        (Value::Tuple(a), Value::Tuple(b)) => elements_equal(vm, a, b, open),
        (a, b) => Ok(a.is(b)),
    }
}

fn elements_equal(
    vm: &mut Vm,
    left: &[Value],
    right: &[Value],
    open: &mut Vec<(usize, usize)>,
) -> Result<bool, RuntimeError> {
    if left.len() != right.len() {
        return Ok(false);
    }
    for (a, b) in left.iter().zip(right) {
        let equal = if a.is_object() || b.is_object() {
            equals(vm, a, b)?
        } else {
            values_equal_within(vm, a, b, open)?
        };
        if !equal {
            return Ok(false);
        }
    }
    Ok(true)
}

fn compare(op: BinaryOp, left: &Value, right: &Value) -> Option<Value> {
    let ordering = match (left, right) {
        (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => as_float(left)?.partial_cmp(&as_float(right)?),
    };

    // NaN compares false under every ordering.
    let result = ordering.is_some_and(|ordering| match op {
        BinaryOp::Greater => ordering == Ordering::Greater,
        BinaryOp::GreaterOrEqual => ordering != Ordering::Less,
        BinaryOp::Less => ordering == Ordering::Less,
        _ => ordering != Ordering::Greater,
    });
    Some(Value::Bool(result))
}

fn arithmetic(
    vm: &mut Vm,
    op: BinaryOp,
    left: &Value,
    right: &Value,
) -> Result<Option<Value>, RuntimeError> {
    match (left, right) {
        (Value::Integer(a), Value::Integer(b)) => integer_op(op, *a, *b),
        (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_)) => {
            match (as_float(left), as_float(right)) {
                (Some(a), Some(b)) => float_op(op, a, b),
                _ => Ok(None),
            }
        }

        (Value::String(a), Value::String(b)) if op == BinaryOp::Add => {
            Ok(Some(Value::string(&format!("{}{}", a, b))))
        }
        (Value::String(s), Value::Integer(n)) if op == BinaryOp::Mul => {
            Ok(Some(Value::string(&repeat_string(s, *n)?)))
        }

        (Value::Array(a), Value::Array(b)) if op == BinaryOp::Add => {
            let mut items = a.borrow().clone();
            items.extend(b.borrow().iter().cloned());
            Ok(Some(Value::array(items)))
        }
        (Value::Array(a), Value::Integer(n)) if op == BinaryOp::Mul => {
            let items = a.borrow().clone();
            Ok(Some(Value::array(repeat_items(vm, &items, *n)?)))
        }

        (Value::Tuple(a), Value::Tuple(b)) if op == BinaryOp::Add => {
            Ok(Some(Value::tuple(a.iter().chain(b.iter()).cloned().collect())))
        }
        (Value::Tuple(a), Value::Integer(n)) if op == BinaryOp::Mul => {
            Ok(Some(Value::tuple(repeat_items(vm, a, *n)?)))
        }

        _ => Ok(None),
    }
}

fn integer_op(op: BinaryOp, a: i64, b: i64) -> Result<Option<Value>, RuntimeError> {
    let value = match op {
        BinaryOp::Add => Value::Integer(a.wrapping_add(b)),
        BinaryOp::Sub => Value::Integer(a.wrapping_sub(b)),
        BinaryOp::Mul => Value::Integer(a.wrapping_mul(b)),
        BinaryOp::Div => {
            if b == 0 {
                return Err(ErrorKind::DivisionByZero.into());
            }
            Value::Float(a as f64 / b as f64)
        }
        BinaryOp::FloorDiv => {
            if b == 0 {
                return Err(ErrorKind::DivisionByZero.into());
            }
            Value::Integer(a.wrapping_div(b))
        }
        BinaryOp::Mod => {
            if b == 0 {
                return Err(ErrorKind::DivisionByZero.into());
            }
            Value::Integer(a.wrapping_rem(b))
        }
        BinaryOp::Pow => match u32::try_from(b) {
            Ok(exponent) => Value::Integer(a.wrapping_pow(exponent)),
            Err(_) if b < 0 => Value::Float((a as f64).powf(b as f64)),
            Err(_) => Value::Integer(a.wrapping_pow(u32::MAX)),
        },
        BinaryOp::BitAnd => Value::Integer(a & b),
        BinaryOp::BitOr => Value::Integer(a | b),
        BinaryOp::BitXor => Value::Integer(a ^ b),
        BinaryOp::ShiftLeft | BinaryOp::ShiftRight => {
            if !(0..64).contains(&b) {
                return Err(ErrorKind::TypeMismatch {
                    expected: "shift amount in 0..64".to_string(),
                    found: b.to_string(),
                }
                .into());
            }
            if op == BinaryOp::ShiftLeft {
                Value::Integer(a << b)
            } else {
                Value::Integer(a >> b)
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(value))
}

fn float_op(op: BinaryOp, a: f64, b: f64) -> Result<Option<Value>, RuntimeError> {
    let value = match op {
        BinaryOp::Add => Value::Float(a + b),
        BinaryOp::Sub => Value::Float(a - b),
        BinaryOp::Mul => Value::Float(a * b),
        BinaryOp::Div | BinaryOp::FloorDiv | BinaryOp::Mod if b == 0.0 => {
            return Err(ErrorKind::DivisionByZero.into());
        }
        BinaryOp::Div => Value::Float(a / b),
        BinaryOp::FloorDiv => Value::Integer((a / b) as i64),
        BinaryOp::Mod => Value::Float(a % b),
        BinaryOp::Pow => Value::Float(a.powf(b)),
        _ => return Ok(None),
    };
    Ok(Some(value))
}

/// Number of copies for `sequence * count`, checked against
/// [`MAX_REPEAT_LEN`]. Negative counts repeat zero times.
fn repetitions(len: usize, count: i64) -> Result<usize, RuntimeError> {
    let copies = usize::try_from(count).unwrap_or(0);
    match len.checked_mul(copies) {
        Some(total) if total <= MAX_REPEAT_LEN => Ok(copies),
        _ => Err(ErrorKind::RepeatTooLarge { len, count }.into()),
    }
}

fn repeat_string(s: &str, count: i64) -> Result<String, RuntimeError> {
    let copies = repetitions(s.len(), count)?;
    let mut result = String::new();
    result
        .try_reserve_exact(s.len() * copies)
        .map_err(|_| ErrorKind::RepeatTooLarge { len: s.len(), count })?;
    for _ in 0..copies {
        result.push_str(s);
    }
    Ok(result)
}

/// `items * count`. Object elements are duplicated through `__copy__` when
/// they define it; everything else is shared.
fn repeat_items(vm: &mut Vm, items: &[Value], count: i64) -> Result<Vec<Value>, RuntimeError> {
    let copies = repetitions(items.len(), count)?;
    let mut result = Vec::new();
    result
        .try_reserve_exact(items.len() * copies)
        .map_err(|_| ErrorKind::RepeatTooLarge { len: items.len(), count })?;

    for _ in 0..copies {
        for item in items {
            let method = match item {
                Value::Object(_) => vm.lookup_attribute(item, Protocol::Copy.name()),
                _ => None,
            };
            let copy = match method {
                Some(method) => vm.call_value(&method, Vec::new())?,
                None => item.clone(),
            };
            result.push(copy);
        }
    }
    Ok(result)
}

// =============================================================================
// Unary operators and implements
// =============================================================================

pub fn unary(vm: &mut Vm, op: UnaryOp, operand: &Value) -> Result<Value, RuntimeError> {
    if operand.is_object() {
        let name = op.protocol().name();
        return match vm.lookup_attribute(operand, name) {
            Some(method) => vm.call_value(&method, Vec::new()),
            None if op == UnaryOp::Not => Ok(Value::Bool(!vm.truthy(operand)?)),
            None => Err(ErrorKind::MethodNotImplemented(name.to_string()).into()),
        };
    }

    match (op, operand) {
        (UnaryOp::Not, value) => Ok(Value::Bool(!vm.truthy(value)?)),
        (UnaryOp::Negative, Value::Integer(n)) => Ok(Value::Integer(n.wrapping_neg())),
        (UnaryOp::Negative, Value::Float(x)) => Ok(Value::Float(-x)),
        (UnaryOp::NegateBits, Value::Integer(n)) => Ok(Value::Integer(!n)),
        (UnaryOp::Negative, other) => Err(type_mismatch("number", other)),
        (UnaryOp::NegateBits, other) => Err(type_mismatch("Integer", other)),
    }
}

/// `value implements class`. Objects may answer through `__implements__`.
pub fn implements(vm: &mut Vm, value: &Value, class: &Value) -> Result<bool, RuntimeError> {
    let Value::Type(class_type) = class else {
        return Err(type_mismatch("Type", class));
    };

    if value.is_object() {
        if let Some(method) = vm.lookup_attribute(value, Protocol::Implements.name()) {
            let result = vm.call_value(&method, vec![class.clone()])?;
            return vm.truthy(&result);
        }
    }

    Ok(vm.class_of(value).implements(class_type))
}

// =============================================================================
// Indexing
// =============================================================================

/// Negative indices count from the end.
fn resolve_index(index: &Value, len: usize) -> Result<usize, RuntimeError> {
    let Value::Integer(raw) = index else {
        return Err(type_mismatch("Integer", index));
    };
    let resolved = if *raw < 0 { len as i64 + raw } else { *raw };

    if resolved < 0 || resolved >= len as i64 {
        return Err(ErrorKind::IndexOutOfRange { index: *raw, len }.into());
    }
    Ok(resolved as usize)
}

fn call_protocol(
    vm: &mut Vm,
    receiver: &Value,
    protocol: Protocol,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    match vm.lookup_attribute(receiver, protocol.name()) {
        Some(method) => vm.call_value(&method, args),
        None => Err(ErrorKind::MethodNotImplemented(protocol.name().to_string()).into()),
    }
}

pub fn get_index(vm: &mut Vm, source: &Value, index: &Value) -> Result<Value, RuntimeError> {
    match source {
        Value::Array(items) => {
            let items = items.borrow();
            Ok(items[resolve_index(index, items.len())?].clone())
        }
        Value::Tuple(items) => Ok(items[resolve_index(index, items.len())?].clone()),
        Value::String(s) => {
            let chars: Vec<char> = s.chars().collect();
            let c = chars[resolve_index(index, chars.len())?];
            Ok(Value::string(c.encode_utf8(&mut [0; 4])))
        }
        Value::Object(_) => call_protocol(vm, source, Protocol::Get, vec![index.clone()]),
        other => Err(type_mismatch("indexable value", other)),
    }
}

pub fn set_index(
    vm: &mut Vm,
    target: &Value,
    index: &Value,
    value: Value,
) -> Result<(), RuntimeError> {
    match target {
        Value::Array(items) => {
            let mut items = items.borrow_mut();
            let i = resolve_index(index, items.len())?;
            items[i] = value;
            Ok(())
        }
        Value::Object(_) => {
            call_protocol(vm, target, Protocol::Set, vec![index.clone(), value])?;
            Ok(())
        }
        other => Err(type_mismatch("Array", other)),
    }
}

pub fn delete_index(vm: &mut Vm, target: &Value, index: &Value) -> Result<(), RuntimeError> {
    match target {
        Value::Array(items) => {
            let mut items = items.borrow_mut();
            let i = resolve_index(index, items.len())?;
            items.remove(i);
            Ok(())
        }
        Value::Object(_) => {
            call_protocol(vm, target, Protocol::Del, vec![index.clone()])?;
            Ok(())
        }
        other => Err(type_mismatch("Array", other)),
    }
}

// =============================================================================
// Iteration
// =============================================================================

/// The iteration source for a `for` loop: iterators and objects drive
/// themselves, built-in sequences are snapshotted.
pub fn iterator_for(source: &Value) -> Result<Value, RuntimeError> {
    let items = match source {
        Value::Iterator(_) | Value::Object(_) => return Ok(source.clone()),
        Value::Array(items) => items.borrow().clone(),
        Value::Tuple(items) => items.to_vec(),
        Value::String(s) => s
            .chars()
            .map(|c| Value::string(c.encode_utf8(&mut [0; 4])))
            .collect(),
        other => return Err(type_mismatch("iterable", other)),
    };
    Ok(Value::Iterator(Rc::new(RefCell::new(SequenceIter::new(
        items,
    )))))
}

pub fn has_next(vm: &mut Vm, source: &Value) -> Result<bool, RuntimeError> {
    match source {
        Value::Iterator(iter) => Ok(iter.borrow().has_next()),
        Value::Object(_) => {
            let result = call_protocol(vm, source, Protocol::HasNext, Vec::new())?;
            vm.truthy(&result)
        }
        other => Err(type_mismatch("Iterator", other)),
    }
}

pub fn next(vm: &mut Vm, source: &Value) -> Result<Value, RuntimeError> {
    match source {
        Value::Iterator(iter) => {
            let mut iter = iter.borrow_mut();
            let (index, len) = (iter.position(), iter.len());
            iter.next().ok_or_else(|| {
                ErrorKind::IndexOutOfRange {
                    index: index as i64,
                    len,
                }
                .into()
            })
        }
        Value::Object(_) => call_protocol(vm, source, Protocol::Next, Vec::new()),
        other => Err(type_mismatch("Iterator", other)),
    }
}

/// Every element an iterable produces, in order.
pub fn collect_items(vm: &mut Vm, source: &Value) -> Result<Vec<Value>, RuntimeError> {
    let iter = iterator_for(source)?;
    let mut items = Vec::new();
    while has_next(vm, &iter)? {
        items.push(next(vm, &iter)?);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::value::{Constructor, Function, NativeFn, Object, Type};

    fn eval(op: BinaryOp, left: Value, right: Value) -> Result<Value, RuntimeError> {
        let mut vm = Vm::new();
        binary(&mut vm, op, &left, &right)
    }

    #[test]
    fn test_mixed_numeric_promotes_to_float() {
        assert_eq!(
            eval(BinaryOp::Add, Value::Integer(3), Value::Float(1.5)).unwrap(),
            Value::Float(4.5)
        );
        assert_eq!(
            eval(BinaryOp::Mul, Value::Float(0.5), Value::Integer(4)).unwrap(),
            Value::Float(2.0)
        );
    }

    #[test]
    fn test_floor_division_yields_integer() {
        assert_eq!(
            eval(BinaryOp::FloorDiv, Value::Float(7.0), Value::Float(2.0)).unwrap(),
            Value::Integer(3)
        );
        assert_eq!(
            eval(BinaryOp::FloorDiv, Value::Integer(7), Value::Integer(2)).unwrap(),
            Value::Integer(3)
        );
        assert_eq!(
            eval(BinaryOp::Div, Value::Integer(7), Value::Integer(2)).unwrap(),
            Value::Float(3.5)
        );
    }

    #[test]
    fn test_division_by_zero() {
        for (left, right) in [
            (Value::Integer(1), Value::Integer(0)),
            (Value::Float(1.0), Value::Float(0.0)),
            (Value::Integer(1), Value::Float(0.0)),
        ] {
            for op in [BinaryOp::Div, BinaryOp::FloorDiv, BinaryOp::Mod] {
                let err = eval(op, left.clone(), right.clone()).unwrap_err();
                assert!(matches!(err.kind, ErrorKind::DivisionByZero), "{:?}", op);
            }
        }
    }

    #[test]
    fn test_integer_overflow_wraps() {
        assert_eq!(
            eval(BinaryOp::Add, Value::Integer(i64::MAX), Value::Integer(1)).unwrap(),
            Value::Integer(i64::MIN)
        );
    }

    #[test]
    fn test_pow() {
        assert_eq!(
            eval(BinaryOp::Pow, Value::Integer(2), Value::Integer(10)).unwrap(),
            Value::Integer(1024)
        );
        assert_eq!(
            eval(BinaryOp::Pow, Value::Integer(2), Value::Integer(-1)).unwrap(),
            Value::Float(0.5)
        );
    }

    #[test]
    fn test_shift_range() {
        assert_eq!(
            eval(BinaryOp::ShiftLeft, Value::Integer(1), Value::Integer(4)).unwrap(),
            Value::Integer(16)
        );
        assert!(eval(BinaryOp::ShiftRight, Value::Integer(1), Value::Integer(64)).is_err());
        assert!(eval(BinaryOp::ShiftLeft, Value::Integer(1), Value::Integer(-1)).is_err());
    }

    #[test]
    fn test_sequences() {
        assert_eq!(
            eval(BinaryOp::Add, Value::string("ab"), Value::string("cd")).unwrap(),
            Value::string("abcd")
        );
        assert_eq!(
            eval(BinaryOp::Mul, Value::string("ab"), Value::Integer(3)).unwrap(),
            Value::string("ababab")
        );
        assert_eq!(
            eval(
                BinaryOp::Mul,
                Value::array(vec![Value::Integer(1)]),
                Value::Integer(2)
            )
            .unwrap(),
            Value::array(vec![Value::Integer(1), Value::Integer(1)])
        );
        assert_eq!(
            eval(
                BinaryOp::Add,
                Value::tuple(vec![Value::Integer(1)]),
                Value::tuple(vec![Value::Integer(2)])
            )
            .unwrap(),
            Value::tuple(vec![Value::Integer(1), Value::Integer(2)])
        );
    }

    #[test]
    fn test_equality_is_structural_across_numbers() {
        assert_eq!(
            eval(BinaryOp::Equals, Value::Integer(1), Value::Float(1.0)).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            eval(BinaryOp::Equals, Value::None, Value::None).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            eval(BinaryOp::Equals, Value::None, Value::Integer(0)).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            eval(
                BinaryOp::NotEquals,
                Value::array(vec![Value::Integer(1)]),
                Value::array(vec![Value::Float(1.0)])
            )
            .unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(
            eval(BinaryOp::Less, Value::Integer(1), Value::Float(1.5)).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            eval(BinaryOp::GreaterOrEqual, Value::string("b"), Value::string("a")).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            eval(BinaryOp::Less, Value::Float(f64::NAN), Value::Float(1.0)).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_unsupported_operands() {
        let err = eval(BinaryOp::Sub, Value::string("a"), Value::Integer(1)).unwrap_err();
        assert_eq!(
            err.message(),
            "type error: unsupported operand types for -: String and Integer"
        );
        assert_eq!(err.call_stack, vec!["__right_sub__".to_string()]);

        let err = eval(BinaryOp::Less, Value::None, Value::Integer(1)).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UnsupportedOperand { op: "<", .. }));
    }

    fn tagged(_vm: &mut Vm, _this: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
        Ok(Value::tuple(vec![Value::string("reflected"), args[0].clone()]))
    }

    fn instance(name: &str, methods: &[(&str, NativeFn)]) -> Value {
        let class = Rc::new(Type::new(name, Vec::new(), Constructor::Instance));
        for (method, call) in methods {
            let function = Function::native(method, Some(1), *call);
            class.set_attribute(method, Value::Function(Rc::new(function)));
        }
        Value::Object(Rc::new(Object::new(class)))
    }

    #[test]
    fn test_right_reflected_method_answers_for_builtin_left() {
        let mut vm = Vm::new();
        let adder = instance("Adder", &[("__right_add__", tagged)]);

        assert_eq!(
            binary(&mut vm, BinaryOp::Add, &Value::Integer(1), &adder).unwrap(),
            Value::tuple(vec![Value::string("reflected"), Value::Integer(1)])
        );

        let err = binary(&mut vm, BinaryOp::Sub, &Value::Integer(1), &adder).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::MethodNotImplemented(ref name) if name == "__right_sub__"));
    }

    #[test]
    fn test_builtin_right_without_reflected_method() {
        let mut vm = Vm::new();
        let function = Value::Function(Rc::new(Function::native("f", Some(1), tagged)));

        let err = binary(&mut vm, BinaryOp::Add, &Value::Integer(1), &function).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::MethodNotImplemented(ref name) if name == "__right_add__"));
        assert_eq!(
            binary(&mut vm, BinaryOp::Equals, &Value::Integer(1), &function).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_left_object_without_forward_falls_back_to_reflected() {
        let mut vm = Vm::new();
        let plain = instance("Plain", &[]);
        let adder = instance("Adder", &[("__right_add__", tagged)]);

        assert_eq!(
            binary(&mut vm, BinaryOp::Add, &plain, &adder).unwrap(),
            Value::tuple(vec![Value::string("reflected"), plain.clone()])
        );

        let err = binary(&mut vm, BinaryOp::Mul, &plain, &adder).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::MethodNotImplemented(ref name) if name == "__right_mul__"));

        let err = binary(&mut vm, BinaryOp::Mul, &plain, &Value::Integer(2)).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::MethodNotImplemented(ref name) if name == "__mul__"));

        let other = instance("Plain", &[]);
        assert_eq!(
            binary(&mut vm, BinaryOp::Equals, &plain, &other).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            binary(&mut vm, BinaryOp::Equals, &plain, &plain).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_builtin_operator_natives_do_not_recurse() {
        let mut vm = Vm::new();
        let right_sub = vm.get_attribute(&Value::Integer(1), "__right_sub__").unwrap();

        let err = vm.call_value(&right_sub, vec![Value::string("a")]).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UnsupportedOperand { op: "-", .. }));

        let right_add = vm.get_attribute(&Value::Integer(1), "__right_add__").unwrap();
        assert_eq!(
            vm.call_value(&right_add, vec![Value::Integer(2)]).unwrap(),
            Value::Integer(3)
        );
    }

    #[test]
    fn test_oversized_repetition_is_an_error() {
        let ones = Value::array(vec![Value::Integer(1)]);
        let err = eval(BinaryOp::Mul, ones, Value::Integer(i64::MAX)).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::RepeatTooLarge { len: 1, .. }));
        assert!(!err.is_fatal());

        let err = eval(BinaryOp::Mul, Value::string("a"), Value::Integer(i64::MAX)).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::RepeatTooLarge { .. }));

        let err = eval(
            BinaryOp::Mul,
            Value::tuple(vec![Value::None, Value::None]),
            Value::Integer(MAX_REPEAT_LEN as i64),
        )
        .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::RepeatTooLarge { len: 2, .. }));

        assert_eq!(
            eval(BinaryOp::Mul, Value::string("ab"), Value::Integer(-3)).unwrap(),
            Value::string("")
        );
    }

    #[test]
    fn test_self_referencing_arrays_compare() {
        let a = Value::array(vec![Value::Integer(1)]);
        let b = Value::array(vec![Value::Integer(1)]);
        for value in [&a, &b] {
            let Value::Array(items) = value else { unreachable!() };
            items.borrow_mut().push(value.clone());
        }

        assert_eq!(
            eval(BinaryOp::Equals, a.clone(), b.clone()).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            eval(BinaryOp::Equals, a.clone(), a.clone()).unwrap(),
            Value::Bool(true)
        );

        let c = Value::array(vec![Value::Integer(2)]);
        let Value::Array(items) = &c else { unreachable!() };
        items.borrow_mut().push(c.clone());
        assert_eq!(
            eval(BinaryOp::Equals, a.clone(), c.clone()).unwrap(),
            Value::Bool(false)
        );

        // Break the cycles so the arrays are freed.
        for value in [&a, &b, &c] {
            let Value::Array(items) = value else { unreachable!() };
            items.borrow_mut().clear();
        }
    }

    #[test]
    fn test_logic_uses_truthiness() {
        assert_eq!(
            eval(BinaryOp::And, Value::Integer(1), Value::string("")).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            eval(BinaryOp::Xor, Value::Bool(true), Value::None).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_unary() {
        let mut vm = Vm::new();
        assert_eq!(
            unary(&mut vm, UnaryOp::Negative, &Value::Integer(3)).unwrap(),
            Value::Integer(-3)
        );
        assert_eq!(
            unary(&mut vm, UnaryOp::NegateBits, &Value::Integer(0)).unwrap(),
            Value::Integer(-1)
        );
        assert_eq!(
            unary(&mut vm, UnaryOp::Not, &Value::None).unwrap(),
            Value::Bool(true)
        );
        assert!(unary(&mut vm, UnaryOp::NegateBits, &Value::Float(1.0)).is_err());
    }

    #[test]
    fn test_indexing() {
        let mut vm = Vm::new();
        let items = Value::array(vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)]);

        assert_eq!(
            get_index(&mut vm, &items, &Value::Integer(-1)).unwrap(),
            Value::Integer(3)
        );
        assert_eq!(
            get_index(&mut vm, &Value::string("héllo"), &Value::Integer(1)).unwrap(),
            Value::string("é")
        );

        delete_index(&mut vm, &items, &Value::Integer(0)).unwrap();
        assert_eq!(
            items,
            Value::array(vec![Value::Integer(2), Value::Integer(3)])
        );

        let err = get_index(&mut vm, &items, &Value::Integer(2)).unwrap_err();
        assert_eq!(err.message(), "index 2 out of range for length 2");

        let tuple = Value::tuple(vec![Value::Integer(1)]);
        assert!(set_index(&mut vm, &tuple, &Value::Integer(0), Value::None).is_err());
    }

    #[test]
    fn test_collect_items_drains_iterator() {
        let mut vm = Vm::new();
        let iter = iterator_for(&Value::tuple(vec![Value::Integer(1), Value::Integer(2)])).unwrap();

        assert_eq!(
            collect_items(&mut vm, &iter).unwrap(),
            vec![Value::Integer(1), Value::Integer(2)]
        );
        assert!(!has_next(&mut vm, &iter).unwrap());
        assert!(next(&mut vm, &iter).is_err());
        assert!(iterator_for(&Value::Integer(3)).is_err());
    }

    #[test]
    fn test_implements_builtin_kinds() {
        let mut vm = Vm::new();
        let integer = vm.global("Integer").unwrap();
        let float = vm.global("Float").unwrap();

        assert!(implements(&mut vm, &Value::Integer(1), &integer).unwrap());
        assert!(!implements(&mut vm, &Value::Integer(1), &float).unwrap());
        assert!(implements(&mut vm, &Value::Integer(1), &Value::Integer(1)).is_err());
    }
}
