use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::bytecode::Program;
use crate::lang::protocol::Protocol;
use crate::runtime::builtins::{self, BuiltinKind};
use crate::runtime::runtime_error::RuntimeError;
use crate::runtime::scope::{ScopeId, SymbolTable};
use crate::runtime::vm::Vm;

/// Host routine behind a native function: `(vm, receiver, arguments)`.
///
/// The receiver is `None` for unbound natives.
pub type NativeFn = fn(&mut Vm, &Value, &[Value]) -> Result<Value, RuntimeError>;

/// A runtime value.
///
/// Built-in kinds carry their payload directly and get their operators from
/// native code; `Object` is the extension variant for user-defined classes,
/// whose operators are resolved through reserved attribute names.
#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(Rc<str>),
    Array(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<[Value]>),
    Function(Rc<Function>),
    Type(Rc<Type>),
    Iterator(Rc<RefCell<SequenceIter>>),
    Object(Rc<Object>),
}

impl Value {
    pub fn string(text: &str) -> Value {
        Value::String(Rc::from(text))
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Rc::from(items))
    }

    pub fn kind(&self) -> BuiltinKind {
        match self {
            Value::None => BuiltinKind::None,
            Value::Bool(_) => BuiltinKind::Bool,
            Value::Integer(_) => BuiltinKind::Integer,
            Value::Float(_) => BuiltinKind::Float,
            Value::String(_) => BuiltinKind::String,
            Value::Array(_) => BuiltinKind::Array,
            Value::Tuple(_) => BuiltinKind::Tuple,
            Value::Function(_) => BuiltinKind::Function,
            Value::Type(_) => BuiltinKind::Type,
            Value::Iterator(_) => BuiltinKind::Iterator,
            Value::Object(_) => BuiltinKind::Object,
        }
    }

    /// Name of the value's class, for diagnostics.
    pub fn type_name(&self) -> String {
        match self {
            Value::Object(object) => object.class.name.clone(),
            other => other.kind().name().to_string(),
        }
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    /// Identity comparison for reference kinds, value comparison otherwise.
    pub fn is(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Tuple(a), Value::Tuple(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Type(a), Value::Type(b)) => Rc::ptr_eq(a, b),
            (Value::Iterator(a), Value::Iterator(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (a, b) => a == b,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        equal_within(self, other, &mut Vec::new())
    }
}

/// `open` holds the array pairs compared further up; a pair met again closes
/// a cycle and counts as equal.
fn equal_within(left: &Value, right: &Value, open: &mut Vec<(usize, usize)>) -> bool {
    match (left, right) {
        (Value::None, Value::None) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Integer(a), Value::Integer(b)) => a == b,
        (Value::Float(a), Value::Float(b)) => a == b,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Array(a), Value::Array(b)) => {
            let key = (Rc::as_ptr(a) as usize, Rc::as_ptr(b) as usize);
            if Rc::ptr_eq(a, b) || open.contains(&key) {
                return true;
            }
            open.push(key);
            let equal = items_equal(&a.borrow(), &b.borrow(), open);
            open.pop();
            equal
        }
        (Value::Tuple(a), Value::Tuple(b)) => items_equal(a, b, open),
        (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
        (Value::Type(a), Value::Type(b)) => Rc::ptr_eq(a, b),
        (Value::Iterator(a), Value::Iterator(b)) => Rc::ptr_eq(a, b),
        (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
        _ => false,
    }
}

fn items_equal(left: &[Value], right: &[Value], open: &mut Vec<(usize, usize)>) -> bool {
    left.len() == right.len()
        && left
            .iter()
            .zip(right)
            .all(|(a, b)| equal_within(a, b, open))
}

pub fn format_float(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 {
        format!("{:.1}", value)
    } else {
        value.to_string()
    }
}

/// Writes `value`; an array already being written prints as `[...]`.
fn write_value(
    f: &mut fmt::Formatter<'_>,
    value: &Value,
    debug: bool,
    open: &mut Vec<usize>,
) -> fmt::Result {
    match value {
        Value::Array(items) => {
            let key = Rc::as_ptr(items) as usize;
            let (start, end) = if debug { ("Array([", "])") } else { ("[", "]") };
            if open.contains(&key) {
                return write!(f, "{}...{}", start, end);
            }
            open.push(key);
            write!(f, "{}", start)?;
            write_items(f, &items.borrow(), debug, open)?;
            open.pop();
            write!(f, "{}", end)
        }
        Value::Tuple(items) => {
            let (start, end) = if debug { ("Tuple([", "])") } else { ("(", ")") };
            write!(f, "{}", start)?;
            write_items(f, items, debug, open)?;
            write!(f, "{}", end)
        }
        Value::String(s) if debug => write!(f, "String({:?})", s),
        Value::String(s) => write!(f, "{}", s),
        Value::None => write!(f, "None"),
        Value::Bool(b) if debug => write!(f, "Bool({})", b),
        Value::Bool(b) => write!(f, "{}", b),
        Value::Integer(n) if debug => write!(f, "Integer({})", n),
        Value::Integer(n) => write!(f, "{}", n),
        Value::Float(x) if debug => write!(f, "Float({})", x),
        Value::Float(x) => write!(f, "{}", format_float(*x)),
        Value::Function(function) => write!(f, "Function@{}", function.name),
        Value::Type(class) => write!(f, "Type@{}", class.name),
        Value::Iterator(_) => write!(f, "Iterator"),
        Value::Object(object) => {
            write!(f, "{}@{:x}", object.class.name, Rc::as_ptr(object) as usize)
        }
    }
}

fn write_items(
    f: &mut fmt::Formatter<'_>,
    items: &[Value],
    debug: bool,
    open: &mut Vec<usize>,
) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        match item {
            Value::String(s) if !debug => write!(f, "{:?}", s)?,
            other => write_value(f, other, debug, open)?,
        }
    }
    Ok(())
}

/// Default string conversion; `__string__` overrides it for objects.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_value(f, self, false, &mut Vec::new())
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_value(f, self, true, &mut Vec::new())
    }
}

// =============================================================================
// Functions
// =============================================================================

#[derive(Clone)]
pub enum FunctionBody {
    Native {
        /// `None` accepts any number of arguments.
        arity: Option<usize>,
        call: NativeFn,
    },
    Compiled(CompiledBody),
}

/// Code range of a compiled function plus its defining scope.
#[derive(Clone)]
pub struct CompiledBody {
    pub program: Rc<Program>,
    /// Index of the body's `LOAD_FUNCTION_ARGS`.
    pub entry: usize,
    /// Number of body instructions from `entry`.
    pub len: usize,
    pub arity: usize,
    pub closure: ScopeId,
}

#[derive(Clone)]
pub struct Function {
    pub name: String,
    pub body: FunctionBody,
    /// Bound receiver; becomes `self` in the call scope.
    pub receiver: Option<Value>,
    /// Class functions and built-in natives bind their receiver when read
    /// off a value.
    pub method: bool,
}

impl Function {
    pub fn native(name: &str, arity: Option<usize>, call: NativeFn) -> Self {
        Function {
            name: name.to_string(),
            body: FunctionBody::Native { arity, call },
            receiver: None,
            method: true,
        }
    }

    pub fn compiled(name: &str, body: CompiledBody, method: bool) -> Self {
        Function {
            name: name.to_string(),
            body: FunctionBody::Compiled(body),
            receiver: None,
            method,
        }
    }

    pub fn arity(&self) -> Option<usize> {
        match &self.body {
            FunctionBody::Native { arity, .. } => *arity,
            FunctionBody::Compiled(body) => Some(body.arity),
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self.body, FunctionBody::Native { .. })
    }

    pub fn bind(&self, receiver: Value) -> Function {
        Function {
            receiver: Some(receiver),
            ..self.clone()
        }
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Function({}, arity={:?}, bound={})",
            self.name,
            self.arity(),
            self.receiver.is_some()
        )
    }
}

// =============================================================================
// Types and objects
// =============================================================================

pub enum Constructor {
    /// Built-in kinds convert their argument natively.
    Native(NativeFn),
    /// Allocate an `Object` and run the class's `__init__`.
    Instance,
}

pub struct Type {
    pub name: String,
    /// Direct bases, in declaration order.
    pub bases: Vec<Rc<Type>>,
    pub constructor: Constructor,
    attributes: RefCell<SymbolTable>,
}

impl Type {
    /// Every type starts with a default `__string__`.
    pub fn new(name: &str, bases: Vec<Rc<Type>>, constructor: Constructor) -> Self {
        let mut attributes = SymbolTable::new(None);
        attributes.set(
            Protocol::String.name(),
            Value::Function(Rc::new(Function::native(
                Protocol::String.name(),
                Some(0),
                builtins::default_string,
            ))),
        );

        Type {
            name: name.to_string(),
            bases,
            constructor,
            attributes: RefCell::new(attributes),
        }
    }

    /// True if `self` is `other` or any base implements `other`.
    ///
    /// Bases are fixed when a type is built, so the graph has no cycles.
    pub fn implements(&self, other: &Type) -> bool {
        std::ptr::eq(self, other) || self.bases.iter().any(|base| base.implements(other))
    }

    /// Own attributes first, then bases depth-first in declaration order.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.attributes.borrow().get(name) {
            return Some(value.clone());
        }
        self.bases.iter().find_map(|base| base.lookup(name))
    }

    pub fn own_attribute(&self, name: &str) -> Option<Value> {
        self.attributes.borrow().get(name).cloned()
    }

    pub fn set_attribute(&self, name: &str, value: Value) {
        self.attributes.borrow_mut().set(name, value);
    }

    pub fn remove_attribute(&self, name: &str) -> Option<Value> {
        self.attributes.borrow_mut().remove(name)
    }

    pub fn is_user_class(&self) -> bool {
        matches!(self.constructor, Constructor::Instance)
    }

    /// Snapshot of the type's own attribute values.
    pub fn attribute_values(&self) -> Vec<Value> {
        self.attributes.borrow().iter().map(|(_, v)| v.clone()).collect()
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Type@{}", self.name)
    }
}

/// Instance of a user-defined class (or of `Object`/`Module`).
pub struct Object {
    pub class: Rc<Type>,
    attributes: RefCell<SymbolTable>,
}

impl Object {
    pub fn new(class: Rc<Type>) -> Self {
        Object {
            class,
            attributes: RefCell::new(SymbolTable::new(None)),
        }
    }

    pub fn own_attribute(&self, name: &str) -> Option<Value> {
        self.attributes.borrow().get(name).cloned()
    }

    pub fn set_attribute(&self, name: &str, value: Value) {
        self.attributes.borrow_mut().set(name, value);
    }

    pub fn remove_attribute(&self, name: &str) -> Option<Value> {
        self.attributes.borrow_mut().remove(name)
    }

    /// Snapshot of the attribute values.
    pub fn attribute_values(&self) -> Vec<Value> {
        self.attributes.borrow().iter().map(|(_, v)| v.clone()).collect()
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:x}", self.class.name, self as *const Object as usize)
    }
}

/// Cursor over a snapshot of a built-in sequence.
#[derive(Debug)]
pub struct SequenceIter {
    items: Vec<Value>,
    position: usize,
}

impl SequenceIter {
    pub fn new(items: Vec<Value>) -> Self {
        SequenceIter { items, position: 0 }
    }

    pub fn has_next(&self) -> bool {
        self.position < self.items.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Iterator for SequenceIter {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        let item = self.items.get(self.position).cloned()?;
        self.position += 1;
        Some(item)
    }
}
