use std::ops::Range;
use std::rc::Rc;

use tracing::{debug, instrument, trace};

use crate::bytecode::verify::check_program;
use crate::bytecode::{Instruction, Opcode, Operand, Program};
use crate::lang::operator::UnaryOp;
use crate::lang::protocol::{Protocol, SELF};
use crate::runtime::builtins::{BuiltinKind, Builtins};
use crate::runtime::collect::ScopeTracer;
use crate::runtime::dispatch;
use crate::runtime::runtime_error::{
    ErrorKind, RuntimeError, arity_mismatch, invalid_bytecode, type_mismatch,
};
use crate::runtime::scope::{ScopeArena, ScopeId};
use crate::runtime::stack::{BoundedStack, MAX_STACK_DEPTH};
use crate::runtime::value::{
    CompiledBody, Constructor, Function, FunctionBody, Object, Type, Value,
};

/// Live scope count that triggers the first collection.
const MIN_COLLECT_THRESHOLD: usize = 64;

#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Depth limit of the operand stack and of the scope stack.
    pub max_stack_depth: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_stack_depth: MAX_STACK_DEPTH,
        }
    }
}

enum FrameKind {
    Call,
    /// Returns the instance instead of the initializer's result.
    Initializer(Value),
    /// Class body; its namespace becomes the type's attributes.
    Class(Rc<Type>),
    Module(Rc<Object>),
}

struct Frame {
    kind: FrameKind,
    /// Program to resume in once the frame returns.
    program: Rc<Program>,
    /// Instruction range of the running body; only handler regions inside
    /// it belong to this frame.
    code: Range<usize>,
    return_ip: usize,
    call_site: usize,
    stack_base: usize,
    scope_depth: usize,
    /// Entered from native code; returning hands the value back to it.
    reentrant: bool,
    name: String,
}

/// Operand depth when execution entered handler region `region` of the
/// body running at frame depth `frame`.
struct RegionEntry {
    frame: usize,
    region: usize,
    depth: usize,
}

enum Flow {
    Next,
    Jump(usize),
    Finish(Value),
}

enum Invoked {
    Done(Value),
    /// A compiled body was entered at this ip.
    Entered(usize),
}

/// Stack machine with an operand stack and a scope stack.
///
/// Calls to compiled functions push a frame and keep running in the same
/// loop. Native code that needs to call back into compiled code (operator
/// dispatch, protocol methods) goes through [`Vm::call_value`], which runs a
/// nested loop until that frame returns.
pub struct Vm {
    program: Rc<Program>,
    ip: usize,
    stack: BoundedStack<Value>,
    scopes: BoundedStack<ScopeId>,
    arena: ScopeArena,
    frames: Vec<Frame>,
    region_entries: Vec<RegionEntry>,
    builtins: Builtins,
    globals: ScopeId,
    /// Last value discarded by `POP`.
    last_value: Value,
    /// Live scope count at which the next collection runs.
    collect_at: usize,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        let builtins = Builtins::new();
        let mut arena = ScopeArena::default();

        let root = arena.allocate(None);
        if let Some(table) = arena.get_mut(root) {
            for (kind, class) in builtins.iter() {
                table.set(kind.name(), Value::Type(Rc::clone(class)));
            }
        }
        let globals = arena.allocate(Some(root));
        arena.capture(globals);

        Vm {
            stack: BoundedStack::new("operand", config.max_stack_depth),
            scopes: BoundedStack::with_items("scope", config.max_stack_depth, vec![globals]),
            program: Rc::new(Program::default()),
            ip: 0,
            arena,
            frames: Vec::new(),
            region_entries: Vec::new(),
            builtins,
            globals,
            last_value: Value::None,
            collect_at: MIN_COLLECT_THRESHOLD,
        }
    }

    pub fn stack(&self) -> &[Value] {
        self.stack.as_slice()
    }

    /// Resolves `name` from the global scope outward.
    pub fn global(&self, name: &str) -> Option<Value> {
        self.arena.lookup(self.globals, name)
    }

    pub fn define_global(&mut self, name: &str, value: Value) {
        if let Some(table) = self.arena.get_mut(self.globals) {
            table.set(name, value);
        }
    }

    pub fn builtin_type(&self, kind: BuiltinKind) -> Rc<Type> {
        Rc::clone(self.builtins.type_of(kind))
    }

    /// Number of scopes currently allocated.
    pub fn live_scopes(&self) -> usize {
        self.arena.live()
    }

    pub fn reset_execution_state(&mut self) {
        self.ip = 0;
        self.frames.clear();
        self.region_entries.clear();
        self.stack.truncate(0);
        self.pop_scopes_to(1);
        self.last_value = Value::None;
    }

    /// Verify and run a program from its first instruction.
    ///
    /// The result is the value of a top-level `RETURN`, or else whatever is
    /// left on top of the operand stack, or else the last discarded value.
    #[instrument(skip_all)]
    pub fn run_compiled(&mut self, program: &Program) -> Result<Value, RuntimeError> {
        check_program(program).map_err(|e| invalid_bytecode(e.to_string()))?;

        self.reset_execution_state();
        self.program = Rc::new(program.clone());

        debug!(
            instructions = program.len(),
            handlers = program.handlers.len(),
            "running program"
        );

        let result = self.execute();
        match &result {
            Ok(value) => {
                debug!(result = ?value, "program finished");
                self.collect_scopes(Some(value));
            }
            Err(_) => self.reset_execution_state(),
        }
        result
    }

    // =========================================================================
    // Execution
    // =========================================================================

    fn execute(&mut self) -> Result<Value, RuntimeError> {
        loop {
            let program = Rc::clone(&self.program);

            let Some(instruction) = program.instructions.get(self.ip) else {
                if self.frames.is_empty() {
                    return Ok(self
                        .stack
                        .peek()
                        .cloned()
                        .unwrap_or_else(|| self.last_value.clone()));
                }
                return Err(invalid_bytecode(format!(
                    "execution ran past the end of the program at {:04}",
                    self.ip
                )));
            };

            trace!(
                ip = self.ip,
                opcode = ?instruction.opcode,
                stack = self.stack.len(),
                scopes = self.scopes.len(),
                "step"
            );

            if program.handlers.iter().any(|h| h.start == self.ip) {
                self.enter_regions(&program);
            }
            if self.arena.live() >= self.collect_at {
                self.collect_scopes(None);
            }

            match self.step(instruction) {
                Ok(Flow::Next) => self.ip += 1,
                Ok(Flow::Jump(target)) => self.ip = target,
                Ok(Flow::Finish(value)) => return Ok(value),
                Err(err) => self.unwind(err.at_line(instruction.line))?,
            }
        }
    }

    fn step(&mut self, instruction: &Instruction) -> Result<Flow, RuntimeError> {
        match instruction.opcode {
            Opcode::Nop => {}

            // Literals
            Opcode::NewString => self.stack.push(Value::string(text(instruction)?))?,
            Opcode::NewInteger => self.stack.push(Value::Integer(integer(instruction)?))?,
            Opcode::NewFloat => {
                let literal = text(instruction)?;
                let value = literal.parse::<f64>().map_err(|_| {
                    invalid_bytecode(format!("malformed float literal '{}'", literal))
                })?;
                self.stack.push(Value::Float(value))?;
            }
            Opcode::NewTrue => self.stack.push(Value::Bool(true))?,
            Opcode::NewFalse => self.stack.push(Value::Bool(false))?,
            Opcode::NewNone => self.stack.push(Value::None)?,
            Opcode::NewArray => {
                let items = self.stack.pop_many(count(instruction)?)?;
                self.stack.push(Value::array(items))?;
            }
            Opcode::NewTuple => {
                let items = self.stack.pop_many(count(instruction)?)?;
                self.stack.push(Value::tuple(items))?;
            }

            // Definitions
            Opcode::NewFunction | Opcode::NewClassFunction => {
                return self.define_function(instruction);
            }
            Opcode::LoadFunctionArguments => {
                let parameters = names(instruction)?;
                let arguments = self.stack.pop_many(parameters.len())?;
                for (name, value) in parameters.iter().zip(arguments) {
                    self.bind(name, value)?;
                }
            }
            Opcode::NewClass => return self.define_class(instruction),
            Opcode::NewModule => return self.define_module(instruction),

            // Access
            Opcode::Identifier => {
                let name = text(instruction)?;
                let value = self
                    .arena
                    .lookup(self.current_scope()?, name)
                    .ok_or_else(|| ErrorKind::UndefinedName(name.to_string()))?;
                self.stack.push(value)?;
            }
            Opcode::Selector => {
                let receiver = self.stack.pop()?;
                let value = self.get_attribute(&receiver, text(instruction)?)?;
                self.stack.push(value)?;
            }
            Opcode::Index => {
                let index = self.stack.pop()?;
                let source = self.stack.pop()?;
                let value = dispatch::get_index(self, &source, &index)?;
                self.stack.push(value)?;
            }

            // Calls
            Opcode::Call => {
                let argc = count(instruction)?;
                let callee = self.stack.pop()?;
                return match self.invoke(&callee, argc, false)? {
                    Invoked::Done(value) => {
                        self.stack.push(value)?;
                        Ok(Flow::Next)
                    }
                    Invoked::Entered(entry) => Ok(Flow::Jump(entry)),
                };
            }
            Opcode::Return => return self.return_from_frame(count(instruction)?),
            Opcode::Pop => self.last_value = self.stack.pop()?,
            Opcode::Raise => {
                let value = self.stack.pop()?;
                return Err(ErrorKind::Raised(value).into());
            }

            // Assignment
            Opcode::AssignIdentifier => {
                let value = self.stack.pop()?;
                self.bind(text(instruction)?, value)?;
            }
            Opcode::AssignSelector => {
                let receiver = self.stack.pop()?;
                let value = self.stack.pop()?;
                self.set_attribute(&receiver, text(instruction)?, value)?;
            }
            Opcode::AssignIndex => {
                let index = self.stack.pop()?;
                let target = self.stack.pop()?;
                let value = self.stack.pop()?;
                dispatch::set_index(self, &target, &index, value)?;
            }
            Opcode::DeleteIdentifier => {
                let name = text(instruction)?;
                let scope = self.current_scope()?;
                let removed = self
                    .arena
                    .get_mut(scope)
                    .and_then(|table| table.remove(name));
                if removed.is_none() {
                    return Err(ErrorKind::UndefinedName(name.to_string()).into());
                }
            }
            Opcode::DeleteSelector => {
                let receiver = self.stack.pop()?;
                self.delete_attribute(&receiver, text(instruction)?)?;
            }
            Opcode::DeleteIndex => {
                let index = self.stack.pop()?;
                let target = self.stack.pop()?;
                dispatch::delete_index(self, &target, &index)?;
            }

            // Unary
            Opcode::Not | Opcode::Negative | Opcode::NegateBits => {
                let op = match instruction.opcode {
                    Opcode::Not => UnaryOp::Not,
                    Opcode::Negative => UnaryOp::Negative,
                    _ => UnaryOp::NegateBits,
                };
                let operand = self.stack.pop()?;
                let value = dispatch::unary(self, op, &operand)?;
                self.stack.push(value)?;
            }
            Opcode::Implements => {
                let value = self.stack.pop()?;
                let class = self.stack.pop()?;
                let result = dispatch::implements(self, &value, &class)?;
                self.stack.push(Value::Bool(result))?;
            }

            // Jumps
            Opcode::Jump | Opcode::Break | Opcode::Continue | Opcode::Redo => {
                return Ok(Flow::Jump(self.jump_target(instruction)?));
            }
            Opcode::JumpIfFalse | Opcode::JumpIfTrue => {
                let condition = self.stack.pop()?;
                let expected = instruction.opcode == Opcode::JumpIfTrue;
                if self.truthy(&condition)? == expected {
                    return Ok(Flow::Jump(self.jump_target(instruction)?));
                }
            }
            Opcode::ForLoop => return self.for_loop(instruction),

            // Binary operators: the left operand is on top.
            opcode => {
                let Some(op) = opcode.binary_op() else {
                    return Err(invalid_bytecode(format!("unexpected {:?}", opcode)));
                };
                let left = self.stack.pop()?;
                let right = self.stack.pop()?;
                let value = dispatch::binary(self, op, &left, &right)?;
                self.stack.push(value)?;
            }
        }

        Ok(Flow::Next)
    }

    /// Finds the innermost handler for the failing instruction, unwinding
    /// frames until one covers their call site. Fatal errors are never caught.
    fn unwind(&mut self, mut err: RuntimeError) -> Result<(), RuntimeError> {
        if err.is_fatal() {
            return Err(err);
        }

        loop {
            let (code, stack_base, scope_depth) = match self.frames.last() {
                Some(frame) => (frame.code.clone(), frame.stack_base, frame.scope_depth + 1),
                None => (0..self.program.len(), 0, 1),
            };

            let found = self
                .program
                .handler_within(self.ip, &code)
                .map(|(region, handler)| (region, handler.clone()));
            if let Some((region, handler)) = found {
                let depth = self.region_depth(region).map_or(stack_base, |d| d.max(stack_base));
                self.stack.truncate(depth);
                self.pop_scopes_to(scope_depth);

                debug!(ip = self.ip, target = handler.target, error = %err.kind, "entering handler");
                if let Some(name) = &handler.capture {
                    self.bind(name, err.into_value())?;
                }
                self.ip = handler.target;
                return Ok(());
            }

            let Some(frame) = self.frames.pop() else {
                debug!(error = %err, "unhandled error");
                return Err(err);
            };

            self.forget_regions();
            err = err.with_context(&frame.name);
            self.stack.truncate(frame.stack_base);
            self.pop_scopes_to(frame.scope_depth);
            self.program = frame.program;
            self.ip = frame.call_site;

            if frame.reentrant {
                return Err(err);
            }
        }
    }

    fn jump_target(&self, instruction: &Instruction) -> Result<usize, RuntimeError> {
        let offset = instruction.offset().ok_or_else(|| {
            invalid_bytecode(format!(
                "unresolved {:?} at {:04}",
                instruction.opcode, self.ip
            ))
        })?;
        (self.ip as i64)
            .checked_add(offset)
            .and_then(|target| usize::try_from(target).ok())
            .ok_or_else(|| {
                invalid_bytecode(format!("jump by {} from {:04} out of range", offset, self.ip))
            })
    }

    /// Records the operand depth for every region starting at `ip`.
    fn enter_regions(&mut self, program: &Program) {
        let frame = self.frames.len();
        let depth = self.stack.len();
        for (region, handler) in program.handlers.iter().enumerate() {
            if handler.start != self.ip {
                continue;
            }
            match self
                .region_entries
                .iter_mut()
                .find(|e| e.frame == frame && e.region == region)
            {
                Some(entry) => entry.depth = depth,
                None => self.region_entries.push(RegionEntry { frame, region, depth }),
            }
        }
    }

    fn region_depth(&self, region: usize) -> Option<usize> {
        let frame = self.frames.len();
        self.region_entries
            .iter()
            .find(|e| e.frame == frame && e.region == region)
            .map(|e| e.depth)
    }

    /// Drops region entries of frames that have returned.
    fn forget_regions(&mut self) {
        let frame = self.frames.len();
        self.region_entries.retain(|e| e.frame <= frame);
    }

    // =========================================================================
    // Collection
    // =========================================================================

    /// Frees captured scopes that no root reaches. Skipped while a native
    /// caller waits on a nested loop, since it may hold values outside the
    /// roots.
    fn collect_scopes(&mut self, result: Option<&Value>) {
        if self.frames.iter().any(|frame| frame.reentrant) {
            return;
        }

        let mut tracer = ScopeTracer::new(&self.arena);
        tracer.scope(self.globals);
        for scope in self.scopes.as_slice() {
            tracer.scope(*scope);
        }
        tracer.values(self.stack.as_slice());
        tracer.value(&self.last_value);
        if let Some(value) = result {
            tracer.value(value);
        }
        for frame in &self.frames {
            match &frame.kind {
                FrameKind::Call => {}
                FrameKind::Initializer(instance) => tracer.value(instance),
                FrameKind::Class(class) => tracer.value(&Value::Type(Rc::clone(class))),
                FrameKind::Module(module) => tracer.value(&Value::Object(Rc::clone(module))),
            }
        }

        let reachable = tracer.finish();
        let freed = self.arena.sweep(&reachable);
        let live = self.arena.live();
        self.collect_at = MIN_COLLECT_THRESHOLD.max(live * 2);
        debug!(freed, live, "collected scopes");
    }

    // =========================================================================
    // Scopes
    // =========================================================================

    fn current_scope(&self) -> Result<ScopeId, RuntimeError> {
        self.scopes
            .peek()
            .copied()
            .ok_or_else(|| invalid_bytecode("scope stack is empty"))
    }

    fn bind(&mut self, name: &str, value: Value) -> Result<(), RuntimeError> {
        let scope = self.current_scope()?;
        let table = self
            .arena
            .get_mut(scope)
            .ok_or_else(|| invalid_bytecode("current scope was released"))?;
        table.set(name, value);
        Ok(())
    }

    fn push_scope(&mut self, scope: ScopeId) -> Result<(), RuntimeError> {
        if let Err(err) = self.scopes.push(scope) {
            self.arena.release(scope);
            return Err(err);
        }
        Ok(())
    }

    /// Pops scopes above `depth`, freeing the ones no closure captured.
    fn pop_scopes_to(&mut self, depth: usize) {
        for scope in self.scopes.truncate(depth) {
            self.arena.release(scope);
        }
    }

    // =========================================================================
    // Definitions
    // =========================================================================

    fn define_function(&mut self, instruction: &Instruction) -> Result<Flow, RuntimeError> {
        let (len, arity) = pair(instruction)?;
        let entry = self.ip + 1;
        let after = entry + len;

        // The name comes from the assignment that follows the body.
        let name = match self.program.instructions.get(after) {
            Some(Instruction {
                opcode: Opcode::AssignIdentifier,
                operand: Operand::Text(name),
                ..
            }) => name.clone(),
            _ => "<anonymous>".to_string(),
        };

        let closure = self.current_scope()?;
        self.arena.capture(closure);

        let body = CompiledBody {
            program: Rc::clone(&self.program),
            entry,
            len,
            arity,
            closure,
        };
        let method = instruction.opcode == Opcode::NewClassFunction;
        self.stack
            .push(Value::Function(Rc::new(Function::compiled(&name, body, method))))?;
        Ok(Flow::Jump(after))
    }

    fn define_class(&mut self, instruction: &Instruction) -> Result<Flow, RuntimeError> {
        let (len, base_count) = pair(instruction)?;
        let name = match self.stack.pop()? {
            Value::String(name) => name,
            other => return Err(type_mismatch("class name", &other)),
        };

        let mut bases = Vec::with_capacity(base_count);
        for base in self.stack.pop_many(base_count)? {
            match base {
                Value::Type(class) if class.is_user_class() => bases.push(class),
                Value::Type(class) => {
                    return Err(ErrorKind::TypeMismatch {
                        expected: "subclassable type".to_string(),
                        found: format!("built-in type {}", class.name),
                    }
                    .into());
                }
                other => return Err(type_mismatch("Type", &other)),
            }
        }
        if bases.is_empty() {
            bases.push(self.builtin_type(BuiltinKind::Object));
        }

        let class = Rc::new(Type::new(&name, bases, Constructor::Instance));
        self.enter_namespace(FrameKind::Class(class), &name, len)
    }

    fn define_module(&mut self, instruction: &Instruction) -> Result<Flow, RuntimeError> {
        let len = count(instruction)?;
        let name = match self.stack.pop()? {
            Value::String(name) => name,
            other => return Err(type_mismatch("module name", &other)),
        };

        let module = Rc::new(Object::new(self.builtin_type(BuiltinKind::Module)));
        self.enter_namespace(FrameKind::Module(module), &name, len)
    }

    /// Runs the `len` instructions that follow in a fresh scope; the frame's
    /// `RETURN` turns that scope into attributes.
    fn enter_namespace(
        &mut self,
        kind: FrameKind,
        name: &str,
        len: usize,
    ) -> Result<Flow, RuntimeError> {
        let parent = self.current_scope()?;
        let scope = self.arena.allocate(Some(parent));
        self.push_scope(scope)?;

        self.frames.push(Frame {
            kind,
            program: Rc::clone(&self.program),
            code: self.ip + 1..self.ip + 1 + len,
            return_ip: self.ip + 1 + len,
            call_site: self.ip,
            stack_base: self.stack.len(),
            scope_depth: self.scopes.len() - 1,
            reentrant: false,
            name: name.to_string(),
        });
        Ok(Flow::Next)
    }

    fn return_from_frame(&mut self, n: usize) -> Result<Flow, RuntimeError> {
        let mut results = self.stack.pop_many(n)?;
        let value = match results.len() {
            0 => Value::None,
            1 => results.remove(0),
            _ => Value::tuple(results),
        };

        let Some(frame) = self.frames.pop() else {
            return Ok(Flow::Finish(value));
        };

        self.forget_regions();
        self.stack.truncate(frame.stack_base);
        let namespace = self
            .scopes
            .as_slice()
            .get(frame.scope_depth)
            .and_then(|id| self.arena.get(*id));

        let value = match frame.kind {
            FrameKind::Call => value,
            FrameKind::Initializer(instance) => instance,
            FrameKind::Class(class) => {
                if let Some(table) = namespace {
                    for (name, member) in table.iter() {
                        class.set_attribute(name, member.clone());
                    }
                }
                Value::Type(class)
            }
            FrameKind::Module(module) => {
                if let Some(table) = namespace {
                    for (name, member) in table.iter() {
                        module.set_attribute(name, member.clone());
                    }
                }
                Value::Object(module)
            }
        };

        self.pop_scopes_to(frame.scope_depth);
        self.program = frame.program;

        if frame.reentrant {
            self.ip = frame.return_ip;
            return Ok(Flow::Finish(value));
        }
        self.stack.push(value)?;
        Ok(Flow::Jump(frame.return_ip))
    }

    fn for_loop(&mut self, instruction: &Instruction) -> Result<Flow, RuntimeError> {
        let receivers = names(instruction)?;
        let source = self.stack.pop()?;
        let source = dispatch::iterator_for(&source)?;
        self.stack.push(source.clone())?;

        if !dispatch::has_next(self, &source)? {
            return Ok(Flow::Next);
        }
        let element = dispatch::next(self, &source)?;
        self.bind_receivers(receivers, element)?;

        // Skip the exit jump.
        Ok(Flow::Jump(self.ip + 2))
    }

    fn bind_receivers(&mut self, receivers: &[String], element: Value) -> Result<(), RuntimeError> {
        if let [name] = receivers {
            return self.bind(name, element);
        }

        let items = match &element {
            Value::Tuple(items) => items.to_vec(),
            Value::Array(items) => items.borrow().clone(),
            other => return Err(type_mismatch("Tuple", other)),
        };
        if items.len() != receivers.len() {
            return Err(arity_mismatch(receivers.len(), items.len()));
        }
        for (name, item) in receivers.iter().zip(items) {
            self.bind(name, item)?;
        }
        Ok(())
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Calls `callee` with `argc` arguments already on the operand stack.
    fn invoke(
        &mut self,
        callee: &Value,
        argc: usize,
        reentrant: bool,
    ) -> Result<Invoked, RuntimeError> {
        match callee {
            Value::Function(function) => match &function.body {
                FunctionBody::Native { arity, call } => {
                    if let Some(arity) = arity {
                        if *arity != argc {
                            return Err(arity_mismatch(*arity, argc));
                        }
                    }
                    let args = self.stack.pop_many(argc)?;
                    let receiver = function.receiver.clone().unwrap_or(Value::None);
                    let value = call(self, &receiver, &args)
                        .map_err(|err| err.with_context(&function.name))?;
                    Ok(Invoked::Done(value))
                }
                FunctionBody::Compiled(body) => self
                    .enter_compiled(function, body, argc, FrameKind::Call, reentrant)
                    .map(Invoked::Entered),
            },
            Value::Type(class) => self.construct(class, argc, reentrant),
            Value::Object(_) => match self.lookup_attribute(callee, Protocol::Call.name()) {
                Some(method) => self.invoke(&method, argc, reentrant),
                None => Err(ErrorKind::NotCallable(callee.type_name()).into()),
            },
            other => Err(ErrorKind::NotCallable(other.type_name()).into()),
        }
    }

    fn enter_compiled(
        &mut self,
        function: &Function,
        body: &CompiledBody,
        argc: usize,
        kind: FrameKind,
        reentrant: bool,
    ) -> Result<usize, RuntimeError> {
        if argc != body.arity {
            return Err(arity_mismatch(body.arity, argc));
        }
        let stack_base = self
            .stack
            .len()
            .checked_sub(argc)
            .ok_or_else(|| invalid_bytecode("call arguments missing from the operand stack"))?;

        let scope = self.arena.allocate(Some(body.closure));
        if let (Some(receiver), Some(table)) = (&function.receiver, self.arena.get_mut(scope)) {
            table.set(SELF, receiver.clone());
        }
        self.push_scope(scope)?;

        let caller = std::mem::replace(&mut self.program, Rc::clone(&body.program));
        self.frames.push(Frame {
            kind,
            program: caller,
            code: body.entry..body.entry + body.len,
            return_ip: if reentrant { self.ip } else { self.ip + 1 },
            call_site: self.ip,
            stack_base,
            scope_depth: self.scopes.len() - 1,
            reentrant,
            name: function.name.clone(),
        });
        Ok(body.entry)
    }

    fn construct(
        &mut self,
        class: &Rc<Type>,
        argc: usize,
        reentrant: bool,
    ) -> Result<Invoked, RuntimeError> {
        let build = match &class.constructor {
            Constructor::Native(build) => *build,
            Constructor::Instance => return self.instantiate(class, argc, reentrant),
        };
        let args = self.stack.pop_many(argc)?;
        Ok(Invoked::Done(build(self, &Value::Type(Rc::clone(class)), &args)?))
    }

    fn instantiate(
        &mut self,
        class: &Rc<Type>,
        argc: usize,
        reentrant: bool,
    ) -> Result<Invoked, RuntimeError> {
        let instance = Value::Object(Rc::new(Object::new(Rc::clone(class))));

        match class.lookup(Protocol::Initialize.name()) {
            Some(Value::Function(initializer)) => {
                let bound = initializer.bind(instance.clone());
                match &bound.body {
                    FunctionBody::Compiled(body) => self
                        .enter_compiled(
                            &bound,
                            body,
                            argc,
                            FrameKind::Initializer(instance),
                            reentrant,
                        )
                        .map(Invoked::Entered),
                    FunctionBody::Native { .. } => {
                        self.invoke(&Value::Function(Rc::new(bound.clone())), argc, reentrant)?;
                        Ok(Invoked::Done(instance))
                    }
                }
            }
            Some(other) => Err(ErrorKind::NotCallable(other.type_name()).into()),
            None if argc == 0 => Ok(Invoked::Done(instance)),
            None => Err(arity_mismatch(0, argc)),
        }
    }

    /// Calls any callable from native code and waits for its result.
    pub fn call_value(&mut self, callee: &Value, args: Vec<Value>) -> Result<Value, RuntimeError> {
        let base = self.stack.len();
        let argc = args.len();

        for arg in args.into_iter().rev() {
            if let Err(err) = self.stack.push(arg) {
                self.stack.truncate(base);
                return Err(err);
            }
        }

        match self.invoke(callee, argc, true) {
            Ok(Invoked::Done(value)) => Ok(value),
            Ok(Invoked::Entered(entry)) => {
                self.ip = entry;
                self.execute()
            }
            Err(err) => {
                self.stack.truncate(base);
                Err(err)
            }
        }
    }

    // =========================================================================
    // Attributes
    // =========================================================================

    pub fn class_of(&self, value: &Value) -> Rc<Type> {
        match value {
            Value::Object(object) => Rc::clone(&object.class),
            other => self.builtin_type(other.kind()),
        }
    }

    /// Attribute lookup without failing.
    ///
    /// Objects check their own attributes before their class. Methods found
    /// on a class come back bound to `value`; reading a type's attributes
    /// binds only natives, so compiled methods stay plain functions.
    pub fn lookup_attribute(&self, value: &Value, name: &str) -> Option<Value> {
        if name == Protocol::Class.name() {
            return Some(Value::Type(self.class_of(value)));
        }

        let found = match value {
            Value::Object(object) => {
                if let Some(own) = object.own_attribute(name) {
                    return Some(own);
                }
                object.class.lookup(name)?
            }
            Value::Type(class) => class.lookup(name)?,
            other => self.builtins.type_of(other.kind()).lookup(name)?,
        };

        if let Value::Function(function) = &found {
            let binds = match value {
                Value::Type(_) => function.is_native(),
                _ => function.method,
            };
            if binds && function.receiver.is_none() {
                return Some(Value::Function(Rc::new(function.bind(value.clone()))));
            }
        }
        Some(found)
    }

    pub fn get_attribute(&self, value: &Value, name: &str) -> Result<Value, RuntimeError> {
        self.lookup_attribute(value, name).ok_or_else(|| {
            ErrorKind::MissingAttribute {
                type_name: value.type_name(),
                name: name.to_string(),
            }
            .into()
        })
    }

    fn attribute_owner<'a>(&self, value: &'a Value) -> Result<&'a Value, RuntimeError> {
        match value {
            Value::Object(_) => Ok(value),
            Value::Type(class)
                if class.is_user_class()
                    && !Rc::ptr_eq(class, self.builtins.type_of(BuiltinKind::Object)) =>
            {
                Ok(value)
            }
            other => Err(ErrorKind::TypeMismatch {
                expected: "object with attributes".to_string(),
                found: other.to_string(),
            }
            .into()),
        }
    }

    pub fn set_attribute(
        &mut self,
        value: &Value,
        name: &str,
        member: Value,
    ) -> Result<(), RuntimeError> {
        match self.attribute_owner(value)? {
            Value::Object(object) => object.set_attribute(name, member),
            Value::Type(class) => class.set_attribute(name, member),
            _ => {}
        }
        Ok(())
    }

    pub fn delete_attribute(&mut self, value: &Value, name: &str) -> Result<(), RuntimeError> {
        let removed = match self.attribute_owner(value)? {
            Value::Object(object) => object.remove_attribute(name),
            Value::Type(class) => class.remove_attribute(name),
            _ => None,
        };
        match removed {
            Some(_) => Ok(()),
            None => Err(ErrorKind::MissingAttribute {
                type_name: value.type_name(),
                name: name.to_string(),
            }
            .into()),
        }
    }

    // =========================================================================
    // Conversions
    // =========================================================================

    /// Truthiness. Objects answer through `__bool__`, then `__len__`, and
    /// are truthy otherwise.
    pub fn truthy(&mut self, value: &Value) -> Result<bool, RuntimeError> {
        match value {
            Value::None => Ok(false),
            Value::Bool(b) => Ok(*b),
            Value::Integer(n) => Ok(*n != 0),
            Value::Float(x) => Ok(*x != 0.0),
            Value::String(s) => Ok(!s.is_empty()),
            Value::Array(items) => Ok(!items.borrow().is_empty()),
            Value::Tuple(items) => Ok(!items.is_empty()),
            Value::Function(_) | Value::Type(_) | Value::Iterator(_) => Ok(true),
            Value::Object(_) => {
                if let Some(method) = self.lookup_attribute(value, Protocol::Bool.name()) {
                    return match self.call_value(&method, Vec::new())? {
                        Value::Bool(b) => Ok(b),
                        other => Err(type_mismatch("Bool", &other)),
                    };
                }
                if let Some(method) = self.lookup_attribute(value, Protocol::Length.name()) {
                    return match self.call_value(&method, Vec::new())? {
                        Value::Integer(n) => Ok(n != 0),
                        other => Err(type_mismatch("Integer", &other)),
                    };
                }
                Ok(true)
            }
        }
    }

    /// String conversion; objects go through `__string__`.
    pub fn stringify(&mut self, value: &Value) -> Result<String, RuntimeError> {
        match value {
            Value::String(s) => Ok(s.to_string()),
            Value::Object(_) => match self.lookup_attribute(value, Protocol::String.name()) {
                Some(method) => match self.call_value(&method, Vec::new())? {
                    Value::String(s) => Ok(s.to_string()),
                    other => Err(type_mismatch("String", &other)),
                },
                None => Ok(value.to_string()),
            },
            other => Ok(other.to_string()),
        }
    }
}

// =============================================================================
// Operand accessors
// =============================================================================

fn bad_operand(instruction: &Instruction, expected: &str) -> RuntimeError {
    invalid_bytecode(format!(
        "{:?} expects {} operand, found {:?}",
        instruction.opcode, expected, instruction.operand
    ))
}

fn text(instruction: &Instruction) -> Result<&str, RuntimeError> {
    match &instruction.operand {
        Operand::Text(text) => Ok(text),
        _ => Err(bad_operand(instruction, "a text")),
    }
}

fn integer(instruction: &Instruction) -> Result<i64, RuntimeError> {
    match instruction.operand {
        Operand::Integer(value) => Ok(value),
        _ => Err(bad_operand(instruction, "an integer")),
    }
}

fn count(instruction: &Instruction) -> Result<usize, RuntimeError> {
    match instruction.operand {
        Operand::Integer(value) if value >= 0 => Ok(value as usize),
        _ => Err(bad_operand(instruction, "a count")),
    }
}

fn names(instruction: &Instruction) -> Result<&[String], RuntimeError> {
    match &instruction.operand {
        Operand::Names(names) => Ok(names),
        _ => Err(bad_operand(instruction, "a name list")),
    }
}

fn pair(instruction: &Instruction) -> Result<(usize, usize), RuntimeError> {
    match instruction.operand {
        Operand::Pair(first, second) => Ok((first, second)),
        _ => Err(bad_operand(instruction, "a pair")),
    }
}
