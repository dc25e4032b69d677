//! The stack-based bytecode interpreter: call frames, closures with
//! open/closed upvalues, classes with method inheritance and bound
//! methods, and the opcode dispatch loop. Mirrors `vm.c`'s `run()`,
//! adapted to the tagged-union `Value` and an explicit `Vm` instance in
//! place of the original's global singleton, so an embedder can run more
//! than one interpreter in the same process.

use std::cell::RefCell;
use std::io::Write;
use std::ptr::NonNull;
use std::time::Instant;

use ember_core::chunk::Chunk;
use ember_core::heap::Heap;
use ember_core::object::{
    BoundMethod, Class, Closure, Instance, NativeContext, Obj, ObjKind, ObjNative, Upvalue,
    UpvalueState,
};
use ember_core::opcode::OpCode;
use ember_core::table::Table;
use ember_core::value::Value;

use crate::config::VmConfig;
use crate::disassemble;
use crate::error::{NativeError, RuntimeError};
use crate::natives;

struct CallFrame {
    closure: NonNull<Obj>,
    ip: usize,
    slots_base: usize,
}

/// One running program. Owns the value stack, call-frame array, globals
/// table, and the open-upvalue list; holds a shared reference to the
/// `Heap` it allocates through (also held by the compiler that produced
/// the function this VM runs).
pub struct Vm<'h, W: Write> {
    heap: &'h Heap,
    config: VmConfig,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    open_upvalues: Option<NonNull<Obj>>,
    init_string: NonNull<Obj>,
    stdout: W,
    start: Instant,
    trace_execution: bool,
}

impl<'h, W: Write> Vm<'h, W> {
    pub fn new(heap: &'h Heap, config: VmConfig, stdout: W) -> Self {
        let init_string = heap.intern(config.initializer_name_str().as_bytes(), &mut |_h| {});
        let mut vm = Vm {
            heap,
            config,
            stack: Vec::with_capacity(1024),
            frames: Vec::with_capacity(64),
            globals: Table::new(),
            open_upvalues: None,
            init_string,
            stdout,
            start: Instant::now(),
            trace_execution: std::env::var("EMBER_TRACE_EXECUTION").is_ok(),
        };
        vm.register_natives();
        vm
    }

    fn register_natives(&mut self) {
        self.define_native("clock", 0, natives::clock());
        self.define_native("sleep", 1, natives::sleep());
        self.define_native("system", 1, natives::system());
        self.define_native("random", 0, natives::random());
        self.define_native("gc", 0, natives::gc());
    }

    /// Registers `function` as a global native, reachable the same way a
    /// real embedder would reach it. Lets a host add its own natives
    /// beyond the built-in catalogue.
    pub fn define_native(&mut self, name: &str, arity: i32, function: ember_core::object::NativeFn) {
        let name_obj = self.intern(name.as_bytes());
        self.push(Value::Obj(name_obj));
        let native_obj = self.alloc(ObjKind::Native(ObjNative {
            name: name.into(),
            arity,
            function,
        }));
        self.push(Value::Obj(native_obj));
        unsafe {
            self.globals.set(name_obj, Value::Obj(native_obj));
        }
        self.pop();
        self.pop();
    }

    /// Wraps `function` in a closure and runs it to completion. The
    /// caller (ordinarily the CLI, after a successful `compile`) maps
    /// `Ok`/`Err` onto `InterpretResult::Ok`/`RuntimeError`.
    pub fn interpret(&mut self, function: NonNull<Obj>) -> Result<(), RuntimeError> {
        self.push(Value::Obj(function));
        let closure = self.alloc(ObjKind::Closure(Closure {
            function,
            upvalues: Vec::new(),
        }));
        self.pop();
        self.push(Value::Obj(closure));
        self.call_value(Value::Obj(closure), 0)?;
        self.run()
    }

    // ---- stack primitives -------------------------------------------------

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
    }

    // ---- allocation (routes every alloc through this VM's roots) ----------

    fn alloc(&self, kind: ObjKind) -> NonNull<Obj> {
        let heap = self.heap;
        heap.alloc(kind, &mut |h| self.mark_roots(h))
    }

    fn intern(&self, bytes: &[u8]) -> NonNull<Obj> {
        let heap = self.heap;
        heap.intern(bytes, &mut |h| self.mark_roots(h))
    }

    fn mark_roots(&self, heap: &Heap) {
        for &value in &self.stack {
            heap.mark_value(value);
        }
        for frame in &self.frames {
            heap.mark_object(frame.closure);
        }
        let mut upvalue = self.open_upvalues;
        while let Some(up) = upvalue {
            heap.mark_object(up);
            upvalue = unsafe { up.as_ref().as_upvalue().next_open.get() };
        }
        heap.mark_table(&self.globals);
        heap.mark_object(self.init_string);
    }

    // ---- call frame access --------------------------------------------------

    fn current_frame(&self) -> &CallFrame {
        self.frames.last().expect("run() always has an active frame")
    }

    fn current_frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("run() always has an active frame")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.current_frame_mut();
        let chunk = unsafe { closure_chunk(frame.closure) };
        let byte = chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        ((hi as u16) << 8) | lo as u16
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_byte();
        let frame = self.current_frame();
        let chunk = unsafe { closure_chunk(frame.closure) };
        chunk.constants[idx as usize]
    }

    fn read_string(&mut self) -> NonNull<Obj> {
        self.read_constant().as_obj().expect("string-constant operand")
    }

    // ---- call dispatch -------------------------------------------------------

    fn call(&mut self, closure: NonNull<Obj>, argc: u8) -> Result<(), RuntimeError> {
        let arity = unsafe { closure.as_ref().as_closure().function.as_ref().as_function().arity };
        if argc != arity {
            return Err(self.runtime_error(format!("Expected {arity} arguments but got {argc}.")));
        }
        if self.frames.len() >= self.config.frames_max() {
            return Err(self.runtime_error("Stack overflow."));
        }
        let slots_base = self.stack.len() - argc as usize - 1;
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slots_base,
        });
        Ok(())
    }

    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), RuntimeError> {
        if let Some(obj) = callee.as_obj() {
            let is_closure = matches!(unsafe { &obj.as_ref().kind }, ObjKind::Closure(_));
            if is_closure {
                return self.call(obj, argc);
            }
            let is_native = matches!(unsafe { &obj.as_ref().kind }, ObjKind::Native(_));
            if is_native {
                return self.call_native(obj, argc);
            }
            let is_class = matches!(unsafe { &obj.as_ref().kind }, ObjKind::Class(_));
            if is_class {
                return self.call_class(obj, argc);
            }
            let is_bound = matches!(unsafe { &obj.as_ref().kind }, ObjKind::BoundMethod(_));
            if is_bound {
                let bound = unsafe { obj.as_ref().as_bound_method() };
                let receiver = bound.receiver;
                let method = bound.method;
                let slot = self.stack.len() - argc as usize - 1;
                self.stack[slot] = receiver;
                return self.call(method, argc);
            }
        }
        Err(self.runtime_error("Can only call functions and classes."))
    }

    fn call_native(&mut self, obj: NonNull<Obj>, argc: u8) -> Result<(), RuntimeError> {
        let native = unsafe { obj.as_ref().as_native() };
        if native.arity >= 0 && native.arity as u8 != argc {
            return Err(self.runtime_error(format!("Expected {} arguments but got {argc}.", native.arity)));
        }
        let args_start = self.stack.len() - argc as usize;
        let args: Vec<Value> = self.stack[args_start..].to_vec();
        let function = native.function.clone();
        let result = function(self, &args).map_err(NativeError::from);
        let value = match result {
            Ok(v) => v,
            Err(e) => return Err(self.runtime_error(e.to_string())),
        };
        self.stack.truncate(args_start - 1);
        self.push(value);
        Ok(())
    }

    fn call_class(&mut self, class: NonNull<Obj>, argc: u8) -> Result<(), RuntimeError> {
        let instance = self.alloc(ObjKind::Instance(Instance {
            class,
            fields: RefCell::new(Table::new()),
        }));
        let slot = self.stack.len() - argc as usize - 1;
        self.stack[slot] = Value::Obj(instance);
        let initializer = unsafe { class.as_ref().as_class().methods.borrow().get(self.init_string) };
        match initializer {
            Some(init) => self.call(init.as_obj().expect("initializer is a closure"), argc),
            None if argc != 0 => Err(self.runtime_error(format!("Expected 0 arguments but got {argc}."))),
            None => Ok(()),
        }
    }

    fn invoke_from_class(&mut self, class: NonNull<Obj>, name: NonNull<Obj>, argc: u8) -> Result<(), RuntimeError> {
        let method = unsafe { class.as_ref().as_class().methods.borrow().get(name) };
        match method {
            Some(m) => self.call(m.as_obj().expect("method is a closure"), argc),
            None => Err(self.runtime_error(format!("Undefined property '{}'.", str_of(name)))),
        }
    }

    fn invoke(&mut self, name: NonNull<Obj>, argc: u8) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc as usize);
        let Some(obj) = receiver.as_obj() else {
            return Err(self.runtime_error("Only instances have methods."));
        };
        let is_instance = matches!(unsafe { &obj.as_ref().kind }, ObjKind::Instance(_));
        if !is_instance {
            return Err(self.runtime_error("Only instances have methods."));
        }
        let instance = unsafe { obj.as_ref().as_instance() };
        let field = unsafe { instance.fields.borrow().get(name) };
        if let Some(value) = field {
            let slot = self.stack.len() - argc as usize - 1;
            self.stack[slot] = value;
            return self.call_value(value, argc);
        }
        let class = instance.class;
        self.invoke_from_class(class, name, argc)
    }

    fn bind_method(&mut self, class: NonNull<Obj>, name: NonNull<Obj>) -> Result<(), RuntimeError> {
        let method = unsafe { class.as_ref().as_class().methods.borrow().get(name) };
        let Some(method) = method else {
            return Err(self.runtime_error(format!("Undefined property '{}'.", str_of(name))));
        };
        let receiver = self.peek(0);
        let bound = self.alloc(ObjKind::BoundMethod(BoundMethod {
            receiver,
            method: method.as_obj().expect("method is a closure"),
        }));
        self.pop();
        self.push(Value::Obj(bound));
        Ok(())
    }

    // ---- upvalues ---------------------------------------------------------

    fn capture_upvalue(&mut self, slot_index: usize) -> NonNull<Obj> {
        let mut prev: Option<NonNull<Obj>> = None;
        let mut current = self.open_upvalues;
        while let Some(up) = current {
            let idx = match unsafe { up.as_ref().as_upvalue().state.get() } {
                UpvalueState::Open(i) => i,
                UpvalueState::Closed(_) => unreachable!("open list holds only Open upvalues"),
            };
            if idx <= slot_index {
                break;
            }
            prev = current;
            current = unsafe { up.as_ref().as_upvalue().next_open.get() };
        }
        if let Some(up) = current {
            let idx = match unsafe { up.as_ref().as_upvalue().state.get() } {
                UpvalueState::Open(i) => i,
                UpvalueState::Closed(_) => unreachable!(),
            };
            if idx == slot_index {
                return up;
            }
        }
        let created = self.alloc(ObjKind::Upvalue(Upvalue {
            state: std::cell::Cell::new(UpvalueState::Open(slot_index)),
            next_open: std::cell::Cell::new(current),
        }));
        match prev {
            Some(p) => unsafe { p.as_ref().as_upvalue().next_open.set(Some(created)) },
            None => self.open_upvalues = Some(created),
        }
        created
    }

    fn read_upvalue_value(&self, slot: usize) -> Value {
        let up = unsafe { self.current_frame().closure.as_ref().as_closure().upvalues[slot] };
        match unsafe { up.as_ref().as_upvalue().state.get() } {
            UpvalueState::Open(stack_index) => self.stack[stack_index],
            UpvalueState::Closed(v) => v,
        }
    }

    fn write_upvalue_value(&mut self, slot: usize, value: Value) {
        let up = unsafe { self.current_frame().closure.as_ref().as_closure().upvalues[slot] };
        match unsafe { up.as_ref().as_upvalue().state.get() } {
            UpvalueState::Open(stack_index) => self.stack[stack_index] = value,
            UpvalueState::Closed(_) => unsafe { up.as_ref().as_upvalue().state.set(UpvalueState::Closed(value)) },
        }
    }

    /// Closes every open upvalue whose stack slot is `>= threshold`,
    /// hoisting its value off the stack and redirecting it into the
    /// upvalue's own storage.
    fn close_upvalues(&mut self, threshold: usize) {
        while let Some(up) = self.open_upvalues {
            let upvalue = unsafe { up.as_ref().as_upvalue() };
            let idx = match upvalue.state.get() {
                UpvalueState::Open(i) => i,
                UpvalueState::Closed(_) => break,
            };
            if idx < threshold {
                break;
            }
            let value = self.stack[idx];
            upvalue.state.set(UpvalueState::Closed(value));
            self.open_upvalues = upvalue.next_open.get();
            upvalue.next_open.set(None);
        }
    }

    // ---- errors -------------------------------------------------------------

    fn runtime_error(&mut self, message: impl Into<String>) -> RuntimeError {
        let message = message.into();
        let mut trace = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let chunk = unsafe { closure_chunk(frame.closure) };
            let instruction = frame.ip.saturating_sub(1);
            let line = chunk.lines.get(instruction).copied().unwrap_or(0);
            let name = unsafe {
                let function = frame.closure.as_ref().as_closure().function.as_ref().as_function();
                match function.name {
                    Some(n) => format!("{}()", str_of(n)),
                    None => "<script>".to_string(),
                }
            };
            trace.push(format!("[line {line}] at {name}"));
        }
        self.reset_stack();
        RuntimeError { message, trace }
    }

    // ---- value formatting ---------------------------------------------------

    fn format_value(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(n),
            Value::Obj(o) => self.format_object(o),
        }
    }

    fn format_object(&self, obj: NonNull<Obj>) -> String {
        unsafe {
            match &obj.as_ref().kind {
                ObjKind::String(s) => s.chars.to_string(),
                ObjKind::Function(f) => format_function_name(f.name),
                ObjKind::Native(_) => "<native fn>".to_string(),
                ObjKind::Closure(c) => format_function_name(c.function.as_ref().as_function().name),
                ObjKind::Upvalue(_) => "<upvalue>".to_string(),
                ObjKind::Class(c) => format!("<class {}>", str_of(c.name)),
                ObjKind::Instance(i) => format!("<instance {}>", str_of(i.class.as_ref().as_class().name)),
                ObjKind::BoundMethod(b) => {
                    format_function_name(b.method.as_ref().as_closure().function.as_ref().as_function().name)
                }
            }
        }
    }

    // ---- the dispatch loop ----------------------------------------------------

    pub fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if self.trace_execution {
                self.trace_current_instruction();
            }
            let byte = self.read_byte();
            let op = OpCode::try_from(byte).expect("chunk contains only valid opcodes");
            match op {
                OpCode::Constant => {
                    let v = self.read_constant();
                    self.push(v);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.current_frame().slots_base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.current_frame().slots_base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    match unsafe { self.globals.get(name) } {
                        Some(v) => self.push(v),
                        None => return Err(self.runtime_error(format!("Undefined variable '{}'.", str_of(name)))),
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    unsafe {
                        self.globals.set(name, value);
                    }
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    let is_new = unsafe { self.globals.set(name, value) };
                    if is_new {
                        unsafe {
                            self.globals.delete(name);
                        }
                        return Err(self.runtime_error(format!("Undefined variable '{}'.", str_of(name))));
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let value = self.read_upvalue_value(slot);
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let value = self.peek(0);
                    self.write_upvalue_value(slot, value);
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(Value::values_equal(a, b)));
                }
                OpCode::Greater => self.binary_compare(|a, b| a > b)?,
                OpCode::Less => self.binary_compare(|a, b| a < b)?,
                OpCode::Add => self.add()?,
                OpCode::Subtract => self.binary_numeric(|a, b| a - b)?,
                OpCode::Multiply => self.binary_numeric(|a, b| a * b)?,
                OpCode::Divide => self.binary_numeric(|a, b| a / b)?,
                OpCode::Modulo => self.binary_numeric(|a, b| a % b)?,
                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(v.is_falsey()));
                }
                OpCode::Negate => match self.peek(0).as_number() {
                    Some(n) => {
                        self.pop();
                        self.push(Value::Number(-n));
                    }
                    None => return Err(self.runtime_error("Operand must be a number.")),
                },
                OpCode::Print => {
                    let v = self.pop();
                    let rendered = self.format_value(v);
                    let _ = writeln!(self.stdout, "{rendered}");
                    let _ = self.stdout.flush();
                }
                OpCode::Jump => {
                    let offset = self.read_u16();
                    self.current_frame_mut().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if self.peek(0).is_falsey() {
                        self.current_frame_mut().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    self.current_frame_mut().ip -= offset as usize;
                }
                OpCode::Call => {
                    let argc = self.read_byte();
                    let callee = self.peek(argc as usize);
                    self.call_value(callee, argc)?;
                }
                OpCode::Closure => {
                    let function_value = self.read_constant();
                    let function_obj = function_value.as_obj().expect("closure constant is a function");
                    let upvalue_count = unsafe { function_obj.as_ref().as_function().upvalue_count };
                    let mut upvalues = Vec::with_capacity(upvalue_count as usize);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte();
                        let index = self.read_byte();
                        if is_local != 0 {
                            let base = self.current_frame().slots_base;
                            upvalues.push(self.capture_upvalue(base + index as usize));
                        } else {
                            let up = unsafe { self.current_frame().closure.as_ref().as_closure().upvalues[index as usize] };
                            upvalues.push(up);
                        }
                    }
                    let closure = self.alloc(ObjKind::Closure(Closure {
                        function: function_obj,
                        upvalues,
                    }));
                    self.push(Value::Obj(closure));
                }
                OpCode::Return => {
                    let result = self.pop();
                    let base = self.current_frame().slots_base;
                    self.close_upvalues(base);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(base);
                    self.push(result);
                }
                OpCode::Class => {
                    let name = self.read_string();
                    let class = self.alloc(ObjKind::Class(Class {
                        name,
                        methods: RefCell::new(Table::new()),
                    }));
                    self.push(Value::Obj(class));
                }
                OpCode::Method => {
                    let name = self.read_string();
                    let method = self.peek(0);
                    let class_obj = self.peek(1).as_obj().expect("class beneath method on stack");
                    unsafe {
                        class_obj.as_ref().as_class().methods.borrow_mut().set(name, method);
                    }
                    self.pop();
                }
                OpCode::Inherit => {
                    let super_obj = match self.peek(1).as_obj() {
                        Some(o) if matches!(unsafe { &o.as_ref().kind }, ObjKind::Class(_)) => o,
                        _ => return Err(self.runtime_error("Superclass must be a class.")),
                    };
                    let sub_obj = self.peek(0).as_obj().expect("subclass on stack");
                    unsafe {
                        let entries: Vec<_> = super_obj.as_ref().as_class().methods.borrow().iter().collect();
                        let mut sub_methods = sub_obj.as_ref().as_class().methods.borrow_mut();
                        for (k, v) in entries {
                            sub_methods.set(k, v);
                        }
                    }
                    self.pop();
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let argc = self.read_byte();
                    self.invoke(name, argc)?;
                }
                OpCode::GetProperty => {
                    let obj = match self.peek(0).as_obj() {
                        Some(o) if matches!(unsafe { &o.as_ref().kind }, ObjKind::Instance(_)) => o,
                        _ => return Err(self.runtime_error("Only instances have properties.")),
                    };
                    let name = self.read_string();
                    let field = unsafe { obj.as_ref().as_instance().fields.borrow().get(name) };
                    match field {
                        Some(value) => {
                            self.pop();
                            self.push(value);
                        }
                        None => {
                            let class = unsafe { obj.as_ref().as_instance().class };
                            self.bind_method(class, name)?;
                        }
                    }
                }
                OpCode::SetProperty => {
                    let obj = match self.peek(1).as_obj() {
                        Some(o) if matches!(unsafe { &o.as_ref().kind }, ObjKind::Instance(_)) => o,
                        _ => return Err(self.runtime_error("Only instances have fields.")),
                    };
                    let name = self.read_string();
                    let value = self.peek(0);
                    unsafe {
                        obj.as_ref().as_instance().fields.borrow_mut().set(name, value);
                    }
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass = self.pop().as_obj().expect("superclass on stack");
                    self.bind_method(superclass, name)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let argc = self.read_byte();
                    let superclass = self.pop().as_obj().expect("superclass on stack");
                    self.invoke_from_class(superclass, name, argc)?;
                }
                OpCode::Typeof => {
                    let v = self.pop();
                    let t = unsafe { v.typeof_str() };
                    let interned = self.intern(t.as_bytes());
                    self.push(Value::Obj(interned));
                }
                OpCode::BitwiseNot => match self.pop().as_number() {
                    Some(n) => self.push(Value::Number(!(n as i32) as f64)),
                    None => return Err(self.runtime_error("Operand must be a number.")),
                },
                OpCode::BitwiseAnd => self.binary_bitwise_i32(|a, b| a & b)?,
                OpCode::BitwiseOr => self.binary_bitwise_i32(|a, b| a | b)?,
                OpCode::BitwiseXor => self.binary_bitwise_i32(|a, b| a ^ b)?,
                OpCode::LeftShift => self.binary_bitwise_i32(|a, b| a.wrapping_shl(b as u32 & 31))?,
                OpCode::RightShift => self.binary_bitwise_i32(|a, b| a.wrapping_shr(b as u32 & 31))?,
                OpCode::UnsignedLeftShift => self.binary_bitwise_i32(|a, b| a.wrapping_shl(b as u32 & 31))?,
                OpCode::UnsignedRightShift => self.binary_bitwise_u32(|a, b| a.wrapping_shr(b & 31))?,
            }
        }
    }

    fn binary_numeric(&mut self, op: impl Fn(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let (a, b) = self.pop_two_numbers()?;
        self.push(Value::Number(op(a, b)));
        Ok(())
    }

    fn binary_compare(&mut self, op: impl Fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let (a, b) = self.pop_two_numbers()?;
        self.push(Value::Bool(op(a, b)));
        Ok(())
    }

    fn binary_bitwise_i32(&mut self, op: impl Fn(i32, i32) -> i32) -> Result<(), RuntimeError> {
        let (a, b) = self.pop_two_numbers()?;
        self.push(Value::Number(op(a as i32, b as i32) as f64));
        Ok(())
    }

    fn binary_bitwise_u32(&mut self, op: impl Fn(u32, u32) -> u32) -> Result<(), RuntimeError> {
        let (a, b) = self.pop_two_numbers()?;
        self.push(Value::Number(op(a as i32 as u32, b as i32 as u32) as f64));
        Ok(())
    }

    fn pop_two_numbers(&mut self) -> Result<(f64, f64), RuntimeError> {
        match (self.peek(1).as_number(), self.peek(0).as_number()) {
            (Some(a), Some(b)) => {
                self.pop();
                self.pop();
                Ok((a, b))
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    /// Two interned strings concatenate (result interned); otherwise
    /// numeric add; anything else is a type error.
    fn add(&mut self) -> Result<(), RuntimeError> {
        let both_strings = {
            let a = self.peek(1).as_obj();
            let b = self.peek(0).as_obj();
            matches!((a, b), (Some(a), Some(b))
                if unsafe { matches!(&a.as_ref().kind, ObjKind::String(_)) }
                    && unsafe { matches!(&b.as_ref().kind, ObjKind::String(_)) })
        };
        if both_strings {
            return self.concatenate();
        }
        match (self.peek(1).as_number(), self.peek(0).as_number()) {
            (Some(a), Some(b)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(a + b));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be two numbers or two strings.")),
        }
    }

    fn concatenate(&mut self) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        let a_obj = a.as_obj().expect("string operand");
        let b_obj = b.as_obj().expect("string operand");
        let combined = unsafe {
            let mut s = String::with_capacity(
                a_obj.as_ref().as_string().chars.len() + b_obj.as_ref().as_string().chars.len(),
            );
            s.push_str(&a_obj.as_ref().as_string().chars);
            s.push_str(&b_obj.as_ref().as_string().chars);
            s
        };
        // Keep both operands rooted on the stack while interning might allocate.
        self.push(a);
        self.push(b);
        let result = self.intern(combined.as_bytes());
        self.pop();
        self.pop();
        self.push(Value::Obj(result));
        Ok(())
    }

    fn trace_current_instruction(&self) {
        let frame = self.current_frame();
        let chunk = unsafe { closure_chunk(frame.closure) };
        let stack_repr: Vec<String> = self.stack.iter().map(|v| self.format_value(*v)).collect();
        let (rendered, _) = disassemble::disassemble_instruction(chunk, frame.ip);
        tracing::trace!(stack = %format!("[{}]", stack_repr.join(", ")), "{rendered}");
    }
}

impl<'h, W: Write> NativeContext for Vm<'h, W> {
    fn heap(&self) -> &Heap {
        self.heap
    }

    fn request_gc(&mut self) {
        let heap = self.heap;
        heap.force_collect(&mut |h| self.mark_roots(h));
    }

    fn elapsed_seconds(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    fn push(&mut self, value: Value) {
        Vm::push(self, value)
    }

    fn pop(&mut self) -> Value {
        Vm::pop(self)
    }
}

/// Follows a closure to its function's chunk without borrowing `Vm`.
/// Sound because every running frame's closure is a live GC root for the
/// duration it sits on `self.frames`.
///
/// # Safety
/// `closure` must point to a live `Closure` object.
unsafe fn closure_chunk<'a>(closure: NonNull<Obj>) -> &'a Chunk {
    let function = closure.as_ref().as_closure().function;
    &function.as_ref().as_function().chunk
}

/// # Safety
/// `obj` must point to a live `String` object.
unsafe fn str_of(obj: NonNull<Obj>) -> String {
    obj.as_ref().as_string().chars.to_string()
}

fn format_function_name(name: Option<NonNull<Obj>>) -> String {
    match name {
        Some(n) => format!("<fn {}>", unsafe { str_of(n) }),
        None => "<script>".to_string(),
    }
}

fn format_number(n: f64) -> String {
    if n.is_infinite() {
        return if n > 0.0 { "inf".to_string() } else { "-inf".to_string() };
    }
    if n.is_nan() {
        return "NaN".to_string();
    }
    format!("{n}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_compiler::{CompilerConfig, Compiler};

    fn run_source(source: &str) -> (Result<(), RuntimeError>, String) {
        let heap = Heap::new();
        let compiler_config = CompilerConfig::new();
        let function = Compiler::new(source.as_bytes(), &heap, &compiler_config)
            .compile()
            .expect("source compiles");
        let mut output = Vec::new();
        let vm_config = VmConfig::new();
        let mut vm = Vm::new(&heap, vm_config, &mut output);
        let result = vm.interpret(function);
        (result, String::from_utf8(output).unwrap())
    }

    #[test]
    fn arithmetic_precedence() {
        let (result, out) = run_source("print 1 + 2 * 3;");
        assert!(result.is_ok());
        assert_eq!(out, "7\n");
    }

    #[test]
    fn string_concatenation_interns() {
        let (result, out) = run_source(r#"var a = "he"; var b = "llo"; print a + b == "hello";"#);
        assert!(result.is_ok());
        assert_eq!(out, "true\n");
    }

    #[test]
    fn closures_capture_shared_upvalue() {
        let (result, out) = run_source(
            r#"
            fun makeCounter() {
                var i = 0;
                fun c() { i = i + 1; return i; }
                return c;
            }
            var c = makeCounter();
            print c();
            print c();
            print c();
            "#,
        );
        assert!(result.is_ok());
        assert_eq!(out, "1\n2\n3\n");
    }

    #[test]
    fn classes_inherit_and_dispatch_super() {
        let (result, out) = run_source(
            r#"
            class A { greet() { print "A"; } }
            class B extends A { greet() { super.greet(); print "B"; } }
            B().greet();
            "#,
        );
        assert!(result.is_ok());
        assert_eq!(out, "A\nB\n");
    }

    #[test]
    fn constructor_runs_and_sets_fields() {
        let (result, out) = run_source(
            r#"
            class P { constructor(x) { this.x = x; } }
            print P(42).x;
            "#,
        );
        assert!(result.is_ok());
        assert_eq!(out, "42\n");
    }

    #[test]
    fn typeof_classifies_every_kind() {
        let (result, out) = run_source(
            r#"
            class P {}
            print typeof 1;
            print typeof "s";
            print typeof nil;
            print typeof P;
            "#,
        );
        assert!(result.is_ok());
        assert_eq!(out, "number\nstring\nnil\nclass\n");
    }

    #[test]
    fn extended_falsiness_picks_else_branch_for_zero() {
        let (result, out) = run_source(r#"if (0) { print "then"; } else { print "else"; }"#);
        assert!(result.is_ok());
        assert_eq!(out, "else\n");
    }

    #[test]
    fn for_loop_runs_exact_count() {
        let (result, out) = run_source("for (var i = 0; i < 3; i = i + 1) { print i; }");
        assert!(result.is_ok());
        assert_eq!(out, "0\n1\n2\n");
    }

    #[test]
    fn continue_skips_rest_of_body() {
        let (result, out) = run_source(
            r#"
            for (var i = 0; i < 4; i = i + 1) {
                if (i == 2) continue;
                print i;
            }
            "#,
        );
        assert!(result.is_ok());
        assert_eq!(out, "0\n1\n3\n");
    }

    #[test]
    fn undefined_global_is_a_runtime_error() {
        let (result, _) = run_source("print x;");
        let err = result.unwrap_err();
        assert!(err.message.contains("Undefined variable 'x'"));
    }

    #[test]
    fn arity_mismatch_reports_expected_and_got() {
        let (result, _) = run_source("fun f(a, b) { return a + b; } f(1);");
        let err = result.unwrap_err();
        assert!(err.message.contains("Expected 2 arguments but got 1."));
    }

    #[test]
    fn stack_overflow_on_unbounded_recursion() {
        let (result, _) = run_source("fun rec(n) { return rec(n + 1); } rec(0);");
        let err = result.unwrap_err();
        assert_eq!(err.message, "Stack overflow.");
    }

    #[test]
    fn bitwise_and_shift_operators() {
        let (result, out) = run_source("print 6 & 3; print 6 | 1; print 1 << 4; print ~0;");
        assert!(result.is_ok());
        assert_eq!(out, "2\n7\n16\n-1\n");
    }

    #[test]
    fn unsigned_right_shift_reinterprets_negative_operand_as_u32() {
        let (result, out) = run_source("print -1 >>> 0; print -1 >>> 1;");
        assert!(result.is_ok());
        assert_eq!(out, "4294967295\n2147483647\n");
    }

    #[test]
    fn modulo_operator_computes_remainder() {
        let (result, out) = run_source("print 7 % 3; print -7 % 3;");
        assert!(result.is_ok());
        assert_eq!(out, "1\n-1\n");
    }

    #[test]
    fn gc_preserves_reachable_values_across_collection() {
        let (result, out) = run_source(
            r#"
            var a = "kept";
            gc();
            print a;
            "#,
        );
        assert!(result.is_ok());
        assert_eq!(out, "kept\n");
    }
}
