//! The bytecode virtual machine.

use std::io::{self, Write};
use std::rc::Rc;

use static_assertions::const_assert;
use tracing::trace;

use crate::compiler;
use crate::heap::{Heap, Roots};
use crate::object::{BoundMethod, Closure, Instance, Obj, ObjRef, Upvalue};
use crate::prelude::{Chunk, InterpretationError, OpCode, Value};
use crate::table::Table;

/// Maximum depth of the call-frame stack.
const FRAMES_MAX: usize = 64;

/// Each frame can address 256 slots (one operand byte), bounding the operand
/// stack.
const STACK_MAX: usize = FRAMES_MAX * 256;
const_assert!(STACK_MAX == 16384);

/// A runtime record for one active function call.
struct CallFrame {
    closure: ObjRef,
    /// The closure's function's chunk, shared out of the heap so dispatch
    /// does not re-borrow the arena for every fetch.
    chunk: Rc<Chunk>,
    /// Instruction pointer: index of the *next* byte to execute.
    ip: usize,
    /// Stack slot of the callee; locals index off of it.
    base: usize,
}

/// Maintains state for the Von virtual machine: the heap, the operand and
/// frame stacks, globals, and the open-upvalue list.
///
/// The VM persists across [Vm::interpret] calls, which is what makes the
/// REPL work: globals, interned strings, and live objects survive between
/// lines, while a runtime error only unwinds the stacks.
///
/// Program output (`print`) goes to `out`; diagnostics and error traces go
/// to stderr.
pub struct Vm<Out: Write> {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// Upvalues still pointing into the stack, sorted by slot, descending.
    open_upvalues: Vec<ObjRef>,
    globals: Table,
    /// The interned name initializers are looked up by.
    init_string: ObjRef,
    out: Out,
}

impl Vm<io::Stdout> {
    /// A VM that prints to standard output.
    pub fn new() -> Self {
        Vm::with_output(io::stdout())
    }
}

impl Default for Vm<io::Stdout> {
    fn default() -> Self {
        Vm::new()
    }
}

impl<Out: Write> Vm<Out> {
    /// A VM whose program output goes to the given writer. Tests hand in a
    /// `Vec<u8>` and assert on what the program printed.
    pub fn with_output(out: Out) -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern("init");

        Vm {
            heap,
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            open_upvalues: Vec::new(),
            globals: Table::new(),
            init_string,
            out,
        }
    }

    /// Consume the VM and recover its output writer.
    pub fn into_output(self) -> Out {
        self.out
    }

    /// Compile and execute Von source code.
    pub fn interpret(&mut self, source: &str) -> crate::Result<()> {
        let script = compiler::compile(source, &mut self.heap)?;

        // The script runs as a zero-argument call of a closure over the
        // top-level function, so the dispatch loop has a uniform shape.
        let closure = self.heap.alloc_obj(Obj::Closure(Closure {
            function: script,
            upvalues: Vec::new(),
        }));
        self.push(Value::Obj(closure));
        self.call_closure(closure, 0)?;

        self.run()
    }

    /// The main opcode interpreter loop.
    fn run(&mut self) -> crate::Result<()> {
        use OpCode::*;

        loop {
            if cfg!(feature = "trace_execution") {
                // Prints the current stack:
                print!("        ");
                for &value in self.stack.iter() {
                    print!("[ {} ]", self.heap.show_value(value));
                }
                println!();

                // Print the next instruction:
                let frame = self.frame();
                crate::debug::disassemble_instruction(&self.heap, &frame.chunk, frame.ip);
            }

            let opcode = self
                .read_byte()
                .try_into()
                .expect("fetched an invalid opcode");

            match opcode {
                Constant => {
                    let constant = self.read_constant();
                    self.push(constant);
                }
                Nil => self.push(Value::Nil),
                True => self.push(true.into()),
                False => self.push(false.into()),
                Pop => {
                    self.pop();
                }
                GetLocal => {
                    let slot = self.frame().base + self.read_byte() as usize;
                    self.push(self.stack[slot]);
                }
                SetLocal => {
                    let slot = self.frame().base + self.read_byte() as usize;
                    // Assignment is an expression; its value stays on top.
                    self.stack[slot] = self.peek(0);
                }
                GetGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.str_hash(name);
                    match self.globals.get(name, hash) {
                        Some(value) => self.push(value),
                        None => {
                            let message =
                                format!("Undefined variable '{}'.", self.heap.as_str(name));
                            return self.runtime_error(&message);
                        }
                    }
                }
                DefineGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.str_hash(name);
                    let value = self.peek(0);
                    self.globals.set(name, hash, value);
                    self.pop();
                }
                SetGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.str_hash(name);
                    let value = self.peek(0);
                    if self.globals.set(name, hash, value) {
                        // Assignment never creates a global; undo and complain.
                        self.globals.delete(name, hash);
                        let message = format!("Undefined variable '{}'.", self.heap.as_str(name));
                        return self.runtime_error(&message);
                    }
                }
                GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.heap_closure(self.frame().closure).upvalues[index];
                    let value = match self.heap.get(upvalue) {
                        Obj::Upvalue(Upvalue::Open(slot)) => self.stack[*slot],
                        Obj::Upvalue(Upvalue::Closed(value)) => *value,
                        _ => panic!("closure upvalue slot must hold an upvalue"),
                    };
                    self.push(value);
                }
                SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.heap_closure(self.frame().closure).upvalues[index];
                    let value = self.peek(0);
                    let open_slot = match self.heap.get_mut(upvalue) {
                        Obj::Upvalue(u) => match u {
                            Upvalue::Open(slot) => Some(*slot),
                            Upvalue::Closed(cell) => {
                                *cell = value;
                                None
                            }
                        },
                        _ => panic!("closure upvalue slot must hold an upvalue"),
                    };
                    if let Some(slot) = open_slot {
                        self.stack[slot] = value;
                    }
                }
                GetProperty => {
                    let name = self.read_string();
                    let Some(instance) = self.as_instance(self.peek(0)) else {
                        return self.runtime_error("Only instances have properties.");
                    };

                    let hash = self.heap.str_hash(name);
                    let (class, field) = match self.heap.get(instance) {
                        Obj::Instance(i) => (i.class, i.fields.get(name, hash)),
                        _ => unreachable!(),
                    };

                    if let Some(value) = field {
                        self.pop(); // receiver
                        self.push(value);
                    } else {
                        self.bind_method(class, name, hash)?;
                    }
                }
                SetProperty => {
                    let name = self.read_string();
                    let Some(instance) = self.as_instance(self.peek(1)) else {
                        return self.runtime_error("Only instances have fields.");
                    };

                    let hash = self.heap.str_hash(name);
                    let value = self.peek(0);
                    match self.heap.get_mut(instance) {
                        Obj::Instance(i) => i.fields.set(name, hash, value),
                        _ => unreachable!(),
                    };

                    // Pop the value and the receiver; the value is the
                    // expression's result.
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                Equal => {
                    let rhs = self.pop();
                    let lhs = self.pop();
                    self.push((lhs == rhs).into());
                }
                Greater => self.binary_op(|a, b| a > b)?,
                Less => self.binary_op(|a, b| a < b)?,
                Add => {
                    let lhs = self.peek(1);
                    let rhs = self.peek(0);
                    if let (Value::Number(a), Value::Number(b)) = (lhs, rhs) {
                        self.pop();
                        self.pop();
                        self.push((a + b).into());
                    } else if self.is_string(lhs) && self.is_string(rhs) {
                        self.concatenate();
                    } else {
                        return self
                            .runtime_error("Operands must be two numbers or two strings.");
                    }
                }
                Subtract => self.binary_op(|a, b| a - b)?,
                Multiply => self.binary_op(|a, b| a * b)?,
                // IEEE-754 division: dividing by zero is ±∞ or NaN, never an
                // error.
                Divide => self.binary_op(|a, b| a / b)?,
                Not => {
                    let value = self.pop();
                    self.push(value.is_falsy().into());
                }
                Negate => match self.peek(0) {
                    Value::Number(number) => {
                        self.pop();
                        self.push((-number).into());
                    }
                    _ => return self.runtime_error("Operand must be a number."),
                },
                Print => {
                    let value = self.pop();
                    let text = self.heap.show_value(value);
                    writeln!(self.out, "{text}").expect("failed to write program output");
                }
                Jump => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip += offset;
                }
                JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).is_falsy() {
                        self.frame_mut().ip += offset;
                    }
                }
                Loop => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip -= offset;
                }
                Call => {
                    let arg_count = self.read_byte();
                    let callee = self.peek(arg_count as usize);
                    self.call_value(callee, arg_count)?;
                }
                Closure => {
                    let function = self
                        .read_constant()
                        .as_obj()
                        .expect("OP_CLOSURE operand must be a function");
                    let upvalue_count = self.heap.function(function).upvalue_count;

                    self.collect_garbage_if_needed();
                    let closure = self.heap.alloc_obj(Obj::Closure(crate::object::Closure {
                        function,
                        upvalues: Vec::with_capacity(upvalue_count),
                    }));
                    // Rooted immediately: the captures below may allocate.
                    self.push(Value::Obj(closure));

                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() == 1;
                        let index = self.read_byte() as usize;
                        let captured = if is_local {
                            let slot = self.frame().base + index;
                            self.capture_upvalue(slot)
                        } else {
                            self.heap_closure(self.frame().closure).upvalues[index]
                        };
                        match self.heap.get_mut(closure) {
                            Obj::Closure(c) => c.upvalues.push(captured),
                            _ => unreachable!(),
                        }
                    }
                }
                CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                Return => {
                    let result = self.pop();
                    let base = self.frame().base;
                    self.close_upvalues(base);
                    self.frames.pop();

                    if self.frames.is_empty() {
                        // Pop the script closure itself; execution is done.
                        self.pop();
                        debug_assert!(self.stack.is_empty());
                        return Ok(());
                    }

                    // Replace the callee and arguments with the result.
                    self.stack.truncate(base);
                    self.push(result);
                }
                Class => {
                    let name = self.read_string();
                    self.collect_garbage_if_needed();
                    let class = self.heap.alloc_obj(Obj::Class(crate::object::Class {
                        name,
                        methods: Table::new(),
                    }));
                    self.push(Value::Obj(class));
                }
                Method => {
                    let name = self.read_string();
                    let hash = self.heap.str_hash(name);
                    let method = self.peek(0);
                    let class = self
                        .peek(1)
                        .as_obj()
                        .expect("OP_METHOD must find the class under the closure");
                    match self.heap.get_mut(class) {
                        Obj::Class(c) => c.methods.set(name, hash, method),
                        _ => panic!("OP_METHOD must find the class under the closure"),
                    };
                    self.pop();
                }
            }
        }
    }

    ////////////////////////////////////////// Calling /////////////////////////////////////////////

    /// Dispatch a call on whatever kind of value the callee is.
    fn call_value(&mut self, callee: Value, arg_count: u8) -> crate::Result<()> {
        if let Value::Obj(reference) = callee {
            match self.heap.get(reference) {
                Obj::Closure(_) => return self.call_closure(reference, arg_count),
                Obj::Class(_) => return self.call_class(reference, arg_count),
                Obj::BoundMethod(bound) => {
                    let (receiver, method) = (bound.receiver, bound.method);
                    // The receiver takes the callee's slot, becoming `this`
                    // in slot zero of the new frame.
                    let slot = self.stack.len() - arg_count as usize - 1;
                    self.stack[slot] = receiver;
                    return self.call_closure(method, arg_count);
                }
                _ => {}
            }
        }
        self.runtime_error("Can only call functions and classes.")
    }

    /// Push a frame for a closure call. The callee and its arguments are
    /// already in place on the stack.
    fn call_closure(&mut self, closure: ObjRef, arg_count: u8) -> crate::Result<()> {
        let function_ref = self.heap_closure(closure).function;
        let function = self.heap.function(function_ref);
        let arity = function.arity;
        let chunk = Rc::clone(&function.chunk);

        if arg_count != arity {
            let message = format!("Expected {arity} arguments but got {arg_count}.");
            return self.runtime_error(&message);
        }
        if self.frames.len() == FRAMES_MAX {
            return self.runtime_error("Stack overflow.");
        }

        trace!(frame = self.frames.len(), arg_count, "calling closure");
        let base = self.stack.len() - arg_count as usize - 1;
        self.frames.push(CallFrame {
            closure,
            chunk,
            ip: 0,
            base,
        });
        Ok(())
    }

    /// Calling a class constructs an instance, then runs `init` if the class
    /// has one.
    fn call_class(&mut self, class: ObjRef, arg_count: u8) -> crate::Result<()> {
        self.collect_garbage_if_needed();
        let instance = self.heap.alloc_obj(Obj::Instance(Instance {
            class,
            fields: Table::new(),
        }));

        // The instance replaces the class in the callee slot; `init` then
        // sees it as `this`, and an init-less call leaves it as the result.
        let slot = self.stack.len() - arg_count as usize - 1;
        self.stack[slot] = Value::Obj(instance);

        let init_hash = self.heap.str_hash(self.init_string);
        let initializer = self
            .heap
            .class(class)
            .methods
            .get(self.init_string, init_hash);

        match initializer {
            Some(Value::Obj(init)) => self.call_closure(init, arg_count),
            Some(_) => panic!("method table must hold closures"),
            None if arg_count != 0 => {
                let message = format!("Expected 0 arguments but got {arg_count}.");
                self.runtime_error(&message)
            }
            None => Ok(()),
        }
    }

    /// Look up `name` on the class and replace the receiver on top of the
    /// stack with a bound method, or report that the property is undefined.
    fn bind_method(&mut self, class: ObjRef, name: ObjRef, hash: u32) -> crate::Result<()> {
        let Some(Value::Obj(method)) = self.heap.class(class).methods.get(name, hash) else {
            let message = format!("Undefined property '{}'.", self.heap.as_str(name));
            return self.runtime_error(&message);
        };

        let receiver = self.peek(0);
        self.collect_garbage_if_needed();
        let bound = self
            .heap
            .alloc_obj(Obj::BoundMethod(BoundMethod { receiver, method }));
        self.pop(); // receiver
        self.push(Value::Obj(bound));
        Ok(())
    }

    ///////////////////////////////////////// Upvalues /////////////////////////////////////////////

    /// Return the upvalue pointing at `slot`, creating it if no closure has
    /// captured that slot yet. At most one open upvalue exists per slot, so
    /// every closure over a variable shares the same cell.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        // The list is sorted by slot, descending; stop at the first entry at
        // or below the target.
        let mut insert_at = self.open_upvalues.len();
        for (i, &upvalue) in self.open_upvalues.iter().enumerate() {
            let open_slot = self.open_slot_of(upvalue);
            if open_slot == slot {
                return upvalue;
            }
            if open_slot < slot {
                insert_at = i;
                break;
            }
        }

        let created = self.heap.alloc_obj(Obj::Upvalue(Upvalue::Open(slot)));
        self.open_upvalues.insert(insert_at, created);
        created
    }

    /// Close every open upvalue pointing at `from` or above: copy the stack
    /// value into the upvalue and drop it from the open list.
    fn close_upvalues(&mut self, from: usize) {
        while let Some(&upvalue) = self.open_upvalues.first() {
            let slot = self.open_slot_of(upvalue);
            if slot < from {
                break;
            }

            let value = self.stack[slot];
            match self.heap.get_mut(upvalue) {
                Obj::Upvalue(u) => *u = Upvalue::Closed(value),
                _ => panic!("open upvalue list must hold upvalues"),
            }
            self.open_upvalues.remove(0);
        }
    }

    fn open_slot_of(&self, upvalue: ObjRef) -> usize {
        match self.heap.get(upvalue) {
            Obj::Upvalue(u) => u
                .open_slot()
                .expect("open upvalue list must hold only open upvalues"),
            _ => panic!("open upvalue list must hold upvalues"),
        }
    }

    ////////////////////////////////////// Heap interplay //////////////////////////////////////////

    /// Run a collection if the heap wants one, with this VM's roots.
    ///
    /// Call sites must ensure every live object is reachable from the stack,
    /// frames, globals, or open upvalues *before* calling this — the
    /// push-then-populate pattern in the closure and instance paths exists
    /// exactly for that.
    fn collect_garbage_if_needed(&mut self) {
        if !self.heap.should_collect() {
            return;
        }

        let closures: Vec<ObjRef> = self.frames.iter().map(|frame| frame.closure).collect();
        let extra = [self.init_string];
        self.heap.collect(&Roots {
            stack: &self.stack,
            closures: &closures,
            open_upvalues: &self.open_upvalues,
            globals: &self.globals,
            extra: &extra,
        });
    }

    /// Pop two interned strings, push their interned concatenation.
    fn concatenate(&mut self) {
        let rhs = self.peek(0).as_obj().expect("checked: string operand");
        let lhs = self.peek(1).as_obj().expect("checked: string operand");
        let combined = format!("{}{}", self.heap.as_str(lhs), self.heap.as_str(rhs));

        // Operands stay on the stack across the collection so they are
        // rooted until the new string exists.
        self.collect_garbage_if_needed();
        let result = self.heap.intern(&combined);
        self.pop();
        self.pop();
        self.push(Value::Obj(result));
    }

    fn is_string(&self, value: Value) -> bool {
        matches!(
            value.as_obj().map(|r| self.heap.get(r)),
            Some(Obj::Str(_))
        )
    }

    fn as_instance(&self, value: Value) -> Option<ObjRef> {
        match value.as_obj() {
            Some(r) if matches!(self.heap.get(r), Obj::Instance(_)) => Some(r),
            _ => None,
        }
    }

    fn heap_closure(&self, reference: ObjRef) -> &Closure {
        match self.heap.get(reference) {
            Obj::Closure(c) => c,
            other => panic!("expected a closure object, found {other:?}"),
        }
    }

    ///////////////////////////////////////// Fetching /////////////////////////////////////////////

    /// Fetches the next bytecode byte **and** increments the instruction pointer.
    #[inline(always)]
    fn read_byte(&mut self) -> u8 {
        let frame = self.frame_mut();
        let byte = frame
            .chunk
            .get(frame.ip)
            .expect("instruction pointer within range")
            .as_byte();
        frame.ip += 1;
        byte
    }

    /// Fetches a two-byte big-endian operand.
    #[inline(always)]
    fn read_u16(&mut self) -> u16 {
        let frame = self.frame_mut();
        let value = frame
            .chunk
            .get_u16(frame.ip)
            .expect("operand bytes within range");
        frame.ip += 2;
        value
    }

    /// Fetches a one-byte constant index and resolves it in the current
    /// chunk's pool.
    #[inline(always)]
    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        self.frame()
            .chunk
            .constant(index)
            .expect("there should be a constant at this index")
    }

    /// Fetches a constant that the compiler guarantees is an interned string
    /// (variable, property, class and method names).
    #[inline(always)]
    fn read_string(&mut self) -> ObjRef {
        self.read_constant()
            .as_obj()
            .expect("name constant must be an interned string")
    }

    #[inline(always)]
    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("call frame stack cannot be empty")
    }

    #[inline(always)]
    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames
            .last_mut()
            .expect("call frame stack cannot be empty")
    }

    //////////////////////////////////////// Error paths ///////////////////////////////////////////

    /// Report a runtime error to stderr with a stack trace, unwind the VM,
    /// and produce the error the embedder sees.
    ///
    /// The heap, globals, and interned strings survive; only the stacks are
    /// reset, so a REPL can keep going.
    fn runtime_error<T>(&mut self, message: &str) -> crate::Result<T> {
        eprintln!("{message}");

        for frame in self.frames.iter().rev() {
            let function_ref = self.heap_closure(frame.closure).function;
            let function = self.heap.function(function_ref);
            // ip points past the instruction that failed.
            let line = frame
                .chunk
                .line_number_for(frame.ip.saturating_sub(1))
                .unwrap_or(0);
            match function.name {
                Some(name) => eprintln!("[line {line}] in {}()", self.heap.as_str(name)),
                None => eprintln!("[line {line}] in script"),
            }
        }

        self.reset_stack();
        Err(InterpretationError::RuntimeError)
    }

    #[inline(always)]
    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    //////////////////////////////////////// Stack basics //////////////////////////////////////////

    /// Pops two operands on the stack to perform a binary operation on numbers.
    fn binary_op<F, T>(&mut self, op: F) -> crate::Result<()>
    where
        F: Fn(f64, f64) -> T,
        T: Into<Value>,
    {
        let lhs = self.peek(1);
        let rhs = self.peek(0);

        use Value::Number;
        match (lhs, rhs) {
            (Number(a), Number(b)) => {
                self.pop();
                self.pop();
                self.push(op(a, b).into());
                Ok(())
            }
            (_, _) => self.runtime_error("Operands must be numbers."),
        }
    }

    /// Pushes a [Value] on to the value stack.
    #[inline(always)]
    fn push(&mut self, value: Value) {
        debug_assert!(self.stack.len() < STACK_MAX, "operand stack overflow");
        self.stack.push(value);
    }

    /// Pops and returns the top [Value] on the value stack.
    ///
    /// # Panics
    ///
    /// Panics when the value stack is empty. Given well-formed Von bytecode, a pop cannot occur
    /// when the value stack is empty; therefore the interpreter panics if it is in this state.
    #[inline(always)]
    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack is empty")
    }

    /// Peeks at the value relative to the top of the stack.
    ///
    /// # Panics
    ///
    ///  * When the stack is empty
    ///  * When the distance goes off the end of the stack
    #[inline(always)]
    fn peek(&self, distance: usize) -> Value {
        *self
            .stack
            .get(self.stack.len() - 1 - distance)
            .expect("peeked escaped bounds of the stack")
    }
}

////////////////////////////////////////////// Tests //////////////////////////////////////////////

#[cfg(test)]
mod test {
    use super::*;

    /// Run a program and capture what it printed.
    fn run(source: &str) -> String {
        let mut vm = Vm::with_output(Vec::new());
        vm.interpret(source).expect("program should run cleanly");
        String::from_utf8(vm.into_output()).expect("output should be UTF-8")
    }

    fn run_expecting_runtime_error(source: &str) {
        let mut vm = Vm::with_output(Vec::new());
        match vm.interpret(source) {
            Err(InterpretationError::RuntimeError) => {}
            other => panic!("expected a runtime error, got {other:?}"),
        }
    }

    #[test]
    fn arithmetic_precedence() {
        assert_eq!("7\n", run("print 1 + 2 * 3;"));
        assert_eq!("9\n", run("print (1 + 2) * 3;"));
        assert_eq!("1\n", run("print -2 + 3;"));
        assert_eq!("2.5\n", run("print 5 / 2;"));
    }

    #[test]
    fn comparison_and_equality() {
        assert_eq!("true\n", run("print 1 < 2;"));
        assert_eq!("false\n", run("print 1 > 2;"));
        assert_eq!("true\n", run("print 2 <= 2;"));
        assert_eq!("true\n", run("print nil == nil;"));
        assert_eq!("false\n", run("print 1 == \"1\";"));
        assert_eq!("true\n", run("print \"a\" == \"a\";"));
        assert_eq!("true\n", run("print !false;"));
    }

    #[test]
    fn division_by_zero_is_ieee() {
        assert_eq!("inf\n", run("print 1 / 0;"));
        assert_eq!("-inf\n", run("print -1 / 0;"));
        assert_eq!("NaN\n", run("print 0 / 0;"));
    }

    #[test]
    fn string_concatenation() {
        assert_eq!("abc\n", run("print \"a\" + \"bc\";"));
        assert_eq!("aaa\n", run("var a = \"a\"; print a + a + a;"));
    }

    #[test]
    fn global_and_local_scoping() {
        assert_eq!("2\n1\n", run("var a = 1; { var a = 2; print a; } print a;"));
        assert_eq!("1\n", run("var a = 1; { var b = a; print b; }"));
    }

    #[test]
    fn control_flow() {
        assert_eq!("y\n", run("if (1 < 2) print \"y\"; else print \"n\";"));
        assert_eq!("n\n", run("if (1 > 2) print \"y\"; else print \"n\";"));
        assert_eq!("0\n1\n2\n", run("var i = 0; while (i < 3) { print i; i = i + 1; }"));
        assert_eq!(
            "0\n1\n2\n",
            run("for (var i = 0; i < 3; i = i + 1) { print i; }")
        );
        // An else-less if must leave the stack balanced on both paths.
        assert_eq!("done\n", run("if (false) print \"no\"; if (true) {} print \"done\";"));
    }

    #[test]
    fn logical_operators_short_circuit() {
        assert_eq!("false\n", run("print false and 1;"));
        assert_eq!("1\n", run("print true and 1;"));
        assert_eq!("true\n", run("print true or 1;"));
        assert_eq!("1\n", run("print false or 1;"));
        // The right-hand side must not evaluate when short-circuited.
        assert_eq!("ok\n", run("fun boom() { print \"boom\"; } false and boom(); print \"ok\";"));
    }

    #[test]
    fn functions_and_returns() {
        assert_eq!("3\n", run("fun add(a, b) { return a + b; } print add(1, 2);"));
        assert_eq!("nil\n", run("fun nothing() {} print nothing();"));
        assert_eq!("<fn add>\n", run("fun add(a, b) {} print add;"));
        assert_eq!(
            "8\n",
            run("fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } print fib(6);")
        );
    }

    #[test]
    fn closures_capture_variables() {
        assert_eq!(
            "42\n",
            run("fun mk(x) { fun f() { return x; } return f; } var c = mk(42); print c();")
        );
    }

    #[test]
    fn closures_share_mutable_state() {
        assert_eq!(
            "1\n2\n3\n",
            run("fun cnt() { var n = 0; fun inc() { n = n + 1; return n; } return inc; } \
                 var c = cnt(); print c(); print c(); print c();")
        );
    }

    #[test]
    fn upvalues_close_when_scope_ends() {
        assert_eq!(
            "1\n",
            run("var f = nil; { var x = 1; fun g() { return x; } f = g; } print f();")
        );
    }

    #[test]
    fn two_closures_share_one_upvalue() {
        assert_eq!(
            "2\n2\n",
            run("fun pair() { var n = 1; fun bump() { n = n + 1; } fun get() { return n; } \
                 bump(); print get(); return get; } var g = pair(); print g();")
        );
    }

    #[test]
    fn classes_fields_and_methods() {
        assert_eq!("7\n", run("class P { } var p = P(); p.x = 7; print p.x;"));
        assert_eq!(
            "3\n",
            run("class P { init(x, y) { this.x = x; this.y = y; } sum() { return this.x + this.y; } } \
                 print P(1, 2).sum();")
        );
        assert_eq!("P\nP instance\n", run("class P { } print P; print P();"));
    }

    #[test]
    fn bound_methods_remember_their_receiver() {
        assert_eq!(
            "hi\n",
            run("class Greeter { init(word) { this.word = word; } greet() { print this.word; } } \
                 var m = Greeter(\"hi\").greet; m();")
        );
    }

    #[test]
    fn initializer_returns_the_instance() {
        assert_eq!(
            "5\n",
            run("class C { init() { this.v = 5; return; } } print C().v;")
        );
    }

    #[test]
    fn runtime_errors() {
        // Type errors.
        run_expecting_runtime_error("1 + \"x\";");
        run_expecting_runtime_error("-\"x\";");
        run_expecting_runtime_error("1 < \"x\";");
        // Name errors.
        run_expecting_runtime_error("print missing;");
        run_expecting_runtime_error("missing = 1;");
        // Call errors.
        run_expecting_runtime_error("var x = 1; x();");
        run_expecting_runtime_error("fun f(a) {} f();");
        run_expecting_runtime_error("class C {} C(1);");
        // Property errors.
        run_expecting_runtime_error("var x = 1; print x.field;");
        run_expecting_runtime_error("class C {} print C().missing;");
        // Unbounded recursion overflows the frame stack.
        run_expecting_runtime_error("fun f() { f(); } f();");
    }

    #[test]
    fn vm_survives_runtime_errors() {
        let mut vm = Vm::with_output(Vec::new());
        vm.interpret("var a = 1;").unwrap();
        assert!(vm.interpret("a + \"x\";").is_err());
        // Globals and the heap persist; the stacks were unwound.
        assert!(vm.stack.is_empty());
        assert!(vm.frames.is_empty());
        vm.interpret("print a;").unwrap();
        assert_eq!("1\n", String::from_utf8(vm.into_output()).unwrap());
    }

    #[test]
    fn stack_is_balanced_after_every_statement() {
        let mut vm = Vm::with_output(Vec::new());
        for statement in [
            "1 + 2;",
            "var g = 3;",
            "{ var a = 1; var b = 2; a + b; }",
            "if (g > 1) { g = g - 1; }",
            "fun f(x) { return x; } f(9);",
        ] {
            vm.interpret(statement).unwrap();
            assert!(
                vm.stack.is_empty(),
                "stack not balanced after: {statement}"
            );
        }
    }

    #[test]
    fn at_most_one_open_upvalue_per_slot() {
        let mut vm = Vm::with_output(Vec::new());
        // Both inner closures capture the same `n`.
        vm.interpret(
            "fun pair() { var n = 1; fun a() { return n; } fun b() { return n; } \
             print a() + b(); } pair();",
        )
        .unwrap();
        // All upvalues were closed on return.
        assert!(vm.open_upvalues.is_empty());
        assert_eq!("2\n", String::from_utf8(vm.into_output()).unwrap());
    }

    #[test]
    fn interpret_reports_compile_errors() {
        let mut vm = Vm::with_output(Vec::new());
        match vm.interpret("print 1") {
            Err(InterpretationError::CompileError) => {}
            other => panic!("expected a compile error, got {other:?}"),
        }
    }
}
