//! The bytecode virtual machine.

use std::collections::HashMap;
use std::io::{self, Write};

use crate::compiler::{self, U8_COUNT};
use crate::error::{CompileFailure, RuntimeError, RuntimeErrorKind};
use crate::object::{Heap, ObjRef};
use crate::prelude::{Chunk, OpCode, Value};

/// How many values fit on the value stack. Pushing more is a runtime error.
///
/// Every local can be live at once, with room left over for the temporaries of expressions.
pub const STACK_MAX: usize = U8_COUNT * 4;

extern crate static_assertions as sa;

sa::const_assert!(STACK_MAX > U8_COUNT);

/// Maintains state for the virtual machine.
///
/// A VM owns every heap object created while compiling or running programs on it, plus the
/// global variables. Both persist across calls to [VM::interpret], so a REPL can define a
/// variable on one line and use it on the next. Everything is reclaimed when the VM is dropped.
///
/// `print` writes to `W`, which is stdout unless you ask otherwise:
///
/// ```
/// # use bytelox::vm::VM;
/// let mut vm = VM::with_output(Vec::new());
/// vm.interpret("var greeting = \"hello\";").unwrap();
/// vm.interpret("print greeting + \", world\";").unwrap();
/// assert_eq!(b"hello, world\n", vm.output().as_slice());
/// ```
pub struct VM<W = io::Stdout> {
    /// Instruction pointer --- index into the chunk for the next byte to be read
    ip: usize,
    /// Where the instruction being executed started; used to report errors.
    instruction_start: usize,
    /// Value stack -- modified as elements are pushed and popped from the stack.
    stack: Vec<Value>,
    /// Global variables, keyed by their interned name.
    globals: HashMap<ObjRef, Value>,
    /// Every object that was allocated, and the string intern table.
    heap: Heap,
    /// Where `print` goes.
    output: W,
}

/// Fetches the next byte in the chunk, **AND** increments the instruction pointer.
macro_rules! next_bytecode {
    ($self: ident, $chunk: ident) => {{
        let entry = $chunk
            .get($self.ip)
            .ok_or(RuntimeErrorKind::InstructionPointerOutOfBounds)?;
        $self.ip += 1;
        entry
    }};
}

impl VM {
    /// Returns a VM that prints to stdout.
    pub fn new() -> Self {
        VM::default()
    }
}

impl<W: Write> VM<W> {
    /// Returns a VM that prints to the given writer.
    pub fn with_output(output: W) -> Self {
        VM {
            ip: 0,
            instruction_start: 0,
            // Pre-allocate the value stack to its maximum size.
            stack: Vec::with_capacity(STACK_MAX),
            globals: HashMap::new(),
            heap: Heap::new(),
            output,
        }
    }

    /// Compiles and runs the given source code.
    ///
    /// Compile-time diagnostics and runtime errors are written to stderr as well as returned.
    pub fn interpret(&mut self, source: &str) -> crate::Result<()> {
        let chunk = match self.compile(source) {
            Ok(chunk) => chunk,
            Err(failure) => {
                for diagnostic in failure.diagnostics.iter() {
                    eprintln!("{diagnostic}");
                }
                return Err(failure.into());
            }
        };

        self.interpret_chunk(&chunk)
    }

    /// Compiles source code, interning its strings in this VM's heap.
    pub fn compile(&mut self, source: &str) -> Result<Chunk, CompileFailure> {
        compiler::compile(source, &mut self.heap)
    }

    /// Runs an already compiled chunk. Runtime errors are written to stderr as well as returned.
    ///
    /// The chunk must have been compiled by [VM::compile] on this same VM.
    pub fn interpret_chunk(&mut self, chunk: &Chunk) -> crate::Result<()> {
        self.run(chunk).map_err(|error| {
            eprintln!("{error}");
            error.into()
        })
    }

    /// Runs the chunk from the start until it returns or fails.
    ///
    /// After a failure, the value stack is emptied; globals keep whatever values they had.
    pub fn run(&mut self, chunk: &Chunk) -> Result<(), RuntimeError> {
        self.ip = 0;
        self.instruction_start = 0;
        self.stack.clear();

        self.execute(chunk).map_err(|kind| {
            let line = chunk.line_number_for(self.instruction_start).unwrap_or(0);
            log::debug!("runtime error at offset {}: {kind}", self.instruction_start);
            self.stack.clear();
            RuntimeError { kind, line }
        })
    }

    /// Returns the current value of a global variable.
    pub fn global(&self, name: &str) -> Option<Value> {
        let name = self.heap.lookup(name)?;
        self.globals.get(&name).copied()
    }

    /// The heap that owns every object this VM knows about.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Where `print` writes to.
    pub fn output(&self) -> &W {
        &self.output
    }

    /// The main opcode interpreter loop.
    fn execute(&mut self, chunk: &Chunk) -> Result<(), RuntimeErrorKind> {
        use OpCode::*;

        loop {
            if log::log_enabled!(log::Level::Trace) {
                self.trace(chunk);
            }

            self.instruction_start = self.ip;
            let byte = next_bytecode!(self, chunk).byte();
            let opcode = OpCode::try_from(byte).map_err(|_| RuntimeErrorKind::InvalidOpcode(byte))?;

            match opcode {
                Constant => {
                    let index = next_bytecode!(self, chunk).as_operand();
                    let constant = self.read_constant(chunk, index)?;
                    self.push(constant)?;
                }
                ConstantLong => {
                    let index = self.read_u16(chunk)?;
                    let constant = self.read_constant(chunk, index)?;
                    self.push(constant)?;
                }
                Nil => self.push(Value::Nil)?,
                True => self.push(true.into())?,
                False => self.push(false.into())?,
                Pop => {
                    self.pop()?;
                }
                GetLocal => {
                    let slot = next_bytecode!(self, chunk).as_operand();
                    let value = self
                        .stack
                        .get(slot)
                        .copied()
                        .ok_or(RuntimeErrorKind::InvalidLocalSlot(slot))?;
                    self.push(value)?;
                }
                SetLocal => {
                    let slot = next_bytecode!(self, chunk).as_operand();
                    // Assignment is an expression, so the value stays on the stack.
                    let value = self.peek(0)?;
                    let local = self
                        .stack
                        .get_mut(slot)
                        .ok_or(RuntimeErrorKind::InvalidLocalSlot(slot))?;
                    *local = value;
                }
                GetGlobal | GetGlobalLong => {
                    let name = self.read_name(chunk, opcode == GetGlobalLong)?;
                    let value = match self.globals.get(&name) {
                        Some(value) => *value,
                        None => return Err(self.undefined_variable(name)),
                    };
                    self.push(value)?;
                }
                DefineGlobal | DefineGlobalLong => {
                    let name = self.read_name(chunk, opcode == DefineGlobalLong)?;
                    let value = self.peek(0)?;
                    self.globals.insert(name, value);
                    self.pop()?;
                }
                SetGlobal | SetGlobalLong => {
                    let name = self.read_name(chunk, opcode == SetGlobalLong)?;
                    let value = self.peek(0)?;
                    match self.globals.get_mut(&name) {
                        Some(global) => *global = value,
                        None => return Err(self.undefined_variable(name)),
                    }
                }
                Equal => {
                    let rhs = self.pop()?;
                    let lhs = self.pop()?;
                    self.push(lhs.equal(&rhs).into())?;
                }
                Greater => self.binary_op(|a, b| (a > b).into())?,
                Less => self.binary_op(|a, b| (a < b).into())?,
                Add => match (self.peek(1)?, self.peek(0)?) {
                    (Value::Object(a), Value::Object(b)) => {
                        let result = self.concatenate(a, b)?;
                        self.pop()?;
                        self.pop()?;
                        self.push(result)?;
                    }
                    (Value::Number(_), Value::Number(_)) => self.binary_op(|a, b| (a + b).into())?,
                    _ => return Err(RuntimeErrorKind::OperandsMustBeNumbersOrStrings),
                },
                Subtract => self.binary_op(|a, b| (a - b).into())?,
                Multiply => self.binary_op(|a, b| (a * b).into())?,
                Divide => self.binary_op(|a, b| (a / b).into())?,
                Not => {
                    let value = self.pop()?;
                    self.push(value.is_falsy().into())?;
                }
                Negate => {
                    let Value::Number(num) = self.peek(0)? else {
                        return Err(RuntimeErrorKind::OperandMustBeNumber);
                    };
                    self.pop()?;
                    self.push((-num).into())?;
                }
                Print => {
                    let value = self.pop()?;
                    writeln!(self.output, "{}", value.display(&self.heap))
                        .map_err(|error| RuntimeErrorKind::Output(error.to_string()))?;
                }
                Jump => {
                    let offset = self.read_u16(chunk)?;
                    self.ip += offset;
                }
                JumpIfFalse => {
                    let offset = self.read_u16(chunk)?;
                    // The condition stays on the stack; the compiler pops it on both branches.
                    if self.peek(0)?.is_falsy() {
                        self.ip += offset;
                    }
                }
                Loop => {
                    let offset = self.read_u16(chunk)?;
                    self.ip = self
                        .ip
                        .checked_sub(offset)
                        .ok_or(RuntimeErrorKind::InstructionPointerOutOfBounds)?;
                }
                Return => return Ok(()),
            }
        }
    }

    /// Reads a two-byte operand, advancing the instruction pointer past it.
    fn read_u16(&mut self, chunk: &Chunk) -> Result<usize, RuntimeErrorKind> {
        let operand = chunk
            .read_u16(self.ip)
            .ok_or(RuntimeErrorKind::InstructionPointerOutOfBounds)?;
        self.ip += 2;
        Ok(operand as usize)
    }

    /// Yanks out a constant from the constant pool.
    fn read_constant(&self, chunk: &Chunk, index: usize) -> Result<Value, RuntimeErrorKind> {
        chunk
            .constants
            .get(index)
            .ok_or(RuntimeErrorKind::InvalidConstant(index))
    }

    /// Reads the operand of a global variable instruction, and resolves it to the interned name.
    fn read_name(&mut self, chunk: &Chunk, long: bool) -> Result<ObjRef, RuntimeErrorKind> {
        let index = if long {
            self.read_u16(chunk)?
        } else {
            next_bytecode!(self, chunk).as_operand()
        };

        self.read_constant(chunk, index)?
            .as_object()
            .ok_or(RuntimeErrorKind::InvalidConstant(index))
    }

    fn undefined_variable(&self, name: ObjRef) -> RuntimeErrorKind {
        let name = self.heap.as_str(name).unwrap_or("<unknown>");
        RuntimeErrorKind::UndefinedVariable(name.to_owned())
    }

    /// Builds a new string from two existing ones.
    fn concatenate(&mut self, a: ObjRef, b: ObjRef) -> Result<Value, RuntimeErrorKind> {
        let (Some(a), Some(b)) = (self.heap.as_str(a), self.heap.as_str(b)) else {
            return Err(RuntimeErrorKind::OperandsMustBeNumbersOrStrings);
        };

        let mut result = String::with_capacity(a.len() + b.len());
        result.push_str(a);
        result.push_str(b);

        Ok(self.heap.take_string(result).into())
    }

    /// Pops two numeric operands off the stack to perform a binary operation.
    fn binary_op<F>(&mut self, op: F) -> Result<(), RuntimeErrorKind>
    where
        F: Fn(f64, f64) -> Value,
    {
        let (Value::Number(a), Value::Number(b)) = (self.peek(1)?, self.peek(0)?) else {
            return Err(RuntimeErrorKind::OperandsMustBeNumbers);
        };

        self.pop()?;
        self.pop()?;
        self.push(op(a, b))
    }

    /// Pushes a [Value] on to the value stack.
    #[inline(always)]
    fn push(&mut self, value: Value) -> Result<(), RuntimeErrorKind> {
        if self.stack.len() >= STACK_MAX {
            return Err(RuntimeErrorKind::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    /// Pops and returns the top [Value] on the value stack.
    #[inline(always)]
    fn pop(&mut self) -> Result<Value, RuntimeErrorKind> {
        self.stack.pop().ok_or(RuntimeErrorKind::StackUnderflow)
    }

    /// Returns the value `distance` slots down from the top of the stack, without popping it.
    #[inline(always)]
    fn peek(&self, distance: usize) -> Result<Value, RuntimeErrorKind> {
        self.stack
            .len()
            .checked_sub(distance + 1)
            .and_then(|index| self.stack.get(index))
            .copied()
            .ok_or(RuntimeErrorKind::StackUnderflow)
    }

    /// Logs the current stack and the next instruction.
    fn trace(&self, chunk: &Chunk) {
        let stack: String = self
            .stack
            .iter()
            .map(|value| format!("[ {} ]", value.display(&self.heap)))
            .collect();
        let (instruction, _) = crate::debug::disassemble_instruction(chunk, &self.heap, self.ip);

        log::trace!("          {stack}");
        log::trace!("{instruction}");
    }
}

impl Default for VM {
    fn default() -> Self {
        VM::with_output(io::stdout())
    }
}

impl<W> Drop for VM<W> {
    fn drop(&mut self) {
        self.stack.clear();
        self.globals.clear();
        self.heap.free_objects();
    }
}
