//! Contains a [Chunk] of bytecode, and the [OpCode]s that make it up.

use crate::value::{Value, ValueArray};

crate::with_try_from_u8! {
    /// A one-byte operation code.
    ///
    /// Multi-byte operands follow the opcode directly in the byte stream and are always
    /// little-endian.
    #[repr(u8)]
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub enum OpCode {
        /// 1-byte constant index. Pushes the constant.
        Constant,
        /// 2-byte constant index. Pushes the constant.
        ConstantLong,
        Nil,
        True,
        False,
        Pop,
        /// 1-byte stack slot.
        GetLocal,
        /// 1-byte stack slot.
        SetLocal,
        /// 1-byte name constant index.
        GetGlobal,
        /// 2-byte name constant index.
        GetGlobalLong,
        /// 1-byte name constant index.
        DefineGlobal,
        /// 2-byte name constant index.
        DefineGlobalLong,
        /// 1-byte name constant index.
        SetGlobal,
        /// 2-byte name constant index.
        SetGlobalLong,
        Equal,
        Greater,
        Less,
        Add,
        Subtract,
        Multiply,
        Divide,
        Not,
        Negate,
        Print,
        /// 2-byte forward offset.
        Jump,
        /// 2-byte forward offset. Does not pop the condition.
        JumpIfFalse,
        /// 2-byte backward offset.
        Loop,
        Return,
    }
}

/// A chunk of code, with metadata.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct Chunk {
    code: Vec<u8>,
    pub constants: ValueArray,
    lines: Vec<LineNumberRun>,
}

/// A valid byte from a chunk. This byte can then be interpreted as required.
#[derive(Clone, Copy)]
pub struct BytecodeEntry<'a> {
    byte: u8,
    provenance: &'a Chunk,
}

/// An [OpCode] that has already been written to the bytestream.
///
/// This opcode can be augmented with an operand.
pub struct WrittenOpcode<'a> {
    line: usize,
    provenance: &'a mut Chunk,
}

/// An entry of run-length encoded line numbers.
/// Every entry signifies that the next `length` bytes have the same line number.
#[derive(Debug, Clone, PartialEq)]
struct LineNumberRun {
    /// The actual line number
    line_number: usize,
    /// How many consecutive bytes came from this line
    length: usize,
}

///////////////////////////////////////// Implementation //////////////////////////////////////////

impl OpCode {
    /// How many operand bytes follow this opcode in the byte stream.
    pub fn operand_width(self) -> usize {
        use OpCode::*;
        match self {
            Constant | GetLocal | SetLocal | GetGlobal | DefineGlobal | SetGlobal => 1,
            ConstantLong | GetGlobalLong | DefineGlobalLong | SetGlobalLong | Jump
            | JumpIfFalse | Loop => 2,
            _ => 0,
        }
    }
}

impl Chunk {
    /// Return a new, empty [Chunk].
    pub fn new() -> Self {
        Chunk::default()
    }

    /// Get an entry from the bytecode stream.
    ///
    /// Returns `Some(entry)` when the offset is in [0, self.len()).
    pub fn get(&self, offset: usize) -> Option<BytecodeEntry> {
        self.code.get(offset).copied().map(|byte| BytecodeEntry {
            byte,
            provenance: self,
        })
    }

    /// Reads a little-endian 16-bit operand starting at the given offset.
    pub fn read_u16(&self, offset: usize) -> Option<u16> {
        let bytes = self.code.get(offset..offset + 2)?;
        Some(decode_u16([bytes[0], bytes[1]]))
    }

    /// The raw instruction stream.
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Append a single [OpCode] to the chunk.
    pub fn write_opcode(&mut self, opcode: OpCode, line: usize) -> WrittenOpcode {
        self.write(opcode as u8, line);

        WrittenOpcode {
            line,
            provenance: self,
        }
    }

    /// Overwrites a previously written 16-bit operand (backpatching).
    ///
    /// # Panics
    ///
    /// Panics if `offset..offset + 2` was never written.
    pub fn patch_u16(&mut self, offset: usize, value: u16) {
        self.code[offset..offset + 2].copy_from_slice(&encode_u16(value));
    }

    /// Adds a constant to the constant pool, and returns its index.
    ///
    /// The chunk does not care how big the index is; it's up to the caller to choose an encoding
    /// that fits it (see [OpCode::Constant] and [OpCode::ConstantLong]).
    pub fn add_constant(&mut self, value: Value) -> usize {
        self.constants.write(value)
    }

    /// Returns the line number for whatever is at the given offset.
    pub fn line_number_for(&self, offset: usize) -> Option<usize> {
        let mut base_offset = 0;
        for run in self.lines.iter() {
            if (base_offset..base_offset + run.length).contains(&offset) {
                return Some(run.line_number);
            }

            base_offset += run.length;
        }

        None
    }

    /// Iterates over the run-length encoded line map as `(line_number, length)` pairs.
    pub fn line_runs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.lines.iter().map(|run| (run.line_number, run.length))
    }

    /// Returns the length of the byte stream.
    #[inline]
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Returns true if nothing has been appended to the byte stream.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Actually writes to the byte stream.
    fn write(&mut self, payload: u8, line_number: usize) {
        self.code.push(payload);

        match self.lines.last_mut() {
            Some(run) if run.line_number == line_number => run.increment(),
            _ => self.lines.push(LineNumberRun::new(line_number)),
        }
    }
}

impl LineNumberRun {
    fn new(line_number: usize) -> Self {
        Self {
            line_number,
            length: 1,
        }
    }

    fn increment(&mut self) {
        self.length += 1;
    }
}

impl<'a> BytecodeEntry<'a> {
    /// Returns the raw byte.
    #[inline(always)]
    pub fn byte(self) -> u8 {
        self.byte
    }

    /// Returns the byte as a one-byte operand (a constant index or a stack slot).
    #[inline(always)]
    pub fn as_operand(self) -> usize {
        self.byte as usize
    }

    /// Returns the byte decoded as an [OpCode].
    /// Returns `None` if the byte is not a valid opcode.
    #[inline]
    pub fn as_opcode(self) -> Option<OpCode> {
        self.byte.try_into().ok()
    }

    /// Yanks out a constant from the constant pool, using this byte as the index.
    #[inline]
    pub fn resolve_constant(self) -> Option<Value> {
        self.provenance.constants.get(self.as_operand())
    }
}

impl<'a> WrittenOpcode<'a> {
    /// Consumes `self` and appends a one-byte operand for the last written instruction.
    #[inline]
    pub fn with_operand(self, operand: u8) {
        self.provenance.write(operand, self.line);
    }

    /// Consumes `self` and appends a two-byte (little-endian) operand for the last written
    /// instruction. Returns the offset of the operand, so that it can be patched later.
    #[inline]
    pub fn with_u16_operand(self, operand: u16) -> usize {
        let offset = self.provenance.len();
        for byte in encode_u16(operand) {
            self.provenance.write(byte, self.line);
        }
        offset
    }
}

/// Encodes a 16-bit operand as it appears in the byte stream.
#[inline(always)]
pub fn encode_u16(value: u16) -> [u8; 2] {
    value.to_le_bytes()
}

/// Decodes a 16-bit operand from the byte stream.
#[inline(always)]
pub fn decode_u16(bytes: [u8; 2]) -> u16 {
    u16::from_le_bytes(bytes)
}
