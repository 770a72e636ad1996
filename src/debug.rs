//! A disassembler, for looking at compiled [Chunk]s.
//!
//! Listings are returned as strings, so that callers decide where they go (the log, stdout...).
use std::fmt::Write;

use crate::chunk::{Chunk, OpCode};
use crate::object::Heap;

/// Renders the whole chunk, one instruction per line, under a `== name ==` header.
///
/// ```
/// # use bytelox::compiler::compile;
/// # use bytelox::debug::disassemble_chunk;
/// # use bytelox::object::Heap;
/// let mut heap = Heap::new();
/// let chunk = compile("print \"hi\";", &mut heap).unwrap();
/// assert_eq!(
///     "== code ==\n\
///      0000    1 OP_CONSTANT         0 'hi'\n\
///      0002    | OP_PRINT\n\
///      0003    | OP_RETURN\n",
///     disassemble_chunk(&chunk, &heap, "code")
/// );
/// ```
pub fn disassemble_chunk(chunk: &Chunk, heap: &Heap, name: &str) -> String {
    let mut listing = format!("== {name} ==\n");

    let mut offset = 0;
    while offset < chunk.len() {
        let (line, next) = disassemble_instruction(chunk, heap, offset);
        listing.push_str(&line);
        listing.push('\n');
        offset = next;
    }

    listing
}

/// Renders the instruction at `offset`. Returns the text and the offset of the next instruction.
pub fn disassemble_instruction(chunk: &Chunk, heap: &Heap, offset: usize) -> (String, usize) {
    let mut text = format!("{offset:04} ");

    let line = chunk.line_number_for(offset);
    if offset > 0 && line == chunk.line_number_for(offset - 1) {
        text.push_str("   | ");
    } else {
        match line {
            Some(line_no) => write!(text, "{line_no:4} ").unwrap_or_default(),
            None => text.push_str("   ? "),
        }
    }

    let Some(entry) = chunk.get(offset) else {
        text.push_str("<end of chunk>");
        return (text, offset + 1);
    };
    let Some(instruction) = entry.as_opcode() else {
        write!(text, "Unknown opcode {}", entry.byte()).unwrap_or_default();
        return (text, offset + 1);
    };

    use OpCode::*;
    match instruction {
        Constant | GetGlobal | DefineGlobal | SetGlobal => {
            let index = chunk.get(offset + 1).map(|b| b.as_operand());
            constant_instruction(&mut text, instruction, chunk, heap, index);
        }
        ConstantLong | GetGlobalLong | DefineGlobalLong | SetGlobalLong => {
            let index = chunk.read_u16(offset + 1).map(usize::from);
            constant_instruction(&mut text, instruction, chunk, heap, index);
        }
        GetLocal | SetLocal => {
            let name = mnemonic(instruction);
            let written = match chunk.get(offset + 1) {
                Some(slot) => write!(text, "{name:<16} {:4}", slot.as_operand()),
                None => write!(text, "{name:<16} <missing>"),
            };
            written.unwrap_or_default();
        }
        Jump | JumpIfFalse => jump_instruction(&mut text, instruction, chunk, offset, 1),
        Loop => jump_instruction(&mut text, instruction, chunk, offset, -1),
        _ => text.push_str(mnemonic(instruction)),
    }

    (text, offset + 1 + instruction.operand_width())
}

/// The assembly-style name of an opcode.
pub fn mnemonic(opcode: OpCode) -> &'static str {
    use OpCode::*;
    match opcode {
        Constant => "OP_CONSTANT",
        ConstantLong => "OP_CONSTANT_LONG",
        Nil => "OP_NIL",
        True => "OP_TRUE",
        False => "OP_FALSE",
        Pop => "OP_POP",
        GetLocal => "OP_GET_LOCAL",
        SetLocal => "OP_SET_LOCAL",
        GetGlobal => "OP_GET_GLOBAL",
        GetGlobalLong => "OP_GET_GLOBAL_LONG",
        DefineGlobal => "OP_DEFINE_GLOBAL",
        DefineGlobalLong => "OP_DEFINE_GLOBAL_LONG",
        SetGlobal => "OP_SET_GLOBAL",
        SetGlobalLong => "OP_SET_GLOBAL_LONG",
        Equal => "OP_EQUAL",
        Greater => "OP_GREATER",
        Less => "OP_LESS",
        Add => "OP_ADD",
        Subtract => "OP_SUBTRACT",
        Multiply => "OP_MULTIPLY",
        Divide => "OP_DIVIDE",
        Not => "OP_NOT",
        Negate => "OP_NEGATE",
        Print => "OP_PRINT",
        Jump => "OP_JUMP",
        JumpIfFalse => "OP_JUMP_IF_FALSE",
        Loop => "OP_LOOP",
        Return => "OP_RETURN",
    }
}

fn constant_instruction(
    text: &mut String,
    opcode: OpCode,
    chunk: &Chunk,
    heap: &Heap,
    index: Option<usize>,
) {
    let name = mnemonic(opcode);
    let Some(index) = index else {
        write!(text, "{name:<16} <missing>").unwrap_or_default();
        return;
    };

    let written = match chunk.constants.get(index) {
        Some(value) => write!(text, "{name:<16} {index:4} '{}'", value.display(heap)),
        None => write!(text, "{name:<16} {index:4} <invalid>"),
    };
    written.unwrap_or_default();
}

/// Renders a jump as `from -> to`. `sign` is 1 for forward jumps and -1 for backward ones.
fn jump_instruction(
    text: &mut String,
    opcode: OpCode,
    chunk: &Chunk,
    offset: usize,
    sign: i64,
) {
    let name = mnemonic(opcode);
    match chunk.read_u16(offset + 1) {
        Some(jump) => {
            let target = offset as i64 + 3 + sign * jump as i64;
            write!(text, "{name:<16} {offset:4} -> {target}").unwrap_or_default();
        }
        None => write!(text, "{name:<16} <missing>").unwrap_or_default(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compiler::compile;

    #[test]
    fn listing_shows_jumps_and_locals() {
        let mut heap = Heap::new();
        let chunk = compile("{ var a = true;\nwhile (a) a = false; }", &mut heap).unwrap();
        let listing = disassemble_chunk(&chunk, &heap, "loop");

        assert!(listing.starts_with("== loop ==\n"));
        assert!(listing.contains("OP_GET_LOCAL        0"), "{listing}");
        assert!(listing.contains("OP_JUMP_IF_FALSE    3 -> "), "{listing}");
        assert!(listing.contains("OP_LOOP"), "{listing}");
        // The while loop starts on the second line.
        assert!(listing.contains("0001    2 OP_GET_LOCAL"), "{listing}");
    }

    #[test]
    fn long_constants_are_decoded() {
        let mut heap = Heap::new();
        let source: String = (0..257).map(|i| format!("{i};")).collect();
        let chunk = compile(&source, &mut heap).unwrap();
        let listing = disassemble_chunk(&chunk, &heap, "long");
        assert!(listing.contains("OP_CONSTANT_LONG  256 '256'"), "{listing}");
    }

    #[test]
    fn offsets_advance_past_operands() {
        let mut chunk = Chunk::new();
        chunk.write_opcode(OpCode::GetLocal, 1).with_operand(0);
        chunk.write_opcode(OpCode::Loop, 1).with_u16_operand(3);
        chunk.write_opcode(OpCode::Return, 1);

        let heap = Heap::new();
        assert_eq!(2, disassemble_instruction(&chunk, &heap, 0).1);
        assert_eq!(5, disassemble_instruction(&chunk, &heap, 2).1);
        assert_eq!(6, disassemble_instruction(&chunk, &heap, 5).1);
    }

    #[test]
    fn garbage_does_not_panic() {
        let mut chunk = Chunk::new();
        chunk.write_opcode(OpCode::Constant, 1).with_operand(9);
        chunk.write_opcode(OpCode::Jump, 1);

        let heap = Heap::new();
        let listing = disassemble_chunk(&chunk, &heap, "bad");
        assert!(listing.contains("<invalid>"), "{listing}");
        assert!(listing.contains("<missing>"), "{listing}");
    }
}
