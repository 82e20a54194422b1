//! Helpers to print a debug representations.

use crate::chunk::{Chunk, OpCode};
use crate::heap::Heap;

/// Given a chunk, prints its disassembly to `stdout`
pub fn disassemble_chunk(heap: &Heap, c: &Chunk, name: &str) {
    println!("== {name} ==");

    let mut offset = 0;
    while offset < c.len() {
        offset = disassemble_instruction(heap, c, offset);
    }
}

/// Print one instruction from the [Chunk] to `stdout`, taking into account its operands.
pub fn disassemble_instruction(heap: &Heap, c: &Chunk, offset: usize) -> usize {
    print!("{:04} ", offset);

    if offset > 0 && at_same_line_as_previous_offset(c, offset) {
        print!("   | ");
    } else {
        let line_no = c.line_number_for(offset).unwrap();
        print!("{line_no:4} ")
    }

    let instruction = c
        .get(offset)
        .expect("offset too large")
        .as_opcode()
        .expect("Invalid byte for opcode");

    use OpCode::*;
    match instruction {
        Constant => constant_instruction("OP_CONSTANT", heap, c, offset),
        Nil => simple_instruction("OP_NIL", offset),
        True => simple_instruction("OP_TRUE", offset),
        False => simple_instruction("OP_FALSE", offset),
        Pop => simple_instruction("OP_POP", offset),
        GetLocal => byte_instruction("OP_GET_LOCAL", c, offset),
        SetLocal => byte_instruction("OP_SET_LOCAL", c, offset),
        GetGlobal => constant_instruction("OP_GET_GLOBAL", heap, c, offset),
        DefineGlobal => constant_instruction("OP_DEFINE_GLOBAL", heap, c, offset),
        SetGlobal => constant_instruction("OP_SET_GLOBAL", heap, c, offset),
        GetUpvalue => byte_instruction("OP_GET_UPVALUE", c, offset),
        SetUpvalue => byte_instruction("OP_SET_UPVALUE", c, offset),
        GetProperty => constant_instruction("OP_GET_PROPERTY", heap, c, offset),
        SetProperty => constant_instruction("OP_SET_PROPERTY", heap, c, offset),
        Equal => simple_instruction("OP_EQUAL", offset),
        Greater => simple_instruction("OP_GREATER", offset),
        Less => simple_instruction("OP_LESS", offset),
        Add => simple_instruction("OP_ADD", offset),
        Subtract => simple_instruction("OP_SUBTRACT", offset),
        Multiply => simple_instruction("OP_MULTIPLY", offset),
        Divide => simple_instruction("OP_DIVIDE", offset),
        Not => simple_instruction("OP_NOT", offset),
        Negate => simple_instruction("OP_NEGATE", offset),
        Print => simple_instruction("OP_PRINT", offset),
        Jump => jump_instruction("OP_JUMP", 1, c, offset),
        JumpIfFalse => jump_instruction("OP_JUMP_IF_FALSE", 1, c, offset),
        Loop => jump_instruction("OP_LOOP", -1, c, offset),
        Call => byte_instruction("OP_CALL", c, offset),
        Closure => closure_instruction("OP_CLOSURE", heap, c, offset),
        CloseUpvalue => simple_instruction("OP_CLOSE_UPVALUE", offset),
        Return => simple_instruction("OP_RETURN", offset),
        Class => constant_instruction("OP_CLASS", heap, c, offset),
        Method => constant_instruction("OP_METHOD", heap, c, offset),
    }
}

/////////////////////////////////////// Instruction printers ///////////////////////////////////////

fn simple_instruction(name: &str, offset: usize) -> usize {
    println!("{name:>20}");
    offset + 1
}

fn byte_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let slot = chunk
        .get(offset + 1)
        .expect("ran out of bytes")
        .as_slot();
    println!("{name:>20} {slot:4}");

    offset + 2
}

fn jump_instruction(name: &str, sign: isize, chunk: &Chunk, offset: usize) -> usize {
    let distance = chunk.get_u16(offset + 1).expect("ran out of bytes") as isize;
    let target = offset as isize + 3 + sign * distance;
    println!("{name:>20} {offset:4} -> {target}");

    offset + 3
}

fn constant_instruction(name: &str, heap: &Heap, chunk: &Chunk, offset: usize) -> usize {
    let (index, value) = chunk
        .get(offset + 1)
        .expect("ran out of bytes")
        .resolve_constant_with_index()
        .expect("Invalid constant index");

    println!("{name:>20} {index:4} '{}'", heap.show_value(value));

    offset + 2
}

/// [OpCode::Closure] is variable-length: after the function constant come
/// two bytes per upvalue.
fn closure_instruction(name: &str, heap: &Heap, chunk: &Chunk, offset: usize) -> usize {
    let (index, value) = chunk
        .get(offset + 1)
        .expect("ran out of bytes")
        .resolve_constant_with_index()
        .expect("Invalid constant index");
    println!("{name:>20} {index:4} '{}'", heap.show_value(value));

    let function = value
        .as_obj()
        .map(|r| heap.function(r))
        .expect("OP_CLOSURE operand must be a function");

    let mut offset = offset + 2;
    for _ in 0..function.upvalue_count {
        let is_local = chunk.get(offset).expect("ran out of bytes").as_byte();
        let index = chunk.get(offset + 1).expect("ran out of bytes").as_slot();
        let kind = if is_local == 1 { "local" } else { "upvalue" };
        println!("{:04}    |{:>22} {} {}", offset, "", kind, index);
        offset += 2;
    }
    offset
}

//////////////////////////////////////////// Utilities ////////////////////////////////////////////

/// Returns true if the given offset is at the same line number as the previous line number.
fn at_same_line_as_previous_offset(chunk: &Chunk, offset: usize) -> bool {
    assert!(offset > 0);

    chunk
        .line_number_for(offset)
        .zip(chunk.line_number_for(offset - 1))
        .map(|(current_line, previous_line)| current_line == previous_line)
        .unwrap()
}
