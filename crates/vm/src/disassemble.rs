//! Optional bytecode disassembler, used by the VM's execution tracer
//! (`EMBER_TRACE_EXECUTION=1`) and available standalone for debugging
//! compiled chunks. Mirrors `debug.c`'s per-opcode formatting.

use ember_core::chunk::Chunk;
use ember_core::opcode::OpCode;

/// Disassembles every instruction in `chunk`, one line per instruction,
/// prefixed by a `== name ==` header.
pub fn disassemble_chunk(chunk: &Chunk, name: &str) -> String {
    let mut out = format!("== {name} ==\n");
    let mut offset = 0;
    while offset < chunk.code.len() {
        let (line, next) = disassemble_instruction(chunk, offset);
        out.push_str(&line);
        out.push('\n');
        offset = next;
    }
    out
}

/// Formats the instruction at `offset` and returns `(rendered, next_offset)`.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut out = format!("{offset:04} ");
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        out.push_str("   | ");
    } else {
        out.push_str(&format!("{:4} ", chunk.lines[offset]));
    }

    let byte = chunk.code[offset];
    let op = match OpCode::try_from(byte) {
        Ok(op) => op,
        Err(b) => {
            out.push_str(&format!("Unknown opcode {b}"));
            return (out, offset + 1);
        }
    };

    use OpCode::*;
    match op {
        Constant | GetGlobal | DefineGlobal | SetGlobal | Class | Method | GetProperty
        | SetProperty | GetSuper => {
            let idx = chunk.code[offset + 1];
            out.push_str(&format!("{op:?} constant={idx} value={:?}", chunk.constants[idx as usize]));
            (out, offset + 2)
        }
        GetLocal | SetLocal | GetUpvalue | SetUpvalue | Call => {
            let slot = chunk.code[offset + 1];
            out.push_str(&format!("{op:?} {slot}"));
            (out, offset + 2)
        }
        Jump | JumpIfFalse => {
            let jump = chunk.read_u16(offset + 1);
            out.push_str(&format!("{op:?} {offset} -> {}", offset + 3 + jump as usize));
            (out, offset + 3)
        }
        Loop => {
            let jump = chunk.read_u16(offset + 1);
            out.push_str(&format!("{op:?} {offset} -> {}", offset + 3 - jump as usize));
            (out, offset + 3)
        }
        Invoke | SuperInvoke => {
            let idx = chunk.code[offset + 1];
            let argc = chunk.code[offset + 2];
            out.push_str(&format!(
                "{op:?} constant={idx} value={:?} ({argc} args)",
                chunk.constants[idx as usize]
            ));
            (out, offset + 3)
        }
        Closure => {
            let idx = chunk.code[offset + 1];
            out.push_str(&format!("{op:?} {idx} {:?}", chunk.constants[idx as usize]));
            let mut next = offset + 2;
            let upvalue_count = match chunk.constants[idx as usize].as_obj() {
                Some(obj) => unsafe { obj.as_ref().as_function().upvalue_count },
                None => 0,
            };
            for _ in 0..upvalue_count {
                let is_local = chunk.code[next];
                let index = chunk.code[next + 1];
                out.push_str(&format!(
                    "\n{:04}      |                     {} {index}",
                    next,
                    if is_local != 0 { "local" } else { "upvalue" }
                ));
                next += 2;
            }
            (out, next)
        }
        _ => {
            out.push_str(&format!("{op:?}"));
            (out, offset + 1)
        }
    }
}
