//! WebAssembly 1.0 opcode bytes and instruction-length rules.
//!
//! The interpreter resolves block structure lazily by scanning forward over
//! raw bytecode, so it needs to know how long every instruction is without
//! executing it. Lengths fall into a handful of fixed shapes: no immediate,
//! one LEB immediate, two LEB immediates, a LEB-counted branch table, or a
//! raw 4/8-byte float constant.

use crate::leb::{leb_len, ByteReader};

pub const UNREACHABLE: u8 = 0x00;
pub const NOP: u8 = 0x01;
pub const BLOCK: u8 = 0x02;
pub const LOOP: u8 = 0x03;
pub const IF: u8 = 0x04;
pub const ELSE: u8 = 0x05;
pub const END: u8 = 0x0b;
pub const BR: u8 = 0x0c;
pub const BR_IF: u8 = 0x0d;
pub const BR_TABLE: u8 = 0x0e;
pub const RETURN: u8 = 0x0f;
pub const CALL: u8 = 0x10;
pub const CALL_INDIRECT: u8 = 0x11;

pub const DROP: u8 = 0x1a;
pub const SELECT: u8 = 0x1b;
pub const SELECT_T: u8 = 0x1c;

pub const LOCAL_GET: u8 = 0x20;
pub const LOCAL_SET: u8 = 0x21;
pub const LOCAL_TEE: u8 = 0x22;
pub const GLOBAL_GET: u8 = 0x23;
pub const GLOBAL_SET: u8 = 0x24;
pub const TABLE_GET: u8 = 0x25;
pub const TABLE_SET: u8 = 0x26;

pub const I32_LOAD: u8 = 0x28;
pub const I64_LOAD: u8 = 0x29;
pub const F32_LOAD: u8 = 0x2a;
pub const F64_LOAD: u8 = 0x2b;
pub const I32_LOAD8_S: u8 = 0x2c;
pub const I32_LOAD8_U: u8 = 0x2d;
pub const I32_LOAD16_S: u8 = 0x2e;
pub const I32_LOAD16_U: u8 = 0x2f;
pub const I64_LOAD8_S: u8 = 0x30;
pub const I64_LOAD8_U: u8 = 0x31;
pub const I64_LOAD16_S: u8 = 0x32;
pub const I64_LOAD16_U: u8 = 0x33;
pub const I64_LOAD32_S: u8 = 0x34;
pub const I64_LOAD32_U: u8 = 0x35;
pub const I32_STORE: u8 = 0x36;
pub const I64_STORE: u8 = 0x37;
pub const F32_STORE: u8 = 0x38;
pub const F64_STORE: u8 = 0x39;
pub const I32_STORE8: u8 = 0x3a;
pub const I32_STORE16: u8 = 0x3b;
pub const I64_STORE8: u8 = 0x3c;
pub const I64_STORE16: u8 = 0x3d;
pub const I64_STORE32: u8 = 0x3e;
pub const MEMORY_SIZE: u8 = 0x3f;
pub const MEMORY_GROW: u8 = 0x40;

pub const I32_CONST: u8 = 0x41;
pub const I64_CONST: u8 = 0x42;
pub const F32_CONST: u8 = 0x43;
pub const F64_CONST: u8 = 0x44;

pub const I32_EQZ: u8 = 0x45;
pub const I64_EQZ: u8 = 0x50;
pub const F32_EQ: u8 = 0x5b;
pub const F64_EQ: u8 = 0x61;

pub const I32_WRAP_I64: u8 = 0xa7;
pub const I64_EXTEND_I32_S: u8 = 0xac;
pub const I64_EXTEND_I32_U: u8 = 0xad;

pub const I32_EXTEND8_S: u8 = 0xc0;
pub const I32_EXTEND16_S: u8 = 0xc1;
pub const I64_EXTEND8_S: u8 = 0xc2;
pub const I64_EXTEND16_S: u8 = 0xc3;
pub const I64_EXTEND32_S: u8 = 0xc4;

/// Prefix for the saturating-truncation and bulk-memory group.
pub const MISC_PREFIX: u8 = 0xfc;
/// Prefix for the vector (SIMD) instruction set.
pub const VECTOR_PREFIX: u8 = 0xfd;

/// Byte length of the instruction starting at `pos`, immediates included.
pub fn op_len(bytes: &[u8], pos: usize) -> usize {
    let op = match bytes.get(pos) {
        Some(&op) => op,
        None => return 1,
    };
    match op {
        // One LEB immediate: structured blocks, branches, call, variable
        // access, memory size/grow, integer constants.
        BLOCK..=IF
        | BR
        | BR_IF
        | CALL
        | LOCAL_GET..=GLOBAL_SET
        | MEMORY_SIZE
        | MEMORY_GROW
        | I32_CONST
        | I64_CONST => 1 + leb_len(bytes, pos + 1),
        // Branch table: a count, that many labels, then the default label.
        BR_TABLE => {
            let mut r = ByteReader::at(bytes, pos + 1);
            let count = r.read_var_u32();
            for _ in 0..count {
                r.read_var_u(32);
            }
            r.read_var_u(32);
            r.pos - pos
        }
        // Two LEB immediates: call_indirect, and every load/store
        // (alignment hint plus offset).
        CALL_INDIRECT | I32_LOAD..=I64_STORE32 => {
            let mut n = pos + 1;
            n += leb_len(bytes, n);
            n += leb_len(bytes, n);
            n - pos
        }
        F32_CONST => 5,
        F64_CONST => 9,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_and_leb_lengths() {
        assert_eq!(op_len(&[NOP], 0), 1);
        assert_eq!(op_len(&[I32_CONST, 0xe5, 0x8e, 0x26], 0), 4);
        assert_eq!(op_len(&[F32_CONST, 0, 0, 0, 0], 0), 5);
        assert_eq!(op_len(&[F64_CONST, 0, 0, 0, 0, 0, 0, 0, 0], 0), 9);
        // i32.load with alignment 2 and a two-byte offset.
        assert_eq!(op_len(&[I32_LOAD, 0x02, 0x80, 0x01], 0), 4);
    }

    #[test]
    fn branch_table_length_counts_all_labels() {
        // br_table with 2 labels plus default.
        assert_eq!(op_len(&[BR_TABLE, 0x02, 0x00, 0x01, 0x00], 0), 5);
    }
}
