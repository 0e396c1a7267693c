use serde::{Deserialize, Serialize};

use crate::expr::Expression;
use crate::io::ByteOrder;
use crate::model::NamedFieldInfo;

/// Parameters of a user-defined field type site, handed to the custom field
/// type processor at parse time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldTypeInfo {
    pub type_name: String,
    pub byte_order: ByteOrder,
}

/// The immutable product of compilation: instruction bytes plus the side
/// tables the interpreter walks in lock-step with them.
///
/// Safe to share between concurrent parses; every parse keeps its own
/// cursors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledBlock {
    pub(crate) code: Vec<u8>,
    pub(crate) named_fields: Vec<NamedFieldInfo>,
    pub(crate) size_evaluators: Vec<Expression>,
    pub(crate) custom_types: Vec<FieldTypeInfo>,
    pub(crate) has_var_fields: bool,
    pub(crate) has_evaluated_sizes: bool,
}

impl CompiledBlock {
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn named_fields(&self) -> &[NamedFieldInfo] {
        &self.named_fields
    }

    pub fn size_evaluators(&self) -> &[Expression] {
        &self.size_evaluators
    }

    pub fn custom_types(&self) -> &[FieldTypeInfo] {
        &self.custom_types
    }

    pub fn has_var_fields(&self) -> bool {
        self.has_var_fields
    }

    pub fn has_evaluated_sizes(&self) -> bool {
        self.has_evaluated_sizes
    }
}

/// Append `value` as an unsigned LEB128 varint (7 bits per byte, 0x80
/// continuation bit).
pub fn pack_int(out: &mut Vec<u8>, value: u32) {
    let mut v = value;
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

/// Decode an unsigned LEB128 varint at `*pos`, advancing it. Returns `None`
/// on truncated input.
pub fn unpack_int(code: &[u8], pos: &mut usize) -> Option<u32> {
    let mut result: u32 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *code.get(*pos)?;
        *pos += 1;
        result |= ((byte & 0x7F) as u32) << shift;
        if byte & 0x80 == 0 {
            return Some(result);
        }
        shift += 7;
        if shift >= 32 {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn packed(value: u32) -> Vec<u8> {
        let mut out = Vec::new();
        pack_int(&mut out, value);
        out
    }

    #[test]
    fn test_pack_small_values_single_byte() {
        assert_eq!(packed(0), vec![0x00]);
        assert_eq!(packed(1), vec![0x01]);
        assert_eq!(packed(127), vec![0x7F]);
    }

    #[test]
    fn test_pack_multi_byte_values() {
        assert_eq!(packed(128), vec![0x80, 0x01]);
        assert_eq!(packed(300), vec![0xAC, 0x02]);
        assert_eq!(packed(u32::MAX), vec![0xFF, 0xFF, 0xFF, 0xFF, 0x0F]);
    }

    #[test]
    fn test_unpack_advances_position() {
        let mut code = Vec::new();
        pack_int(&mut code, 300);
        pack_int(&mut code, 5);
        let mut pos = 0;
        assert_eq!(unpack_int(&code, &mut pos), Some(300));
        assert_eq!(pos, 2);
        assert_eq!(unpack_int(&code, &mut pos), Some(5));
        assert_eq!(pos, 3);
    }

    #[test]
    fn test_unpack_truncated_input() {
        let mut pos = 0;
        assert_eq!(unpack_int(&[0x80], &mut pos), None);
        let mut pos = 0;
        assert_eq!(unpack_int(&[], &mut pos), None);
    }

    #[quickcheck]
    fn prop_pack_unpack_roundtrip(value: u32) -> bool {
        let mut out = Vec::new();
        pack_int(&mut out, value);
        let mut pos = 0;
        unpack_int(&out, &mut pos) == Some(value) && pos == out.len()
    }

    #[quickcheck]
    fn prop_packed_sequences_decode_in_order(values: Vec<u32>) -> bool {
        let mut out = Vec::new();
        for &v in &values {
            pack_int(&mut out, v);
        }
        let mut pos = 0;
        values.iter().all(|&v| unpack_int(&out, &mut pos) == Some(v)) && pos == out.len()
    }
}
