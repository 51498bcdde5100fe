//! Method signature hashing
//!
//! Method handles are derived from a signature hash and then made unique by
//! the handle table. Two schemes are available:
//!
//! - `Ordered` hashes the declaring type, the name, the return type and the
//!   parameter types in order, so overloads that differ only in parameter
//!   order get distinct preferred keys.
//! - `Legacy` reproduces the historical scheme: a djb2 hash of the name
//!   XOR-ed with a small table of primitive type codes. It is order
//!   insensitive and treats every non-primitive type as zero.

use crate::types::{PrimitiveKind, TypeDef, TypeKind};
use serde::{Deserialize, Serialize};

/// How preferred method keys are computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureScheme {
    #[default]
    Ordered,
    Legacy,
}

/// djb2 over UTF-16 code units truncated to a byte
pub fn legacy_string_hash(s: &str) -> i32 {
    let mut hash: i32 = 5381;
    for unit in s.encode_utf16() {
        hash = (unit as u8 as i32).wrapping_add(hash.wrapping_mul(33));
    }
    hash
}

/// Fixed code of a primitive type in the legacy scheme; 0 for everything else
pub fn legacy_type_hash(ty: &TypeDef) -> i32 {
    match ty.kind() {
        TypeKind::Primitive(kind) => match kind {
            PrimitiveKind::I8 => 3,
            PrimitiveKind::U8 => 7,
            PrimitiveKind::I16 => 11,
            PrimitiveKind::U16 => 13,
            PrimitiveKind::I32 => 17,
            PrimitiveKind::U32 => 19,
            PrimitiveKind::I64 => 23,
            PrimitiveKind::U64 => 29,
            PrimitiveKind::Bool => 31,
            PrimitiveKind::F32 => 37,
            PrimitiveKind::F64 => 41,
            PrimitiveKind::Char | PrimitiveKind::ISize | PrimitiveKind::USize => 0,
        },
        TypeKind::String => 47,
        _ => 0,
    }
}

/// Legacy method hash: name hash XOR return code XOR each parameter code
pub fn legacy_method_hash(name: &str, ret: &TypeDef, params: &[&TypeDef]) -> i32 {
    params
        .iter()
        .fold(legacy_string_hash(name) ^ legacy_type_hash(ret), |hash, p| {
            hash ^ legacy_type_hash(p)
        })
}

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

fn fnv1a(hash: u32, bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(hash, |h, b| (h ^ *b as u32).wrapping_mul(FNV_PRIME))
}

/// Order-sensitive hash over type ids
pub fn ordered_method_hash(type_id: i32, name: &str, ret_id: i32, param_ids: &[i32]) -> i32 {
    let mut hash = fnv1a(FNV_OFFSET, &type_id.to_le_bytes());
    hash = fnv1a(hash, name.as_bytes());
    hash = fnv1a(hash, &[0xff]);
    hash = fnv1a(hash, &ret_id.to_le_bytes());
    hash = fnv1a(hash, &(param_ids.len() as u32).to_le_bytes());
    for id in param_ids {
        hash = fnv1a(hash, &id.to_le_bytes());
    }
    hash as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::CoreTypes;

    #[test]
    fn test_legacy_string_hash() {
        assert_eq!(legacy_string_hash(""), 5381);
        // 'a' = 97: 97 + 33 * 5381
        assert_eq!(legacy_string_hash("a"), 97 + 33 * 5381);
    }

    #[test]
    fn test_legacy_table() {
        let core = CoreTypes::new();
        assert_eq!(legacy_type_hash(&core.primitive(PrimitiveKind::I32)), 17);
        assert_eq!(legacy_type_hash(&core.primitive(PrimitiveKind::F64)), 41);
        assert_eq!(legacy_type_hash(&core.string()), 47);
        assert_eq!(legacy_type_hash(&core.object()), 0);
    }

    #[test]
    fn test_legacy_is_order_insensitive() {
        let core = CoreTypes::new();
        let (i, f) = (core.primitive(PrimitiveKind::I32), core.primitive(PrimitiveKind::F32));
        let void = core.void();
        assert_eq!(
            legacy_method_hash("Move", &void, &[&i, &f]),
            legacy_method_hash("Move", &void, &[&f, &i])
        );
    }

    #[test]
    fn test_ordered_distinguishes_parameter_order() {
        let a = ordered_method_hash(10, "Move", 1, &[2, 3]);
        let b = ordered_method_hash(10, "Move", 1, &[3, 2]);
        assert_ne!(a, b);
        assert_eq!(a, ordered_method_hash(10, "Move", 1, &[2, 3]));
        assert_ne!(a, ordered_method_hash(11, "Move", 1, &[2, 3]));
    }
}
