//! FFI types shared with native code
//!
//! Two directions:
//! - the unit manifest a dynamic library exports so the bridge can build its
//!   types (`void_interop_unit_manifest`)
//! - the flat records the bridge hands back to the host for type, method
//!   and property queries, and the pairs the host passes to upload internal
//!   calls
//!
//! All types use `#[repr(C)]` for ABI compatibility. Type signatures inside
//! the manifest are null-terminated strings in the `TypeRef` text form
//! (`"i32"`, `"Game.Vec3[]"`, `"fnptr"`).

use crate::types::NativeThunk;
use std::ffi::{c_char, c_void};

/// API version for compatibility checking
pub const VOID_INTEROP_API_VERSION: u32 = 1;

/// Symbol every dynamic unit must export
pub const UNIT_MANIFEST_SYMBOL: &str = "void_interop_unit_manifest";

/// Function returning the unit manifest
pub type GetUnitManifestFn = unsafe extern "C" fn() -> *const FfiUnitManifest;

/// Shape of a declared type in a manifest
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiTypeKind {
    Class = 0,
    Static = 1,
    Struct = 2,
    Enum = 3,
}

impl FfiTypeKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(FfiTypeKind::Class),
            1 => Some(FfiTypeKind::Static),
            2 => Some(FfiTypeKind::Struct),
            3 => Some(FfiTypeKind::Enum),
            _ => None,
        }
    }
}

/// Unit manifest
#[repr(C)]
#[derive(Debug)]
pub struct FfiUnitManifest {
    /// Must equal [`VOID_INTEROP_API_VERSION`]
    pub api_version: u32,
    /// Short name; file stem when null
    pub name: *const c_char,
    /// Version string; "0.0.0" when null
    pub version: *const c_char,
    pub type_count: u32,
    pub types: *const FfiTypeInfo,
}

/// One declared type
#[repr(C)]
#[derive(Debug)]
pub struct FfiTypeInfo {
    pub namespace: *const c_char,
    pub name: *const c_char,
    /// [`FfiTypeKind`] as u32
    pub kind: u32,
    /// Struct size in bytes
    pub size: u32,
    /// Non-zero for structs that hold no references
    pub blittable: u8,
    /// Enum underlying primitive signature, e.g. `"i32"`
    pub underlying: *const c_char,
    /// Base type signature; null for `object`
    pub base: *const c_char,
    pub method_count: u32,
    pub methods: *const FfiMethodInfo,
    pub field_count: u32,
    pub fields: *const FfiStaticFieldInfo,
    pub property_count: u32,
    pub properties: *const FfiPropertyInfo,
}

/// One static method
#[repr(C)]
#[derive(Debug)]
pub struct FfiMethodInfo {
    pub name: *const c_char,
    pub return_type: *const c_char,
    pub param_count: u32,
    pub param_types: *const *const c_char,
    /// Thunk called with one pointer per parameter and the result cell
    pub thunk: Option<NativeThunk>,
}

/// One static field backed by a word in the library
#[repr(C)]
#[derive(Debug)]
pub struct FfiStaticFieldInfo {
    pub name: *const c_char,
    pub field_type: *const c_char,
    pub slot: *mut usize,
    pub readonly: u8,
}

/// One property
#[repr(C)]
#[derive(Debug)]
pub struct FfiPropertyInfo {
    pub name: *const c_char,
    pub property_type: *const c_char,
    /// `Accessibility` as u32
    pub accessibility: u32,
}

/// Host-provided `(name, function pointer)` pair for internal-call upload
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InternalCallPair {
    pub name: *const c_void,
    pub function: *const c_void,
}

/// Type descriptor handed to the host. Strings are owned by the array
/// that carries the record.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NativeTypeRecord {
    pub id: i32,
    pub base_type: i32,
    pub element_type: i32,
    pub attributes: u32,
    pub size: u64,
    pub element_size: u64,
    pub is_sz_array: u8,
    pub is_static: u8,
    pub name: *const c_void,
    pub full_name: *const c_void,
    pub assembly_qualified_name: *const c_void,
}

/// Method descriptor handed to the host
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NativeMethodRecord {
    pub id: i32,
    pub parameter_count: i32,
    pub returns_value: u8,
    pub is_static: u8,
    pub name: *const c_void,
    pub display_name: *const c_void,
}

/// Property descriptor handed to the host
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NativePropertyRecord {
    pub id: i32,
    pub owner_type: i32,
    pub property_type: i32,
    pub accessibility: i32,
    pub name: *const c_void,
}

// Safety: records only point into string buffers owned by the same
// `NativeBuffer`, which moves with them.
unsafe impl Send for NativeTypeRecord {}
unsafe impl Send for NativeMethodRecord {}
unsafe impl Send for NativePropertyRecord {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_kind_from_raw() {
        assert_eq!(FfiTypeKind::from_raw(2), Some(FfiTypeKind::Struct));
        assert_eq!(FfiTypeKind::from_raw(9), None);
    }

    #[test]
    fn test_record_layout_is_stable() {
        assert_eq!(std::mem::align_of::<NativeTypeRecord>(), std::mem::align_of::<u64>());
        assert_eq!(
            std::mem::size_of::<NativePropertyRecord>(),
            16 + std::mem::size_of::<usize>()
        );
    }
}
