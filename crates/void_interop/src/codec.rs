//! Native value codec
//!
//! Converts between [`Value`]s and the raw cells native code reads and writes.
//! Inline kinds (primitives, enums, flat structs, pointers) are encoded in
//! native byte order at their declared size; booleans take one byte.
//! Strings are written as a pointer to a freshly allocated, null-terminated
//! buffer whose release obligation travels with the returned [`Written`].

use crate::error::{InteropError, Result};
use crate::types::{PrimitiveKind, TypeDef, TypeKind};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::ffi::{c_char, c_void, CStr, CString};
use widestring::{U16CStr, U16CString};

/// Encoding of native string buffers
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StringEncoding {
    /// Null-terminated 8-bit text, treated as UTF-8
    Ansi = 0,
    /// Null-terminated UTF-16
    Utf16 = 1,
}

impl StringEncoding {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(StringEncoding::Ansi),
            1 => Some(StringEncoding::Utf16),
            _ => None,
        }
    }
}

#[derive(Debug)]
enum NativeStringBuf {
    Ansi(CString),
    Utf16(U16CString),
}

/// An owned, null-terminated native string. Dropping it frees the buffer;
/// [`NativeString::into_raw`] hands ownership to native code, which must
/// return it through [`NativeString::from_raw`].
#[derive(Debug)]
pub struct NativeString {
    buf: NativeStringBuf,
}

impl NativeString {
    pub fn new(s: &str, encoding: StringEncoding) -> Result<Self> {
        let buf = match encoding {
            StringEncoding::Ansi => {
                NativeStringBuf::Ansi(CString::new(s).map_err(|_| InteropError::InteriorNul)?)
            }
            StringEncoding::Utf16 => {
                NativeStringBuf::Utf16(U16CString::from_str(s).map_err(|_| InteropError::InteriorNul)?)
            }
        };
        Ok(Self { buf })
    }

    pub fn encoding(&self) -> StringEncoding {
        match self.buf {
            NativeStringBuf::Ansi(_) => StringEncoding::Ansi,
            NativeStringBuf::Utf16(_) => StringEncoding::Utf16,
        }
    }

    pub fn as_ptr(&self) -> *const c_void {
        match &self.buf {
            NativeStringBuf::Ansi(s) => s.as_ptr() as *const c_void,
            NativeStringBuf::Utf16(s) => s.as_ptr() as *const c_void,
        }
    }

    pub fn to_string_lossy(&self) -> String {
        match &self.buf {
            NativeStringBuf::Ansi(s) => s.to_string_lossy().into_owned(),
            NativeStringBuf::Utf16(s) => s.to_string_lossy(),
        }
    }

    /// Release ownership of the buffer to native code
    pub fn into_raw(self) -> *mut c_void {
        match self.buf {
            NativeStringBuf::Ansi(s) => s.into_raw() as *mut c_void,
            NativeStringBuf::Utf16(s) => s.into_raw() as *mut c_void,
        }
    }

    /// Take back a buffer produced by [`NativeString::into_raw`].
    ///
    /// # Safety
    /// `ptr` must be null or come from `into_raw` with the same encoding, and
    /// must not be used afterwards.
    pub unsafe fn from_raw(ptr: *mut c_void, encoding: StringEncoding) -> Option<Self> {
        if ptr.is_null() {
            return None;
        }
        let buf = match encoding {
            StringEncoding::Ansi => NativeStringBuf::Ansi(CString::from_raw(ptr as *mut c_char)),
            StringEncoding::Utf16 => NativeStringBuf::Utf16(U16CString::from_raw(ptr as *mut u16)),
        };
        Some(Self { buf })
    }
}

/// Copy a native string into managed memory. Null yields `None`.
///
/// # Safety
/// A non-null `ptr` must point to a null-terminated buffer of `encoding`.
pub unsafe fn read_native_str(ptr: *const c_void, encoding: StringEncoding) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(match encoding {
        StringEncoding::Ansi => CStr::from_ptr(ptr as *const c_char).to_string_lossy().into_owned(),
        StringEncoding::Utf16 => U16CStr::from_ptr_str(ptr as *const u16).to_string_lossy(),
    })
}

/// Outcome of writing a value into a native cell
#[must_use = "dropping a string write frees the buffer the cell points to"]
#[derive(Debug)]
pub enum Written {
    /// The cell holds the whole value
    Inline,
    /// The cell holds a pointer to this buffer
    String(NativeString),
}

impl Written {
    /// Leave any allocated buffer to the native side
    pub fn into_native(self) {
        if let Written::String(s) = self {
            let _ = s.into_raw();
        }
    }
}

pub(crate) fn zero_primitive(kind: PrimitiveKind) -> Value {
    match kind {
        PrimitiveKind::Bool => Value::Bool(false),
        PrimitiveKind::Char => Value::Char(0),
        PrimitiveKind::I8 => Value::I8(0),
        PrimitiveKind::U8 => Value::U8(0),
        PrimitiveKind::I16 => Value::I16(0),
        PrimitiveKind::U16 => Value::U16(0),
        PrimitiveKind::I32 => Value::I32(0),
        PrimitiveKind::U32 => Value::U32(0),
        PrimitiveKind::I64 => Value::I64(0),
        PrimitiveKind::U64 => Value::U64(0),
        PrimitiveKind::F32 => Value::F32(0.0),
        PrimitiveKind::F64 => Value::F64(0.0),
        PrimitiveKind::ISize => Value::ISize(0),
        PrimitiveKind::USize => Value::USize(0),
    }
}

fn encode_primitive(value: &Value, kind: PrimitiveKind, declared: &TypeDef, cell: &mut [u8]) -> Result<()> {
    let mismatch = || InteropError::mismatch(value.kind_name(), declared.full_name());
    let out = &mut cell[..kind.size()];
    match (kind, value) {
        (PrimitiveKind::Bool, Value::Bool(b)) => out[0] = *b as u8,
        (PrimitiveKind::Char, Value::Char(c)) => out.copy_from_slice(&c.to_ne_bytes()),
        (PrimitiveKind::I8, Value::I8(v)) => out.copy_from_slice(&v.to_ne_bytes()),
        (PrimitiveKind::U8, Value::U8(v)) => out.copy_from_slice(&v.to_ne_bytes()),
        (PrimitiveKind::I16, Value::I16(v)) => out.copy_from_slice(&v.to_ne_bytes()),
        (PrimitiveKind::U16, Value::U16(v)) => out.copy_from_slice(&v.to_ne_bytes()),
        (PrimitiveKind::I32, Value::I32(v)) => out.copy_from_slice(&v.to_ne_bytes()),
        (PrimitiveKind::U32, Value::U32(v)) => out.copy_from_slice(&v.to_ne_bytes()),
        (PrimitiveKind::I64, Value::I64(v)) => out.copy_from_slice(&v.to_ne_bytes()),
        (PrimitiveKind::U64, Value::U64(v)) => out.copy_from_slice(&v.to_ne_bytes()),
        (PrimitiveKind::F32, Value::F32(v)) => out.copy_from_slice(&v.to_ne_bytes()),
        (PrimitiveKind::F64, Value::F64(v)) => out.copy_from_slice(&v.to_ne_bytes()),
        (PrimitiveKind::ISize, Value::ISize(v)) => out.copy_from_slice(&v.to_ne_bytes()),
        (PrimitiveKind::USize, Value::USize(v)) => out.copy_from_slice(&v.to_ne_bytes()),
        // Enum values may arrive as any integer that fits the underlying type
        (kind, value) if declared.is_enum() && kind.is_integer() => {
            let raw = value.as_i64().ok_or_else(mismatch)?;
            match kind.size() {
                1 => out.copy_from_slice(&(raw as u8).to_ne_bytes()),
                2 => out.copy_from_slice(&(raw as u16).to_ne_bytes()),
                4 => out.copy_from_slice(&(raw as u32).to_ne_bytes()),
                _ => out.copy_from_slice(&(raw as u64).to_ne_bytes()[..kind.size()]),
            }
        }
        _ => return Err(mismatch()),
    }
    Ok(())
}

fn decode_primitive(kind: PrimitiveKind, cell: &[u8]) -> Value {
    macro_rules! read {
        ($ty:ty) => {{
            let mut raw = [0u8; std::mem::size_of::<$ty>()];
            raw.copy_from_slice(&cell[..std::mem::size_of::<$ty>()]);
            <$ty>::from_ne_bytes(raw)
        }};
    }
    match kind {
        PrimitiveKind::Bool => Value::Bool(cell[0] != 0),
        PrimitiveKind::Char => Value::Char(read!(u16)),
        PrimitiveKind::I8 => Value::I8(read!(i8)),
        PrimitiveKind::U8 => Value::U8(read!(u8)),
        PrimitiveKind::I16 => Value::I16(read!(i16)),
        PrimitiveKind::U16 => Value::U16(read!(u16)),
        PrimitiveKind::I32 => Value::I32(read!(i32)),
        PrimitiveKind::U32 => Value::U32(read!(u32)),
        PrimitiveKind::I64 => Value::I64(read!(i64)),
        PrimitiveKind::U64 => Value::U64(read!(u64)),
        PrimitiveKind::F32 => Value::F32(read!(f32)),
        PrimitiveKind::F64 => Value::F64(read!(f64)),
        PrimitiveKind::ISize => Value::ISize(read!(isize)),
        PrimitiveKind::USize => Value::USize(read!(usize)),
    }
}

fn check_cell(ty: &TypeDef, cell_len: usize) -> Result<()> {
    if cell_len < ty.size() {
        return Err(InteropError::SizeMismatch {
            type_name: ty.full_name(),
            expected: ty.size(),
            actual: cell_len,
        });
    }
    Ok(())
}

/// Encode an inline value into `cell`
pub fn encode_inline(value: &Value, ty: &TypeDef, cell: &mut [u8]) -> Result<()> {
    check_cell(ty, cell.len())?;
    match ty.kind() {
        TypeKind::Primitive(kind) | TypeKind::Enum(kind) => encode_primitive(value, *kind, ty, cell),
        TypeKind::Struct { size, .. } => match value {
            Value::Struct(bytes) if bytes.len() == *size => {
                cell[..*size].copy_from_slice(bytes);
                Ok(())
            }
            Value::Struct(bytes) => Err(InteropError::SizeMismatch {
                type_name: ty.full_name(),
                expected: *size,
                actual: bytes.len(),
            }),
            other => Err(InteropError::mismatch(other.kind_name(), ty.full_name())),
        },
        TypeKind::FunctionPointer | TypeKind::Pointer(_) => {
            let address = match value {
                Value::Pointer(p) | Value::USize(p) => *p,
                Value::Null => 0,
                other => return Err(InteropError::mismatch(other.kind_name(), ty.full_name())),
            };
            cell[..std::mem::size_of::<usize>()].copy_from_slice(&address.to_ne_bytes());
            Ok(())
        }
        _ => Err(InteropError::UnsupportedMarshalType(ty.full_name())),
    }
}

/// Decode an inline value from `cell`
pub fn decode_inline(cell: &[u8], ty: &TypeDef) -> Result<Value> {
    check_cell(ty, cell.len())?;
    match ty.kind() {
        TypeKind::Primitive(kind) | TypeKind::Enum(kind) => Ok(decode_primitive(*kind, cell)),
        TypeKind::Struct { size, .. } => Ok(Value::Struct(cell[..*size].to_vec())),
        TypeKind::FunctionPointer | TypeKind::Pointer(_) => match decode_primitive(PrimitiveKind::USize, cell) {
            Value::USize(address) => Ok(Value::Pointer(address)),
            _ => Ok(Value::Pointer(0)),
        },
        _ => Err(InteropError::UnsupportedMarshalType(ty.full_name())),
    }
}

/// Check that a value has the shape a non-inline element type expects
pub(crate) fn check_shape(value: &Value, ty: &TypeDef) -> Result<()> {
    let ok = match ty.kind() {
        TypeKind::String => matches!(value, Value::String(_) | Value::Null),
        TypeKind::Array(_) => matches!(value, Value::Array(_) | Value::Null),
        TypeKind::Object | TypeKind::Class => true,
        TypeKind::Struct { size, .. } => matches!(value, Value::Struct(b) if b.len() == *size),
        TypeKind::Void | TypeKind::Static => false,
        _ => return encode_inline(value, ty, &mut vec![0u8; ty.size()]),
    };
    if ok {
        Ok(())
    } else {
        Err(InteropError::mismatch(value.kind_name(), ty.full_name()))
    }
}

/// Write `value` into the native cell at `dest` as type `ty`.
///
/// # Safety
/// `dest` must be valid for writes of `ty.size()` bytes.
pub unsafe fn write_value(value: &Value, ty: &TypeDef, dest: *mut u8, encoding: StringEncoding) -> Result<Written> {
    if dest.is_null() {
        return Err(InteropError::invalid_argument("dest", "destination cell is null"));
    }
    match ty.kind() {
        TypeKind::String => {
            let (address, written) = match value {
                Value::String(Some(s)) => {
                    let native = NativeString::new(s, encoding)?;
                    (native.as_ptr() as usize, Written::String(native))
                }
                Value::String(None) | Value::Null => (0, Written::Inline),
                other => return Err(InteropError::mismatch(other.kind_name(), ty.full_name())),
            };
            (dest as *mut usize).write_unaligned(address);
            Ok(written)
        }
        TypeKind::Primitive(_)
        | TypeKind::Enum(_)
        | TypeKind::Struct { .. }
        | TypeKind::FunctionPointer
        | TypeKind::Pointer(_) => {
            let cell = std::slice::from_raw_parts_mut(dest, ty.size());
            encode_inline(value, ty, cell)?;
            Ok(Written::Inline)
        }
        _ => Err(InteropError::UnsupportedMarshalType(ty.full_name())),
    }
}

/// Read a value of type `ty` from the native cell at `src`. A null `src`
/// yields the type's default value.
///
/// # Safety
/// A non-null `src` must be valid for reads of `ty.size()` bytes, and string
/// cells must hold null or a valid buffer of `encoding`.
pub unsafe fn read_value(src: *const u8, ty: &TypeDef, encoding: StringEncoding) -> Result<Value> {
    if src.is_null() {
        return Ok(Value::default_for(ty));
    }
    match ty.kind() {
        TypeKind::String => {
            let address = (src as *const usize).read_unaligned();
            Ok(Value::String(read_native_str(address as *const c_void, encoding)))
        }
        TypeKind::Primitive(_)
        | TypeKind::Enum(_)
        | TypeKind::Struct { .. }
        | TypeKind::FunctionPointer
        | TypeKind::Pointer(_) => {
            let cell = std::slice::from_raw_parts(src, ty.size());
            decode_inline(cell, ty)
        }
        _ => Err(InteropError::UnsupportedMarshalType(ty.full_name())),
    }
}
