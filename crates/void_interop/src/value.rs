//! Managed values
//!
//! [`Value`] is what managed code sees: method arguments, return values and
//! array elements. Arrays of blittable element types live in one contiguous,
//! word-aligned block that can be pinned and handed to native code in place.

use crate::codec;
use crate::error::{InteropError, Result};
use crate::types::{TypeDef, TypeKind};
use parking_lot::RwLock;
use std::fmt;
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A managed value
#[derive(Debug, Clone)]
pub enum Value {
    Void,
    Null,
    Bool(bool),
    /// UTF-16 code unit
    Char(u16),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    ISize(isize),
    USize(usize),
    /// Raw address; also used for function pointers
    Pointer(usize),
    /// `None` is a null string reference
    String(Option<String>),
    /// Raw bytes of a flat value type
    Struct(Vec<u8>),
    Array(ManagedArray),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(Some(s.into()))
    }

    /// Short name of the variant, used in mismatch errors
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Void => "void",
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Char(_) => "char",
            Value::I8(_) => "i8",
            Value::U8(_) => "u8",
            Value::I16(_) => "i16",
            Value::U16(_) => "u16",
            Value::I32(_) => "i32",
            Value::U32(_) => "u32",
            Value::I64(_) => "i64",
            Value::U64(_) => "u64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::ISize(_) => "isize",
            Value::USize(_) => "usize",
            Value::Pointer(_) => "pointer",
            Value::String(_) => "string",
            Value::Struct(_) => "struct",
            Value::Array(_) => "array",
        }
    }

    /// Default value of a declared type, used when decoding a null cell
    pub fn default_for(ty: &TypeDef) -> Value {
        match ty.kind() {
            TypeKind::Void => Value::Void,
            TypeKind::Primitive(kind) | TypeKind::Enum(kind) => codec::zero_primitive(*kind),
            TypeKind::Struct { size, .. } => Value::Struct(vec![0; *size]),
            TypeKind::String => Value::String(None),
            TypeKind::FunctionPointer | TypeKind::Pointer(_) => Value::Pointer(0),
            TypeKind::Object | TypeKind::Class | TypeKind::Static | TypeKind::Array(_) => Value::Null,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null | Value::String(None))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Any integer variant that fits in an `i64`
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::I8(v) => Some(v as i64),
            Value::U8(v) => Some(v as i64),
            Value::I16(v) => Some(v as i64),
            Value::U16(v) | Value::Char(v) => Some(v as i64),
            Value::I32(v) => Some(v as i64),
            Value::U32(v) => Some(v as i64),
            Value::I64(v) => Some(v),
            Value::U64(v) => i64::try_from(v).ok(),
            Value::ISize(v) => Some(v as i64),
            Value::USize(v) | Value::Pointer(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        self.as_i64().and_then(|v| i32::try_from(v).ok())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::F32(v) => Some(v as f64),
            Value::F64(v) => Some(v),
            _ => self.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(Some(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ManagedArray> {
        match self {
            Value::Array(array) => Some(array),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Void, Value::Void) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Char(a), Value::Char(b)) => a == b,
            (Value::I8(a), Value::I8(b)) => a == b,
            (Value::U8(a), Value::U8(b)) => a == b,
            (Value::I16(a), Value::I16(b)) => a == b,
            (Value::U16(a), Value::U16(b)) => a == b,
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::U32(a), Value::U32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::U64(a), Value::U64(b)) => a == b,
            (Value::F32(a), Value::F32(b)) => a == b,
            (Value::F64(a), Value::F64(b)) => a == b,
            (Value::ISize(a), Value::ISize(b)) => a == b,
            (Value::USize(a), Value::USize(b)) => a == b,
            (Value::Pointer(a), Value::Pointer(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Struct(a), Value::Struct(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a.contents_eq(b),
            _ => false,
        }
    }
}

macro_rules! impl_from_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v)
            }
        })*
    };
}

impl_from_value! {
    bool => Bool,
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f32 => F32,
    f64 => F64,
    isize => ISize,
    usize => USize,
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Some(s))
    }
}

impl From<ManagedArray> for Value {
    fn from(array: ManagedArray) -> Self {
        Value::Array(array)
    }
}

/// Word-aligned heap block. Held as a raw allocation so the address handed
/// to native code is never derived from a shared borrow.
struct Block {
    words: NonNull<u64>,
    word_len: usize,
    byte_len: usize,
}

// Safety: the block uniquely owns its allocation; access goes through the
// storage lock or through a pin, which native code must not share across
// threads without its own synchronisation.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Block {
    fn zeroed(byte_len: usize) -> Self {
        let words = vec![0u64; byte_len.div_ceil(8)].into_boxed_slice();
        let word_len = words.len();
        // Safety: Box::into_raw never returns null, even for empty slices
        let words = unsafe { NonNull::new_unchecked(Box::into_raw(words) as *mut u64) };
        Self {
            words,
            word_len,
            byte_len,
        }
    }

    fn as_ptr(&self) -> *mut u8 {
        self.words.as_ptr() as *mut u8
    }

    fn bytes(&self) -> &[u8] {
        // Safety: byte_len never exceeds word_len * 8
        unsafe { slice::from_raw_parts(self.as_ptr(), self.byte_len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.as_ptr(), self.byte_len) }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        // Safety: reconstructs the box released in `zeroed`
        unsafe {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                self.words.as_ptr(),
                self.word_len,
            )));
        }
    }
}

/// Contiguous, word-aligned element storage that native code may borrow in place
pub struct PinnableStorage {
    block: RwLock<Block>,
    element_size: usize,
    pins: AtomicUsize,
}

impl PinnableStorage {
    fn new(byte_len: usize, element_size: usize) -> Self {
        Self {
            block: RwLock::new(Block::zeroed(byte_len)),
            element_size,
            pins: AtomicUsize::new(0),
        }
    }

    pub fn pin_count(&self) -> usize {
        self.pins.load(Ordering::Acquire)
    }
}

#[derive(Clone)]
enum ArrayStorage {
    Blittable(Arc<PinnableStorage>),
    Elements(Arc<RwLock<Vec<Value>>>),
}

/// Single-dimension managed array with reference semantics: clones share
/// their elements.
#[derive(Clone)]
pub struct ManagedArray {
    element: Arc<TypeDef>,
    storage: ArrayStorage,
}

impl fmt::Debug for ManagedArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedArray")
            .field("element", &self.element.full_name())
            .field("len", &self.len())
            .field("blittable", &self.is_blittable())
            .finish()
    }
}

impl ManagedArray {
    /// Zero-initialised array
    pub fn new(element: Arc<TypeDef>, len: usize) -> Self {
        let storage = if element.is_blittable() {
            let size = element.size();
            ArrayStorage::Blittable(Arc::new(PinnableStorage::new(size * len, size)))
        } else {
            let default = Value::default_for(&element);
            ArrayStorage::Elements(Arc::new(RwLock::new(vec![default; len])))
        };
        Self { element, storage }
    }

    pub fn from_values(element: Arc<TypeDef>, values: Vec<Value>) -> Result<Self> {
        let array = Self::new(element, values.len());
        match &array.storage {
            ArrayStorage::Blittable(_) => {
                for (i, value) in values.iter().enumerate() {
                    array.set(i, value)?;
                }
            }
            ArrayStorage::Elements(elements) => {
                for value in &values {
                    codec::check_shape(value, &array.element)?;
                }
                *elements.write() = values;
            }
        }
        Ok(array)
    }

    /// Array over plain-old-data elements, copied in
    pub fn from_pod<T: bytemuck::Pod>(element: Arc<TypeDef>, items: &[T]) -> Result<Self> {
        if !element.is_blittable() || element.size() != std::mem::size_of::<T>() {
            return Err(InteropError::SizeMismatch {
                type_name: element.full_name(),
                expected: element.size(),
                actual: std::mem::size_of::<T>(),
            });
        }
        let array = Self::new(element, items.len());
        if let ArrayStorage::Blittable(storage) = &array.storage {
            storage.block.write().bytes_mut().copy_from_slice(bytemuck::cast_slice(items));
        }
        Ok(array)
    }

    pub fn element_type(&self) -> &Arc<TypeDef> {
        &self.element
    }

    pub fn len(&self) -> usize {
        match &self.storage {
            ArrayStorage::Blittable(storage) => {
                if storage.element_size == 0 {
                    0
                } else {
                    storage.block.read().byte_len / storage.element_size
                }
            }
            ArrayStorage::Elements(elements) => elements.read().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_blittable(&self) -> bool {
        matches!(self.storage, ArrayStorage::Blittable(_))
    }

    pub fn get(&self, index: usize) -> Result<Value> {
        self.check_index(index)?;
        match &self.storage {
            ArrayStorage::Blittable(storage) => {
                let block = storage.block.read();
                let start = index * storage.element_size;
                codec::decode_inline(&block.bytes()[start..start + storage.element_size], &self.element)
            }
            ArrayStorage::Elements(elements) => Ok(elements.read()[index].clone()),
        }
    }

    pub fn set(&self, index: usize, value: &Value) -> Result<()> {
        self.check_index(index)?;
        match &self.storage {
            ArrayStorage::Blittable(storage) => {
                let mut block = storage.block.write();
                let start = index * storage.element_size;
                codec::encode_inline(
                    value,
                    &self.element,
                    &mut block.bytes_mut()[start..start + storage.element_size],
                )
            }
            ArrayStorage::Elements(elements) => {
                codec::check_shape(value, &self.element)?;
                elements.write()[index] = value.clone();
                Ok(())
            }
        }
    }

    pub fn to_values(&self) -> Result<Vec<Value>> {
        (0..self.len()).map(|i| self.get(i)).collect()
    }

    /// Copy the elements out as plain-old-data
    pub fn to_pod<T: bytemuck::Pod>(&self) -> Option<Vec<T>> {
        let ArrayStorage::Blittable(storage) = &self.storage else {
            return None;
        };
        if storage.element_size != std::mem::size_of::<T>() {
            return None;
        }
        let block = storage.block.read();
        bytemuck::try_cast_slice::<u8, T>(block.bytes()).ok().map(<[T]>::to_vec)
    }

    /// Change the length, zero-filling new elements. Fails while pinned.
    pub fn resize(&self, len: usize) -> Result<()> {
        match &self.storage {
            ArrayStorage::Blittable(storage) => {
                let mut block = storage.block.write();
                let pins = storage.pin_count();
                if pins > 0 {
                    return Err(InteropError::Pinned(pins));
                }
                let mut resized = Block::zeroed(len * storage.element_size);
                let keep = resized.byte_len.min(block.byte_len);
                resized.bytes_mut()[..keep].copy_from_slice(&block.bytes()[..keep]);
                *block = resized;
                Ok(())
            }
            ArrayStorage::Elements(elements) => {
                let default = Value::default_for(&self.element);
                elements.write().resize(len, default);
                Ok(())
            }
        }
    }

    /// Address of the first element, for identity checks
    pub fn storage_ptr(&self) -> *const u8 {
        match &self.storage {
            ArrayStorage::Blittable(storage) => storage.block.read().as_ptr() as *const u8,
            ArrayStorage::Elements(elements) => elements.read().as_ptr() as *const u8,
        }
    }

    /// Borrow the element block for native code. Only blittable arrays pin.
    pub fn pin(&self) -> Option<PinnedView> {
        let ArrayStorage::Blittable(storage) = &self.storage else {
            return None;
        };
        let block = storage.block.read();
        storage.pins.fetch_add(1, Ordering::AcqRel);
        Some(PinnedView {
            storage: Arc::clone(storage),
            ptr: block.as_ptr(),
            byte_len: block.byte_len,
        })
    }

    pub fn pin_count(&self) -> usize {
        match &self.storage {
            ArrayStorage::Blittable(storage) => storage.pin_count(),
            ArrayStorage::Elements(_) => 0,
        }
    }

    fn contents_eq(&self, other: &ManagedArray) -> bool {
        if !Arc::ptr_eq(&self.element, &other.element) || self.len() != other.len() {
            return false;
        }
        match (self.to_values(), other.to_values()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    fn check_index(&self, index: usize) -> Result<()> {
        let len = self.len();
        if index >= len {
            return Err(InteropError::invalid_argument(
                "index",
                format!("{} out of range for array of length {}", index, len),
            ));
        }
        Ok(())
    }
}

/// An in-place view of a pinned array block. The array cannot be resized
/// while any view is alive.
pub struct PinnedView {
    storage: Arc<PinnableStorage>,
    ptr: *mut u8,
    byte_len: usize,
}

// Safety: the block is owned by `storage`, which the view keeps alive and
// which refuses to relocate while pinned.
unsafe impl Send for PinnedView {}

impl PinnedView {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    pub fn element_size(&self) -> usize {
        self.storage.element_size
    }

    pub fn len(&self) -> usize {
        if self.storage.element_size == 0 {
            0
        } else {
            self.byte_len / self.storage.element_size
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for PinnedView {
    fn drop(&mut self) {
        self.storage.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrimitiveKind;
    use crate::unit::CoreTypes;

    #[test]
    fn test_blittable_array_get_set() {
        let core = CoreTypes::new();
        let array = ManagedArray::new(core.primitive(PrimitiveKind::I16), 4);
        assert!(array.is_blittable());
        assert_eq!(array.get(2).unwrap(), Value::I16(0));

        array.set(2, &Value::I16(-7)).unwrap();
        assert_eq!(array.get(2).unwrap(), Value::I16(-7));
        assert!(array.set(4, &Value::I16(1)).is_err());
        assert!(array.set(0, &Value::string("x")).is_err());
    }

    #[test]
    fn test_clones_share_storage() {
        let core = CoreTypes::new();
        let array = ManagedArray::from_values(core.string(), vec![Value::string("a"), Value::String(None)]).unwrap();
        let alias = array.clone();
        alias.set(0, &Value::string("b")).unwrap();
        assert_eq!(array.get(0).unwrap(), Value::string("b"));
        assert!(array.get(1).unwrap().is_null());
        assert_eq!(Value::Array(array), Value::Array(alias));
    }

    #[test]
    fn test_pod_round_trip() {
        let core = CoreTypes::new();
        let array = ManagedArray::from_pod(core.primitive(PrimitiveKind::U32), &[1u32, 2, 3]).unwrap();
        assert_eq!(array.to_pod::<u32>(), Some(vec![1, 2, 3]));
        assert_eq!(array.to_pod::<u64>(), None);
        assert!(ManagedArray::from_pod(core.primitive(PrimitiveKind::U32), &[1u8]).is_err());
    }

    #[test]
    fn test_resize_blocked_while_pinned() {
        let core = CoreTypes::new();
        let array = ManagedArray::from_pod(core.primitive(PrimitiveKind::F64), &[1.0f64, 2.0]).unwrap();

        let view = array.pin().unwrap();
        assert_eq!(view.len(), 2);
        assert_eq!(array.pin_count(), 1);
        assert!(matches!(array.resize(5), Err(InteropError::Pinned(1))));

        drop(view);
        array.resize(3).unwrap();
        assert_eq!(array.len(), 3);
        assert_eq!(array.to_pod::<f64>(), Some(vec![1.0, 2.0, 0.0]));
    }

    #[test]
    fn test_writes_through_pin_land_in_array() {
        let core = CoreTypes::new();
        let array = ManagedArray::from_pod(core.primitive(PrimitiveKind::F64), &[1.5f64, -2.0, 4.0]).unwrap();

        let view = array.pin().unwrap();
        assert_eq!(view.as_ptr() as *const u8, array.storage_ptr());
        let doubles = view.as_ptr() as *mut f64;
        for i in 0..view.len() {
            unsafe { *doubles.add(i) *= 2.0 };
        }
        drop(view);

        assert_eq!(array.to_pod::<f64>(), Some(vec![3.0, -4.0, 8.0]));
        assert_eq!(array.get(1).unwrap(), Value::F64(-4.0));
    }

    #[test]
    fn test_empty_blittable_array() {
        let core = CoreTypes::new();
        let array = ManagedArray::new(core.primitive(PrimitiveKind::I32), 0);
        let view = array.pin().unwrap();
        assert!(view.is_empty());
        drop(view);
        array.resize(2).unwrap();
        assert_eq!(array.to_pod::<i32>(), Some(vec![0, 0]));
    }

    #[test]
    fn test_reference_arrays_do_not_pin() {
        let core = CoreTypes::new();
        let array = ManagedArray::new(core.string(), 2);
        assert!(array.pin().is_none());
        array.resize(4).unwrap();
        assert_eq!(array.len(), 4);
    }

    #[test]
    fn test_defaults() {
        let core = CoreTypes::new();
        assert_eq!(Value::default_for(&core.primitive(PrimitiveKind::F32)), Value::F32(0.0));
        assert_eq!(Value::default_for(&core.string()), Value::String(None));
        assert_eq!(Value::default_for(&core.object()), Value::Null);
        assert_eq!(Value::U16(7).as_i32(), Some(7));
        assert_eq!(Value::U64(u64::MAX).as_i64(), None);
    }
}
