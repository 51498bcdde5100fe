//! Array and object marshalling
//!
//! Arrays of blittable elements cross the boundary without copying: the
//! native side receives the address of the pinned element block. Anything
//! else is copied element by element through the codec into a fresh block
//! owned by the returned [`NativeBuffer`].
//!
//! When a buffer is handed to the host as a [`RawNativeArray`], its `owner`
//! flag says whose memory it is. `Bridge` memory is the managed array itself
//! and must not be freed or written past its length; `Caller` memory is a
//! copy the host may read and write freely. In both cases the host returns
//! the record to `void_interop_release_array` once done, which unpins or
//! frees as appropriate.

use crate::codec::{self, NativeString, StringEncoding, Written};
use crate::error::{InteropError, Result};
use crate::types::{TypeDef, TypeKind};
use crate::value::{ManagedArray, PinnedView, Value};
use std::any::Any;
use std::ffi::c_void;
use std::sync::Arc;

/// Who owns the memory behind a native buffer
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOwner {
    /// Pinned managed storage
    Bridge = 0,
    /// Copy allocated for the host
    Caller = 1,
}

/// Flat description of a buffer as handed to native code
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawNativeArray {
    pub address: *mut c_void,
    pub length: u64,
    pub element_size: u64,
    /// [`BufferOwner`] as u8
    pub owner: u8,
    /// Opaque release token; null when there is nothing to release
    pub token: *mut c_void,
}

impl RawNativeArray {
    pub const fn null() -> Self {
        Self {
            address: std::ptr::null_mut(),
            length: 0,
            element_size: 0,
            owner: BufferOwner::Caller as u8,
            token: std::ptr::null_mut(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.address.is_null()
    }
}

/// What a buffer holds, for inspection and diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementManifest {
    pub element_type: String,
    pub element_size: usize,
    pub length: usize,
}

enum BufferStorage {
    Pinned(PinnedView),
    Owned {
        _block: Box<dyn Any + Send>,
        _strings: Vec<NativeString>,
    },
}

/// Native view of an array. Dropping it releases the pin or frees the copy.
pub struct NativeBuffer {
    manifest: ElementManifest,
    address: *mut u8,
    storage: BufferStorage,
}

// Safety: `address` points into `storage`, which moves with the buffer.
unsafe impl Send for NativeBuffer {}

impl NativeBuffer {
    fn pinned(view: PinnedView, element_type: String) -> Self {
        Self {
            manifest: ElementManifest {
                element_type,
                element_size: view.element_size(),
                length: view.len(),
            },
            address: view.as_ptr(),
            storage: BufferStorage::Pinned(view),
        }
    }

    fn copied(manifest: ElementManifest, mut words: Box<[u64]>, strings: Vec<NativeString>) -> Self {
        let address = words.as_mut_ptr() as *mut u8;
        Self {
            manifest,
            address,
            storage: BufferStorage::Owned {
                _block: Box::new(words),
                _strings: strings,
            },
        }
    }

    /// Buffer over fixed-layout records whose string fields point into
    /// `strings`
    pub fn from_records<T: Send + 'static>(element_type: &str, records: Vec<T>, strings: Vec<NativeString>) -> Self {
        let mut records = records.into_boxed_slice();
        let address = records.as_mut_ptr() as *mut u8;
        Self {
            manifest: ElementManifest {
                element_type: element_type.to_string(),
                element_size: std::mem::size_of::<T>(),
                length: records.len(),
            },
            address,
            storage: BufferStorage::Owned {
                _block: Box::new(records),
                _strings: strings,
            },
        }
    }

    pub fn address(&self) -> *mut u8 {
        self.address
    }

    pub fn len(&self) -> usize {
        self.manifest.length
    }

    pub fn is_empty(&self) -> bool {
        self.manifest.length == 0
    }

    pub fn element_size(&self) -> usize {
        self.manifest.element_size
    }

    pub fn manifest(&self) -> &ElementManifest {
        &self.manifest
    }

    pub fn owner(&self) -> BufferOwner {
        match self.storage {
            BufferStorage::Pinned(_) => BufferOwner::Bridge,
            BufferStorage::Owned { .. } => BufferOwner::Caller,
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.owner() == BufferOwner::Bridge
    }

    /// Record without a release token; the buffer keeps ownership
    pub fn header(&self) -> RawNativeArray {
        RawNativeArray {
            address: self.address as *mut c_void,
            length: self.manifest.length as u64,
            element_size: self.manifest.element_size as u64,
            owner: self.owner() as u8,
            token: std::ptr::null_mut(),
        }
    }

    /// Hand the buffer to native code
    pub fn into_raw(self) -> RawNativeArray {
        let header = self.header();
        RawNativeArray {
            token: Box::into_raw(Box::new(self)) as *mut c_void,
            ..header
        }
    }

    /// Take back a buffer handed out by [`NativeBuffer::into_raw`]
    ///
    /// # Safety
    /// `raw.token` must be null or come from `into_raw`, and must not be
    /// released twice.
    pub unsafe fn from_raw(raw: &RawNativeArray) -> Option<Self> {
        if raw.token.is_null() {
            return None;
        }
        Some(*Box::from_raw(raw.token as *mut NativeBuffer))
    }
}

impl std::fmt::Debug for NativeBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeBuffer")
            .field("manifest", &self.manifest)
            .field("owner", &self.owner())
            .finish()
    }
}

/// Produce a native view of a managed array. Blittable arrays are pinned in
/// place; others are copied through the codec.
pub fn array_to_native(array: &ManagedArray, encoding: StringEncoding) -> Result<NativeBuffer> {
    let element = array.element_type();
    if let Some(view) = array.pin() {
        log::trace!("Pinned {}[{}] for native access", element.full_name(), view.len());
        return Ok(NativeBuffer::pinned(view, element.full_name()));
    }

    let size = element.size();
    let length = array.len();
    let mut words = vec![0u64; (size * length).div_ceil(8)].into_boxed_slice();
    let base = words.as_mut_ptr() as *mut u8;
    let mut strings = Vec::new();

    for i in 0..length {
        let value = array.get(i)?;
        // Safety: cell `i` lies within the block sized for `length` elements
        let written = unsafe { codec::write_value(&value, element, base.add(i * size), encoding)? };
        if let Written::String(s) = written {
            strings.push(s);
        }
    }

    let manifest = ElementManifest {
        element_type: element.full_name(),
        element_size: size,
        length,
    };
    Ok(NativeBuffer::copied(manifest, words, strings))
}

/// Copy a native array into a new managed array
///
/// # Safety
/// A non-null `raw.address` must point to `raw.length` elements of
/// `element`'s native layout.
pub unsafe fn array_from_native(
    raw: &RawNativeArray,
    element: &Arc<TypeDef>,
    encoding: StringEncoding,
) -> Result<ManagedArray> {
    let size = element.size();
    if raw.is_null() {
        return Ok(ManagedArray::new(Arc::clone(element), 0));
    }
    if raw.element_size as usize != size {
        return Err(InteropError::SizeMismatch {
            type_name: element.full_name(),
            expected: size,
            actual: raw.element_size as usize,
        });
    }

    let base = raw.address as *const u8;
    let values = (0..raw.length as usize)
        .map(|i| codec::read_value(base.add(i * size), element, encoding))
        .collect::<Result<Vec<_>>>()?;
    ManagedArray::from_values(Arc::clone(element), values)
}

/// Result of writing a value into a native cell. Dropping it releases
/// anything the cell points at; [`Marshalled::into_native`] hands it over.
#[must_use = "dropping the guard invalidates what the destination cell points to"]
#[derive(Debug)]
pub enum Marshalled {
    Inline,
    String(NativeString),
    Array {
        buffer: NativeBuffer,
        dest: *mut RawNativeArray,
    },
}

impl Marshalled {
    /// Transfer ownership of any referenced memory to native code
    pub fn into_native(self) {
        match self {
            Marshalled::Inline => {}
            Marshalled::String(s) => {
                let _ = s.into_raw();
            }
            Marshalled::Array { buffer, dest } => {
                // Safety: `dest` was validated and written by `object_to_native`
                unsafe { dest.write_unaligned(buffer.into_raw()) };
            }
        }
    }
}

/// Write `value` into the cell at `dest` according to `declared`. Arrays
/// are written as a [`RawNativeArray`] record.
///
/// # Safety
/// `dest` must be valid for writes of `declared.size()` bytes.
pub unsafe fn object_to_native(
    value: &Value,
    declared: &TypeDef,
    dest: *mut u8,
    encoding: StringEncoding,
) -> Result<Marshalled> {
    if dest.is_null() {
        return Err(InteropError::invalid_argument("dest", "destination cell is null"));
    }
    match declared.kind() {
        TypeKind::Array(element) => {
            let dest = dest as *mut RawNativeArray;
            let array = match value {
                Value::Array(array) => array,
                Value::Null => {
                    dest.write_unaligned(RawNativeArray::null());
                    return Ok(Marshalled::Inline);
                }
                other => return Err(InteropError::mismatch(other.kind_name(), declared.full_name())),
            };
            if !Arc::ptr_eq(array.element_type(), element) {
                return Err(InteropError::mismatch("array", declared.full_name()));
            }
            let buffer = array_to_native(array, encoding)?;
            dest.write_unaligned(buffer.header());
            Ok(Marshalled::Array { buffer, dest })
        }
        TypeKind::Primitive(_)
        | TypeKind::Enum(_)
        | TypeKind::Struct { .. }
        | TypeKind::String
        | TypeKind::FunctionPointer
        | TypeKind::Pointer(_) => Ok(match codec::write_value(value, declared, dest, encoding)? {
            Written::Inline => Marshalled::Inline,
            Written::String(s) => Marshalled::String(s),
        }),
        _ => Err(InteropError::UnsupportedMarshalType(declared.full_name())),
    }
}

/// Read a value of type `declared` from the cell at `src`
///
/// # Safety
/// See [`codec::read_value`]; array cells must hold a [`RawNativeArray`].
pub unsafe fn object_from_native(src: *const u8, declared: &TypeDef, encoding: StringEncoding) -> Result<Value> {
    match declared.kind() {
        TypeKind::Array(element) => {
            if src.is_null() {
                return Ok(Value::Null);
            }
            let raw = (src as *const RawNativeArray).read_unaligned();
            if raw.is_null() {
                return Ok(Value::Null);
            }
            Ok(Value::Array(array_from_native(&raw, element, encoding)?))
        }
        _ => codec::read_value(src, declared, encoding),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrimitiveKind;
    use crate::unit::CoreTypes;

    #[test]
    fn test_blittable_array_is_pinned_in_place() {
        let core = CoreTypes::new();
        let array = ManagedArray::from_pod(core.primitive(PrimitiveKind::F32), &[1.0f32, 2.0, 3.0]).unwrap();

        let buffer = array_to_native(&array, StringEncoding::Ansi).unwrap();
        assert!(buffer.is_pinned());
        assert_eq!(buffer.address() as *const u8, array.storage_ptr());
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.element_size(), 4);

        // Writes through the native view land in the managed array
        unsafe { *(buffer.address() as *mut f32).add(1) = 20.0 };
        assert_eq!(array.get(1).unwrap(), Value::F32(20.0));

        assert!(matches!(array.resize(8), Err(InteropError::Pinned(1))));
        drop(buffer);
        assert_eq!(array.pin_count(), 0);
        array.resize(8).unwrap();
        assert_eq!(array.len(), 8);
    }

    #[test]
    fn test_string_array_is_copied() {
        let core = CoreTypes::new();
        let array = ManagedArray::from_values(
            core.string(),
            vec![Value::string("a"), Value::String(None), Value::string("ccc")],
        )
        .unwrap();

        let buffer = array_to_native(&array, StringEncoding::Ansi).unwrap();
        assert_eq!(buffer.owner(), BufferOwner::Caller);
        assert_eq!(buffer.element_size(), std::mem::size_of::<usize>());

        let raw = buffer.header();
        let back = unsafe { array_from_native(&raw, &core.string(), StringEncoding::Ansi) }.unwrap();
        assert_eq!(back.to_values().unwrap(), array.to_values().unwrap());
    }

    #[test]
    fn test_raw_round_trip_releases_once() {
        let core = CoreTypes::new();
        let array = ManagedArray::from_pod(core.primitive(PrimitiveKind::I32), &[5i32, 6]).unwrap();
        let raw = array_to_native(&array, StringEncoding::Ansi).unwrap().into_raw();
        assert_eq!(raw.owner, BufferOwner::Bridge as u8);
        assert_eq!(array.pin_count(), 1);

        let buffer = unsafe { NativeBuffer::from_raw(&raw) }.unwrap();
        drop(buffer);
        assert_eq!(array.pin_count(), 0);
        assert!(unsafe { NativeBuffer::from_raw(&RawNativeArray::null()) }.is_none());
    }

    #[test]
    fn test_object_to_native_keeps_pin_in_guard() {
        let core = CoreTypes::new();
        let ints = core.primitive(PrimitiveKind::I32);
        let array_ty = core.array_of(&ints);
        let array = ManagedArray::from_pod(ints, &[1i32, 2, 3]).unwrap();

        let mut cell = RawNativeArray::null();
        let guard = unsafe {
            object_to_native(
                &Value::Array(array.clone()),
                &array_ty,
                &mut cell as *mut RawNativeArray as *mut u8,
                StringEncoding::Ansi,
            )
        }
        .unwrap();

        assert_eq!(cell.address as *const u8, array.storage_ptr());
        assert_eq!(cell.length, 3);
        assert_eq!(array.pin_count(), 1);

        let read = unsafe { object_from_native(&cell as *const RawNativeArray as *const u8, &array_ty, StringEncoding::Ansi) }
            .unwrap();
        assert_eq!(read.as_array().unwrap().to_pod::<i32>().unwrap(), vec![1, 2, 3]);

        drop(guard);
        assert_eq!(array.pin_count(), 0);
    }

    #[test]
    fn test_unsupported_declared_type() {
        let core = CoreTypes::new();
        let mut cell = [0u8; 8];
        let result = unsafe { object_to_native(&Value::Null, &core.object(), cell.as_mut_ptr(), StringEncoding::Ansi) };
        assert!(matches!(result, Err(InteropError::UnsupportedMarshalType(_))));
    }

    #[test]
    fn test_null_array_cell() {
        let core = CoreTypes::new();
        let array_ty = core.array_of(&core.primitive(PrimitiveKind::U8));
        let mut cell = RawNativeArray {
            address: 1 as *mut c_void,
            ..RawNativeArray::null()
        };
        let guard = unsafe {
            object_to_native(
                &Value::Null,
                &array_ty,
                &mut cell as *mut RawNativeArray as *mut u8,
                StringEncoding::Ansi,
            )
        }
        .unwrap();
        assert!(matches!(guard, Marshalled::Inline));
        assert!(cell.is_null());
        let read = unsafe { object_from_native(&cell as *const RawNativeArray as *const u8, &array_ty, StringEncoding::Ansi) };
        assert_eq!(read.unwrap(), Value::Null);
    }

    #[test]
    fn test_records_buffer() {
        #[derive(Clone, Copy)]
        #[repr(C)]
        struct Pair {
            a: i32,
            b: i32,
        }
        let buffer = NativeBuffer::from_records("Pair", vec![Pair { a: 1, b: 2 }, Pair { a: 3, b: 4 }], Vec::new());
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.element_size(), 8);
        let second = unsafe { *(buffer.address() as *const Pair).add(1) };
        assert_eq!((second.a, second.b), (3, 4));
    }
}
