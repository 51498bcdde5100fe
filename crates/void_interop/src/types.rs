//! Managed type model
//!
//! Code units describe their types as data: a [`TypeDef`] per declared type,
//! with members referring to other types through [`TypeRef`] signatures that
//! are resolved against the declaring unit first and the core types second.

use crate::error::{InteropError, Result};
use crate::marshal::RawNativeArray;
use crate::unit::{UnitAnchor, UnitImage};
use crate::value::Value;
use bitflags::bitflags;
use std::ffi::c_void;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Fixed-width value types with a native encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    Bool,
    Char,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    ISize,
    USize,
}

impl PrimitiveKind {
    pub const ALL: [PrimitiveKind; 14] = [
        PrimitiveKind::Bool,
        PrimitiveKind::Char,
        PrimitiveKind::I8,
        PrimitiveKind::U8,
        PrimitiveKind::I16,
        PrimitiveKind::U16,
        PrimitiveKind::I32,
        PrimitiveKind::U32,
        PrimitiveKind::I64,
        PrimitiveKind::U64,
        PrimitiveKind::F32,
        PrimitiveKind::F64,
        PrimitiveKind::ISize,
        PrimitiveKind::USize,
    ];

    /// Width of the native encoding in bytes. Booleans are always one byte.
    pub const fn size(self) -> usize {
        match self {
            PrimitiveKind::Bool | PrimitiveKind::I8 | PrimitiveKind::U8 => 1,
            PrimitiveKind::Char | PrimitiveKind::I16 | PrimitiveKind::U16 => 2,
            PrimitiveKind::I32 | PrimitiveKind::U32 | PrimitiveKind::F32 => 4,
            PrimitiveKind::I64 | PrimitiveKind::U64 | PrimitiveKind::F64 => 8,
            PrimitiveKind::ISize | PrimitiveKind::USize => std::mem::size_of::<usize>(),
        }
    }

    /// Signature name
    pub const fn name(self) -> &'static str {
        match self {
            PrimitiveKind::Bool => "bool",
            PrimitiveKind::Char => "char",
            PrimitiveKind::I8 => "i8",
            PrimitiveKind::U8 => "u8",
            PrimitiveKind::I16 => "i16",
            PrimitiveKind::U16 => "u16",
            PrimitiveKind::I32 => "i32",
            PrimitiveKind::U32 => "u32",
            PrimitiveKind::I64 => "i64",
            PrimitiveKind::U64 => "u64",
            PrimitiveKind::F32 => "f32",
            PrimitiveKind::F64 => "f64",
            PrimitiveKind::ISize => "isize",
            PrimitiveKind::USize => "usize",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.name() == name)
    }

    pub const fn is_integer(self) -> bool {
        !matches!(self, PrimitiveKind::Bool | PrimitiveKind::F32 | PrimitiveKind::F64)
    }
}

/// A type signature as written in member declarations
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeRef {
    Void,
    Primitive(PrimitiveKind),
    String,
    Object,
    FnPtr,
    /// Dotted full name of a declared type
    Named(String),
    Array(Box<TypeRef>),
    Pointer(Box<TypeRef>),
}

impl TypeRef {
    pub fn named(full_name: impl Into<String>) -> Self {
        TypeRef::Named(full_name.into())
    }

    pub fn array_of(element: TypeRef) -> Self {
        TypeRef::Array(Box::new(element))
    }

    pub fn pointer_to(element: TypeRef) -> Self {
        TypeRef::Pointer(Box::new(element))
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Void => write!(f, "void"),
            TypeRef::Primitive(kind) => write!(f, "{}", kind.name()),
            TypeRef::String => write!(f, "string"),
            TypeRef::Object => write!(f, "object"),
            TypeRef::FnPtr => write!(f, "fnptr"),
            TypeRef::Named(name) => write!(f, "{}", name),
            TypeRef::Array(inner) => write!(f, "{}[]", inner),
            TypeRef::Pointer(inner) => write!(f, "{}*", inner),
        }
    }
}

impl FromStr for TypeRef {
    type Err = InteropError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(inner) = s.strip_suffix("[]") {
            return Ok(TypeRef::array_of(inner.parse()?));
        }
        if let Some(inner) = s.strip_suffix('*') {
            return Ok(TypeRef::pointer_to(inner.parse()?));
        }
        match s {
            "void" => return Ok(TypeRef::Void),
            "string" => return Ok(TypeRef::String),
            "object" => return Ok(TypeRef::Object),
            "fnptr" => return Ok(TypeRef::FnPtr),
            _ => {}
        }
        if let Some(kind) = PrimitiveKind::from_name(s) {
            return Ok(TypeRef::Primitive(kind));
        }
        let valid = !s.is_empty()
            && !s.starts_with('.')
            && !s.ends_with('.')
            && s.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.' || c == '+');
        if !valid {
            return Err(InteropError::InvalidSignature(s.to_string()));
        }
        Ok(TypeRef::Named(s.to_string()))
    }
}

bitflags! {
    /// Type attribute flags, laid out like CLI `TypeAttributes`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TypeAttributes: u32 {
        const PUBLIC = 0x0000_0001;
        const NESTED_PUBLIC = 0x0000_0002;
        const SEQUENTIAL_LAYOUT = 0x0000_0008;
        const EXPLICIT_LAYOUT = 0x0000_0010;
        const INTERFACE = 0x0000_0020;
        const ABSTRACT = 0x0000_0080;
        const SEALED = 0x0000_0100;
        const SPECIAL_NAME = 0x0000_0400;
        const SERIALIZABLE = 0x0000_2000;
        const BEFORE_FIELD_INIT = 0x0010_0000;
    }
}

/// Member visibility
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Accessibility {
    #[default]
    Unknown = 0,
    Public = 1,
    Protected = 2,
    Internal = 3,
    Private = 4,
}

impl Accessibility {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Accessibility::Public,
            2 => Accessibility::Protected,
            3 => Accessibility::Internal,
            4 => Accessibility::Private,
            _ => Accessibility::Unknown,
        }
    }
}

/// What a type is, as far as the marshaller is concerned
#[derive(Debug, Clone)]
pub enum TypeKind {
    Void,
    Primitive(PrimitiveKind),
    String,
    Object,
    FunctionPointer,
    /// Enum with its underlying integer type
    Enum(PrimitiveKind),
    /// Flat value type copied byte-for-byte
    Struct { size: usize, blittable: bool },
    Class,
    /// Abstract sealed holder of static members
    Static,
    /// Single-dimension zero-based array
    Array(Arc<TypeDef>),
    Pointer(Arc<TypeDef>),
}

/// Method body: a Rust closure over managed values, or a C thunk
/// `(args, result)` receiving one pointer per parameter.
pub type RustMethod = dyn Fn(&[Value]) -> std::result::Result<Value, String> + Send + Sync;
pub type NativeThunk = unsafe extern "C" fn(*const *const c_void, *mut c_void);

#[derive(Clone)]
pub enum MethodBody {
    Rust(Arc<RustMethod>),
    Native(NativeThunk),
    /// Declared only (abstract or extern)
    None,
}

impl fmt::Debug for MethodBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodBody::Rust(_) => write!(f, "Rust"),
            MethodBody::Native(thunk) => write!(f, "Native({:p})", *thunk as *const ()),
            MethodBody::None => write!(f, "None"),
        }
    }
}

/// A declared method
#[derive(Debug, Clone)]
pub struct MethodDef {
    pub name: String,
    pub is_static: bool,
    pub accessibility: Accessibility,
    pub params: Vec<TypeRef>,
    pub ret: TypeRef,
    pub body: MethodBody,
}

impl MethodDef {
    pub fn returns_value(&self) -> bool {
        self.ret != TypeRef::Void
    }
}

/// A declared property
#[derive(Debug, Clone)]
pub struct PropertyDef {
    pub name: String,
    pub ty: TypeRef,
    pub accessibility: Accessibility,
}

/// Pointer to a word-sized static exported by a native library
#[derive(Debug, Clone, Copy)]
pub struct NativeSlot(pub *mut usize);

// Safety: the slot lives in a library kept mapped by the unit anchor, and is
// only accessed with volatile word-sized reads and writes.
unsafe impl Send for NativeSlot {}
unsafe impl Sync for NativeSlot {}

#[derive(Debug)]
pub enum FieldSlot {
    Owned(AtomicUsize),
    Native(NativeSlot),
}

/// A static field, typically a function-pointer slot filled by the host
#[derive(Debug)]
pub struct StaticField {
    pub name: String,
    pub ty: TypeRef,
    pub readonly: bool,
    pub slot: FieldSlot,
}

impl StaticField {
    pub fn is_function_pointer(&self) -> bool {
        matches!(self.ty, TypeRef::FnPtr)
    }

    /// Current slot contents
    pub fn get(&self) -> usize {
        match &self.slot {
            FieldSlot::Owned(cell) => cell.load(Ordering::Acquire),
            FieldSlot::Native(slot) if slot.0.is_null() => 0,
            FieldSlot::Native(slot) => unsafe { slot.0.read_volatile() },
        }
    }

    /// Store a word into the slot
    pub fn set(&self, owner: &str, value: usize) -> Result<()> {
        let fault = |message: &str| InteropError::FieldWriteFault {
            type_name: owner.to_string(),
            field: self.name.clone(),
            message: message.to_string(),
        };

        if self.readonly {
            return Err(fault("field is read-only"));
        }
        match &self.slot {
            FieldSlot::Owned(cell) => cell.store(value, Ordering::Release),
            FieldSlot::Native(slot) if slot.0.is_null() => return Err(fault("native slot is null")),
            FieldSlot::Native(slot) => unsafe { slot.0.write_volatile(value) },
        }
        Ok(())
    }
}

/// One declared or constructed type
pub struct TypeDef {
    pub(crate) name: String,
    pub(crate) namespace: String,
    pub(crate) kind: TypeKind,
    pub(crate) base: Option<TypeRef>,
    pub(crate) attributes: TypeAttributes,
    pub(crate) methods: Vec<MethodDef>,
    pub(crate) properties: Vec<PropertyDef>,
    pub(crate) fields: Vec<StaticField>,
    pub(crate) scope: Weak<UnitImage>,
    pub(crate) anchor: Arc<UnitAnchor>,
}

impl fmt::Debug for TypeDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDef")
            .field("full_name", &self.full_name())
            .field("kind", &self.kind)
            .field("unit", &self.anchor.full_name)
            .finish()
    }
}

impl TypeDef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }

    pub fn assembly_qualified_name(&self) -> String {
        format!("{}, {}", self.full_name(), self.anchor.full_name)
    }

    pub fn kind(&self) -> &TypeKind {
        &self.kind
    }

    pub fn base(&self) -> Option<&TypeRef> {
        self.base.as_ref()
    }

    pub fn attributes(&self) -> TypeAttributes {
        self.attributes
    }

    pub fn methods(&self) -> &[MethodDef] {
        &self.methods
    }

    pub fn properties(&self) -> &[PropertyDef] {
        &self.properties
    }

    pub fn fields(&self) -> &[StaticField] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&StaticField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// The unit this type was declared in (or the core unit)
    pub fn anchor(&self) -> &Arc<UnitAnchor> {
        &self.anchor
    }

    pub fn scope(&self) -> Option<Arc<UnitImage>> {
        self.scope.upgrade()
    }

    /// Size of a native cell holding this type. Static types report 0.
    pub fn size(&self) -> usize {
        match &self.kind {
            TypeKind::Void | TypeKind::Static => 0,
            TypeKind::Primitive(kind) | TypeKind::Enum(kind) => kind.size(),
            TypeKind::Struct { size, .. } => *size,
            TypeKind::Array(_) => std::mem::size_of::<RawNativeArray>(),
            TypeKind::String
            | TypeKind::Object
            | TypeKind::Class
            | TypeKind::FunctionPointer
            | TypeKind::Pointer(_) => std::mem::size_of::<usize>(),
        }
    }

    pub fn element_type(&self) -> Option<&Arc<TypeDef>> {
        match &self.kind {
            TypeKind::Array(element) | TypeKind::Pointer(element) => Some(element),
            _ => None,
        }
    }

    pub fn element_size(&self) -> usize {
        self.element_type().map(|e| e.size()).unwrap_or(0)
    }

    pub fn is_sz_array(&self) -> bool {
        matches!(self.kind, TypeKind::Array(_))
    }

    pub fn is_static(&self) -> bool {
        matches!(self.kind, TypeKind::Static)
            || self.attributes.contains(TypeAttributes::ABSTRACT | TypeAttributes::SEALED)
    }

    pub fn is_enum(&self) -> bool {
        matches!(self.kind, TypeKind::Enum(_))
    }

    /// Value type whose native form contains no references
    pub fn is_blittable(&self) -> bool {
        match &self.kind {
            TypeKind::Primitive(_)
            | TypeKind::Enum(_)
            | TypeKind::FunctionPointer
            | TypeKind::Pointer(_) => true,
            TypeKind::Struct { blittable, .. } => *blittable,
            _ => false,
        }
    }

    /// Signature that resolves back to this type from its own scope
    pub fn signature(&self) -> TypeRef {
        match &self.kind {
            TypeKind::Void => TypeRef::Void,
            TypeKind::Primitive(kind) => TypeRef::Primitive(*kind),
            TypeKind::String => TypeRef::String,
            TypeKind::Object => TypeRef::Object,
            TypeKind::FunctionPointer => TypeRef::FnPtr,
            TypeKind::Array(element) => TypeRef::array_of(element.signature()),
            TypeKind::Pointer(element) => TypeRef::pointer_to(element.signature()),
            _ => TypeRef::Named(self.full_name()),
        }
    }
}
