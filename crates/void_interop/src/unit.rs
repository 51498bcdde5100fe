//! Code units
//!
//! A [`UnitImage`] is one loaded code unit: its declared types plus the
//! constructed array and pointer types derived from them. Every type holds
//! a strong reference to the unit's [`UnitAnchor`], so the anchor (and the
//! native library behind it) stays alive exactly as long as anything still
//! references the unit's types. Unload completion is observed by watching
//! the anchor through a `Weak`.

use crate::container::ContainerId;
use crate::error::{InteropError, Result};
use crate::types::{
    Accessibility, FieldSlot, MethodBody, MethodDef, NativeSlot, NativeThunk, PrimitiveKind, PropertyDef,
    StaticField, TypeAttributes, TypeDef, TypeKind, TypeRef,
};
use crate::value::Value;
use libloading::Library;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Weak};

/// Keeps a unit's code mapped while any of its types are reachable
pub struct UnitAnchor {
    pub(crate) name: String,
    pub(crate) full_name: String,
    pub(crate) path: PathBuf,
    pub(crate) container: ContainerId,
    library: Option<Library>,
}

impl UnitAnchor {
    pub(crate) fn new(
        name: impl Into<String>,
        full_name: impl Into<String>,
        path: impl Into<PathBuf>,
        container: ContainerId,
        library: Option<Library>,
    ) -> Self {
        Self {
            name: name.into(),
            full_name: full_name.into(),
            path: path.into(),
            container,
            library,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn container(&self) -> ContainerId {
        self.container
    }

    pub fn is_native(&self) -> bool {
        self.library.is_some()
    }
}

impl Drop for UnitAnchor {
    fn drop(&mut self) {
        log::debug!("Releasing unit '{}'", self.full_name);
    }
}

/// One loaded code unit
pub struct UnitImage {
    anchor: Arc<UnitAnchor>,
    types: Vec<Arc<TypeDef>>,
    by_name: HashMap<String, usize>,
    constructed: RwLock<HashMap<String, Arc<TypeDef>>>,
}

impl UnitImage {
    pub fn anchor(&self) -> &Arc<UnitAnchor> {
        &self.anchor
    }

    pub fn name(&self) -> &str {
        &self.anchor.name
    }

    pub fn full_name(&self) -> &str {
        &self.anchor.full_name
    }

    pub fn path(&self) -> &Path {
        &self.anchor.path
    }

    /// Declared types in declaration order
    pub fn types(&self) -> &[Arc<TypeDef>] {
        &self.types
    }

    pub fn find_type(&self, full_name: &str) -> Option<&Arc<TypeDef>> {
        self.by_name.get(full_name).map(|i| &self.types[*i])
    }

    /// Interned array or pointer type over one of this scope's types
    fn constructed(self: &Arc<Self>, element: &Arc<TypeDef>, array: bool) -> Arc<TypeDef> {
        let suffix = if array { "[]" } else { "*" };
        let key = format!("{}{}", element.full_name(), suffix);
        if let Some(existing) = self.constructed.read().get(&key) {
            return Arc::clone(existing);
        }
        let mut constructed = self.constructed.write();
        Arc::clone(
            constructed
                .entry(key)
                .or_insert_with(|| Arc::new(construct(element, array, Arc::downgrade(self)))),
        )
    }
}

fn construct(element: &Arc<TypeDef>, array: bool, scope: Weak<UnitImage>) -> TypeDef {
    let (suffix, kind, base) = if array {
        ("[]", TypeKind::Array(Arc::clone(element)), Some(TypeRef::Object))
    } else {
        ("*", TypeKind::Pointer(Arc::clone(element)), None)
    };
    TypeDef {
        name: format!("{}{}", element.name(), suffix),
        namespace: element.namespace().to_string(),
        kind,
        base,
        attributes: TypeAttributes::PUBLIC | TypeAttributes::SEALED | TypeAttributes::SERIALIZABLE,
        methods: Vec::new(),
        properties: Vec::new(),
        fields: Vec::new(),
        scope,
        anchor: Arc::clone(&element.anchor),
    }
}

/// The built-in types every unit can refer to
pub struct CoreTypes {
    image: Arc<UnitImage>,
    void: Arc<TypeDef>,
    object: Arc<TypeDef>,
    string: Arc<TypeDef>,
    fn_ptr: Arc<TypeDef>,
    primitives: Vec<Arc<TypeDef>>,
}

impl CoreTypes {
    pub const UNIT_NAME: &'static str = "core";

    pub fn new() -> Self {
        let anchor = Arc::new(UnitAnchor::new(
            Self::UNIT_NAME,
            Self::UNIT_NAME,
            PathBuf::new(),
            ContainerId::DEFAULT,
            None,
        ));

        let image = Arc::new_cyclic(|scope: &Weak<UnitImage>| {
            let core = |name: &str, kind: TypeKind, base: Option<TypeRef>| {
                Arc::new(TypeDef {
                    name: name.to_string(),
                    namespace: String::new(),
                    kind,
                    base,
                    attributes: TypeAttributes::PUBLIC | TypeAttributes::SERIALIZABLE,
                    methods: Vec::new(),
                    properties: Vec::new(),
                    fields: Vec::new(),
                    scope: scope.clone(),
                    anchor: Arc::clone(&anchor),
                })
            };

            let mut types = vec![
                core("void", TypeKind::Void, None),
                core("object", TypeKind::Object, None),
                core("string", TypeKind::String, Some(TypeRef::Object)),
                core("fnptr", TypeKind::FunctionPointer, None),
            ];
            types.extend(
                PrimitiveKind::ALL
                    .iter()
                    .map(|k| core(k.name(), TypeKind::Primitive(*k), Some(TypeRef::Object))),
            );

            let by_name = types.iter().enumerate().map(|(i, t)| (t.full_name(), i)).collect();
            UnitImage {
                anchor: Arc::clone(&anchor),
                types,
                by_name,
                constructed: RwLock::new(HashMap::new()),
            }
        });

        let types = image.types();
        Self {
            void: Arc::clone(&types[0]),
            object: Arc::clone(&types[1]),
            string: Arc::clone(&types[2]),
            fn_ptr: Arc::clone(&types[3]),
            primitives: types[4..].to_vec(),
            image,
        }
    }

    pub fn image(&self) -> &Arc<UnitImage> {
        &self.image
    }

    pub fn anchor(&self) -> &Arc<UnitAnchor> {
        self.image.anchor()
    }

    pub fn void(&self) -> Arc<TypeDef> {
        Arc::clone(&self.void)
    }

    pub fn object(&self) -> Arc<TypeDef> {
        Arc::clone(&self.object)
    }

    pub fn string(&self) -> Arc<TypeDef> {
        Arc::clone(&self.string)
    }

    pub fn fn_ptr(&self) -> Arc<TypeDef> {
        Arc::clone(&self.fn_ptr)
    }

    pub fn primitive(&self, kind: PrimitiveKind) -> Arc<TypeDef> {
        Arc::clone(&self.primitives[kind as usize])
    }

    /// Array type over `element`, interned in the element's unit
    pub fn array_of(&self, element: &Arc<TypeDef>) -> Arc<TypeDef> {
        Self::constructed(element, true)
    }

    /// Pointer type over `element`, interned in the element's unit
    pub fn pointer_to(&self, element: &Arc<TypeDef>) -> Arc<TypeDef> {
        Self::constructed(element, false)
    }

    fn constructed(element: &Arc<TypeDef>, array: bool) -> Arc<TypeDef> {
        match element.scope() {
            Some(scope) => scope.constructed(element, array),
            // The unit image is gone; don't intern anything that would pin it
            None => Arc::new(construct(element, array, Weak::new())),
        }
    }

    /// Resolve a signature as seen from `from`: its own unit first, then core
    pub fn resolve(&self, sig: &TypeRef, from: Option<&UnitImage>) -> Result<Arc<TypeDef>> {
        match sig {
            TypeRef::Void => Ok(self.void()),
            TypeRef::Primitive(kind) => Ok(self.primitive(*kind)),
            TypeRef::String => Ok(self.string()),
            TypeRef::Object => Ok(self.object()),
            TypeRef::FnPtr => Ok(self.fn_ptr()),
            TypeRef::Named(name) => from
                .and_then(|unit| unit.find_type(name))
                .or_else(|| self.image.find_type(name))
                .cloned()
                .ok_or_else(|| InteropError::TypeNotFound(name.clone())),
            TypeRef::Array(inner) => Ok(self.array_of(&self.resolve(inner, from)?)),
            TypeRef::Pointer(inner) => Ok(self.pointer_to(&self.resolve(inner, from)?)),
        }
    }

    /// Resolve a signature appearing in a member of `owner`
    pub fn resolve_in(&self, sig: &TypeRef, owner: &TypeDef) -> Result<Arc<TypeDef>> {
        let scope = owner.scope();
        self.resolve(sig, scope.as_deref())
    }
}

impl Default for CoreTypes {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
enum ShapeSpec {
    Class,
    Static,
    Struct { size: usize, blittable: bool },
    Enum(PrimitiveKind),
}

struct MethodSpec {
    name: String,
    is_static: bool,
    params: Vec<String>,
    ret: String,
    body: MethodBody,
}

struct FieldSpec {
    name: String,
    ty: String,
    readonly: bool,
    slot: FieldSlot,
}

/// Declares one type of a unit
pub struct TypeBuilder {
    namespace: String,
    name: String,
    shape: ShapeSpec,
    base: Option<String>,
    extra_attributes: TypeAttributes,
    methods: Vec<MethodSpec>,
    properties: Vec<(String, String, Accessibility)>,
    fields: Vec<FieldSpec>,
}

impl TypeBuilder {
    fn new(namespace: &str, name: &str, shape: ShapeSpec) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            shape,
            base: None,
            extra_attributes: TypeAttributes::empty(),
            methods: Vec::new(),
            properties: Vec::new(),
            fields: Vec::new(),
        }
    }

    pub fn class(namespace: &str, name: &str) -> Self {
        Self::new(namespace, name, ShapeSpec::Class)
    }

    /// Abstract sealed holder of static members
    pub fn static_class(namespace: &str, name: &str) -> Self {
        Self::new(namespace, name, ShapeSpec::Static)
    }

    /// Blittable value type of `size` bytes
    pub fn structure(namespace: &str, name: &str, size: usize) -> Self {
        Self::new(namespace, name, ShapeSpec::Struct { size, blittable: true })
    }

    pub fn enumeration(namespace: &str, name: &str, underlying: PrimitiveKind) -> Self {
        Self::new(namespace, name, ShapeSpec::Enum(underlying))
    }

    pub fn non_blittable(mut self) -> Self {
        if let ShapeSpec::Struct { size, .. } = self.shape {
            self.shape = ShapeSpec::Struct { size, blittable: false };
        }
        self
    }

    pub fn base(mut self, signature: &str) -> Self {
        self.base = Some(signature.to_string());
        self
    }

    pub fn attributes(mut self, attributes: TypeAttributes) -> Self {
        self.extra_attributes |= attributes;
        self
    }

    fn push_method(mut self, name: &str, is_static: bool, params: &[&str], ret: &str, body: MethodBody) -> Self {
        self.methods.push(MethodSpec {
            name: name.to_string(),
            is_static,
            params: params.iter().map(|p| p.to_string()).collect(),
            ret: ret.to_string(),
            body,
        });
        self
    }

    /// Static method implemented by a Rust closure
    pub fn static_method<F>(self, name: &str, params: &[&str], ret: &str, body: F) -> Self
    where
        F: Fn(&[Value]) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.push_method(name, true, params, ret, MethodBody::Rust(Arc::new(body)))
    }

    /// Static method implemented by a C thunk
    pub fn native_method(self, name: &str, params: &[&str], ret: &str, thunk: NativeThunk) -> Self {
        self.push_method(name, true, params, ret, MethodBody::Native(thunk))
    }

    /// Instance method; declared only
    pub fn instance_method(self, name: &str, params: &[&str], ret: &str) -> Self {
        self.push_method(name, false, params, ret, MethodBody::None)
    }

    /// Writable function-pointer slot, initially null
    pub fn fn_ptr_field(self, name: &str) -> Self {
        self.field(name, "fnptr")
    }

    pub fn field(mut self, name: &str, ty: &str) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            ty: ty.to_string(),
            readonly: false,
            slot: FieldSlot::Owned(AtomicUsize::new(0)),
        });
        self
    }

    pub fn readonly_field(mut self, name: &str, ty: &str) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            ty: ty.to_string(),
            readonly: true,
            slot: FieldSlot::Owned(AtomicUsize::new(0)),
        });
        self
    }

    /// Field backed by a word exported from native code
    pub fn native_field(mut self, name: &str, ty: &str, slot: *mut usize) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            ty: ty.to_string(),
            readonly: false,
            slot: FieldSlot::Native(NativeSlot(slot)),
        });
        self
    }

    pub fn property(mut self, name: &str, ty: &str, accessibility: Accessibility) -> Self {
        self.properties.push((name.to_string(), ty.to_string(), accessibility));
        self
    }

    fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }

    fn finish(self, scope: &Weak<UnitImage>, anchor: &Arc<UnitAnchor>) -> Result<TypeDef> {
        let (kind, default_attributes) = match self.shape {
            ShapeSpec::Class => (TypeKind::Class, TypeAttributes::PUBLIC | TypeAttributes::BEFORE_FIELD_INIT),
            ShapeSpec::Static => (
                TypeKind::Static,
                TypeAttributes::PUBLIC
                    | TypeAttributes::ABSTRACT
                    | TypeAttributes::SEALED
                    | TypeAttributes::BEFORE_FIELD_INIT,
            ),
            ShapeSpec::Struct { size, blittable } => (
                TypeKind::Struct { size, blittable },
                TypeAttributes::PUBLIC | TypeAttributes::SEQUENTIAL_LAYOUT | TypeAttributes::SEALED,
            ),
            ShapeSpec::Enum(underlying) => (
                TypeKind::Enum(underlying),
                TypeAttributes::PUBLIC | TypeAttributes::SEALED | TypeAttributes::SERIALIZABLE,
            ),
        };

        let base = match self.base {
            Some(sig) => Some(sig.parse::<TypeRef>()?),
            None => Some(TypeRef::Object),
        };

        let methods = self
            .methods
            .into_iter()
            .map(|m| {
                Ok(MethodDef {
                    params: m.params.iter().map(|p| p.parse()).collect::<Result<Vec<TypeRef>>>()?,
                    ret: m.ret.parse()?,
                    name: m.name,
                    is_static: m.is_static,
                    accessibility: Accessibility::Public,
                    body: m.body,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let properties = self
            .properties
            .into_iter()
            .map(|(name, ty, accessibility)| {
                Ok(PropertyDef {
                    ty: ty.parse()?,
                    name,
                    accessibility,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let fields = self
            .fields
            .into_iter()
            .map(|f| {
                Ok(StaticField {
                    ty: f.ty.parse()?,
                    name: f.name,
                    readonly: f.readonly,
                    slot: f.slot,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(TypeDef {
            name: self.name,
            namespace: self.namespace,
            kind,
            base,
            attributes: default_attributes | self.extra_attributes,
            methods,
            properties,
            fields,
            scope: scope.clone(),
            anchor: Arc::clone(anchor),
        })
    }
}

/// Declares a whole unit
pub struct UnitBuilder {
    name: String,
    version: String,
    types: Vec<TypeBuilder>,
}

impl UnitBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            types: Vec::new(),
        }
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn with_type(mut self, ty: TypeBuilder) -> Self {
        self.types.push(ty);
        self
    }

    pub fn add_type(&mut self, ty: TypeBuilder) -> &mut Self {
        self.types.push(ty);
        self
    }

    /// Build the image for a unit loaded from `path` into `container`
    pub fn build(self, path: &Path, container: ContainerId) -> Result<Arc<UnitImage>> {
        self.build_with(path, container, None)
    }

    pub(crate) fn build_with(
        self,
        path: &Path,
        container: ContainerId,
        library: Option<Library>,
    ) -> Result<Arc<UnitImage>> {
        let mut by_name = HashMap::new();
        for (i, ty) in self.types.iter().enumerate() {
            if by_name.insert(ty.full_name(), i).is_some() {
                return Err(InteropError::load_error(
                    path,
                    format!("duplicate type '{}'", ty.full_name()),
                ));
            }
        }

        let full_name = format!("{}, Version={}", self.name, self.version);
        let anchor = Arc::new(UnitAnchor::new(self.name, full_name, path, container, library));

        let mut failure = None;
        let image = Arc::new_cyclic(|scope: &Weak<UnitImage>| {
            let mut types = Vec::with_capacity(self.types.len());
            for ty in self.types {
                match ty.finish(scope, &anchor) {
                    Ok(def) => types.push(Arc::new(def)),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            UnitImage {
                anchor: Arc::clone(&anchor),
                types,
                by_name,
                constructed: RwLock::new(HashMap::new()),
            }
        });

        match failure {
            Some(e) => Err(e),
            None => Ok(image),
        }
    }
}

/// Produces unit images from files
pub trait UnitLoader: Send + Sync {
    fn load(&self, path: &Path, container: ContainerId) -> Result<Arc<UnitImage>>;
}

type UnitFactory = Arc<dyn Fn() -> UnitBuilder + Send + Sync>;

/// Loader for units compiled into the host process, registered by file name.
/// The file must still exist; each load builds a fresh image.
#[derive(Default)]
pub struct StaticUnitLoader {
    factories: RwLock<HashMap<String, UnitFactory>>,
}

impl StaticUnitLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, file_name: &str, factory: F)
    where
        F: Fn() -> UnitBuilder + Send + Sync + 'static,
    {
        self.factories.write().insert(file_name.to_string(), Arc::new(factory));
    }

    pub fn is_registered(&self, file_name: &str) -> bool {
        self.factories.read().contains_key(file_name)
    }
}

impl UnitLoader for StaticUnitLoader {
    fn load(&self, path: &Path, container: ContainerId) -> Result<Arc<UnitImage>> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| InteropError::load_error(path, "path has no file name"))?;
        let factory = self
            .factories
            .read()
            .get(file_name)
            .cloned()
            .ok_or_else(|| InteropError::load_error(path, format!("no unit registered for '{}'", file_name)))?;
        factory().build(path, container)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> UnitBuilder {
        UnitBuilder::new("Game")
            .version("2.1.0")
            .with_type(TypeBuilder::structure("Game", "Vec3", 12))
            .with_type(
                TypeBuilder::static_class("Game", "Physics")
                    .static_method("Gravity", &[], "f32", |_| Ok(Value::F32(-9.81)))
                    .fn_ptr_field("Raycast"),
            )
    }

    #[test]
    fn test_core_types() {
        let core = CoreTypes::new();
        assert_eq!(core.primitive(PrimitiveKind::U16).name(), "u16");
        assert_eq!(core.primitive(PrimitiveKind::USize).name(), "usize");
        assert_eq!(core.string().assembly_qualified_name(), "string, core");
        assert!(core.object().base().is_none());
        assert_eq!(core.anchor().container(), ContainerId::DEFAULT);
    }

    #[test]
    fn test_build_unit() {
        let image = sample().build(Path::new("game.unit"), ContainerId(3)).unwrap();
        assert_eq!(image.name(), "Game");
        assert_eq!(image.full_name(), "Game, Version=2.1.0");
        assert_eq!(image.types().len(), 2);

        let physics = image.find_type("Game.Physics").unwrap();
        assert!(physics.is_static());
        assert_eq!(physics.size(), 0);
        assert_eq!(physics.assembly_qualified_name(), "Game.Physics, Game, Version=2.1.0");
        assert!(Arc::ptr_eq(&physics.scope().unwrap(), &image));
    }

    #[test]
    fn test_resolve_prefers_own_unit() {
        let core = CoreTypes::new();
        let image = sample().build(Path::new("game.unit"), ContainerId(3)).unwrap();

        let vec3 = core.resolve(&"Game.Vec3".parse().unwrap(), Some(&image)).unwrap();
        assert_eq!(vec3.size(), 12);
        assert!(matches!(
            core.resolve(&"Game.Vec3".parse().unwrap(), None),
            Err(InteropError::TypeNotFound(_))
        ));
    }

    #[test]
    fn test_constructed_types_are_interned() {
        let core = CoreTypes::new();
        let image = sample().build(Path::new("game.unit"), ContainerId(3)).unwrap();

        let a = core.resolve(&"Game.Vec3[]".parse().unwrap(), Some(&image)).unwrap();
        let b = core.resolve(&"Game.Vec3[]".parse().unwrap(), Some(&image)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.is_sz_array());
        assert_eq!(a.element_size(), 12);
        assert_eq!(a.full_name(), "Game.Vec3[]");
        assert!(Arc::ptr_eq(a.anchor(), image.anchor()));

        let ints = core.array_of(&core.primitive(PrimitiveKind::I32));
        assert!(Arc::ptr_eq(&ints, &core.array_of(&core.primitive(PrimitiveKind::I32))));
        assert!(Arc::ptr_eq(ints.anchor(), core.anchor()));
    }

    #[test]
    fn test_duplicate_type_rejected() {
        let builder = UnitBuilder::new("Dup")
            .with_type(TypeBuilder::class("A", "B"))
            .with_type(TypeBuilder::class("A", "B"));
        assert!(builder.build(Path::new("dup.unit"), ContainerId(1)).is_err());
    }

    #[test]
    fn test_bad_signature_rejected() {
        let builder = UnitBuilder::new("Bad").with_type(TypeBuilder::class("A", "B").field("x", "not a type"));
        assert!(matches!(
            builder.build(Path::new("bad.unit"), ContainerId(1)),
            Err(InteropError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_anchor_outlives_image_through_types() {
        let image = sample().build(Path::new("game.unit"), ContainerId(3)).unwrap();
        let anchor = Arc::downgrade(image.anchor());
        let held = Arc::clone(&image.types()[0]);
        drop(image);
        assert!(anchor.upgrade().is_some());
        drop(held);
        assert!(anchor.upgrade().is_none());
    }

    #[test]
    fn test_static_loader() {
        let loader = StaticUnitLoader::new();
        loader.register("game.unit", sample);
        assert!(loader.is_registered("game.unit"));

        let a = loader.load(Path::new("/tmp/game.unit"), ContainerId(1)).unwrap();
        let b = loader.load(Path::new("/tmp/game.unit"), ContainerId(1)).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(loader.load(Path::new("/tmp/other.unit"), ContainerId(1)).is_err());
    }
}
