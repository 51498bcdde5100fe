//! Reflection cache
//!
//! Assigns handles to types, methods and properties and resolves them back.
//! Caching a type first caches its base and element types, then registers
//! the type and walks its declared methods and properties. Re-caching
//! returns the existing handle without touching the member tables, but a
//! top-level call never returns before the type's members are in place,
//! even when another thread is still filling them in.
//!
//! Every descriptor is owned by the container of the unit that declared it
//! (core types belong to the default container), so unloading a container
//! evicts exactly the handles that pointed into it.

use crate::codec::StringEncoding;
use crate::container::ContainerId;
use crate::error::{panic_message, InteropError, Result};
use crate::handle::{identity_hash, identity_of, identity_of_ref, Handle, HandleTable};
use crate::marshal;
use crate::signature::{legacy_method_hash, ordered_method_hash, SignatureScheme};
use crate::types::{Accessibility, MethodBody, MethodDef, NativeThunk, PropertyDef, TypeAttributes, TypeDef};
use crate::unit::CoreTypes;
use crate::value::Value;
use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

/// Base and element chains deeper than this are treated as cyclic
const MAX_TYPE_DEPTH: usize = 64;

/// Cached metadata for one type
#[derive(Debug)]
pub struct TypeDescriptor {
    id: Handle,
    def: Arc<TypeDef>,
    base_type: Handle,
    element_type: Handle,
    members: OnceLock<Members>,
}

#[derive(Debug, Default)]
struct Members {
    methods: Vec<Handle>,
    properties: Vec<Handle>,
}

impl TypeDescriptor {
    pub fn id(&self) -> Handle {
        self.id
    }

    pub fn def(&self) -> &Arc<TypeDef> {
        &self.def
    }

    pub fn name(&self) -> &str {
        self.def.name()
    }

    pub fn full_name(&self) -> String {
        self.def.full_name()
    }

    pub fn assembly_qualified_name(&self) -> String {
        self.def.assembly_qualified_name()
    }

    /// Base type handle, 0 when there is none
    pub fn base_type(&self) -> Handle {
        self.base_type
    }

    /// Element type handle for arrays and pointers, 0 otherwise
    pub fn element_type(&self) -> Handle {
        self.element_type
    }

    pub fn size(&self) -> usize {
        self.def.size()
    }

    pub fn element_size(&self) -> usize {
        self.def.element_size()
    }

    pub fn attributes(&self) -> TypeAttributes {
        self.def.attributes()
    }

    pub fn is_sz_array(&self) -> bool {
        self.def.is_sz_array()
    }

    pub fn is_static(&self) -> bool {
        self.def.is_static()
    }

    pub fn container(&self) -> ContainerId {
        self.def.anchor().container()
    }

    /// Method handles; empty until member population finishes
    pub fn methods(&self) -> &[Handle] {
        self.members.get().map(|m| m.methods.as_slice()).unwrap_or(&[])
    }

    pub fn properties(&self) -> &[Handle] {
        self.members.get().map(|m| m.properties.as_slice()).unwrap_or(&[])
    }
}

/// Cached metadata for one method
#[derive(Debug)]
pub struct MethodDescriptor {
    id: Handle,
    declaring: Arc<TypeDef>,
    declaring_type: Handle,
    index: usize,
    display_name: String,
    params: Vec<Arc<TypeDef>>,
    ret: Arc<TypeDef>,
}

impl MethodDescriptor {
    pub fn id(&self) -> Handle {
        self.id
    }

    pub fn def(&self) -> &MethodDef {
        &self.declaring.methods()[self.index]
    }

    pub fn name(&self) -> &str {
        &self.def().name
    }

    /// `Namespace.Type.Method(param, ...)`
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn declaring_type(&self) -> Handle {
        self.declaring_type
    }

    pub fn parameter_count(&self) -> usize {
        self.params.len()
    }

    pub fn parameter_types(&self) -> &[Arc<TypeDef>] {
        &self.params
    }

    pub fn return_type(&self) -> &Arc<TypeDef> {
        &self.ret
    }

    pub fn returns_value(&self) -> bool {
        self.def().returns_value()
    }

    pub fn is_static(&self) -> bool {
        self.def().is_static
    }
}

/// Cached metadata for one property
#[derive(Debug)]
pub struct PropertyDescriptor {
    id: Handle,
    declaring: Arc<TypeDef>,
    index: usize,
    owner_type: Handle,
    property_type: Handle,
}

impl PropertyDescriptor {
    pub fn id(&self) -> Handle {
        self.id
    }

    fn def(&self) -> &PropertyDef {
        &self.declaring.properties()[self.index]
    }

    pub fn name(&self) -> &str {
        &self.def().name
    }

    pub fn owner_type(&self) -> Handle {
        self.owner_type
    }

    pub fn property_type(&self) -> Handle {
        self.property_type
    }

    pub fn accessibility(&self) -> Accessibility {
        self.def().accessibility
    }
}

/// One `(name, function pointer)` pair for [`ReflectionCache::upload_internal_calls`]
#[derive(Debug, Clone, Copy)]
pub struct InternalCall<'a> {
    pub name: Option<&'a str>,
    pub function: usize,
}

impl<'a> InternalCall<'a> {
    pub fn new(name: &'a str, function: usize) -> Self {
        Self {
            name: Some(name),
            function,
        }
    }
}

/// The handle tables for types, methods and properties
pub struct ReflectionCache {
    core: Arc<CoreTypes>,
    scheme: SignatureScheme,
    encoding: StringEncoding,
    types: HandleTable<TypeDescriptor>,
    methods: HandleTable<MethodDescriptor>,
    properties: HandleTable<PropertyDescriptor>,
}

impl ReflectionCache {
    pub fn new(core: Arc<CoreTypes>, scheme: SignatureScheme, encoding: StringEncoding) -> Self {
        Self {
            core,
            scheme,
            encoding,
            types: HandleTable::new("type"),
            methods: HandleTable::new("method"),
            properties: HandleTable::new("property"),
        }
    }

    pub fn core(&self) -> &Arc<CoreTypes> {
        &self.core
    }

    pub fn string_encoding(&self) -> StringEncoding {
        self.encoding
    }

    /// Cache a type and its members. Idempotent.
    pub fn cache_type(&self, def: &Arc<TypeDef>) -> Result<Handle> {
        self.cache_type_at(def, 0)
    }

    // Only the outermost call (depth 0) waits for members another thread is
    // populating. Nested calls return the bare handle, so a type that refers
    // to itself, or to a type whose population is in flight, cannot block.
    fn cache_type_at(&self, def: &Arc<TypeDef>, depth: usize) -> Result<Handle> {
        let identity = identity_of(def);
        if let Some(id) = self.types.lookup(identity) {
            if depth == 0 {
                if let Some(descriptor) = self.types.get(id) {
                    self.ensure_members(&descriptor, depth);
                }
            }
            return Ok(id);
        }
        if depth > MAX_TYPE_DEPTH {
            return Err(InteropError::InvalidState(format!(
                "type graph of '{}' is cyclic or too deep",
                def.full_name()
            )));
        }

        let base_type = match def.base() {
            Some(sig) => {
                let base = self.core.resolve_in(sig, def)?;
                self.cache_type_at(&base, depth + 1)?
            }
            None => 0,
        };
        let element_type = match def.element_type() {
            Some(element) => self.cache_type_at(element, depth + 1)?,
            None => 0,
        };

        let container = def.anchor().container();
        let (id, descriptor, created) =
            self.types
                .add_entry(identity, identity_hash(identity), container, |id| TypeDescriptor {
                    id,
                    def: Arc::clone(def),
                    base_type,
                    element_type,
                    members: OnceLock::new(),
                });
        if created {
            log::trace!("Cached type '{}' as {}", def.full_name(), id);
        } else if depth > 0 {
            return Ok(id);
        }
        self.ensure_members(&descriptor, depth);
        Ok(id)
    }

    /// Populate the member tables once; concurrent callers block until done
    fn ensure_members(&self, descriptor: &TypeDescriptor, depth: usize) {
        descriptor.members.get_or_init(|| {
            // Evicted before population; leave nothing behind in the member tables
            if !self.types.contains(descriptor.id()) {
                return Members::default();
            }
            self.populate_members(descriptor, depth)
        });
    }

    fn populate_members(&self, descriptor: &TypeDescriptor, depth: usize) -> Members {
        let def = descriptor.def();

        let mut methods = Vec::with_capacity(def.methods().len());
        for (index, method) in def.methods().iter().enumerate() {
            match self.cache_method(descriptor, index, method, depth) {
                Ok(id) => methods.push(id),
                Err(e) => log::warn!("Skipping method '{}.{}': {}", def.full_name(), method.name, e),
            }
        }

        let mut properties = Vec::with_capacity(def.properties().len());
        for (index, property) in def.properties().iter().enumerate() {
            match self.cache_property(descriptor, index, property, depth) {
                Ok(id) => properties.push(id),
                Err(e) => log::warn!("Skipping property '{}.{}': {}", def.full_name(), property.name, e),
            }
        }
        Members { methods, properties }
    }

    fn cache_method(&self, declaring: &TypeDescriptor, index: usize, method: &MethodDef, depth: usize) -> Result<Handle> {
        let def = declaring.def();
        let ret = self.core.resolve_in(&method.ret, def)?;
        let params = method
            .params
            .iter()
            .map(|p| self.core.resolve_in(p, def))
            .collect::<Result<Vec<_>>>()?;

        let preferred = match self.scheme {
            SignatureScheme::Legacy => {
                let param_refs: Vec<&TypeDef> = params.iter().map(|p| p.as_ref()).collect();
                declaring.id() ^ legacy_method_hash(&method.name, &ret, &param_refs)
            }
            SignatureScheme::Ordered => {
                let ret_id = self.cache_type_at(&ret, depth + 1)?;
                let param_ids = params
                    .iter()
                    .map(|p| self.cache_type_at(p, depth + 1))
                    .collect::<Result<Vec<_>>>()?;
                ordered_method_hash(declaring.id(), &method.name, ret_id, &param_ids)
            }
        };

        let display_name = format!(
            "{}.{}({})",
            def.full_name(),
            method.name,
            params.iter().map(|p| p.full_name()).collect::<Vec<_>>().join(", ")
        );

        let (id, _) = self
            .methods
            .add_with(identity_of_ref(method), preferred, def.anchor().container(), |id| MethodDescriptor {
                id,
                declaring: Arc::clone(def),
                declaring_type: declaring.id(),
                index,
                display_name,
                params,
                ret,
            });
        Ok(id)
    }

    fn cache_property(
        &self,
        declaring: &TypeDescriptor,
        index: usize,
        property: &PropertyDef,
        depth: usize,
    ) -> Result<Handle> {
        let def = declaring.def();
        let ty = self.core.resolve_in(&property.ty, def)?;
        let property_type = self.cache_type_at(&ty, depth + 1)?;
        let (id, _) = self
            .properties
            .add(identity_of_ref(property), def.anchor().container(), |id| PropertyDescriptor {
                id,
                declaring: Arc::clone(def),
                index,
                owner_type: declaring.id(),
                property_type,
            });
        Ok(id)
    }

    pub fn type_descriptor(&self, id: Handle) -> Result<Arc<TypeDescriptor>> {
        self.types
            .get(id)
            .ok_or_else(|| InteropError::TypeNotFound(format!("#{}", id)))
    }

    pub fn method(&self, id: Handle) -> Result<Arc<MethodDescriptor>> {
        self.methods.get(id).ok_or(InteropError::MethodNotFound(id))
    }

    pub fn property(&self, id: Handle) -> Result<Arc<PropertyDescriptor>> {
        self.properties
            .get(id)
            .ok_or_else(|| InteropError::invalid_argument("property", format!("no property with id {}", id)))
    }

    pub fn query_name(&self, id: Handle) -> Option<String> {
        self.types.get(id).map(|t| t.name().to_string())
    }

    pub fn query_full_name(&self, id: Handle) -> Option<String> {
        self.types.get(id).map(|t| t.full_name())
    }

    pub fn query_assembly_qualified_name(&self, id: Handle) -> Option<String> {
        self.types.get(id).map(|t| t.assembly_qualified_name())
    }

    /// `None` when `id` is unknown, `Some(0)` when the type has no base
    pub fn query_base_type(&self, id: Handle) -> Option<Handle> {
        self.types.get(id).map(|t| t.base_type())
    }

    /// `None` when `id` is unknown, `Some(0)` when the type has no element type
    pub fn query_element_type(&self, id: Handle) -> Option<Handle> {
        self.types.get(id).map(|t| t.element_type())
    }

    pub fn type_methods(&self, id: Handle) -> Result<Vec<Arc<MethodDescriptor>>> {
        let descriptor = self.type_descriptor(id)?;
        Ok(descriptor.methods().iter().filter_map(|m| self.methods.get(*m)).collect())
    }

    pub fn type_properties(&self, id: Handle) -> Result<Vec<Arc<PropertyDescriptor>>> {
        let descriptor = self.type_descriptor(id)?;
        Ok(descriptor
            .properties()
            .iter()
            .filter_map(|p| self.properties.get(*p))
            .collect())
    }

    /// Store function pointers into static fields of a cached type.
    ///
    /// Pairs with a null name or function are skipped with a warning; a
    /// missing field or a field that cannot hold a function pointer is logged
    /// and skipped. A fault while writing a located field aborts the batch.
    /// Returns the number of fields written.
    pub fn upload_internal_calls(&self, type_id: Handle, calls: &[InternalCall<'_>]) -> Result<usize> {
        if calls.is_empty() {
            log::info!("No internal calls to upload for type {}", type_id);
            return Ok(0);
        }

        let descriptor = self.type_descriptor(type_id).inspect_err(|e| log::error!("{}", e))?;
        let def = descriptor.def();
        let type_name = def.full_name();

        let mut uploaded = 0;
        for call in calls {
            let Some(name) = call.name else {
                log::warn!("Skipping internal call with null name on '{}'", type_name);
                continue;
            };
            if call.function == 0 {
                log::warn!("Skipping internal call '{}' on '{}': null function pointer", name, type_name);
                continue;
            }
            let Some(field) = def.field(name) else {
                let err = InteropError::FieldNotFound {
                    type_name: type_name.clone(),
                    field: name.to_string(),
                };
                log::error!("{}", err);
                continue;
            };
            if !field.is_function_pointer() {
                let err = InteropError::NotFunctionPointerField {
                    type_name: type_name.clone(),
                    field: name.to_string(),
                };
                log::error!("{}", err);
                continue;
            }

            field.set(&type_name, call.function)?;
            log::trace!("Uploaded internal call '{}.{}'", type_name, name);
            uploaded += 1;
        }
        Ok(uploaded)
    }

    /// Invoke a static method with managed arguments
    pub fn invoke_static(&self, method_id: Handle, args: &[Value]) -> Result<Value> {
        let method = self.method(method_id)?;
        self.check_invocable(&method)?;
        if args.len() != method.parameter_count() {
            return Err(InteropError::invalid_argument(
                "args",
                format!(
                    "'{}' takes {} argument(s), got {}",
                    method.display_name(),
                    method.parameter_count(),
                    args.len()
                ),
            ));
        }

        match &method.def().body {
            MethodBody::Rust(body) => match catch_unwind(AssertUnwindSafe(|| body(args))) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(message)) => Err(InteropError::invoke_failed(method.display_name(), message)),
                Err(payload) => Err(InteropError::invoke_failed(
                    method.display_name(),
                    panic_message(payload.as_ref()),
                )),
            },
            MethodBody::Native(thunk) => self.call_thunk(&method, *thunk, args),
            MethodBody::None => Err(InteropError::invoke_failed(method.display_name(), "method has no body")),
        }
    }

    /// Invoke a static method with native argument slots: `args` holds one
    /// pointer per parameter, each pointing at that argument's cell. A
    /// non-void result is written to `result` when it is non-null.
    ///
    /// # Safety
    /// `args` must hold `parameter_count` valid cell pointers laid out per
    /// the parameter types, and a non-null `result` must be valid for the
    /// return type's size.
    pub unsafe fn invoke_static_raw(
        &self,
        method_id: Handle,
        result: *mut c_void,
        args: *const *const c_void,
    ) -> Result<()> {
        let method = self.method(method_id)?;
        self.check_invocable(&method)?;
        let count = method.parameter_count();
        if count > 0 && args.is_null() {
            return Err(InteropError::invalid_argument("args", "argument array is null"));
        }

        if let MethodBody::Native(thunk) = &method.def().body {
            if result.is_null() && method.returns_value() {
                let mut scratch = scratch_cell(method.return_type().size());
                thunk(args, scratch.as_mut_ptr() as *mut c_void);
            } else {
                thunk(args, result);
            }
            return Ok(());
        }

        let mut values = Vec::with_capacity(count);
        for (i, ty) in method.parameter_types().iter().enumerate() {
            let slot = *args.add(i);
            values.push(marshal::object_from_native(slot as *const u8, ty, self.encoding)?);
        }

        let value = self.invoke_static(method_id, &values)?;
        if !result.is_null() && method.returns_value() {
            marshal::object_to_native(&value, method.return_type(), result as *mut u8, self.encoding)?.into_native();
        }
        Ok(())
    }

    fn check_invocable(&self, method: &MethodDescriptor) -> Result<()> {
        if !method.is_static() {
            return Err(InteropError::InvalidState(format!(
                "'{}' is not a static method",
                method.display_name()
            )));
        }
        Ok(())
    }

    fn call_thunk(&self, method: &MethodDescriptor, thunk: NativeThunk, args: &[Value]) -> Result<Value> {
        let mut cells = Vec::with_capacity(args.len());
        let mut guards = Vec::with_capacity(args.len());
        for (value, ty) in args.iter().zip(method.parameter_types()) {
            let mut cell = scratch_cell(ty.size());
            // Safety: the cell is sized for the parameter type
            let guard = unsafe { marshal::object_to_native(value, ty, cell.as_mut_ptr() as *mut u8, self.encoding)? };
            guards.push(guard);
            cells.push(cell);
        }
        let pointers: Vec<*const c_void> = cells.iter().map(|c| c.as_ptr() as *const c_void).collect();

        let ret = method.return_type();
        let mut result = scratch_cell(ret.size());
        // Safety: one valid cell per parameter, result sized for the return type
        unsafe { thunk(pointers.as_ptr(), result.as_mut_ptr() as *mut c_void) };
        drop(guards);

        if !method.returns_value() {
            return Ok(Value::Void);
        }
        // Safety: the thunk wrote a value of the return type into `result`
        unsafe { marshal::object_from_native(result.as_ptr() as *const u8, ret, self.encoding) }
    }

    /// Drop every descriptor owned by `container`
    pub fn evict_container(&self, container: ContainerId) -> usize {
        let evicted = self.properties.evict_owner(container)
            + self.methods.evict_owner(container)
            + self.types.evict_owner(container);
        if evicted > 0 {
            log::debug!("Evicted {} reflection entries for {:?}", evicted, container);
        }
        evicted
    }

    /// Drop every descriptor
    pub fn clear(&self) {
        self.properties.clear();
        self.methods.clear();
        self.types.clear();
    }

    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    pub fn property_count(&self) -> usize {
        self.properties.len()
    }
}

/// Zeroed, word-aligned cell of at least `size` bytes
fn scratch_cell(size: usize) -> Box<[u64]> {
    vec![0u64; size.div_ceil(8).max(1)].into_boxed_slice()
}
