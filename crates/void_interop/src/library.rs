//! Dynamic library units
//!
//! Loads a shared library, reads its unit manifest and turns it into a
//! [`UnitImage`]. The library handle moves into the unit anchor, so it is
//! unmapped only after every type built from it has been dropped.

use crate::container::ContainerId;
use crate::error::{InteropError, Result};
use crate::ffi::*;
use crate::types::{Accessibility, PrimitiveKind, TypeRef};
use crate::unit::{TypeBuilder, UnitBuilder, UnitImage, UnitLoader};
use libloading::{Library, Symbol};
use std::ffi::{c_char, CStr};
use std::path::Path;
use std::sync::Arc;

unsafe fn opt_str(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        None
    } else {
        Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
    }
}

unsafe fn req_str(ptr: *const c_char, path: &Path, what: &str) -> Result<String> {
    opt_str(ptr).ok_or_else(|| InteropError::load_error(path, format!("manifest {} is null", what)))
}

unsafe fn records<'a, T>(ptr: *const T, count: u32) -> &'a [T] {
    if ptr.is_null() || count == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(ptr, count as usize)
    }
}

/// Convert one manifest type entry into a builder
unsafe fn type_from_manifest(info: &FfiTypeInfo, path: &Path) -> Result<TypeBuilder> {
    let namespace = opt_str(info.namespace).unwrap_or_default();
    let name = req_str(info.name, path, "type name")?;

    let mut ty = match FfiTypeKind::from_raw(info.kind) {
        Some(FfiTypeKind::Class) => TypeBuilder::class(&namespace, &name),
        Some(FfiTypeKind::Static) => TypeBuilder::static_class(&namespace, &name),
        Some(FfiTypeKind::Struct) => {
            let ty = TypeBuilder::structure(&namespace, &name, info.size as usize);
            if info.blittable == 0 {
                ty.non_blittable()
            } else {
                ty
            }
        }
        Some(FfiTypeKind::Enum) => {
            let underlying = opt_str(info.underlying).unwrap_or_else(|| "i32".to_string());
            let kind = enum_underlying(&underlying).ok_or(InteropError::InvalidSignature(underlying))?;
            TypeBuilder::enumeration(&namespace, &name, kind)
        }
        None => {
            return Err(InteropError::load_error(
                path,
                format!("type '{}' has unknown kind {}", name, info.kind),
            ))
        }
    };

    if let Some(base) = opt_str(info.base) {
        ty = ty.base(&base);
    }

    for method in records(info.methods, info.method_count) {
        let method_name = req_str(method.name, path, "method name")?;
        let ret = opt_str(method.return_type).unwrap_or_else(|| "void".to_string());
        let params = records(method.param_types, method.param_count)
            .iter()
            .map(|p| req_str(*p, path, "parameter type"))
            .collect::<Result<Vec<_>>>()?;
        let params: Vec<&str> = params.iter().map(String::as_str).collect();
        ty = match method.thunk {
            Some(thunk) => ty.native_method(&method_name, &params, &ret, thunk),
            None => ty.instance_method(&method_name, &params, &ret),
        };
    }

    for field in records(info.fields, info.field_count) {
        let field_name = req_str(field.name, path, "field name")?;
        let field_type = opt_str(field.field_type).unwrap_or_else(|| "fnptr".to_string());
        ty = if field.readonly != 0 {
            ty.readonly_field(&field_name, &field_type)
        } else {
            ty.native_field(&field_name, &field_type, field.slot)
        };
    }

    for property in records(info.properties, info.property_count) {
        let property_name = req_str(property.name, path, "property name")?;
        let property_type = req_str(property.property_type, path, "property type")?;
        ty = ty.property(
            &property_name,
            &property_type,
            Accessibility::from_raw(property.accessibility),
        );
    }

    Ok(ty)
}

/// Read a manifest into a unit builder
///
/// # Safety
/// `manifest` must point to a valid manifest whose pointers stay valid for
/// the duration of the call.
pub unsafe fn builder_from_manifest(manifest: &FfiUnitManifest, path: &Path) -> Result<UnitBuilder> {
    if manifest.api_version != VOID_INTEROP_API_VERSION {
        return Err(InteropError::VersionMismatch {
            unit_version: manifest.api_version,
            expected_version: VOID_INTEROP_API_VERSION,
        });
    }

    let name = opt_str(manifest.name).unwrap_or_else(|| {
        path.file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string()
    });
    let version = opt_str(manifest.version).unwrap_or_else(|| "0.0.0".to_string());

    let mut unit = UnitBuilder::new(&name).version(&version);
    for info in records(manifest.types, manifest.type_count) {
        unit.add_type(type_from_manifest(info, path)?);
    }
    Ok(unit)
}

/// Loader for units shipped as shared libraries
#[derive(Debug, Default, Clone, Copy)]
pub struct DylibLoader;

impl DylibLoader {
    pub fn new() -> Self {
        Self
    }
}

impl UnitLoader for DylibLoader {
    fn load(&self, path: &Path, container: ContainerId) -> Result<Arc<UnitImage>> {
        let library = unsafe { Library::new(path).map_err(|e| InteropError::load_error(path, e.to_string()))? };

        let builder = unsafe {
            let symbol = format!("{}\0", UNIT_MANIFEST_SYMBOL);
            let get_manifest: Symbol<GetUnitManifestFn> = library
                .get(symbol.as_bytes())
                .map_err(|_| InteropError::symbol_not_found(path.display().to_string(), UNIT_MANIFEST_SYMBOL))?;

            let manifest = get_manifest();
            if manifest.is_null() {
                return Err(InteropError::load_error(path, "unit manifest is null"));
            }
            builder_from_manifest(&*manifest, path)?
        };

        let image = builder.build_with(path, container, Some(library))?;
        log::info!(
            "Loaded native unit '{}' with {} type(s)",
            image.full_name(),
            image.types().len()
        );
        Ok(image)
    }
}

/// Underlying primitive for an enum signature, for hosts building manifests
pub fn enum_underlying(signature: &str) -> Option<PrimitiveKind> {
    match signature.parse::<TypeRef>() {
        Ok(TypeRef::Primitive(kind)) if kind.is_integer() => Some(kind),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::c_void;
    use std::ptr;

    unsafe extern "C" fn add_thunk(args: *const *const c_void, result: *mut c_void) {
        let a = *(*args as *const i32);
        let b = *(*args.add(1) as *const i32);
        *(result as *mut i32) = a + b;
    }

    #[test]
    fn test_builder_from_manifest() {
        let mut slot: usize = 0;
        let params = [c"i32".as_ptr(), c"i32".as_ptr()];
        let methods = [FfiMethodInfo {
            name: c"Add".as_ptr(),
            return_type: c"i32".as_ptr(),
            param_count: 2,
            param_types: params.as_ptr(),
            thunk: Some(add_thunk),
        }];
        let fields = [FfiStaticFieldInfo {
            name: c"Log".as_ptr(),
            field_type: c"fnptr".as_ptr(),
            slot: &mut slot,
            readonly: 0,
        }];
        let types = [FfiTypeInfo {
            namespace: c"Native".as_ptr(),
            name: c"Math".as_ptr(),
            kind: FfiTypeKind::Static as u32,
            size: 0,
            blittable: 0,
            underlying: ptr::null(),
            base: ptr::null(),
            method_count: 1,
            methods: methods.as_ptr(),
            field_count: 1,
            fields: fields.as_ptr(),
            property_count: 0,
            properties: ptr::null(),
        }];
        let manifest = FfiUnitManifest {
            api_version: VOID_INTEROP_API_VERSION,
            name: c"NativeMath".as_ptr(),
            version: ptr::null(),
            type_count: 1,
            types: types.as_ptr(),
        };

        let image = unsafe { builder_from_manifest(&manifest, Path::new("native_math.so")) }
            .unwrap()
            .build(Path::new("native_math.so"), ContainerId(4))
            .unwrap();

        assert_eq!(image.full_name(), "NativeMath, Version=0.0.0");
        let math = image.find_type("Native.Math").unwrap();
        assert!(math.is_static());
        assert_eq!(math.methods().len(), 1);
        assert_eq!(math.methods()[0].params.len(), 2);

        math.field("Log").unwrap().set("Native.Math", 0x1234).unwrap();
        drop(image);
        assert_eq!(slot, 0x1234);
    }

    #[test]
    fn test_version_mismatch() {
        let manifest = FfiUnitManifest {
            api_version: VOID_INTEROP_API_VERSION + 1,
            name: ptr::null(),
            version: ptr::null(),
            type_count: 0,
            types: ptr::null(),
        };
        let result = unsafe { builder_from_manifest(&manifest, Path::new("x.so")) };
        assert!(matches!(result, Err(InteropError::VersionMismatch { .. })));
    }

    #[test]
    fn test_missing_library() {
        let result = DylibLoader::new().load(Path::new("/nonexistent/libnothing.so"), ContainerId(1));
        assert!(matches!(result, Err(InteropError::LoadError { .. })));
    }

    #[test]
    fn test_enum_underlying() {
        assert_eq!(enum_underlying("u8"), Some(PrimitiveKind::U8));
        assert_eq!(enum_underlying("f32"), None);
    }
}
