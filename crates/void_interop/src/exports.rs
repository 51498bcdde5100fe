//! C entry points
//!
//! Every function here is callable from the native host. None of them
//! unwind or return errors: failures go to the installed error callback and
//! the function returns its sentinel.
//!
//! | Return type     | Failure / miss                          |
//! |-----------------|-----------------------------------------|
//! | unit id         | `-1`                                    |
//! | base/element id | `-1` not found, `0` none                |
//! | string          | null                                    |
//! | record array    | null address, zero length               |
//! | `u8` flag       | `0`                                     |
//!
//! Strings crossing these entry points, in either direction and inside the
//! returned records, use the bridge's configured `string_encoding`. The one
//! exception is the config path given to
//! [`void_interop_initialize_with_config`], which is always single-byte
//! because the encoding is not known until the file is read.
//!
//! Strings and arrays returned by the bridge are owned by the caller and
//! must be released with [`void_interop_free_string`] and
//! [`void_interop_release_array`].

use crate::callbacks::{self, BoundaryCallbacks, BoundaryLogger, ErrorCallback, LogCallback};
use crate::codec::{read_native_str, NativeString, StringEncoding};
use crate::collector::{CollectOptions, CollectionMode};
use crate::config::BridgeConfig;
use crate::error::{panic_message, InteropError, Result};
use crate::ffi::{InternalCallPair, NativeMethodRecord, NativePropertyRecord, NativeTypeRecord};
use crate::marshal::{NativeBuffer, RawNativeArray};
use crate::reflection::InternalCall;
use crate::service::InteropService;
use log::LevelFilter;
use parking_lot::RwLock;
use std::ffi::{c_char, c_void};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

static SERVICE: RwLock<Option<Arc<InteropService>>> = RwLock::new(None);

/// Install the service backing the entry points
pub fn install_service(service: Arc<InteropService>) -> Result<()> {
    let mut slot = SERVICE.write();
    if slot.is_some() {
        return Err(InteropError::InvalidState("bridge is already initialized".into()));
    }
    *slot = Some(service);
    Ok(())
}

/// Remove and return the installed service
pub fn take_service() -> Option<Arc<InteropService>> {
    SERVICE.write().take()
}

fn service() -> Result<Arc<InteropService>> {
    SERVICE.read().clone().ok_or(InteropError::NotInitialized)
}

/// Run `f` against the service, funnelling errors and panics to the host
fn boundary<T>(entry: &str, sentinel: T, f: impl FnOnce(&InteropService) -> Result<T>) -> T {
    let outcome = catch_unwind(AssertUnwindSafe(|| service().and_then(|s| f(&*s))));
    match outcome {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            log::error!("{} failed: {}", entry, e);
            callbacks::report(&e);
            sentinel
        }
        Err(payload) => {
            let message = format!("{} panicked: {}", entry, panic_message(payload.as_ref()));
            log::error!("{}", message);
            callbacks::emit_error(&message, true);
            sentinel
        }
    }
}

unsafe fn str_in(ptr: *const c_void, encoding: StringEncoding, name: &'static str) -> Result<String> {
    let Some(s) = read_native_str(ptr, encoding) else {
        return Err(InteropError::invalid_argument(name, "null pointer"));
    };
    if s.is_empty() {
        return Err(InteropError::invalid_argument(name, "empty string"));
    }
    Ok(s)
}

unsafe fn arg_str(service: &InteropService, ptr: *const c_void, name: &'static str) -> Result<String> {
    str_in(ptr, service.cache().string_encoding(), name)
}

fn host_str(service: &InteropService, s: &str) -> Result<NativeString> {
    NativeString::new(s, service.cache().string_encoding())
}

/// Hand a string to the host, or null on a miss
fn out_opt_str(service: &InteropService, entry: &str, id: i32, s: Option<String>) -> Result<*mut c_void> {
    match s {
        Some(s) => Ok(host_str(service, &s)?.into_raw()),
        None => {
            log::warn!("{}: no entry for id {}", entry, id);
            Ok(std::ptr::null_mut())
        }
    }
}

// The config is resolved after the callbacks are installed so that problems
// with it reach the host.
fn initialize_with(
    log: Option<LogCallback>,
    error: Option<ErrorCallback>,
    config: impl FnOnce() -> Result<BridgeConfig>,
) -> Result<()> {
    if SERVICE.read().is_some() {
        return Err(InteropError::InvalidState("bridge is already initialized".into()));
    }
    callbacks::install(BoundaryCallbacks { log, error })?;
    BoundaryLogger::init(LevelFilter::Debug);
    let service = InteropService::with_dylib_loader(config()?)?;
    install_service(Arc::new(service))
}

fn config_from_env() -> BridgeConfig {
    match BridgeConfig::try_from_env() {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            log::warn!("{}", e);
            callbacks::report_with(&e, false);
            BridgeConfig::default()
        }
    }
}

/// A failed start leaves no callbacks behind, so the host can try again
fn report_init(result: Result<()>) -> u8 {
    match result {
        Ok(()) => 1,
        Err(e) => {
            log::error!("Initialization failed: {}", e);
            callbacks::report(&e);
            if SERVICE.read().is_none() {
                callbacks::reset();
            }
            0
        }
    }
}

/// Install the boundary callbacks and start the bridge. Reads the file named
/// by `VOID_INTEROP_CONFIG` when set.
#[no_mangle]
pub extern "C" fn void_interop_initialize(log: Option<LogCallback>, error: Option<ErrorCallback>) -> u8 {
    let result = catch_unwind(|| initialize_with(log, error, || Ok(config_from_env())))
        .unwrap_or_else(|p| Err(InteropError::InvalidState(panic_message(p.as_ref()))));
    report_init(result)
}

/// Like [`void_interop_initialize`], with an explicit config file
///
/// # Safety
/// `config_path` must be null or a valid null-terminated string.
#[no_mangle]
pub unsafe extern "C" fn void_interop_initialize_with_config(
    log: Option<LogCallback>,
    error: Option<ErrorCallback>,
    config_path: *const c_char,
) -> u8 {
    let result = catch_unwind(|| {
        initialize_with(log, error, || {
            let path = str_in(config_path.cast(), StringEncoding::Ansi, "config_path")?;
            BridgeConfig::load_from_file(path)
        })
    })
    .unwrap_or_else(|p| Err(InteropError::InvalidState(panic_message(p.as_ref()))));
    report_init(result)
}

/// Drop every container and cache, then uninstall the callbacks
#[no_mangle]
pub extern "C" fn void_interop_shutdown() {
    let _ = catch_unwind(|| {
        if let Some(service) = take_service() {
            service.shutdown();
        }
        callbacks::reset();
    });
}

/// # Safety
/// Both arguments must be null or valid null-terminated strings in the
/// configured encoding.
#[no_mangle]
pub unsafe extern "C" fn void_interop_load(filepath: *const c_void, container_name: *const c_void) -> i32 {
    boundary("load", -1, |s| {
        let path = arg_str(s, filepath, "filepath")?;
        let container = arg_str(s, container_name, "container_name")?;
        s.units().load(path, &container)
    })
}

/// # Safety
/// `container_name` must be null or a valid null-terminated string.
#[no_mangle]
pub unsafe extern "C" fn void_interop_unload(container_name: *const c_void) {
    boundary("unload", (), |s| s.units().unload(&arg_str(s, container_name, "container_name")?))
}

/// # Safety
/// `container_name` must be null or a valid null-terminated string.
#[no_mangle]
pub unsafe extern "C" fn void_interop_reload(container_name: *const c_void) {
    boundary("reload", (), |s| {
        s.units().reload(&arg_str(s, container_name, "container_name")?).map(|_| ())
    })
}

/// # Safety
/// Both arguments must be null or valid null-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn void_interop_get_unit_id(unit_name: *const c_void, container_name: *const c_void) -> i32 {
    boundary("get_unit_id", -1, |s| {
        let unit = arg_str(s, unit_name, "unit_name")?;
        let container = arg_str(s, container_name, "container_name")?;
        Ok(s.units().unit_id(&unit, &container).unwrap_or(-1))
    })
}

#[no_mangle]
pub extern "C" fn void_interop_get_unit_name(id: i32) -> *mut c_void {
    boundary("get_unit_name", std::ptr::null_mut(), |s| {
        out_opt_str(s, "get_unit_name", id, s.units().unit(id).ok().map(|u| u.name().to_string()))
    })
}

#[no_mangle]
pub extern "C" fn void_interop_get_unit_full_name(id: i32) -> *mut c_void {
    boundary("get_unit_full_name", std::ptr::null_mut(), |s| {
        out_opt_str(
            s,
            "get_unit_full_name",
            id,
            s.units().unit(id).ok().map(|u| u.full_name().to_string()),
        )
    })
}

#[no_mangle]
pub extern "C" fn void_interop_get_unit_filepath(id: i32) -> *mut c_void {
    boundary("get_unit_filepath", std::ptr::null_mut(), |s| {
        out_opt_str(
            s,
            "get_unit_filepath",
            id,
            s.units().unit(id).ok().map(|u| u.path().display().to_string()),
        )
    })
}

/// Cache and describe every type the unit declares
#[no_mangle]
pub extern "C" fn void_interop_get_exported_types(unit_id: i32) -> RawNativeArray {
    boundary("get_exported_types", RawNativeArray::null(), |s| {
        let ids = s.units().exported_types(unit_id)?;
        let mut strings = Vec::with_capacity(ids.len() * 3);
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let t = s.cache().type_descriptor(id)?;
            let name = host_str(s, t.name())?;
            let full_name = host_str(s, &t.full_name())?;
            let aqn = host_str(s, &t.assembly_qualified_name())?;
            records.push(NativeTypeRecord {
                id,
                base_type: t.base_type(),
                element_type: t.element_type(),
                attributes: t.attributes().bits(),
                size: t.size() as u64,
                element_size: t.element_size() as u64,
                is_sz_array: t.is_sz_array() as u8,
                is_static: t.is_static() as u8,
                name: name.as_ptr(),
                full_name: full_name.as_ptr(),
                assembly_qualified_name: aqn.as_ptr(),
            });
            strings.extend([name, full_name, aqn]);
        }
        if records.is_empty() {
            return Ok(RawNativeArray::null());
        }
        Ok(NativeBuffer::from_records("NativeTypeRecord", records, strings).into_raw())
    })
}

#[no_mangle]
pub extern "C" fn void_interop_get_type_name(id: i32) -> *mut c_void {
    boundary("get_type_name", std::ptr::null_mut(), |s| {
        out_opt_str(s, "get_type_name", id, s.cache().query_name(id))
    })
}

#[no_mangle]
pub extern "C" fn void_interop_get_type_full_name(id: i32) -> *mut c_void {
    boundary("get_type_full_name", std::ptr::null_mut(), |s| {
        out_opt_str(s, "get_type_full_name", id, s.cache().query_full_name(id))
    })
}

#[no_mangle]
pub extern "C" fn void_interop_get_type_assembly_qualified_name(id: i32) -> *mut c_void {
    boundary("get_type_assembly_qualified_name", std::ptr::null_mut(), |s| {
        out_opt_str(
            s,
            "get_type_assembly_qualified_name",
            id,
            s.cache().query_assembly_qualified_name(id),
        )
    })
}

#[no_mangle]
pub extern "C" fn void_interop_get_type_base_type(id: i32) -> i32 {
    boundary("get_type_base_type", -1, |s| Ok(s.cache().query_base_type(id).unwrap_or(-1)))
}

#[no_mangle]
pub extern "C" fn void_interop_get_type_element_type(id: i32) -> i32 {
    boundary("get_type_element_type", -1, |s| Ok(s.cache().query_element_type(id).unwrap_or(-1)))
}

#[no_mangle]
pub extern "C" fn void_interop_get_type_methods(type_id: i32) -> RawNativeArray {
    boundary("get_type_methods", RawNativeArray::null(), |s| {
        let methods = s.cache().type_methods(type_id)?;
        let mut strings = Vec::with_capacity(methods.len() * 2);
        let mut records = Vec::with_capacity(methods.len());
        for m in methods {
            let name = host_str(s, m.name())?;
            let display_name = host_str(s, m.display_name())?;
            records.push(NativeMethodRecord {
                id: m.id(),
                parameter_count: m.parameter_count() as i32,
                returns_value: m.returns_value() as u8,
                is_static: m.is_static() as u8,
                name: name.as_ptr(),
                display_name: display_name.as_ptr(),
            });
            strings.extend([name, display_name]);
        }
        if records.is_empty() {
            return Ok(RawNativeArray::null());
        }
        Ok(NativeBuffer::from_records("NativeMethodRecord", records, strings).into_raw())
    })
}

#[no_mangle]
pub extern "C" fn void_interop_get_type_properties(type_id: i32) -> RawNativeArray {
    boundary("get_type_properties", RawNativeArray::null(), |s| {
        let properties = s.cache().type_properties(type_id)?;
        let mut strings = Vec::with_capacity(properties.len());
        let mut records = Vec::with_capacity(properties.len());
        for p in properties {
            let name = host_str(s, p.name())?;
            records.push(NativePropertyRecord {
                id: p.id(),
                owner_type: p.owner_type(),
                property_type: p.property_type(),
                accessibility: p.accessibility() as i32,
                name: name.as_ptr(),
            });
            strings.push(name);
        }
        if records.is_empty() {
            return Ok(RawNativeArray::null());
        }
        Ok(NativeBuffer::from_records("NativePropertyRecord", records, strings).into_raw())
    })
}

/// Store function pointers into static fields of a cached type
///
/// # Safety
/// `pairs` must point to `count` records whose names are null or valid
/// null-terminated strings in the configured encoding.
#[no_mangle]
pub unsafe extern "C" fn void_interop_upload_internal_calls(
    type_id: i32,
    pairs: *const InternalCallPair,
    count: i32,
) -> u8 {
    boundary("upload_internal_calls", 0, |s| {
        if count < 0 || (count > 0 && pairs.is_null()) {
            return Err(InteropError::invalid_argument("pairs", "null or negative-length array"));
        }
        let pairs = if count == 0 {
            &[][..]
        } else {
            std::slice::from_raw_parts(pairs, count as usize)
        };
        let encoding = s.cache().string_encoding();
        let names: Vec<Option<String>> = pairs.iter().map(|p| read_native_str(p.name, encoding)).collect();
        let calls: Vec<InternalCall<'_>> = names
            .iter()
            .zip(pairs)
            .map(|(name, pair)| InternalCall {
                name: name.as_deref(),
                function: pair.function as usize,
            })
            .collect();
        s.cache().upload_internal_calls(type_id, &calls)?;
        Ok(1)
    })
}

/// Invoke a static method. `args` holds one pointer per parameter; a
/// non-void result is written to `result` when it is non-null.
///
/// # Safety
/// See [`crate::reflection::ReflectionCache::invoke_static_raw`].
#[no_mangle]
pub unsafe extern "C" fn void_interop_invoke_static_method(
    method_id: i32,
    result: *mut c_void,
    args: *const *const c_void,
) -> u8 {
    boundary("invoke_static_method", 0, |s| {
        s.cache().invoke_static_raw(method_id, result, args)?;
        Ok(1)
    })
}

#[no_mangle]
pub extern "C" fn void_interop_collect_garbage(generation: i32, mode: i32, blocking: u8, compacting: u8) {
    boundary("collect_garbage", (), |s| {
        let mode = CollectionMode::from_raw(mode)
            .ok_or_else(|| InteropError::invalid_argument("mode", format!("unknown collection mode {}", mode)))?;
        s.collect_garbage(CollectOptions {
            generation,
            mode,
            blocking: blocking != 0,
            compacting: compacting != 0,
        });
        Ok(())
    })
}

#[no_mangle]
pub extern "C" fn void_interop_wait_for_pending_finalizers() {
    boundary("wait_for_pending_finalizers", (), |s| {
        s.wait_for_pending_finalizers();
        Ok(())
    })
}

/// Reload containers whose unit files changed; returns how many were reloaded
#[no_mangle]
pub extern "C" fn void_interop_poll_hot_reload() -> i32 {
    boundary("poll_hot_reload", 0, |s| Ok(s.poll_hot_reload() as i32))
}

/// Release an array returned by the bridge
///
/// # Safety
/// `array` must come from a bridge entry point and not have been released.
#[no_mangle]
pub unsafe extern "C" fn void_interop_release_array(array: RawNativeArray) {
    let _ = catch_unwind(AssertUnwindSafe(|| drop(NativeBuffer::from_raw(&array))));
}

/// Free a string returned by the bridge
///
/// # Safety
/// `ptr` must be null or a string returned by the bridge that has not been
/// freed. `encoding` is the bridge's configured string encoding
/// (0 = single-byte, 1 = two-byte).
#[no_mangle]
pub unsafe extern "C" fn void_interop_free_string(ptr: *mut c_void, encoding: i32) {
    let Some(encoding) = StringEncoding::from_raw(encoding) else {
        log::error!("free_string: unknown encoding {}", encoding);
        return;
    };
    let _ = catch_unwind(AssertUnwindSafe(|| drop(NativeString::from_raw(ptr, encoding))));
}
