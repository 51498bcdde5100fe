//! End-to-end scenarios through the public API and the C entry points

use parking_lot::Mutex;
use std::ffi::{c_char, c_void, CStr, CString};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use void_interop::*;

/// Serializes tests that touch the process-wide service and callbacks
static GLOBAL: Mutex<()> = Mutex::new(());

unsafe extern "C" fn double_in_place(args: *const *const c_void, _result: *mut c_void) {
    let raw = *(*args as *const RawNativeArray);
    let data = std::slice::from_raw_parts_mut(raw.address as *mut f32, raw.length as usize);
    for v in data {
        *v *= 2.0;
    }
}

fn plugin_unit() -> UnitBuilder {
    UnitBuilder::new("Plugin")
        .version("0.3.0")
        .with_type(TypeBuilder::structure("Plugin", "Vec2", 8))
        .with_type(TypeBuilder::enumeration("Plugin", "Mode", PrimitiveKind::U8))
        .with_type(
            TypeBuilder::class("Plugin", "Weapon")
                .property("Damage", "f32", Accessibility::Public)
                .property("Owner", "Plugin.Weapon", Accessibility::Internal),
        )
        .with_type(
            TypeBuilder::static_class("Plugin", "Native")
                .static_method("Describe", &["Plugin.Mode", "string"], "string", |args| {
                    Ok(Value::string(format!(
                        "{}:{}",
                        args[0].as_i64().unwrap_or(-1),
                        args[1].as_str().unwrap_or("")
                    )))
                })
                .native_method("DoubleAll", &["f32[]"], "void", double_in_place)
                .fn_ptr_field("OnSpawn")
                .fn_ptr_field("OnDespawn"),
        )
}

fn editor_unit() -> UnitBuilder {
    UnitBuilder::new("Editor").with_type(TypeBuilder::class("Editor", "Gizmo"))
}

struct Fixture {
    _dir: tempfile::TempDir,
    service: InteropService,
    plugin: PathBuf,
    editor: PathBuf,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let plugin = dir.path().join("plugin.unit");
    let editor = dir.path().join("editor.unit");
    std::fs::write(&plugin, b"plugin").unwrap();
    std::fs::write(&editor, b"editor").unwrap();

    let loader = StaticUnitLoader::new();
    loader.register("plugin.unit", plugin_unit);
    loader.register("editor.unit", editor_unit);

    let mut config = BridgeConfig::default();
    config.unload.timeout_ms = 250;
    let service = InteropService::new(config, Arc::new(loader)).unwrap();
    Fixture {
        _dir: dir,
        service,
        plugin,
        editor,
    }
}

fn find_method(service: &InteropService, type_id: Handle, name: &str) -> Arc<MethodDescriptor> {
    service
        .cache()
        .type_methods(type_id)
        .unwrap()
        .into_iter()
        .find(|m| m.name() == name)
        .unwrap()
}

fn type_named(service: &InteropService, ids: &[Handle], full_name: &str) -> Handle {
    *ids.iter()
        .find(|id| service.cache().query_full_name(**id).as_deref() == Some(full_name))
        .unwrap()
}

#[test]
fn load_reports_unit_metadata() {
    let f = fixture();
    let id = f.service.units().load(&f.plugin, "plugins").unwrap();
    assert!(id >= 0);

    let unit = f.service.units().unit(id).unwrap();
    assert_eq!(unit.name(), "Plugin");
    assert_eq!(unit.full_name(), "Plugin, Version=0.3.0");
    assert_eq!(unit.container_name(), "plugins");
    assert_eq!(unit.path(), std::fs::canonicalize(&f.plugin).unwrap());
}

#[test]
fn exported_types_are_cached_once() {
    let f = fixture();
    let unit = f.service.units().load(&f.plugin, "plugins").unwrap();

    let first = f.service.units().exported_types(unit).unwrap();
    let methods = f.service.cache().method_count();
    let properties = f.service.cache().property_count();
    let second = f.service.units().exported_types(unit).unwrap();

    assert_eq!(first.len(), 4);
    assert_eq!(first, second);
    let mut unique = first.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), first.len());
    assert_eq!(f.service.cache().method_count(), methods);
    assert_eq!(f.service.cache().property_count(), properties);
}

#[test]
fn type_queries() {
    let f = fixture();
    let unit = f.service.units().load(&f.plugin, "plugins").unwrap();
    let ids = f.service.units().exported_types(unit).unwrap();
    let cache = f.service.cache();

    let vec2 = cache.type_descriptor(type_named(&f.service, &ids, "Plugin.Vec2")).unwrap();
    assert_eq!(vec2.size(), 8);
    assert!(vec2.attributes().contains(TypeAttributes::SEQUENTIAL_LAYOUT));

    let native = type_named(&f.service, &ids, "Plugin.Native");
    assert_eq!(cache.type_descriptor(native).unwrap().size(), 0);
    assert_eq!(
        cache.query_assembly_qualified_name(native).as_deref(),
        Some("Plugin.Native, Plugin, Version=0.3.0")
    );

    let weapon = type_named(&f.service, &ids, "Plugin.Weapon");
    let properties = cache.type_properties(weapon).unwrap();
    let owner = properties.iter().find(|p| p.name() == "Owner").unwrap();
    assert_eq!(owner.property_type(), weapon);
    assert_eq!(owner.accessibility(), Accessibility::Internal);

    let describe = find_method(&f.service, native, "Describe");
    assert_eq!(describe.display_name(), "Plugin.Native.Describe(Plugin.Mode, string)");
}

#[test]
fn unload_isolates_handles() {
    let f = fixture();
    let plugin = f.service.units().load(&f.plugin, "plugins").unwrap();
    let editor = f.service.units().load(&f.editor, "editor").unwrap();
    let plugin_types = f.service.units().exported_types(plugin).unwrap();
    let editor_types = f.service.units().exported_types(editor).unwrap();
    let native = type_named(&f.service, &plugin_types, "Plugin.Native");
    let describe = find_method(&f.service, native, "Describe").id();

    f.service.units().unload("plugins").unwrap();

    assert!(f.service.units().unit(plugin).is_err());
    for id in &plugin_types {
        assert_eq!(f.service.cache().query_name(*id), None);
        assert_eq!(f.service.cache().query_base_type(*id), None);
    }
    assert!(matches!(
        f.service.cache().invoke_static(describe, &[Value::U8(1), Value::string("x")]),
        Err(InteropError::MethodNotFound(_))
    ));

    assert!(f.service.units().unit(editor).is_ok());
    for id in &editor_types {
        assert!(f.service.cache().query_name(*id).is_some());
    }
    assert!(f.service.wait_for_pending_finalizers());
}

#[test]
fn reload_preserves_paths_not_ids() {
    let f = fixture();
    let units = f.service.units();
    let before = vec![units.load(&f.plugin, "mods").unwrap(), units.load(&f.editor, "mods").unwrap()];
    let old_types = units.exported_types(before[0]).unwrap();

    let after = units.reload("mods").unwrap();
    let paths: Vec<PathBuf> = after.iter().map(|id| units.unit(*id).unwrap().path().to_path_buf()).collect();
    let expected: Vec<PathBuf> = [&f.plugin, &f.editor]
        .iter()
        .map(|p| std::fs::canonicalize(p).unwrap())
        .collect();
    assert_eq!(paths, expected);

    for id in &before {
        assert!(units.unit(*id).is_err());
    }
    for id in &old_types {
        assert!(f.service.cache().query_name(*id).is_none());
    }
    let new_types = units.exported_types(after[0]).unwrap();
    assert!(new_types.iter().all(|id| !old_types.contains(id)));
}

#[test]
fn default_container_is_protected() {
    let f = fixture();
    let id = f.service.units().load(&f.plugin, "default").unwrap();
    let err = f.service.units().unload("default").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
    assert!(f.service.units().unit(id).is_ok());
    assert_eq!(f.service.units().container_state("default"), Some(ContainerState::Active));
}

#[test]
fn upload_is_batch_recoverable() {
    let f = fixture();
    let unit = f.service.units().load(&f.plugin, "plugins").unwrap();
    let ids = f.service.units().exported_types(unit).unwrap();
    let native = type_named(&f.service, &ids, "Plugin.Native");
    let def = Arc::clone(f.service.cache().type_descriptor(native).unwrap().def());

    let uploaded = f
        .service
        .cache()
        .upload_internal_calls(
            native,
            &[
                InternalCall::new("Missing", 0x1000),
                InternalCall::new("OnSpawn", 0),
                InternalCall::new("OnDespawn", 0x2000),
            ],
        )
        .unwrap();
    assert_eq!(uploaded, 1);
    assert_eq!(def.field("OnSpawn").unwrap().get(), 0);
    assert_eq!(def.field("OnDespawn").unwrap().get(), 0x2000);
}

#[test]
fn invoke_marshals_enums_and_strings() {
    let f = fixture();
    let unit = f.service.units().load(&f.plugin, "plugins").unwrap();
    let ids = f.service.units().exported_types(unit).unwrap();
    let native = type_named(&f.service, &ids, "Plugin.Native");
    let describe = find_method(&f.service, native, "Describe").id();

    let mode = 3u8;
    let text = CString::new("blade").unwrap();
    let text_ptr = text.as_ptr();
    let args = [
        &mode as *const u8 as *const c_void,
        &text_ptr as *const *const c_char as *const c_void,
    ];
    let mut out: *mut c_void = std::ptr::null_mut();
    unsafe {
        f.service
            .cache()
            .invoke_static_raw(describe, &mut out as *mut *mut c_void as *mut c_void, args.as_ptr())
            .unwrap();
        assert_eq!(read_native_str(out, StringEncoding::Ansi).as_deref(), Some("3:blade"));
        drop(NativeString::from_raw(out, StringEncoding::Ansi));
    }
}

#[test]
fn blittable_arrays_cross_without_copying() {
    let f = fixture();
    let unit = f.service.units().load(&f.plugin, "plugins").unwrap();
    let ids = f.service.units().exported_types(unit).unwrap();
    let native = type_named(&f.service, &ids, "Plugin.Native");
    let double_all = find_method(&f.service, native, "DoubleAll").id();

    let floats = f.service.core().primitive(PrimitiveKind::F32);
    let array = ManagedArray::from_pod(floats, &[1.0f32, 2.5, -4.0]).unwrap();

    let buffer = array_to_native(&array, StringEncoding::Ansi).unwrap();
    assert_eq!(buffer.owner(), BufferOwner::Bridge);
    assert_eq!(buffer.address() as *const u8, array.storage_ptr());
    drop(buffer);

    let result = f
        .service
        .cache()
        .invoke_static(double_all, &[Value::Array(array.clone())])
        .unwrap();
    assert_eq!(result, Value::Void);
    assert_eq!(array.to_pod::<f32>(), Some(vec![2.0, 5.0, -8.0]));
    assert_eq!(array.pin_count(), 0);
}

#[test]
fn concurrent_queries_and_loads() {
    let f = fixture();
    let service = Arc::new(f.service);
    let plugin = f.plugin.clone();

    let threads: Vec<_> = (0..6)
        .map(|i| {
            let service = Arc::clone(&service);
            let plugin = plugin.clone();
            std::thread::spawn(move || {
                let container = format!("worker{}", i % 2);
                let unit = service.units().load(&plugin, &container).unwrap();
                let ids = service.units().exported_types(unit).unwrap();
                for id in &ids {
                    assert!(service.cache().query_full_name(*id).is_some());
                }
                (container, ids)
            })
        })
        .collect();

    let results: Vec<(String, Vec<Handle>)> = threads.into_iter().map(|t| t.join().unwrap()).collect();
    for (container, ids) in &results {
        for (other_container, other_ids) in &results {
            if container == other_container {
                assert_eq!(ids, other_ids);
            }
        }
    }
}

// C boundary

static LOG_LINES: AtomicUsize = AtomicUsize::new(0);
static ERRORS: AtomicUsize = AtomicUsize::new(0);
static FATAL_ERRORS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn on_log(_level: i32, message: *const c_char) {
    assert!(!message.is_null());
    LOG_LINES.fetch_add(1, Ordering::SeqCst);
}

extern "C" fn on_error(message: *const c_char, is_fatal: u8) {
    let message = unsafe { CStr::from_ptr(message) }.to_string_lossy();
    assert!(!message.is_empty());
    ERRORS.fetch_add(1, Ordering::SeqCst);
    if is_fatal != 0 {
        FATAL_ERRORS.fetch_add(1, Ordering::SeqCst);
    }
}

fn write_config(dir: &Path) -> CString {
    let path = dir.join("interop.toml");
    std::fs::write(
        &path,
        "default_container = \"host\"\n\n[unload]\ntimeout_ms = 100\n",
    )
    .unwrap();
    CString::new(path.to_str().unwrap()).unwrap()
}

#[test]
fn boundary_reports_failures_through_callbacks() {
    let _global = GLOBAL.lock();
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    let ok = unsafe { void_interop_initialize_with_config(Some(on_log), Some(on_error), config.as_ptr()) };
    assert_eq!(ok, 1);
    assert_eq!(void_interop_initialize(Some(on_log), Some(on_error)), 0);

    let errors = ERRORS.load(Ordering::SeqCst);
    let missing = CString::new(dir.path().join("absent.so").to_str().unwrap()).unwrap();
    assert_eq!(unsafe { void_interop_load(missing.as_ptr().cast(), c"plugins".as_ptr().cast()) }, -1);
    assert_eq!(unsafe { void_interop_load(missing.as_ptr().cast(), std::ptr::null()) }, -1);
    unsafe { void_interop_unload(c"host".as_ptr().cast()) };
    unsafe { void_interop_reload(c"nowhere".as_ptr().cast()) };
    assert_eq!(ERRORS.load(Ordering::SeqCst), errors + 4);
    assert_eq!(FATAL_ERRORS.load(Ordering::SeqCst), 0);

    assert_eq!(unsafe { void_interop_upload_internal_calls(77, std::ptr::null(), 0) }, 1);
    assert_eq!(void_interop_get_type_base_type(77), -1);
    assert!(void_interop_get_type_full_name(77).is_null());
    assert!(void_interop_get_type_methods(77).is_null());
    assert!(LOG_LINES.load(Ordering::SeqCst) > 0);

    void_interop_shutdown();
    assert!(!boundary::is_installed());
}

#[test]
fn boundary_serves_an_installed_service() {
    let _global = GLOBAL.lock();
    let f = fixture();
    install_service(Arc::new(f.service)).unwrap();

    let path = CString::new(f.plugin.to_str().unwrap()).unwrap();
    let unit = unsafe { void_interop_load(path.as_ptr().cast(), c"plugins".as_ptr().cast()) };
    assert!(unit >= 0);

    let filepath = void_interop_get_unit_filepath(unit);
    let text = unsafe { CStr::from_ptr(filepath.cast::<c_char>()) }.to_str().unwrap().to_string();
    unsafe { void_interop_free_string(filepath, 0) };
    assert_eq!(PathBuf::from(text), std::fs::canonicalize(&f.plugin).unwrap());

    let types = void_interop_get_exported_types(unit);
    assert_eq!(types.length, 4);
    assert_eq!(types.element_size as usize, std::mem::size_of::<NativeTypeRecord>());
    let records = unsafe { std::slice::from_raw_parts(types.address as *const NativeTypeRecord, 4) };
    let weapon = records
        .iter()
        .find(|r| unsafe { CStr::from_ptr(r.name.cast()) }.to_str() == Ok("Weapon"))
        .unwrap()
        .id;
    unsafe { void_interop_release_array(types) };

    let properties = void_interop_get_type_properties(weapon);
    assert_eq!(properties.length, 2);
    let records = unsafe { std::slice::from_raw_parts(properties.address as *const NativePropertyRecord, 2) };
    assert!(records.iter().all(|r| r.owner_type == weapon));
    unsafe { void_interop_release_array(properties) };

    unsafe { void_interop_reload(c"plugins".as_ptr().cast()) };
    assert!(void_interop_get_unit_name(unit).is_null());
    let reloaded = unsafe { void_interop_get_unit_id(c"Plugin".as_ptr().cast(), c"plugins".as_ptr().cast()) };
    assert!(reloaded >= 0);
    assert_ne!(reloaded, unit);

    void_interop_collect_garbage(0, 0, 1, 0);
    void_interop_wait_for_pending_finalizers();
    void_interop_shutdown();
}
