//! # void_interop - Native/Managed Interop Bridge
//!
//! Lets a native host load code units at runtime, inspect their types,
//! call their static methods with native argument buffers, and unload them
//! again without restarting.
//!
//! ## Overview
//!
//! Units are loaded into named containers. Every type, method and property
//! the host asks about gets a stable 32-bit handle from the reflection
//! cache. Values cross the boundary through the codec (primitives, strings,
//! enums, flat structs) and the marshaller (arrays, pinned in place when
//! their elements are blittable). Unloading a container evicts every handle
//! it issued; its units are released once nothing references them.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐
//! │   Native Host   │────▶│  C entry points │
//! │ (engine, C/C++) │     │  (exports.rs)   │
//! └─────────────────┘     └────────┬────────┘
//!                                  │
//!                                  ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │   UnitManager   │◀────│ InteropService  │
//! │  (containers)   │     │                 │
//! └────────┬────────┘     └────────┬────────┘
//!          │ load                  │ query / invoke
//!          ▼                       ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │   UnitLoader    │     │ ReflectionCache │──▶ HandleTable
//! │ (dylib, static) │     │                 │──▶ marshal / codec
//! └─────────────────┘     └─────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use void_interop::prelude::*;
//!
//! let service = InteropService::with_dylib_loader(BridgeConfig::default())?;
//! let unit = service.units().load("plugins/libgame.so", "plugins")?;
//! for type_id in service.units().exported_types(unit)? {
//!     println!("{:?}", service.cache().query_full_name(type_id));
//! }
//!
//! // Handles from "plugins" stop resolving here
//! service.units().unload("plugins")?;
//! ```
//!
//! ## Native Side
//!
//! A dynamic unit exports its manifest:
//!
//! ```c
//! #include "void_interop.h"
//!
//! static const FfiTypeInfo TYPES[] = { /* ... */ };
//! static const FfiUnitManifest MANIFEST = {
//!     VOID_INTEROP_API_VERSION, "Game", "1.0.0", 1, TYPES
//! };
//!
//! const FfiUnitManifest* void_interop_unit_manifest(void) { return &MANIFEST; }
//! ```

mod callbacks;
mod codec;
mod collector;
mod config;
mod container;
mod error;
mod exports;
mod ffi;
mod handle;
mod library;
mod marshal;
mod reflection;
mod service;
mod signature;
mod types;
mod unit;
mod value;

#[cfg(feature = "hot-reload")]
mod hot_reload;

pub use callbacks::{BoundaryCallbacks, BoundaryLogger, ErrorCallback, LogCallback, LogLevel};
pub use codec::{decode_inline, encode_inline, read_native_str, read_value, write_value, NativeString, StringEncoding, Written};
pub use collector::{collect_garbage, wait_for_pending_finalizers, CollectOptions, CollectStats, CollectionMode};
pub use config::{BridgeConfig, HotReloadSettings, UnloadConfig, CONFIG_ENV_VAR};
pub use container::{ContainerId, ContainerState, LoadedUnit, UnitManager};
pub use error::{ErrorKind, InteropError, Result};
pub use exports::*;
pub use ffi::*;
pub use handle::{Handle, HandleTable};
pub use library::{builder_from_manifest, enum_underlying, DylibLoader};
pub use marshal::{
    array_from_native, array_to_native, object_from_native, object_to_native, BufferOwner, ElementManifest, Marshalled,
    NativeBuffer, RawNativeArray,
};
pub use reflection::{InternalCall, MethodDescriptor, PropertyDescriptor, ReflectionCache, TypeDescriptor};
pub use service::InteropService;
pub use signature::SignatureScheme;
pub use types::{
    Accessibility, MethodBody, MethodDef, NativeThunk, PrimitiveKind, PropertyDef, StaticField, TypeAttributes, TypeDef,
    TypeKind, TypeRef,
};
pub use unit::{CoreTypes, StaticUnitLoader, TypeBuilder, UnitAnchor, UnitBuilder, UnitImage, UnitLoader};
pub use value::{ManagedArray, PinnedView, Value};

/// Boundary callback control, for hosts embedding the bridge directly
pub mod boundary {
    pub use crate::callbacks::{emit_error, emit_log, install, is_installed, report, report_with, reset};
}

#[cfg(feature = "hot-reload")]
pub use hot_reload::HotReloadManager;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::BridgeConfig;
    pub use crate::container::{ContainerId, UnitManager};
    pub use crate::error::{InteropError, Result};
    pub use crate::handle::Handle;
    pub use crate::reflection::{InternalCall, ReflectionCache};
    pub use crate::service::InteropService;
    pub use crate::types::{PrimitiveKind, TypeDef, TypeRef};
    pub use crate::unit::{CoreTypes, StaticUnitLoader, TypeBuilder, UnitBuilder, UnitLoader};
    pub use crate::value::{ManagedArray, Value};

    #[cfg(feature = "hot-reload")]
    pub use crate::hot_reload::HotReloadManager;
}
