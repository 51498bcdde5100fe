//! The bridge service
//!
//! Owns the core types, the reflection cache and the unit manager. One
//! instance backs the C entry points; embedders and tests can create their
//! own.

use crate::collector::{self, CollectOptions, CollectStats};
use crate::config::BridgeConfig;
use crate::container::UnitManager;
use crate::error::Result;
use crate::library::DylibLoader;
use crate::reflection::ReflectionCache;
use crate::unit::{CoreTypes, UnitLoader};
use std::sync::Arc;

#[cfg(feature = "hot-reload")]
use crate::hot_reload::HotReloadManager;

/// Reflection cache plus unit lifecycle, configured once
pub struct InteropService {
    config: BridgeConfig,
    core: Arc<CoreTypes>,
    cache: Arc<ReflectionCache>,
    units: UnitManager,
    #[cfg(feature = "hot-reload")]
    hot_reload: HotReloadManager,
}

impl InteropService {
    /// Create a service loading units through `loader`
    pub fn new(config: BridgeConfig, loader: Arc<dyn UnitLoader>) -> Result<Self> {
        let core = Arc::new(CoreTypes::new());
        let cache = Arc::new(ReflectionCache::new(
            Arc::clone(&core),
            config.signature_scheme,
            config.string_encoding,
        ));
        let units = UnitManager::new(
            loader,
            Arc::clone(&cache),
            config.default_container.clone(),
            config.unload.clone(),
        );

        #[cfg(feature = "hot-reload")]
        let hot_reload = if config.hot_reload.enabled {
            HotReloadManager::new(&config.hot_reload)?
        } else {
            HotReloadManager::disabled()
        };

        log::info!(
            "Interop service ready (default container '{}', {:?} strings, {:?} method ids)",
            config.default_container,
            config.string_encoding,
            config.signature_scheme
        );

        Ok(Self {
            config,
            core,
            cache,
            units,
            #[cfg(feature = "hot-reload")]
            hot_reload,
        })
    }

    /// Create a service that loads dynamic libraries
    pub fn with_dylib_loader(config: BridgeConfig) -> Result<Self> {
        Self::new(config, Arc::new(DylibLoader::new()))
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn core(&self) -> &Arc<CoreTypes> {
        &self.core
    }

    pub fn cache(&self) -> &ReflectionCache {
        &self.cache
    }

    pub fn units(&self) -> &UnitManager {
        &self.units
    }

    pub fn collect_garbage(&self, options: CollectOptions) -> CollectStats {
        collector::collect_garbage(&self.units, options)
    }

    pub fn wait_for_pending_finalizers(&self) -> bool {
        collector::wait_for_pending_finalizers(&self.units)
    }

    /// Reload containers whose unit files changed. Returns how many were reloaded.
    pub fn poll_hot_reload(&self) -> usize {
        #[cfg(feature = "hot-reload")]
        {
            self.hot_reload.poll(&self.units).len()
        }
        #[cfg(not(feature = "hot-reload"))]
        {
            0
        }
    }

    /// Drop every container and cached descriptor
    pub fn shutdown(&self) {
        self.units.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::StringEncoding;
    use crate::signature::SignatureScheme;
    use crate::unit::{StaticUnitLoader, TypeBuilder, UnitBuilder};

    #[test]
    fn test_service_wires_config() {
        let config = BridgeConfig::from_toml_str(
            r#"
            default_container = "host"
            string_encoding = "utf16"
            signature_scheme = "legacy"
            "#,
        )
        .unwrap();
        let service = InteropService::new(config, Arc::new(StaticUnitLoader::new())).unwrap();
        assert_eq!(service.units().default_container(), "host");
        assert_eq!(service.cache().string_encoding(), StringEncoding::Utf16);
        assert_eq!(service.config().signature_scheme, SignatureScheme::Legacy);
        assert_eq!(service.poll_hot_reload(), 0);
    }

    #[test]
    fn test_load_cache_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mod.unit");
        std::fs::write(&path, b"mod").unwrap();
        let loader = StaticUnitLoader::new();
        loader.register("mod.unit", || UnitBuilder::new("Mod").with_type(TypeBuilder::class("Mod", "Thing")));

        let service = InteropService::new(BridgeConfig::default(), Arc::new(loader)).unwrap();
        let unit = service.units().load(&path, "mods").unwrap();
        let types = service.units().exported_types(unit).unwrap();
        assert_eq!(service.cache().query_full_name(types[0]).as_deref(), Some("Mod.Thing"));

        service.shutdown();
        assert!(service.cache().query_full_name(types[0]).is_none());
        assert!(service.wait_for_pending_finalizers());
    }
}
