//! Hot-reload support for code units
//!
//! Watches the files of resident units and reloads the owning container once
//! changes have settled. The host drives it by calling [`HotReloadManager::poll`]
//! (through `void_interop_poll_hot_reload`) from its own loop.

use crate::config::HotReloadSettings;
use crate::container::UnitManager;
use crate::error::{InteropError, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::time::{Duration, Instant};

/// Reloads containers whose unit files changed
pub struct HotReloadManager {
    /// Wait for file changes to settle
    debounce: Duration,
    watcher: Option<Mutex<RecommendedWatcher>>,
    event_receiver: Option<Mutex<Receiver<notify::Result<Event>>>>,
    /// Unit files being watched
    watched_units: RwLock<HashSet<PathBuf>>,
    /// Directories registered with the watcher
    watched_dirs: RwLock<HashSet<PathBuf>>,
    /// Changed unit files (path -> time detected)
    pending_reloads: RwLock<HashMap<PathBuf, Instant>>,
}

impl HotReloadManager {
    /// Create a manager with a live file watcher
    pub fn new(settings: &HotReloadSettings) -> Result<Self> {
        let (tx, rx) = channel();

        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })
        .map_err(|e| InteropError::HotReloadFailed(e.to_string()))?;

        Ok(Self {
            debounce: settings.debounce(),
            watcher: Some(Mutex::new(watcher)),
            event_receiver: Some(Mutex::new(rx)),
            watched_units: RwLock::new(HashSet::new()),
            watched_dirs: RwLock::new(HashSet::new()),
            pending_reloads: RwLock::new(HashMap::new()),
        })
    }

    /// Create a disabled manager
    pub fn disabled() -> Self {
        Self {
            debounce: HotReloadSettings::default().debounce(),
            watcher: None,
            event_receiver: None,
            watched_units: RwLock::new(HashSet::new()),
            watched_dirs: RwLock::new(HashSet::new()),
            pending_reloads: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.watcher.is_some()
    }

    /// Start watching a unit file
    pub fn watch_unit(&self, path: impl AsRef<Path>) -> Result<()> {
        let Some(watcher) = &self.watcher else {
            return Ok(());
        };
        let path = path.as_ref().to_path_buf();
        if !self.watched_units.write().insert(path.clone()) {
            return Ok(());
        }

        if let Some(dir) = path.parent() {
            if self.watched_dirs.write().insert(dir.to_path_buf()) {
                watcher
                    .lock()
                    .watch(dir, RecursiveMode::NonRecursive)
                    .map_err(|e| InteropError::HotReloadFailed(e.to_string()))?;
            }
        }

        log::debug!("Watching unit for hot-reload: {}", path.display());
        Ok(())
    }

    /// Stop watching a unit file
    pub fn unwatch_unit(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        self.watched_units.write().remove(path);
        self.pending_reloads.write().remove(path);
    }

    /// Queue a reload as if the file had changed
    pub fn trigger_reload(&self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        if self.watched_units.read().contains(&path) {
            self.pending_reloads.write().insert(path, Instant::now());
        }
    }

    pub fn pending_units(&self) -> Vec<PathBuf> {
        self.pending_reloads.read().keys().cloned().collect()
    }

    pub fn watched_units(&self) -> Vec<PathBuf> {
        self.watched_units.read().iter().cloned().collect()
    }

    /// Watch newly resident units, drain file events, and reload every
    /// container with a settled change. Returns the reloaded container names.
    pub fn poll(&self, units: &UnitManager) -> Vec<String> {
        if !self.is_enabled() {
            return Vec::new();
        }

        for path in units.resident_paths() {
            if let Err(e) = self.watch_unit(&path) {
                log::warn!("Cannot watch '{}': {}", path.display(), e);
            }
        }

        if let Some(rx) = &self.event_receiver {
            let rx = rx.lock();
            while let Ok(result) = rx.try_recv() {
                match result {
                    Ok(event) => self.handle_event(&event),
                    Err(e) => log::warn!("File watcher error: {}", e),
                }
            }
        }

        let now = Instant::now();
        let due: Vec<PathBuf> = self
            .pending_reloads
            .read()
            .iter()
            .filter(|(_, time)| now.duration_since(**time) >= self.debounce)
            .map(|(path, _)| path.clone())
            .collect();
        if due.is_empty() {
            return Vec::new();
        }

        let mut containers = BTreeSet::new();
        for path in &due {
            self.pending_reloads.write().remove(path);
            match units.container_of_path(path) {
                Some(name) => {
                    containers.insert(name);
                }
                None => {
                    self.watched_units.write().remove(path);
                }
            }
        }

        let mut reloaded = Vec::new();
        for name in containers {
            if name == units.default_container() {
                log::warn!("Ignoring change to unit in non-collectible container '{}'", name);
                continue;
            }
            match units.reload(&name) {
                Ok(ids) => {
                    log::info!("Hot-reloaded container '{}' ({} unit(s))", name, ids.len());
                    reloaded.push(name);
                }
                Err(e) => log::error!("Failed to hot-reload container '{}': {}", name, e),
            }
        }
        reloaded
    }

    fn handle_event(&self, event: &Event) {
        if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
            return;
        }
        for path in &event.paths {
            if self.watched_units.read().contains(path) {
                self.pending_reloads.write().insert(path.clone(), Instant::now());
                log::debug!("Detected change in unit: {}", path.display());
            }
        }
    }
}

impl Drop for HotReloadManager {
    fn drop(&mut self) {
        log::debug!("Shutting down unit hot-reload manager");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::StringEncoding;
    use crate::config::UnloadConfig;
    use crate::reflection::ReflectionCache;
    use crate::signature::SignatureScheme;
    use crate::unit::{CoreTypes, StaticUnitLoader, TypeBuilder, UnitBuilder};
    use std::sync::Arc;

    fn manager() -> (tempfile::TempDir, UnitManager, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mod.unit");
        std::fs::write(&path, b"v1").unwrap();
        let loader = StaticUnitLoader::new();
        loader.register("mod.unit", || UnitBuilder::new("Mod").with_type(TypeBuilder::class("Mod", "Thing")));
        let cache = Arc::new(ReflectionCache::new(
            Arc::new(CoreTypes::new()),
            SignatureScheme::Ordered,
            StringEncoding::Ansi,
        ));
        let units = UnitManager::new(Arc::new(loader), cache, "default", UnloadConfig::default());
        (dir, units, path)
    }

    #[test]
    fn test_disabled_manager() {
        let (_dir, units, path) = manager();
        let hot = HotReloadManager::disabled();
        assert!(!hot.is_enabled());
        hot.watch_unit(&path).unwrap();
        assert!(hot.watched_units().is_empty());
        assert!(hot.poll(&units).is_empty());
    }

    #[test]
    fn test_triggered_reload() {
        let (_dir, units, path) = manager();
        let before = units.load(&path, "mods").unwrap();
        let resident = units.unit(before).unwrap().path().to_path_buf();

        let hot = HotReloadManager::new(&HotReloadSettings {
            enabled: true,
            debounce_ms: 0,
        })
        .unwrap();
        assert!(hot.poll(&units).is_empty());
        assert_eq!(hot.watched_units(), vec![resident.clone()]);

        hot.trigger_reload(&resident);
        assert_eq!(hot.pending_units(), vec![resident.clone()]);
        assert_eq!(hot.poll(&units), vec!["mods".to_string()]);
        assert!(hot.pending_units().is_empty());

        let after = units.unit_id("Mod", "mods").unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_unknown_path_is_not_queued() {
        let hot = HotReloadManager::disabled();
        hot.trigger_reload("/nowhere/mod.unit");
        assert!(hot.pending_units().is_empty());
    }
}
