//! Containers and the unit manager
//!
//! A container is a named, independently unloadable group of units. The
//! default container always exists and is never collectible. Unloading a
//! container evicts every handle it issued right away, then leaves a drain
//! ticket behind that completes once all of the container's unit anchors
//! have been dropped.
//!
//! ```text
//!   load(path, "plugins") ──► Active ──unload──► Draining ──collect──► gone
//!                               ▲                   │
//!                               └──── reload ◄──────┘  (bounded wait)
//! ```

use crate::config::UnloadConfig;
use crate::error::{InteropError, Result};
use crate::handle::{identity_of, Handle, HandleTable};
use crate::reflection::ReflectionCache;
use crate::types::TypeDef;
use crate::unit::{UnitAnchor, UnitImage, UnitLoader};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// Identifies a container instance. A reloaded container gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(pub u64);

impl ContainerId {
    /// The non-collectible container that also owns the core types
    pub const DEFAULT: ContainerId = ContainerId(0);
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "container#{}", self.0)
    }
}

/// Lifecycle of a container name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// Registered and accepting loads
    Active,
    /// Unloaded; waiting for its units to become unreachable
    Draining,
}

struct Container {
    id: ContainerId,
    collectible: bool,
    units: Vec<Handle>,
}

/// One unit resident in a container
pub struct LoadedUnit {
    id: Handle,
    image: Arc<UnitImage>,
    container: ContainerId,
    container_name: String,
}

impl LoadedUnit {
    pub fn id(&self) -> Handle {
        self.id
    }

    pub fn name(&self) -> &str {
        self.image.name()
    }

    pub fn full_name(&self) -> &str {
        self.image.full_name()
    }

    pub fn path(&self) -> &Path {
        self.image.path()
    }

    pub fn container(&self) -> ContainerId {
        self.container
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn image(&self) -> &Arc<UnitImage> {
        &self.image
    }

    pub fn types(&self) -> &[Arc<TypeDef>] {
        self.image.types()
    }
}

impl fmt::Debug for LoadedUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedUnit")
            .field("id", &self.id)
            .field("full_name", &self.full_name())
            .field("path", &self.path())
            .field("container", &self.container_name)
            .finish()
    }
}

struct DrainTicket {
    id: ContainerId,
    name: String,
    anchors: Vec<Weak<UnitAnchor>>,
    started: Instant,
}

impl DrainTicket {
    fn pending(&self) -> usize {
        self.anchors.iter().filter(|a| a.strong_count() > 0).count()
    }
}

/// What a detached container left behind
struct Detached {
    id: ContainerId,
    paths: Vec<PathBuf>,
    anchors: Vec<Weak<UnitAnchor>>,
}

/// Loads units into containers and tears containers down
pub struct UnitManager {
    loader: Arc<dyn UnitLoader>,
    cache: Arc<ReflectionCache>,
    config: UnloadConfig,
    default_container: String,
    units: HandleTable<LoadedUnit>,
    containers: RwLock<HashMap<String, Container>>,
    next_container: AtomicU64,
    draining: Mutex<Vec<DrainTicket>>,
}

impl UnitManager {
    pub fn new(
        loader: Arc<dyn UnitLoader>,
        cache: Arc<ReflectionCache>,
        default_container: impl Into<String>,
        config: UnloadConfig,
    ) -> Self {
        let default_container = default_container.into();
        let mut containers = HashMap::new();
        containers.insert(
            default_container.clone(),
            Container {
                id: ContainerId::DEFAULT,
                collectible: false,
                units: Vec::new(),
            },
        );
        Self {
            loader,
            cache,
            config,
            default_container,
            units: HandleTable::new("unit"),
            containers: RwLock::new(containers),
            next_container: AtomicU64::new(1),
            draining: Mutex::new(Vec::new()),
        }
    }

    pub fn default_container(&self) -> &str {
        &self.default_container
    }

    pub fn cache(&self) -> &Arc<ReflectionCache> {
        &self.cache
    }

    fn next_container_id(&self) -> ContainerId {
        ContainerId(self.next_container.fetch_add(1, Ordering::Relaxed))
    }

    /// Id of the named container, or a fresh id for creating it. Nothing is
    /// registered until a unit has actually loaded under that id.
    fn resolve_container(&self, name: &str) -> (ContainerId, bool) {
        match self.containers.read().get(name) {
            Some(container) => (container.id, false),
            None => (self.next_container_id(), true),
        }
    }

    fn find_resident(&self, container: ContainerId, path: &Path) -> Option<Handle> {
        let containers = self.containers.read();
        let resident = containers.values().find(|c| c.id == container)?;
        resident
            .units
            .iter()
            .copied()
            .find(|h| self.units.get(*h).is_some_and(|u| u.path() == path))
    }

    fn register(&self, image: Arc<UnitImage>, container: ContainerId, container_name: &str) -> Handle {
        let (id, _) = self.units.add(identity_of(&image), container, |id| LoadedUnit {
            id,
            image,
            container,
            container_name: container_name.to_string(),
        });
        id
    }

    /// Load the unit at `path` into the named container and return its id.
    /// Loading a path that is already resident returns the existing id.
    pub fn load(&self, path: impl AsRef<Path>, container_name: &str) -> Result<Handle> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(InteropError::invalid_argument("filepath", "path is empty"));
        }
        if container_name.is_empty() {
            return Err(InteropError::invalid_argument("container_name", "name is empty"));
        }

        let path = std::fs::canonicalize(path).map_err(|e| InteropError::load_error(path, e.to_string()))?;
        let (mut container, mut fresh) = self.resolve_container(container_name);
        loop {
            if !fresh {
                if let Some(existing) = self.find_resident(container, &path) {
                    log::debug!("Unit '{}' already resident in '{}'", path.display(), container_name);
                    return Ok(existing);
                }
            }

            let image = self.loader.load(&path, container)?;
            let full_name = image.full_name().to_string();

            let mut containers = self.containers.write();
            match containers.get(container_name).map(|c| c.id) {
                Some(id) if id == container => {}
                None if fresh => {
                    containers.insert(
                        container_name.to_string(),
                        Container {
                            id: container,
                            collectible: true,
                            units: Vec::new(),
                        },
                    );
                    log::debug!("Created container '{}' ({})", container_name, container);
                }
                // A concurrent load created the container first; load again into it
                Some(id) if fresh => {
                    drop(containers);
                    drop(image);
                    container = id;
                    fresh = false;
                    continue;
                }
                _ => {
                    return Err(InteropError::InvalidState(format!(
                        "container '{}' was unloaded while '{}' was loading",
                        container_name,
                        path.display()
                    )));
                }
            }
            let Some(resident) = containers.get_mut(container_name) else {
                return Err(InteropError::ContainerNotFound(container_name.to_string()));
            };
            // Another thread loaded the same path first
            if let Some(existing) = resident
                .units
                .iter()
                .copied()
                .find(|h| self.units.get(*h).is_some_and(|u| u.path() == path.as_path()))
            {
                return Ok(existing);
            }
            let id = self.register(image, container, container_name);
            resident.units.push(id);
            drop(containers);

            log::info!("Loaded unit '{}' into '{}' as {}", full_name, container_name, id);
            return Ok(id);
        }
    }

    /// Remove a collectible container from the registry and evict its handles
    fn detach(&self, name: &str) -> Result<Detached> {
        if name.is_empty() {
            return Err(InteropError::invalid_argument("container_name", "name is empty"));
        }
        let container = {
            let mut containers = self.containers.write();
            match containers.get(name) {
                None => return Err(InteropError::ContainerNotFound(name.to_string())),
                Some(c) if !c.collectible => return Err(InteropError::NotCollectible(name.to_string())),
                Some(_) => {}
            }
            match containers.remove(name) {
                Some(container) => container,
                None => return Err(InteropError::ContainerNotFound(name.to_string())),
            }
        };

        let resident: Vec<Arc<LoadedUnit>> = container.units.iter().filter_map(|h| self.units.get(*h)).collect();
        let paths = resident.iter().map(|u| u.path().to_path_buf()).collect();
        let anchors = resident.iter().map(|u| Arc::downgrade(u.image.anchor())).collect();
        drop(resident);

        self.units.evict_owner(container.id);
        self.cache.evict_container(container.id);
        Ok(Detached {
            id: container.id,
            paths,
            anchors,
        })
    }

    /// Unload a container. Handles it issued stop resolving immediately;
    /// its units are released once nothing references them.
    pub fn unload(&self, name: &str) -> Result<()> {
        let detached = self.detach(name)?;
        log::info!(
            "Unloading container '{}' ({} unit(s))",
            name,
            detached.paths.len()
        );
        self.draining.lock().push(DrainTicket {
            id: detached.id,
            name: name.to_string(),
            anchors: detached.anchors,
            started: Instant::now(),
        });
        self.collect();
        Ok(())
    }

    /// Unload a container, wait for its units to become unreachable, then
    /// load every unit that was resident into a fresh container of the same
    /// name. Returns the new unit ids in the original order.
    ///
    /// If the wait times out or any unit fails to load, the container name
    /// is left absent and nothing from the attempt stays registered.
    pub fn reload(&self, name: &str) -> Result<Vec<Handle>> {
        let detached = self.detach(name)?;
        log::info!("Reloading container '{}' ({} unit(s))", name, detached.paths.len());

        if let Err(e) = self.wait_for_anchors(name, &detached.anchors) {
            self.draining.lock().push(DrainTicket {
                id: detached.id,
                name: name.to_string(),
                anchors: detached.anchors,
                started: Instant::now(),
            });
            return Err(e);
        }

        let staging = self.next_container_id();
        let mut images = Vec::with_capacity(detached.paths.len());
        for path in &detached.paths {
            match self.loader.load(path, staging) {
                Ok(image) => images.push(image),
                Err(e) => {
                    log::error!("Reload of '{}' failed at '{}': {}", name, path.display(), e);
                    return Err(e);
                }
            }
        }

        let ids: Vec<Handle> = images
            .into_iter()
            .map(|image| self.register(image, staging, name))
            .collect();

        let mut containers = self.containers.write();
        if containers.contains_key(name) {
            drop(containers);
            self.units.evict_owner(staging);
            return Err(InteropError::InvalidState(format!(
                "container '{}' was recreated during reload",
                name
            )));
        }
        containers.insert(
            name.to_string(),
            Container {
                id: staging,
                collectible: true,
                units: ids.clone(),
            },
        );
        drop(containers);

        log::info!("Reloaded container '{}' as {}", name, staging);
        Ok(ids)
    }

    /// Poll until every anchor is dead, sweeping between polls. Holds no
    /// locks while sleeping.
    fn wait_for_anchors(&self, name: &str, anchors: &[Weak<UnitAnchor>]) -> Result<()> {
        let deadline = Instant::now() + self.config.timeout();
        loop {
            let pending = anchors.iter().filter(|a| a.strong_count() > 0).count();
            if pending == 0 {
                return Ok(());
            }
            self.collect();
            if Instant::now() >= deadline {
                return Err(InteropError::UnloadTimeout {
                    container: name.to_string(),
                    pending,
                });
            }
            std::thread::sleep(self.config.poll_interval());
        }
    }

    /// Complete every drain whose units have become unreachable. Returns the
    /// number of containers that finished.
    pub fn collect(&self) -> usize {
        let mut draining = self.draining.lock();
        let before = draining.len();
        draining.retain(|ticket| {
            if ticket.pending() > 0 {
                return true;
            }
            log::info!(
                "Container '{}' ({}) unloaded after {:?}",
                ticket.name,
                ticket.id,
                ticket.started.elapsed()
            );
            false
        });
        before - draining.len()
    }

    /// Number of containers still draining
    pub fn pending_drains(&self) -> usize {
        self.draining.lock().len()
    }

    /// Wait, bounded by the unload timeout, for every draining container to
    /// finish. Returns whether nothing is left pending.
    pub fn wait_for_pending(&self) -> bool {
        let deadline = Instant::now() + self.config.timeout();
        loop {
            self.collect();
            let remaining = self.pending_drains();
            if remaining == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                log::warn!("{} container(s) still draining after {:?}", remaining, self.config.timeout());
                return false;
            }
            std::thread::sleep(self.config.poll_interval());
        }
    }

    pub fn unit(&self, id: Handle) -> Result<Arc<LoadedUnit>> {
        self.units.get(id).ok_or(InteropError::UnitNotFound(id))
    }

    /// Id of the unit with short name `unit_name` resident in `container_name`
    pub fn unit_id(&self, unit_name: &str, container_name: &str) -> Option<Handle> {
        let containers = self.containers.read();
        let container = containers.get(container_name)?;
        container
            .units
            .iter()
            .copied()
            .find(|h| self.units.get(*h).is_some_and(|u| u.name() == unit_name))
    }

    /// Cache every type the unit declares and return their ids
    pub fn exported_types(&self, unit_id: Handle) -> Result<Vec<Handle>> {
        let unit = self.unit(unit_id)?;
        unit.types().iter().map(|t| self.cache.cache_type(t)).collect()
    }

    pub fn container_state(&self, name: &str) -> Option<ContainerState> {
        if self.containers.read().contains_key(name) {
            return Some(ContainerState::Active);
        }
        self.draining
            .lock()
            .iter()
            .any(|t| t.name == name)
            .then_some(ContainerState::Draining)
    }

    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.containers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn container_units(&self, name: &str) -> Result<Vec<Handle>> {
        self.containers
            .read()
            .get(name)
            .map(|c| c.units.clone())
            .ok_or_else(|| InteropError::ContainerNotFound(name.to_string()))
    }

    /// Name of the container holding the unit loaded from `path`
    pub fn container_of_path(&self, path: &Path) -> Option<String> {
        self.units
            .values()
            .into_iter()
            .find(|u| u.path() == path)
            .map(|u| u.container_name.clone())
    }

    /// Paths of every resident unit
    pub fn resident_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.units.values().iter().map(|u| u.path().to_path_buf()).collect();
        paths.sort();
        paths.dedup();
        paths
    }

    /// Drop every container and unit, leaving an empty default container
    pub fn shutdown(&self) {
        let containers: Vec<(String, Container)> = self.containers.write().drain().collect();
        let mut draining = self.draining.lock();
        for (name, container) in containers {
            let anchors: Vec<Weak<UnitAnchor>> = container
                .units
                .iter()
                .filter_map(|h| self.units.get(*h))
                .map(|u| Arc::downgrade(u.image.anchor()))
                .collect();
            if !anchors.is_empty() {
                draining.push(DrainTicket {
                    id: container.id,
                    name,
                    anchors,
                    started: Instant::now(),
                });
            }
        }
        drop(draining);

        self.units.clear();
        self.cache.clear();
        self.containers.write().insert(
            self.default_container.clone(),
            Container {
                id: ContainerId::DEFAULT,
                collectible: false,
                units: Vec::new(),
            },
        );
        self.collect();
        log::info!("Unit manager shut down");
    }
}
