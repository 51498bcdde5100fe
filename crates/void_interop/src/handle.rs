//! Handle tables
//!
//! Maps stable positive 32-bit handles to shared entries. Each entry is
//! keyed by the identity of the object it describes, so adding the same
//! object twice returns the existing handle. Keys that collide are probed
//! forward to the next unused value; keys released by eviction are retired
//! and never issued again.

use crate::container::ContainerId;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Opaque handle given to native code
pub type Handle = i32;

/// Address-based identity of a shared object
pub fn identity_of<T: ?Sized>(value: &Arc<T>) -> usize {
    Arc::as_ptr(value) as *const () as usize
}

/// Identity of a member living inside a shared parent
pub fn identity_of_ref<T>(value: &T) -> usize {
    value as *const T as usize
}

/// Preferred key for an identity when there is no better hash
pub fn identity_hash(identity: usize) -> i32 {
    // splitmix64 finaliser
    let mut x = identity as u64;
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^= x >> 31;
    (x ^ (x >> 32)) as i32
}

fn normalize(key: i32) -> i32 {
    match key & i32::MAX {
        0 => 1,
        k => k,
    }
}

fn next_key(key: i32) -> i32 {
    if key == i32::MAX {
        1
    } else {
        key + 1
    }
}

struct Entry<T> {
    identity: usize,
    owner: ContainerId,
    value: Arc<T>,
}

struct TableInner<T> {
    entries: HashMap<Handle, Entry<T>>,
    by_identity: HashMap<usize, Handle>,
    /// Keys are hashed, so retired keys are scattered over the whole range
    /// and cannot be folded into a high-water mark. The set costs one slot
    /// per evicted handle for the life of the table; a host that reloads
    /// the same units for hours pays for every generation it drops.
    retired: HashSet<Handle>,
}

/// Thread-safe identity-deduplicating handle table
pub struct HandleTable<T> {
    name: &'static str,
    inner: RwLock<TableInner<T>>,
}

impl<T> HandleTable<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: RwLock::new(TableInner {
                entries: HashMap::new(),
                by_identity: HashMap::new(),
                retired: HashSet::new(),
            }),
        }
    }

    /// Insert the entry for `identity` unless one exists. `build` receives
    /// the handle the entry will be stored under. Returns the handle and
    /// whether a new entry was created.
    pub fn add_with(
        &self,
        identity: usize,
        preferred: i32,
        owner: ContainerId,
        build: impl FnOnce(Handle) -> T,
    ) -> (Handle, bool) {
        let (handle, _, created) = self.add_entry(identity, preferred, owner, build);
        (handle, created)
    }

    /// Like [`add_with`](Self::add_with), also returning the stored entry.
    /// The entry is the one the table held at insertion time, even if it
    /// has been evicted since.
    pub fn add_entry(
        &self,
        identity: usize,
        preferred: i32,
        owner: ContainerId,
        build: impl FnOnce(Handle) -> T,
    ) -> (Handle, Arc<T>, bool) {
        if let Some(found) = Self::existing(&self.inner.read(), identity) {
            return found;
        }

        let mut inner = self.inner.write();
        if let Some(found) = Self::existing(&inner, identity) {
            return found;
        }

        let preferred = normalize(preferred);
        let mut key = preferred;
        while inner.entries.contains_key(&key) || inner.retired.contains(&key) {
            key = next_key(key);
        }
        if key != preferred {
            log::warn!(
                "{} handle {} already taken, issuing {} instead",
                self.name,
                preferred,
                key
            );
        }

        let value = Arc::new(build(key));
        inner.entries.insert(
            key,
            Entry {
                identity,
                owner,
                value: Arc::clone(&value),
            },
        );
        inner.by_identity.insert(identity, key);
        (key, value, true)
    }

    fn existing(inner: &TableInner<T>, identity: usize) -> Option<(Handle, Arc<T>, bool)> {
        let handle = *inner.by_identity.get(&identity)?;
        let entry = inner.entries.get(&handle)?;
        Some((handle, Arc::clone(&entry.value), false))
    }

    /// Insert keyed by a hash of the identity
    pub fn add(&self, identity: usize, owner: ContainerId, build: impl FnOnce(Handle) -> T) -> (Handle, bool) {
        self.add_with(identity, identity_hash(identity), owner, build)
    }

    pub fn get(&self, handle: Handle) -> Option<Arc<T>> {
        self.inner.read().entries.get(&handle).map(|e| Arc::clone(&e.value))
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.inner.read().entries.contains_key(&handle)
    }

    /// Handle already issued for an identity
    pub fn lookup(&self, identity: usize) -> Option<Handle> {
        self.inner.read().by_identity.get(&identity).copied()
    }

    /// Snapshot of every entry
    pub fn values(&self) -> Vec<Arc<T>> {
        self.inner.read().entries.values().map(|e| Arc::clone(&e.value)).collect()
    }

    pub fn handles_owned_by(&self, owner: ContainerId) -> Vec<Handle> {
        let inner = self.inner.read();
        let mut handles: Vec<Handle> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.owner == owner)
            .map(|(k, _)| *k)
            .collect();
        handles.sort_unstable();
        handles
    }

    /// Drop every entry owned by `owner`. Returns the number removed.
    pub fn evict_owner(&self, owner: ContainerId) -> usize {
        let removed: Vec<Entry<T>> = {
            let mut inner = self.inner.write();
            let keys: Vec<Handle> = inner
                .entries
                .iter()
                .filter(|(_, e)| e.owner == owner)
                .map(|(k, _)| *k)
                .collect();
            let mut removed = Vec::with_capacity(keys.len());
            for key in keys {
                if let Some(entry) = inner.entries.remove(&key) {
                    inner.by_identity.remove(&entry.identity);
                    inner.retired.insert(key);
                    removed.push(entry);
                }
            }
            removed
        };
        if !removed.is_empty() {
            log::debug!(
                "Evicted {} {} handle(s) owned by {:?} ({} retired in total)",
                removed.len(),
                self.name,
                owner,
                self.retired_len()
            );
        }
        // Entries drop here, outside the lock
        removed.len()
    }

    /// Drop every entry
    pub fn clear(&self) {
        let drained: Vec<Entry<T>> = {
            let mut inner = self.inner.write();
            let inner = &mut *inner;
            inner.by_identity.clear();
            let drained: Vec<(Handle, Entry<T>)> = inner.entries.drain().collect();
            inner.retired.extend(drained.iter().map(|(k, _)| *k));
            drained.into_iter().map(|(_, e)| e).collect()
        };
        drop(drained);
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Number of keys that can never be issued again
    pub fn retired_len(&self) -> usize {
        self.inner.read().retired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: ContainerId = ContainerId(1);
    const B: ContainerId = ContainerId(2);

    #[test]
    fn test_same_identity_same_handle() {
        let table = HandleTable::new("test");
        let (h1, new1) = table.add_with(100, 42, A, |_| "first");
        let (h2, new2) = table.add_with(100, 99, A, |_| "second");
        assert_eq!(h1, 42);
        assert_eq!(h1, h2);
        assert!(new1);
        assert!(!new2);
        assert_eq!(*table.get(h1).unwrap(), "first");
    }

    #[test]
    fn test_collision_probes_to_unique_key() {
        let table = HandleTable::new("test");
        let (h1, _) = table.add_with(1, 7, A, |_| 1);
        let (h2, _) = table.add_with(2, 7, A, |_| 2);
        assert_eq!(h1, 7);
        assert_ne!(h1, h2);
        assert_eq!(*table.get(h2).unwrap(), 2);
    }

    #[test]
    fn test_handles_are_positive() {
        let table = HandleTable::new("test");
        let (h0, _) = table.add_with(1, 0, A, |_| ());
        let (hn, _) = table.add_with(2, -5, A, |_| ());
        let (hmax, _) = table.add_with(3, i32::MAX, A, |_| ());
        let (wrapped, _) = table.add_with(4, i32::MAX, A, |_| ());
        for h in [h0, hn, hmax, wrapped] {
            assert!(h > 0);
        }
        assert_eq!(hmax, i32::MAX);
        assert_ne!(wrapped, hmax);
    }

    #[test]
    fn test_build_receives_final_key() {
        let table = HandleTable::new("test");
        table.add_with(1, 5, A, |k| k);
        let (h, _) = table.add_with(2, 5, A, |k| k);
        assert_eq!(*table.get(h).unwrap(), h);
    }

    #[test]
    fn test_evict_owner_retires_keys() {
        let table = HandleTable::new("test");
        let (a, _) = table.add_with(1, 10, A, |_| "a");
        let (b, _) = table.add_with(2, 20, B, |_| "b");

        assert_eq!(table.evict_owner(A), 1);
        assert!(table.get(a).is_none());
        assert!(table.get(b).is_some());
        assert_eq!(table.lookup(1), None);

        // Same identity and preferred key after eviction gets a fresh handle
        let (again, new) = table.add_with(1, 10, A, |_| "a2");
        assert!(new);
        assert_ne!(again, a);
    }

    #[test]
    fn test_clear() {
        let table = HandleTable::new("test");
        let (h, _) = table.add_with(1, 3, A, |_| ());
        table.clear();
        assert!(table.is_empty());
        let (h2, _) = table.add_with(1, 3, A, |_| ());
        assert_ne!(h, h2);
    }

    #[test]
    fn test_identity_hash_spreads() {
        assert_ne!(identity_hash(0x1000), identity_hash(0x1008));
    }

    #[test]
    fn test_concurrent_adds_dedupe() {
        let table = Arc::new(HandleTable::new("test"));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || table.add_with(77, 77, A, |_| ()).0)
            })
            .collect();
        let handles: Vec<Handle> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        assert!(handles.iter().all(|h| *h == 77));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_add_entry_returns_stored_value() {
        let table = HandleTable::new("test");
        let (h, first, created) = table.add_entry(5, 5, A, |k| k * 2);
        assert!(created);
        assert_eq!(*first, 10);

        let (again, second, created) = table.add_entry(5, 9, A, |_| 0);
        assert!(!created);
        assert_eq!(again, h);
        assert!(Arc::ptr_eq(&first, &second));

        // Survives eviction for whoever already holds it
        table.evict_owner(A);
        assert_eq!(*first, 10);
        assert!(table.get(h).is_none());
    }

    #[test]
    fn test_retired_keys_accumulate_across_generations() {
        let table = HandleTable::new("test");
        let mut seen = HashSet::new();
        for generation in 0..5 {
            for identity in 0..4 {
                let (h, _) = table.add_with(identity, 100 + identity as i32, A, |_| generation);
                assert!(seen.insert(h), "handle {} issued twice", h);
            }
            assert_eq!(table.evict_owner(A), 4);
            assert_eq!(table.retired_len(), (generation + 1) * 4);
        }
        assert!(table.is_empty());
    }
}
