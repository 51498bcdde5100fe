//! Collection entry points
//!
//! Unit memory is reference counted, so "collecting" means sweeping the
//! drain list for containers whose units have become unreachable. The
//! generation and compaction arguments the host passes are accepted for
//! compatibility and only logged.

use crate::container::UnitManager;

/// How eagerly to collect
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollectionMode {
    #[default]
    Default = 0,
    Forced = 1,
    /// Skip the sweep when nothing is draining
    Optimized = 2,
    Aggressive = 3,
}

impl CollectionMode {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(CollectionMode::Default),
            1 => Some(CollectionMode::Forced),
            2 => Some(CollectionMode::Optimized),
            3 => Some(CollectionMode::Aggressive),
            _ => None,
        }
    }
}

/// Arguments of a collection request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CollectOptions {
    /// Negative means every generation
    pub generation: i32,
    pub mode: CollectionMode,
    /// Wait (bounded) for draining containers to finish
    pub blocking: bool,
    pub compacting: bool,
}

/// Outcome of a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectStats {
    /// Containers that finished draining during this call
    pub completed: usize,
    /// Containers still draining afterwards
    pub pending: usize,
}

/// Sweep drained containers according to `options`
pub fn collect_garbage(units: &UnitManager, options: CollectOptions) -> CollectStats {
    log::trace!(
        "Collect requested (generation {}, {:?}, blocking: {}, compacting: {})",
        options.generation,
        options.mode,
        options.blocking,
        options.compacting
    );

    if options.mode == CollectionMode::Optimized && units.pending_drains() == 0 {
        return CollectStats {
            completed: 0,
            pending: 0,
        };
    }

    let before = units.pending_drains();
    if options.blocking || options.mode == CollectionMode::Aggressive {
        units.wait_for_pending();
    } else {
        units.collect();
    }
    let pending = units.pending_drains();
    CollectStats {
        completed: before.saturating_sub(pending),
        pending,
    }
}

/// Wait, bounded by the unload timeout, for every draining container
pub fn wait_for_pending_finalizers(units: &UnitManager) -> bool {
    units.wait_for_pending()
}
