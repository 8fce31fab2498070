//! Storage backends for compiled template modules.
//!
//! Three interchangeable strategies sit behind one trait:
//! - [`memory`]: in-process heap store, single-threaded, no relocation
//! - [`persistent`]: LMDB-backed durable store, multi-process safe
//! - [`shared`]: memory-mapped slot table + arena shared across processes
//!
//! The facade dispatches through [`CacheBackend`]; callers never name a
//! concrete backend after construction.

pub mod memory;
pub mod persistent;
pub mod shared;

use crate::error::CacheError;
use crate::module::format::{CompiledModule, ModuleView};
use crate::stats::CacheStat;

pub use shared::SharedModuleView;

/// Which storage strategy a cache was constructed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    InProcess,
    Persistent,
    SharedMemory,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::InProcess => write!(f, "in-process"),
            BackendKind::Persistent => write!(f, "persistent"),
            BackendKind::SharedMemory => write!(f, "shared-memory"),
        }
    }
}

/// A module obtained from [`CacheBackend::find`].
///
/// The in-process and persistent backends hand out owned copies; the
/// shared-memory backend hands out zero-copy read-only views that must be
/// released exactly once (dropping the handle releases it).
pub enum ModuleHandle {
    Owned(CompiledModule),
    Shared(SharedModuleView),
}

impl ModuleHandle {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ModuleHandle::Owned(module) => module.as_bytes(),
            ModuleHandle::Shared(view) => view.as_bytes(),
        }
    }

    /// Bounds-checked view over the handle's blob.
    pub fn view(&self) -> Result<ModuleView<'_>, CacheError> {
        ModuleView::new(self.as_bytes())
    }
}

/// The operations every backend implements. The facade is a thin dispatch
/// wrapper over this trait.
pub trait CacheBackend: Send {
    fn kind(&self) -> BackendKind;

    /// Install a module under `key`. Re-add behavior is backend-defined.
    fn add(&mut self, key: &str, module: CompiledModule) -> Result<(), CacheError>;

    /// Look up `key`. Corrupt or stale entries count as misses.
    fn find(&mut self, key: &str) -> Result<Option<ModuleHandle>, CacheError>;

    /// Signal that a module obtained from [`CacheBackend::find`] is no
    /// longer in use.
    fn release(&mut self, key: &str, handle: ModuleHandle) -> Result<(), CacheError>;

    /// Apply age/count eviction. Returns the number of entries removed.
    fn gc(&mut self) -> Result<usize, CacheError>;

    /// Remove every entry.
    fn reset(&mut self) -> Result<(), CacheError>;

    /// Read-only counter snapshot.
    fn stat(&self) -> CacheStat;
}
