//! The cache facade.
//!
//! One object, three interchangeable storage strategies picked at
//! construction. The facade holds no cache logic of its own; every call
//! delegates to the installed backend. Dropping the cache releases backend
//! resources (store environments, shared mappings).

use std::path::Path;

use crate::backend::memory::InProcessBackend;
use crate::backend::persistent::PersistentBackend;
use crate::backend::shared::SharedMemoryBackend;
use crate::backend::{BackendKind, CacheBackend, ModuleHandle};
use crate::config::CacheLimits;
use crate::error::CacheError;
use crate::module::format::CompiledModule;
use crate::stats::CacheStat;

pub struct ModuleCache {
    backend: Box<dyn CacheBackend>,
}

impl ModuleCache {
    /// Heap-resident cache for single-threaded, single-process use.
    pub fn in_memory(limits: CacheLimits) -> Self {
        Self {
            backend: Box::new(InProcessBackend::new(limits)),
        }
    }

    /// Durable cache backed by an embedded store file at `path`.
    pub fn persistent(limits: CacheLimits, path: impl AsRef<Path>) -> Result<Self, CacheError> {
        Ok(Self {
            backend: Box::new(PersistentBackend::open(limits, path.as_ref())?),
        })
    }

    /// Cross-process cache in an anonymous shared mapping with a
    /// `total_size`-byte arena and `table_count` hash slots.
    pub fn shared_memory(
        limits: CacheLimits,
        total_size: usize,
        table_count: usize,
    ) -> Result<Self, CacheError> {
        Ok(Self {
            backend: Box::new(SharedMemoryBackend::create(limits, total_size, table_count)?),
        })
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Install a compiled module under `key`.
    pub fn add(&mut self, key: &str, module: CompiledModule) -> Result<(), CacheError> {
        self.backend.add(key, module)
    }

    /// Look up the module cached under `key`.
    pub fn find(&mut self, key: &str) -> Result<Option<ModuleHandle>, CacheError> {
        self.backend.find(key)
    }

    /// Return a module obtained from [`ModuleCache::find`]. Required exactly
    /// once per successful lookup on the shared-memory backend.
    pub fn release(&mut self, key: &str, handle: ModuleHandle) -> Result<(), CacheError> {
        self.backend.release(key, handle)
    }

    /// Apply the configured eviction policy. Returns removed entry count.
    pub fn gc(&mut self) -> Result<usize, CacheError> {
        self.backend.gc()
    }

    /// Drop every cached module.
    pub fn reset(&mut self) -> Result<(), CacheError> {
        self.backend.reset()
    }

    /// Read-only counter snapshot.
    pub fn stat(&self) -> CacheStat {
        self.backend.stat()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::format::ModuleBuilder;
    use crate::module::reloc;

    #[test]
    fn test_facade_delegates() {
        let mut cache = ModuleCache::in_memory(CacheLimits::default());
        assert_eq!(cache.kind(), BackendKind::InProcess);

        let mut builder = ModuleBuilder::new();
        builder.begin_program(0).text("hi").halt();
        let module = builder.finish();

        cache.add("{{x}}", module.clone()).unwrap();
        let handle = cache.find("{{x}}").unwrap().unwrap();
        assert!(reloc::same_content(module.as_bytes(), handle.as_bytes()).unwrap());
        cache.release("{{x}}", handle).unwrap();

        assert_eq!(cache.gc().unwrap(), 0);
        cache.reset().unwrap();
        assert_eq!(cache.stat().current_entries, 0);
    }
}
