//! In-process heap backend.
//!
//! Modules stay on the local heap, so no relocation boundary is crossed on
//! the way in. Lookups hand out patched copies. No internal locking; the
//! owner is expected to be a single thread.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::backend::{BackendKind, CacheBackend, ModuleHandle};
use crate::config::CacheLimits;
use crate::error::CacheError;
use crate::module::format::CompiledModule;
use crate::module::reloc;
use crate::stats::CacheStat;

struct Entry {
    module: CompiledModule,
    timestamp: u64,
    /// Insertion order; count-based eviction keeps the highest.
    seq: u64,
}

pub struct InProcessBackend {
    limits: CacheLimits,
    entries: HashMap<String, Entry>,
    next_seq: u64,
    total_size: u64,
    current_size: u64,
    total_entries: u64,
    hits: u64,
    misses: u64,
}

impl InProcessBackend {
    pub fn new(limits: CacheLimits) -> Self {
        Self {
            limits,
            entries: HashMap::new(),
            next_seq: 0,
            total_size: 0,
            current_size: 0,
            total_entries: 0,
            hits: 0,
            misses: 0,
        }
    }

    fn remove_entry(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.current_size = self
                .current_size
                .saturating_sub(entry.module.len() as u64);
            debug!(key, "Evicted module");
        }
    }
}

impl CacheBackend for InProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::InProcess
    }

    fn add(&mut self, key: &str, module: CompiledModule) -> Result<(), CacheError> {
        if self.entries.contains_key(key) {
            return Err(CacheError::AlreadyCached(key.to_string()));
        }

        let size = module.len() as u64;
        let timestamp = module.header().timestamp;
        let seq = self.next_seq;
        self.next_seq += 1;

        self.entries.insert(
            key.to_string(),
            Entry {
                module,
                timestamp,
                seq,
            },
        );
        self.total_size += size;
        self.current_size += size;
        self.total_entries += 1;
        debug!(key, size, "Cached module");
        Ok(())
    }

    fn find(&mut self, key: &str) -> Result<Option<ModuleHandle>, CacheError> {
        match self.entries.get(key) {
            Some(entry) => {
                // The copy moves to a fresh allocation, so rebase it there.
                let mut module = entry.module.clone();
                reloc::patch(&mut module)?;
                self.hits += 1;
                Ok(Some(ModuleHandle::Owned(module)))
            }
            None => {
                self.misses += 1;
                Ok(None)
            }
        }
    }

    fn release(&mut self, _key: &str, handle: ModuleHandle) -> Result<(), CacheError> {
        drop(handle);
        Ok(())
    }

    fn gc(&mut self) -> Result<usize, CacheError> {
        let mut removed = 0;

        if self.limits.max_age_secs >= 0 {
            let stale: Vec<String> = self
                .entries
                .iter()
                .filter(|(_, e)| self.limits.expired(e.timestamp))
                .map(|(k, _)| k.clone())
                .collect();
            for key in stale {
                self.remove_entry(&key);
                removed += 1;
            }
        }

        if self.limits.max_entries > 0 && self.entries.len() > self.limits.max_entries {
            // Keep the most recently added entries.
            let mut by_age: Vec<(String, u64)> = self
                .entries
                .iter()
                .map(|(k, e)| (k.clone(), e.seq))
                .collect();
            by_age.sort_by_key(|(_, seq)| *seq);
            let excess = self.entries.len() - self.limits.max_entries;
            for (key, _) in by_age.into_iter().take(excess) {
                self.remove_entry(&key);
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, remaining = self.entries.len(), "GC round complete");
        }
        Ok(removed)
    }

    fn reset(&mut self) -> Result<(), CacheError> {
        self.entries.clear();
        self.current_size = 0;
        Ok(())
    }

    fn stat(&self) -> CacheStat {
        CacheStat {
            total_size: self.total_size,
            current_size: self.current_size,
            total_entries: self.total_entries,
            current_entries: self.entries.len() as u64,
            hits: self.hits,
            misses: self.misses,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::format::{unix_now, ModuleBuilder};

    fn module_with(text: &str, timestamp: u64) -> CompiledModule {
        let mut builder = ModuleBuilder::new();
        builder.timestamp(timestamp);
        builder.begin_program(0).text(text).halt();
        builder.finish()
    }

    #[test]
    fn test_add_find_round_trip() {
        let mut backend = InProcessBackend::new(CacheLimits::default());
        let module = module_with("hi", unix_now());
        backend.add("{{greeting}}", module.clone()).unwrap();

        let handle = backend.find("{{greeting}}").unwrap().unwrap();
        assert!(reloc::same_content(module.as_bytes(), handle.as_bytes()).unwrap());
        backend.release("{{greeting}}", handle).unwrap();

        let stat = backend.stat();
        assert_eq!(stat.hits, 1);
        assert_eq!(stat.current_entries, 1);
    }

    #[test]
    fn test_re_add_is_an_error() {
        let mut backend = InProcessBackend::new(CacheLimits::default());
        let module = module_with("x", unix_now());
        backend.add("k", module.clone()).unwrap();
        assert!(matches!(
            backend.add("k", module),
            Err(CacheError::AlreadyCached(_))
        ));
    }

    #[test]
    fn test_miss_counts_without_touching_entries() {
        let mut backend = InProcessBackend::new(CacheLimits::default());
        assert!(backend.find("absent").unwrap().is_none());
        let stat = backend.stat();
        assert_eq!(stat.misses, 1);
        assert_eq!(stat.current_entries, 0);
    }

    #[test]
    fn test_age_gc() {
        let limits = CacheLimits {
            max_age_secs: 100,
            ..Default::default()
        };
        let mut backend = InProcessBackend::new(limits);
        let now = unix_now();
        backend.add("old", module_with("a", now - 500)).unwrap();
        backend.add("fresh", module_with("b", now)).unwrap();

        assert_eq!(backend.gc().unwrap(), 1);
        assert!(backend.find("old").unwrap().is_none());
        assert!(backend.find("fresh").unwrap().is_some());
    }

    #[test]
    fn test_count_gc_keeps_most_recent() {
        let limits = CacheLimits {
            max_entries: 2,
            ..Default::default()
        };
        let mut backend = InProcessBackend::new(limits);
        let now = unix_now();
        for key in ["first", "second", "third"] {
            backend.add(key, module_with(key, now)).unwrap();
        }

        assert_eq!(backend.gc().unwrap(), 1);
        assert!(backend.find("first").unwrap().is_none());
        assert!(backend.find("second").unwrap().is_some());
        assert!(backend.find("third").unwrap().is_some());
        assert_eq!(backend.stat().current_entries, 2);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut backend = InProcessBackend::new(CacheLimits::default());
        backend.add("k", module_with("v", unix_now())).unwrap();
        backend.reset().unwrap();
        assert_eq!(backend.stat().current_entries, 0);
        assert_eq!(backend.stat().current_size, 0);
    }
}
