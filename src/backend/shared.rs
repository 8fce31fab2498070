//! Shared-memory backend.
//!
//! One anonymous shared mapping holds everything: a header (process-shared
//! lock, geometry, counters), a fixed table of `table_count` slots, and an
//! append-only bump arena that stores key bytes and module blobs back to
//! back. Worker processes forked after construction inherit the mapping at
//! the same address, so arena offsets and patched module addresses stay
//! valid everywhere.
//!
//! Concurrency model: every mutation (insert, slot eviction, reset wipe)
//! serializes on the process-shared mutex; happy-path lookups are lock-free
//! and publish through one atomic slot field. A shared reader refcount,
//! independent of the lock, gates `reset`: the wipe only proceeds once every
//! checked-out module has been released. There is no chaining — one resident
//! key per slot, first writer wins, and sizing the table is a deployment
//! concern.
//!
//! Eviction is purely lazy: stale entries fall out on lookup, and arena
//! exhaustion invalidates the whole cache instead of compacting it.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};
use xxhash_rust::xxh64::xxh64;

use crate::backend::{BackendKind, CacheBackend, ModuleHandle};
use crate::config::CacheLimits;
use crate::error::CacheError;
use crate::module::format::{
    read_u64, CompiledModule, HEADER_LEN, MODULE_VERSION, SIZE_OFFSET, TIMESTAMP_OFFSET,
    VERSION_OFFSET,
};
use crate::module::reloc;
use crate::shm::lock::SharedMutex;
use crate::shm::region::{page_align, SharedRegion};
use crate::stats::CacheStat;

const SHM_MAGIC: u32 = u32::from_ne_bytes(*b"TMSH");

/// Reset drains readers in 1 ms steps for at most this many retries
/// (a few hundred milliseconds in total).
const RESET_DRAIN_RETRIES: u32 = 300;
const RESET_DRAIN_INTERVAL: Duration = Duration::from_millis(1);

/// Arena appends are aligned to this.
const ARENA_ALIGN: usize = 8;

fn align_up(value: usize) -> usize {
    (value + ARENA_ALIGN - 1) & !(ARENA_ALIGN - 1)
}

/// Mapped at offset 0 of the region. The pthread mutex must stay the first
/// field so the lock handle can be built from the region base.
#[repr(C)]
struct ShmHeader {
    lock: UnsafeCell<libc::pthread_mutex_t>,
    magic: u32,
    version: u32,
    table_count: u64,
    table_off: u64,
    data_off: u64,
    data_size: u64,
    /// Arena bump cursor.
    data_len: AtomicU64,
    total_entries: AtomicU64,
    current_entries: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    collisions: AtomicU64,
    /// Modules currently checked out by readers; gates reset.
    refcount: AtomicU64,
    in_reset: AtomicU32,
    _pad: u32,
}

/// One slot of the fixed hash table. `module_ref` publishes the entry:
/// readers acquire-load it, writers release-store it last.
#[repr(C)]
struct Slot {
    key_ref: AtomicU64,
    key_len: AtomicU64,
    module_ref: AtomicU64,
}

const SLOT_LEN: usize = std::mem::size_of::<Slot>();

/// Zero-copy read-only view of a module resident in the shared arena.
///
/// Holding the view pins the mapping (via `Arc`) and one unit of the shared
/// reader refcount; dropping it releases both. The bytes must never be
/// mutated through this view.
pub struct SharedModuleView {
    region: Arc<SharedRegion>,
    offset: usize,
    len: usize,
}

impl SharedModuleView {
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: the span was bounds-checked at lookup, and resident
        // modules are immutable while the refcount holds off reset.
        unsafe { self.region.slice(self.offset, self.len) }
    }
}

impl Drop for SharedModuleView {
    fn drop(&mut self) {
        let header = unsafe { &*(self.region.as_ptr() as *const ShmHeader) };
        header.refcount.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct SharedMemoryBackend {
    region: Arc<SharedRegion>,
    mutex: SharedMutex,
    limits: CacheLimits,
    table_count: u64,
    table_off: usize,
    data_off: usize,
    data_size: usize,
    /// Span covered by the debug-build write-protect guard (table + arena).
    guard_off: usize,
    guard_len: usize,
}

impl SharedMemoryBackend {
    /// Map and initialize a fresh cache region: page-aligned header, slot
    /// table, and an arena of (page-aligned) `total_size` bytes.
    pub fn create(
        limits: CacheLimits,
        total_size: usize,
        table_count: usize,
    ) -> Result<Self, CacheError> {
        if table_count == 0 {
            return Err(CacheError::Geometry("slot table cannot be empty"));
        }
        if total_size == 0 {
            return Err(CacheError::Geometry("arena cannot be empty"));
        }

        let header_len = page_align(std::mem::size_of::<ShmHeader>());
        let table_len = page_align(table_count * SLOT_LEN);
        let data_size = page_align(total_size);
        let region = Arc::new(SharedRegion::map_anon(header_len + table_len + data_size)?);

        // SAFETY: exclusive access to the freshly mapped (zeroed) region.
        unsafe {
            let header = &mut *(region.as_ptr() as *mut ShmHeader);
            header.magic = SHM_MAGIC;
            header.version = MODULE_VERSION;
            header.table_count = table_count as u64;
            header.table_off = header_len as u64;
            header.data_off = (header_len + table_len) as u64;
            header.data_size = data_size as u64;
        }
        // SAFETY: the lock field sits at region offset 0 in zeroed storage.
        let mutex = unsafe { SharedMutex::init_at(region.as_ptr()) }?;

        let guard_off = header_len;
        let guard_len = table_len + data_size;
        region.write_protect(guard_off, guard_len)?;

        info!(
            total = region.len(),
            slots = table_count,
            arena = data_size,
            "Shared module cache mapped"
        );
        // Geometry comes back out of the mapped header: it is the one copy
        // every process sharing the region agrees on.
        // SAFETY: initialized just above.
        let header = unsafe { &*(region.as_ptr() as *const ShmHeader) };
        let backend = Self {
            table_count: header.table_count,
            table_off: header.table_off as usize,
            data_off: header.data_off as usize,
            data_size: header.data_size as usize,
            guard_off,
            guard_len,
            region,
            mutex,
            limits,
        };
        debug_assert_eq!(backend.header().magic, SHM_MAGIC);
        debug_assert_eq!(backend.header().version, MODULE_VERSION);
        Ok(backend)
    }

    fn header(&self) -> &ShmHeader {
        // SAFETY: the header was initialized in create() and the mapping
        // lives as long as self.
        unsafe { &*(self.region.as_ptr() as *const ShmHeader) }
    }

    fn slot(&self, index: u64) -> &Slot {
        debug_assert!(index < self.table_count);
        let off = self.table_off + index as usize * SLOT_LEN;
        // SAFETY: in-bounds, 8-aligned slot storage; fields are atomics.
        unsafe { &*(self.region.as_ptr().add(off) as *const Slot) }
    }

    fn slot_index(&self, key: &str) -> u64 {
        xxh64(key.as_bytes(), 0) % self.table_count
    }

    fn slot_key_matches(&self, slot: &Slot, key: &str) -> bool {
        let key_ref = slot.key_ref.load(Ordering::Relaxed) as usize;
        let key_len = slot.key_len.load(Ordering::Relaxed) as usize;
        if key_len != key.len() || key_ref == 0 {
            return false;
        }
        // SAFETY: key spans are published before module_ref and immutable
        // until the slot is wiped under the lock.
        let stored = unsafe { self.region.slice(key_ref, key_len) };
        stored == key.as_bytes()
    }

    /// Wipe one slot. Caller holds the lock.
    fn clear_slot(&self, slot: &Slot) -> Result<(), CacheError> {
        self.region.write_unprotect(self.guard_off, self.guard_len)?;
        slot.module_ref.store(0, Ordering::Release);
        slot.key_ref.store(0, Ordering::Relaxed);
        slot.key_len.store(0, Ordering::Relaxed);
        self.region.write_protect(self.guard_off, self.guard_len)?;
        self.header().current_entries.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    /// Read a resident module's blob span, validating geometry against the
    /// arena bounds.
    fn module_span(&self, module_ref: u64) -> Result<(usize, usize), CacheError> {
        let off = module_ref as usize;
        if off < self.data_off || off + HEADER_LEN > self.region.len() {
            return Err(CacheError::Malformed("module reference outside arena"));
        }
        // SAFETY: header span checked above; module bytes are immutable
        // while resident.
        let header_bytes = unsafe { self.region.slice(off, HEADER_LEN) };
        let size = read_u64(header_bytes, SIZE_OFFSET) as usize;
        if size < HEADER_LEN || off + size > self.region.len() {
            return Err(CacheError::Malformed("module size outside arena"));
        }
        Ok((off, size))
    }

    /// Drain readers and wipe the table and arena. Shared by `reset` and
    /// arena-exhaustion handling.
    fn reset_inner(&mut self) -> Result<(), CacheError> {
        let header = self.header();
        header.in_reset.store(1, Ordering::Release);

        let mut drained = false;
        for _ in 0..RESET_DRAIN_RETRIES {
            if header.refcount.load(Ordering::Acquire) == 0 {
                drained = true;
                break;
            }
            thread::sleep(RESET_DRAIN_INTERVAL);
        }

        let result = if drained {
            self.wipe_locked()
        } else {
            let readers = header.refcount.load(Ordering::Acquire);
            warn!(readers, "Reset aborted: readers did not drain");
            Err(CacheError::ResetTimeout { readers })
        };

        // Clear the flag on every path, including the timeout.
        self.header().in_reset.store(0, Ordering::Release);
        result
    }

    fn wipe_locked(&mut self) -> Result<(), CacheError> {
        let _guard = self.mutex.lock()?;
        self.region.write_unprotect(self.guard_off, self.guard_len)?;
        for index in 0..self.table_count {
            let slot = self.slot(index);
            slot.module_ref.store(0, Ordering::Release);
            slot.key_ref.store(0, Ordering::Relaxed);
            slot.key_len.store(0, Ordering::Relaxed);
        }
        self.region.write_protect(self.guard_off, self.guard_len)?;

        let header = self.header();
        header.data_len.store(0, Ordering::Release);
        header.current_entries.store(0, Ordering::Release);
        info!("Shared module cache invalidated");
        Ok(())
    }
}

impl CacheBackend for SharedMemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::SharedMemory
    }

    fn add(&mut self, key: &str, mut module: CompiledModule) -> Result<(), CacheError> {
        reloc::normalize(&mut module, 0)?;
        reloc::generate_hash(&mut module)?;

        let key_span = align_up(key.len());
        let module_span = align_up(module.len());
        let need = key_span + module_span;

        let exhausted = {
            let guard = self.mutex.lock()?;
            let header = self.header();
            let slot = self.slot(self.slot_index(key));

            if slot.module_ref.load(Ordering::Acquire) != 0 {
                // First writer wins; a different key here is a collision,
                // the same key is a redundant add. Either way: no-op.
                if !self.slot_key_matches(slot, key) {
                    header.collisions.fetch_add(1, Ordering::Relaxed);
                    debug!(key, "Insert collided with resident entry");
                }
                drop(guard);
                return Ok(());
            }

            let used = header.data_len.load(Ordering::Relaxed) as usize;
            if used + need > self.data_size {
                true
            } else {
                let key_off = self.data_off + used;
                let module_off = key_off + key_span;

                self.region.write_unprotect(self.guard_off, self.guard_len)?;
                // SAFETY: the spans are unpublished arena bytes past the
                // bump cursor; the lock makes this the only writer.
                unsafe {
                    self.region
                        .slice_mut(key_off, key.len())
                        .copy_from_slice(key.as_bytes());
                    let dest = self.region.slice_mut(module_off, module.len());
                    dest.copy_from_slice(module.as_bytes());
                    // Rebase to the blob's final resting address before it
                    // becomes visible to any reader.
                    reloc::patch_bytes(dest)?;
                }

                header.data_len.store((used + need) as u64, Ordering::Release);
                slot.key_ref.store(key_off as u64, Ordering::Relaxed);
                slot.key_len.store(key.len() as u64, Ordering::Relaxed);
                slot.module_ref.store(module_off as u64, Ordering::Release);
                self.region.write_protect(self.guard_off, self.guard_len)?;
                header.total_entries.fetch_add(1, Ordering::Relaxed);
                header.current_entries.fetch_add(1, Ordering::Relaxed);
                debug!(key, size = module.len(), "Cached module in shared arena");
                false
            }
        };

        if exhausted {
            // Abort the insert and invalidate everything; the next adds
            // repopulate a fresh arena. A failed drain just means the old
            // entries survive a little longer.
            warn!(key, need, "Arena exhausted, invalidating shared cache");
            if let Err(CacheError::ResetTimeout { readers }) = self.reset_inner() {
                warn!(readers, "Invalidation deferred: readers still active");
            }
        }
        Ok(())
    }

    fn find(&mut self, key: &str) -> Result<Option<ModuleHandle>, CacheError> {
        let header = self.header();

        if header.in_reset.load(Ordering::Acquire) != 0 {
            header.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let slot = self.slot(self.slot_index(key));
        let module_ref = slot.module_ref.load(Ordering::Acquire);
        if module_ref == 0 {
            header.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }
        if !self.slot_key_matches(slot, key) {
            header.collisions.fetch_add(1, Ordering::Relaxed);
            header.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        // Check out before examining the module so reset cannot wipe the
        // arena under us; re-check the reset flag afterwards.
        header.refcount.fetch_add(1, Ordering::AcqRel);
        let checked_out = SharedModuleView {
            region: Arc::clone(&self.region),
            offset: 0,
            len: 0,
        };
        if header.in_reset.load(Ordering::Acquire) != 0 {
            drop(checked_out);
            header.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let (offset, len) = match self.module_span(module_ref) {
            Ok(span) => span,
            Err(err) if self.limits.strict_verify => return Err(err),
            Err(err) => {
                warn!(key, %err, "Resident module is malformed, treating as a miss");
                drop(checked_out);
                header.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
        };
        // SAFETY: span validated against the arena; resident modules are
        // immutable while checked out.
        let blob = unsafe { self.region.slice(offset, len) };
        let version = {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&blob[VERSION_OFFSET..VERSION_OFFSET + 4]);
            u32::from_ne_bytes(buf)
        };
        let timestamp = read_u64(blob, TIMESTAMP_OFFSET);

        if version != MODULE_VERSION || self.limits.expired(timestamp) {
            // Stale entry: evict just this slot under the lock, then miss.
            drop(checked_out);
            let guard = self.mutex.lock()?;
            if slot.module_ref.load(Ordering::Acquire) == module_ref {
                self.clear_slot(slot)?;
                debug!(key, version, timestamp, "Evicted stale module");
            }
            drop(guard);
            header.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        header.hits.fetch_add(1, Ordering::Relaxed);
        let mut view = checked_out;
        view.offset = offset;
        view.len = len;
        Ok(Some(ModuleHandle::Shared(view)))
    }

    fn release(&mut self, _key: &str, handle: ModuleHandle) -> Result<(), CacheError> {
        // Dropping a shared view decrements the reader refcount.
        drop(handle);
        Ok(())
    }

    /// Eviction here is lazy (stale entries fall out on lookup) and
    /// wholesale (arena exhaustion), so there is nothing to collect.
    fn gc(&mut self) -> Result<usize, CacheError> {
        debug!("GC is a no-op for the shared-memory backend");
        Ok(0)
    }

    fn reset(&mut self) -> Result<(), CacheError> {
        self.reset_inner()
    }

    fn stat(&self) -> CacheStat {
        let header = self.header();
        CacheStat {
            total_size: self.region.len() as u64,
            current_size: header.data_len.load(Ordering::Relaxed),
            table_size: self.table_count,
            data_size: self.data_size as u64,
            total_entries: header.total_entries.load(Ordering::Relaxed),
            current_entries: header.current_entries.load(Ordering::Relaxed),
            hits: header.hits.load(Ordering::Relaxed),
            misses: header.misses.load(Ordering::Relaxed),
            readers: header.refcount.load(Ordering::Relaxed),
            collisions: header.collisions.load(Ordering::Relaxed),
        }
    }
}
