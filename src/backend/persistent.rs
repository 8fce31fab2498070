//! Persistent backend over an embedded LMDB store.
//!
//! One environment with a single unnamed database at a caller-supplied file
//! path, opened with memory-mapped asynchronous-flush semantics. Every
//! operation runs inside one short transaction (read-only for lookups and
//! stats, read-write for mutation); RAII guarantees the transaction is
//! aborted or committed on every exit path.
//!
//! Keys are the template text bytes plus a terminator; oversized keys fall
//! back to a hash-prefixed decimal digest so they stay inside LMDB's key
//! limit. Values are modules normalized to base 0 and freshly hashed, and
//! are patched + verified on the way back out.

use std::fs;
use std::path::Path;

use heed::types::Bytes;
use heed::{Database, EnvFlags, EnvOpenOptions};
use tracing::{debug, info, warn};
use xxhash_rust::xxh64::xxh64;

use crate::backend::{BackendKind, CacheBackend, ModuleHandle};
use crate::config::CacheLimits;
use crate::error::CacheError;
use crate::module::format::{read_u64, CompiledModule, HEADER_LEN, TIMESTAMP_OFFSET};
use crate::module::reloc;
use crate::shm::region::page_align;
use crate::stats::CacheStat;

/// LMDB's default maximum key length.
const MAX_KEY_BYTES: usize = 511;

/// Store map size when the limits don't specify one.
const DEFAULT_MAP_SIZE: usize = 64 << 20;

pub struct PersistentBackend {
    env: heed::Env,
    db: Database<Bytes, Bytes>,
    limits: CacheLimits,
    // Hit/miss accounting is in-process only; it is not persisted across
    // transactions or restarts.
    hits: u64,
    misses: u64,
}

impl PersistentBackend {
    /// Open (creating if absent) the store file at `path`.
    pub fn open(limits: CacheLimits, path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        // The store wants a whole number of pages for its map.
        let map_size = page_align(if limits.max_size > 0 {
            limits.max_size
        } else {
            DEFAULT_MAP_SIZE
        });

        let mut options = EnvOpenOptions::new();
        options.map_size(map_size).max_dbs(1);
        // Durable writes through the map with asynchronous flushes.
        // SAFETY: WRITE_MAP trades crash-consistency for throughput; the
        // cache tolerates losing entries, never serving torn ones (content
        // hashes are verified on read).
        unsafe {
            options.flags(EnvFlags::NO_SUB_DIR | EnvFlags::WRITE_MAP | EnvFlags::MAP_ASYNC);
        }
        // SAFETY: the path is not opened twice by this process (LMDB
        // requirement); heed enforces this and errors otherwise.
        let env = unsafe { options.open(path)? };

        restrict_permissions(path);

        let mut wtxn = env.write_txn()?;
        let db: Database<Bytes, Bytes> = env.create_database(&mut wtxn, None)?;
        wtxn.commit()?;

        info!(path = %path.display(), map_size, "Opened persistent module store");
        Ok(Self {
            env,
            db,
            limits,
            hits: 0,
            misses: 0,
        })
    }

    /// Store key: template text plus terminator, or a hash-prefixed decimal
    /// digest when that would exceed the store's key limit.
    fn store_key(key: &str) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(key.len() + 1);
        bytes.extend_from_slice(key.as_bytes());
        bytes.push(0);
        if bytes.len() > MAX_KEY_BYTES {
            return format!("#{}", xxh64(key.as_bytes(), 0)).into_bytes();
        }
        bytes
    }
}

/// Cache files carry compiled template internals; keep them owner-only.
#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    for candidate in [path.to_path_buf(), lock_path(path)] {
        if candidate.exists() {
            if let Err(err) = fs::set_permissions(&candidate, fs::Permissions::from_mode(0o600)) {
                warn!(path = %candidate.display(), %err, "Could not restrict store permissions");
            }
        }
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

#[cfg(unix)]
fn lock_path(path: &Path) -> std::path::PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push("-lock");
    std::path::PathBuf::from(os)
}

impl CacheBackend for PersistentBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Persistent
    }

    fn add(&mut self, key: &str, mut module: CompiledModule) -> Result<(), CacheError> {
        reloc::normalize(&mut module, 0)?;
        reloc::generate_hash(&mut module)?;

        let store_key = Self::store_key(key);
        let mut wtxn = self.env.write_txn()?;
        self.db.put(&mut wtxn, &store_key, module.as_bytes())?;
        wtxn.commit()?;
        debug!(key, size = module.len(), "Stored module");
        Ok(())
    }

    fn find(&mut self, key: &str) -> Result<Option<ModuleHandle>, CacheError> {
        let store_key = Self::store_key(key);

        let bytes = {
            let rtxn = self.env.read_txn()?;
            self.db.get(&rtxn, &store_key)?.map(<[u8]>::to_vec)
        };
        let Some(bytes) = bytes else {
            self.misses += 1;
            return Ok(None);
        };

        let mut module = match CompiledModule::from_bytes(bytes) {
            Ok(module) => module,
            Err(err) if self.limits.strict_verify => return Err(err),
            Err(err) => {
                warn!(key, %err, "Stored module is malformed, treating as a miss");
                self.misses += 1;
                return Ok(None);
            }
        };
        reloc::patch(&mut module)?;
        if !reloc::verify(module.as_bytes(), self.limits.strict_verify)? {
            self.misses += 1;
            return Ok(None);
        }

        self.hits += 1;
        Ok(Some(ModuleHandle::Owned(module)))
    }

    fn release(&mut self, _key: &str, handle: ModuleHandle) -> Result<(), CacheError> {
        drop(handle);
        Ok(())
    }

    fn gc(&mut self) -> Result<usize, CacheError> {
        if self.limits.max_age_secs < 0 {
            return Ok(0);
        }

        let mut wtxn = self.env.write_txn()?;
        let mut stale: Vec<Vec<u8>> = Vec::new();
        {
            for entry in self.db.iter(&wtxn)? {
                let (store_key, value) = entry?;
                if value.len() < HEADER_LEN {
                    warn!("Undersized store value, scheduling removal");
                    stale.push(store_key.to_vec());
                    continue;
                }
                if self.limits.expired(read_u64(value, TIMESTAMP_OFFSET)) {
                    stale.push(store_key.to_vec());
                }
            }
        }
        for store_key in &stale {
            self.db.delete(&mut wtxn, store_key)?;
        }
        wtxn.commit()?;

        if !stale.is_empty() {
            info!(removed = stale.len(), "GC round complete");
        }
        Ok(stale.len())
    }

    fn reset(&mut self) -> Result<(), CacheError> {
        let mut wtxn = self.env.write_txn()?;
        self.db.clear(&mut wtxn)?;
        wtxn.commit()?;
        Ok(())
    }

    fn stat(&self) -> CacheStat {
        // Entry counts come from the store; anything it doesn't track stays
        // zero.
        let entries = self
            .env
            .read_txn()
            .and_then(|rtxn| self.db.len(&rtxn))
            .unwrap_or(0);
        CacheStat {
            total_entries: entries,
            current_entries: entries,
            hits: self.hits,
            misses: self.misses,
            ..Default::default()
        }
    }
}
