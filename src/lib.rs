//! tmpl-module-cache: a cache for compiled template modules.
//!
//! A template compiler runs a parse+compile pipeline once per distinct
//! template and serializes the result into a relocatable bytecode blob (a
//! "module"). This crate memoizes those blobs across render requests,
//! processes, and host restarts, behind one interface with three
//! interchangeable backends:
//!   in-process heap → LMDB store file → shared memory
//!
//! The compiler and the rendering VM are collaborators on either side of
//! the cache: they produce and consume module blobs, the cache stores them
//! and handles relocation whenever a blob crosses an address-space or
//! durability boundary.

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod module;
pub mod shm;
pub mod stats;

pub use backend::{BackendKind, CacheBackend, ModuleHandle, SharedModuleView};
pub use cache::ModuleCache;
pub use config::CacheLimits;
pub use error::CacheError;
pub use module::format::{CompiledModule, ModuleBuilder, ModuleView};
pub use stats::CacheStat;
