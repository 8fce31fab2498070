//! Shared-mapping plumbing for the shared-memory backend.
//!
//! - [`region`]: anonymous `MAP_SHARED` mappings with page-aligned layout
//!   and a debug-build write-protect guard
//! - [`lock`]: a process-shared pthread mutex embedded in the mapping

pub mod lock;
pub mod region;
