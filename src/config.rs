//! Runtime configuration for the module cache.
//!
//! Every backend shares the same limit knobs; each one applies the subset it
//! can enforce. Limits can be loaded from a JSON file or constructed
//! programmatically.

use serde::{Deserialize, Serialize};

use crate::module::format::unix_now;

/// Eviction and verification limits shared by every backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheLimits {
    /// Maximum entry age in seconds. Negative disables age-based eviction.
    pub max_age_secs: i64,

    /// Maximum number of resident entries (0 = unlimited). Enforced by the
    /// in-process backend's `gc`.
    pub max_entries: usize,

    /// Maximum resident bytes (0 = backend default). The persistent backend
    /// sizes its store map from this.
    pub max_size: usize,

    /// Hard-fail on corrupt or version-skewed modules instead of treating
    /// them as misses. Defaults to on for debug builds.
    pub strict_verify: bool,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_age_secs: -1,
            max_entries: 0,
            max_size: 0,
            strict_verify: cfg!(debug_assertions),
        }
    }
}

impl CacheLimits {
    /// Whether a module created at `timestamp` (unix seconds) has outlived
    /// `max_age_secs`.
    pub fn expired(&self, timestamp: u64) -> bool {
        if self.max_age_secs < 0 {
            return false;
        }
        unix_now().saturating_sub(timestamp) > self.max_age_secs as u64
    }

    /// Load limits from a JSON file, falling back to defaults if absent.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let limits: CacheLimits = serde_json::from_str(&data)?;
            Ok(limits)
        } else {
            tracing::warn!("Limits file not found at {:?}, using defaults", path);
            Ok(CacheLimits::default())
        }
    }
}
