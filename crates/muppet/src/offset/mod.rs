//! Function offset cache.
//!
//! Signature scans over a multi-gigabyte client cost seconds; the resolved
//! module-relative offsets only change when the build does. The cache
//! stores them next to the controller keyed by build version, and start-up
//! falls back to scanning only when no valid cached entry exists.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;

/// Default cache file name, colocated with the controller.
pub const CACHE_FILE: &str = ".muppet-offsets.json";

/// Cached module-relative function offsets for one target build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffsetCache {
    /// Target build the offsets were resolved against.
    pub build_version: String,
    /// Function code -> offset from the game module base.
    pub offsets: HashMap<String, u64>,
    pub recorded_at: DateTime<Utc>,
}

impl OffsetCache {
    pub fn new(build_version: String, offsets: HashMap<String, u64>) -> Self {
        Self {
            build_version,
            offsets,
            recorded_at: Utc::now(),
        }
    }

    /// Load from the default location.
    pub fn load() -> Option<Self> {
        Self::load_from_path(CACHE_FILE)
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Option<Self> {
        let content = match fs::read_to_string(path.as_ref()) {
            Ok(content) => content,
            Err(e) => {
                debug!("Offset cache not readable: {}", e);
                return None;
            }
        };

        match serde_json::from_str::<OffsetCache>(&content) {
            Ok(cache) => {
                debug!(
                    "Loaded offset cache: build={}, {} functions, recorded {}",
                    cache.build_version,
                    cache.offsets.len(),
                    cache.recorded_at
                );
                Some(cache)
            }
            Err(e) => {
                warn!("Failed to parse offset cache: {}", e);
                None
            }
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to_path(CACHE_FILE)
    }

    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&path, content)?;
        info!("Saved offset cache to {}", path.as_ref().display());
        Ok(())
    }

    /// A cache is only usable against the exact build it was recorded for.
    pub fn is_valid_for(&self, build_version: &str) -> bool {
        if self.build_version != build_version {
            debug!(
                "Offset cache build mismatch: cached={}, current={}",
                self.build_version, build_version
            );
            return false;
        }
        if self.offsets.is_empty() {
            debug!("Offset cache is empty");
            return false;
        }
        true
    }
}

/// Load cached offsets if they match the given build.
pub fn try_load_cached_offsets<P: AsRef<Path>>(
    path: P,
    build_version: &str,
) -> Option<HashMap<String, u64>> {
    let cache = OffsetCache::load_from_path(path)?;
    if cache.is_valid_for(build_version) {
        info!(
            "Using cached offsets for build {} ({} functions)",
            build_version,
            cache.offsets.len()
        );
        Some(cache.offsets)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_offsets() -> HashMap<String, u64> {
        let mut offsets = HashMap::new();
        offsets.insert("player_move".to_string(), 0x10_F2A0);
        offsets.insert("submit_text".to_string(), 0x0B_11D0);
        offsets
    }

    #[test]
    fn cache_round_trips() {
        let file = tempfile::NamedTempFile::new().unwrap();

        let cache = OffsetCache::new("1.04.22".to_string(), sample_offsets());
        cache.save_to_path(file.path()).unwrap();

        let loaded = OffsetCache::load_from_path(file.path()).unwrap();
        assert_eq!(loaded.build_version, "1.04.22");
        assert_eq!(loaded.offsets["player_move"], 0x10_F2A0);
    }

    #[test]
    fn version_mismatch_invalidates() {
        let cache = OffsetCache::new("1.04.22".to_string(), sample_offsets());
        assert!(cache.is_valid_for("1.04.22"));
        assert!(!cache.is_valid_for("1.05.01"));
    }

    #[test]
    fn empty_cache_is_invalid() {
        let cache = OffsetCache::new("1.04.22".to_string(), HashMap::new());
        assert!(!cache.is_valid_for("1.04.22"));
    }

    #[test]
    fn try_load_filters_by_build() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let cache = OffsetCache::new("1.04.22".to_string(), sample_offsets());
        cache.save_to_path(file.path()).unwrap();

        assert!(try_load_cached_offsets(file.path(), "1.04.22").is_some());
        assert!(try_load_cached_offsets(file.path(), "9.99.99").is_none());
        assert!(try_load_cached_offsets("/nonexistent/path.json", "1.04.22").is_none());
    }
}
