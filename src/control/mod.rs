//! The control surface (C7): what an external dashboard process is allowed
//! to see and mutate. Holds the same `Arc`s the acceptor and handler hold,
//! explicit constructor-injected dependencies rather than process-wide
//! globals, the way the rest of this proxy wires its shared state.

use std::path::PathBuf;
use std::sync::Arc;

use crate::blacklist::Blacklist;
use crate::cache::persist::write_snapshot;
use crate::cache::Cache;
use crate::config::Config;
use crate::core::error::ProxyError;

/// A single cache entry as surfaced to the dashboard: key plus size, never
/// the body itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSummary {
    pub key: String,
    pub size: usize,
}

pub struct Control {
    cache: Arc<Cache>,
    blacklist: Arc<Blacklist>,
    snapshot_path: PathBuf,
    config_path: PathBuf,
}

impl Control {
    pub fn new(
        cache: Arc<Cache>,
        blacklist: Arc<Blacklist>,
        snapshot_path: impl Into<PathBuf>,
        config_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cache,
            blacklist,
            snapshot_path: snapshot_path.into(),
            config_path: config_path.into(),
        }
    }

    /// Read-only, most-recently-used first, for display.
    pub fn cache_snapshot(&self) -> Vec<CacheSummary> {
        self.cache
            .snapshot()
            .into_iter()
            .map(|(key, entry)| CacheSummary {
                key,
                size: entry.size(),
            })
            .collect()
    }

    /// Empties the cache and rewrites the snapshot file to reflect that.
    pub async fn clear_cache(&self) -> Result<(), ProxyError> {
        self.cache.clear();
        write_snapshot(&self.cache, &self.snapshot_path)
            .await
            .map_err(|e| ProxyError::Cache(format!("failed to rewrite snapshot after clear: {e}")))
    }

    /// The blacklist patterns as currently configured, in load order. This is
    /// the dashboard's read side of the C7 blacklist mutation API.
    pub fn read_blacklist(&self) -> Vec<String> {
        self.blacklist.patterns()
    }

    pub fn read_blacklist_len(&self) -> usize {
        self.blacklist.len()
    }

    /// Installs a new blacklist ruleset, compiling each pattern
    /// case-insensitively, and durably persists it to the configuration
    /// file. Rejects the whole batch on any bad pattern rather than applying
    /// a partial set; the in-memory reload only happens once the new set
    /// compiles cleanly, and the file write only happens once the in-memory
    /// reload has already taken effect.
    pub async fn write_blacklist(&self, patterns: &[String]) -> Result<(), ProxyError> {
        self.blacklist.reload_from_strings(patterns)?;

        let mut config = Config::load_from_json(&self.config_path).unwrap_or_default();
        config.blacklist = patterns.to_vec();
        config.save_to_json(&self.config_path).await
    }
}
