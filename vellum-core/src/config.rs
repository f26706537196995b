//! Repository descriptor: cache, cluster and scroll configuration.
//!
//! The descriptor is read once when a repository is opened. It can be built
//! in code (every section has defaults) or loaded from TOML, and must pass
//! [`RepositoryDescriptor::validate`] before use.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{ConfigError, VellumResult};

/// Default upper bound on the number of ids returned by one scroll call.
pub const DEFAULT_MAX_DESCENDANTS_BATCH_SIZE: usize = 1000;

/// Default number of ids per backend multi-fetch.
pub const DEFAULT_FETCH_CHUNK_SIZE: usize = 100;

/// Point-lookup cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheDescriptor {
    pub enabled: bool,
    pub ttl_minutes: u64,
    /// TTL of the `(parent, name) -> child` cache; falls back to `ttl_minutes`.
    pub child_ttl_minutes: Option<u64>,
    pub max_size: usize,
    /// Number of shards in the shared caches.
    pub concurrency_level: usize,
    /// Period of the background expiry sweep; 0 disables it.
    pub sweep_interval_secs: u64,
}

impl Default for CacheDescriptor {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_minutes: 10,
            child_ttl_minutes: None,
            max_size: 10_000,
            concurrency_level: 10,
            sweep_interval_secs: 60,
        }
    }
}

impl CacheDescriptor {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_minutes * 60)
    }

    pub fn child_ttl(&self) -> Duration {
        Duration::from_secs(self.child_ttl_minutes.unwrap_or(self.ttl_minutes) * 60)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

/// Multi-node deployment settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterDescriptor {
    pub enabled: bool,
    pub node_id: String,
    /// Registered name of the cluster invalidator implementation.
    pub invalidator: Option<String>,
    pub poll_interval_ms: u64,
}

impl Default for ClusterDescriptor {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: String::new(),
            invalidator: None,
            poll_interval_ms: 1000,
        }
    }
}

impl ClusterDescriptor {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Descendant scroll settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScrollDescriptor {
    pub max_descendants_batch_size: usize,
    pub fetch_chunk_size: usize,
    /// Size of the process-wide permit pool.
    pub max_concurrent_scrolls: usize,
    /// Bounded wait for a permit; `None` waits until one is free.
    pub permit_timeout_ms: Option<u64>,
    /// Search context lifetime used when the caller passes no keep-alive.
    pub search_context_ttl_secs: u64,
    pub search_context_max_entries: usize,
}

impl Default for ScrollDescriptor {
    fn default() -> Self {
        Self {
            max_descendants_batch_size: DEFAULT_MAX_DESCENDANTS_BATCH_SIZE,
            fetch_chunk_size: DEFAULT_FETCH_CHUNK_SIZE,
            max_concurrent_scrolls: 4,
            permit_timeout_ms: None,
            search_context_ttl_secs: 600,
            search_context_max_entries: 1_000,
        }
    }
}

impl ScrollDescriptor {
    pub fn permit_timeout(&self) -> Option<Duration> {
        self.permit_timeout_ms.map(Duration::from_millis)
    }

    pub fn search_context_ttl(&self) -> Duration {
        Duration::from_secs(self.search_context_ttl_secs)
    }
}

/// Master repository descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepositoryDescriptor {
    pub name: String,
    #[serde(default)]
    pub cache: CacheDescriptor,
    #[serde(default)]
    pub cluster: ClusterDescriptor,
    #[serde(default)]
    pub scroll: ScrollDescriptor,
}

impl RepositoryDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cache: CacheDescriptor::default(),
            cluster: ClusterDescriptor::default(),
            scroll: ScrollDescriptor::default(),
        }
    }

    pub fn from_toml_str(source: &str) -> VellumResult<Self> {
        let descriptor: Self = toml::from_str(source).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn from_path(path: &Path) -> VellumResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    /// Validate the descriptor.
    ///
    /// Validates:
    /// - name is non-empty
    /// - cache sizes and TTL are positive when caching is enabled
    /// - scroll limits are positive
    /// - clustering has a node id
    pub fn validate(&self) -> VellumResult<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "name".to_string(),
            }
            .into());
        }

        if self.cache.enabled {
            positive("cache.ttl_minutes", self.cache.ttl_minutes as usize)?;
            positive("cache.max_size", self.cache.max_size)?;
            positive("cache.concurrency_level", self.cache.concurrency_level)?;
            if let Some(child_ttl) = self.cache.child_ttl_minutes {
                positive("cache.child_ttl_minutes", child_ttl as usize)?;
            }
        }

        positive(
            "scroll.max_descendants_batch_size",
            self.scroll.max_descendants_batch_size,
        )?;
        positive("scroll.fetch_chunk_size", self.scroll.fetch_chunk_size)?;
        positive("scroll.max_concurrent_scrolls", self.scroll.max_concurrent_scrolls)?;
        positive(
            "scroll.search_context_ttl_secs",
            self.scroll.search_context_ttl_secs as usize,
        )?;
        positive(
            "scroll.search_context_max_entries",
            self.scroll.search_context_max_entries,
        )?;

        if self.cluster.enabled {
            if self.cluster.node_id.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: "cluster.node_id".to_string(),
                }
                .into());
            }
            positive("cluster.poll_interval_ms", self.cluster.poll_interval_ms as usize)?;
        }

        Ok(())
    }
}

fn positive(field: &str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            reason: "must be positive".to_string(),
        });
    }
    Ok(())
}
