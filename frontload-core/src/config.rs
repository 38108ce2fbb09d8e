//! Configuration for the access layer
//!
//! This module provides:
//! - Cache connection settings (URL, pool size, operation deadlines)
//! - Per-entity-type loader tuning (batch window, batch size, cache TTL)
//! - TOML load/save and validation with sensible defaults

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Top-level access layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessConfig {
    /// Cache service settings
    pub cache: CacheSettings,
    /// Per-entity-type loader settings, keyed by entity name
    #[serde(default)]
    pub loaders: HashMap<String, LoaderSettings>,
}

/// Cache service connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Cache server URL
    pub url: String,
    /// Connection pool size
    pub pool_size: usize,
    /// Deadline for a single cache operation in milliseconds
    pub op_timeout_ms: u64,
    /// Deadline for the liveness probe in milliseconds
    pub health_timeout_ms: u64,
}

/// Batching and TTL policy for one entity type
///
/// Immutable once a loader is constructed. Different entity types are tuned
/// independently: short windows for hot primary lookups, long TTLs for
/// rarely-changing reference data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderSettings {
    /// Scheduling window in milliseconds before an open batch closes
    pub window_ms: u64,
    /// Batch closes immediately once this many unique keys are buffered
    pub max_batch_size: usize,
    /// TTL applied to cache entries populated by this loader, in seconds
    pub cache_ttl_secs: u64,
    /// Prefix for cache keys written by this loader
    pub cache_key_prefix: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            pool_size: 16,
            op_timeout_ms: 2_000,
            health_timeout_ms: 1_000,
        }
    }
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            window_ms: 10,
            max_batch_size: 100,
            cache_ttl_secs: 300,
            cache_key_prefix: "entity".to_string(),
        }
    }
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            cache: CacheSettings::default(),
            loaders: HashMap::new(),
        }
    }
}

impl CacheSettings {
    /// Operation deadline as a duration
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    /// Liveness probe deadline as a duration
    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }
}

impl LoaderSettings {
    /// Scheduling window as a duration
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Cache TTL as a duration
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl AccessConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.cache.url.is_empty() {
            bail!("cache.url must not be empty");
        }
        if self.cache.pool_size == 0 {
            bail!("cache.pool_size must be at least 1");
        }
        if self.cache.op_timeout_ms == 0 {
            bail!("cache.op_timeout_ms must be greater than zero");
        }
        if self.cache.health_timeout_ms == 0 {
            bail!("cache.health_timeout_ms must be greater than zero");
        }
        for (entity, loader) in &self.loaders {
            if loader.max_batch_size == 0 {
                bail!("loaders.{}.max_batch_size must be at least 1", entity);
            }
            if loader.cache_key_prefix.is_empty() {
                bail!("loaders.{}.cache_key_prefix must not be empty", entity);
            }
        }
        Ok(())
    }

    /// Loader settings for an entity type, falling back to defaults with the
    /// entity name as cache key prefix
    pub fn loader(&self, entity: &str) -> LoaderSettings {
        self.loaders.get(entity).cloned().unwrap_or_else(|| LoaderSettings {
            cache_key_prefix: entity.to_string(),
            ..LoaderSettings::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AccessConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_batch_size() {
        let mut config = AccessConfig::default();
        config.loaders.insert(
            "user".to_string(),
            LoaderSettings {
                max_batch_size: 0,
                ..LoaderSettings::default()
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_empty_prefix() {
        let mut config = AccessConfig::default();
        config.loaders.insert(
            "user".to_string(),
            LoaderSettings {
                cache_key_prefix: String::new(),
                ..LoaderSettings::default()
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_empty_url() {
        let mut config = AccessConfig::default();
        config.cache.url = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_loader_lookup_falls_back_to_entity_prefix() {
        let config = AccessConfig::default();
        let settings = config.loader("project");
        assert_eq!(settings.cache_key_prefix, "project");
        assert_eq!(settings.max_batch_size, 100);
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frontload.toml");

        let mut config = AccessConfig::default();
        config.loaders.insert(
            "user".to_string(),
            LoaderSettings {
                window_ms: 5,
                max_batch_size: 50,
                cache_ttl_secs: 600,
                cache_key_prefix: "user".to_string(),
            },
        );

        config.save_to_file(&path).unwrap();
        let loaded = AccessConfig::load_from_file(&path).unwrap();

        assert_eq!(loaded.cache.url, config.cache.url);
        assert_eq!(loaded.loaders["user"].cache_ttl_secs, 600);
        assert_eq!(loaded.loaders["user"].window_ms, 5);
    }

    #[test]
    fn test_duration_helpers() {
        let settings = LoaderSettings::default();
        assert_eq!(settings.window(), Duration::from_millis(10));
        assert_eq!(settings.cache_ttl(), Duration::from_secs(300));
    }
}
