//! Engine configuration.
//! All sections have defaults, so an empty `{}` file (or no file at all) is a valid
//! configuration. Durations are stored as `*_ms` integer fields.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, StorageError};
use crate::model::{Compression, DiskSyncConfig};

pub const ENV_VOLUMES_PATH: &str = "SLICESTORE_VOLUMES_PATH";
pub const ENV_NODE_ID: &str = "SLICESTORE_NODE_ID";
pub const ENV_CONFIG: &str = "SLICESTORE_CONFIG";

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub volumes: VolumesConfig,
    pub writer: WriterConfig,
    pub assignment: AssignmentConfig,
    pub statistics: StatisticsConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VolumesConfig {
    /// Root directory, volumes are discovered at `<path>/<type>/<label>`.
    #[serde(default = "VolumesConfig::default_path")]
    pub path: PathBuf,
    /// Node which owns the volumes, used to spread file assignments across nodes.
    #[serde(default = "VolumesConfig::default_node_id")]
    pub node_id: String,
    /// Watch the `drain` marker for the volume lifetime; when false it is only read at open.
    #[serde(default = "VolumesConfig::default_watch_drain_file")]
    pub watch_drain_file: bool,
}

impl VolumesConfig {
    fn default_path() -> PathBuf { PathBuf::from("volumes") }
    fn default_node_id() -> String { "node".to_string() }
    fn default_watch_drain_file() -> bool { true }
}

impl Default for VolumesConfig {
    fn default() -> Self {
        Self { path: Self::default_path(), node_id: Self::default_node_id(), watch_drain_file: Self::default_watch_drain_file() }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WriterConfig {
    /// Size of the in-memory buffer in front of the slice file.
    #[serde(default = "WriterConfig::default_file_buffer_bytes")]
    pub file_buffer_bytes: usize,
    /// Pre-allocate the slice's `allocated_disk_space` at open.
    #[serde(default = "WriterConfig::default_allocate_enabled")]
    pub allocate_enabled: bool,
    /// Default disk space reserved for a new slice.
    #[serde(default = "WriterConfig::default_allocated_disk_space")]
    pub allocated_disk_space: u64,
    #[serde(default)]
    pub compression: Compression,
    #[serde(default)]
    pub disk_sync: DiskSyncConfig,
}

impl WriterConfig {
    fn default_file_buffer_bytes() -> usize { 1 << 20 }
    fn default_allocate_enabled() -> bool { true }
    fn default_allocated_disk_space() -> u64 { 100 << 20 }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            file_buffer_bytes: Self::default_file_buffer_bytes(),
            allocate_enabled: Self::default_allocate_enabled(),
            allocated_disk_space: Self::default_allocated_disk_space(),
            compression: Compression::default(),
            disk_sync: DiskSyncConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AssignmentConfig {
    /// Number of volumes assigned to a new file.
    #[serde(default = "AssignmentConfig::default_count")]
    pub count: usize,
    /// Volume types picked first, in list order.
    #[serde(default = "AssignmentConfig::default_preferred_types")]
    pub preferred_types: Vec<String>,
}

impl AssignmentConfig {
    fn default_count() -> usize { 1 }
    fn default_preferred_types() -> Vec<String> { vec!["default".to_string()] }
}

impl Default for AssignmentConfig {
    fn default() -> Self { Self { count: Self::default_count(), preferred_types: Self::default_preferred_types() } }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StatisticsConfig {
    /// Upper bound of keys written by one insert transaction.
    #[serde(default = "StatisticsConfig::default_max_keys_per_txn")]
    pub max_keys_per_txn: usize,
    /// Optimistic transaction attempts before giving up with a conflict.
    #[serde(default = "StatisticsConfig::default_max_txn_attempts")]
    pub max_txn_attempts: usize,
    /// Period of flushing open writers' counters into the repository.
    #[serde(default = "StatisticsConfig::default_collect_interval_ms")]
    pub collect_interval_ms: u64,
    /// Whole-cache invalidation period of the L2 provider.
    #[serde(default = "StatisticsConfig::default_l2_invalidation_interval_ms")]
    pub l2_invalidation_interval_ms: u64,
}

impl StatisticsConfig {
    fn default_max_keys_per_txn() -> usize { 100 }
    fn default_max_txn_attempts() -> usize { 5 }
    fn default_collect_interval_ms() -> u64 { 1_000 }
    fn default_l2_invalidation_interval_ms() -> u64 { 1_000 }

    pub fn collect_interval(&self) -> Duration { Duration::from_millis(self.collect_interval_ms) }
    pub fn l2_invalidation_interval(&self) -> Duration { Duration::from_millis(self.l2_invalidation_interval_ms) }
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            max_keys_per_txn: Self::default_max_keys_per_txn(),
            max_txn_attempts: Self::default_max_txn_attempts(),
            collect_interval_ms: Self::default_collect_interval_ms(),
            l2_invalidation_interval_ms: Self::default_l2_invalidation_interval_ms(),
        }
    }
}

impl Config {
    /// Load from a JSON file; a missing file yields the defaults. Env overrides are
    /// applied on top and the result is validated.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut cfg = match path {
            Some(p) if p.exists() => {
                let bytes = std::fs::read(p).with_context(|| format!("read config {}", p.display()))?;
                let cfg: Config = serde_json::from_slice(&bytes).with_context(|| format!("parse config {}", p.display()))?;
                info!(target: "slicestore::config", "loaded config from {}", p.display());
                cfg
            }
            Some(p) => {
                debug!(target: "slicestore::config", "config {} not found, using defaults", p.display());
                Config::default()
            }
            None => Config::default(),
        };
        cfg.apply_env(|k| std::env::var(k).ok());
        cfg.validate().context("validate config")?;
        Ok(cfg)
    }

    /// Path from `SLICESTORE_CONFIG`, if set.
    pub fn path_from_env() -> Option<PathBuf> {
        std::env::var(ENV_CONFIG).ok().filter(|s| !s.trim().is_empty()).map(PathBuf::from)
    }

    pub fn apply_env<F: Fn(&str) -> Option<String>>(&mut self, get: F) {
        if let Some(v) = get(ENV_VOLUMES_PATH).filter(|s| !s.trim().is_empty()) {
            self.volumes.path = PathBuf::from(v);
        }
        if let Some(v) = get(ENV_NODE_ID).filter(|s| !s.trim().is_empty()) {
            self.volumes.node_id = v.trim().to_string();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.volumes.node_id.is_empty() {
            return Err(StorageError::InvalidConfig("volumes.node_id must not be empty".into()));
        }
        if self.writer.file_buffer_bytes == 0 {
            return Err(StorageError::InvalidConfig("writer.file_buffer_bytes must be greater than 0".into()));
        }
        self.writer.compression.validate()?;
        self.writer.disk_sync.validate()?;
        if self.assignment.count == 0 {
            return Err(StorageError::InvalidConfig("assignment.count must be at least 1".into()));
        }
        if self.statistics.max_keys_per_txn == 0 {
            return Err(StorageError::InvalidConfig("statistics.max_keys_per_txn must be greater than 0".into()));
        }
        if self.statistics.max_txn_attempts == 0 {
            return Err(StorageError::InvalidConfig("statistics.max_txn_attempts must be greater than 0".into()));
        }
        if self.statistics.collect_interval_ms == 0 || self.statistics.l2_invalidation_interval_ms == 0 {
            return Err(StorageError::InvalidConfig("statistics intervals must be greater than 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SyncMode;

    #[test]
    fn empty_json_is_default() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, Config::default());
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.statistics.max_keys_per_txn, 100);
        assert_eq!(cfg.writer.disk_sync.mode, SyncMode::ToDisk);
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let cfg: Config = serde_json::from_str(r#"{"volumes":{"node_id":"n1"},"writer":{"disk_sync":{"mode":"disabled","wait":false}}}"#).unwrap();
        assert_eq!(cfg.volumes.node_id, "n1");
        assert_eq!(cfg.volumes.path, PathBuf::from("volumes"));
        assert!(cfg.volumes.watch_drain_file);
        assert_eq!(cfg.writer.disk_sync.mode, SyncMode::Disabled);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn env_overrides() {
        let mut cfg = Config::default();
        cfg.apply_env(|k| match k {
            ENV_VOLUMES_PATH => Some("/data/volumes".to_string()),
            ENV_NODE_ID => Some(" worker-2 ".to_string()),
            _ => None,
        });
        assert_eq!(cfg.volumes.path, PathBuf::from("/data/volumes"));
        assert_eq!(cfg.volumes.node_id, "worker-2");
    }

    #[test]
    fn invalid_values_rejected() {
        let mut cfg = Config::default();
        cfg.assignment.count = 0;
        assert!(matches!(cfg.validate(), Err(StorageError::InvalidConfig(_))));

        let mut cfg = Config::default();
        cfg.writer.disk_sync.mode = SyncMode::Disabled;
        cfg.writer.disk_sync.wait = true;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_from_file() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("slicestore.json");
        std::fs::write(&path, r#"{"assignment":{"count":2,"preferred_types":["ssd","hdd"]}}"#)?;
        let cfg = Config::load_or_default(Some(&path))?;
        assert_eq!(cfg.assignment.count, 2);
        assert_eq!(cfg.assignment.preferred_types, vec!["ssd".to_string(), "hdd".to_string()]);

        let missing = Config::load_or_default(Some(&tmp.path().join("missing.json")))?;
        assert_eq!(missing.assignment.count, 1);

        std::fs::write(&path, "not json")?;
        assert!(Config::load_or_default(Some(&path)).is_err());
        Ok(())
    }
}
