use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    #[default]
    Csv,
}

impl FileType {
    pub fn extension(&self) -> &'static str {
        match self {
            FileType::Csv => "csv",
        }
    }
}

impl FromStr for FileType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "csv" => Ok(FileType::Csv),
            other => Err(StorageError::UnsupportedFileType(other.to_string())),
        }
    }
}

impl Display for FileType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { f.write_str(self.extension()) }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    #[default]
    None,
    Gzip,
    Zstd,
}

impl CompressionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionType::None => "none",
            CompressionType::Gzip => "gzip",
            CompressionType::Zstd => "zstd",
        }
    }

    /// File name suffix, none for uncompressed payloads.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            CompressionType::None => None,
            other => Some(other.as_str()),
        }
    }

    fn default_level(&self) -> i32 {
        match self {
            CompressionType::None => 0,
            CompressionType::Gzip => 6,
            CompressionType::Zstd => 3,
        }
    }
}

impl FromStr for CompressionType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(CompressionType::None),
            "gzip" => Ok(CompressionType::Gzip),
            "zstd" => Ok(CompressionType::Zstd),
            other => Err(StorageError::UnsupportedCompression(other.to_string())),
        }
    }
}

impl Display for CompressionType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compression {
    #[serde(rename = "type", default)]
    pub kind: CompressionType,
    /// Encoder level, the type's default is used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<i32>,
}

impl Compression {
    pub fn none() -> Self { Self::default() }
    pub fn gzip() -> Self { Self { kind: CompressionType::Gzip, level: None } }
    pub fn zstd() -> Self { Self { kind: CompressionType::Zstd, level: None } }

    pub fn level(&self) -> i32 { self.level.unwrap_or_else(|| self.kind.default_level()) }

    pub fn validate(&self) -> Result<()> {
        let level = self.level();
        let ok = match self.kind {
            CompressionType::None => self.level.is_none(),
            CompressionType::Gzip => (1..=9).contains(&level),
            CompressionType::Zstd => (1..=22).contains(&level),
        };
        if !ok {
            return Err(StorageError::InvalidConfig(format!("invalid {} compression level {}", self.kind, level)));
        }
        Ok(())
    }
}

/// Payload file name, e.g. `slice.csv`, `slice.csv.gzip`, `slice.csv.zstd`.
pub fn slice_filename(file_type: FileType, compression: CompressionType) -> String {
    match compression.extension() {
        Some(ext) => format!("slice.{}.{}", file_type.extension(), ext),
        None => format!("slice.{}", file_type.extension()),
    }
}

/// Same as `slice_filename`, from the textual type names.
pub fn slice_filename_for(file_type: &str, compression: &str) -> Result<String> {
    Ok(slice_filename(file_type.parse()?, compression.parse()?))
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncMode {
    /// No sync points, writes return after buffering.
    Disabled,
    /// Flush buffers and fsync the file.
    #[default]
    ToDisk,
    /// Flush buffers to the OS page cache only.
    ToCache,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSyncConfig {
    #[serde(default)]
    pub mode: SyncMode,
    /// Block `write_row` until the next sync completes.
    #[serde(default = "DiskSyncConfig::default_wait")]
    pub wait: bool,
    #[serde(default = "DiskSyncConfig::default_check_interval_ms")]
    pub check_interval_ms: u64,
    #[serde(default = "DiskSyncConfig::default_count_trigger")]
    pub count_trigger: u64,
    #[serde(default = "DiskSyncConfig::default_uncompressed_bytes_trigger")]
    pub uncompressed_bytes_trigger: u64,
    #[serde(default = "DiskSyncConfig::default_compressed_bytes_trigger")]
    pub compressed_bytes_trigger: u64,
    #[serde(default = "DiskSyncConfig::default_interval_trigger_ms")]
    pub interval_trigger_ms: u64,
}

impl DiskSyncConfig {
    fn default_wait() -> bool { true }
    fn default_check_interval_ms() -> u64 { 5 }
    fn default_count_trigger() -> u64 { 500 }
    fn default_uncompressed_bytes_trigger() -> u64 { 1 << 20 }
    fn default_compressed_bytes_trigger() -> u64 { 256 << 10 }
    fn default_interval_trigger_ms() -> u64 { 50 }

    pub fn disabled() -> Self { Self { mode: SyncMode::Disabled, wait: false, ..Self::default() } }

    pub fn check_interval(&self) -> Duration { Duration::from_millis(self.check_interval_ms) }
    pub fn interval_trigger(&self) -> Duration { Duration::from_millis(self.interval_trigger_ms) }

    pub fn validate(&self) -> Result<()> {
        if self.mode == SyncMode::Disabled {
            if self.wait {
                return Err(StorageError::InvalidConfig("disk sync \"wait\" cannot be enabled in the \"disabled\" mode".into()));
            }
            return Ok(());
        }
        let checks = [
            ("checkInterval", self.check_interval_ms),
            ("countTrigger", self.count_trigger),
            ("uncompressedBytesTrigger", self.uncompressed_bytes_trigger),
            ("compressedBytesTrigger", self.compressed_bytes_trigger),
            ("intervalTrigger", self.interval_trigger_ms),
        ];
        for (name, v) in checks {
            if v == 0 {
                return Err(StorageError::InvalidConfig(format!("disk sync \"{}\" must be greater than 0", name)));
            }
        }
        Ok(())
    }
}

impl Default for DiskSyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::default(),
            wait: Self::default_wait(),
            check_interval_ms: Self::default_check_interval_ms(),
            count_trigger: Self::default_count_trigger(),
            uncompressed_bytes_trigger: Self::default_uncompressed_bytes_trigger(),
            compressed_bytes_trigger: Self::default_compressed_bytes_trigger(),
            interval_trigger_ms: Self::default_interval_trigger_ms(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub primary_key: bool,
}

impl Column {
    pub fn new<S: Into<String>>(name: S) -> Self { Self { name: name.into(), primary_key: false } }
}

/// Local level storage configuration of a slice.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalStorage {
    /// Slice directory relative to the volume root.
    pub dir: PathBuf,
    pub filename: String,
    #[serde(default)]
    pub allocated_disk_space: u64,
    #[serde(default)]
    pub compression: Compression,
    #[serde(default)]
    pub disk_sync: DiskSyncConfig,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagingStorage {
    #[serde(default)]
    pub compression: Compression,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filenames() {
        assert_eq!(slice_filename(FileType::Csv, CompressionType::None), "slice.csv");
        assert_eq!(slice_filename(FileType::Csv, CompressionType::Gzip), "slice.csv.gzip");
        assert_eq!(slice_filename_for("csv", "zstd").unwrap(), "slice.csv.zstd");
        assert!(matches!(slice_filename_for("parquet", "none"), Err(StorageError::UnsupportedFileType(_))));
        assert!(matches!(slice_filename_for("csv", "lz4"), Err(StorageError::UnsupportedCompression(_))));
    }

    #[test]
    fn compression_levels() {
        assert_eq!(Compression::gzip().level(), 6);
        assert!(Compression::zstd().validate().is_ok());
        assert!(Compression { kind: CompressionType::Gzip, level: Some(12) }.validate().is_err());
        assert!(Compression { kind: CompressionType::None, level: Some(1) }.validate().is_err());
    }

    #[test]
    fn disk_sync_json() {
        let cfg: DiskSyncConfig = serde_json::from_str(r#"{"mode":"toCache","wait":false}"#).unwrap();
        assert_eq!(cfg.mode, SyncMode::ToCache);
        assert_eq!(cfg.count_trigger, 500);
        assert!(cfg.validate().is_ok());
        assert_eq!(serde_json::to_value(SyncMode::ToDisk).unwrap(), "toDisk");

        let bad = DiskSyncConfig { count_trigger: 0, ..DiskSyncConfig::default() };
        assert!(bad.validate().is_err());
        assert!(DiskSyncConfig::disabled().validate().is_ok());
    }
}
