use serde::{Deserialize, Serialize};

use super::key::{FileKey, SliceKey, VolumeId};
use super::local::{slice_filename, Column, Compression, DiskSyncConfig, FileType, LocalStorage, StagingStorage};
use super::state::{check_timestamps, FileState, RetryBackoff, Retryable, SliceState};
use super::time::UtcTime;
use crate::config::WriterConfig;
use crate::error::{Result, StorageError};

/// Unit of local writing: one payload file per slice per volume per open period.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slice {
    #[serde(flatten)]
    pub key: SliceKey,
    #[serde(rename = "type")]
    pub file_type: FileType,
    pub state: SliceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closing_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploading_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_at: Option<UtcTime>,
    #[serde(flatten)]
    pub retryable: Retryable,
    pub columns: Vec<Column>,
    pub local_storage: LocalStorage,
    #[serde(default)]
    pub staging_storage: StagingStorage,
}

impl Slice {
    pub fn new(key: SliceKey, columns: Vec<Column>, config: &WriterConfig) -> Result<Self> {
        let slice = Self {
            local_storage: LocalStorage {
                dir: key.local_dir(),
                filename: slice_filename(FileType::Csv, config.compression.kind),
                allocated_disk_space: if config.allocate_enabled { config.allocated_disk_space } else { 0 },
                compression: config.compression,
                disk_sync: config.disk_sync,
            },
            key,
            file_type: FileType::Csv,
            state: SliceState::Writing,
            closing_at: None,
            uploading_at: None,
            uploaded_at: None,
            imported_at: None,
            retryable: Retryable::default(),
            columns,
            staging_storage: StagingStorage { compression: Compression::gzip() },
        };
        slice.validate()?;
        Ok(slice)
    }

    /// Moves to the next state and stamps its timestamp. Use `fail` to enter `failed`.
    pub fn transition_to(&mut self, to: SliceState, now: UtcTime) -> Result<()> {
        if to == SliceState::Failed || !self.state.can_transition_to(to) {
            return Err(StorageError::InvalidTransition { from: self.state.to_string(), to: to.to_string() });
        }
        match to {
            SliceState::Closing => self.closing_at = Some(now),
            SliceState::Uploading => self.uploading_at = Some(now),
            SliceState::Uploaded => { self.uploaded_at = Some(now); self.retryable.reset(); }
            SliceState::Imported => self.imported_at = Some(now),
            SliceState::Writing | SliceState::Failed => {}
        }
        self.state = to;
        Ok(())
    }

    /// Records a failed upload attempt, the slice returns to `uploading` when it is retried.
    pub fn fail(&mut self, now: UtcTime, reason: &str, backoff: &RetryBackoff) -> Result<()> {
        if !self.state.can_transition_to(SliceState::Failed) {
            return Err(StorageError::InvalidTransition { from: self.state.to_string(), to: SliceState::Failed.to_string() });
        }
        self.retryable.increment(now, reason, backoff);
        self.state = SliceState::Failed;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.columns.is_empty() {
            return Err(StorageError::InvalidConfig(format!("slice \"{}\" must have at least one column", self.key)));
        }
        self.local_storage.compression.validate()?;
        self.local_storage.disk_sync.validate()?;
        self.staging_storage.compression.validate()?;

        let passed = match self.state {
            SliceState::Writing => 0,
            SliceState::Closing => 1,
            SliceState::Uploading | SliceState::Failed => 2,
            SliceState::Uploaded => 3,
            SliceState::Imported => 4,
        };
        check_timestamps(
            self.state.as_str(),
            &[
                ("closingAt", passed >= 1, self.closing_at.is_some()),
                ("uploadingAt", passed >= 2, self.uploading_at.is_some()),
                ("uploadedAt", passed >= 3, self.uploaded_at.is_some()),
                ("importedAt", passed >= 4, self.imported_at.is_some()),
            ],
        )?;
        if self.state == SliceState::Failed && self.retryable.retry_attempt == 0 {
            return Err(StorageError::InvalidTimestamps("failed slice must have retryAttempt > 0".into()));
        }
        self.retryable.validate()
    }
}

/// Group of slices destined for one target table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct File {
    #[serde(flatten)]
    pub key: FileKey,
    pub state: FileState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closing_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importing_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_at: Option<UtcTime>,
    #[serde(flatten)]
    pub retryable: Retryable,
    pub columns: Vec<Column>,
    pub assigned_volumes: Vec<VolumeId>,
}

impl File {
    pub fn new(key: FileKey, columns: Vec<Column>, assigned_volumes: Vec<VolumeId>) -> Result<Self> {
        let file = Self {
            key,
            state: FileState::Writing,
            closing_at: None,
            importing_at: None,
            imported_at: None,
            retryable: Retryable::default(),
            columns,
            assigned_volumes,
        };
        file.validate()?;
        Ok(file)
    }

    /// New slice of the file on one of its assigned volumes.
    pub fn new_slice(&self, volume_id: &VolumeId, opened_at: UtcTime, config: &WriterConfig) -> Result<Slice> {
        if !self.assigned_volumes.contains(volume_id) {
            return Err(StorageError::InvalidConfig(format!(
                "volume \"{}\" is not assigned to the file \"{}\"",
                volume_id.as_str(),
                self.key
            )));
        }
        Slice::new(SliceKey::new(self.key.clone(), volume_id.clone(), opened_at), self.columns.clone(), config)
    }

    pub fn transition_to(&mut self, to: FileState, now: UtcTime) -> Result<()> {
        if to == FileState::Failed || !self.state.can_transition_to(to) {
            return Err(StorageError::InvalidTransition { from: self.state.to_string(), to: to.to_string() });
        }
        match to {
            FileState::Closing => self.closing_at = Some(now),
            FileState::Importing => self.importing_at = Some(now),
            FileState::Imported => { self.imported_at = Some(now); self.retryable.reset(); }
            FileState::Writing | FileState::Failed => {}
        }
        self.state = to;
        Ok(())
    }

    pub fn fail(&mut self, now: UtcTime, reason: &str, backoff: &RetryBackoff) -> Result<()> {
        if !self.state.can_transition_to(FileState::Failed) {
            return Err(StorageError::InvalidTransition { from: self.state.to_string(), to: FileState::Failed.to_string() });
        }
        self.retryable.increment(now, reason, backoff);
        self.state = FileState::Failed;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.columns.is_empty() {
            return Err(StorageError::InvalidConfig(format!("file \"{}\" must have at least one column", self.key)));
        }
        if self.assigned_volumes.is_empty() {
            return Err(StorageError::InvalidConfig(format!("file \"{}\" must have at least one volume", self.key)));
        }
        let passed = match self.state {
            FileState::Writing => 0,
            FileState::Closing => 1,
            FileState::Importing | FileState::Failed => 2,
            FileState::Imported => 3,
        };
        check_timestamps(
            self.state.as_str(),
            &[
                ("closingAt", passed >= 1, self.closing_at.is_some()),
                ("importingAt", passed >= 2, self.importing_at.is_some()),
                ("importedAt", passed >= 3, self.imported_at.is_some()),
            ],
        )?;
        if self.state == FileState::Failed && self.retryable.retry_attempt == 0 {
            return Err(StorageError::InvalidTimestamps("failed file must have retryAttempt > 0".into()));
        }
        self.retryable.validate()
    }
}
