//! Data model shared by volumes, writers and the statistics repository.

mod key;
mod local;
mod slice;
mod state;
mod time;

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

pub use key::{ExportKey, FileKey, ObjectKey, ProjectId, ReceiverKey, SliceKey, VolumeId};
pub use local::{
    slice_filename, slice_filename_for, Column, Compression, CompressionType, DiskSyncConfig, FileType, LocalStorage,
    StagingStorage, SyncMode,
};
pub use slice::{File, Slice};
pub use state::{FileState, RetryBackoff, Retryable, SliceState};
pub use time::UtcTime;

#[cfg(test)]
pub(crate) use key::test_slice_key;

/// Where the data of a slice currently resides.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Local,
    Staging,
    Target,
}

impl Level {
    pub const ALL: [Level; 3] = [Level::Local, Level::Staging, Level::Target];

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Local => "local",
            Level::Staging => "staging",
            Level::Target => "target",
        }
    }
}

impl Display for Level {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}
