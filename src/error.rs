//! Unified storage error model.
//! Every fallible operation of the engine returns `StorageError`. Errors are grouped
//! into a small taxonomy (`ErrorKind`) so callers can decide between "fix the input",
//! "pick another volume / wait", "I/O problem" and "retry the store round-trip"
//! without matching individual variants.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

/// Coarse classification of a `StorageError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input or configuration, never retried automatically.
    Validation,
    /// Volume locked, writer exists, volume draining.
    Contention,
    /// Local disk I/O.
    Io,
    /// Key-value store round-trip or watch.
    Store,
    /// The resource was already closed.
    Closed,
    /// Several independent failures, see `MultiError`.
    Multiple,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("volume path \"{}\" does not exist or is not a directory", path.display())]
    Path { path: PathBuf },

    #[error("cannot acquire writer lock \"{}\": already locked", path.display())]
    AlreadyLocked { path: PathBuf },

    #[error("writer for slice \"{slice}\" already exists")]
    AlreadyExists { slice: String },

    #[error("volume \"{volume}\" is draining, new writers are not allowed")]
    Draining { volume: String },

    #[error("{0} is closed")]
    Closed(String),

    #[error("expected {expected} columns in the row, given {given}")]
    ColumnsCount { expected: usize, given: usize },

    #[error("cannot convert value of the column \"{column}\" to string: {message}")]
    InvalidValue { column: String, message: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unexpected state transition from \"{from}\" to \"{to}\"")]
    InvalidTransition { from: String, to: String },

    #[error("invalid state timestamps: {0}")]
    InvalidTimestamps(String),

    #[error("unsupported file type \"{0}\"")]
    UnsupportedFileType(String),

    #[error("unsupported compression \"{0}\"")]
    UnsupportedCompression(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(String),

    #[error("transaction has {ops} operations, the store allows at most {max}")]
    TxnTooLarge { ops: usize, max: usize },

    #[error("transaction conflict: gave up after {attempts} attempts")]
    TxnConflict { attempts: usize },

    #[error("watch stream lagged behind by {0} responses")]
    WatchLagged(u64),

    #[error("sync failed: {0}")]
    Sync(String),

    #[error("{0}")]
    Multi(MultiError),
}

impl StorageError {
    pub fn io<S: Into<String>>(context: S, source: std::io::Error) -> Self {
        StorageError::Io { context: context.into(), source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::ColumnsCount { .. }
            | StorageError::InvalidValue { .. }
            | StorageError::InvalidConfig(_)
            | StorageError::InvalidTransition { .. }
            | StorageError::InvalidTimestamps(_)
            | StorageError::UnsupportedFileType(_)
            | StorageError::UnsupportedCompression(_)
            | StorageError::Json(_) => ErrorKind::Validation,
            StorageError::AlreadyLocked { .. }
            | StorageError::AlreadyExists { .. }
            | StorageError::Draining { .. } => ErrorKind::Contention,
            StorageError::Path { .. } | StorageError::Io { .. } | StorageError::Sync(_) => ErrorKind::Io,
            StorageError::Store(_)
            | StorageError::TxnTooLarge { .. }
            | StorageError::TxnConflict { .. }
            | StorageError::WatchLagged(_) => ErrorKind::Store,
            StorageError::Closed(_) => ErrorKind::Closed,
            StorageError::Multi(_) => ErrorKind::Multiple,
        }
    }

    /// Stable snake_case code, useful for logs and the outer API layer.
    pub fn code(&self) -> &'static str {
        match self {
            StorageError::Path { .. } => "path_error",
            StorageError::AlreadyLocked { .. } => "already_locked",
            StorageError::AlreadyExists { .. } => "already_exists",
            StorageError::Draining { .. } => "draining",
            StorageError::Closed(_) => "closed",
            StorageError::ColumnsCount { .. } => "columns_count",
            StorageError::InvalidValue { .. } => "invalid_value",
            StorageError::InvalidConfig(_) => "invalid_config",
            StorageError::InvalidTransition { .. } => "invalid_transition",
            StorageError::InvalidTimestamps(_) => "invalid_timestamps",
            StorageError::UnsupportedFileType(_) => "unsupported_file_type",
            StorageError::UnsupportedCompression(_) => "unsupported_compression",
            StorageError::Io { .. } => "io_error",
            StorageError::Json(_) => "json_error",
            StorageError::Store(_) => "store_error",
            StorageError::TxnTooLarge { .. } => "txn_too_large",
            StorageError::TxnConflict { .. } => "txn_conflict",
            StorageError::WatchLagged(_) => "watch_lagged",
            StorageError::Sync(_) => "sync_error",
            StorageError::Multi(_) => "multiple_errors",
        }
    }

    /// Retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::Multi(m) => m.errors().iter().all(|e| e.is_retryable()),
            other => matches!(other.kind(), ErrorKind::Store | ErrorKind::Contention),
        }
    }
}

/// Collects independent failures (closing N writers, firing M hooks, committing
/// K transaction batches) so none of them is dropped.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<StorageError>,
}

impl MultiError {
    pub fn new() -> Self { Self::default() }

    pub fn push(&mut self, err: StorageError) {
        // Flatten nested joins, the output should be a flat list.
        match err {
            StorageError::Multi(inner) => self.errors.extend(inner.errors),
            other => self.errors.push(other),
        }
    }

    pub fn append<T>(&mut self, res: Result<T>) -> Option<T> {
        match res {
            Ok(v) => Some(v),
            Err(err) => { self.push(err); None }
        }
    }

    pub fn errors(&self) -> &[StorageError] { &self.errors }
    pub fn len(&self) -> usize { self.errors.len() }
    pub fn is_empty(&self) -> bool { self.errors.is_empty() }

    /// `Ok` if nothing was collected, the single error if there is one, otherwise the joined error.
    pub fn into_result(mut self) -> Result<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(StorageError::Multi(self)),
        }
    }
}

impl Display for MultiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} errors occurred:", self.errors.len())?;
        for err in &self.errors {
            write!(f, "\n- {}", err)?;
        }
        Ok(())
    }
}
