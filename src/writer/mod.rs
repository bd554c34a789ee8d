//! Per-slice writer.
//!
//! Write chain, outermost first:
//! CSV rows -> uncompressed size meter -> compression -> buffer -> compressed size meter -> file.
//! The compressed size counts bytes handed to the file, buffered bytes are not included.
//! Writes to one slice are serialised by the chain lock; different slices never share a lock.

pub mod compression;
pub mod counter;
pub mod csv;
pub mod file;
pub mod meter;
pub mod sync;

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::error::{MultiError, Result, StorageError};
use crate::events::Events;
use crate::model::{Slice, SliceKey, SyncMode, UtcTime};
use crate::statistics::Value;
use crate::volume::paths;

use self::compression::CompressionWriter;
use self::counter::RowCount;
use self::file::{FileOpener, SliceFile};
use self::meter::SizeMeter;
use self::sync::{Snapshot, Syncer};

pub use self::file::OsFileOpener;

type Chain = SizeMeter<CompressionWriter<BufWriter<SizeMeter<Box<dyn SliceFile>>>>>;

/// Point-in-time counters of a writer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriterStats {
    pub slice_key: SliceKey,
    pub rows_count: u64,
    pub first_record_at: Option<UtcTime>,
    pub last_record_at: Option<UtcTime>,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
}

impl WriterStats {
    pub fn to_value(&self) -> Value {
        Value {
            slices_count: 1,
            first_record_at: self.first_record_at,
            last_record_at: self.last_record_at,
            records_count: self.rows_count,
            uncompressed_size: self.uncompressed_size,
            compressed_size: self.compressed_size,
            staging_size: 0,
        }
    }
}

/// Everything a writer needs from its volume.
pub(crate) struct WriterDeps<'a> {
    pub volume_path: &'a Path,
    pub clock: SharedClock,
    pub opener: &'a dyn FileOpener,
    pub file_buffer_bytes: usize,
    pub parent_events: &'a Arc<Events<Writer>>,
}

/// Handle of an open slice writer, cheap to clone.
#[derive(Clone)]
pub struct Writer {
    inner: Arc<WriterInner>,
}

struct WriterInner {
    slice: Slice,
    dir_path: PathBuf,
    file_path: PathBuf,
    backup_path: PathBuf,
    clock: SharedClock,
    events: Arc<Events<Writer>>,
    chain: Mutex<Option<Chain>>,
    uncompressed: Arc<AtomicU64>,
    compressed: Arc<AtomicU64>,
    /// Rows written into the chain.
    accepted: Mutex<RowCount>,
    /// Rows acknowledged to callers.
    completed: Mutex<RowCount>,
    syncer: Syncer,
    closed: AtomicBool,
    in_flight: Mutex<usize>,
    in_flight_cv: Condvar,
    unregister: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

struct InFlight<'a>(&'a WriterInner);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut n = self.0.in_flight.lock();
        *n -= 1;
        if *n == 0 {
            self.0.in_flight_cv.notify_all();
        }
    }
}

impl Writer {
    pub(crate) fn open(slice: Slice, deps: WriterDeps<'_>) -> Result<Writer> {
        let dir_path = paths::slice_dir(deps.volume_path, &slice.local_storage.dir);
        std::fs::create_dir_all(&dir_path).map_err(|e| StorageError::io(format!("create slice dir {}", dir_path.display()), e))?;
        let file_path = dir_path.join(&slice.local_storage.filename);
        let mut file = deps.opener.open(&file_path).map_err(|e| StorageError::io(format!("open slice file {}", file_path.display()), e))?;

        let size = slice.local_storage.allocated_disk_space;
        if size > 0 {
            match file.allocate(size) {
                Ok(true) => debug!(target: "slicestore::writer", "allocated {} bytes: {}", size, file_path.display()),
                Ok(false) => debug!(target: "slicestore::writer", "disk space allocation is not supported: {}", file_path.display()),
                Err(e) => warn!(target: "slicestore::writer", "cannot allocate disk space for {}: {}", file_path.display(), e),
            }
        }

        let existing = file.len().map_err(|e| StorageError::io(format!("stat slice file {}", file_path.display()), e))?;
        let backup_path = paths::counter_backup_path(&dir_path);
        let rows = RowCount::load(&backup_path)?;

        let compressed = SizeMeter::new(file, existing);
        let compressed_counter = compressed.counter();
        let buffered = BufWriter::with_capacity(deps.file_buffer_bytes, compressed);
        let compression = CompressionWriter::new(buffered, &slice.local_storage.compression)
            .map_err(|e| StorageError::io(format!("init compression of {}", file_path.display()), e))?;
        let chain = SizeMeter::new(compression, 0);
        let uncompressed_counter = chain.counter();

        let initial = Snapshot { rows: rows.count, uncompressed: 0, compressed: existing };
        let syncer = Syncer::new(slice.local_storage.disk_sync, initial, deps.clock.now());
        let key = slice.key.clone();
        let inner = Arc::new(WriterInner {
            dir_path,
            file_path,
            backup_path,
            clock: deps.clock,
            events: deps.parent_events.child(),
            chain: Mutex::new(Some(chain)),
            uncompressed: uncompressed_counter,
            compressed: compressed_counter,
            accepted: Mutex::new(rows),
            completed: Mutex::new(rows),
            syncer,
            closed: AtomicBool::new(false),
            in_flight: Mutex::new(0),
            in_flight_cv: Condvar::new(),
            unregister: Mutex::new(None),
            slice,
        });

        if inner.syncer.is_enabled() {
            let weak = Arc::downgrade(&inner);
            inner.syncer.start(format!("sync-{}", key.opened_at), move || match weak.upgrade() {
                Some(inner) => {
                    Writer { inner }.tick();
                    true
                }
                None => false,
            })?;
        }
        debug!(target: "slicestore::writer", "opened writer {}: resumed_rows={}, resumed_bytes={}", key, rows.count, existing);
        Ok(Writer { inner })
    }

    pub fn slice(&self) -> &Slice { &self.inner.slice }
    pub fn key(&self) -> &SliceKey { &self.inner.slice.key }
    pub fn dir_path(&self) -> &Path { &self.inner.dir_path }
    pub fn file_path(&self) -> &Path { &self.inner.file_path }
    pub fn events(&self) -> &Arc<Events<Writer>> { &self.inner.events }
    pub fn is_closed(&self) -> bool { self.inner.closed.load(Ordering::Acquire) }

    pub fn rows_count(&self) -> u64 { self.inner.completed.lock().count }
    pub fn uncompressed_size(&self) -> u64 { self.inner.uncompressed.load(Ordering::Acquire) }
    pub fn compressed_size(&self) -> u64 { self.inner.compressed.load(Ordering::Acquire) }
    pub fn syncs_count(&self) -> u64 { self.inner.syncer.syncs_count() }

    pub fn stats(&self) -> WriterStats {
        let rows = *self.inner.completed.lock();
        WriterStats {
            slice_key: self.key().clone(),
            rows_count: rows.count,
            first_record_at: rows.first_at,
            last_record_at: rows.last_at,
            uncompressed_size: self.uncompressed_size(),
            compressed_size: self.compressed_size(),
        }
    }

    /// Encodes and writes one row. In `wait` mode blocks until the next sync and returns its error.
    pub fn write_row(&self, timestamp: UtcTime, values: &[JsonValue]) -> Result<()> {
        let _guard = self.enter()?;
        let mut row = Vec::with_capacity(128);
        csv::encode_row(&self.inner.slice.columns, values, &mut row)?;

        let notifier = {
            let mut chain = self.inner.chain.lock();
            let chain = chain.as_mut().ok_or_else(|| self.closed_error())?;
            chain.write_all(&row).map_err(|e| StorageError::io(format!("write slice {}", self.key()), e))?;
            self.inner.accepted.lock().add(timestamp, 1);
            // Taken under the chain lock: the row is covered by the sync this notifier belongs to.
            self.inner.syncer.notifier()
        };
        if let Some(n) = notifier {
            n.wait()?;
        }
        self.inner.completed.lock().add(timestamp, 1);
        Ok(())
    }

    fn enter(&self) -> Result<InFlight<'_>> {
        let mut n = self.inner.in_flight.lock();
        if self.is_closed() {
            return Err(self.closed_error());
        }
        *n += 1;
        Ok(InFlight(&self.inner))
    }

    fn closed_error(&self) -> StorageError { StorageError::Closed(format!("writer \"{}\"", self.key())) }

    fn snapshot(&self) -> Snapshot {
        Snapshot { rows: self.inner.accepted.lock().count, uncompressed: self.uncompressed_size(), compressed: self.compressed_size() }
    }

    fn tick(&self) {
        if self.inner.syncer.should_sync(self.snapshot(), self.inner.clock.now()) {
            if let Err(e) = self.sync(false) {
                warn!(target: "slicestore::sync", "sync of {} failed: {}", self.key(), e);
            }
        }
    }

    /// Flushes buffers (and fsyncs in `toDisk` mode), wakes waiting writers and
    /// rewrites the row counter backup.
    pub fn sync(&self, force: bool) -> Result<()> {
        let Some(_lock) = self.inner.syncer.lock(force) else { return Ok(()) };
        let mode = self.inner.syncer.config().mode;
        let (notifier, rows, res) = {
            let mut chain = self.inner.chain.lock();
            let Some(chain) = chain.as_mut() else { return Ok(()) };
            let rows = *self.inner.accepted.lock();
            let notifier = self.inner.syncer.begin(self.snapshot(), self.inner.clock.now());
            (notifier, rows, sync_chain(chain, mode))
        };
        let res = res.map_err(|e| StorageError::io(format!("sync slice {}", self.key()), e));
        notifier.complete(res.as_ref().map(|_| ()).map_err(|e| e.to_string()));
        res?;
        rows.store(&self.inner.backup_path)?;
        debug!(target: "slicestore::sync", "synced {}: mode={:?}, rows={}", self.key(), mode, rows.count);
        Ok(())
    }

    pub(crate) fn set_unregister<F: FnOnce() + Send + 'static>(&self, f: F) { *self.inner.unregister.lock() = Some(Box::new(f)); }

    /// Final sync, then closes the file. Counters afterwards reflect exactly the flushed data.
    pub fn close(&self) -> Result<()> {
        {
            let _n = self.inner.in_flight.lock();
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return Err(self.closed_error());
            }
        }
        let inner = &self.inner;
        let mode = inner.syncer.config().mode;
        let mut errs = MultiError::new();

        inner.syncer.stop();
        if mode != SyncMode::Disabled {
            errs.append(self.sync(true));
        }

        let chain = inner.chain.lock().take();
        let res = match chain {
            Some(chain) => close_chain(chain, mode).map_err(|e| StorageError::io(format!("close slice {}", self.key()), e)),
            None => Ok(()),
        };
        inner.syncer.finish(res.as_ref().map(|_| ()).map_err(|e| e.to_string()));
        errs.append(res);

        {
            let mut n = inner.in_flight.lock();
            while *n > 0 {
                inner.in_flight_cv.wait(&mut n);
            }
        }

        let rows = *inner.accepted.lock();
        errs.append(rows.store(&inner.backup_path));
        errs.append(inner.events.dispatch_close(self));
        if let Some(unregister) = inner.unregister.lock().take() {
            unregister();
        }
        info!(
            target: "slicestore::writer",
            "closed writer {}: rows={}, uncompressed={}, compressed={}",
            self.key(), self.rows_count(), self.uncompressed_size(), self.compressed_size()
        );
        errs.into_result()
    }
}

fn sync_chain(chain: &mut Chain, mode: SyncMode) -> std::io::Result<()> {
    chain.flush()?;
    if mode == SyncMode::ToDisk {
        chain.get_mut().get_mut().get_mut().get_mut().sync()?;
    }
    Ok(())
}

fn close_chain(chain: Chain, mode: SyncMode) -> std::io::Result<()> {
    let mut buffered = chain.into_inner().finish()?;
    buffered.flush()?;
    let mut file = buffered.into_inner().map_err(|e| e.into_error())?.into_inner();
    if mode != SyncMode::Disabled {
        file.sync()?;
    }
    Ok(())
}
