//! Local volumes.
//!
//! A volume is a directory `<root>/<type>/<label>` dedicated to slice files. It owns
//! a persisted identity (`volume-id`), an exclusive lock (`writer.lock`) and an
//! optional `drain` marker which blocks new writers while existing ones continue.

pub mod assignment;
pub mod paths;
pub mod registry;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{self, SharedClock};
use crate::config::Config;
use crate::error::{MultiError, Result, StorageError};
use crate::events::Events;
use crate::model::{Slice, SliceKey, VolumeId};
use crate::writer::file::FileOpener;
use crate::writer::{OsFileOpener, Writer, WriterDeps};

pub use registry::Volumes;

const ID_READ_ATTEMPTS: usize = 50;
const ID_READ_BACKOFF: Duration = Duration::from_millis(20);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    pub node_id: String,
    pub path: PathBuf,
    #[serde(rename = "type")]
    pub vol_type: String,
    pub label: String,
}

/// Input of the assignment algorithm.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMetadata {
    #[serde(rename = "volumeId")]
    pub id: VolumeId,
    #[serde(flatten)]
    pub spec: VolumeSpec,
}

/// Injected capabilities of volumes and their writers.
#[derive(Clone)]
pub struct VolumeDeps {
    pub clock: SharedClock,
    pub file_opener: Arc<dyn FileOpener>,
}

impl Default for VolumeDeps {
    fn default() -> Self { Self { clock: clock::system(), file_opener: Arc::new(OsFileOpener) } }
}

type WriterMap = Arc<Mutex<HashMap<SliceKey, Option<Writer>>>>;

pub struct Volume {
    spec: VolumeSpec,
    id: VolumeId,
    deps: VolumeDeps,
    file_buffer_bytes: usize,
    events: Arc<Events<Writer>>,
    drained: Arc<AtomicBool>,
    closed: AtomicBool,
    lock_file: Mutex<Option<File>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    /// `None` reserves the key while the writer is being opened.
    writers: WriterMap,
    /// Signalled when a reserved slot is resolved.
    reserved: Condvar,
}

impl Volume {
    pub fn open(spec: VolumeSpec, config: &Config, deps: VolumeDeps, parent_events: &Arc<Events<Writer>>) -> Result<Arc<Volume>> {
        let path = spec.path.clone();
        if !path.is_dir() {
            return Err(StorageError::Path { path });
        }

        let id = read_or_create_id(&path)?;
        let lock_file = lock(&path)?;

        let drained = Arc::new(AtomicBool::new(paths::drain_path(&path).exists()));
        let watcher = if config.volumes.watch_drain_file {
            match watch_drain(&path, drained.clone()) {
                Ok(w) => Some(w),
                Err(e) => {
                    release(&path, lock_file);
                    return Err(e);
                }
            }
        } else {
            None
        };

        info!(
            target: "slicestore::volume",
            "opened volume: id={}, type={}, label={}, path={}, drained={}",
            id, spec.vol_type, spec.label, path.display(), drained.load(Ordering::Acquire)
        );
        Ok(Arc::new(Volume {
            spec,
            id,
            deps,
            file_buffer_bytes: config.writer.file_buffer_bytes,
            events: parent_events.child(),
            drained,
            closed: AtomicBool::new(false),
            lock_file: Mutex::new(Some(lock_file)),
            watcher: Mutex::new(watcher),
            writers: Arc::new(Mutex::new(HashMap::new())),
            reserved: Condvar::new(),
        }))
    }

    pub fn id(&self) -> &VolumeId { &self.id }
    pub fn spec(&self) -> &VolumeSpec { &self.spec }
    pub fn path(&self) -> &Path { &self.spec.path }
    pub fn events(&self) -> &Arc<Events<Writer>> { &self.events }
    pub fn is_drained(&self) -> bool { self.drained.load(Ordering::Acquire) }
    pub fn is_closed(&self) -> bool { self.closed.load(Ordering::Acquire) }

    pub fn metadata(&self) -> VolumeMetadata { VolumeMetadata { id: self.id.clone(), spec: self.spec.clone() } }

    /// Opens a writer for the slice and fires the `on_open` hooks (volume level, then upward).
    pub fn new_writer_for(&self, slice: &Slice) -> Result<Writer> {
        if self.is_closed() {
            return Err(StorageError::Closed(format!("volume \"{}\"", self.id)));
        }
        if self.is_drained() {
            return Err(StorageError::Draining { volume: self.id.to_string() });
        }
        if slice.key.volume_id != self.id {
            return Err(StorageError::InvalidConfig(format!(
                "slice \"{}\" belongs to the volume \"{}\", not \"{}\"",
                slice.key, slice.key.volume_id.as_str(), self.id
            )));
        }
        slice.validate()?;

        let key = slice.key.clone();
        {
            let mut writers = self.writers.lock();
            if self.is_closed() {
                return Err(StorageError::Closed(format!("volume \"{}\"", self.id)));
            }
            if writers.contains_key(&key) {
                return Err(StorageError::AlreadyExists { slice: key.to_string() });
            }
            writers.insert(key.clone(), None);
        }

        let deps = WriterDeps {
            volume_path: self.path(),
            clock: self.deps.clock.clone(),
            opener: self.deps.file_opener.as_ref(),
            file_buffer_bytes: self.file_buffer_bytes,
            parent_events: &self.events,
        };
        let writer = match Writer::open(slice.clone(), deps) {
            Ok(w) => w,
            Err(e) => {
                self.resolve_reserved(&key);
                return Err(e);
            }
        };

        let map = self.writers.clone();
        let unregister_key = key.clone();
        writer.set_unregister(move || {
            map.lock().remove(&unregister_key);
        });
        {
            let mut writers = self.writers.lock();
            if !self.is_closed() {
                writers.insert(key.clone(), Some(writer.clone()));
                self.reserved.notify_all();
            } else {
                // The volume was closed meanwhile, the slot stays reserved until the writer is closed.
                drop(writers);
                if let Err(e) = writer.close() {
                    warn!(target: "slicestore::volume", "cannot close writer {} of the closed volume {}: {}", key, self.id, e);
                }
                self.resolve_reserved(&key);
                return Err(StorageError::Closed(format!("volume \"{}\"", self.id)));
            }
        }

        if let Err(e) = self.events.dispatch_open(&writer) {
            let mut errs = MultiError::new();
            errs.push(e);
            errs.append(writer.close());
            errs.into_result()?;
        }
        debug!(target: "slicestore::volume", "new writer on volume {}: {}", self.id, key);
        Ok(writer)
    }

    fn resolve_reserved(&self, key: &SliceKey) {
        let mut writers = self.writers.lock();
        if matches!(writers.get(key), Some(None)) {
            writers.remove(key);
        }
        self.reserved.notify_all();
    }

    /// Open writers sorted by slice key.
    pub fn writers(&self) -> Vec<Writer> {
        let mut out: Vec<Writer> = self.writers.lock().values().flatten().cloned().collect();
        out.sort_by(|a, b| a.key().cmp(b.key()));
        out
    }

    /// Closes all writers concurrently, then releases and removes the lock file.
    /// Writers still being opened are waited for first.
    pub fn close(&self) -> Result<()> {
        let mut writers: Vec<Writer> = {
            let mut map = self.writers.lock();
            if self.closed.swap(true, Ordering::AcqRel) {
                return Err(StorageError::Closed(format!("volume \"{}\"", self.id)));
            }
            while map.values().any(Option::is_none) {
                self.reserved.wait(&mut map);
            }
            map.values().flatten().filter(|w| !w.is_closed()).cloned().collect()
        };
        writers.sort_by(|a, b| a.key().cmp(b.key()));
        self.watcher.lock().take();

        let mut errs = MultiError::new();
        std::thread::scope(|s| {
            let handles: Vec<_> = writers.iter().map(|w| s.spawn(move || w.close())).collect();
            for (h, w) in handles.into_iter().zip(&writers) {
                match h.join() {
                    Ok(res) => { errs.append(res); }
                    Err(_) => errs.push(StorageError::Closed(format!("writer \"{}\" close panicked", w.key()))),
                }
            }
        });

        if let Some(f) = self.lock_file.lock().take() {
            release(self.path(), f);
        }
        info!(target: "slicestore::volume", "closed volume {}: writers={}", self.id, writers.len());
        errs.into_result()
    }
}

/// Reads the persisted id or creates it with create-exclusive semantics. A volume
/// opened concurrently by another process adopts the id written by the winner.
fn read_or_create_id(volume: &Path) -> Result<VolumeId> {
    let path = paths::volume_id_path(volume);
    if !path.exists() {
        let id = VolumeId::generate();
        let mut opts = OpenOptions::new();
        opts.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o640);
        }
        match opts.open(&path) {
            Ok(mut f) => {
                f.write_all(id.as_str().as_bytes())
                    .and_then(|_| f.sync_all())
                    .map_err(|e| StorageError::io(format!("write volume id {}", path.display()), e))?;
                debug!(target: "slicestore::volume", "generated volume id {} in {}", id, path.display());
                return Ok(id);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(StorageError::io(format!("create volume id {}", path.display()), e)),
        }
    }

    // The winner of a concurrent creation may not have written the content yet.
    for _ in 0..ID_READ_ATTEMPTS {
        let content = std::fs::read_to_string(&path).map_err(|e| StorageError::io(format!("read volume id {}", path.display()), e))?;
        let id = content.trim();
        if !id.is_empty() {
            return Ok(VolumeId::new(id));
        }
        std::thread::sleep(ID_READ_BACKOFF);
    }
    Err(StorageError::io(
        format!("read volume id {}", path.display()),
        std::io::Error::new(ErrorKind::InvalidData, "volume id file is empty"),
    ))
}

fn lock(volume: &Path) -> Result<File> {
    let path = paths::lock_path(volume);
    let f = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .map_err(|e| StorageError::io(format!("open lock file {}", path.display()), e))?;
    match f.try_lock_exclusive() {
        Ok(()) => Ok(f),
        Err(e) if e.kind() == ErrorKind::WouldBlock || e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
            Err(StorageError::AlreadyLocked { path })
        }
        Err(e) => Err(StorageError::io(format!("lock {}", path.display()), e)),
    }
}

fn release(volume: &Path, f: File) {
    let path = paths::lock_path(volume);
    if let Err(e) = f.unlock() {
        warn!(target: "slicestore::volume", "cannot unlock {}: {}", path.display(), e);
    }
    drop(f);
    if let Err(e) = std::fs::remove_file(&path) {
        warn!(target: "slicestore::volume", "cannot remove {}: {}", path.display(), e);
    }
}

fn watch_drain(volume: &Path, drained: Arc<AtomicBool>) -> Result<RecommendedWatcher> {
    let drain = paths::drain_path(volume);
    let target = drain.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
        Ok(ev) => {
            if ev.paths.iter().any(|p| p.file_name() == target.file_name()) {
                let now = target.exists();
                if drained.swap(now, Ordering::AcqRel) != now {
                    info!(target: "slicestore::volume", "drain marker {}: {}", if now { "created" } else { "removed" }, target.display());
                }
            }
        }
        Err(e) => warn!(target: "slicestore::volume", "drain watcher error: {}", e),
    })
    .map_err(|e| StorageError::io(format!("watch {}", volume.display()), std::io::Error::new(ErrorKind::Other, e.to_string())))?;
    watcher
        .watch(volume, RecursiveMode::NonRecursive)
        .map_err(|e| StorageError::io(format!("watch {}", volume.display()), std::io::Error::new(ErrorKind::Other, e.to_string())))?;
    debug!(target: "slicestore::volume", "watching drain marker {}", drain.display());
    Ok(watcher)
}

#[cfg(test)]
#[path = "volume_tests.rs"]
mod volume_tests;
