//! Collection of the local volumes of a node.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{assignment, Volume, VolumeDeps, VolumeMetadata, VolumeSpec};
use crate::config::{AssignmentConfig, Config};
use crate::error::{MultiError, Result, StorageError};
use crate::events::Events;
use crate::model::{FileKey, UtcTime, VolumeId};
use crate::writer::Writer;

pub struct Volumes {
    assignment: AssignmentConfig,
    events: Arc<Events<Writer>>,
    volumes: BTreeMap<VolumeId, Arc<Volume>>,
    closed: AtomicBool,
}

impl Volumes {
    /// Discovers and opens every `<root>/<type>/<label>` directory. Errors of all
    /// volumes are joined; on any error the successfully opened volumes are closed again.
    pub fn open(config: &Config, deps: VolumeDeps) -> Result<Arc<Volumes>> {
        let root = config.volumes.path.as_path();
        let specs = discover(root, &config.volumes.node_id)?;
        let events = Events::new();

        let mut errs = MultiError::new();
        let mut volumes: BTreeMap<VolumeId, Arc<Volume>> = BTreeMap::new();
        for spec in specs {
            let path = spec.path.clone();
            let Some(vol) = errs.append(Volume::open(spec, config, deps.clone(), &events)) else { continue };
            if let Some(other) = volumes.get(vol.id()) {
                errs.push(StorageError::InvalidConfig(format!(
                    "volume id \"{}\" found in \"{}\" and \"{}\"",
                    vol.id(), other.path().display(), path.display()
                )));
                errs.append(vol.close());
                continue;
            }
            volumes.insert(vol.id().clone(), vol);
        }

        if let Err(err) = errs.into_result() {
            for vol in volumes.values() {
                if let Err(e) = vol.close() {
                    warn!(target: "slicestore::volume", "cannot close volume {} after a failed open: {}", vol.id(), e);
                }
            }
            return Err(err);
        }

        info!(target: "slicestore::volume", "opened {} volumes under {}", volumes.len(), root.display());
        Ok(Arc::new(Volumes { assignment: config.assignment.clone(), events, volumes, closed: AtomicBool::new(false) }))
    }

    /// Root of the hook hierarchy, `on_open` / `on_close` fire here for every writer.
    pub fn events(&self) -> &Arc<Events<Writer>> { &self.events }

    pub fn get(&self, id: &VolumeId) -> Option<Arc<Volume>> { self.volumes.get(id).cloned() }

    /// All volumes ordered by id.
    pub fn all(&self) -> Vec<Arc<Volume>> { self.volumes.values().cloned().collect() }

    pub fn len(&self) -> usize { self.volumes.len() }
    pub fn is_empty(&self) -> bool { self.volumes.is_empty() }

    pub fn metadata(&self) -> Vec<VolumeMetadata> { self.volumes.values().map(|v| v.metadata()).collect() }

    /// Open writers of all volumes.
    pub fn writers(&self) -> Vec<Writer> { self.volumes.values().flat_map(|v| v.writers()).collect() }

    /// Picks `count` non-drained volumes, deterministic for the file open time.
    pub fn volumes_for(&self, file_opened_at: UtcTime, count: usize, preferred_types: &[String]) -> Vec<Arc<Volume>> {
        let candidates: Vec<VolumeMetadata> = self.volumes.values().filter(|v| !v.is_drained()).map(|v| v.metadata()).collect();
        assignment::volumes_for(&candidates, count, preferred_types, file_opened_at.timestamp_nanos())
            .iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    /// Assigns volumes to a new file with the configured count and preferred types.
    pub fn assign(&self, file: &FileKey) -> Result<Vec<VolumeId>> {
        let ids: Vec<VolumeId> =
            self.volumes_for(file.opened_at, self.assignment.count, &self.assignment.preferred_types).iter().map(|v| v.id().clone()).collect();
        if ids.is_empty() {
            warn!(target: "slicestore::volume", "no volume is available for the file {}", file);
        }
        debug!(target: "slicestore::volume", "assigned volumes to {}: {:?}", file, ids);
        Ok(ids)
    }

    /// Closes all volumes concurrently.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(StorageError::Closed("volumes".into()));
        }
        let mut errs = MultiError::new();
        std::thread::scope(|s| {
            let handles: Vec<_> = self.volumes.values().map(|v| s.spawn(move || v.close())).collect();
            for h in handles {
                match h.join() {
                    Ok(res) => { errs.append(res); }
                    Err(_) => errs.push(StorageError::Closed("volume close panicked".into())),
                }
            }
        });
        info!(target: "slicestore::volume", "closed {} volumes", self.volumes.len());
        errs.into_result()
    }
}

/// `<root>/<type>/<label>` directories, sorted by path.
fn discover(root: &Path, node_id: &str) -> Result<Vec<VolumeSpec>> {
    if !root.is_dir() {
        return Err(StorageError::Path { path: root.to_path_buf() });
    }
    let mut out = Vec::new();
    for type_dir in sorted_dirs(root)? {
        for label_dir in sorted_dirs(&type_dir)? {
            let (Some(vol_type), Some(label)) = (file_name(&type_dir), file_name(&label_dir)) else { continue };
            out.push(VolumeSpec { node_id: node_id.to_string(), path: label_dir, vol_type, label });
        }
    }
    debug!(target: "slicestore::volume", "discovered {} volume directories under {}", out.len(), root.display());
    Ok(out)
}

fn sorted_dirs(dir: &Path) -> Result<Vec<std::path::PathBuf>> {
    let rd = std::fs::read_dir(dir).map_err(|e| StorageError::io(format!("read dir {}", dir.display()), e))?;
    let mut out = Vec::new();
    for entry in rd {
        let entry = entry.map_err(|e| StorageError::io(format!("read dir {}", dir.display()), e))?;
        let path = entry.path();
        if path.is_dir() {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

fn file_name(p: &Path) -> Option<String> { p.file_name().and_then(|n| n.to_str()).map(str::to_string) }
