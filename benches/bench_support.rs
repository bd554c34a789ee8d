use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use slicestore::config::Config;
use slicestore::events::Events;
use slicestore::model::{Column, Compression, DiskSyncConfig, ExportKey, FileKey, ReceiverKey, Slice, SliceKey, UtcTime};
use slicestore::volume::{Volume, VolumeDeps, VolumeSpec};
use slicestore::writer::Writer;

pub struct BenchCtx {
    pub tmp_dir: tempfile::TempDir,
    pub config: Config,
    pub volume: Arc<Volume>,
    next_slice: u64,
}

impl BenchCtx {
    pub fn new(compression: Compression, disk_sync: DiskSyncConfig) -> Result<Self> {
        let tmp = tempfile::tempdir().context("tempdir")?;
        let mut config = Config::default();
        config.volumes.watch_drain_file = false;
        config.writer.compression = compression;
        config.writer.disk_sync = disk_sync;
        let spec = VolumeSpec { node_id: "bench".into(), path: tmp.path().to_path_buf(), vol_type: "default".into(), label: "1".into() };
        let volume = Volume::open(spec, &config, VolumeDeps::default(), &Events::new()).context("Volume::open")?;
        Ok(BenchCtx { tmp_dir: tmp, config, volume, next_slice: 0 })
    }

    pub fn root_path(&self) -> PathBuf { self.tmp_dir.path().to_path_buf() }

    /// New writer for a fresh slice, every call uses a distinct slice open time.
    pub fn new_writer(&mut self, columns: usize) -> Result<Writer> {
        self.next_slice += 1;
        let export = ExportKey::new(ReceiverKey::new(1, "bench"), "bench");
        let file = FileKey::new(export, "2000-01-01T00:00:00.000Z".parse()?);
        let opened_at = UtcTime::new(file.opened_at.as_datetime() + chrono::Duration::milliseconds(self.next_slice as i64));
        let key = SliceKey::new(file, self.volume.id().clone(), opened_at);
        let columns = (0..columns).map(|i| Column::new(format!("c{}", i))).collect();
        let slice = Slice::new(key, columns, &self.config.writer)?;
        Ok(self.volume.new_writer_for(&slice)?)
    }
}

impl Drop for BenchCtx {
    fn drop(&mut self) { let _ = self.volume.close(); }
}
