//! Locations of the files inside a volume directory, shared by the volume and its writers.

use std::path::{Path, PathBuf};

pub const VOLUME_ID_FILE: &str = "volume-id";
pub const LOCK_FILE: &str = "writer.lock";
pub const DRAIN_FILE: &str = "drain";
pub const COUNTER_BACKUP_FILE: &str = "completed_count";

#[inline]
pub fn volume_id_path(volume: &Path) -> PathBuf { volume.join(VOLUME_ID_FILE) }

#[inline]
pub fn lock_path(volume: &Path) -> PathBuf { volume.join(LOCK_FILE) }

#[inline]
pub fn drain_path(volume: &Path) -> PathBuf { volume.join(DRAIN_FILE) }

// ---- Slice files (under <volume>/<project>/<receiver>/<export>/<file>/<slice>) ----
#[inline]
pub fn slice_dir(volume: &Path, local_dir: &Path) -> PathBuf { volume.join(local_dir) }

#[inline]
pub fn counter_backup_path(slice_dir: &Path) -> PathBuf { slice_dir.join(COUNTER_BACKUP_FILE) }

/// `<root>/<type>/<label>`
#[inline]
pub fn volume_path(root: &Path, vol_type: &str, label: &str) -> PathBuf { root.join(vol_type).join(label) }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        let vol = volume_path(Path::new("/data"), "ssd", "1");
        assert_eq!(vol, PathBuf::from("/data/ssd/1"));
        assert_eq!(lock_path(&vol), PathBuf::from("/data/ssd/1/writer.lock"));
        let dir = slice_dir(&vol, Path::new("123/r/e/f/s"));
        assert_eq!(counter_backup_path(&dir), PathBuf::from("/data/ssd/1/123/r/e/f/s/completed_count"));
    }
}
