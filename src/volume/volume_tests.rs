use super::*;
use crate::model::{Column, DiskSyncConfig, ExportKey, FileKey, ReceiverKey, UtcTime};
use crate::writer::file::SliceFile;
use serde_json::json;
use std::sync::atomic::AtomicUsize;
use std::sync::mpsc;
use std::time::Instant;

fn config() -> Config {
    let mut c = Config::default();
    c.volumes.watch_drain_file = false;
    c.writer.allocate_enabled = false;
    c.writer.disk_sync = DiskSyncConfig::disabled();
    c
}

fn spec(path: &Path) -> VolumeSpec {
    VolumeSpec { node_id: "node-1".into(), path: path.to_path_buf(), vol_type: "ssd".into(), label: "1".into() }
}

fn slice_for(vol: &Volume, opened_at: &str) -> Slice {
    let export = ExportKey::new(ReceiverKey::new(123, "my-receiver"), "my-export");
    let file = FileKey::new(export, "2000-01-01T01:00:00.000Z".parse().unwrap());
    let key = SliceKey::new(file, vol.id().clone(), opened_at.parse().unwrap());
    Slice::new(key, vec![Column::new("id"), Column::new("body")], &config().writer).unwrap()
}

fn open(path: &Path) -> Result<Arc<Volume>> { Volume::open(spec(path), &config(), VolumeDeps::default(), &Events::new()) }

#[test]
fn missing_directory_is_a_path_error() {
    let tmp = tempfile::tempdir().unwrap();
    let err = open(&tmp.path().join("missing")).err().unwrap();
    assert!(matches!(err, StorageError::Path { .. }));
}

#[test]
fn id_is_persisted_and_lock_is_exclusive() {
    let tmp = tempfile::tempdir().unwrap();
    let vol = open(tmp.path()).unwrap();
    let id = vol.id().clone();
    assert_eq!(id.as_str().len(), 16);
    assert!(paths::lock_path(tmp.path()).exists());

    let err = open(tmp.path()).err().unwrap();
    assert!(matches!(err, StorageError::AlreadyLocked { .. }), "{err}");

    vol.close().unwrap();
    assert!(!paths::lock_path(tmp.path()).exists());
    assert!(matches!(vol.close(), Err(StorageError::Closed(_))));

    let reopened = open(tmp.path()).unwrap();
    assert_eq!(reopened.id(), &id);
    reopened.close().unwrap();
}

#[test]
fn existing_id_file_is_adopted() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(paths::volume_id_path(tmp.path()), "abcdef0123456789\n").unwrap();
    let vol = open(tmp.path()).unwrap();
    assert_eq!(vol.id().as_str(), "abcdef0123456789");
    vol.close().unwrap();
}

#[test]
fn drain_marker_blocks_new_writers() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(paths::drain_path(tmp.path()), b"").unwrap();
    let vol = open(tmp.path()).unwrap();
    assert!(vol.is_drained());
    let err = vol.new_writer_for(&slice_for(&vol, "2000-01-01T02:00:00.000Z")).err().unwrap();
    assert!(matches!(err, StorageError::Draining { .. }));
    vol.close().unwrap();
}

#[test]
fn writers_are_unique_per_slice_and_sorted() {
    let tmp = tempfile::tempdir().unwrap();
    let vol = open(tmp.path()).unwrap();
    let s2 = slice_for(&vol, "2000-01-01T03:00:00.000Z");
    let s1 = slice_for(&vol, "2000-01-01T02:00:00.000Z");
    let w2 = vol.new_writer_for(&s2).unwrap();
    let w1 = vol.new_writer_for(&s1).unwrap();
    assert!(matches!(vol.new_writer_for(&s1), Err(StorageError::AlreadyExists { .. })));

    let keys: Vec<SliceKey> = vol.writers().iter().map(|w| w.key().clone()).collect();
    assert_eq!(keys, vec![s1.key.clone(), s2.key.clone()]);

    w1.write_row(UtcTime::now(), &[json!(1), json!("a")]).unwrap();
    w1.close().unwrap();
    assert_eq!(vol.writers().len(), 1);
    assert!(w1.file_path().ends_with("slice.csv"));
    assert_eq!(std::fs::read_to_string(w1.file_path()).unwrap(), "1,a\n");

    // Closed writers' slots are free again.
    let again = vol.new_writer_for(&s1).unwrap();
    assert_eq!(again.rows_count(), 1);

    vol.close().unwrap();
    assert!(w2.is_closed());
    assert!(again.is_closed());
    assert!(vol.writers().is_empty());
}

#[test]
fn slice_of_another_volume_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let vol = open(tmp.path()).unwrap();
    let mut slice = slice_for(&vol, "2000-01-01T02:00:00.000Z");
    slice.key.volume_id = VolumeId::new("other-volume");
    slice.local_storage.dir = slice.key.local_dir();
    assert!(matches!(vol.new_writer_for(&slice), Err(StorageError::InvalidConfig(_))));
    vol.close().unwrap();
}

#[test]
fn failing_open_hook_closes_the_writer() {
    let tmp = tempfile::tempdir().unwrap();
    let root = Events::new();
    let closed = Arc::new(AtomicUsize::new(0));
    let c = closed.clone();
    root.on_open(|_w: &Writer| Err(StorageError::Store("hook failed".into())));
    root.on_close(move |_w: &Writer| {
        c.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let vol = Volume::open(spec(tmp.path()), &config(), VolumeDeps::default(), &root).unwrap();
    let err = vol.new_writer_for(&slice_for(&vol, "2000-01-01T02:00:00.000Z")).err().unwrap();
    assert!(err.to_string().contains("hook failed"), "{err}");
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert!(vol.writers().is_empty());
    vol.close().unwrap();
}

#[test]
fn concurrent_first_open_agrees_on_id() {
    let tmp = tempfile::tempdir().unwrap();
    let ids: Vec<VolumeId> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8).map(|_| s.spawn(|| read_or_create_id(tmp.path()).unwrap())).collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert!(ids.windows(2).all(|w| w[0] == w[1]), "{ids:?}");
    assert_eq!(std::fs::read_to_string(paths::volume_id_path(tmp.path())).unwrap(), ids[0].as_str());
}

fn wait_until<F: Fn() -> bool>(what: &str, f: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !f() {
        assert!(Instant::now() < deadline, "timeout waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

// Blocks inside `open` until released.
struct GatedOpener {
    entered: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl FileOpener for GatedOpener {
    fn open(&self, path: &Path) -> std::io::Result<Box<dyn SliceFile>> {
        let _ = self.entered.lock().send(());
        let _ = self.release.lock().recv();
        OsFileOpener.open(path)
    }
}

#[test]
fn close_waits_for_a_writer_being_opened() {
    let tmp = tempfile::tempdir().unwrap();
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let opener = GatedOpener { entered: Mutex::new(entered_tx), release: Mutex::new(release_rx) };
    let deps = VolumeDeps { file_opener: Arc::new(opener), ..VolumeDeps::default() };
    let vol = Volume::open(spec(tmp.path()), &config(), deps, &Events::new()).unwrap();
    let slice = slice_for(&vol, "2000-01-01T02:00:00.000Z");

    std::thread::scope(|s| {
        let opening = s.spawn(|| vol.new_writer_for(&slice));
        entered_rx.recv().unwrap();
        let closing = s.spawn(|| vol.close());
        wait_until("volume closed flag", || vol.is_closed());

        std::thread::sleep(Duration::from_millis(20));
        assert!(!closing.is_finished());
        assert!(paths::lock_path(tmp.path()).exists());

        release_tx.send(()).unwrap();
        let err = opening.join().unwrap().err().unwrap();
        assert!(matches!(err, StorageError::Closed(_)), "{err}");
        closing.join().unwrap().unwrap();
    });

    assert!(vol.writers().is_empty());
    assert!(!paths::lock_path(tmp.path()).exists());
    assert!(matches!(vol.new_writer_for(&slice), Err(StorageError::Closed(_))));
}

#[test]
fn drain_marker_is_watched_at_runtime() {
    let tmp = tempfile::tempdir().unwrap();
    let mut c = config();
    c.volumes.watch_drain_file = true;
    let vol = Volume::open(spec(tmp.path()), &c, VolumeDeps::default(), &Events::new()).unwrap();
    assert!(!vol.is_drained());

    std::fs::write(paths::drain_path(tmp.path()), b"").unwrap();
    wait_until("drain marker created", || vol.is_drained());
    let slice = slice_for(&vol, "2000-01-01T02:00:00.000Z");
    assert!(matches!(vol.new_writer_for(&slice), Err(StorageError::Draining { .. })));

    std::fs::remove_file(paths::drain_path(tmp.path())).unwrap();
    wait_until("drain marker removed", || !vol.is_drained());
    let w = vol.new_writer_for(&slice).unwrap();
    assert!(!w.is_closed());
    vol.close().unwrap();
    assert!(w.is_closed());
}
