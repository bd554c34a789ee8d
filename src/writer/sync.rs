//! Sync scheduling of a writer.
//!
//! A ticker thread evaluates the triggers every `check_interval`. A sync happens
//! when at least one row was written since the previous sync and any trigger fires:
//! rows count, uncompressed bytes, compressed bytes or elapsed interval.
//! Writers in `wait` mode block on the current `Notifier`, which is swapped for a
//! fresh one at the start of each sync and completed with the sync result.

use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::debug;

use crate::error::{Result, StorageError};
use crate::model::{DiskSyncConfig, SyncMode};

/// Completion of one sync cycle.
pub struct Notifier {
    done: Mutex<Option<std::result::Result<(), String>>>,
    cv: Condvar,
}

impl Notifier {
    fn new() -> Arc<Self> { Arc::new(Self { done: Mutex::new(None), cv: Condvar::new() }) }

    /// Blocks until the sync finishes, returns its error.
    pub fn wait(&self) -> Result<()> {
        let mut g = self.done.lock();
        loop {
            if let Some(res) = g.as_ref() {
                return res.clone().map_err(StorageError::Sync);
            }
            self.cv.wait(&mut g);
        }
    }

    pub(crate) fn complete(&self, res: std::result::Result<(), String>) {
        *self.done.lock() = Some(res);
        self.cv.notify_all();
    }

    pub fn is_done(&self) -> bool { self.done.lock().is_some() }
}

/// Writer counters at a point in time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub rows: u64,
    pub uncompressed: u64,
    pub compressed: u64,
}

struct State {
    notifier: Arc<Notifier>,
    last: Snapshot,
    last_at: DateTime<Utc>,
    syncs: u64,
}

pub struct Syncer {
    config: DiskSyncConfig,
    state: Mutex<State>,
    sync_lock: Mutex<()>,
    stop: Arc<(Mutex<bool>, Condvar)>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Syncer {
    pub fn new(config: DiskSyncConfig, initial: Snapshot, now: DateTime<Utc>) -> Self {
        Self {
            config,
            state: Mutex::new(State { notifier: Notifier::new(), last: initial, last_at: now, syncs: 0 }),
            sync_lock: Mutex::new(()),
            stop: Arc::new((Mutex::new(false), Condvar::new())),
            ticker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &DiskSyncConfig { &self.config }

    pub fn is_enabled(&self) -> bool { self.config.mode != SyncMode::Disabled }

    /// Notifier a writer waits on; `None` when writes do not wait for syncs.
    pub fn notifier(&self) -> Option<Arc<Notifier>> {
        if self.is_enabled() && self.config.wait { Some(self.state.lock().notifier.clone()) } else { None }
    }

    pub fn should_sync(&self, current: Snapshot, now: DateTime<Utc>) -> bool {
        let st = self.state.lock();
        if current.rows <= st.last.rows {
            return false;
        }
        let c = &self.config;
        current.rows - st.last.rows >= c.count_trigger
            || current.uncompressed.saturating_sub(st.last.uncompressed) >= c.uncompressed_bytes_trigger
            || current.compressed.saturating_sub(st.last.compressed) >= c.compressed_bytes_trigger
            || (now - st.last_at).to_std().map(|d| d >= c.interval_trigger()).unwrap_or(false)
    }

    /// Serialises syncs. Ticker syncs are skipped while another sync is running.
    pub fn lock(&self, force: bool) -> Option<MutexGuard<'_, ()>> {
        if force { Some(self.sync_lock.lock()) } else { self.sync_lock.try_lock() }
    }

    /// Starts a sync cycle: records the snapshot and returns the notifier of the
    /// cycle, later writes wait for the next one.
    pub fn begin(&self, current: Snapshot, now: DateTime<Utc>) -> Arc<Notifier> {
        let mut st = self.state.lock();
        st.last = current;
        st.last_at = now;
        st.syncs += 1;
        std::mem::replace(&mut st.notifier, Notifier::new())
    }

    /// Completes the current notifier, used on close when no further sync will run.
    pub fn finish(&self, res: std::result::Result<(), String>) { self.state.lock().notifier.complete(res); }

    pub fn syncs_count(&self) -> u64 { self.state.lock().syncs }

    /// Spawns the ticker thread. It stops when `tick` returns false or `stop` is called.
    pub fn start<F>(&self, name: String, tick: F) -> Result<()>
    where
        F: Fn() -> bool + Send + 'static,
    {
        let stop = self.stop.clone();
        let interval = self.config.check_interval();
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                let (lock, cv) = &*stop;
                loop {
                    {
                        let mut stopped = lock.lock();
                        if !*stopped {
                            cv.wait_for(&mut stopped, interval);
                        }
                        if *stopped {
                            break;
                        }
                    }
                    if !tick() {
                        break;
                    }
                }
            })
            .map_err(|e| StorageError::io("spawn sync ticker", e))?;
        *self.ticker.lock() = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        let (lock, cv) = &*self.stop;
        *lock.lock() = true;
        cv.notify_all();
        if let Some(h) = self.ticker.lock().take() {
            if h.join().is_err() {
                debug!(target: "slicestore::sync", "sync ticker thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> DiskSyncConfig {
        DiskSyncConfig {
            mode: SyncMode::ToDisk,
            wait: true,
            check_interval_ms: 1,
            count_trigger: 100,
            uncompressed_bytes_trigger: 1000,
            compressed_bytes_trigger: 500,
            interval_trigger_ms: 1000,
        }
    }

    #[test]
    fn triggers() {
        let now = Utc::now();
        let s = Syncer::new(config(), Snapshot::default(), now);
        // Nothing written: never sync, even after the interval.
        assert!(!s.should_sync(Snapshot::default(), now + Duration::seconds(10)));
        let one = Snapshot { rows: 1, uncompressed: 10, compressed: 5 };
        assert!(!s.should_sync(one, now));
        assert!(s.should_sync(one, now + Duration::seconds(1)));
        assert!(s.should_sync(Snapshot { rows: 100, ..one }, now));
        assert!(s.should_sync(Snapshot { uncompressed: 1000, ..one }, now));
        assert!(s.should_sync(Snapshot { compressed: 500, ..one }, now));

        s.begin(Snapshot { rows: 100, uncompressed: 1000, compressed: 500 }, now);
        assert!(!s.should_sync(Snapshot { rows: 100, uncompressed: 2000, compressed: 1000 }, now));
        assert_eq!(s.syncs_count(), 1);
    }

    #[test]
    fn notifier_is_swapped_per_cycle() {
        let s = Syncer::new(config(), Snapshot::default(), Utc::now());
        let first = s.notifier().unwrap();
        let returned = s.begin(Snapshot::default(), Utc::now());
        assert!(Arc::ptr_eq(&first, &returned));
        let second = s.notifier().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        let waiter = {
            let first = first.clone();
            std::thread::spawn(move || first.wait())
        };
        returned.complete(Err("disk full".into()));
        let err = waiter.join().unwrap().unwrap_err();
        assert_eq!(err.to_string(), "sync failed: disk full");
        assert!(!second.is_done());
    }

    #[test]
    fn no_notifier_without_wait() {
        let s = Syncer::new(DiskSyncConfig { wait: false, ..config() }, Snapshot::default(), Utc::now());
        assert!(s.notifier().is_none());
        let s = Syncer::new(DiskSyncConfig::disabled(), Snapshot::default(), Utc::now());
        assert!(s.notifier().is_none());
        assert!(!s.is_enabled());
    }

    #[test]
    fn ticker_runs_until_stopped() -> Result<()> {
        let s = Syncer::new(config(), Snapshot::default(), Utc::now());
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = ticks.clone();
        s.start("test-ticker".into(), move || { t.fetch_add(1, Ordering::SeqCst); true })?;
        while ticks.load(Ordering::SeqCst) < 3 {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        s.stop();
        let after = ticks.load(Ordering::SeqCst);
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(ticks.load(Ordering::SeqCst), after);
        Ok(())
    }
}
