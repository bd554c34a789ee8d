//! Periodic flush of open writers' counters into the statistics repository.
//!
//! Open writers are sampled every interval and only changed values are written.
//! The final counters of a closed writer arrive through the `on_close` hook and are
//! written immediately.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::repository::Repository;
use super::PerSlice;
use crate::model::SliceKey;
use crate::volume::Volumes;
use crate::writer::{Writer, WriterStats};

pub struct Collector {
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Worker {
    volumes: Arc<Volumes>,
    repository: Arc<Repository>,
    /// Last value written per slice.
    written: HashMap<SliceKey, WriterStats>,
}

impl Collector {
    /// Registers the close hook and spawns the collecting task on the current runtime.
    pub fn start(volumes: Arc<Volumes>, repository: Arc<Repository>, interval: Duration) -> Collector {
        let (closed_tx, closed_rx) = mpsc::unbounded_channel::<WriterStats>();
        volumes.events().on_close(move |w: &Writer| {
            // The receiver is gone once the collector stopped, nothing to report then.
            let _ = closed_tx.send(w.stats());
            Ok(())
        });

        let (stop_tx, stop_rx) = oneshot::channel();
        let worker = Worker { volumes, repository, written: HashMap::new() };
        let task = tokio::spawn(worker.run(interval, closed_rx, stop_rx));
        info!(target: "slicestore::statistics", "statistics collector started: interval={:?}", interval);
        Collector { stop_tx: Mutex::new(Some(stop_tx)), task: Mutex::new(Some(task)) }
    }

    /// Flushes pending values and waits for the task.
    pub async fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(());
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(target: "slicestore::statistics", "statistics collector task failed: {}", e);
            }
        }
    }
}

impl Worker {
    async fn run(mut self, interval: Duration, mut closed_rx: mpsc::UnboundedReceiver<WriterStats>, mut stop_rx: oneshot::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.collect_open().await,
                Some(stats) = closed_rx.recv() => {
                    let mut batch = vec![stats];
                    while let Ok(more) = closed_rx.try_recv() {
                        batch.push(more);
                    }
                    self.write_closed(batch).await;
                }
                _ = &mut stop_rx => break,
            }
        }

        let mut batch = Vec::new();
        while let Ok(more) = closed_rx.try_recv() {
            batch.push(more);
        }
        self.write_closed(batch).await;
        self.collect_open().await;
        info!(target: "slicestore::statistics", "statistics collector stopped");
    }

    async fn collect_open(&mut self) {
        let changed: Vec<WriterStats> = self
            .volumes
            .writers()
            .into_iter()
            .map(|w| w.stats())
            .filter(|s| s.rows_count > 0 && self.written.get(&s.slice_key) != Some(s))
            .collect();
        if changed.is_empty() {
            return;
        }
        if self.write(&changed).await {
            for s in changed {
                self.written.insert(s.slice_key.clone(), s);
            }
        }
    }

    async fn write_closed(&mut self, batch: Vec<WriterStats>) {
        if batch.is_empty() {
            return;
        }
        let keys: Vec<SliceKey> = batch.iter().map(|s| s.slice_key.clone()).collect();
        let batch: Vec<WriterStats> = batch.into_iter().filter(|s| self.written.get(&s.slice_key) != Some(s)).collect();
        if self.write(&batch).await {
            for k in &keys {
                self.written.remove(k);
            }
        }
    }

    async fn write(&self, stats: &[WriterStats]) -> bool {
        if stats.is_empty() {
            return true;
        }
        let values: Vec<PerSlice> = stats.iter().map(|s| PerSlice { key: s.slice_key.clone(), value: s.to_value() }).collect();
        match self.repository.insert(&values).await {
            Ok(()) => {
                debug!(target: "slicestore::statistics", "collected statistics of {} slices", values.len());
                true
            }
            Err(e) => {
                warn!(target: "slicestore::statistics", "cannot write statistics of {} slices: {}", values.len(), e);
                false
            }
        }
    }
}
