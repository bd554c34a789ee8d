use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{EventKind, KeyValue, KvClient, WatchResponse};
use crate::error::{Result, StorageError};

const RESTART_BACKOFF_MIN: Duration = Duration::from_millis(100);
const RESTART_BACKOFF_MAX: Duration = Duration::from_secs(5);

struct Replica<V> {
    map: BTreeMap<String, V>,
    revision: i64,
}

/// In-memory replica of one key prefix, kept in sync by a watch stream.
///
/// Values are decoded from JSON; undecodable values are logged and skipped.
/// After a watch error the replica is rebuilt from a fresh snapshot.
pub struct Mirror<V> {
    prefix: String,
    replica: Arc<RwLock<Replica<V>>>,
    revision_tx: Arc<watch::Sender<i64>>,
    task: Mutex<Option<JoinHandle<()>>>,
    _v: PhantomData<fn() -> V>,
}

impl<V> Mirror<V>
where
    V: DeserializeOwned + Send + Sync + 'static,
{
    /// Loads the initial snapshot and starts following changes.
    pub async fn start(client: Arc<dyn KvClient>, prefix: &str) -> Result<Arc<Self>> {
        let prefix = prefix.to_string();
        let replica = Arc::new(RwLock::new(Replica { map: BTreeMap::new(), revision: 0 }));
        let (revision_tx, _) = watch::channel(0);
        let revision_tx = Arc::new(revision_tx);

        let stream = load(client.as_ref(), &prefix, &replica, &revision_tx).await?;
        info!(target: "slicestore::kv", "mirror started: prefix='{}', revision={}", prefix, replica.read().revision);

        let task = tokio::spawn(run(client, prefix.clone(), replica.clone(), revision_tx.clone(), stream));
        Ok(Arc::new(Self { prefix, replica, revision_tx, task: Mutex::new(Some(task)), _v: PhantomData }))
    }
}

impl<V> Mirror<V> {
    pub fn prefix(&self) -> &str { &self.prefix }

    /// Last store revision applied to the replica.
    pub fn revision(&self) -> i64 { *self.revision_tx.borrow() }

    pub async fn wait_for_revision(&self, revision: i64) -> Result<i64> {
        let mut rx = self.revision_tx.subscribe();
        let r = rx.wait_for(|r| *r >= revision).await.map_err(|_| StorageError::Closed("mirror".into()))?;
        Ok(*r)
    }

    pub fn len(&self) -> usize { self.replica.read().map.len() }

    pub fn is_empty(&self) -> bool { self.replica.read().map.is_empty() }

    pub fn get(&self, key: &str) -> Option<V>
    where
        V: Clone,
    {
        self.replica.read().map.get(key).cloned()
    }

    /// Folds all values under the prefix, in key order.
    pub fn fold_prefix<A, F>(&self, prefix: &str, init: A, mut f: F) -> A
    where
        F: FnMut(A, &str, &V) -> A,
    {
        let replica = self.replica.read();
        replica.map.range(prefix.to_string()..).take_while(|(k, _)| k.starts_with(prefix)).fold(init, |acc, (k, v)| f(acc, k, v))
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            debug!(target: "slicestore::kv", "mirror stopped: prefix='{}'", self.prefix);
        }
    }
}

impl<V> Drop for Mirror<V> {
    fn drop(&mut self) { self.stop(); }
}

fn decode<V: DeserializeOwned>(kv: &KeyValue) -> Option<V> {
    match serde_json::from_slice(&kv.value) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(target: "slicestore::kv", "mirror skipped undecodable value: key='{}', err={}", kv.key, e);
            None
        }
    }
}

/// Subscribes, then reads the snapshot. Events at or below the snapshot revision are skipped later.
async fn load<V: DeserializeOwned>(
    client: &dyn KvClient,
    prefix: &str,
    replica: &RwLock<Replica<V>>,
    revision_tx: &watch::Sender<i64>,
) -> Result<BoxStream<'static, Result<WatchResponse>>> {
    let stream = client.watch(prefix).await?;
    let (kvs, revision) = client.get_prefix(prefix).await?;
    let map = kvs.iter().filter_map(|kv| decode(kv).map(|v| (kv.key.clone(), v))).collect();
    *replica.write() = Replica { map, revision };
    revision_tx.send_replace(revision);
    Ok(stream)
}

fn apply<V: DeserializeOwned>(replica: &RwLock<Replica<V>>, resp: WatchResponse) -> Option<i64> {
    let mut r = replica.write();
    if resp.revision <= r.revision {
        return None;
    }
    for ev in resp.events {
        match ev.kind {
            EventKind::Put => match decode(&ev.kv) {
                Some(v) => { r.map.insert(ev.kv.key, v); }
                None => { r.map.remove(&ev.kv.key); }
            },
            EventKind::Delete => { r.map.remove(&ev.kv.key); }
        }
    }
    r.revision = resp.revision;
    Some(resp.revision)
}

async fn run<V: DeserializeOwned + Send + Sync + 'static>(
    client: Arc<dyn KvClient>,
    prefix: String,
    replica: Arc<RwLock<Replica<V>>>,
    revision_tx: Arc<watch::Sender<i64>>,
    mut stream: BoxStream<'static, Result<WatchResponse>>,
) {
    let mut backoff = RESTART_BACKOFF_MIN;
    loop {
        while let Some(item) = stream.next().await {
            match item {
                Ok(resp) => {
                    if let Some(rev) = apply(&replica, resp) {
                        revision_tx.send_replace(rev);
                    }
                }
                Err(e) => {
                    warn!(target: "slicestore::kv", "mirror watch failed: prefix='{}', err={}", prefix, e);
                    break;
                }
            }
        }

        // Stream ended or failed: rebuild from a fresh snapshot.
        loop {
            tokio::time::sleep(backoff).await;
            match load(client.as_ref(), &prefix, &replica, &revision_tx).await {
                Ok(s) => {
                    info!(target: "slicestore::kv", "mirror restarted: prefix='{}', revision={}", prefix, *revision_tx.borrow());
                    stream = s;
                    backoff = RESTART_BACKOFF_MIN;
                    break;
                }
                Err(e) => {
                    backoff = (backoff * 2).min(RESTART_BACKOFF_MAX);
                    warn!(target: "slicestore::kv", "mirror reload failed: prefix='{}', err={}, retry_in={:?}", prefix, e, backoff);
                }
            }
        }
    }
}
