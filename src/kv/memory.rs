use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{Compare, EventKind, KeyValue, KvClient, OpResult, Txn, TxnOp, TxnResponse, WatchEvent, WatchResponse};
use crate::error::{Result, StorageError};

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct MemoryKvSettings {
    /// Transactions with more operations are rejected, like a real store's request size ceiling.
    #[serde(default = "MemoryKvSettings::default_max_txn_ops")]
    pub max_txn_ops: usize,
    /// Watch responses buffered per subscriber before it is considered lagged.
    #[serde(default = "MemoryKvSettings::default_watch_capacity")]
    pub watch_capacity: usize,
}

impl MemoryKvSettings {
    fn default_max_txn_ops() -> usize { 128 }
    fn default_watch_capacity() -> usize { 1024 }
}

impl Default for MemoryKvSettings {
    fn default() -> Self {
        Self { max_txn_ops: Self::default_max_txn_ops(), watch_capacity: Self::default_watch_capacity() }
    }
}

#[derive(Clone)]
struct Entry {
    value: Vec<u8>,
    create_revision: i64,
    mod_revision: i64,
}

#[derive(Default)]
struct State {
    map: BTreeMap<String, Entry>,
    revision: i64,
}

impl State {
    fn kv(&self, key: &str, e: &Entry) -> KeyValue {
        KeyValue { key: key.to_string(), value: e.value.clone(), create_revision: e.create_revision, mod_revision: e.mod_revision }
    }

    fn scan<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a String, &'a Entry)> + 'a {
        self.map.range(prefix.to_string()..).take_while(move |(k, _)| k.starts_with(prefix))
    }

    fn compare(&self, c: &Compare) -> bool {
        match c {
            Compare::ModRevision { key, revision } => self.map.get(key).map(|e| e.mod_revision).unwrap_or(0) == *revision,
            Compare::PrefixModRevisionAtMost { prefix, revision } => self.scan(prefix).all(|(_, e)| e.mod_revision <= *revision),
        }
    }
}

/// In-memory linearizable store. Clones share the same data.
#[derive(Clone)]
pub struct MemoryKv {
    pub(crate) settings: MemoryKvSettings,
    state: Arc<parking_lot::RwLock<State>>,
    events: broadcast::Sender<Arc<WatchResponse>>,
}

impl Default for MemoryKv {
    fn default() -> Self { Self::new(MemoryKvSettings::default()) }
}

impl MemoryKv {
    pub fn new(settings: MemoryKvSettings) -> Self {
        let (events, _) = broadcast::channel(settings.watch_capacity.max(1));
        Self { settings, state: Arc::new(parking_lot::RwLock::new(State::default())), events }
    }

    pub fn revision(&self) -> i64 { self.state.read().revision }

    pub fn len(&self) -> usize { self.state.read().map.len() }

    pub fn is_empty(&self) -> bool { self.state.read().map.is_empty() }

    /// Plain dump of keys and values, for diagnostics and tests.
    pub fn dump(&self, prefix: &str) -> Vec<(String, String)> {
        let st = self.state.read();
        st.scan(prefix).map(|(k, e)| (k.clone(), String::from_utf8_lossy(&e.value).into_owned())).collect()
    }

    fn apply(&self, txn: Txn) -> Result<TxnResponse> {
        if txn.ops.len() > self.settings.max_txn_ops {
            return Err(StorageError::TxnTooLarge { ops: txn.ops.len(), max: self.settings.max_txn_ops });
        }
        let mut st = self.state.write();
        if !txn.compares.iter().all(|c| st.compare(c)) {
            return Ok(TxnResponse { succeeded: false, revision: st.revision, results: Vec::new() });
        }

        let writes = txn.ops.iter().any(|op| op.is_write());
        let rev = if writes { st.revision + 1 } else { st.revision };
        let mut results = Vec::with_capacity(txn.ops.len());
        let mut events = Vec::new();
        for op in txn.ops {
            match op {
                TxnOp::Get(key) => {
                    let kv = st.map.get(&key).map(|e| st.kv(&key, e));
                    results.push(OpResult::Get(kv));
                }
                TxnOp::GetPrefix(prefix) => {
                    let kvs = st.scan(&prefix).map(|(k, e)| st.kv(k, e)).collect();
                    results.push(OpResult::GetPrefix(kvs));
                }
                TxnOp::Put { key, value } => {
                    let create_revision = st.map.get(&key).map(|e| e.create_revision).unwrap_or(rev);
                    let entry = Entry { value, create_revision, mod_revision: rev };
                    events.push(WatchEvent { kind: EventKind::Put, kv: st.kv(&key, &entry) });
                    st.map.insert(key, entry);
                    results.push(OpResult::Put);
                }
                TxnOp::Delete(key) => {
                    let deleted = match st.map.remove(&key) {
                        Some(e) => {
                            events.push(delete_event(key, e.create_revision, rev));
                            1
                        }
                        None => 0,
                    };
                    results.push(OpResult::Delete(deleted));
                }
                TxnOp::DeletePrefix(prefix) => {
                    let keys: Vec<(String, i64)> = st.scan(&prefix).map(|(k, e)| (k.clone(), e.create_revision)).collect();
                    for (key, create_revision) in &keys {
                        st.map.remove(key);
                        events.push(delete_event(key.clone(), *create_revision, rev));
                    }
                    results.push(OpResult::Delete(keys.len()));
                }
            }
        }
        st.revision = rev;
        if !events.is_empty() {
            // Sent under the write lock, subscribers observe commits in revision order.
            let _ = self.events.send(Arc::new(WatchResponse { revision: rev, events }));
        }
        Ok(TxnResponse { succeeded: true, revision: rev, results })
    }
}

fn delete_event(key: String, create_revision: i64, rev: i64) -> WatchEvent {
    WatchEvent { kind: EventKind::Delete, kv: KeyValue { key, value: Vec::new(), create_revision, mod_revision: rev } }
}

#[async_trait]
impl KvClient for MemoryKv {
    async fn get_prefix(&self, prefix: &str) -> Result<(Vec<KeyValue>, i64)> {
        let st = self.state.read();
        Ok((st.scan(prefix).map(|(k, e)| st.kv(k, e)).collect(), st.revision))
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResponse> { self.apply(txn) }

    async fn watch(&self, prefix: &str) -> Result<BoxStream<'static, Result<WatchResponse>>> {
        let rx = self.events.subscribe();
        let prefix = prefix.to_string();
        debug!(target: "slicestore::kv", "watch started: prefix='{}'", prefix);
        let s = stream::unfold(Some((rx, prefix)), |st| async move {
            let (mut rx, prefix) = st?;
            loop {
                match rx.recv().await {
                    Ok(resp) => {
                        let events: Vec<WatchEvent> = resp.events.iter().filter(|e| e.kv.key.starts_with(&prefix)).cloned().collect();
                        if events.is_empty() { continue; }
                        return Some((Ok(WatchResponse { revision: resp.revision, events }), Some((rx, prefix))));
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(target: "slicestore::kv", "watch lagged: prefix='{}', skipped={}", prefix, n);
                        return Some((Err(StorageError::WatchLagged(n)), None));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(s.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_and_revisions() -> Result<()> {
        let kv = MemoryKv::default();
        assert_eq!(kv.revision(), 0);
        let r1 = kv.put("a/1", b"one".to_vec()).await?;
        let r2 = kv.put("a/1", b"uno".to_vec()).await?;
        assert_eq!((r1, r2), (1, 2));
        let got = kv.get("a/1").await?.unwrap();
        assert_eq!(got.value, b"uno");
        assert_eq!((got.create_revision, got.mod_revision), (1, 2));
        assert!(kv.get("a/2").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn prefix_scan_is_bounded() -> Result<()> {
        let kv = MemoryKv::default();
        for k in ["stats/local/12/x", "stats/local/123/x", "stats/local/12/y", "stats/staging/12/x"] {
            kv.put(k, b"1".to_vec()).await?;
        }
        let (kvs, rev) = kv.get_prefix("stats/local/12/").await?;
        let keys: Vec<_> = kvs.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["stats/local/12/x", "stats/local/12/y"]);
        assert_eq!(rev, 4);
        Ok(())
    }

    #[tokio::test]
    async fn compares_guard_the_transaction() -> Result<()> {
        let kv = MemoryKv::default();
        kv.put("p/a", b"1".to_vec()).await?;

        // Key must not exist.
        let resp = kv.txn(Txn::new().when(Compare::ModRevision { key: "p/a".into(), revision: 0 }).then(TxnOp::put("p/a", b"2".to_vec()))).await?;
        assert!(!resp.succeeded);
        assert_eq!(kv.get("p/a").await?.unwrap().value, b"1");

        kv.put("p/b", b"1".to_vec()).await?;
        let stale = Compare::PrefixModRevisionAtMost { prefix: "p/".into(), revision: 1 };
        let resp = kv.txn(Txn::new().when(stale).then(TxnOp::DeletePrefix("p/".into()))).await?;
        assert!(!resp.succeeded);

        let fresh = Compare::PrefixModRevisionAtMost { prefix: "p/".into(), revision: 2 };
        let resp = kv.txn(Txn::new().when(fresh).then(TxnOp::DeletePrefix("p/".into()))).await?;
        assert!(resp.succeeded);
        assert_eq!(resp.results, vec![OpResult::Delete(2)]);
        assert_eq!(resp.revision, 3);
        assert!(kv.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn read_only_txn_keeps_revision() -> Result<()> {
        let kv = MemoryKv::default();
        kv.put("k", b"v".to_vec()).await?;
        let resp = kv.txn(Txn::new().then(TxnOp::GetPrefix("k".into())).then(TxnOp::Get("k".into()))).await?;
        assert_eq!(resp.revision, 1);
        assert_eq!(resp.prefix(0).len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn too_many_ops() {
        let kv = MemoryKv::new(MemoryKvSettings { max_txn_ops: 2, ..MemoryKvSettings::default() });
        let txn = Txn::new().then_all((0..3).map(|i| TxnOp::put(format!("k{}", i), vec![])));
        assert!(matches!(kv.txn(txn).await, Err(StorageError::TxnTooLarge { ops: 3, max: 2 })));
    }

    #[tokio::test]
    async fn watch_filters_prefix() -> Result<()> {
        let kv = MemoryKv::default();
        let mut w = kv.watch("stats/").await?;
        kv.put("other/x", b"1".to_vec()).await?;
        kv.put("stats/a", b"1".to_vec()).await?;
        kv.txn(Txn::new().then(TxnOp::Delete("stats/a".into()))).await?;

        let first = w.next().await.unwrap()?;
        assert_eq!(first.revision, 2);
        assert_eq!(first.events[0].kind, EventKind::Put);
        let second = w.next().await.unwrap()?;
        assert_eq!(second.revision, 3);
        assert_eq!(second.events[0].kind, EventKind::Delete);
        assert_eq!(second.events[0].kv.key, "stats/a");
        Ok(())
    }

    #[tokio::test]
    async fn lagged_watch_errors() -> Result<()> {
        let kv = MemoryKv::new(MemoryKvSettings { watch_capacity: 2, ..MemoryKvSettings::default() });
        let mut w = kv.watch("").await?;
        for i in 0..5 {
            kv.put(&format!("k{}", i), vec![]).await?;
        }
        assert!(matches!(w.next().await, Some(Err(StorageError::WatchLagged(_)))));
        assert!(w.next().await.is_none());
        Ok(())
    }
}
