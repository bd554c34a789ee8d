//! Ordered, transactional, revisioned key-value store interface.
//! Every committed write transaction advances the store revision by one; each
//! key remembers the revision it was created and last modified at. The statistics
//! repository and cache providers talk to the store only through `KvClient`.

pub mod atomic;
pub mod memory;
pub mod mirror;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::{Result, StorageError};

pub use atomic::atomic_update;
pub use memory::{MemoryKv, MemoryKvSettings};
pub use mirror::Mirror;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub create_revision: i64,
    pub mod_revision: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Compare {
    /// Key was last modified at `revision`; 0 means the key must not exist.
    ModRevision { key: String, revision: i64 },
    /// No key under the prefix was modified after `revision`.
    PrefixModRevisionAtMost { prefix: String, revision: i64 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxnOp {
    Get(String),
    GetPrefix(String),
    Put { key: String, value: Vec<u8> },
    Delete(String),
    DeletePrefix(String),
}

impl TxnOp {
    pub fn put<K: Into<String>>(key: K, value: Vec<u8>) -> Self { TxnOp::Put { key: key.into(), value } }

    pub fn is_write(&self) -> bool { !matches!(self, TxnOp::Get(_) | TxnOp::GetPrefix(_)) }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpResult {
    Get(Option<KeyValue>),
    GetPrefix(Vec<KeyValue>),
    Put,
    /// Number of deleted keys.
    Delete(usize),
}

#[derive(Clone, Debug, Default)]
pub struct Txn {
    pub compares: Vec<Compare>,
    pub ops: Vec<TxnOp>,
}

impl Txn {
    pub fn new() -> Self { Self::default() }
    pub fn when(mut self, c: Compare) -> Self { self.compares.push(c); self }
    pub fn then(mut self, op: TxnOp) -> Self { self.ops.push(op); self }
    pub fn then_all<I: IntoIterator<Item = TxnOp>>(mut self, ops: I) -> Self { self.ops.extend(ops); self }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxnResponse {
    /// False if a compare failed; no op was applied then.
    pub succeeded: bool,
    /// Store revision after the transaction.
    pub revision: i64,
    pub results: Vec<OpResult>,
}

impl TxnResponse {
    pub fn prefix(&self, index: usize) -> &[KeyValue] {
        match self.results.get(index) {
            Some(OpResult::GetPrefix(kvs)) => kvs,
            _ => &[],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    /// For deletes `value` is empty and `mod_revision` is the deletion revision.
    pub kv: KeyValue,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchResponse {
    pub revision: i64,
    pub events: Vec<WatchEvent>,
}

#[async_trait]
pub trait KvClient: Send + Sync {
    /// All keys under the prefix, sorted, together with the store revision of the read.
    async fn get_prefix(&self, prefix: &str) -> Result<(Vec<KeyValue>, i64)>;

    async fn txn(&self, txn: Txn) -> Result<TxnResponse>;

    /// Changes under the prefix committed after the call. The stream ends with an
    /// error if the consumer falls behind; the caller then reloads and watches again.
    async fn watch(&self, prefix: &str) -> Result<BoxStream<'static, Result<WatchResponse>>>;

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let resp = self.txn(Txn::new().then(TxnOp::Get(key.to_string()))).await?;
        match resp.results.into_iter().next() {
            Some(OpResult::Get(kv)) => Ok(kv),
            other => Err(StorageError::Store(format!("unexpected get result: {:?}", other))),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<i64> {
        Ok(self.txn(Txn::new().then(TxnOp::put(key, value))).await?.revision)
    }
}
