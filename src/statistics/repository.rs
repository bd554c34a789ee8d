//! Level-partitioned persistence of slice statistics.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::{cleanup_sum_key, level_prefix, node_key, object_prefix, sum_key, value_key, PerSlice, Value, VALUE_SUFFIX};
use crate::config::StatisticsConfig;
use crate::error::{MultiError, Result, StorageError};
use crate::kv::{atomic_update, KeyValue, KvClient, Txn, TxnOp};
use crate::model::{Level, ObjectKey, SliceKey};

/// Post-move correction of a value, e.g. stamping `staging_size` after an upload.
pub type Transform<'a> = &'a (dyn Fn(&mut Value) + Send + Sync);

pub struct Repository {
    client: Arc<dyn KvClient>,
    config: StatisticsConfig,
}

pub(crate) fn decode(kv: &KeyValue) -> Result<Value> {
    serde_json::from_slice(&kv.value).map_err(|e| StorageError::Store(format!("invalid statistics value \"{}\": {}", kv.key, e)))
}

fn encode(v: &Value) -> Result<Vec<u8>> { Ok(serde_json::to_vec(v)?) }

fn sum_kvs<'a, I: IntoIterator<Item = &'a KeyValue>>(kvs: I) -> Result<Value> {
    let mut sum = Value::default();
    for kv in kvs {
        sum += decode(kv)?;
    }
    Ok(sum)
}

impl Repository {
    pub fn new(client: Arc<dyn KvClient>, config: StatisticsConfig) -> Self { Self { client, config } }

    pub fn client(&self) -> &Arc<dyn KvClient> { &self.client }

    /// Puts full values under the `local` level.
    pub async fn insert(&self, values: &[PerSlice]) -> Result<()> {
        let puts = values.iter().map(|v| Ok((value_key(Level::Local, &v.key), encode(&v.value)?))).collect::<Result<Vec<_>>>()?;
        self.put_batches(puts).await
    }

    /// Puts per-node partial values of slices written by several source nodes.
    pub async fn put_node(&self, node_id: &str, values: &[PerSlice]) -> Result<()> {
        let puts = values.iter().map(|v| Ok((node_key(Level::Local, &v.key, node_id), encode(&v.value)?))).collect::<Result<Vec<_>>>()?;
        self.put_batches(puts).await
    }

    /// Each batch is one transaction. Failed batches are joined, committed ones stay.
    async fn put_batches(&self, puts: Vec<(String, Vec<u8>)>) -> Result<()> {
        let mut errs = MultiError::new();
        let batch_size = self.config.max_keys_per_txn.max(1);
        for (i, chunk) in puts.chunks(batch_size).enumerate() {
            let txn = Txn::new().then_all(chunk.iter().map(|(k, v)| TxnOp::put(k.clone(), v.clone())));
            match self.client.txn(txn).await {
                Ok(resp) => debug!(target: "slicestore::statistics", "inserted batch {}: keys={}, revision={}", i, chunk.len(), resp.revision),
                Err(e) => {
                    warn!(target: "slicestore::statistics", "insert batch {} failed: keys={}, err={}", i, chunk.len(), e);
                    errs.push(e);
                }
            }
        }
        errs.into_result()
    }

    /// Atomically moves all values of the slice from one level to another, summed into
    /// one `value` key. Returns the value written under `to`, `None` if nothing was found.
    ///
    /// Panics if `from == to`.
    pub async fn move_slice(&self, slice: &SliceKey, from: Level, to: Level, transforms: &[Transform<'_>]) -> Result<Option<Value>> {
        assert_levels(from, to);
        let object = ObjectKey::Slice(slice.clone());
        let from_prefix = object_prefix(from, &object);
        let to_key = value_key(to, slice);
        let prefixes = vec![from_prefix.clone(), to_key.clone()];

        let out = atomic_update(self.client.as_ref(), &prefixes, self.config.max_txn_attempts, |groups| {
            if groups[0].is_empty() {
                return Ok(None);
            }
            let mut moved = sum_kvs(&groups[0])?;
            for t in transforms {
                t(&mut moved);
            }
            let value = moved + sum_kvs(&groups[1])?;
            let ops = vec![TxnOp::DeletePrefix(from_prefix.clone()), TxnOp::put(to_key.clone(), encode(&value)?)];
            Ok(Some((ops, value)))
        })
        .await?;

        match &out {
            Some((_, resp)) => debug!(target: "slicestore::statistics", "moved slice {} from {} to {}, revision={}", slice, from, to, resp.revision),
            None => debug!(target: "slicestore::statistics", "move slice {} from {} to {}: nothing to move", slice, from, to),
        }
        Ok(out.map(|(v, _)| v))
    }

    /// Moves every slice under the object in one transaction. Returns the total moved
    /// value (after transforms), `None` if nothing was found.
    ///
    /// Panics if `from == to`.
    pub async fn move_all(&self, object: &ObjectKey, from: Level, to: Level, transforms: &[Transform<'_>]) -> Result<Option<Value>> {
        assert_levels(from, to);
        let from_prefix = object_prefix(from, object);
        let to_prefix = object_prefix(to, object);
        let from_root = level_prefix(from);
        let to_root = level_prefix(to);
        let prefixes = vec![from_prefix.clone(), to_prefix.clone()];

        let out = atomic_update(self.client.as_ref(), &prefixes, self.config.max_txn_attempts, |groups| {
            if groups[0].is_empty() {
                return Ok(None);
            }
            // Group by the owning object path, i.e. the key without its suffix.
            let mut moved: BTreeMap<&str, Value> = BTreeMap::new();
            for kv in &groups[0] {
                let path = owner_path(&kv.key[from_root.len()..]);
                *moved.entry(path).or_default() += decode(kv)?;
            }
            let mut existing: BTreeMap<&str, Value> = BTreeMap::new();
            for kv in groups[1].iter().filter(|kv| kv.key.ends_with(VALUE_SUFFIX)) {
                existing.insert(owner_path(&kv.key[to_root.len()..]), decode(kv)?);
            }

            let mut total = Value::default();
            let mut ops = vec![TxnOp::DeletePrefix(from_prefix.clone())];
            for (path, mut value) in moved {
                for t in transforms {
                    t(&mut value);
                }
                total += value;
                let value = value + existing.get(path).copied().unwrap_or_default();
                ops.push(TxnOp::put(format!("{}{}/{}", to_root, path, VALUE_SUFFIX), encode(&value)?));
            }
            Ok(Some((ops, total)))
        })
        .await?;

        if let Some((_, resp)) = &out {
            debug!(target: "slicestore::statistics", "moved {} {} from {} to {}, revision={}", object.kind(), object, from, to, resp.revision);
        }
        Ok(out.map(|(v, _)| v))
    }

    /// Deletes the object in all levels. Its `target` values are added to the parent's
    /// `_sum` key first, so ancestor totals survive the cleanup.
    pub async fn delete(&self, object: &ObjectKey) -> Result<()> {
        match object.parent() {
            Some(parent) => self.rollup_and_delete(object, sum_key(Level::Target, &parent)).await,
            None => {
                let txn = Txn::new().then_all(Level::ALL.iter().map(|l| TxnOp::DeletePrefix(object_prefix(*l, object))));
                self.client.txn(txn).await?;
                debug!(target: "slicestore::statistics", "deleted {} {}", object.kind(), object);
                Ok(())
            }
        }
    }

    /// Retention cleanup of an imported file or slice: its `target` values are kept in
    /// the export's `_cleanup_sum` and the detailed keys are deleted in all levels.
    ///
    /// Panics if the key is not a file or a slice.
    pub async fn rollup_imported_on_cleanup(&self, object: &ObjectKey) -> Result<()> {
        let export = match object {
            ObjectKey::File(k) => &k.export,
            ObjectKey::Slice(k) => &k.file.export,
            other => panic!("cleanup rollup expects a file or a slice key, got {} \"{}\"", other.kind(), other),
        };
        self.rollup_and_delete(object, cleanup_sum_key(export)).await
    }

    async fn rollup_and_delete(&self, object: &ObjectKey, sum_key: String) -> Result<()> {
        let target_prefix = object_prefix(Level::Target, object);
        let prefixes = vec![target_prefix, sum_key.clone()];
        let out = atomic_update(self.client.as_ref(), &prefixes, self.config.max_txn_attempts, |groups| {
            let mut ops: Vec<TxnOp> = Level::ALL.iter().map(|l| TxnOp::DeletePrefix(object_prefix(*l, object))).collect();
            if !groups[0].is_empty() {
                let sum = sum_kvs(&groups[0])? + sum_kvs(groups[1].iter().filter(|kv| kv.key == sum_key))?;
                ops.push(TxnOp::put(sum_key.clone(), encode(&sum)?));
            }
            Ok(Some((ops, ())))
        })
        .await?;
        if let Some((_, resp)) = out {
            debug!(target: "slicestore::statistics", "deleted {} {} into {}, revision={}", object.kind(), object, sum_key, resp.revision);
        }
        Ok(())
    }

    /// Sum of the values stored under the object at one level.
    pub async fn level_value(&self, object: &ObjectKey, level: Level) -> Result<Value> {
        let (kvs, _) = self.client.get_prefix(&object_prefix(level, object)).await?;
        sum_kvs(&kvs)
    }
}

/// `a/b/c/<suffix>` -> `a/b/c`
fn owner_path(rel: &str) -> &str { rel.rsplit_once('/').map(|(p, _)| p).unwrap_or(rel) }

fn assert_levels(from: Level, to: Level) {
    assert!(from != to, "\"from\" and \"to\" storage levels are same and equal to \"{}\"", from);
}
