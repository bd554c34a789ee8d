use tracing::debug;

use super::{Compare, KeyValue, KvClient, Txn, TxnOp, TxnResponse};
use crate::error::{Result, StorageError};

/// Optimistic read-modify-write.
///
/// Each attempt reads all `prefixes` in one read-only transaction at revision R and
/// hands the results (one `Vec` per prefix, same order) to `build`. The returned
/// ops are committed only if none of the read keys changed and no key appeared
/// under the prefixes since R; otherwise the attempt is repeated. `build` returning
/// `None` ends without writing.
pub async fn atomic_update<T, F>(client: &dyn KvClient, prefixes: &[String], max_attempts: usize, mut build: F) -> Result<Option<(T, TxnResponse)>>
where
    T: Send,
    F: FnMut(&[Vec<KeyValue>]) -> Result<Option<(Vec<TxnOp>, T)>> + Send,
{
    for attempt in 1..=max_attempts.max(1) {
        let read = Txn::new().then_all(prefixes.iter().map(|p| TxnOp::GetPrefix(p.clone())));
        let resp = client.txn(read).await?;
        let rev = resp.revision;
        let groups: Vec<Vec<KeyValue>> = (0..prefixes.len()).map(|i| resp.prefix(i).to_vec()).collect();

        let Some((ops, out)) = build(&groups)? else { return Ok(None) };

        let mut txn = Txn::new();
        for kv in groups.iter().flatten() {
            txn = txn.when(Compare::ModRevision { key: kv.key.clone(), revision: kv.mod_revision });
        }
        for prefix in prefixes {
            txn = txn.when(Compare::PrefixModRevisionAtMost { prefix: prefix.clone(), revision: rev });
        }
        let resp = client.txn(txn.then_all(ops)).await?;
        if resp.succeeded {
            return Ok(Some((out, resp)));
        }
        debug!(target: "slicestore::kv", "atomic update conflict: attempt={}, read_revision={}", attempt, rev);
    }
    Err(StorageError::TxnConflict { attempts: max_attempts.max(1) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{MemoryKv, WatchResponse};
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn increments_counter() -> Result<()> {
        let kv = MemoryKv::default();
        kv.put("c/n", b"1".to_vec()).await?;
        let prefixes = vec!["c/".to_string()];
        let out = atomic_update(&kv, &prefixes, 3, |groups| {
            let n: u64 = groups[0].first().map(|kv| String::from_utf8_lossy(&kv.value).parse().unwrap_or(0)).unwrap_or(0);
            Ok(Some((vec![TxnOp::put("c/n", (n + 1).to_string().into_bytes())], n + 1)))
        })
        .await?;
        assert_eq!(out.map(|(n, _)| n), Some(2));
        assert_eq!(kv.get("c/n").await?.unwrap().value, b"2");
        Ok(())
    }

    #[tokio::test]
    async fn nothing_to_do() -> Result<()> {
        let kv = MemoryKv::default();
        let out: Option<((), TxnResponse)> = atomic_update(&kv, &["x/".to_string()], 3, |_| Ok(None)).await?;
        assert!(out.is_none());
        assert_eq!(kv.revision(), 0);
        Ok(())
    }

    /// Writes a conflicting key between the read and the commit of every attempt.
    struct Interfering {
        inner: MemoryKv,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl KvClient for Interfering {
        async fn get_prefix(&self, prefix: &str) -> Result<(Vec<KeyValue>, i64)> { self.inner.get_prefix(prefix).await }

        async fn txn(&self, txn: Txn) -> Result<TxnResponse> {
            let read_only = txn.ops.iter().all(|op| !op.is_write());
            let resp = self.inner.txn(txn).await?;
            if read_only {
                let n = self.reads.fetch_add(1, Ordering::SeqCst);
                self.inner.put(&format!("x/other-{}", n), vec![]).await?;
            }
            Ok(resp)
        }

        async fn watch(&self, prefix: &str) -> Result<BoxStream<'static, Result<WatchResponse>>> { self.inner.watch(prefix).await }
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let client = Interfering { inner: MemoryKv::default(), reads: AtomicUsize::new(0) };
        let res = atomic_update(&client, &["x/".to_string()], 3, |_| Ok(Some((vec![TxnOp::put("x/mine", vec![])], ())))).await;
        assert!(matches!(res, Err(StorageError::TxnConflict { attempts: 3 })));
        assert_eq!(client.reads.load(Ordering::SeqCst), 3);
    }
}
