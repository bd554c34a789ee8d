use std::sync::Arc;

use async_trait::async_trait;

use super::repository::decode;
use super::{object_prefix, Aggregated};
use crate::error::Result;
use crate::kv::{KvClient, Txn, TxnOp};
use crate::model::{ExportKey, FileKey, Level, ObjectKey, ProjectId, ReceiverKey, SliceKey};

/// Aggregated statistics of any object in the project > receiver > export > file > slice tree.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn aggregated_stats_for(&self, key: &ObjectKey) -> Result<Aggregated>;

    async fn project_stats(&self, k: ProjectId) -> Result<Aggregated> { self.aggregated_stats_for(&k.into()).await }

    async fn receiver_stats(&self, k: &ReceiverKey) -> Result<Aggregated> { self.aggregated_stats_for(&k.clone().into()).await }

    async fn export_stats(&self, k: &ExportKey) -> Result<Aggregated> { self.aggregated_stats_for(&k.clone().into()).await }

    async fn file_stats(&self, k: &FileKey) -> Result<Aggregated> { self.aggregated_stats_for(&k.clone().into()).await }

    async fn slice_stats(&self, k: &SliceKey) -> Result<Aggregated> { self.aggregated_stats_for(&k.clone().into()).await }
}

/// Reads the store directly: one read-only transaction with a prefix scan per level.
pub struct AtomicProvider {
    client: Arc<dyn KvClient>,
}

impl AtomicProvider {
    pub fn new(client: Arc<dyn KvClient>) -> Self { Self { client } }
}

#[async_trait]
impl Provider for AtomicProvider {
    async fn aggregated_stats_for(&self, key: &ObjectKey) -> Result<Aggregated> {
        let txn = Txn::new().then_all(Level::ALL.iter().map(|l| TxnOp::GetPrefix(object_prefix(*l, key))));
        let resp = self.client.txn(txn).await?;
        let mut agg = Aggregated::default();
        for (i, level) in Level::ALL.iter().enumerate() {
            for kv in resp.prefix(i) {
                agg.add(*level, decode(kv)?);
            }
        }
        Ok(agg)
    }
}
