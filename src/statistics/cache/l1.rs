use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::kv::{KvClient, Mirror};
use crate::model::{Level, ObjectKey};
use crate::statistics::provider::Provider;
use crate::statistics::{object_prefix, Aggregated, Value, STATS_ROOT};

/// Aggregates from an in-memory mirror of the whole `stats/` prefix.
/// Staleness is bounded by the watch delivery latency.
pub struct L1Provider {
    mirror: Arc<Mirror<Value>>,
}

impl L1Provider {
    pub async fn start(client: Arc<dyn KvClient>) -> Result<Self> {
        Ok(Self { mirror: Mirror::start(client, STATS_ROOT).await? })
    }

    /// Store revision the mirror has applied.
    pub fn revision(&self) -> i64 { self.mirror.revision() }

    pub async fn wait_for_revision(&self, revision: i64) -> Result<i64> { self.mirror.wait_for_revision(revision).await }

    pub(crate) fn aggregate(&self, key: &ObjectKey) -> Aggregated {
        let mut agg = Aggregated::default();
        for level in Level::ALL {
            let sum = self.mirror.fold_prefix(&object_prefix(level, key), Value::default(), |acc, _, v| acc + *v);
            agg.add(level, sum);
        }
        agg
    }

    pub fn stop(&self) { self.mirror.stop(); }
}

#[async_trait]
impl Provider for L1Provider {
    async fn aggregated_stats_for(&self, key: &ObjectKey) -> Result<Aggregated> { Ok(self.aggregate(key)) }
}
