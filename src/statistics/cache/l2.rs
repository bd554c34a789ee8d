use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use super::l1::L1Provider;
use crate::error::Result;
use crate::model::ObjectKey;
use crate::statistics::provider::Provider;
use crate::statistics::Aggregated;

#[derive(Default)]
struct Cache {
    map: HashMap<ObjectKey, Aggregated>,
    /// L1 revision at the first miss after invalidation, 0 while empty.
    revision: i64,
}

/// Caches final aggregated results per object key on top of L1. The whole cache is
/// dropped every `ttl` by a background ticker.
pub struct L2Provider {
    l1: Arc<L1Provider>,
    cache: Arc<RwLock<Cache>>,
    invalidator: JoinHandle<()>,
}

impl L2Provider {
    pub fn start(l1: Arc<L1Provider>, ttl: Duration) -> Self {
        let cache = Arc::new(RwLock::new(Cache::default()));
        let c = cache.clone();
        let invalidator = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + ttl, ttl);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let mut g = c.write();
                debug!(target: "slicestore::statistics", "L2 cache invalidated: keys={}, revision={}", g.map.len(), g.revision);
                *g = Cache::default();
            }
        });
        Self { l1, cache, invalidator }
    }

    /// Revision of the L1 state the cached results were computed from.
    pub fn revision(&self) -> i64 { self.cache.read().revision }

    pub fn clear(&self) { *self.cache.write() = Cache::default(); }

    fn get_or_compute(&self, key: &ObjectKey) -> Aggregated {
        if let Some(agg) = self.cache.read().map.get(key) {
            trace!(target: "slicestore::statistics", "L2 hit: {}", key);
            return *agg;
        }
        let mut g = self.cache.write();
        if let Some(agg) = g.map.get(key) {
            return *agg;
        }
        if g.revision == 0 {
            g.revision = self.l1.revision();
        }
        let agg = self.l1.aggregate(key);
        g.map.insert(key.clone(), agg);
        agg
    }
}

impl Drop for L2Provider {
    fn drop(&mut self) { self.invalidator.abort(); }
}

#[async_trait]
impl Provider for L2Provider {
    async fn aggregated_stats_for(&self, key: &ObjectKey) -> Result<Aggregated> { Ok(self.get_or_compute(key)) }
}
