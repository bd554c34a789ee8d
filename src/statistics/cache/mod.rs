//! Cached statistics providers.
//! `L1Provider` keeps a watch-synchronised replica of `stats/`; `L2Provider` caches
//! aggregated results per key on top of it and is invalidated on a fixed TTL.

mod l1;
mod l2;

pub use l1::L1Provider;
pub use l2::L2Provider;
