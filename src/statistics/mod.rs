//! Per-slice statistics and their level-partitioned key space.
//!
//! Key layout:
//! `stats/<level>/<project>/<receiver>/<export>/<fileOpenedAt>/<volumeId>/<sliceOpenedAt>/<suffix>`
//! where suffix is `value`, a node id, `_nodes_sum`, `_sum` or `_cleanup_sum`.
//! Aggregation of an object sums every value under the object's prefix.

pub mod cache;
pub mod collector;
pub mod provider;
pub mod repository;

use std::iter::Sum;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

use crate::model::{Level, ObjectKey, SliceKey, UtcTime};

pub const STATS_ROOT: &str = "stats/";
pub const VALUE_SUFFIX: &str = "value";
pub const NODES_SUM_SUFFIX: &str = "_nodes_sum";
pub const SUM_SUFFIX: &str = "_sum";
pub const CLEANUP_SUM_SUFFIX: &str = "_cleanup_sum";

/// Statistics of one slice, or the sum of several.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Value {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub slices_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_record_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_record_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub records_count: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub uncompressed_size: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub compressed_size: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub staging_size: u64,
}

fn is_zero(v: &u64) -> bool { *v == 0 }

fn earliest(a: Option<UtcTime>, b: Option<UtcTime>) -> Option<UtcTime> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

fn latest(a: Option<UtcTime>, b: Option<UtcTime>) -> Option<UtcTime> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

impl Value {
    pub fn is_zero(&self) -> bool { *self == Value::default() }
}

impl Add for Value {
    type Output = Value;

    fn add(self, o: Value) -> Value {
        Value {
            slices_count: self.slices_count.saturating_add(o.slices_count),
            first_record_at: earliest(self.first_record_at, o.first_record_at),
            last_record_at: latest(self.last_record_at, o.last_record_at),
            records_count: self.records_count.saturating_add(o.records_count),
            uncompressed_size: self.uncompressed_size.saturating_add(o.uncompressed_size),
            compressed_size: self.compressed_size.saturating_add(o.compressed_size),
            staging_size: self.staging_size.saturating_add(o.staging_size),
        }
    }
}

impl AddAssign for Value {
    fn add_assign(&mut self, o: Value) { *self = *self + o; }
}

impl Sum for Value {
    fn sum<I: Iterator<Item = Value>>(iter: I) -> Value { iter.fold(Value::default(), Add::add) }
}

impl<'a> Sum<&'a Value> for Value {
    fn sum<I: Iterator<Item = &'a Value>>(iter: I) -> Value { iter.copied().sum() }
}

/// Level-partitioned statistics of an object. `total` is always derived.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregated {
    pub local: Value,
    pub staging: Value,
    pub target: Value,
    pub total: Value,
}

impl Aggregated {
    pub fn new(local: Value, staging: Value, target: Value) -> Self {
        Self { local, staging, target, total: local + staging + target }
    }

    pub fn add(&mut self, level: Level, v: Value) {
        match level {
            Level::Local => self.local += v,
            Level::Staging => self.staging += v,
            Level::Target => self.target += v,
        }
        self.total += v;
    }

    pub fn get(&self, level: Level) -> Value {
        match level {
            Level::Local => self.local,
            Level::Staging => self.staging,
            Level::Target => self.target,
        }
    }
}

/// Statistics value of one slice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PerSlice {
    pub key: SliceKey,
    pub value: Value,
}

/// `stats/<level>/`
#[inline]
pub fn level_prefix(level: Level) -> String { format!("{}{}/", STATS_ROOT, level) }

/// `stats/<level>/<object>/`, the trailing slash keeps `12/` from matching `123/`.
#[inline]
pub fn object_prefix(level: Level, object: &ObjectKey) -> String { format!("{}{}/", level_prefix(level), object) }

#[inline]
pub fn value_key(level: Level, slice: &SliceKey) -> String {
    format!("{}{}/{}", level_prefix(level), slice, VALUE_SUFFIX)
}

#[inline]
pub fn node_key(level: Level, slice: &SliceKey, node_id: &str) -> String {
    assert!(!node_id.is_empty() && !node_id.starts_with('_'), "invalid node id \"{}\"", node_id);
    format!("{}{}/{}", level_prefix(level), slice, node_id)
}

#[inline]
pub fn sum_key(level: Level, object: &ObjectKey) -> String { format!("{}{}", object_prefix(level, object), SUM_SUFFIX) }

#[inline]
pub fn cleanup_sum_key(export: &crate::model::ExportKey) -> String {
    format!("{}{}", object_prefix(Level::Target, &ObjectKey::Export(export.clone())), CLEANUP_SUM_SUFFIX)
}
