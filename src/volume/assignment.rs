//! Deterministic selection of volumes for a new file.
//!
//! The file open time seeds every hash, so the same inputs always give the same
//! ordered list and a restarted node re-derives the assignment it made before.

use std::collections::BTreeMap;

use xxhash_rust::xxh3::xxh3_64_with_seed;

use super::VolumeMetadata;
use crate::model::VolumeId;

#[inline]
fn rank(seed: i64, s: &str) -> u64 { xxh3_64_with_seed(s.as_bytes(), seed as u64) }

/// Returns up to `count` volume ids: volumes of the preferred types (in list order,
/// round-robin between them) first, then the remaining types round-robin in a
/// seed-dependent order. Within one type, volumes of different nodes alternate.
pub fn volumes_for(volumes: &[VolumeMetadata], count: usize, preferred_types: &[String], seed: i64) -> Vec<VolumeId> {
    let mut by_type: BTreeMap<&str, Vec<&VolumeMetadata>> = BTreeMap::new();
    for v in volumes {
        by_type.entry(v.spec.vol_type.as_str()).or_default().push(v);
    }
    let mut queues: BTreeMap<&str, Vec<&VolumeId>> = by_type.into_iter().map(|(t, vs)| (t, spread_by_node(vs, seed))).collect();

    let mut preferred: Vec<Vec<&VolumeId>> = Vec::new();
    for t in preferred_types {
        if let Some(q) = queues.remove(t.as_str()) {
            preferred.push(q);
        }
    }
    let mut others: Vec<(&str, Vec<&VolumeId>)> = queues.into_iter().collect();
    others.sort_by(|(a, _), (b, _)| rank(seed, a).cmp(&rank(seed, b)).then_with(|| a.cmp(b)));

    let mut out = round_robin(preferred, count);
    let rest = count.saturating_sub(out.len());
    out.extend(round_robin(others.into_iter().map(|(_, q)| q).collect(), rest));
    out.into_iter().cloned().collect()
}

/// Orders volumes of one type: nodes and volumes by hash, then one volume per node per round.
fn spread_by_node(volumes: Vec<&VolumeMetadata>, seed: i64) -> Vec<&VolumeId> {
    let mut by_node: BTreeMap<&str, Vec<&VolumeMetadata>> = BTreeMap::new();
    for v in volumes {
        by_node.entry(v.spec.node_id.as_str()).or_default().push(v);
    }
    let mut nodes: Vec<(&str, Vec<&VolumeId>)> = by_node
        .into_iter()
        .map(|(node, mut vs)| {
            vs.sort_by(|a, b| rank(seed, a.id.as_str()).cmp(&rank(seed, b.id.as_str())).then_with(|| a.id.cmp(&b.id)));
            (node, vs.into_iter().map(|v| &v.id).collect())
        })
        .collect();
    nodes.sort_by(|(a, _), (b, _)| rank(seed, a).cmp(&rank(seed, b)).then_with(|| a.cmp(b)));
    round_robin(nodes.into_iter().map(|(_, vs)| vs).collect(), usize::MAX)
}

fn round_robin<T>(queues: Vec<Vec<T>>, limit: usize) -> Vec<T> {
    let mut iters: Vec<_> = queues.into_iter().map(|q| q.into_iter()).collect();
    let mut out = Vec::new();
    while out.len() < limit {
        let mut progressed = false;
        for it in iters.iter_mut() {
            if out.len() >= limit {
                break;
            }
            if let Some(x) = it.next() {
                out.push(x);
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::VolumeSpec;
    use std::collections::HashSet;
    use std::path::PathBuf;

    /// `node/type/label` shorthand, the id equals the shorthand.
    fn volumes(defs: &[&str]) -> Vec<VolumeMetadata> {
        defs.iter()
            .map(|d| {
                let parts: Vec<&str> = d.split('/').collect();
                VolumeMetadata {
                    id: VolumeId::new(*d),
                    spec: VolumeSpec { node_id: parts[0].into(), path: PathBuf::from(d), vol_type: parts[1].into(), label: parts[2].into() },
                }
            })
            .collect()
    }

    fn ids(v: &[VolumeId]) -> Vec<&str> { v.iter().map(|id| id.as_str()).collect() }

    fn seed(s: &str) -> i64 { s.parse::<crate::model::UtcTime>().unwrap().timestamp_nanos() }

    const ALL: &[&str] = &["node/hdd/1", "node/hdd/2", "node/hdd/3", "node/ssd/1", "node/ssd/2", "node/top/1"];

    #[test]
    fn empty_and_small_inputs() {
        assert!(volumes_for(&[], 1, &["missing".into()], 1).is_empty());
        let vs = volumes(&["node/hdd/1"]);
        assert_eq!(ids(&volumes_for(&vs, 1, &["missing".into()], 1)), vec!["node/hdd/1"]);
        assert!(volumes_for(&vs, 0, &[], 1).is_empty());
    }

    #[test]
    fn deterministic_for_a_seed() {
        let vs = volumes(ALL);
        let s = seed("2000-01-01T01:00:00.000Z");
        let first = volumes_for(&vs, 4, &["ssd".into()], s);
        for _ in 0..10 {
            assert_eq!(volumes_for(&vs, 4, &["ssd".into()], s), first);
        }
        // Input order does not matter.
        let mut reversed = vs.clone();
        reversed.reverse();
        assert_eq!(volumes_for(&reversed, 4, &["ssd".into()], s), first);
    }

    #[test]
    fn preferred_types_come_first() {
        let vs = volumes(ALL);
        for s in ["2000-01-01T01:00:00.000Z", "2000-01-01T02:00:00.123Z", "2000-01-01T03:00:00.456Z"] {
            let out = volumes_for(&vs, 4, &["ssd".into(), "hdd".into()], seed(s));
            let out = ids(&out);
            assert_eq!(out.len(), 4);
            // ssd and hdd alternate in the preference order.
            let types: Vec<&str> = out.iter().map(|id| id.split('/').nth(1).unwrap()).collect();
            assert_eq!(types, vec!["ssd", "hdd", "ssd", "hdd"]);
            assert!(out.iter().all(|id| !id.contains("top")), "{out:?}");
            assert_eq!(out.iter().filter(|id| id.contains("ssd")).count(), 2, "{out:?}");

            let top = volumes_for(&vs, 1, &["top".into()], seed(s));
            assert_eq!(ids(&top), vec!["node/top/1"]);
        }
    }

    #[test]
    fn returns_all_volumes_at_most_once() {
        let vs = volumes(ALL);
        let out = volumes_for(&vs, 10, &["missing".into()], seed("2000-01-01T01:00:00.000Z"));
        assert_eq!(out.len(), ALL.len());
        let unique: HashSet<&VolumeId> = out.iter().collect();
        assert_eq!(unique.len(), ALL.len());
    }

    #[test]
    fn nodes_alternate_within_a_type() {
        let vs = volumes(&["a/hdd/1", "a/hdd/2", "a/hdd/3", "b/hdd/1", "b/hdd/2", "b/hdd/3"]);
        for s in 0..20 {
            let out = volumes_for(&vs, 6, &["hdd".into()], s);
            let nodes: Vec<&str> = out.iter().map(|id| &id.as_str()[..1]).collect();
            for pair in nodes.windows(2) {
                assert_ne!(pair[0], pair[1], "seed {s}: {nodes:?}");
            }
        }
    }

    #[test]
    fn seed_changes_the_choice() {
        let vs = volumes(&["node/hdd/1", "node/hdd/2", "node/hdd/3", "node/hdd/4", "node/hdd/5", "node/hdd/6", "node/hdd/7", "node/hdd/8"]);
        let picks: HashSet<VolumeId> = (0..64).map(|s| volumes_for(&vs, 1, &[], s * 1_000_000).remove(0)).collect();
        assert!(picks.len() > 1);
    }
}
