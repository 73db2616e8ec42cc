use ahash::{AHashMap, AHashSet};

use crate::model::{BlockKey, CandidatePair, NormalizedRecord};

/// Equi-join on one derived key.
///
/// The right side is grouped into key buckets once, then every left record
/// looks up its bucket: O(n + m + output). Records whose key is null on either
/// side never pair.
pub fn block_by<F>(
    left: &[NormalizedRecord],
    right: &[NormalizedRecord],
    key_fn: F,
) -> Vec<CandidatePair>
where
    F: Fn(&NormalizedRecord) -> Option<&BlockKey>,
{
    let mut buckets: AHashMap<&BlockKey, Vec<usize>> = AHashMap::new();
    for (ri, record) in right.iter().enumerate() {
        if let Some(key) = key_fn(record) {
            buckets.entry(key).or_default().push(ri);
        }
    }

    let mut pairs = Vec::new();
    for (li, record) in left.iter().enumerate() {
        let Some(key) = key_fn(record) else {
            continue;
        };
        if let Some(bucket) = buckets.get(key) {
            pairs.extend(bucket.iter().map(|&ri| CandidatePair::new(li, ri)));
        }
    }
    pairs
}

/// Equi-join on the named derived key.
pub fn block(
    left: &[NormalizedRecord],
    right: &[NormalizedRecord],
    key: &str,
) -> Vec<CandidatePair> {
    block_by(left, right, |r| r.key(key))
}

/// Union of the equi-joins on several keys, deduplicated by pair identity and
/// sorted by (left, right).
pub fn block_union<S: AsRef<str>>(
    left: &[NormalizedRecord],
    right: &[NormalizedRecord],
    keys: &[S],
) -> Vec<CandidatePair> {
    let mut seen: AHashSet<CandidatePair> = AHashSet::new();
    for key in keys {
        let key = key.as_ref();
        let pairs = block(left, right, key);
        log::debug!("blocking key '{key}': {} pairs", pairs.len());
        seen.extend(pairs);
    }
    let mut pairs: Vec<CandidatePair> = seen.into_iter().collect();
    pairs.sort_unstable();
    pairs
}
