//! Keyed left join over [`Dataset`]s.
//!
//! When both sides are already partitioned by the same [`Partitioner`], the
//! join runs partition-local with no data movement. Otherwise both sides are
//! first shuffled with a hash partitioner sized to the context. Either way the
//! set of output rows is the same; only the amount of data moved differs.
//!
//! Output row order is not guaranteed. Sort before asserting on it.

use crate::dataset::{Dataset, Element};
use crate::partition::{PartitionKey, Partitioner};
use crate::pipeline::StageKind;
use rayon::prelude::*;
use std::collections::HashMap;
use std::hash::Hash;

impl<K, V> Dataset<(K, V)>
where
    K: Element + PartitionKey + Eq + Hash,
    V: Element,
{
    /// Partition a keyed dataset by its key.
    #[must_use]
    pub fn partition_by_key(&self, partitioner: &Partitioner) -> Dataset<(K, V)> {
        self.partition_by(partitioner, |kv| kv.0.clone())
    }

    /// Left outer join on key: `(K, V)` × `(K, W)` → `(K, (V, Option<W>))`.
    ///
    /// Every left row appears at least once. A left row whose key occurs `n > 0`
    /// times on the right appears `n` times; callers that need at most one
    /// output per left row must ensure right keys are unique.
    pub fn join_left<W: Element>(&self, right: &Dataset<(K, W)>) -> Dataset<(K, (V, Option<W>))> {
        let (left, right) = match (self.partitioner(), right.partitioner()) {
            (Some(a), Some(b)) if a == b && self.num_partitions() == right.num_partitions() => {
                (self.clone(), right.clone())
            }
            _ => {
                let p = Partitioner::hash(self.context().partitions());
                log::debug!(
                    "join_left: shuffling {} + {} rows into {} partitions",
                    self.len(),
                    right.len(),
                    p.num_partitions()
                );
                (self.partition_by_key(&p), right.partition_by_key(&p))
            }
        };

        let ctx = left.context().clone();
        let pairs: Vec<(&Vec<(K, V)>, &Vec<(K, W)>)> =
            left.partitions().iter().zip(right.partitions().iter()).collect();
        let parts: Vec<Vec<(K, (V, Option<W>))>> = ctx.install(|| {
            pairs
                .into_par_iter()
                .map(|(l, r)| join_left_local(l, r))
                .collect()
        });

        Dataset::derive(
            &ctx,
            parts,
            left.partitioner().cloned(),
            StageKind::JoinLeft,
            "join_left",
            vec![self.id(), right.id()],
        )
    }
}

fn join_left_local<K, V, W>(left: &[(K, V)], right: &[(K, W)]) -> Vec<(K, (V, Option<W>))>
where
    K: Clone + Eq + Hash,
    V: Clone,
    W: Clone,
{
    let mut rm: HashMap<&K, Vec<&W>> = HashMap::with_capacity(right.len());
    for (k, w) in right {
        rm.entry(k).or_default().push(w);
    }
    let mut out = Vec::with_capacity(left.len());
    for (k, v) in left {
        match rm.get(k) {
            Some(ws) => {
                for w in ws {
                    out.push((k.clone(), (v.clone(), Some((*w).clone()))));
                }
            }
            None => out.push((k.clone(), (v.clone(), None))),
        }
    }
    out
}
