//! Key-based partitioning.
//!
//! A [`Partitioner`] maps a key to a partition index so that every record
//! sharing a key lands in the same partition in every dataset partitioned the
//! same way. Joins use this to run partition-local instead of shuffling; the
//! join result does not depend on the partition count.

use crate::window::{KeyRange, TripId};
use std::hash::{DefaultHasher, Hash, Hasher};

/// Keys that can drive a [`Partitioner`].
pub trait PartitionKey: Hash {
    /// Position of the key on the integer line, for range partitioning.
    /// Keys without one are always hash partitioned.
    fn ordinal(&self) -> Option<i64> {
        None
    }
}

impl PartitionKey for i64 {
    fn ordinal(&self) -> Option<i64> {
        Some(*self)
    }
}

impl PartitionKey for (u32, u32) {}

impl PartitionKey for String {}

/// Assigns keys to partitions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Partitioner {
    /// Stable hash of the key modulo `partitions`.
    Hash { partitions: usize },
    /// Range slicing on the key ordinal. `bounds` are sorted exclusive upper
    /// bounds; there are `bounds.len() + 1` partitions.
    Range { bounds: Vec<TripId> },
}

impl Partitioner {
    pub fn hash(partitions: usize) -> Self {
        Self::Hash {
            partitions: partitions.max(1),
        }
    }

    pub fn range(mut bounds: Vec<TripId>) -> Self {
        bounds.sort_unstable();
        bounds.dedup();
        Self::Range { bounds }
    }

    /// Slice `range` into `partitions` contiguous, equally sized key ranges.
    pub fn range_uniform(range: KeyRange, partitions: usize) -> Self {
        let n = partitions.max(1) as u64;
        let step = range.len().div_ceil(n).max(1);
        let bounds = (1..n)
            .map(|i| range.start.saturating_add((step * i) as i64))
            .filter(|b| *b < range.end)
            .collect();
        Self::range(bounds)
    }

    pub fn num_partitions(&self) -> usize {
        match self {
            Self::Hash { partitions } => *partitions,
            Self::Range { bounds } => bounds.len() + 1,
        }
    }

    /// Partition index for `key`, always `< num_partitions()`.
    pub fn partition_for<K: PartitionKey + ?Sized>(&self, key: &K) -> usize {
        match self {
            Self::Range { bounds } => match key.ordinal() {
                Some(k) => bounds.partition_point(|b| *b <= k),
                None => hash_slot(key, bounds.len() + 1),
            },
            Self::Hash { partitions } => hash_slot(key, *partitions),
        }
    }
}

fn hash_slot<K: Hash + ?Sized>(key: &K, n: usize) -> usize {
    // DefaultHasher::new() uses fixed keys, so slots are stable within a build.
    let mut h = DefaultHasher::new();
    key.hash(&mut h);
    (h.finish() % n as u64) as usize
}
