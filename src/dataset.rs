//! Partitioned, materialized datasets.
//!
//! A [`Dataset<T>`] is the typed artifact every pipeline stage produces: a set
//! of partitions of `T` plus the [`Partitioner`] (if any) that placed the rows.
//! Transforms run partition-wise on the owning
//! [`ExecutionContext`]'s worker pool and return a new dataset registered as a
//! stage in the context's [`Pipeline`](crate::pipeline::Pipeline). Nothing is
//! deferred: each call materializes its output, and [`Dataset::collect`] is the
//! explicit way to take the rows out.
//!
//! ```
//! use geobeam::config::EngineConfig;
//! use geobeam::context::ExecutionContext;
//! use geobeam::dataset::Dataset;
//!
//! # fn main() -> geobeam::Result<()> {
//! let ctx = ExecutionContext::acquire(&EngineConfig { partitions: 3, ..Default::default() })?;
//! let ids = Dataset::from_vec(&ctx, (0..10i64).collect());
//! let evens = ids.filter(|id| id % 2 == 0).map(|id| id * 10);
//! assert_eq!(evens.collect(), vec![0, 20, 40, 60, 80]);
//! # Ok(()) }
//! ```

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::partition::{PartitionKey, Partitioner};
use crate::pipeline::{StageId, StageInfo, StageKind};
use rayon::prelude::*;
use std::sync::Arc;

/// Bound for values carried by a [`Dataset`].
pub trait Element: 'static + Send + Sync + Clone {}
impl<T> Element for T where T: 'static + Send + Sync + Clone {}

/// A partitioned, immutable, materialized collection of `T`.
#[derive(Clone)]
pub struct Dataset<T> {
    ctx: ExecutionContext,
    id: StageId,
    parts: Arc<Vec<Vec<T>>>,
    partitioner: Option<Partitioner>,
}

impl<T: Element> Dataset<T> {
    /// Create a source dataset by splitting `data` into the context's default
    /// number of contiguous partitions. Element order is preserved.
    pub fn from_vec(ctx: &ExecutionContext, data: Vec<T>) -> Self {
        let parts = split_vec(data, ctx.partitions());
        Self::derive(ctx, parts, None, StageKind::Source, "source", Vec::new())
    }

    pub(crate) fn derive(
        ctx: &ExecutionContext,
        parts: Vec<Vec<T>>,
        partitioner: Option<Partitioner>,
        kind: StageKind,
        label: &str,
        parents: Vec<StageId>,
    ) -> Self {
        let id = ctx.pipeline().register(StageInfo {
            kind,
            label: label.to_string(),
            parents,
            rows: parts.iter().map(Vec::len).sum(),
            partitions: parts.len(),
        });
        Self {
            ctx: ctx.clone(),
            id,
            parts: Arc::new(parts),
            partitioner,
        }
    }

    /// Name this stage in the pipeline graph.
    #[must_use]
    pub fn label(self, label: &str) -> Self {
        self.ctx.pipeline().relabel(self.id, label);
        self
    }

    pub fn id(&self) -> StageId {
        self.id
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    /// Partitioner that placed the rows, if the dataset is key-partitioned.
    pub fn partitioner(&self) -> Option<&Partitioner> {
        self.partitioner.as_ref()
    }

    pub fn partitions(&self) -> &[Vec<T>] {
        &self.parts
    }

    pub fn num_partitions(&self) -> usize {
        self.parts.len()
    }

    pub fn len(&self) -> usize {
        self.parts.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Materialize all rows, partition by partition.
    pub fn collect(&self) -> Vec<T> {
        self.parts.iter().flatten().cloned().collect()
    }

    /// Materialize all rows sorted by `key`.
    pub fn collect_sorted_by_key<K: Ord, F: Fn(&T) -> K>(&self, key: F) -> Vec<T> {
        let mut out = self.collect();
        out.sort_by_key(key);
        out
    }

    fn run_partitions<O, F>(&self, f: F) -> Vec<Vec<O>>
    where
        O: Element,
        F: Fn(&[T]) -> Vec<O> + Send + Sync,
    {
        let parts = &self.parts;
        self.ctx
            .install(|| parts.par_iter().map(|p| f(p.as_slice())).collect())
    }

    pub fn map<O, F>(&self, f: F) -> Dataset<O>
    where
        O: Element,
        F: Fn(&T) -> O + Send + Sync,
    {
        let parts = self.run_partitions(|p| p.iter().map(&f).collect());
        Dataset::derive(&self.ctx, parts, None, StageKind::Map, "map", vec![self.id])
    }

    /// Like [`map`](Self::map), for transforms that keep each row's partition
    /// key unchanged. The output keeps this dataset's partitioner.
    pub fn map_same_key<O, F>(&self, f: F) -> Dataset<O>
    where
        O: Element,
        F: Fn(&T) -> O + Send + Sync,
    {
        let parts = self.run_partitions(|p| p.iter().map(&f).collect());
        Dataset::derive(
            &self.ctx,
            parts,
            self.partitioner.clone(),
            StageKind::Map,
            "map",
            vec![self.id],
        )
    }

    pub fn flat_map<O, I, F>(&self, f: F) -> Dataset<O>
    where
        O: Element,
        I: IntoIterator<Item = O>,
        F: Fn(&T) -> I + Send + Sync,
    {
        let parts = self.run_partitions(|p| p.iter().flat_map(&f).collect());
        Dataset::derive(&self.ctx, parts, None, StageKind::FlatMap, "flat_map", vec![self.id])
    }

    /// Keep rows matching `pred`. Partitioning is preserved.
    #[must_use]
    pub fn filter<F>(&self, pred: F) -> Dataset<T>
    where
        F: Fn(&T) -> bool + Send + Sync,
    {
        let parts = self.run_partitions(|p| p.iter().filter(|t| pred(*t)).cloned().collect());
        Dataset::derive(
            &self.ctx,
            parts,
            self.partitioner.clone(),
            StageKind::Filter,
            "filter",
            vec![self.id],
        )
    }

    /// Transform whole partitions at once. Partitioning is preserved, so `f`
    /// must not change row keys.
    pub fn map_partitions<O, F>(&self, f: F) -> Dataset<O>
    where
        O: Element,
        F: Fn(&[T]) -> Vec<O> + Send + Sync,
    {
        let parts = self.run_partitions(f);
        Dataset::derive(
            &self.ctx,
            parts,
            self.partitioner.clone(),
            StageKind::MapPartitions,
            "map_partitions",
            vec![self.id],
        )
    }

    /// Fallible [`map_partitions`](Self::map_partitions); the first error wins.
    pub fn try_map_partitions<O, F>(&self, f: F) -> Result<Dataset<O>>
    where
        O: Element,
        F: Fn(&[T]) -> Result<Vec<O>> + Send + Sync,
    {
        let parts = &self.parts;
        let parts: Vec<Vec<O>> = self
            .ctx
            .install(|| parts.par_iter().map(|p| f(p.as_slice())).collect::<Result<_>>())?;
        Ok(Dataset::derive(
            &self.ctx,
            parts,
            self.partitioner.clone(),
            StageKind::MapPartitions,
            "map_partitions",
            vec![self.id],
        ))
    }

    pub fn key_by<K, F>(&self, key_fn: F) -> Dataset<(K, T)>
    where
        K: Element,
        F: Fn(&T) -> K + Send + Sync,
    {
        self.map(move |t| (key_fn(t), t.clone()))
    }

    /// Redistribute rows so that every row lands in
    /// `partitioner.partition_for(key_fn(row))`.
    #[must_use]
    pub fn partition_by<K, F>(&self, partitioner: &Partitioner, key_fn: F) -> Dataset<T>
    where
        K: PartitionKey,
        F: Fn(&T) -> K + Send + Sync,
    {
        let n = partitioner.num_partitions();
        // Bucket each source partition locally, then gather bucket i from every source.
        let bucketed: Vec<Vec<Vec<T>>> = self.run_partitions_nested(|p| {
            let mut buckets: Vec<Vec<T>> = vec![Vec::new(); n];
            for t in p {
                buckets[partitioner.partition_for(&key_fn(t))].push(t.clone());
            }
            buckets
        });
        let mut parts: Vec<Vec<T>> = vec![Vec::new(); n];
        for buckets in bucketed {
            for (i, mut b) in buckets.into_iter().enumerate() {
                parts[i].append(&mut b);
            }
        }
        Dataset::derive(
            &self.ctx,
            parts,
            Some(partitioner.clone()),
            StageKind::Repartition,
            "partition_by",
            vec![self.id],
        )
    }

    fn run_partitions_nested<F>(&self, f: F) -> Vec<Vec<Vec<T>>>
    where
        F: Fn(&[T]) -> Vec<Vec<T>> + Send + Sync,
    {
        let parts = &self.parts;
        self.ctx
            .install(|| parts.par_iter().map(|p| f(p.as_slice())).collect())
    }

    /// Concatenate two datasets. Partitioning is kept only when both sides
    /// share the same partitioner, in which case partitions are merged pairwise.
    #[must_use]
    pub fn union(&self, other: &Dataset<T>) -> Dataset<T> {
        let (parts, partitioner) = match (&self.partitioner, &other.partitioner) {
            (Some(a), Some(b)) if a == b => {
                let parts = self
                    .parts
                    .iter()
                    .zip(other.parts.iter())
                    .map(|(l, r)| l.iter().chain(r.iter()).cloned().collect())
                    .collect();
                (parts, Some(a.clone()))
            }
            _ => {
                let parts = self.parts.iter().chain(other.parts.iter()).cloned().collect();
                (parts, None)
            }
        };
        Dataset::derive(
            &self.ctx,
            parts,
            partitioner,
            StageKind::Union,
            "union",
            vec![self.id, other.id],
        )
    }
}

/// Split into up to `n` contiguous chunks of ~len/n each (last may be shorter).
fn split_vec<T>(v: Vec<T>, n: usize) -> Vec<Vec<T>> {
    let len = v.len();
    if n <= 1 || len <= 1 {
        return vec![v];
    }
    let chunk = len.div_ceil(n);
    let mut out = Vec::with_capacity(n);
    let mut it = v.into_iter().peekable();
    while it.peek().is_some() {
        out.push(it.by_ref().take(chunk).collect());
    }
    out
}
