//! Stage graph of an enrichment run.
//!
//! Every [`Dataset`](crate::dataset::Dataset) produced inside an
//! [`ExecutionContext`](crate::context::ExecutionContext) is registered here as
//! a stage with a [`StageId`], its kind, a label, the stages it was derived
//! from, and its materialized size. The graph is purely descriptive: data lives
//! in the datasets, the pipeline only makes every intermediate artifact
//! addressable and lets [`Pipeline::explain`] render what ran.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Unique numeric identifier for a stage in a pipeline graph.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct StageId(u64);

impl StageId {
    /// Return the underlying numeric value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// What produced a stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageKind {
    Source,
    Map,
    FlatMap,
    Filter,
    MapPartitions,
    Repartition,
    JoinLeft,
    Union,
}

/// Metadata recorded for one stage.
#[derive(Clone, Debug)]
pub struct StageInfo {
    pub kind: StageKind,
    pub label: String,
    pub parents: Vec<StageId>,
    pub rows: usize,
    pub partitions: usize,
}

#[derive(Default)]
struct PipelineInner {
    next_id: u64,
    stages: BTreeMap<StageId, StageInfo>,
}

/// Shared handle to the stage graph. Cloning shares the same graph.
#[derive(Clone, Default)]
pub struct Pipeline {
    inner: Arc<Mutex<PipelineInner>>,
}

impl Pipeline {
    fn lock(&self) -> MutexGuard<'_, PipelineInner> {
        // The graph is append-only; a panic mid-insert cannot leave it inconsistent.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, info: StageInfo) -> StageId {
        let mut g = self.lock();
        let id = StageId(g.next_id);
        g.next_id += 1;
        g.stages.insert(id, info);
        id
    }

    pub(crate) fn relabel(&self, id: StageId, label: &str) {
        if let Some(info) = self.lock().stages.get_mut(&id) {
            info.label = label.to_string();
        }
    }

    /// Look up a stage by id.
    pub fn stage(&self, id: StageId) -> Option<StageInfo> {
        self.lock().stages.get(&id).cloned()
    }

    /// Find the most recent stage carrying `label`.
    pub fn find(&self, label: &str) -> Option<(StageId, StageInfo)> {
        self.lock()
            .stages
            .iter()
            .rev()
            .find(|(_, s)| s.label == label)
            .map(|(id, s)| (*id, s.clone()))
    }

    /// Number of registered stages.
    pub fn len(&self) -> usize {
        self.lock().stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Render the stage graph, one stage per line in creation order.
    pub fn explain(&self) -> String {
        let g = self.lock();
        let mut out = String::new();
        for (id, s) in &g.stages {
            let parents = s
                .parents
                .iter()
                .map(|p| format!("#{}", p.raw()))
                .collect::<Vec<_>>()
                .join(", ");
            let _ = write!(
                out,
                "#{} {:?} \"{}\" rows={} partitions={}",
                id.raw(),
                s.kind,
                s.label,
                s.rows,
                s.partitions
            );
            if !parents.is_empty() {
                let _ = write!(out, " <- [{parents}]");
            }
            out.push('\n');
        }
        out
    }
}
