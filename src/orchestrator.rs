//! Batch enrichment orchestrator.
//!
//! [`BatchEnricher`] drives the whole pipeline (split, enrich, merge, commit)
//! over a trip source in disjoint key-range windows. Each window runs
//! independently inside one [`ExecutionContext`]; a failing window is retried
//! up to `max_window_retries` times when the failure is retryable, and is
//! otherwise surfaced as an [`EnrichError::Stage`] naming the stage and the
//! window.
//!
//! With a ledger configured, every committed window is recorded together with
//! a SHA-256 checksum of its rows. A later [`run`](BatchEnricher::run) skips
//! windows already in the ledger, so a failed run resumes at the failing
//! window.
//!
//! ```
//! use geobeam::config::EngineConfig;
//! use geobeam::orchestrator::BatchEnricher;
//! use geobeam::records::TaxiTrip;
//! use geobeam::store::{MemorySink, VecSource};
//!
//! let cfg = EngineConfig { threads: Some(2), partitions: 4, window_size: 10, ..Default::default() };
//! let engine = BatchEnricher::new(cfg, &[])?;
//! let source = VecSource::<TaxiTrip>::new(Vec::new());
//! let sink = MemorySink::<TaxiTrip>::new();
//! let report = engine.run::<TaxiTrip>(&source, &sink)?;
//! assert!(report.windows.is_empty());
//! # Ok::<(), geobeam::EnrichError>(())
//! ```

use crate::config::{EngineConfig, WriteStrategy};
use crate::context::ExecutionContext;
use crate::dataset::Dataset;
use crate::enrich::{Enricher, LayerSpec};
use crate::error::{EnrichError, Result, Stage};
use crate::matcher::MatchSummary;
use crate::merge::{merge_trips, merged_columns, split_endpoints};
use crate::partition::Partitioner;
use crate::records::{ColumnSpec, EnrichedPointRecord, MergedTripRecord, Trip};
use crate::store::{ResultSink, TripSource};
use crate::window::KeyRange;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Outcome of one committed window.
#[derive(Clone, Debug, Serialize)]
pub struct WindowReport {
    pub window: KeyRange,
    pub trips: usize,
    pub rows: usize,
    /// 1 when the first attempt succeeded.
    pub attempts: u32,
    pub checksum: String,
    /// Match counters per reference layer.
    pub matches: Vec<(String, MatchSummary)>,
}

/// Outcome of a [`BatchEnricher::run`].
#[derive(Clone, Debug, Default, Serialize)]
pub struct RunReport {
    /// Windows processed and committed by this run, in key order.
    pub windows: Vec<WindowReport>,
    /// Windows skipped because the ledger already had them.
    pub skipped: Vec<KeyRange>,
}

impl RunReport {
    pub fn rows_written(&self) -> usize {
        self.windows.iter().map(|w| w.rows).sum()
    }
}

/// One committed window as stored in the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub window: KeyRange,
    pub rows: usize,
    pub checksum: String,
}

/// Completed windows of a run, persisted as JSON.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Ledger {
    pub window_size: i64,
    pub windows: Vec<LedgerEntry>,
}

impl Ledger {
    /// Read a ledger; a missing file is an empty ledger.
    pub fn load(path: &Path) -> anyhow::Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path).with_context(|| format!("read ledger {}", path.display()))?;
        let ledger = serde_json::from_str(&text).with_context(|| format!("parse ledger {}", path.display()))?;
        Ok(Some(ledger))
    }

    /// Write through a temporary file so a crash never leaves half a ledger.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let tmp = path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(self).context("serialize ledger")?;
        std::fs::write(&tmp, text).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, path).with_context(|| format!("rename {} into place", tmp.display()))?;
        Ok(())
    }

    pub fn entry(&self, window: KeyRange) -> Option<&LedgerEntry> {
        self.windows.iter().find(|e| e.window == window)
    }

    fn record(&mut self, entry: LedgerEntry) {
        self.windows.retain(|e| e.window != entry.window);
        self.windows.push(entry);
        self.windows.sort_by_key(|e| e.window);
    }
}

/// SHA-256 over the rows of a window in trip-id order, as lowercase hex.
pub fn rows_checksum<T: Trip>(rows: &[MergedTripRecord<T>]) -> Result<String> {
    let mut order: Vec<&MergedTripRecord<T>> = rows.iter().collect();
    order.sort_by_key(|r| r.trip_id());
    let mut hasher = Sha256::new();
    for row in order {
        let bytes = serde_json::to_vec(&(&row.trip, &row.columns)).context("serialize row for checksum")?;
        hasher.update(&bytes);
        hasher.update(b"\n");
    }
    Ok(hasher.finalize().iter().map(|b| format!("{b:02x}")).collect())
}

/// Runs enrichment over a trip source, window by window.
pub struct BatchEnricher {
    config: EngineConfig,
    enricher: Enricher,
    ledger_path: Option<PathBuf>,
}

impl BatchEnricher {
    /// Validate `config` and load every reference layer. Load failures are
    /// fatal and attributed to the `load` stage, or `tile` for raster
    /// decoding.
    pub fn new(config: EngineConfig, layers: &[LayerSpec]) -> Result<Self> {
        config.validate()?;
        let enricher = Enricher::load(layers).map_err(|e| {
            let stage = match e {
                EnrichError::RasterFormat { .. } => Stage::Tile,
                _ => Stage::Load,
            };
            e.at(stage, None)
        })?;
        Ok(Self::with_enricher(config, enricher))
    }

    /// Use already loaded layers.
    pub fn with_enricher(config: EngineConfig, enricher: Enricher) -> Self {
        Self {
            config,
            enricher,
            ledger_path: None,
        }
    }

    /// Record committed windows in `path` and skip them on later runs.
    #[must_use]
    pub fn with_ledger(mut self, path: impl Into<PathBuf>) -> Self {
        self.ledger_path = Some(path.into());
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn enricher(&self) -> &Enricher {
        &self.enricher
    }

    /// Point-level enrichment columns.
    pub fn output_columns(&self) -> Vec<ColumnSpec> {
        self.enricher.output_columns()
    }

    /// Enrichment columns as they appear on merged rows.
    pub fn merged_columns(&self) -> Vec<ColumnSpec> {
        merged_columns(&self.output_columns())
    }

    /// Enrich `trips` in a single pass on an existing context.
    pub fn process<T: Trip>(&self, ctx: &ExecutionContext, trips: Vec<T>) -> Result<Vec<MergedTripRecord<T>>> {
        let partitioner = Partitioner::hash(ctx.partitions());
        self.process_partitioned(ctx, trips, &partitioner, None)
            .map(|(rows, _)| rows)
    }

    /// Enrich `trips` in a single pass inside a fresh execution context.
    pub fn enrich_all<T: Trip>(&self, trips: Vec<T>) -> Result<Vec<MergedTripRecord<T>>> {
        ExecutionContext::scope(&self.config, |ctx| self.process(ctx, trips))
    }

    fn process_partitioned<T: Trip>(
        &self,
        ctx: &ExecutionContext,
        trips: Vec<T>,
        partitioner: &Partitioner,
        window: Option<KeyRange>,
    ) -> Result<(Vec<MergedTripRecord<T>>, Vec<(String, MatchSummary)>)> {
        let trips = Dataset::from_vec(ctx, trips)
            .partition_by(partitioner, T::trip_id)
            .label("trips");
        let points = split_endpoints(&trips)
            .map(|p| EnrichedPointRecord::from(p.clone()))
            .partition_by(partitioner, EnrichedPointRecord::trip_id)
            .label("points");

        let (enriched, summaries) = self
            .enricher
            .enrich_with_stats(&points)
            .map_err(|e| e.at(Stage::Match, window))?;
        let merged = merge_trips(&trips, &enriched, &self.output_columns())
            .map_err(|e| e.at(Stage::Merge, window))?;
        Ok((merged.collect_sorted_by_key(MergedTripRecord::trip_id), summaries))
    }

    /// Process every window of `source` and commit it to `sink`.
    ///
    /// Windows are the aligned `window_size` ranges covering the source's
    /// key range, in key order. The last window is not clipped to the
    /// current end of the source, so a source that grows between runs maps
    /// to the same windows, part names, and ledger keys. With
    /// [`WriteStrategy::Append`] each window adds a part; re-running a window
    /// that was already committed (without a ledger) stores its rows twice.
    /// [`WriteStrategy::Idempotent`] replaces the window's part instead.
    pub fn run<T: Trip>(&self, source: &dyn TripSource<T>, sink: &dyn ResultSink<T>) -> Result<RunReport> {
        let Some(range) = source.key_range().map_err(|e| e.at(Stage::Load, None))? else {
            log::info!("trip source is empty; nothing to enrich");
            return Ok(RunReport::default());
        };
        let mut ledger = self.open_ledger()?;
        log::info!(
            "enriching trips {range} in windows of {} ({:?} writes)",
            self.config.window_size,
            self.config.write_strategy
        );

        ExecutionContext::scope(&self.config, |ctx| {
            let mut report = RunReport::default();
            for window in range.aligned_windows(self.config.window_size) {
                if let Some(done) = ledger.as_ref().and_then(|l| l.entry(window)) {
                    log::info!("window {window} already committed ({} rows); skipping", done.rows);
                    report.skipped.push(window);
                    continue;
                }
                let done = self.run_window_with_retries(ctx, source, sink, window)?;
                if let (Some(ledger), Some(path)) = (ledger.as_mut(), self.ledger_path.as_deref()) {
                    ledger.record(LedgerEntry {
                        window,
                        rows: done.rows,
                        checksum: done.checksum.clone(),
                    });
                    ledger
                        .save(path)
                        .map_err(|source| EnrichError::WindowAppend { window, source })
                        .map_err(|e| e.at(Stage::Write, Some(window)))?;
                }
                report.windows.push(done);
            }
            log::info!(
                "enrichment finished: {} window(s) committed, {} skipped, {} rows",
                report.windows.len(),
                report.skipped.len(),
                report.rows_written()
            );
            Ok(report)
        })
    }

    /// Clear `sink` and the ledger, then [`run`](Self::run) from scratch.
    pub fn run_fresh<T: Trip>(&self, source: &dyn TripSource<T>, sink: &dyn ResultSink<T>) -> Result<RunReport> {
        sink.clear().map_err(|e| e.at(Stage::Write, None))?;
        if let Some(path) = &self.ledger_path
            && path.exists()
        {
            std::fs::remove_file(path)
                .with_context(|| format!("remove ledger {}", path.display()))
                .map_err(|e| EnrichError::Other(e).at(Stage::Write, None))?;
        }
        self.run(source, sink)
    }

    fn open_ledger(&self) -> Result<Option<Ledger>> {
        let Some(path) = &self.ledger_path else {
            return Ok(None);
        };
        let ledger = match Ledger::load(path).map_err(|e| EnrichError::Other(e).at(Stage::Load, None))? {
            Some(l) if l.window_size != self.config.window_size => {
                return Err(EnrichError::Config(format!(
                    "ledger {} was written with window_size {}, configured {}",
                    path.display(),
                    l.window_size,
                    self.config.window_size
                )));
            }
            Some(l) => {
                log::info!("resuming from ledger {} ({} window(s) done)", path.display(), l.windows.len());
                l
            }
            None => Ledger {
                window_size: self.config.window_size,
                windows: Vec::new(),
            },
        };
        Ok(Some(ledger))
    }

    fn run_window_with_retries<T: Trip>(
        &self,
        ctx: &ExecutionContext,
        source: &dyn TripSource<T>,
        sink: &dyn ResultSink<T>,
        window: KeyRange,
    ) -> Result<WindowReport> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.run_window(ctx, source, sink, window) {
                Ok(mut done) => {
                    done.attempts = attempts;
                    return Ok(done);
                }
                Err(e) if e.is_retryable() && attempts <= self.config.max_window_retries => {
                    log::warn!("window {window} failed (attempt {attempts}), retrying: {e}");
                }
                Err(e) => {
                    log::error!("window {window} failed after {attempts} attempt(s): {e}");
                    return Err(e);
                }
            }
        }
    }

    fn run_window<T: Trip>(
        &self,
        ctx: &ExecutionContext,
        source: &dyn TripSource<T>,
        sink: &dyn ResultSink<T>,
        window: KeyRange,
    ) -> Result<WindowReport> {
        log::debug!("window {window}: reading trips");
        let trips = source
            .read_range(window)
            .map_err(|e| e.at(Stage::Load, Some(window)))?;
        let n_trips = trips.len();
        let partitioner = Partitioner::range_uniform(window, ctx.partitions());
        let (rows, matches) = self.process_partitioned(ctx, trips, &partitioner, Some(window))?;
        let checksum = rows_checksum(&rows).map_err(|e| e.at(Stage::Write, Some(window)))?;

        let columns = self.output_columns();
        if !rows.is_empty() {
            let written = match self.config.write_strategy {
                WriteStrategy::Append => sink.append(window, &rows, &columns),
                WriteStrategy::Idempotent => sink.write_window(window, &rows, &columns),
            };
            written.map_err(|e| e.at(Stage::Write, Some(window)))?;
        }
        log::info!("window {window}: {n_trips} trips -> {} rows committed", rows.len());
        Ok(WindowReport {
            window,
            trips: n_trips,
            rows: rows.len(),
            attempts: 1,
            checksum,
            matches,
        })
    }
}
