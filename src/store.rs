//! Snapshot store and the orchestrator's IO seams.
//!
//! [`TripSource`] and [`ResultSink`] are what the orchestrator reads windows
//! from and commits them to. [`VecSource`] / [`MemorySink`] keep everything in
//! memory; [`SnapshotStore`] is a directory of Parquet part files.
//!
//! Commit semantics, shared by every sink:
//!
//! * [`ResultSink::append`] always adds a new part. Appending the same window
//!   twice stores its rows twice.
//! * [`ResultSink::write_window`] owns one part per window and replaces it on
//!   every call, so retrying a window never duplicates rows.
//! * [`ResultSink::clear`] drops everything (the `overwrite` mode).

use crate::error::Result;
use crate::records::{ColumnSpec, MergedTripRecord, Trip};
use crate::window::KeyRange;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Reads trips by key range.
pub trait TripSource<T>: Send + Sync {
    /// Smallest range covering every stored trip id, `None` when empty.
    fn key_range(&self) -> Result<Option<KeyRange>>;

    /// Trips whose id lies in `range`.
    fn read_range(&self, range: KeyRange) -> Result<Vec<T>>;
}

/// Receives merged rows, one window at a time.
pub trait ResultSink<T>: Send + Sync {
    /// Add `rows` as a new part.
    fn append(&self, window: KeyRange, rows: &[MergedTripRecord<T>], columns: &[ColumnSpec]) -> Result<()>;

    /// Replace the part owned by `window` with `rows`.
    fn write_window(&self, window: KeyRange, rows: &[MergedTripRecord<T>], columns: &[ColumnSpec]) -> Result<()>;

    /// Drop every stored row.
    fn clear(&self) -> Result<()>;
}

/// In-memory trip source.
pub struct VecSource<T> {
    trips: Vec<T>,
}

impl<T: Trip> VecSource<T> {
    pub fn new(trips: Vec<T>) -> Self {
        Self { trips }
    }
}

impl<T: Trip> TripSource<T> for VecSource<T> {
    fn key_range(&self) -> Result<Option<KeyRange>> {
        Ok(KeyRange::covering(self.trips.iter().map(Trip::trip_id)))
    }

    fn read_range(&self, range: KeyRange) -> Result<Vec<T>> {
        Ok(self
            .trips
            .iter()
            .filter(|t| range.contains(t.trip_id()))
            .cloned()
            .collect())
    }
}

type Part<T> = (Option<KeyRange>, Vec<MergedTripRecord<T>>);

/// In-memory result sink.
pub struct MemorySink<T> {
    parts: Mutex<Vec<Part<T>>>,
}

impl<T> Default for MemorySink<T> {
    fn default() -> Self {
        Self {
            parts: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Trip> MemorySink<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Part<T>>> {
        self.parts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every stored row, part by part.
    pub fn rows(&self) -> Vec<MergedTripRecord<T>> {
        self.lock().iter().flat_map(|(_, rows)| rows.iter().cloned()).collect()
    }

    pub fn num_parts(&self) -> usize {
        self.lock().len()
    }
}

impl<T: Trip> ResultSink<T> for MemorySink<T> {
    fn append(&self, _window: KeyRange, rows: &[MergedTripRecord<T>], _columns: &[ColumnSpec]) -> Result<()> {
        self.lock().push((None, rows.to_vec()));
        Ok(())
    }

    fn write_window(&self, window: KeyRange, rows: &[MergedTripRecord<T>], _columns: &[ColumnSpec]) -> Result<()> {
        let mut parts = self.lock();
        parts.retain(|(w, _)| *w != Some(window));
        parts.push((Some(window), rows.to_vec()));
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.lock().clear();
        Ok(())
    }
}

/// How a plain write treats existing parts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    /// Replace the whole snapshot.
    Overwrite,
    /// Add a new part next to the existing ones.
    Append,
}

#[cfg(feature = "io-parquet")]
pub use parquet_store::SnapshotStore;

#[cfg(feature = "io-parquet")]
mod parquet_store {
    use super::{ResultSink, TripSource, WriteMode};
    use crate::error::{EnrichError, Result};
    use crate::merge::merged_record_batch;
    use crate::records::{ColumnSpec, MergedTripRecord, Trip};
    use crate::window::{KeyRange, TripId};
    use anyhow::Context;
    use arrow::datatypes::FieldRef;
    use arrow::record_batch::RecordBatch;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use parquet::arrow::arrow_writer::ArrowWriter;
    use parquet::file::properties::WriterProperties;
    use parquet::file::reader::{FileReader, SerializedFileReader};
    use parquet::file::statistics::Statistics;
    use serde::Serialize;
    use serde::de::DeserializeOwned;
    use serde_arrow::schema::{SchemaLike, TracingOptions};
    use serde_arrow::{from_record_batch, to_record_batch};
    use std::fs::{self, File};
    use std::path::{Path, PathBuf};

    const WINDOW_PREFIX: &str = "window-";
    const PART_PREFIX: &str = "part-";

    /// A snapshot: a directory of Parquet part files sharing one schema.
    ///
    /// Typed rows go through `serde_arrow`; merged trips are written from the
    /// batches built by [`merged_record_batch`]. Range reads prune row groups
    /// with their min/max statistics on the key column before decoding.
    #[derive(Clone, Debug)]
    pub struct SnapshotStore {
        dir: PathBuf,
        key_column: String,
        row_group_size: usize,
    }

    impl SnapshotStore {
        /// Open (creating if needed) a snapshot directory keyed by `trip_id`.
        pub fn open(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
            let dir = dir.as_ref().to_path_buf();
            fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
            Ok(Self {
                dir,
                key_column: "trip_id".to_string(),
                row_group_size: 64 * 1024,
            })
        }

        /// Use another integer column as the range-read key.
        #[must_use]
        pub fn with_key_column(mut self, column: &str) -> Self {
            self.key_column = column.to_string();
            self
        }

        /// Rows per Parquet row group; smaller groups prune more finely.
        #[must_use]
        pub fn with_row_group_size(mut self, rows: usize) -> Self {
            self.row_group_size = rows.max(1);
            self
        }

        pub fn dir(&self) -> &Path {
            &self.dir
        }

        /// Part files in name order.
        pub fn part_files(&self) -> anyhow::Result<Vec<PathBuf>> {
            let pattern = self.dir.join("*.parquet");
            let pattern = pattern.to_string_lossy();
            let mut files = Vec::new();
            for entry in glob::glob(&pattern).with_context(|| format!("invalid glob pattern: {pattern}"))? {
                files.push(entry.with_context(|| format!("error reading glob entry for pattern: {pattern}"))?);
            }
            files.sort();
            Ok(files)
        }

        /// Write typed rows as one part.
        pub fn write_rows<T>(&self, rows: &[T], mode: WriteMode) -> anyhow::Result<PathBuf>
        where
            T: Serialize + DeserializeOwned,
        {
            let fields: Vec<FieldRef> =
                Vec::<FieldRef>::from_type::<T>(TracingOptions::default()).context("infer Arrow schema from type T")?;
            let batch = to_record_batch(&fields, &rows).context("convert rows to RecordBatch")?;
            self.write_batch(&batch, mode)
        }

        /// Write a batch as one part.
        pub fn write_batch(&self, batch: &RecordBatch, mode: WriteMode) -> anyhow::Result<PathBuf> {
            if mode == WriteMode::Overwrite {
                self.remove_parts()?;
            }
            let name = format!("{PART_PREFIX}{:06}.parquet", self.next_part_index()?);
            self.commit(&name, batch)
        }

        /// Write (or replace) the part owned by `window`.
        pub fn write_window_part(&self, window: KeyRange, batch: &RecordBatch) -> anyhow::Result<PathBuf> {
            self.commit(&window_part_name(window), batch)
        }

        /// Write to a temporary file and rename it into place, so a part is
        /// either absent or complete.
        fn commit(&self, name: &str, batch: &RecordBatch) -> anyhow::Result<PathBuf> {
            let path = self.dir.join(name);
            let tmp = self.dir.join(format!(".{name}.tmp"));
            let file = File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
            let props = WriterProperties::builder()
                .set_max_row_group_row_count(Some(self.row_group_size))
                .build();
            let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props)).context("create ArrowWriter")?;
            writer.write(batch).context("write batch to parquet")?;
            writer.close().context("close ArrowWriter")?;
            fs::rename(&tmp, &path).with_context(|| format!("rename {} into place", tmp.display()))?;
            log::debug!("committed {} ({} rows)", path.display(), batch.num_rows());
            Ok(path)
        }

        fn next_part_index(&self) -> anyhow::Result<usize> {
            let mut next = 0;
            for path in self.part_files()? {
                let idx = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.strip_prefix(PART_PREFIX))
                    .and_then(|s| s.parse::<usize>().ok());
                if let Some(i) = idx {
                    next = next.max(i + 1);
                }
            }
            Ok(next)
        }

        fn remove_parts(&self) -> anyhow::Result<()> {
            for path in self.part_files()? {
                fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
            }
            Ok(())
        }

        /// Every row of every part.
        pub fn read_all<T: DeserializeOwned>(&self) -> anyhow::Result<Vec<T>> {
            let mut out = Vec::new();
            for path in self.part_files()? {
                out.append(&mut read_groups(&path, None)?);
            }
            Ok(out)
        }

        /// Rows whose key lies in `range`. Row groups whose statistics fall
        /// outside the range are never decoded; `key` extracts the key from a
        /// decoded row for the final filter.
        pub fn read_range<T, F>(&self, range: KeyRange, key: F) -> anyhow::Result<Vec<T>>
        where
            T: DeserializeOwned,
            F: Fn(&T) -> TripId,
        {
            let mut out = Vec::new();
            for path in self.part_files()? {
                let groups: Vec<usize> = self
                    .group_stats(&path)?
                    .into_iter()
                    .enumerate()
                    .filter(|(_, stats)| stats.is_none_or(|(lo, hi)| lo < range.end && hi >= range.start))
                    .map(|(i, _)| i)
                    .collect();
                if groups.is_empty() {
                    continue;
                }
                let rows: Vec<T> = read_groups(&path, Some(groups))?;
                out.extend(rows.into_iter().filter(|r| range.contains(key(r))));
            }
            Ok(out)
        }

        /// Range covering every key in the snapshot, from statistics alone.
        pub fn stored_key_range(&self) -> anyhow::Result<Option<KeyRange>> {
            let mut bounds: Option<(TripId, TripId)> = None;
            for path in self.part_files()? {
                for (lo, hi) in self.group_stats(&path)?.into_iter().flatten() {
                    bounds = Some(bounds.map_or((lo, hi), |(a, b)| (a.min(lo), b.max(hi))));
                }
            }
            Ok(bounds.map(|(lo, hi)| KeyRange::new(lo, hi.saturating_add(1))))
        }

        pub fn row_count(&self) -> anyhow::Result<u64> {
            let mut total = 0u64;
            for path in self.part_files()? {
                let reader = open_reader(&path)?;
                total += reader.metadata().file_metadata().num_rows().cast_unsigned();
            }
            Ok(total)
        }

        /// Min/max of the key column per row group; `None` when a group has
        /// no usable statistics.
        fn group_stats(&self, path: &Path) -> anyhow::Result<Vec<Option<(TripId, TripId)>>> {
            let reader = open_reader(path)?;
            let meta = reader.metadata();
            let Some(col) = meta
                .file_metadata()
                .schema_descr()
                .columns()
                .iter()
                .position(|c| c.name() == self.key_column)
            else {
                anyhow::bail!("{} has no `{}` column", path.display(), self.key_column);
            };
            Ok((0..meta.num_row_groups())
                .map(|i| match meta.row_group(i).column(col).statistics() {
                    Some(Statistics::Int64(s)) => Some((*s.min_opt()?, *s.max_opt()?)),
                    Some(Statistics::Int32(s)) => Some((i64::from(*s.min_opt()?), i64::from(*s.max_opt()?))),
                    _ => None,
                })
                .collect())
        }
    }

    fn window_part_name(window: KeyRange) -> String {
        format!("{WINDOW_PREFIX}{}-{}.parquet", window.start, window.end)
    }

    fn open_reader(path: &Path) -> anyhow::Result<SerializedFileReader<File>> {
        let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
        SerializedFileReader::new(f).context("open SerializedFileReader")
    }

    fn read_groups<T: DeserializeOwned>(path: &Path, groups: Option<Vec<usize>>) -> anyhow::Result<Vec<T>> {
        let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
        let mut builder = ParquetRecordBatchReaderBuilder::try_new(f).context("open ParquetRecordBatchReader")?;
        if let Some(groups) = groups {
            builder = builder.with_row_groups(groups);
        }
        let mut reader = builder
            .with_batch_size(64 * 1024)
            .build()
            .context("build ParquetRecordBatchReader")?;
        let mut out: Vec<T> = Vec::new();
        while let Some(batch) = reader.next().transpose().context("read next batch")? {
            let mut rows: Vec<T> = from_record_batch(&batch).context("deserialize RecordBatch rows to T")?;
            out.append(&mut rows);
        }
        Ok(out)
    }

    impl<T: Trip> TripSource<T> for SnapshotStore {
        fn key_range(&self) -> Result<Option<KeyRange>> {
            Ok(self.stored_key_range()?)
        }

        fn read_range(&self, range: KeyRange) -> Result<Vec<T>> {
            Ok(SnapshotStore::read_range(self, range, T::trip_id)?)
        }
    }

    impl<T: Trip> ResultSink<T> for SnapshotStore {
        fn append(&self, window: KeyRange, rows: &[MergedTripRecord<T>], columns: &[ColumnSpec]) -> Result<()> {
            merged_record_batch(rows, columns)
                .and_then(|batch| self.write_batch(&batch, WriteMode::Append))
                .map(drop)
                .map_err(|source| EnrichError::WindowAppend { window, source })
        }

        fn write_window(&self, window: KeyRange, rows: &[MergedTripRecord<T>], columns: &[ColumnSpec]) -> Result<()> {
            merged_record_batch(rows, columns)
                .and_then(|batch| self.write_window_part(window, &batch))
                .map(drop)
                .map_err(|source| EnrichError::WindowAppend { window, source })
        }

        fn clear(&self) -> Result<()> {
            Ok(self.remove_parts()?)
        }
    }
}
