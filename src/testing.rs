//! Helpers for exercising the orchestrator in tests.
//!
//! [`FlakySink`] wraps any [`ResultSink`] and fails a fixed number of commits
//! before delegating, which drives the window retry path without real IO
//! faults.
//!
//! ```
//! use geobeam::store::{MemorySink, ResultSink};
//! use geobeam::testing::FlakySink;
//! use geobeam::{KeyRange, MergedTripRecord, TaxiTrip};
//!
//! let sink = FlakySink::new(MemorySink::<TaxiTrip>::new(), 1);
//! let window = KeyRange::new(0, 10);
//! let rows: Vec<MergedTripRecord<TaxiTrip>> = Vec::new();
//! assert!(sink.write_window(window, &rows, &[]).is_err());
//! assert!(sink.write_window(window, &rows, &[]).is_ok());
//! assert_eq!(sink.failures_left(), 0);
//! ```

use crate::error::{EnrichError, Result};
use crate::records::{ColumnSpec, MergedTripRecord};
use crate::store::ResultSink;
use crate::window::KeyRange;
use std::sync::{Mutex, PoisonError};

/// Sink that fails its first `failures` commits with a retryable
/// [`EnrichError::WindowAppend`].
pub struct FlakySink<S> {
    inner: S,
    failures: Mutex<u32>,
}

impl<S> FlakySink<S> {
    pub fn new(inner: S, failures: u32) -> Self {
        Self {
            inner,
            failures: Mutex::new(failures),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Commits that will still be rejected.
    pub fn failures_left(&self) -> u32 {
        *self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn trip(&self, window: KeyRange) -> Result<()> {
        let mut left = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        if *left > 0 {
            *left -= 1;
            return Err(EnrichError::WindowAppend {
                window,
                source: anyhow::anyhow!("injected write failure"),
            });
        }
        Ok(())
    }
}

impl<T, S: ResultSink<T>> ResultSink<T> for FlakySink<S> {
    fn append(&self, window: KeyRange, rows: &[MergedTripRecord<T>], columns: &[ColumnSpec]) -> Result<()> {
        self.trip(window)?;
        self.inner.append(window, rows, columns)
    }

    fn write_window(&self, window: KeyRange, rows: &[MergedTripRecord<T>], columns: &[ColumnSpec]) -> Result<()> {
        self.trip(window)?;
        self.inner.write_window(window, rows, columns)
    }

    fn clear(&self) -> Result<()> {
        self.inner.clear()
    }
}
