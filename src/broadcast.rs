//! Broadcast of small reference data.
//!
//! A [`Broadcast<S>`] is an immutable value replicated to every worker. In
//! this in-process runtime replication is an `Arc` clone per partition task;
//! what matters is the contract: the value is read-only after construction,
//! so every partition may read it concurrently without locks.

use crate::dataset::{Dataset, Element};
use std::ops::Deref;
use std::sync::Arc;

/// Read-only value shared with every partition.
pub struct Broadcast<S: ?Sized> {
    label: Arc<str>,
    value: Arc<S>,
}

impl<S: ?Sized> Clone for Broadcast<S> {
    fn clone(&self) -> Self {
        Self {
            label: Arc::clone(&self.label),
            value: Arc::clone(&self.value),
        }
    }
}

impl<S> Broadcast<S> {
    pub fn new(label: &str, value: S) -> Self {
        Self::from_arc(label, Arc::new(value))
    }
}

impl<S: ?Sized> Broadcast<S> {
    pub fn from_arc(label: &str, value: Arc<S>) -> Self {
        log::debug!("broadcasting reference `{label}`");
        Self {
            label: label.into(),
            value,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn value(&self) -> &S {
        &self.value
    }

    pub fn as_arc(&self) -> &Arc<S> {
        &self.value
    }
}

impl<S: ?Sized> Deref for Broadcast<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.value
    }
}

impl<T: Element> Dataset<T> {
    /// Map with a read-only broadcast value (e.g. a polygon layer or lookup table).
    /// Partitioning is preserved, so `f` must not change row keys.
    pub fn map_with_broadcast<O, S, F>(&self, side: &Broadcast<S>, f: F) -> Dataset<O>
    where
        O: Element,
        S: Send + Sync + ?Sized,
        F: Fn(&T, &S) -> O + Send + Sync,
    {
        let label = format!("map_with_broadcast({})", side.label());
        let side = side.clone();
        self.map_same_key(move |t: &T| f(t, side.value()))
            .label(&label)
    }

    /// Filter using a broadcast value.
    #[must_use]
    pub fn filter_with_broadcast<S, F>(&self, side: &Broadcast<S>, pred: F) -> Dataset<T>
    where
        S: Send + Sync + ?Sized,
        F: Fn(&T, &S) -> bool + Send + Sync,
    {
        let side = side.clone();
        self.filter(move |t: &T| pred(t, side.value()))
    }
}
