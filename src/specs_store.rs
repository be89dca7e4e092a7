//! A thread-safe in-memory storage for the currently active specs. [`SpecsStore`] provides
//! concurrent access for readers (evaluations) and writers (the background sync thread).
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::specs::Specs;

/// Where the active specs came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SpecsSource {
    /// Nothing has been stored yet.
    Uninitialized,
    /// Fetched from the specs endpoint.
    Network,
}

/// An immutable specs snapshot together with its provenance.
#[derive(Debug)]
pub struct SpecsSnapshot {
    pub specs: Specs,
    pub source: SpecsSource,
    /// Timestamp when specs were received by this process.
    pub received_at: DateTime<Utc>,
}

impl SpecsSnapshot {
    pub fn from_network(specs: Specs) -> SpecsSnapshot {
        SpecsSnapshot {
            specs,
            source: SpecsSource::Network,
            received_at: Utc::now(),
        }
    }
}

/// `SpecsStore` provides a thread-safe (`Sync`) storage for specs that allows concurrent
/// access for readers and writers.
///
/// A snapshot is never modified in place; it can only be replaced completely, so a reader
/// that holds an `Arc<SpecsSnapshot>` sees one consistent ruleset for the whole operation.
#[derive(Default)]
pub struct SpecsStore {
    snapshot: RwLock<Option<Arc<SpecsSnapshot>>>,
}

impl SpecsStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        SpecsStore::default()
    }

    /// Get the currently active snapshot. Returns `None` if specs haven't been fetched yet.
    pub fn get_snapshot(&self) -> Option<Arc<SpecsSnapshot>> {
        // The lock only guards an `Option<Arc>` swap, so poisoning cannot leave it half-written.
        let snapshot = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);
        snapshot.clone()
    }

    /// Set a new snapshot.
    pub fn set_snapshot(&self, snapshot: Arc<SpecsSnapshot>) {
        let mut slot = self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = Some(snapshot);
    }
}
