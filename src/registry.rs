//! Concurrent per-function stats registry
//!
//! The hook records samples from whatever thread runs a watched function,
//! while the control side takes snapshots. Every record is updated under its
//! shard lock, so a snapshot never contains a record whose `total_time` has
//! moved without its `call_count`. No ordering holds across records.

use crate::identity::FunctionId;
use crate::stats::FunctionStats;
use dashmap::DashMap;
use std::collections::BTreeMap;

/// Point-in-time copy of the registry, sorted by name
pub type StatsMap = BTreeMap<FunctionId, FunctionStats>;

/// Tracks function-level timing statistics
#[derive(Debug, Default)]
pub struct StatsRegistry {
    /// Map from function identity to its aggregates
    stats: DashMap<FunctionId, FunctionStats>,
}

impl StatsRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed call
    ///
    /// Identities that were never pre-registered get a fresh record.
    pub fn record(&self, function: &FunctionId, elapsed_secs: f64) {
        if let Some(mut entry) = self.stats.get_mut(function) {
            entry.record(elapsed_secs);
            return;
        }
        self.stats
            .entry(function.clone())
            .or_default()
            .record(elapsed_secs);
    }

    /// Consistent-per-record copy of all aggregates
    pub fn snapshot(&self) -> StatsMap {
        self.stats
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Aggregates for one function
    pub fn get(&self, function: &str) -> Option<FunctionStats> {
        self.stats.get(function).map(|entry| *entry)
    }

    /// Zero the records for the given identities (creating them if absent)
    pub fn reset<'a>(&self, functions: impl IntoIterator<Item = &'a FunctionId>) {
        for function in functions {
            self.stats.insert(function.clone(), FunctionStats::new());
        }
    }

    /// Insert zeroed records only for identities not seen before
    ///
    /// Returns how many records were created.
    pub fn ensure<'a>(&self, functions: impl IntoIterator<Item = &'a FunctionId>) -> usize {
        let mut created = 0;
        for function in functions {
            if !self.stats.contains_key(function) {
                self.stats.entry(function.clone()).or_insert_with(|| {
                    created += 1;
                    FunctionStats::new()
                });
            }
        }
        created
    }

    /// Remove every record
    pub fn clear(&self) {
        self.stats.clear();
    }

    /// Number of tracked functions
    pub fn len(&self) -> usize {
        self.stats.len()
    }

    /// True if nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}
