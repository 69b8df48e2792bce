//! Tracked-variable history.
//!
//! Simple bookkeeping: after each iteration the scheduler samples every
//! tracked accessor and appends `(iteration, value)` to its series. Series
//! are emptied whenever the experiment is reinitialized.

use super::accessors::{AccessorKey, Accessors};
use super::value::Value;
use std::collections::{BTreeMap, VecDeque};

/// One recorded value.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Iteration count when the sample was taken.
    pub iteration: u64,
    /// The value read.
    pub value: Value,
}

/// Per-variable histories.
#[derive(Debug, Clone, Default)]
pub struct Tracker {
    series: BTreeMap<AccessorKey, VecDeque<Sample>>,
    /// Oldest samples are dropped past this length.
    limit: Option<usize>,
}

impl Tracker {
    /// Create a tracker; `limit` caps each series length.
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            series: BTreeMap::new(),
            limit,
        }
    }

    /// Start tracking a variable. Returns `false` if already tracked.
    pub fn track(&mut self, key: AccessorKey) -> bool {
        if self.series.contains_key(&key) {
            return false;
        }
        self.series.insert(key, VecDeque::new());
        true
    }

    /// Stop tracking and drop the history. Returns `false` if not tracked.
    pub fn untrack(&mut self, key: &AccessorKey) -> bool {
        self.series.remove(key).is_some()
    }

    /// Whether `key` is tracked.
    pub fn is_tracked(&self, key: &AccessorKey) -> bool {
        self.series.contains_key(key)
    }

    /// History of one variable, oldest first.
    pub fn history(&self, target: &str, attribute: &str) -> Option<&VecDeque<Sample>> {
        self.series.get(&AccessorKey::new(target, attribute))
    }

    /// Tracked keys, sorted.
    pub fn keys(&self) -> impl Iterator<Item = &AccessorKey> {
        self.series.keys()
    }

    /// Number of tracked variables.
    pub fn len(&self) -> usize {
        self.series.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Empty every series, keeping the tracked set.
    pub fn clear(&mut self) {
        for samples in self.series.values_mut() {
            samples.clear();
        }
    }

    /// Sample one variable.
    pub fn record_one<E>(&mut self, key: &AccessorKey, iteration: u64, accessors: &Accessors<E>, experiment: &E) {
        let Some(value) = accessors.get_key(experiment, key) else {
            return;
        };
        if let Some(samples) = self.series.get_mut(key) {
            samples.push_back(Sample { iteration, value });
            if let Some(limit) = self.limit {
                while samples.len() > limit {
                    samples.pop_front();
                }
            }
        }
    }

    /// Sample every tracked variable.
    pub fn record<E>(&mut self, iteration: u64, accessors: &Accessors<E>, experiment: &E) {
        if self.series.is_empty() {
            return;
        }
        let keys: Vec<AccessorKey> = self.series.keys().cloned().collect();
        for key in &keys {
            self.record_one(key, iteration, accessors, experiment);
        }
    }
}
