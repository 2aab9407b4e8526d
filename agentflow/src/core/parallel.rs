//! Concurrency-safe aggregation of parallel branch results.

use super::StepResult;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;

/// Branch results keyed by branch name.
///
/// Each name is registered at most once: the first writer wins and later
/// registrations are silent no-ops. Clones share the same underlying map.
#[derive(Clone, Default)]
pub struct ParallelResult {
    branches: Arc<DashMap<String, Arc<StepResult>>>,
}

impl ParallelResult {
    /// Creates an empty parallel result.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a branch result. Returns false if the name was taken.
    pub fn register(&self, name: impl Into<String>, result: StepResult) -> bool {
        match self.branches.entry(name.into()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(result));
                true
            }
        }
    }

    /// Looks up a branch result by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<StepResult>> {
        self.branches.get(name).map(|r| Arc::clone(r.value()))
    }

    /// Branch names in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.branches.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of registered branches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.branches.len()
    }

    /// Returns true if nothing has been registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Names of branches whose terminal result is failed, sorted.
    #[must_use]
    pub fn failed_branches(&self) -> Vec<String> {
        let mut failed: Vec<String> = self
            .branches
            .iter()
            .filter(|e| e.value().has_error())
            .map(|e| e.key().clone())
            .collect();
        failed.sort();
        failed
    }

    /// Returns true if any branch failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.branches.iter().any(|e| e.value().has_error())
    }

    /// Renders every branch as JSON keyed by name.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .branches
            .iter()
            .map(|e| (e.key().clone(), e.value().to_json()))
            .collect();
        serde_json::Value::Object(map)
    }
}

impl fmt::Debug for ParallelResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelResult")
            .field("branches", &self.names())
            .finish()
    }
}
