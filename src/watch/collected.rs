// src/watch/collected.rs

use std::path::{Path, PathBuf};

use crate::types::PathSet;

/// Changed and removed paths accumulated between two builds.
///
/// The most recent report for a path wins: a path is never in both sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    changed: PathSet,
    removed: PathSet,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_sets(changed: PathSet, removed: PathSet) -> Self {
        let mut set = Self::new();
        set.merge(&changed, &removed);
        set
    }

    pub fn changed(&self) -> &PathSet {
        &self.changed
    }

    pub fn removed(&self) -> &PathSet {
        &self.removed
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }

    pub fn record_change(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        self.removed.remove(&path);
        self.changed.insert(path);
    }

    pub fn record_removal(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        self.changed.remove(&path);
        self.removed.insert(path);
    }

    /// Fold in one delivery. Changes are applied before removals.
    pub fn merge(&mut self, changed: &PathSet, removed: &PathSet) {
        for path in changed {
            self.record_change(path.clone());
        }
        for path in removed {
            self.record_removal(path.clone());
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.changed.contains(path) || self.removed.contains(path)
    }

    pub fn into_sets(self) -> (PathSet, PathSet) {
        (self.changed, self.removed)
    }
}
