// src/dag/aggregate.rs

//! Combining per-unit results into one group result.

use crate::dag::node::SchedulerNode;
use crate::types::UnitId;
use crate::unit::BuildStats;

/// Results of every unit that finished within one wave, in construction order.
#[derive(Debug, Clone, Default)]
pub struct AggregateResult {
    stats: Vec<BuildStats>,
}

impl AggregateResult {
    pub fn new(stats: Vec<BuildStats>) -> Self {
        Self { stats }
    }

    pub fn stats(&self) -> &[BuildStats] {
        &self.stats
    }

    pub fn iter(&self) -> impl Iterator<Item = &BuildStats> {
        self.stats.iter()
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    /// Labels of the units in this wave, in order.
    pub fn labels(&self) -> Vec<String> {
        self.stats.iter().map(BuildStats::label).collect()
    }

    pub fn has_errors(&self) -> bool {
        self.stats.iter().any(BuildStats::has_errors)
    }

    pub fn has_warnings(&self) -> bool {
        self.stats.iter().any(BuildStats::has_warnings)
    }

    /// Content hashes joined in unit order; `None` if no unit reported one.
    pub fn hash(&self) -> Option<String> {
        let parts: Vec<&str> = self.stats.iter().filter_map(BuildStats::hash).collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(""))
        }
    }
}

impl IntoIterator for AggregateResult {
    type Item = BuildStats;
    type IntoIter = std::vec::IntoIter<BuildStats>;

    fn into_iter(self) -> Self::IntoIter {
        self.stats.into_iter()
    }
}

/// Drain every stored result in node order.
///
/// Returns `None` when no node holds a result that has not been handed out.
pub fn collect_wave(nodes: &mut [SchedulerNode]) -> Option<AggregateResult> {
    let stats: Vec<BuildStats> = nodes.iter_mut().filter_map(|n| n.result.take()).collect();
    if stats.is_empty() {
        None
    } else {
        Some(AggregateResult::new(stats))
    }
}

/// Tracks which units currently have an up-to-date result.
///
/// Feeds the group-level "all done" event: whenever the last outstanding
/// unit reports, the latest stats of every unit are returned. A unit drops
/// out again as soon as it is invalidated.
#[derive(Debug)]
pub struct CompletionTracker {
    latest: Vec<Option<BuildStats>>,
    done: Vec<bool>,
    remaining: usize,
}

impl CompletionTracker {
    pub fn new(units: usize) -> Self {
        Self {
            latest: vec![None; units],
            done: vec![false; units],
            remaining: units,
        }
    }

    pub fn invalid(&mut self, unit: UnitId) {
        if let Some(done) = self.done.get_mut(unit.index()) {
            if *done {
                *done = false;
                self.remaining += 1;
            }
        }
    }

    pub fn done(&mut self, stats: BuildStats) -> Option<AggregateResult> {
        let index = stats.unit.index();
        let done = self.done.get_mut(index)?;
        if !*done {
            *done = true;
            self.remaining -= 1;
        }
        self.latest[index] = Some(stats);

        if self.remaining == 0 {
            Some(AggregateResult::new(
                self.latest.iter().flatten().cloned().collect(),
            ))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::unit::BuildOutput;

    fn stats(i: usize) -> BuildStats {
        let now = SystemTime::now();
        BuildStats::new(
            UnitId(i),
            Some(format!("u{i}")),
            now,
            now,
            BuildOutput::default(),
        )
    }

    #[test]
    fn wave_drains_only_new_results_in_node_order() {
        let mut nodes: Vec<SchedulerNode> = (0..3)
            .map(|i| SchedulerNode::new(UnitId(i), format!("u{i}")))
            .collect();
        nodes[2].result = Some(stats(2));
        nodes[0].result = Some(stats(0));

        let wave = collect_wave(&mut nodes).unwrap();
        assert_eq!(wave.labels(), vec!["u0", "u2"]);
        assert!(nodes.iter().all(|n| n.result.is_none()));

        assert!(collect_wave(&mut nodes).is_none());
    }

    #[test]
    fn tracker_fires_once_all_units_are_current() {
        let mut tracker = CompletionTracker::new(2);
        assert!(tracker.done(stats(0)).is_none());
        let all = tracker.done(stats(1)).unwrap();
        assert_eq!(all.len(), 2);

        tracker.invalid(UnitId(1));
        // Repeated reports from a still-current unit do not complete the group.
        assert!(tracker.done(stats(0)).is_none());
        let all = tracker.done(stats(1)).unwrap();
        assert_eq!(all.labels(), vec!["u0", "u1"]);
    }
}
