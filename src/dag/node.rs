// src/dag/node.rs

//! Scheduler node bookkeeping.

use crate::types::UnitId;
use crate::unit::BuildStats;

/// Lifecycle state of a node inside one `run`/`watch` invocation.
///
/// Transitions:
/// - `Blocked` (initial) -> `Starting` when every parent is `Done`
/// - `Queued` (initial, no parents) -> `Starting` when dequeued
/// - `Starting` -> `Running` once the unit has been dispatched
/// - `Running` -> `Done` when the build completes
/// - `Done` -> `Pending` when the unit's own files changed
/// - `Pending` -> `Blocked` (re-enqueued) once the change is aggregated
/// - `Done` -> `Blocked` when a parent was invalidated
/// - `Running` -> `RunningOutdated` when invalidated mid-build
/// - `RunningOutdated` -> `Blocked` (re-enqueued) when that build completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Blocked,
    Queued,
    Starting,
    Running,
    RunningOutdated,
    Done,
    Pending,
}

impl NodeState {
    /// Whether a build is currently counted against the parallelism budget.
    pub fn is_active(self) -> bool {
        matches!(self, NodeState::Starting | NodeState::Running)
    }
}

/// One build unit wrapped with scheduling bookkeeping.
#[derive(Debug, Clone)]
pub struct SchedulerNode {
    pub id: UnitId,
    pub label: String,
    /// Units that must be `Done` before this one may start.
    pub parents: Vec<UnitId>,
    /// Units that depend on this one.
    pub children: Vec<UnitId>,
    pub state: NodeState,
    /// Latest result not yet handed out in an aggregate.
    pub result: Option<BuildStats>,
}

impl SchedulerNode {
    pub fn new(id: UnitId, label: impl Into<String>) -> Self {
        Self {
            id,
            label: label.into(),
            parents: Vec::new(),
            children: Vec::new(),
            state: NodeState::Blocked,
            result: None,
        }
    }
}
