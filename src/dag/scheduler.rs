// src/dag/scheduler.rs

use tracing::{debug, trace, warn};

use crate::dag::aggregate::{AggregateResult, collect_wave};
use crate::dag::graph::DependencyGraph;
use crate::dag::node::{NodeState, SchedulerNode};
use crate::dag::queue::ReadyQueue;
use crate::errors::OrchestratorError;
use crate::types::{Parallelism, UnitId};
use crate::unit::BuildStats;

/// What the scheduler made of a unit's completion report.
#[derive(Debug)]
pub enum DoneOutcome {
    /// The report was recorded.
    Accepted,
    /// The group had already failed; the report was dropped.
    Ignored,
    /// First failure of the group. The caller must abort and deliver it.
    HardFailure(OrchestratorError),
}

/// Per-invocation scheduling state for a group of units.
///
/// The scheduler is a pure state machine. It never calls into units or
/// controllers: the engine asks it which node may start next
/// ([`Scheduler::next_startable`]), dispatches that node itself, and reports
/// back through [`Scheduler::mark_running`] and [`Scheduler::node_done`].
#[derive(Debug)]
pub struct Scheduler {
    nodes: Vec<SchedulerNode>,
    queue: ReadyQueue,
    /// Nodes counted against the parallelism budget.
    running: usize,
    limit: usize,
    errored: bool,
}

impl Scheduler {
    /// Fresh state for one `run`/`watch`: roots start `Queued`, everything
    /// else `Blocked`.
    pub fn new(graph: &DependencyGraph, parallelism: Parallelism) -> Self {
        let mut nodes: Vec<SchedulerNode> = graph
            .units()
            .map(|id| {
                let mut node = SchedulerNode::new(id, graph.label(id));
                node.parents = graph.parents_of(id).to_vec();
                node.children = graph.children_of(id).to_vec();
                node
            })
            .collect();

        let mut queue = ReadyQueue::new();
        for node in nodes.iter_mut() {
            if node.parents.is_empty() {
                node.state = NodeState::Queued;
                queue.enqueue(node.id);
            }
        }

        debug!(
            units = nodes.len(),
            roots = queue.len(),
            limit = parallelism.limit(),
            "scheduler: initialised"
        );

        Self {
            nodes,
            queue,
            running: 0,
            limit: parallelism.limit(),
            errored: false,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn state_of(&self, unit: UnitId) -> Option<NodeState> {
        self.nodes.get(unit.index()).map(|n| n.state)
    }

    pub fn label(&self, unit: UnitId) -> &str {
        self.nodes
            .get(unit.index())
            .map(|n| n.label.as_str())
            .unwrap_or("<unknown>")
    }

    pub fn running(&self) -> usize {
        self.running
    }

    pub fn is_errored(&self) -> bool {
        self.errored
    }

    /// Pop the ready queue until a node may start, and promote it to
    /// `Starting`.
    ///
    /// Returns `None` once the parallelism budget is used up, the queue is
    /// drained, or the group has failed. Stale queue entries (nodes whose
    /// state changed since they were enqueued) are discarded.
    pub fn next_startable(&mut self) -> Option<UnitId> {
        while self.running < self.limit && !self.errored {
            let id = self.queue.dequeue()?;
            let startable = match self.nodes[id.index()].state {
                NodeState::Queued => true,
                NodeState::Blocked => self.parents_done(id),
                _ => false,
            };
            if startable {
                self.running += 1;
                self.nodes[id.index()].state = NodeState::Starting;
                trace!(unit = %self.label(id), running = self.running, "scheduler: starting");
                return Some(id);
            }
        }
        None
    }

    /// The engine has handed the node to its unit.
    pub fn mark_running(&mut self, unit: UnitId) {
        if let Some(node) = self.nodes.get_mut(unit.index()) {
            if node.state == NodeState::Starting {
                node.state = NodeState::Running;
            }
        }
    }

    /// Record the outcome of a unit's build.
    pub fn node_done(
        &mut self,
        unit: UnitId,
        result: Result<BuildStats, OrchestratorError>,
    ) -> DoneOutcome {
        if self.errored {
            debug!(unit = %self.label(unit), "scheduler: group already failed; ignoring result");
            return DoneOutcome::Ignored;
        }

        let stats = match result {
            Ok(stats) => stats,
            Err(err) => {
                warn!(unit = %self.label(unit), error = %err, "scheduler: unit failed; aborting group");
                self.errored = true;
                self.queue.clear();
                return DoneOutcome::HardFailure(err);
            }
        };

        let Some(node) = self.nodes.get_mut(unit.index()) else {
            warn!(unit = %unit, "scheduler: result for unknown unit; ignoring");
            return DoneOutcome::Ignored;
        };

        node.result = Some(stats);
        self.running = self.running.saturating_sub(1);

        match node.state {
            NodeState::Running => {
                node.state = NodeState::Done;
                let children = node.children.clone();
                for child in children {
                    if self.nodes[child.index()].state == NodeState::Blocked {
                        self.queue.enqueue(child);
                    }
                }
            }
            NodeState::RunningOutdated => {
                node.state = NodeState::Blocked;
                self.queue.enqueue(unit);
            }
            other => {
                trace!(unit = %self.label(unit), state = ?other, "scheduler: result outside a scheduled build");
            }
        }

        debug!(unit = %self.label(unit), running = self.running, "scheduler: unit done");
        DoneOutcome::Accepted
    }

    /// The unit's own inputs changed.
    pub fn node_invalid(&mut self, unit: UnitId) {
        let Some(node) = self.nodes.get_mut(unit.index()) else {
            return;
        };
        match node.state {
            NodeState::Done => node.state = NodeState::Pending,
            NodeState::Running => node.state = NodeState::RunningOutdated,
            _ => {}
        }
        let children = node.children.clone();
        self.invalidate_descendants(children);
    }

    /// Aggregated change: invalidate, then put the node back in line.
    pub fn node_change(&mut self, unit: UnitId) {
        self.node_invalid(unit);
        let Some(node) = self.nodes.get_mut(unit.index()) else {
            return;
        };
        if node.state == NodeState::Pending {
            node.state = NodeState::Blocked;
        }
        if node.state == NodeState::Blocked {
            self.queue.enqueue(unit);
        }
    }

    /// Whether a unit's controller must not start a build on its own.
    pub fn is_blocked(&self, unit: UnitId) -> bool {
        self.nodes
            .get(unit.index())
            .map(|n| !n.state.is_active())
            .unwrap_or(true)
    }

    /// Drain a completed wave.
    ///
    /// Yields only when nothing is running, every node is `Done` and at least
    /// one node holds a result not handed out yet.
    pub fn take_wave(&mut self) -> Option<AggregateResult> {
        if self.errored || self.running != 0 {
            return None;
        }
        if !self.nodes.iter().all(|n| n.state == NodeState::Done) {
            return None;
        }
        collect_wave(&mut self.nodes)
    }

    fn parents_done(&self, unit: UnitId) -> bool {
        self.nodes[unit.index()]
            .parents
            .iter()
            .all(|p| self.nodes[p.index()].state == NodeState::Done)
    }

    /// Parent invalidation over the whole subtree. Iterative, and each node
    /// is visited once even in diamond-shaped graphs.
    fn invalidate_descendants(&mut self, start: Vec<UnitId>) {
        let mut visited = vec![false; self.nodes.len()];
        let mut stack = start;
        while let Some(id) = stack.pop() {
            if std::mem::replace(&mut visited[id.index()], true) {
                continue;
            }
            let node = &mut self.nodes[id.index()];
            match node.state {
                NodeState::Done => node.state = NodeState::Blocked,
                NodeState::Running => node.state = NodeState::RunningOutdated,
                _ => {}
            }
            stack.extend(node.children.iter().copied());
        }
    }
}
