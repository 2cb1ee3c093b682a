// src/dag/hooks.rs

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::dag::scheduler::Scheduler;
use crate::types::UnitId;

/// Scheduler shared between the runtime actor and every controller's hooks.
pub type SharedScheduler = Arc<Mutex<Scheduler>>;

/// Lock the scheduler, recovering the guard if a previous holder panicked.
pub fn lock(scheduler: &SharedScheduler) -> MutexGuard<'_, Scheduler> {
    scheduler.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Questions and notifications a watch controller routes to whoever
/// schedules it.
pub trait NodeHooks: Send {
    /// Whether the controller must hold off starting a build.
    fn is_blocked(&self) -> bool;

    /// The unit's watched files changed (aggregated).
    fn on_change(&self);

    /// The unit's watched files changed (first raw event of a window).
    fn on_invalid(&self);
}

/// Hooks for a controller driven on its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl NodeHooks for NoopHooks {
    fn is_blocked(&self) -> bool {
        false
    }

    fn on_change(&self) {}

    fn on_invalid(&self) {}
}

/// Hooks binding one controller to its node in the group scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerLink {
    node: UnitId,
    scheduler: SharedScheduler,
}

impl SchedulerLink {
    pub fn new(node: UnitId, scheduler: SharedScheduler) -> Self {
        Self { node, scheduler }
    }
}

impl NodeHooks for SchedulerLink {
    fn is_blocked(&self) -> bool {
        lock(&self.scheduler).is_blocked(self.node)
    }

    fn on_change(&self) {
        lock(&self.scheduler).node_change(self.node);
    }

    fn on_invalid(&self) {
        lock(&self.scheduler).node_invalid(self.node);
    }
}
