// src/dag/mod.rs

//! Dependency resolution and scheduling.
//!
//! - [`graph`] validates the declared dependency names and builds the
//!   parent/child relation.
//! - [`scheduler`] contains the per-invocation state machine that decides
//!   which units may start, and propagates invalidation downstream.
//! - [`aggregate`] merges the results of one wave.
//! - [`hooks`] connects single-unit controllers back to the scheduler.

pub mod aggregate;
pub mod graph;
pub mod hooks;
pub mod node;
pub mod queue;
pub mod scheduler;

pub use aggregate::{AggregateResult, CompletionTracker};
pub use graph::{DependencyGraph, UnitDecl};
pub use hooks::{NodeHooks, NoopHooks, SchedulerLink, SharedScheduler};
pub use node::NodeState;
pub use scheduler::{DoneOutcome, Scheduler};
