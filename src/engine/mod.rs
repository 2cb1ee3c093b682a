// src/engine/mod.rs

//! Orchestration engine for multibuild.
//!
//! This module ties together:
//! - the dependency scheduler (`dag`)
//! - one [`controller::WatchController`] per unit in watch mode
//! - the runtime actor that reacts to:
//!   - finished builds
//!   - watcher notifications
//!   - invalidate / suspend / resume / close requests from the caller
//!
//! The pure core state machine lives in [`core`]; the async/IO shell is
//! implemented in [`runtime`]. [`group::BuildGroup`] and
//! [`watching::GroupWatching`] are the caller-facing handles.

use std::path::PathBuf;
use std::time::SystemTime;

use tokio::sync::oneshot;

use crate::dag::AggregateResult;
use crate::errors::{OrchestratorError, Result};
use crate::types::UnitId;
use crate::unit::{BuildOutput, BuildRequest, BuildStats};
use crate::watch::WatchEvent;

pub mod bus;
pub mod controller;
pub mod core;
pub mod group;
pub mod runtime;
pub mod watching;

pub use bus::EventBus;
pub use controller::WatchController;
pub use core::GroupCore;
pub use group::{BuildGroup, GroupOptions, RunOptions, WatchSelection};
pub use runtime::GroupRuntime;
pub use watching::GroupWatching;

/// One-shot completion signal for invalidate/close callers.
pub type Ack = oneshot::Sender<Result<()>>;

/// Events flowing into the runtime actor from builds, watchers and callers.
#[derive(Debug)]
pub enum RuntimeEvent {
    /// Deferred first invalidation of every controller.
    InitialTick,
    /// A spawned build returned.
    BuildFinished {
        unit: UnitId,
        started: SystemTime,
        finished: SystemTime,
        result: anyhow::Result<BuildOutput>,
    },
    /// A watcher subscription of `unit` reported something.
    Watcher {
        unit: UnitId,
        generation: u64,
        event: WatchEvent,
    },
    /// Invalidate every unit; one ack per unit.
    Invalidate { acks: Vec<Ack> },
    Suspend,
    Resume,
    /// Close every watch session, then stop the actor.
    Close { ack: Ack },
    /// Stop without closing anything (the caller went away).
    Shutdown,
}

/// Notifications published to [`EventBus`] subscribers.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// A unit started building in run mode.
    RunStarted { unit: UnitId },
    /// A unit started building in watch mode.
    WatchRunStarted { unit: UnitId },
    /// A unit's inputs changed; reported once per build cycle.
    Invalid {
        unit: UnitId,
        path: Option<PathBuf>,
        time: SystemTime,
    },
    Done { unit: UnitId, stats: BuildStats },
    Failed {
        unit: UnitId,
        error: OrchestratorError,
    },
    /// A unit's watch session was torn down.
    WatchClosed { unit: UnitId },
    /// Every unit has an up-to-date result.
    AllDone(AggregateResult),
    /// The whole group's watch session was closed.
    GroupWatchClosed,
}

/// What the IO shell should do next, as decided by the core.
#[derive(Debug)]
pub enum CoreCommand {
    StartBuild { unit: UnitId, request: BuildRequest },
    Publish(LifecycleEvent),
    /// Hand a wave (or the group's failure) to the caller.
    Deliver(Result<AggregateResult>),
    /// Clear the group's "running" flag.
    ReleaseGroup,
    Acknowledge { acks: Vec<Ack>, result: Result<()> },
}

/// Outcome of one core step.
#[derive(Debug, Default)]
pub struct CoreStep {
    pub commands: Vec<CoreCommand>,
    pub keep_running: bool,
}
