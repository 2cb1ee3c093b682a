// src/engine/runtime.rs

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use anyhow::anyhow;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::dag::AggregateResult;
use crate::errors::Result;
use crate::types::UnitId;
use crate::unit::{BuildRequest, BuildUnit};

use super::bus::EventBus;
use super::core::GroupCore;
use super::{CoreCommand, RuntimeEvent};

/// Where waves (or the group's failure) go.
#[derive(Debug)]
pub enum ResultSink {
    /// `run`: exactly one delivery.
    Once(Option<oneshot::Sender<Result<AggregateResult>>>),
    /// `watch`: one delivery per wave.
    Stream(mpsc::UnboundedSender<Result<AggregateResult>>),
}

impl ResultSink {
    fn deliver(&mut self, result: Result<AggregateResult>) {
        match self {
            ResultSink::Once(slot) => match slot.take() {
                Some(tx) => {
                    let _ = tx.send(result);
                }
                None => warn!("second delivery for a single run; dropping it"),
            },
            ResultSink::Stream(tx) => {
                if tx.send(result).is_err() {
                    debug!("result receiver dropped");
                }
            }
        }
    }
}

/// Async IO shell around [`GroupCore`].
///
/// Owns the units and the event channel. Builds are spawned as Tokio tasks
/// that report back through the same channel the watchers post into, so
/// every scheduling decision is taken on this one task.
pub struct GroupRuntime {
    core: GroupCore,
    units: Vec<Arc<dyn BuildUnit>>,
    event_tx: mpsc::UnboundedSender<RuntimeEvent>,
    event_rx: mpsc::UnboundedReceiver<RuntimeEvent>,
    bus: EventBus,
    results: ResultSink,
    running: Arc<AtomicBool>,
}

impl fmt::Debug for GroupRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupRuntime")
            .field("core", &self.core)
            .field("units", &self.units.len())
            .finish_non_exhaustive()
    }
}

impl GroupRuntime {
    pub fn new(
        core: GroupCore,
        units: Vec<Arc<dyn BuildUnit>>,
        event_tx: mpsc::UnboundedSender<RuntimeEvent>,
        event_rx: mpsc::UnboundedReceiver<RuntimeEvent>,
        bus: EventBus,
        results: ResultSink,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            core,
            units,
            event_tx,
            event_rx,
            bus,
            results,
            running,
        }
    }

    /// Main event loop.
    ///
    /// - Performs the scheduler's first dispatch.
    /// - Consumes `RuntimeEvent`s and feeds them into the core.
    /// - Executes the commands the core returns.
    pub async fn run(mut self) {
        debug!(units = self.units.len(), "group runtime started");

        let step = self.core.start();
        for command in step.commands {
            self.execute_command(command);
        }
        if !step.keep_running {
            debug!("group finished during the first dispatch");
            return;
        }

        while let Some(event) = self.event_rx.recv().await {
            debug!(?event, "runtime received event");

            let step = self.core.step(event);
            for command in step.commands {
                self.execute_command(command);
            }

            if !step.keep_running {
                debug!("core requested exit; stopping runtime");
                break;
            }
        }

        info!("group runtime exiting");
    }

    fn execute_command(&mut self, command: CoreCommand) {
        match command {
            CoreCommand::StartBuild { unit, request } => self.spawn_build(unit, request),
            CoreCommand::Publish(event) => self.bus.publish(event),
            CoreCommand::Deliver(result) => self.results.deliver(result),
            CoreCommand::ReleaseGroup => self.running.store(false, Ordering::SeqCst),
            CoreCommand::Acknowledge { acks, result } => {
                for ack in acks {
                    let _ = ack.send(result.clone());
                }
            }
        }
    }

    fn spawn_build(&self, id: UnitId, request: BuildRequest) {
        let Some(unit) = self.units.get(id.index()).cloned() else {
            warn!(unit = %id, "build requested for unknown unit");
            return;
        };
        let tx = self.event_tx.clone();

        tokio::spawn(async move {
            let started = SystemTime::now();
            // The inner task turns a panicking build into an error instead of
            // leaving the node running forever.
            let result = match tokio::spawn(async move { unit.build(request).await }).await {
                Ok(result) => result,
                Err(join) => Err(anyhow!("build task failed: {join}")),
            };
            let _ = tx.send(RuntimeEvent::BuildFinished {
                unit: id,
                started,
                finished: SystemTime::now(),
                result,
            });
        });
    }
}
