// src/engine/group.rs

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::dag::{AggregateResult, DependencyGraph, UnitDecl};
use crate::engine::core::{GroupCore, WatchSlot};
use crate::engine::runtime::{GroupRuntime, ResultSink};
use crate::engine::watching::GroupWatching;
use crate::engine::{EventBus, LifecycleEvent, RuntimeEvent};
use crate::errors::{OrchestratorError, Result};
use crate::types::{Parallelism, PathSet, UnitId};
use crate::unit::{BuildMode, BuildRequest, BuildUnit};
use crate::watch::WatchOptions;

/// Group-wide settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupOptions {
    /// Maximum number of units building at the same time.
    pub parallelism: Parallelism,
}

/// Extra input for a single `run`.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub modified_files: Option<PathSet>,
    pub removed_files: Option<PathSet>,
}

/// Watch options for a `watch` call: one set shared by every unit, or one
/// per unit in construction order.
#[derive(Debug, Clone)]
pub enum WatchSelection {
    Shared(WatchOptions),
    PerUnit(Vec<WatchOptions>),
}

impl Default for WatchSelection {
    fn default() -> Self {
        WatchSelection::Shared(WatchOptions::default())
    }
}

/// Set of build units that are built together.
///
/// Units are addressed by construction order. Dependencies are declared by
/// name, either by the unit itself or with [`BuildGroup::set_dependencies`].
pub struct BuildGroup {
    units: Vec<Arc<dyn BuildUnit>>,
    overrides: HashMap<usize, Vec<String>>,
    options: GroupOptions,
    running: Arc<AtomicBool>,
    bus: EventBus,
}

impl fmt::Debug for BuildGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildGroup")
            .field("units", &self.labels())
            .field("options", &self.options)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl BuildGroup {
    pub fn new(units: Vec<Arc<dyn BuildUnit>>, options: GroupOptions) -> Self {
        Self {
            units,
            overrides: HashMap::new(),
            options,
            running: Arc::new(AtomicBool::new(false)),
            bus: EventBus::new(),
        }
    }

    /// Build a group from a name-keyed map, in key order. A unit that has a
    /// name must be registered under it.
    pub fn from_named(
        units: BTreeMap<String, Arc<dyn BuildUnit>>,
        options: GroupOptions,
    ) -> Result<Self> {
        for (key, unit) in &units {
            if let Some(name) = unit.name() {
                if name != key {
                    return Err(OrchestratorError::ConfigError(format!(
                        "unit registered as '{key}' is named '{name}'"
                    )));
                }
            }
        }
        Ok(Self::new(units.into_values().collect(), options))
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn units(&self) -> &[Arc<dyn BuildUnit>] {
        &self.units
    }

    pub fn options(&self) -> GroupOptions {
        self.options
    }

    /// Whether a `run` or `watch` is in progress.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Receive every lifecycle event fired from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<LifecycleEvent> {
        self.bus.subscribe()
    }

    /// Replace the declared dependencies of the unit called `name`.
    pub fn set_dependencies(&mut self, name: &str, dependencies: Vec<String>) -> Result<()> {
        let index = self
            .units
            .iter()
            .position(|u| u.name() == Some(name))
            .ok_or_else(|| OrchestratorError::ConfigError(format!("unknown unit '{name}'")))?;
        self.overrides.insert(index, dependencies);
        Ok(())
    }

    /// Check the dependency relation without building anything.
    pub fn validate_dependencies(&self) -> Result<()> {
        DependencyGraph::resolve(&self.decls()).map(|_| ())
    }

    /// Build every unit once, in dependency order.
    pub async fn run(&self) -> Result<AggregateResult> {
        self.run_with(RunOptions::default()).await
    }

    pub async fn run_with(&self, options: RunOptions) -> Result<AggregateResult> {
        let graph = self.prepare()?;
        info!(units = graph.len(), "starting group run");

        let request = BuildRequest {
            mode: BuildMode::Run,
            modified_files: options.modified_files,
            removed_files: options.removed_files,
            ..Default::default()
        };
        let core = GroupCore::for_run(&graph, self.names(), self.options.parallelism, request);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = oneshot::channel();
        let runtime = GroupRuntime::new(
            core,
            self.units.clone(),
            event_tx,
            event_rx,
            self.bus.clone(),
            ResultSink::Once(Some(result_tx)),
            Arc::clone(&self.running),
        );
        tokio::spawn(runtime.run());

        match result_rx.await {
            Ok(result) => result,
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                Err(OrchestratorError::Closed)
            }
        }
    }

    /// Start watching every unit. Builds start immediately; waves are
    /// available through [`GroupWatching::next_result`]. Must be called from
    /// within a Tokio runtime.
    pub fn watch(&self, selection: WatchSelection) -> Result<GroupWatching> {
        let graph = self.prepare()?;

        let options = match selection {
            WatchSelection::Shared(options) => vec![options; self.units.len()],
            WatchSelection::PerUnit(options) if options.len() == self.units.len() => options,
            WatchSelection::PerUnit(options) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(OrchestratorError::ConfigError(format!(
                    "{} watch option sets given for {} units",
                    options.len(),
                    self.units.len()
                )));
            }
        };
        let slots = self
            .units
            .iter()
            .zip(options)
            .map(|(unit, options)| WatchSlot {
                fs: unit.watch_file_system(),
                options,
            })
            .collect();

        info!(units = graph.len(), "starting group watch");
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let core = GroupCore::for_watch(
            &graph,
            self.names(),
            self.options.parallelism,
            slots,
            event_tx.clone(),
        );
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        let runtime = GroupRuntime::new(
            core,
            self.units.clone(),
            event_tx.clone(),
            event_rx,
            self.bus.clone(),
            ResultSink::Stream(result_tx),
            Arc::clone(&self.running),
        );

        // Queued before the actor starts, so it is handled right after the
        // first dispatch.
        let _ = event_tx.send(RuntimeEvent::InitialTick);
        tokio::spawn(runtime.run());

        Ok(GroupWatching::new(event_tx, result_rx, self.units.len()))
    }

    /// Close every unit. All of them are attempted; the first failure is
    /// returned.
    pub async fn close(&self) -> Result<()> {
        let mut first_error = None;
        for (i, unit) in self.units.iter().enumerate() {
            if let Err(err) = unit.close().await {
                let label = self.label(i);
                warn!(unit = %label, error = %format!("{err:#}"), "closing unit failed");
                first_error.get_or_insert(OrchestratorError::Teardown {
                    unit: label,
                    message: format!("{err:#}"),
                });
            }
        }
        debug!(units = self.units.len(), "group closed");
        first_error.map_or(Ok(()), Err)
    }

    /// Take the running flag and resolve the dependency graph.
    fn prepare(&self) -> Result<DependencyGraph> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(OrchestratorError::ConcurrentCompilation);
        }
        DependencyGraph::resolve(&self.decls()).inspect_err(|err| {
            warn!(error = %err, "invalid unit dependencies");
            self.running.store(false, Ordering::SeqCst);
        })
    }

    fn decls(&self) -> Vec<UnitDecl> {
        self.units
            .iter()
            .enumerate()
            .map(|(i, unit)| UnitDecl {
                name: unit.name().map(str::to_string),
                dependencies: self
                    .overrides
                    .get(&i)
                    .cloned()
                    .unwrap_or_else(|| unit.dependencies()),
            })
            .collect()
    }

    fn names(&self) -> Vec<Option<String>> {
        self.units
            .iter()
            .map(|u| u.name().map(str::to_string))
            .collect()
    }

    fn label(&self, index: usize) -> String {
        self.units
            .get(index)
            .and_then(|u| u.name())
            .map(str::to_string)
            .unwrap_or_else(|| UnitId(index).to_string())
    }

    fn labels(&self) -> Vec<String> {
        (0..self.units.len()).map(|i| self.label(i)).collect()
    }
}
