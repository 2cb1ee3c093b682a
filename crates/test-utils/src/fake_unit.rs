//! Scriptable build unit for orchestrator tests.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;

use multibuild::types::{BoxFuture, PathSet};
use multibuild::unit::{BuildMode, BuildOutput, BuildRequest, BuildUnit};
use multibuild::watch::{MockWatchFileSystem, WatchFileSystem};

/// One recorded build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    Started(String),
    Finished(String),
}

#[derive(Debug, Default)]
struct LogInner {
    entries: Vec<LogEntry>,
    requests: Vec<(String, BuildRequest)>,
}

/// Build log shared by every unit of a test, with a concurrency probe.
#[derive(Debug, Clone, Default)]
pub struct BuildLog {
    inner: Arc<Mutex<LogInner>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl BuildLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.inner.lock().unwrap().entries.clone()
    }

    /// Unit names in build start order.
    pub fn starts(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter_map(|e| match e {
                LogEntry::Started(name) => Some(name),
                LogEntry::Finished(_) => None,
            })
            .collect()
    }

    pub fn finishes(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter_map(|e| match e {
                LogEntry::Finished(name) => Some(name),
                LogEntry::Started(_) => None,
            })
            .collect()
    }

    pub fn start_count(&self, name: &str) -> usize {
        self.starts().iter().filter(|n| *n == name).count()
    }

    /// Requests received by `name`, oldest first.
    pub fn requests_for(&self, name: &str) -> Vec<BuildRequest> {
        self.inner
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Position of the first `Finished(name)` entry.
    pub fn finished_at(&self, name: &str) -> Option<usize> {
        let wanted = LogEntry::Finished(name.to_string());
        self.entries().iter().position(|e| *e == wanted)
    }

    /// Position of the first `Started(name)` entry.
    pub fn started_at(&self, name: &str) -> Option<usize> {
        let wanted = LogEntry::Started(name.to_string());
        self.entries().iter().position(|e| *e == wanted)
    }

    /// Highest number of builds observed running at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.requests.clear();
    }

    fn start(&self, name: &str, request: &BuildRequest) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();
        inner.entries.push(LogEntry::Started(name.to_string()));
        inner.requests.push((name.to_string(), request.clone()));
    }

    fn finish(&self, name: &str) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.inner
            .lock()
            .unwrap()
            .entries
            .push(LogEntry::Finished(name.to_string()));
    }
}

/// Holds builds until the test lets them through.
#[derive(Debug, Clone)]
pub struct Gate {
    permits: Arc<Semaphore>,
}

impl Gate {
    pub fn closed() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(0)),
        }
    }

    /// Let `n` waiting (or future) builds through.
    pub fn release(&self, n: usize) {
        self.permits.add_permits(n);
    }

    /// Let every build through from now on.
    pub fn open(&self) {
        self.permits.add_permits(1 << 20);
    }

    async fn pass(&self) {
        if let Ok(permit) = self.permits.acquire().await {
            permit.forget();
        }
    }
}

#[derive(Debug, Default)]
struct Script {
    /// Hard failures for upcoming builds, consumed in order.
    failures: VecDeque<String>,
    /// Diagnostics reported by every successful build.
    errors: Vec<String>,
}

/// A [`BuildUnit`] that records its builds in a [`BuildLog`].
///
/// Each build reports `<name>.src` as its only file dependency, so in
/// watch mode it is re-subscribed on the unit's [`MockWatchFileSystem`].
#[derive(Debug)]
pub struct FakeUnit {
    name: Option<String>,
    dependencies: Vec<String>,
    log: BuildLog,
    fs: MockWatchFileSystem,
    watchable: bool,
    delay: Duration,
    gate: Option<Gate>,
    script: Mutex<Script>,
    closes: AtomicUsize,
    close_error: Option<String>,
}

impl FakeUnit {
    pub fn new(name: &str, log: &BuildLog) -> Self {
        Self::create(Some(name.to_string()), log)
    }

    pub fn unnamed(log: &BuildLog) -> Self {
        Self::create(None, log)
    }

    fn create(name: Option<String>, log: &BuildLog) -> Self {
        Self {
            name,
            dependencies: Vec::new(),
            log: log.clone(),
            fs: MockWatchFileSystem::new(),
            watchable: true,
            delay: Duration::ZERO,
            gate: None,
            script: Mutex::new(Script::default()),
            closes: AtomicUsize::new(0),
            close_error: None,
        }
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    /// Every build takes at least this long.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every build waits for a permit of `gate` before finishing.
    pub fn with_gate(mut self, gate: &Gate) -> Self {
        self.gate = Some(gate.clone());
        self
    }

    /// Units without a watch file system are never re-subscribed.
    pub fn without_watcher(mut self) -> Self {
        self.watchable = false;
        self
    }

    pub fn failing_close(mut self, message: &str) -> Self {
        self.close_error = Some(message.to_string());
        self
    }

    /// The next build fails with `message`.
    pub fn fail_next(&self, message: &str) {
        self.script
            .lock()
            .unwrap()
            .failures
            .push_back(message.to_string());
    }

    /// Successful builds report these diagnostics.
    pub fn report_errors(&self, errors: &[&str]) {
        self.script.lock().unwrap().errors = errors.iter().map(|e| e.to_string()).collect();
    }

    pub fn fs(&self) -> &MockWatchFileSystem {
        &self.fs
    }

    pub fn source_file(&self) -> PathBuf {
        PathBuf::from(format!("{}.src", self.label()))
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| "unnamed".to_string())
    }

    async fn run(&self, request: BuildRequest) -> anyhow::Result<BuildOutput> {
        let label = self.label();
        self.log.start(&label, &request);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(gate) = &self.gate {
            gate.pass().await;
        }

        let (failure, errors) = {
            let mut script = self.script.lock().unwrap();
            (script.failures.pop_front(), script.errors.clone())
        };
        self.log.finish(&label);

        if let Some(message) = failure {
            anyhow::bail!(message);
        }

        let hash = match request.mode {
            BuildMode::Run => format!("{label}-run"),
            BuildMode::Watch => format!("{label}-watch"),
        };
        Ok(BuildOutput {
            file_dependencies: PathSet::from([self.source_file()]),
            hash: Some(hash),
            errors,
            ..Default::default()
        })
    }
}

impl BuildUnit for FakeUnit {
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }

    fn build(&self, request: BuildRequest) -> BoxFuture<'_, anyhow::Result<BuildOutput>> {
        Box::pin(self.run(request))
    }

    fn close(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.closes.fetch_add(1, Ordering::SeqCst);
            match &self.close_error {
                Some(message) => anyhow::bail!("{message}"),
                None => Ok(()),
            }
        })
    }

    fn watch_file_system(&self) -> Option<Arc<dyn WatchFileSystem>> {
        if self.watchable {
            Some(Arc::new(self.fs.clone()))
        } else {
            None
        }
    }
}
