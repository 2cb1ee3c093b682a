// src/unit/command.rs

//! Build unit that runs a shell command.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::types::{BoxFuture, PathSet};
use crate::unit::hash::compute_hash_for_paths;
use crate::unit::{BuildOutput, BuildRequest, BuildUnit};
use crate::watch::patterns::UnitPatterns;
use crate::watch::WatchFileSystem;

/// Number of trailing stderr lines kept for the diagnostic of a failed command.
const STDERR_TAIL: usize = 20;

/// A unit whose build is one shell command run in `root`.
///
/// Its dependencies are the files matched by its watch patterns; the
/// literal base directories of those patterns are reported as context
/// dependencies, or as missing ones when they do not exist yet.
pub struct CommandUnit {
    name: String,
    cmd: String,
    root: PathBuf,
    dependencies: Vec<String>,
    patterns: UnitPatterns,
    use_hash: bool,
    /// Hash and output of the last successful build.
    last: Mutex<Option<(String, BuildOutput)>>,
    watch_fs: Option<Arc<dyn WatchFileSystem>>,
}

impl fmt::Debug for CommandUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandUnit")
            .field("name", &self.name)
            .field("cmd", &self.cmd)
            .field("root", &self.root)
            .field("dependencies", &self.dependencies)
            .field("use_hash", &self.use_hash)
            .finish_non_exhaustive()
    }
}

impl CommandUnit {
    pub fn new(
        name: impl Into<String>,
        cmd: impl Into<String>,
        root: impl Into<PathBuf>,
        patterns: UnitPatterns,
    ) -> Self {
        Self {
            name: name.into(),
            cmd: cmd.into(),
            root: root.into(),
            dependencies: Vec::new(),
            patterns,
            use_hash: false,
            last: Mutex::new(None),
            watch_fs: None,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Skip the command when the watched files hash the same as last time.
    pub fn with_hash(mut self, use_hash: bool) -> Self {
        self.use_hash = use_hash;
        self
    }

    pub fn with_watch_file_system(mut self, fs: Arc<dyn WatchFileSystem>) -> Self {
        self.watch_fs = Some(fs);
        self
    }

    fn collect_dependencies(&self) -> Result<BuildOutput> {
        let files = self.patterns.collect_matching_files(&self.root)?;
        let mut output = BuildOutput {
            file_dependencies: files.into_iter().collect(),
            ..Default::default()
        };
        for base in self.patterns.base_dirs() {
            let dir = self.root.join(base);
            if dir.is_dir() {
                output.context_dependencies.insert(dir);
            } else {
                output.missing_dependencies.insert(dir);
            }
        }
        Ok(output)
    }

    async fn execute(&self, request: BuildRequest) -> Result<BuildOutput> {
        let mut output = self
            .collect_dependencies()
            .with_context(|| format!("collecting inputs of unit '{}'", self.name))?;

        if let Some(modified) = &request.modified_files {
            debug!(
                unit = %self.name,
                modified = ?relative_paths(&self.root, modified),
                "building after changes"
            );
        }

        if self.use_hash {
            let hash = compute_hash_for_paths(&output.file_dependencies)?;
            let previous = self
                .last
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some((last_hash, last_output)) = previous {
                if last_hash == hash {
                    info!(unit = %self.name, hash = %hash, "inputs unchanged; skipping command");
                    return Ok(BuildOutput {
                        hash: Some(hash),
                        ..last_output
                    });
                }
            }
            output.hash = Some(hash);
        }

        let failure = self.run_command().await?;
        if let Some(message) = failure {
            output.errors.push(message);
        } else if let Some(hash) = &output.hash {
            *self.last.lock().unwrap_or_else(PoisonError::into_inner) =
                Some((hash.clone(), output.clone()));
        }

        Ok(output)
    }

    /// Run the command to completion.
    ///
    /// `Ok(Some(message))` is a command that ran and failed; `Err` means it
    /// could not be run at all.
    async fn run_command(&self) -> Result<Option<String>> {
        info!(unit = %self.name, cmd = %self.cmd, "starting unit command");

        // Build a shell command appropriate for the platform.
        let mut cmd = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(&self.cmd);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(&self.cmd);
            c
        };

        cmd.current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning process for unit '{}'", self.name))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (status, _, stderr_tail) = tokio::join!(
            child.wait(),
            drain_lines(stdout, &self.name, "stdout"),
            drain_lines(stderr, &self.name, "stderr"),
        );
        let status =
            status.with_context(|| format!("waiting for process of unit '{}'", self.name))?;

        let code = status.code().unwrap_or(-1);
        info!(
            unit = %self.name,
            exit_code = code,
            success = status.success(),
            "unit command exited"
        );

        if status.success() {
            return Ok(None);
        }

        warn!(unit = %self.name, exit_code = code, "unit command failed");
        let mut message = format!("command `{}` exited with status {code}", self.cmd);
        if !stderr_tail.is_empty() {
            message.push('\n');
            message.push_str(&stderr_tail.join("\n"));
        }
        Ok(Some(message))
    }
}

/// Log every line of a child stream, keeping the last few.
async fn drain_lines<R>(reader: Option<R>, unit: &str, stream: &'static str) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Vec::new();
    };
    let mut lines = BufReader::new(reader).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL);

    while let Ok(Some(line)) = lines.next_line().await {
        debug!(unit = %unit, stream, "{}", line);
        if tail.len() == STDERR_TAIL {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    tail.into()
}

impl BuildUnit for CommandUnit {
    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }

    fn build(&self, request: BuildRequest) -> BoxFuture<'_, anyhow::Result<BuildOutput>> {
        Box::pin(self.execute(request))
    }

    fn close(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.last.lock().unwrap_or_else(PoisonError::into_inner).take();
            debug!(unit = %self.name, "unit closed");
            Ok(())
        })
    }

    fn watch_file_system(&self) -> Option<Arc<dyn WatchFileSystem>> {
        self.watch_fs.clone()
    }
}

/// Paths of a unit's file dependencies, relative to its root when possible.
pub fn relative_paths(root: &Path, paths: &PathSet) -> Vec<PathBuf> {
    paths
        .iter()
        .map(|p| p.strip_prefix(root).map(Path::to_path_buf).unwrap_or_else(|_| p.clone()))
        .collect()
}
