// src/watch/patterns.rs

use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};

/// Default watch configuration from `[default]` in the config.
///
/// ```toml
/// [default]
/// watch = ["src/**/*.rs"]
/// exclude = ["src/**/generated/**"]
/// ```
#[derive(Debug, Clone, Default)]
pub struct WatchDefaults {
    pub watch: Vec<String>,
    pub exclude: Vec<String>,
}

/// A compiled list of glob patterns.
#[derive(Clone)]
pub struct PatternSet {
    patterns: Vec<String>,
    set: GlobSet,
}

impl fmt::Debug for PatternSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PatternSet").field(&self.patterns).finish()
    }
}

impl PatternSet {
    pub fn new(patterns: &[String]) -> Result<Self> {
        Ok(Self {
            patterns: patterns.to_vec(),
            set: build_globset(patterns)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_match(&self, path: &Path) -> bool {
        !self.patterns.is_empty() && self.set.is_match(normalize(path))
    }
}

/// Compiled watch/exclude patterns for a single unit.
///
/// Patterns are relative to the unit's working directory; `matches` expects
/// paths relative to that directory as well (e.g. `"src/main.rs"`).
#[derive(Clone)]
pub struct UnitPatterns {
    name: String,
    watch: PatternSet,
    exclude: PatternSet,
}

impl fmt::Debug for UnitPatterns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitPatterns")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl UnitPatterns {
    /// Compile patterns for one unit.
    ///
    /// A unit-local `watch` list replaces the default one, unless
    /// `append_default` is set, in which case both are combined. Exclusions
    /// always include the defaults.
    pub fn compile(
        name: &str,
        defaults: &WatchDefaults,
        watch: Option<&[String]>,
        exclude: Option<&[String]>,
        append_default: bool,
    ) -> Result<Self> {
        let watch_patterns = effective_patterns(watch, &defaults.watch, append_default);
        let exclude_patterns = effective_patterns(exclude, &defaults.exclude, true);

        let watch = PatternSet::new(&watch_patterns)
            .with_context(|| format!("building watch globset for unit {name}"))?;
        let exclude = PatternSet::new(&exclude_patterns)
            .with_context(|| format!("building exclude globset for unit {name}"))?;

        Ok(Self {
            name: name.to_string(),
            watch,
            exclude,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_empty(&self) -> bool {
        self.watch.is_empty()
    }

    /// Whether a path (relative to the unit's root) belongs to this unit.
    pub fn matches(&self, rel_path: &Path) -> bool {
        self.watch.is_match(rel_path) && !self.exclude.is_match(rel_path)
    }

    /// Literal directories the watch patterns are rooted at.
    pub fn base_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self.watch.patterns().iter().map(|p| glob_base(p)).collect();
        dirs.sort();
        dirs.dedup();
        dirs
    }

    /// Walk `root` and collect every file matching this unit's patterns.
    ///
    /// Only the base directories of the patterns are walked. Directories that
    /// do not exist are skipped.
    pub fn collect_matching_files(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut stack: Vec<PathBuf> = self
            .base_dirs()
            .into_iter()
            .map(|base| root.join(base))
            .collect();

        while let Some(path) = stack.pop() {
            if path.is_dir() {
                for entry in
                    fs::read_dir(&path).with_context(|| format!("reading dir {path:?}"))?
                {
                    stack.push(entry?.path());
                }
            } else if path.is_file() {
                if let Ok(rel) = path.strip_prefix(root) {
                    if self.matches(rel) {
                        files.push(path);
                    }
                }
            }
        }

        files.sort();
        files.dedup();
        Ok(files)
    }
}

/// Helper to decide the effective patterns list for a given dimension (watch or exclude).
fn effective_patterns(
    unit_list: Option<&[String]>,
    default_list: &[String],
    append_default: bool,
) -> Vec<String> {
    match (unit_list, append_default) {
        (Some(list), true) => {
            let mut combined = list.to_vec();
            combined.extend(default_list.iter().cloned());
            combined
        }
        (Some(list), false) => list.to_vec(),
        (None, _) => default_list.to_vec(),
    }
}

/// Build a GlobSet from simple string patterns.
fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pat in patterns {
        let glob = Glob::new(pat).with_context(|| format!("invalid glob pattern: {pat}"))?;
        builder.add(glob);
    }
    Ok(builder.build()?)
}

/// Longest leading run of path components without glob metacharacters.
///
/// `src/**/*.rs` -> `src`, `*.toml` -> `.`, `docs/index.md` -> `docs`.
pub fn glob_base(pattern: &str) -> PathBuf {
    let mut base = PathBuf::new();
    let components: Vec<Component<'_>> = Path::new(pattern).components().collect();
    let last = components.len().saturating_sub(1);

    for (i, component) in components.iter().enumerate() {
        let text = component.as_os_str().to_string_lossy();
        if text.contains(['*', '?', '[', '{']) || i == last {
            break;
        }
        base.push(component.as_os_str());
    }

    if base.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        base
    }
}

fn normalize(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
