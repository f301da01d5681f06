//! Modification-time based change detection
//!
//! A [`FileStateTracker`] remembers the modification time of every file it
//! saw on the previous scan and classifies the current tree against it. Only
//! timestamps are compared: a content change that keeps the same mtime is not
//! detected.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use ignore::WalkBuilder;
use ignore::overrides::{Override, OverrideBuilder};
use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::path::relative_path;

/// Version-control metadata directories that are never tracked
pub const RESERVED_DIRS: &[&str] = &[".git", ".hg", ".svn"];

/// Last observed modification time of every tracked file, keyed by relative path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerState {
    files: HashMap<String, SystemTime>,
}

impl TrackerState {
    /// Create an empty state
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked files
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Modification time recorded for `path`
    #[must_use]
    pub fn get(&self, path: &str) -> Option<SystemTime> {
        self.files.get(path).copied()
    }

    /// Whether `path` is tracked
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    /// Record `path` with the given modification time
    pub fn insert(&mut self, path: impl Into<String>, modified: SystemTime) {
        self.files.insert(path.into(), modified);
    }

    /// Tracked paths in sorted order
    #[must_use]
    pub fn paths(&self) -> BTreeSet<String> {
        self.files.keys().cloned().collect()
    }

    /// Iterate over `(path, modified)` pairs in arbitrary order
    pub fn iter(&self) -> impl Iterator<Item = (&str, SystemTime)> {
        self.files.iter().map(|(path, time)| (path.as_str(), *time))
    }
}

impl FromIterator<(String, SystemTime)> for TrackerState {
    fn from_iter<I: IntoIterator<Item = (String, SystemTime)>>(iter: I) -> Self {
        Self {
            files: iter.into_iter().collect(),
        }
    }
}

/// Classification of one scan against the previous state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanResult {
    /// Present now, absent before
    pub new_files: BTreeSet<String>,
    /// Present before and now with a different modification time
    pub modified_files: BTreeSet<String>,
    /// Present before, absent now
    pub deleted_files: BTreeSet<String>,
}

impl ScanResult {
    /// Check if there are any changes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.new_files.is_empty() && self.modified_files.is_empty() && self.deleted_files.is_empty()
    }

    /// Total number of classified paths
    #[must_use]
    pub fn len(&self) -> usize {
        self.new_files.len() + self.modified_files.len() + self.deleted_files.len()
    }

    /// Whether any file needs to be archived
    #[must_use]
    pub fn has_content(&self) -> bool {
        !self.new_files.is_empty() || !self.modified_files.is_empty()
    }

    /// New and modified paths, the set that goes into an archive
    #[must_use]
    pub fn changed_files(&self) -> BTreeSet<String> {
        self.new_files
            .union(&self.modified_files)
            .cloned()
            .collect()
    }
}

/// Classify `current` against `previous`
#[must_use]
pub fn classify(previous: &TrackerState, current: &TrackerState) -> ScanResult {
    let mut result = ScanResult::default();

    for (path, modified) in current.iter() {
        match previous.get(path) {
            None => {
                result.new_files.insert(path.to_string());
            }
            Some(before) if before != modified => {
                result.modified_files.insert(path.to_string());
            }
            Some(_) => {}
        }
    }

    for (path, _) in previous.iter() {
        if !current.contains(path) {
            result.deleted_files.insert(path.to_string());
        }
    }

    result
}

fn is_reserved(name: &std::ffi::OsStr) -> bool {
    RESERVED_DIRS.iter().any(|reserved| name == *reserved)
}

/// Build an override matcher that excludes the given gitignore-style globs
///
/// # Errors
/// Returns [`Error::Walk`] if a pattern is not a valid glob.
pub fn exclude_matcher(root: &Path, patterns: &[String]) -> Result<Option<Override>> {
    if patterns.is_empty() {
        return Ok(None);
    }

    let walk_err = |source| Error::Walk {
        root: root.to_path_buf(),
        source,
    };
    let mut overrides = OverrideBuilder::new(root);
    for pattern in patterns {
        overrides.add(&format!("!{pattern}")).map_err(walk_err)?;
    }
    Ok(Some(overrides.build().map_err(walk_err)?))
}

/// Read the modification time of every regular file below `root`
///
/// Reserved version-control directories are skipped. Symbolic links are not
/// followed. Any traversal or stat failure aborts the whole snapshot.
///
/// # Errors
/// Returns [`Error::Walk`] if the tree cannot be traversed, [`Error::Io`] if
/// a file cannot be stat'd, [`Error::InvalidPath`] for non-UTF-8 names.
pub fn snapshot(root: &Path, excludes: Option<&Override>) -> Result<TrackerState> {
    let mut builder = WalkBuilder::new(root);
    builder
        .standard_filters(false)
        .hidden(false)
        .follow_links(false)
        .filter_entry(|e| !is_reserved(e.file_name()));
    if let Some(excludes) = excludes {
        builder.overrides(excludes.clone());
    }

    let mut state = TrackerState::new();
    for result in builder.build() {
        let entry = result.map_err(|source| Error::Walk {
            root: root.to_path_buf(),
            source,
        })?;

        let Some(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_file() {
            if file_type.is_symlink() {
                debug!("skipping symlink {}", entry.path().display());
            }
            continue;
        }

        let path = entry.path();
        let metadata = std::fs::symlink_metadata(path)
            .map_err(|e| Error::io("failed to stat", path, e))?;
        let modified = metadata
            .modified()
            .map_err(|e| Error::io("failed to read mtime of", path, e))?;

        state.insert(relative_path(root, path)?, modified);
    }

    Ok(state)
}

/// A scan that has been computed but not yet merged into the tracker
#[derive(Debug, Clone)]
#[must_use = "a pending scan does nothing until committed"]
pub struct PendingScan {
    snapshot: TrackerState,
    result: ScanResult,
}

impl PendingScan {
    /// The classification this scan will commit
    pub fn result(&self) -> &ScanResult {
        &self.result
    }

    /// The file set observed by this scan
    pub fn snapshot(&self) -> &TrackerState {
        &self.snapshot
    }
}

/// Tracks modification times below one root across scans
pub struct FileStateTracker {
    root: PathBuf,
    state: TrackerState,
    excludes: Option<Override>,
}

impl FileStateTracker {
    /// Create a tracker with empty state for `root`
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: TrackerState::new(),
            excludes: None,
        }
    }

    /// Exclude files matching the given gitignore-style globs
    ///
    /// # Errors
    /// Returns an error if a pattern is not a valid glob.
    pub fn with_excludes(mut self, patterns: &[String]) -> Result<Self> {
        self.excludes = exclude_matcher(&self.root, patterns)?;
        Ok(self)
    }

    /// Root directory being tracked
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// State as of the last committed scan
    #[must_use]
    pub fn state(&self) -> &TrackerState {
        &self.state
    }

    /// Walk the root and classify it without changing tracker state
    ///
    /// # Errors
    /// Returns an error if the root cannot be traversed.
    pub fn prepare(&self) -> Result<PendingScan> {
        let snapshot = snapshot(&self.root, self.excludes.as_ref())?;
        let result = classify(&self.state, &snapshot);
        Ok(PendingScan { snapshot, result })
    }

    /// Install a prepared scan as the new state
    pub fn commit(&mut self, pending: PendingScan) -> ScanResult {
        self.state = pending.snapshot;
        pending.result
    }

    /// Scan the root, update state and return what changed
    ///
    /// # Errors
    /// Returns an error if the root cannot be traversed. State is untouched
    /// on error.
    pub fn scan(&mut self) -> Result<ScanResult> {
        let pending = self.prepare()?;
        let result = self.commit(pending);
        debug!(
            root = %self.root.display(),
            new = result.new_files.len(),
            modified = result.modified_files.len(),
            deleted = result.deleted_files.len(),
            "scan complete"
        );
        Ok(result)
    }
}
