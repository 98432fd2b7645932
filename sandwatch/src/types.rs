//! Persisted data model for Sandwatch.
//!
//! Everything in this module is written to disk under the control directory
//! or into the journal, so all types serialize to camelCase JSON.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Config;

/// What the baseline index remembers about one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FileRecord {
    /// Regular file identified by content digest.
    File {
        /// Lowercase hex SHA-256 of the content.
        hash: String,
        /// Size in bytes.
        size: u64,
    },
    /// Symbolic link identified by its target.
    Symlink {
        #[serde(rename = "linkTarget")]
        link_target: String,
    },
}

impl FileRecord {
    /// Returns true for regular files.
    #[must_use]
    pub fn is_file(&self) -> bool {
        matches!(self, Self::File { .. })
    }

    /// Returns the recorded size for regular files.
    #[must_use]
    pub fn size(&self) -> Option<u64> {
        match self {
            Self::File { size, .. } => Some(*size),
            Self::Symlink { .. } => None,
        }
    }
}

/// Classification of a change against the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl ChangeKind {
    /// Lowercase label used in rendered output.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a change carries no diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// One side exceeds the per-file read ceiling.
    TooLarge,
    /// One side contains a NUL byte.
    Binary,
    /// One side is a symbolic link.
    Symlink,
}

impl SkipReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TooLarge => "too_large",
            Self::Binary => "binary",
            Self::Symlink => "symlink",
        }
    }
}

/// A single detected change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    /// Sandbox-relative, forward-slash path.
    pub path: String,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    /// Live record for added/modified, baseline record for deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<FileRecord>,
    /// Unified diff against the baseline content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<SkipReason>,
    /// Size of the oversized side when `reason` is `too_large`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl ChangeRecord {
    /// Creates a change with no diff attached.
    #[must_use]
    pub fn new(path: impl Into<String>, kind: ChangeKind, info: Option<FileRecord>) -> Self {
        Self {
            path: path.into(),
            kind,
            info,
            diff: None,
            truncated: false,
            reason: None,
            size: None,
        }
    }
}

/// How one command finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitRecord {
    pub name: String,
    /// Exit code, absent when terminated by a signal.
    pub code: Option<i32>,
    /// Terminating signal name such as `SIGTERM`.
    pub signal: Option<String>,
}

impl ExitRecord {
    /// Returns true when the command exited with code zero.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.code == Some(0)
    }
}

/// Captured output of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Whether either stream dropped bytes.
    pub truncated: bool,
}

/// One recorded run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    /// Monotonic id, unique within one supervisor process.
    pub run_id: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub ok: bool,
    pub interrupted: bool,
    pub duration_ms: u64,
    pub exits: Vec<ExitRecord>,
    #[serde(default)]
    pub changes: Vec<ChangeRecord>,
    /// Output per command name, when capture is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<BTreeMap<String, CommandOutput>>,
}

/// Status consumed by the apply gate, overwritten after every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    pub last_run_at: DateTime<Utc>,
    pub last_run_ok: bool,
    pub interrupted: bool,
    pub duration_ms: u64,
    pub exits: Vec<ExitRecord>,
}

/// One line of the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JournalEvent {
    /// A completed run.
    Run(RunRecord),
    /// A free-form intent note.
    #[serde(rename_all = "camelCase")]
    Intent {
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
        note: String,
    },
    /// Sandbox content was applied to a target tree.
    #[serde(rename_all = "camelCase")]
    Apply {
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
        target_root: PathBuf,
    },
}

impl JournalEvent {
    /// Short event label, matching the `type` tag.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Run(_) => "run",
            Self::Intent { .. } => "intent",
            Self::Apply { .. } => "apply",
        }
    }
}

/// Metadata written into every sandbox at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxMeta {
    pub source_root: PathBuf,
    pub sandbox_root: PathBuf,
    pub created_at: DateTime<Utc>,
    pub config: Config,
}

/// Registry of sandboxes created for a source tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Registry {
    pub last_sandbox: Option<PathBuf>,
    pub sandboxes: Vec<PathBuf>,
}

impl Registry {
    /// Records `sandbox` as the most recent, keeping the list free of duplicates.
    pub fn register(&mut self, sandbox: PathBuf) {
        if !self.sandboxes.contains(&sandbox) {
            self.sandboxes.push(sandbox.clone());
        }
        self.last_sandbox = Some(sandbox);
    }
}

/// Session descriptor written once per sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub sandbox_root: PathBuf,
    pub source_root: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub config: Config,
}

/// Paths reported by the watcher since the last run.
///
/// A hint either lists specific sandbox-relative paths or demands a full
/// scan. Once `full_scan` is set, individual paths are irrelevant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeHint {
    pub paths: BTreeSet<String>,
    pub full_scan: bool,
}

impl ChangeHint {
    /// A hint that requires a full rescan.
    #[must_use]
    pub fn full() -> Self {
        Self {
            paths: BTreeSet::new(),
            full_scan: true,
        }
    }

    /// A hint naming the given paths.
    #[must_use]
    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            full_scan: false,
        }
    }

    /// Adds one path, ignored once a full scan is pending.
    pub fn add_path(&mut self, path: impl Into<String>) {
        if !self.full_scan {
            self.paths.insert(path.into());
        }
    }

    /// Escalates to a full scan.
    pub fn mark_full(&mut self) {
        self.full_scan = true;
        self.paths.clear();
    }

    /// Folds `other` into `self`.
    pub fn merge(&mut self, other: ChangeHint) {
        if other.full_scan {
            self.mark_full();
        } else {
            for path in other.paths {
                self.add_path(path);
            }
        }
    }

    /// Takes the accumulated hint, leaving an empty one behind.
    pub fn take(&mut self) -> ChangeHint {
        std::mem::take(self)
    }

    /// Returns true when nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.full_scan && self.paths.is_empty()
    }
}
