//! Baseline change tracking.
//!
//! The baseline is a private mirror of the sandbox (under
//! `.sandwatch/session/baseline/`) plus an index mapping each relative path to
//! a [`FileRecord`]. The index is the single source of truth for "has this
//! path changed": a run computes changes against it, renders diffs against
//! the mirrored content, and only then folds the changes back in.
//!
//! # Scanning modes
//!
//! - **Full scan**: walk the live sandbox, compare every entry to the index,
//!   and report index entries that were not encountered as deleted.
//! - **Incremental**: inspect only the hinted paths. A hinted path that is a
//!   live directory, or that is absent but prefixes indexed paths, escalates
//!   to a full scan since a directory move can touch any number of files.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use sandwatch::baseline::BaselineStore;
//! use sandwatch::config::Config;
//!
//! let store = BaselineStore::new(Path::new("/tmp/sandbox"), &Config::default())?;
//! store.ensure()?;
//! let changes = store.record(None, true)?;
//! println!("{} change(s)", changes.len());
//! # Ok::<(), sandwatch::error::SandwatchError>(())
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use similar::TextDiff;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::ignore::IgnoreRules;
use crate::layout::SandboxLayout;
use crate::store::{read_json, write_json};
use crate::tree::{copy_entry, copy_tree, file_record, join_rel, remove_path, walk, EntryKind};
use crate::types::{ChangeHint, ChangeKind, ChangeRecord, FileRecord, SkipReason};

/// Lines of context around each diff hunk.
const DIFF_CONTEXT_LINES: usize = 3;

/// Persisted index of the baseline tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BaselineIndex {
    pub files: BTreeMap<String, FileRecord>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A baseline mutation deferred until after diffing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingUpdate {
    /// Copy the live entry into the baseline and record it.
    Upsert { rel: String, record: FileRecord },
    /// Drop the entry from the baseline.
    Delete { rel: String },
}

/// Output of [`BaselineStore::compute_changes`].
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub changes: Vec<ChangeRecord>,
    pub updates: Vec<PendingUpdate>,
    /// Whether the computation walked the whole tree.
    pub full_scan: bool,
}

/// Limits applied while rendering diffs.
#[derive(Debug, Clone, Copy)]
pub struct DiffLimits {
    pub max_file_bytes: u64,
    pub max_diff_bytes: usize,
}

/// Content of one side of a diff.
enum Side {
    Absent,
    Text(String),
    Skipped { reason: SkipReason, size: u64 },
}

/// Owner of a sandbox's baseline mirror and index.
#[derive(Debug, Clone)]
pub struct BaselineStore {
    sandbox_root: PathBuf,
    baseline_root: PathBuf,
    index_path: PathBuf,
    ignore: IgnoreRules,
    limits: DiffLimits,
}

impl BaselineStore {
    /// Creates a store for `sandbox_root` using the configured ignore rules
    /// and tracking limits. Nothing is touched on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if an ignore pattern is malformed.
    pub fn new(sandbox_root: &Path, config: &Config) -> Result<Self> {
        let layout = SandboxLayout::new(sandbox_root);
        Ok(Self {
            sandbox_root: sandbox_root.to_path_buf(),
            baseline_root: layout.baseline_dir(),
            index_path: layout.baseline_index(),
            ignore: IgnoreRules::new(&config.ignore)?,
            limits: DiffLimits {
                max_file_bytes: config.tracking.max_file_bytes,
                max_diff_bytes: config.tracking.max_diff_bytes,
            },
        })
    }

    /// Directory holding the mirrored tree.
    #[must_use]
    pub fn baseline_root(&self) -> &Path {
        &self.baseline_root
    }

    /// Creates the baseline on first use.
    ///
    /// Copies the filtered sandbox into the mirror and indexes it. Returns
    /// `false` without doing anything if the mirror already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the copy, hashing or index write fails.
    pub fn ensure(&self) -> Result<bool> {
        if self.baseline_root.exists() {
            return Ok(false);
        }

        fs::create_dir_all(&self.baseline_root)?;
        copy_tree(&self.sandbox_root, &self.baseline_root, &self.ignore)?;

        let mut index = BaselineIndex::default();
        for entry in walk(&self.baseline_root, &self.ignore, None)? {
            if entry.kind == EntryKind::Dir {
                continue;
            }
            if let Some(record) = file_record(&entry.path)? {
                index.files.insert(entry.rel, record);
            }
        }
        let count = index.files.len();
        self.write_index(&mut index)?;

        info!(files = count, "Baseline created");
        Ok(true)
    }

    /// Loads the index. A missing or corrupt index is treated as empty.
    #[must_use]
    pub fn load_index(&self) -> BaselineIndex {
        read_json(&self.index_path).unwrap_or_default()
    }

    fn write_index(&self, index: &mut BaselineIndex) -> Result<()> {
        index.updated_at = Some(Utc::now());
        write_json(&self.index_path, index)
    }

    /// Computes changes between the live sandbox and `index`.
    ///
    /// With no hint, or a full-scan hint, the whole tree is walked.
    /// Otherwise only hinted paths are inspected, unless one of them forces
    /// escalation. Ignored paths are never reported.
    ///
    /// # Errors
    ///
    /// Returns an error if walking or hashing fails.
    pub fn compute_changes(
        &self,
        index: &BaselineIndex,
        hint: Option<&ChangeHint>,
    ) -> Result<ChangeSet> {
        match hint {
            Some(hint) if !hint.full_scan => {
                if let Some(set) = self.compute_incremental(index, hint)? {
                    return Ok(set);
                }
                debug!("Change hint escalated to full scan");
                self.compute_full(index)
            }
            _ => self.compute_full(index),
        }
    }

    fn compute_full(&self, index: &BaselineIndex) -> Result<ChangeSet> {
        let mut set = ChangeSet {
            full_scan: true,
            ..ChangeSet::default()
        };
        let mut seen = HashSet::new();

        for entry in walk(&self.sandbox_root, &self.ignore, None)? {
            if entry.kind == EntryKind::Dir {
                continue;
            }
            let Some(live) = file_record(&entry.path)? else {
                continue;
            };
            let prev = index.files.get(&entry.rel);
            classify(&mut set, &entry.rel, Some(live), prev);
            seen.insert(entry.rel);
        }

        for (rel, prev) in &index.files {
            if !seen.contains(rel) {
                classify(&mut set, rel, None, Some(prev));
            }
        }
        Ok(set)
    }

    /// Returns `None` when the hint requires a full scan instead.
    fn compute_incremental(&self, index: &BaselineIndex, hint: &ChangeHint) -> Result<Option<ChangeSet>> {
        let mut set = ChangeSet::default();

        for rel in &hint.paths {
            if rel.is_empty() || self.ignore.is_ignored(rel) {
                continue;
            }
            let live_path = join_rel(&self.sandbox_root, rel);
            let is_live_dir = fs::symlink_metadata(&live_path).is_ok_and(|m| m.is_dir());
            if is_live_dir {
                return Ok(None);
            }

            let live = file_record(&live_path)?;
            let prev = index.files.get(rel);
            if live.is_none() && prev.is_none() {
                let prefix = format!("{rel}/");
                if index.files.keys().any(|key| key.starts_with(&prefix)) {
                    return Ok(None);
                }
                continue;
            }
            classify(&mut set, rel, live, prev);
        }
        Ok(Some(set))
    }

    /// Attaches unified diffs to regular-file changes.
    ///
    /// Must be called before [`BaselineStore::apply_updates`], since the
    /// baseline side of each diff is read from the mirror.
    pub fn enrich_with_diff(&self, changes: &mut [ChangeRecord]) {
        for change in changes.iter_mut() {
            let baseline_path = join_rel(&self.baseline_root, &change.path);
            let baseline_is_link = change.kind != ChangeKind::Added
                && fs::symlink_metadata(&baseline_path).is_ok_and(|m| m.file_type().is_symlink());
            if baseline_is_link || matches!(change.info, Some(FileRecord::Symlink { .. })) {
                change.reason = Some(SkipReason::Symlink);
                continue;
            }

            let before = match change.kind {
                ChangeKind::Added => Side::Absent,
                _ => self.read_side(&baseline_path),
            };
            let after = match change.kind {
                ChangeKind::Deleted => Side::Absent,
                _ => self.read_side(&join_rel(&self.sandbox_root, &change.path)),
            };

            let (old, new) = match (before, after) {
                (Side::Skipped { reason, size }, _) | (_, Side::Skipped { reason, size }) => {
                    warn!(path = %change.path, reason = reason.as_str(), "Skipping diff");
                    change.reason = Some(reason);
                    change.size = Some(size);
                    continue;
                }
                (Side::Absent, Side::Absent) => continue,
                (Side::Absent, Side::Text(new)) if change.kind == ChangeKind::Added => (String::new(), new),
                (Side::Text(old), Side::Absent) if change.kind == ChangeKind::Deleted => (old, String::new()),
                (Side::Text(old), Side::Text(new)) => (old, new),
                _ => continue,
            };
            if old == new {
                continue;
            }

            let patch = unified_diff(&change.path, &old, &new);
            if patch.is_empty() {
                continue;
            }
            let (patch, truncated) = truncate_at_boundary(patch, self.limits.max_diff_bytes);
            change.diff = Some(patch);
            change.truncated = truncated;
        }
    }

    fn read_side(&self, path: &Path) -> Side {
        match read_text(path, self.limits.max_file_bytes) {
            Ok(side) => side,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Failed to read file for diff");
                Side::Absent
            }
        }
    }

    /// Folds pending updates into the mirror and persists the index.
    ///
    /// Entries that vanish between detection and update are skipped with a
    /// warning; the next run will pick them up.
    ///
    /// # Errors
    ///
    /// Returns an error if the mirror or the index cannot be written.
    pub fn apply_updates(&self, index: &mut BaselineIndex, updates: Vec<PendingUpdate>) -> Result<()> {
        for update in updates {
            match update {
                PendingUpdate::Delete { rel } => {
                    remove_path(&join_rel(&self.baseline_root, &rel))?;
                    index.files.remove(&rel);
                }
                PendingUpdate::Upsert { rel, record } => {
                    let src = join_rel(&self.sandbox_root, &rel);
                    let dest = join_rel(&self.baseline_root, &rel);
                    let kind = match record {
                        FileRecord::File { .. } => EntryKind::File,
                        FileRecord::Symlink { .. } => EntryKind::Symlink,
                    };
                    match copy_entry(&src, &dest, kind) {
                        Ok(()) => {
                            index.files.insert(rel, record);
                        }
                        Err(err) if err.kind() == io::ErrorKind::NotFound => {
                            warn!(path = %rel, "Entry vanished before baseline update");
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
            }
        }
        self.write_index(index)
    }

    /// Runs one full tracking cycle: load, compute, optionally diff, update.
    ///
    /// # Errors
    ///
    /// Returns an error if scanning or updating the baseline fails.
    pub fn record(&self, hint: Option<&ChangeHint>, with_diffs: bool) -> Result<Vec<ChangeRecord>> {
        let mut index = self.load_index();
        let ChangeSet {
            mut changes,
            updates,
            full_scan,
        } = self.compute_changes(&index, hint)?;

        if with_diffs {
            self.enrich_with_diff(&mut changes);
        }
        self.apply_updates(&mut index, updates)?;

        debug!(changes = changes.len(), full_scan, "Baseline updated");
        Ok(changes)
    }
}

/// Classifies one path and queues the matching baseline update.
fn classify(set: &mut ChangeSet, rel: &str, live: Option<FileRecord>, prev: Option<&FileRecord>) {
    match (live, prev) {
        (None, None) => {}
        (None, Some(prev)) => {
            set.changes
                .push(ChangeRecord::new(rel, ChangeKind::Deleted, Some(prev.clone())));
            set.updates.push(PendingUpdate::Delete {
                rel: rel.to_string(),
            });
        }
        (Some(live), prev) => {
            let kind = match prev {
                None => ChangeKind::Added,
                Some(prev) if *prev != live => ChangeKind::Modified,
                Some(_) => return,
            };
            set.changes
                .push(ChangeRecord::new(rel, kind, Some(live.clone())));
            set.updates.push(PendingUpdate::Upsert {
                rel: rel.to_string(),
                record: live,
            });
        }
    }
}

/// Reads a file for diffing, refusing oversized or binary content.
fn read_text(path: &Path, max_bytes: u64) -> io::Result<Side> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Side::Absent),
        Err(err) => return Err(err),
    };
    let size = meta.len();
    if size > max_bytes {
        return Ok(Side::Skipped {
            reason: SkipReason::TooLarge,
            size,
        });
    }

    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Side::Absent),
        Err(err) => return Err(err),
    };
    if data.contains(&0) {
        return Ok(Side::Skipped {
            reason: SkipReason::Binary,
            size,
        });
    }
    Ok(Side::Text(String::from_utf8_lossy(&data).into_owned()))
}

/// Renders a unified diff with `rel` as both file headers.
#[must_use]
pub fn unified_diff(rel: &str, old: &str, new: &str) -> String {
    let diff = TextDiff::from_lines(old, new);
    diff.unified_diff()
        .context_radius(DIFF_CONTEXT_LINES)
        .header(rel, rel)
        .to_string()
}

/// Cuts `text` to at most `max_bytes`, backing off to a char boundary.
#[must_use]
pub fn truncate_at_boundary(mut text: String, max_bytes: usize) -> (String, bool) {
    if text.len() <= max_bytes {
        return (text, false);
    }
    let mut cut = max_bytes;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    (text, true)
}
