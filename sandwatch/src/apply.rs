//! Propagation of sandbox content back onto its source tree.
//!
//! Apply reads the live sandbox tree (not the baseline) and mirrors every
//! non-ignored file and link onto the target. It is gated on the last
//! recorded run status so a broken build is not copied back by accident.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::{Result, SandwatchError};
use crate::ignore::IgnoreRules;
use crate::layout::SandboxLayout;
use crate::sandbox::read_meta;
use crate::store::read_json;
use crate::tree::{copy_entry, join_rel, relative_path, walk, EntryKind};
use crate::types::RunStatus;

/// Directories never touched by apply in either tree.
const RESERVED_DIRS: &[&str] = &[".git"];

/// Result of a completed apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    /// Tree that received the sandbox content.
    pub target_root: PathBuf,
    /// Files and links written.
    pub copied: usize,
    /// Paths removed by pruning.
    pub pruned: usize,
}

/// Reads the status written after the last run, if any.
#[must_use]
pub fn read_status(sandbox_root: &Path) -> Option<RunStatus> {
    read_json(&SandboxLayout::new(sandbox_root).status_file())
}

/// Checks the success gate without touching anything.
///
/// # Errors
///
/// Returns `SandwatchError::ApplyRefused` when no status exists or the last
/// run did not succeed.
pub fn check_gate(sandbox_root: &Path) -> Result<()> {
    match read_status(sandbox_root) {
        None => Err(SandwatchError::ApplyRefused {
            reason: "no successful run recorded".to_string(),
        }),
        Some(status) if !status.last_run_ok => Err(SandwatchError::ApplyRefused {
            reason: "last run failed or was interrupted".to_string(),
        }),
        Some(_) => Ok(()),
    }
}

/// Copies the sandbox onto its recorded source root.
///
/// The target is the `sourceRoot` from sandbox metadata, or `source_root`
/// when metadata is missing. With `prune`, non-ignored target paths that do
/// not exist in the sandbox are deleted afterwards, deepest first.
///
/// # Errors
///
/// Returns `SandwatchError::ApplyRefused` if `require_success` is set and the
/// gate fails (nothing is written in that case), or an I/O error if syncing
/// fails part way.
pub fn apply_sandbox(
    sandbox_root: &Path,
    source_root: &Path,
    config: &Config,
    require_success: bool,
    prune: bool,
) -> Result<ApplyReport> {
    if require_success {
        check_gate(sandbox_root)?;
    }

    let target_root = read_meta(sandbox_root)
        .map(|meta| meta.source_root)
        .unwrap_or_else(|| source_root.to_path_buf());
    let ignore = IgnoreRules::with_reserved(&config.ignore, RESERVED_DIRS)?;

    let mut seen = HashSet::new();
    let mut copied = 0;
    for entry in walk(sandbox_root, &ignore, None)? {
        let dest = join_rel(&target_root, &entry.rel);
        copy_entry(&entry.path, &dest, entry.kind)?;
        if entry.kind != EntryKind::Dir {
            copied += 1;
        }
        seen.insert(entry.rel);
    }

    let pruned = if prune {
        prune_target(&target_root, &ignore, &seen)?
    } else {
        0
    };

    info!(
        target = %target_root.display(),
        copied,
        pruned,
        "Applied sandbox"
    );
    Ok(ApplyReport {
        target_root,
        copied,
        pruned,
    })
}

/// Removes unseen, non-ignored entries under `target_root`, children first.
///
/// A directory absent from the sandbox is removed together with anything
/// ignored that remains inside it.
fn prune_target(target_root: &Path, ignore: &IgnoreRules, seen: &HashSet<String>) -> Result<usize> {
    let walker = WalkDir::new(target_root)
        .min_depth(1)
        .follow_links(false)
        .contents_first(true)
        .into_iter()
        .filter_entry(|e| {
            relative_path(target_root, e.path()).is_some_and(|rel| !ignore.is_ignored(&rel))
        });

    let mut pruned = 0;
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "Skipping unreadable entry during prune");
                continue;
            }
        };
        let Some(rel) = relative_path(target_root, entry.path()) else {
            continue;
        };
        if seen.contains(&rel) {
            continue;
        }

        let result = if entry.file_type().is_dir() {
            fs::remove_dir_all(entry.path())
        } else {
            fs::remove_file(entry.path())
        };
        match result {
            Ok(()) => {
                debug!(path = %rel, "Pruned");
                pruned += 1;
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(pruned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::write_json;
    use chrono::Utc;
    use tempfile::TempDir;

    fn write_status(sandbox: &Path, ok: bool) {
        let status = RunStatus {
            last_run_at: Utc::now(),
            last_run_ok: ok,
            interrupted: false,
            duration_ms: 1,
            exits: vec![],
        };
        write_json(&SandboxLayout::new(sandbox).status_file(), &status).unwrap();
    }

    #[test]
    fn gate_messages() {
        let sandbox = TempDir::new().unwrap();
        let err = check_gate(sandbox.path()).unwrap_err();
        assert!(err.to_string().contains("no successful run recorded"));

        write_status(sandbox.path(), false);
        let err = check_gate(sandbox.path()).unwrap_err();
        assert!(err.to_string().contains("last run failed"));

        write_status(sandbox.path(), true);
        assert!(check_gate(sandbox.path()).is_ok());
    }

    #[test]
    fn apply_without_gate_falls_back_to_caller_root() {
        let sandbox = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        fs::write(sandbox.path().join("a.txt"), "a").unwrap();

        let report =
            apply_sandbox(sandbox.path(), target.path(), &Config::default(), false, false)
                .unwrap();

        assert_eq!(report.target_root, target.path());
        assert_eq!(report.copied, 1);
        assert_eq!(fs::read_to_string(target.path().join("a.txt")).unwrap(), "a");
    }

    #[test]
    fn git_and_control_dirs_are_left_alone() {
        let sandbox = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        fs::create_dir_all(sandbox.path().join(".git")).unwrap();
        fs::write(sandbox.path().join(".git/HEAD"), "sandbox").unwrap();
        fs::create_dir_all(target.path().join(".git")).unwrap();
        fs::write(target.path().join(".git/HEAD"), "target").unwrap();
        fs::create_dir_all(target.path().join(".sandwatch")).unwrap();
        fs::write(target.path().join(".sandwatch/state.json"), "{}").unwrap();

        let config = Config {
            ignore: Vec::new(),
            ..Config::default()
        };
        apply_sandbox(sandbox.path(), target.path(), &config, false, true).unwrap();

        assert_eq!(fs::read_to_string(target.path().join(".git/HEAD")).unwrap(), "target");
        assert!(target.path().join(".sandwatch/state.json").exists());
    }

    #[test]
    fn prune_removes_empty_leftover_directories() {
        let sandbox = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        fs::create_dir_all(sandbox.path().join("keep")).unwrap();
        fs::write(sandbox.path().join("keep/a.txt"), "a").unwrap();
        fs::create_dir_all(target.path().join("gone/deeper")).unwrap();
        fs::write(target.path().join("gone/deeper/old.txt"), "old").unwrap();
        fs::create_dir_all(target.path().join("keep")).unwrap();
        fs::write(target.path().join("keep/stale.txt"), "").unwrap();

        let report =
            apply_sandbox(sandbox.path(), target.path(), &Config::default(), false, true).unwrap();

        assert!(!target.path().join("gone").exists());
        assert!(!target.path().join("keep/stale.txt").exists());
        assert!(target.path().join("keep/a.txt").exists());
        assert!(report.pruned >= 3);
    }
}
