//! Per-sandbox tracking session.
//!
//! Ties the baseline engine, the journal and the context renderers together:
//! a [`Session`] is created once when watching starts and then records every
//! finished run. The free functions cover the one-shot operations that do
//! not need a live session (notes, exports, apply events).

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::baseline::BaselineStore;
use crate::config::Config;
use crate::context::{render_compact, render_full, render_structured, ContextFormat, ContextHeader};
use crate::error::Result;
use crate::journal::Journal;
use crate::layout::SandboxLayout;
use crate::runner::{RunOutcome, RunRecorder};
use crate::sandbox::read_meta;
use crate::store::{read_json, write_json};
use crate::types::{JournalEvent, RunRecord, SessionDescriptor};

/// Reads the session descriptor, if present and valid.
#[must_use]
pub fn read_descriptor(sandbox_root: &Path) -> Option<SessionDescriptor> {
    read_json(&SandboxLayout::new(sandbox_root).session_file())
}

/// Recording state for one sandbox.
#[derive(Debug)]
pub struct Session {
    layout: SandboxLayout,
    config: Config,
    agent: Option<String>,
    source_root: Option<PathBuf>,
    journal: Journal,
    baseline: Option<BaselineStore>,
}

impl Session {
    /// Prepares tracking for `sandbox_root`.
    ///
    /// Writes the session descriptor on first use and creates the baseline
    /// when enabled. With tracking disabled this touches nothing on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor or the baseline cannot be written.
    pub fn init(sandbox_root: &Path, config: &Config, agent: Option<String>) -> Result<Self> {
        let layout = SandboxLayout::new(sandbox_root);
        let source_root = read_meta(sandbox_root).map(|meta| meta.source_root);
        let tracking = &config.tracking;

        let baseline = if tracking.enabled && tracking.baseline {
            Some(BaselineStore::new(sandbox_root, config)?)
        } else {
            None
        };

        let session = Self {
            journal: Journal::new(sandbox_root),
            layout,
            config: config.clone(),
            agent,
            source_root,
            baseline,
        };

        if !tracking.enabled {
            debug!("Tracking disabled, session not initialised");
            return Ok(session);
        }

        if read_descriptor(sandbox_root).is_none() {
            let descriptor = SessionDescriptor {
                id: Uuid::new_v4(),
                created_at: Utc::now(),
                sandbox_root: sandbox_root.to_path_buf(),
                source_root: session.source_root.clone(),
                agent: session.agent.clone(),
                config: config.clone(),
            };
            write_json(&session.layout.session_file(), &descriptor)?;
            info!(session_id = %descriptor.id, "Session started");
        }

        if let Some(store) = &session.baseline {
            store.ensure()?;
        }
        Ok(session)
    }

    /// Sandbox this session records.
    #[must_use]
    pub fn sandbox_root(&self) -> &Path {
        self.layout.root()
    }

    fn header(&self) -> ContextHeader<'_> {
        ContextHeader {
            sandbox_root: self.layout.root(),
            source_root: self.source_root.as_deref(),
            agent: self.agent.as_deref(),
        }
    }

    /// Turns a run outcome into a persisted run record.
    ///
    /// Order: compute and diff changes, update the baseline, append the
    /// journal event, write the last-run snapshot, render contexts.
    ///
    /// # Errors
    ///
    /// Returns an error if any tracking artifact cannot be written.
    pub fn record(&self, outcome: &RunOutcome) -> Result<Option<RunRecord>> {
        let tracking = &self.config.tracking;
        if !tracking.enabled {
            return Ok(None);
        }

        let changes = match &self.baseline {
            Some(store) => store.record(Some(&outcome.hint), tracking.verbose)?,
            None => Vec::new(),
        };

        let record = RunRecord {
            run_id: outcome.run_id,
            timestamp: outcome.started_at,
            agent: self.agent.clone(),
            ok: outcome.ok,
            interrupted: outcome.interrupted,
            duration_ms: outcome.duration_ms,
            exits: outcome.exits.clone(),
            changes,
            outputs: outcome.outputs.clone(),
        };

        if tracking.journal {
            self.journal.append(&JournalEvent::Run(record.clone()))?;
        }
        self.journal.write_last_run(&record)?;

        let intent = self.journal.intent();
        let header = self.header();
        fs::write(
            self.layout.context_file(),
            render_full(&header, Some(&record), &intent, &self.config),
        )?;
        if tracking.compact.enabled {
            fs::write(
                self.layout.compact_context_file(),
                render_compact(&header, Some(&record), &intent, &self.config),
            )?;
        }

        info!(
            run_id = record.run_id,
            changes = record.changes.len(),
            "Run recorded"
        );
        Ok(Some(record))
    }
}

impl RunRecorder for Session {
    fn record_run(&self, outcome: &RunOutcome) -> Result<()> {
        self.record(outcome).map(|_| ())
    }
}

/// Appends an intent note and journals it.
///
/// Returns `false` without writing when tracking or notes are disabled.
///
/// # Errors
///
/// Returns an error if the notes file or journal cannot be written.
pub fn append_intent_note(
    sandbox_root: &Path,
    config: &Config,
    agent: Option<&str>,
    note: &str,
) -> Result<bool> {
    let tracking = &config.tracking;
    if !tracking.enabled || !tracking.intent_notes {
        return Ok(false);
    }

    let journal = Journal::new(sandbox_root);
    journal.append_intent(note)?;
    if tracking.journal {
        journal.append(&JournalEvent::Intent {
            timestamp: Utc::now(),
            agent: agent.map(str::to_string),
            note: note.to_string(),
        })?;
    }
    Ok(true)
}

/// Journals a completed apply onto `target_root`.
///
/// # Errors
///
/// Returns an error if the journal cannot be written.
pub fn record_apply(
    sandbox_root: &Path,
    config: &Config,
    agent: Option<&str>,
    target_root: &Path,
) -> Result<()> {
    if !config.tracking.enabled || !config.tracking.journal {
        return Ok(());
    }
    Journal::new(sandbox_root).append(&JournalEvent::Apply {
        timestamp: Utc::now(),
        agent: agent.map(str::to_string),
        target_root: target_root.to_path_buf(),
    })
}

/// Renders the current context of `sandbox_root` in `format`.
///
/// Text formats are re-rendered from the last-run snapshot and also written
/// back to their context file.
///
/// # Errors
///
/// Returns an error if rendering or writing the context file fails.
pub fn export_context(
    sandbox_root: &Path,
    config: &Config,
    agent: Option<&str>,
    format: ContextFormat,
) -> Result<String> {
    let layout = SandboxLayout::new(sandbox_root);
    let journal = Journal::new(sandbox_root);
    let last_run = journal.last_run();
    let intent = journal.intent();
    let descriptor = read_descriptor(sandbox_root);
    let agent = agent.or_else(|| descriptor.as_ref().and_then(|d| d.agent.as_deref()));
    let source_root = read_meta(sandbox_root).map(|meta| meta.source_root);

    let header = ContextHeader {
        sandbox_root,
        source_root: source_root.as_deref(),
        agent,
    };

    let (text, target) = match format {
        ContextFormat::Structured => {
            return render_structured(descriptor.as_ref(), last_run.as_ref(), &intent, agent);
        }
        ContextFormat::Full => (
            render_full(&header, last_run.as_ref(), &intent, config),
            layout.context_file(),
        ),
        ContextFormat::Compact => (
            render_compact(&header, last_run.as_ref(), &intent, config),
            layout.compact_context_file(),
        ),
    };

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&target, &text)?;
    Ok(text)
}

/// Patch of the most recent recorded run, or why there is none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LastRunDiff {
    Patch(String),
    Unavailable(&'static str),
}

/// Concatenates the diffs recorded for the last run.
///
/// Changes without a diff (skipped files, or runs recorded with `verbose`
/// off) are left out.
#[must_use]
pub fn last_run_diff(sandbox_root: &Path, config: &Config) -> LastRunDiff {
    if !config.tracking.enabled {
        return LastRunDiff::Unavailable("Change tracking is disabled; no diffs available");
    }
    let Some(run) = Journal::new(sandbox_root).last_run() else {
        return LastRunDiff::Unavailable("No runs recorded yet");
    };

    let mut patch = String::new();
    for diff in run.changes.iter().filter_map(|c| c.diff.as_deref()) {
        patch.push_str(diff);
        if !patch.ends_with('\n') {
            patch.push('\n');
        }
    }

    if patch.is_empty() {
        LastRunDiff::Unavailable(if run.changes.is_empty() {
            "Last run recorded no changes"
        } else {
            "No diffs were recorded for the last run"
        })
    } else {
        LastRunDiff::Patch(patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChangeHint, ChangeKind, ExitRecord};
    use tempfile::TempDir;

    fn outcome(run_id: u64, hint: ChangeHint) -> RunOutcome {
        RunOutcome {
            run_id,
            started_at: Utc::now(),
            ok: true,
            interrupted: false,
            duration_ms: 5,
            exits: vec![ExitRecord {
                name: "build".to_string(),
                code: Some(0),
                signal: None,
            }],
            outputs: None,
            hint,
        }
    }

    #[test]
    fn init_writes_descriptor_and_baseline_once() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "hello\n").unwrap();

        Session::init(dir.path(), &Config::default(), Some("codex".to_string())).unwrap();
        let first = read_descriptor(dir.path()).unwrap();
        assert_eq!(first.agent.as_deref(), Some("codex"));

        let layout = SandboxLayout::new(dir.path());
        assert!(layout.baseline_dir().join("a.txt").is_file());

        Session::init(dir.path(), &Config::default(), None).unwrap();
        assert_eq!(read_descriptor(dir.path()).unwrap().id, first.id);
    }

    #[test]
    fn record_writes_every_artifact() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "hello\n").unwrap();
        let session = Session::init(dir.path(), &Config::default(), None).unwrap();

        fs::write(dir.path().join("a.txt"), "hello world\n").unwrap();
        let record = session
            .record(&outcome(1, ChangeHint::from_paths(["a.txt"])))
            .unwrap()
            .unwrap();

        assert_eq!(record.changes.len(), 1);
        assert_eq!(record.changes[0].kind, ChangeKind::Modified);
        assert!(record.changes[0].diff.as_deref().unwrap().contains("+hello world"));

        let layout = SandboxLayout::new(dir.path());
        let journal = Journal::new(dir.path());
        assert_eq!(journal.read_all().unwrap().len(), 1);
        assert_eq!(journal.last_run(), Some(record));
        assert!(fs::read_to_string(layout.context_file())
            .unwrap()
            .contains("- modified: a.txt"));
        assert!(layout.compact_context_file().is_file());
    }

    #[test]
    fn disabled_tracking_records_nothing() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.tracking.enabled = false;

        let session = Session::init(dir.path(), &config, None).unwrap();
        assert!(session.record(&outcome(1, ChangeHint::full())).unwrap().is_none());
        assert!(!SandboxLayout::new(dir.path()).session_dir().exists());
        assert!(!append_intent_note(dir.path(), &config, None, "note").unwrap());
    }

    #[test]
    fn journal_switch_keeps_snapshot() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.tracking.journal = false;
        config.tracking.compact.enabled = false;

        let session = Session::init(dir.path(), &config, None).unwrap();
        session.record(&outcome(1, ChangeHint::full())).unwrap();

        let journal = Journal::new(dir.path());
        assert!(journal.read_all().unwrap().is_empty());
        assert!(journal.last_run().is_some());
        assert!(!SandboxLayout::new(dir.path()).compact_context_file().exists());
    }

    #[test]
    fn notes_and_apply_events_are_journaled() {
        let dir = TempDir::new().unwrap();
        let config = Config::default();

        assert!(append_intent_note(dir.path(), &config, Some("codex"), "split module").unwrap());
        record_apply(dir.path(), &config, None, Path::new("/src")).unwrap();

        let events = Journal::new(dir.path()).read_all().unwrap();
        let labels: Vec<_> = events.iter().map(JournalEvent::label).collect();
        assert_eq!(labels, ["intent", "apply"]);

        let text = export_context(dir.path(), &config, None, ContextFormat::Full).unwrap();
        assert!(text.contains("## Intent Notes\nsplit module"));
    }

    #[test]
    fn structured_export_bundles_session() {
        let dir = TempDir::new().unwrap();
        let session = Session::init(dir.path(), &Config::default(), Some("codex".to_string())).unwrap();
        session.record(&outcome(3, ChangeHint::full())).unwrap();

        let text = export_context(dir.path(), &Config::default(), None, ContextFormat::Structured).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["lastRun"]["runId"], 3);
        assert_eq!(value["agent"], "codex");
        assert!(value["session"]["id"].is_string());
    }

    #[test]
    fn last_run_diff_joins_recorded_patches() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "hello\n").unwrap();
        let config = Config::default();
        assert_eq!(
            last_run_diff(dir.path(), &config),
            LastRunDiff::Unavailable("No runs recorded yet")
        );

        let session = Session::init(dir.path(), &config, None).unwrap();
        fs::write(dir.path().join("a.txt"), "hello world\n").unwrap();
        fs::write(dir.path().join("b.txt"), "new\n").unwrap();
        session.record(&outcome(1, ChangeHint::full())).unwrap();

        let LastRunDiff::Patch(patch) = last_run_diff(dir.path(), &config) else {
            panic!("expected a patch");
        };
        assert!(patch.starts_with("--- a.txt\n+++ a.txt\n"));
        assert!(patch.contains("+hello world\n"));
        assert!(patch.contains("--- b.txt\n+++ b.txt\n"));
        assert!(patch.ends_with("+new\n"));

        session.record(&outcome(2, ChangeHint::full())).unwrap();
        assert_eq!(
            last_run_diff(dir.path(), &config),
            LastRunDiff::Unavailable("Last run recorded no changes")
        );
    }

    #[test]
    fn last_run_diff_without_verbose_tracking_has_no_patch() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.tracking.verbose = false;

        let session = Session::init(dir.path(), &config, None).unwrap();
        fs::write(dir.path().join("c.txt"), "c\n").unwrap();
        session.record(&outcome(1, ChangeHint::full())).unwrap();

        assert_eq!(
            last_run_diff(dir.path(), &config),
            LastRunDiff::Unavailable("No diffs were recorded for the last run")
        );

        config.tracking.enabled = false;
        assert!(matches!(
            last_run_diff(dir.path(), &config),
            LastRunDiff::Unavailable(_)
        ));
    }
}
