//! End-to-end recording tests: supervisor runs feeding a tracking session.
//!
//! # Flow Tested
//!
//! sandbox edit -> run -> baseline diff -> journal, last run, contexts

#![cfg(unix)]

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use sandwatch::config::{CommandSpec, Config};
use sandwatch::context::ContextFormat;
use sandwatch::journal::Journal;
use sandwatch::layout::SandboxLayout;
use sandwatch::runner::{RunOutcome, Supervisor};
use sandwatch::session::{append_intent_note, export_context, Session};
use sandwatch::types::{ChangeHint, ChangeKind, JournalEvent};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;

// =============================================================================
// Test Helpers
// =============================================================================

fn config_with(commands: &[(&str, &str)]) -> Config {
    Config {
        commands: commands
            .iter()
            .map(|(name, cmd)| CommandSpec::new(*name, *cmd))
            .collect(),
        ..Config::default()
    }
}

async fn next_report(rx: &mut mpsc::UnboundedReceiver<RunOutcome>) -> RunOutcome {
    timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("run finished in time")
        .expect("report channel open")
}

// =============================================================================
// Recording
// =============================================================================

#[tokio::test]
async fn test_failed_run_is_recorded_with_diff_and_outputs() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("a.txt"), "hello\n").unwrap();
    let config = config_with(&[
        ("build", "echo building"),
        ("test", "echo 'assertion failed' >&2; exit 1"),
    ]);

    let session = Session::init(dir.path(), &config, Some("codex".to_string())).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = Supervisor::new(dir.path().to_path_buf(), &config)
        .with_recorder(Arc::new(session))
        .with_reports(tx)
        .spawn();

    fs::write(dir.path().join("a.txt"), "hello world\n").unwrap();
    fs::write(dir.path().join("b.txt"), "new\n").unwrap();
    handle.request_run(ChangeHint::full()).await.unwrap();
    let outcome = next_report(&mut rx).await;
    assert!(!outcome.ok);

    let journal = Journal::new(dir.path());
    let events = journal.read_all().unwrap();
    assert_eq!(events.len(), 1);
    let JournalEvent::Run(run) = &events[0] else {
        panic!("expected a run event");
    };
    assert_eq!(run.agent.as_deref(), Some("codex"));
    let summary: Vec<_> = run.changes.iter().map(|c| (c.path.as_str(), c.kind)).collect();
    assert_eq!(
        summary,
        [("a.txt", ChangeKind::Modified), ("b.txt", ChangeKind::Added)]
    );
    assert!(run.changes.iter().all(|c| c.diff.is_some()));

    let outputs = run.outputs.as_ref().unwrap();
    assert_eq!(outputs["build"].stdout, "building\n");
    assert_eq!(outputs["test"].stderr, "assertion failed\n");

    let layout = SandboxLayout::new(dir.path());
    let compact = fs::read_to_string(layout.compact_context_file()).unwrap();
    assert!(compact.contains("Failed Command: test (exit 1)"));
    assert!(compact.contains("- test stderr:\n```\nassertion failed\n```"));

    let full = fs::read_to_string(layout.context_file()).unwrap();
    assert!(full.contains("Agent: codex"));
    assert!(full.contains("- modified: a.txt\n```diff\n"));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_consecutive_runs_only_report_new_changes() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("a.txt"), "one\n").unwrap();
    let config = config_with(&[("check", "true")]);

    let session = Session::init(dir.path(), &config, None).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = Supervisor::new(dir.path().to_path_buf(), &config)
        .with_recorder(Arc::new(session))
        .with_reports(tx)
        .spawn();

    fs::write(dir.path().join("a.txt"), "two\n").unwrap();
    handle.request_run(ChangeHint::from_paths(["a.txt"])).await.unwrap();
    next_report(&mut rx).await;

    handle.request_run(ChangeHint::full()).await.unwrap();
    next_report(&mut rx).await;

    let runs: Vec<_> = Journal::new(dir.path())
        .read_all()
        .unwrap()
        .into_iter()
        .filter_map(|event| match event {
            JournalEvent::Run(run) => Some(run),
            _ => None,
        })
        .collect();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].changes.len(), 1);
    assert!(runs[1].changes.is_empty());
    assert!(runs[1].ok);

    handle.shutdown().await.unwrap();
}

// =============================================================================
// Export
// =============================================================================

#[tokio::test]
async fn test_export_reflects_notes_and_last_run() {
    let dir = TempDir::new().unwrap();
    let config = config_with(&[("check", "true")]);

    let session = Session::init(dir.path(), &config, None).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = Supervisor::new(dir.path().to_path_buf(), &config)
        .with_recorder(Arc::new(session))
        .with_reports(tx)
        .spawn();
    handle.request_run(ChangeHint::full()).await.unwrap();
    next_report(&mut rx).await;
    handle.shutdown().await.unwrap();

    append_intent_note(dir.path(), &config, None, "make parser streaming").unwrap();

    let compact = export_context(dir.path(), &config, None, ContextFormat::Compact).unwrap();
    assert!(compact.contains("Last Run: ok"));
    assert!(compact.contains("Intent Notes:\nmake parser streaming"));
    assert!(compact.contains("- commands: check"));

    let structured = export_context(dir.path(), &config, None, ContextFormat::Structured).unwrap();
    let value: serde_json::Value = serde_json::from_str(&structured).unwrap();
    assert_eq!(value["lastRun"]["ok"], true);
    assert_eq!(value["intent"], "make parser streaming");
}
