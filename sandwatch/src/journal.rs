//! Append-only journal, last-run snapshot and intent notes.
//!
//! The journal (`journal.ndjson`) holds one JSON event per line in arrival
//! order. Lines are only ever appended; nothing here rewrites or compacts
//! earlier entries.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::Result;
use crate::layout::SandboxLayout;
use crate::store::{read_json, write_json};
use crate::types::{JournalEvent, RunRecord};

/// Journal files of one sandbox session.
#[derive(Debug, Clone)]
pub struct Journal {
    journal_path: PathBuf,
    last_run_path: PathBuf,
    intent_path: PathBuf,
}

impl Journal {
    #[must_use]
    pub fn new(sandbox_root: &Path) -> Self {
        let layout = SandboxLayout::new(sandbox_root);
        Self {
            journal_path: layout.journal_file(),
            last_run_path: layout.last_run_file(),
            intent_path: layout.intent_file(),
        }
    }

    /// Path of the ndjson log.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.journal_path
    }

    /// Appends one event as a single line.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn append(&self, event: &JournalEvent) -> Result<()> {
        let line = serde_json::to_string(event)?;
        append_line(&self.journal_path, &line)?;
        Ok(())
    }

    /// Reads every parseable event in order. Corrupt lines are skipped.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the journal exists but cannot be read.
    pub fn read_all(&self) -> Result<Vec<JournalEvent>> {
        let raw = match fs::read_to_string(&self.journal_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut events = Vec::new();
        for (number, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(event) => events.push(event),
                Err(e) => warn!(line = number + 1, error = %e, "Skipping corrupt journal line"),
            }
        }
        Ok(events)
    }

    /// Overwrites the last-run snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub fn write_last_run(&self, run: &RunRecord) -> Result<()> {
        write_json(&self.last_run_path, run)
    }

    /// Reads the last-run snapshot, if present and valid.
    #[must_use]
    pub fn last_run(&self) -> Option<RunRecord> {
        read_json(&self.last_run_path)
    }

    /// Appends one intent note line.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the notes file cannot be written.
    pub fn append_intent(&self, note: &str) -> Result<()> {
        append_line(&self.intent_path, note)?;
        Ok(())
    }

    /// Returns all intent notes, or an empty string.
    #[must_use]
    pub fn intent(&self) -> String {
        fs::read_to_string(&self.intent_path).unwrap_or_default()
    }
}

fn append_line(path: &Path, line: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn intent(note: &str) -> JournalEvent {
        JournalEvent::Intent {
            timestamp: Utc::now(),
            agent: None,
            note: note.to_string(),
        }
    }

    #[test]
    fn events_append_in_order() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::new(dir.path());

        journal.append(&intent("first")).unwrap();
        journal.append(&intent("second")).unwrap();

        let raw = fs::read_to_string(journal.path()).unwrap();
        assert_eq!(raw.lines().count(), 2);

        let events = journal.read_all().unwrap();
        assert!(matches!(&events[0], JournalEvent::Intent { note, .. } if note == "first"));
        assert!(matches!(&events[1], JournalEvent::Intent { note, .. } if note == "second"));
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::new(dir.path());
        journal.append(&intent("ok")).unwrap();
        append_line(journal.path(), "{ truncated").unwrap();
        journal.append(&intent("after")).unwrap();

        assert_eq!(journal.read_all().unwrap().len(), 2);
    }

    #[test]
    fn missing_journal_is_empty() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::new(dir.path());
        assert!(journal.read_all().unwrap().is_empty());
        assert!(journal.last_run().is_none());
        assert_eq!(journal.intent(), "");
    }

    #[test]
    fn intent_notes_accumulate() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::new(dir.path());
        journal.append_intent("refactor parser").unwrap();
        journal.append_intent("then fix tests").unwrap();
        assert_eq!(journal.intent(), "refactor parser\nthen fix tests\n");
    }
}
