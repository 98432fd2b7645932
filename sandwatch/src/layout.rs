//! Locations of everything Sandwatch persists.
//!
//! ```text
//! <source>/.sandwatch/state.json
//! <source>/.sandwatch/sandboxes/<id>/
//! <sandbox>/.sandwatch/{meta.json, status.json}
//! <sandbox>/.sandwatch/session/{session.json, baseline/, baseline-index.json,
//!                               journal.ndjson, last_run.json, context.md,
//!                               context.compact.md, intent.md}
//! ```

use std::path::{Path, PathBuf};

use crate::config::CONTROL_DIR;

/// Control paths rooted at a source tree.
#[derive(Debug, Clone)]
pub struct SourceLayout {
    root: PathBuf,
}

impl SourceLayout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn control_dir(&self) -> PathBuf {
        self.root.join(CONTROL_DIR)
    }

    /// Registry file.
    #[must_use]
    pub fn state_file(&self) -> PathBuf {
        self.control_dir().join("state.json")
    }

    /// Directory holding default sandbox locations.
    #[must_use]
    pub fn sandboxes_dir(&self) -> PathBuf {
        self.control_dir().join("sandboxes")
    }
}

/// Control paths rooted at a sandbox.
#[derive(Debug, Clone)]
pub struct SandboxLayout {
    root: PathBuf,
}

impl SandboxLayout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn control_dir(&self) -> PathBuf {
        self.root.join(CONTROL_DIR)
    }

    #[must_use]
    pub fn meta_file(&self) -> PathBuf {
        self.control_dir().join("meta.json")
    }

    #[must_use]
    pub fn status_file(&self) -> PathBuf {
        self.control_dir().join("status.json")
    }

    #[must_use]
    pub fn session_dir(&self) -> PathBuf {
        self.control_dir().join("session")
    }

    #[must_use]
    pub fn session_file(&self) -> PathBuf {
        self.session_dir().join("session.json")
    }

    /// Mirrored baseline tree.
    #[must_use]
    pub fn baseline_dir(&self) -> PathBuf {
        self.session_dir().join("baseline")
    }

    #[must_use]
    pub fn baseline_index(&self) -> PathBuf {
        self.session_dir().join("baseline-index.json")
    }

    #[must_use]
    pub fn journal_file(&self) -> PathBuf {
        self.session_dir().join("journal.ndjson")
    }

    #[must_use]
    pub fn last_run_file(&self) -> PathBuf {
        self.session_dir().join("last_run.json")
    }

    #[must_use]
    pub fn context_file(&self) -> PathBuf {
        self.session_dir().join("context.md")
    }

    #[must_use]
    pub fn compact_context_file(&self) -> PathBuf {
        self.session_dir().join("context.compact.md")
    }

    #[must_use]
    pub fn intent_file(&self) -> PathBuf {
        self.session_dir().join("intent.md")
    }
}
