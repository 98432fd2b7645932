//! Sandwatch - sandboxed watch-and-run with change tracking.
//!
//! Sandwatch copies a source tree into a sandbox, re-runs a set of build or
//! test commands whenever the sandbox changes, and tracks every file
//! mutation against a content-hash baseline. After each run it records what
//! changed (with unified diffs) and how the commands finished, so a human or
//! a coding agent can read the result and apply the sandbox back onto the
//! source tree once a run succeeds.
//!
//! # Overview
//!
//! - [`create_sandbox`] / [`resolve_sandbox`] / [`clean_sandboxes`] manage
//!   sandboxes and the per-source registry
//! - [`start_watching`] runs the watch loop until shut down
//! - [`apply_sandbox`] copies the sandbox back, gated on the last run
//! - [`export_context`] and [`append_intent_note`] read and extend the
//!   session record
//!
//! # Modules
//!
//! - [`config`]: Configuration file, defaults and environment overrides
//! - [`error`]: Error types
//! - [`types`]: Persisted records and events
//! - [`ignore`]: Glob-based ignore and watch predicates
//! - [`tree`]: Tree walking, hashing and copying
//! - [`layout`]: Locations of persisted files
//! - [`store`]: JSON file helpers
//! - [`sandbox`]: Sandbox creation, lookup and cleanup
//! - [`apply`]: Copying a sandbox back onto its source
//! - [`baseline`]: Baseline mirror and change detection
//! - [`capture`]: Bounded command output capture
//! - [`runner`]: Run scheduling and process supervision
//! - [`journal`]: Append-only event journal
//! - [`context`]: Full, compact and structured renderings
//! - [`session`]: Per-sandbox recording session
//! - [`watcher`]: File system watcher
//! - [`service`]: The watch loop
//! - [`utils`]: Debouncing and text helpers

pub mod apply;
pub mod baseline;
pub mod capture;
pub mod config;
pub mod context;
pub mod error;
pub mod ignore;
pub mod journal;
pub mod layout;
pub mod runner;
pub mod sandbox;
pub mod service;
pub mod session;
pub mod store;
pub mod tree;
pub mod types;
pub mod utils;
pub mod watcher;

pub use apply::{apply_sandbox, ApplyReport};
pub use baseline::BaselineStore;
pub use config::{CommandSpec, Config, ConfigError};
pub use context::ContextFormat;
pub use error::{Result, SandwatchError};
pub use runner::{RunOutcome, RunRecorder, Supervisor, SupervisorHandle};
pub use sandbox::{clean_sandboxes, create_sandbox, resolve_sandbox};
pub use service::start_watching;
pub use session::{
    append_intent_note, export_context, last_run_diff, record_apply, LastRunDiff, Session,
};
pub use types::{ChangeHint, ChangeKind, ChangeRecord, JournalEvent, RunRecord};
pub use watcher::{SandboxWatcher, WatcherError};
