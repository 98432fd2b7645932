//! Error types for Sandwatch.
//!
//! This module defines the crate-level error enum. Subsystems with their own
//! failure modes (configuration, file watching) keep dedicated error types and
//! convert into [`SandwatchError`] via `#[from]`.
//!
//! Two variants are *precondition* errors rather than failures:
//! [`SandwatchError::NoSandbox`] and [`SandwatchError::ApplyRefused`]. They are
//! raised before any mutation happens so callers can explain the remediation.

use thiserror::Error;

use crate::config::ConfigError;
use crate::watcher::WatcherError;

/// Errors that can occur during Sandwatch operations.
///
/// A non-zero exit code from a configured command is *not* an error; it is
/// recorded in the run outcome. Only a failure to spawn the command at all
/// surfaces here as [`SandwatchError::Spawn`].
#[derive(Error, Debug)]
pub enum SandwatchError {
    /// Configuration-related error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// File system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing or serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Directory traversal error.
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),

    /// An ignore or watch pattern could not be compiled.
    #[error("invalid glob pattern: {0}")]
    Glob(#[from] globset::Error),

    /// File watching error.
    #[error("file watch error: {0}")]
    Watch(#[from] WatcherError),

    /// No sandbox exists for the source tree and none was given explicitly.
    #[error("no sandbox found; run `sandwatch start` first or pass --sandbox")]
    NoSandbox,

    /// Apply was refused because the last recorded run is not a success.
    #[error("refusing to apply changes: {reason}")]
    ApplyRefused {
        /// Why the gate rejected the apply.
        reason: String,
    },

    /// A configured command could not be spawned.
    #[error("failed to spawn command '{name}': {source}")]
    Spawn {
        /// Configured command name.
        name: String,
        /// Underlying spawn failure.
        #[source]
        source: std::io::Error,
    },

    /// The run supervisor task stopped unexpectedly.
    #[error("run supervisor stopped")]
    SupervisorStopped,
}

/// A specialized `Result` type for Sandwatch operations.
pub type Result<T> = std::result::Result<T, SandwatchError>;
