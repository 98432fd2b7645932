//! Sandbox file watcher producing change-hint events.
//!
//! Watches a sandbox recursively and turns raw file system notifications into
//! [`HintEvent`]s for the debouncer:
//!
//! - a file-level change under a watched, non-ignored path becomes
//!   [`HintEvent::Path`] with its sandbox-relative path
//! - a directory-level change becomes [`HintEvent::FullScan`] (or
//!   [`HintEvent::Trigger`] when directory events should not force a rescan)
//! - metadata and access notifications are dropped
//!
//! # Architecture
//!
//! The notify callback is kept lightweight: it only tags each path as a
//! directory event or an entry event and forwards it through an internal
//! channel. A dedicated async task does the file system checks and pattern
//! matching.
//!
//! # Example
//!
//! ```no_run
//! use std::path::PathBuf;
//! use tokio::sync::mpsc;
//! use sandwatch::config::Config;
//! use sandwatch::watcher::SandboxWatcher;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (tx, mut rx) = mpsc::channel(100);
//!     let _watcher = SandboxWatcher::new(PathBuf::from("/tmp/sandbox"), &Config::default(), tx)?;
//!
//!     while let Some(event) = rx.recv().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use notify::{
    event::{CreateKind, ModifyKind, RemoveKind},
    Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::ignore::{IgnoreRules, WatchRules};
use crate::tree::relative_path;
use crate::utils::debounce::HintEvent;

/// Capacity of the channel between the notify callback and the async task.
const INTERNAL_CHANNEL_CAPACITY: usize = 1000;

/// Raw notifications tagged by the callback.
#[derive(Debug, Clone, PartialEq, Eq)]
enum InternalEvent {
    /// Something happened to an entry of unknown kind.
    Entry(PathBuf),
    /// A directory was created or removed.
    Dir(PathBuf),
}

/// Errors that can occur during file watching operations.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// Failed to initialize the file system watcher.
    #[error("failed to create watcher: {0}")]
    WatcherInit(#[from] notify::Error),

    /// Failed to resolve the sandbox root.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The sandbox directory does not exist or is inaccessible.
    #[error("watch directory does not exist: {0}")]
    DirectoryNotFound(PathBuf),

    /// A watch or ignore pattern could not be compiled.
    #[error("invalid pattern: {0}")]
    Pattern(#[from] globset::Error),
}

/// Result type for watcher operations.
pub type Result<T> = std::result::Result<T, WatcherError>;

/// Matching rules applied to every notification.
#[derive(Debug, Clone)]
struct Filter {
    root: PathBuf,
    ignore: IgnoreRules,
    watch: WatchRules,
    scan_all_on_dir_change: bool,
}

impl Filter {
    /// Maps one internal event to a hint event, or `None` if irrelevant.
    fn classify(&self, event: &InternalEvent) -> Option<HintEvent> {
        let (path, is_dir_event) = match event {
            InternalEvent::Dir(path) => (path, true),
            InternalEvent::Entry(path) => {
                let is_dir = fs::symlink_metadata(path).is_ok_and(|m| m.is_dir());
                (path, is_dir)
            }
        };

        let rel = relative_path(&self.root, path)?;
        if rel.is_empty() || self.ignore.is_ignored(&rel) {
            return None;
        }

        if is_dir_event {
            return Some(if self.scan_all_on_dir_change {
                HintEvent::FullScan
            } else {
                HintEvent::Trigger
            });
        }

        self.watch.is_watched(&rel).then_some(HintEvent::Path(rel))
    }
}

/// Recursive watcher over one sandbox.
///
/// Dropping the watcher stops the subscription; the processing task exits
/// once the notify side is gone.
#[derive(Debug)]
pub struct SandboxWatcher {
    /// Kept alive to maintain the watch subscription.
    #[allow(dead_code)]
    watcher: RecommendedWatcher,

    root: PathBuf,
}

impl SandboxWatcher {
    /// Starts watching `sandbox_root`, sending hint events to `event_sender`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory does not exist, a pattern is
    /// malformed, or the notify backend cannot be initialized.
    pub fn new(
        sandbox_root: PathBuf,
        config: &Config,
        event_sender: mpsc::Sender<HintEvent>,
    ) -> Result<Self> {
        if !sandbox_root.is_dir() {
            return Err(WatcherError::DirectoryNotFound(sandbox_root));
        }
        let root = fs::canonicalize(&sandbox_root)?;

        let filter = Filter {
            root: root.clone(),
            ignore: IgnoreRules::new(&config.ignore)?,
            watch: WatchRules::new(&config.watch)?,
            scan_all_on_dir_change: config.tracking.scan_all_on_dir_change,
        };

        let (internal_tx, internal_rx) = mpsc::channel::<InternalEvent>(INTERNAL_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            process_internal_events(internal_rx, filter, event_sender).await;
        });

        let watcher = create_watcher(internal_tx, &root)?;
        info!(sandbox = %root.display(), "Watching sandbox");

        Ok(Self { watcher, root })
    }

    /// Returns the canonical sandbox root being watched.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn create_watcher(internal_tx: mpsc::Sender<InternalEvent>, root: &Path) -> Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |res: std::result::Result<Event, notify::Error>| {
            handle_notify_event(res, &internal_tx);
        },
        NotifyConfig::default(),
    )?;

    watcher.watch(root, RecursiveMode::Recursive)?;
    debug!(root = %root.display(), "Started recursive watch");
    Ok(watcher)
}

/// Tags each path of a notify event. No file system access happens here.
fn handle_notify_event(
    res: std::result::Result<Event, notify::Error>,
    internal_tx: &mpsc::Sender<InternalEvent>,
) {
    let event = match res {
        Ok(event) => event,
        Err(e) => {
            error!(error = %e, "File watcher error");
            return;
        }
    };

    trace!(kind = ?event.kind, paths = ?event.paths, "Received notify event");

    for path in event.paths {
        let internal = match event.kind {
            EventKind::Create(CreateKind::Folder) | EventKind::Remove(RemoveKind::Folder) => {
                InternalEvent::Dir(path)
            }
            EventKind::Create(_)
            | EventKind::Remove(_)
            | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Name(_) | ModifyKind::Any)
            | EventKind::Any => InternalEvent::Entry(path),
            _ => {
                trace!(kind = ?event.kind, "Ignoring event kind");
                continue;
            }
        };

        if let Err(e) = internal_tx.try_send(internal) {
            warn!(error = %e, "Failed to queue internal event, channel may be full");
        }
    }
}

async fn process_internal_events(
    mut rx: mpsc::Receiver<InternalEvent>,
    filter: Filter,
    sender: mpsc::Sender<HintEvent>,
) {
    while let Some(event) = rx.recv().await {
        let Some(hint) = filter.classify(&event) else {
            continue;
        };
        trace!(hint = ?hint, "Forwarding hint event");
        if sender.send(hint).await.is_err() {
            debug!("Hint receiver dropped");
            break;
        }
    }

    debug!("Internal event processor shutting down");
}
