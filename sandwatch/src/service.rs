//! Watch loop for a sandbox.
//!
//! Wires the pieces together:
//!
//! ```text
//! SandboxWatcher --HintEvent--> HintDebouncer --ChangeHint--> Supervisor --RunOutcome--> Session
//! ```
//!
//! One full-scan run is requested up front; afterwards runs follow file
//! changes until the shutdown future resolves or the supervisor fails.

use std::fs;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::{Result, SandwatchError};
use crate::runner::Supervisor;
use crate::session::Session;
use crate::types::ChangeHint;
use crate::utils::debounce::HintDebouncer;
use crate::watcher::SandboxWatcher;

/// Capacity of the debounced hint channel.
const HINT_CHANNEL_CAPACITY: usize = 16;

/// Watches `sandbox_root` and re-runs the configured commands on change.
///
/// `on_session_init` is called once the session (and its baseline) is ready,
/// before the first run. Returns when `shutdown` resolves, after the active
/// run has been interrupted and recorded.
///
/// # Errors
///
/// Returns an error if the session or watcher cannot be set up, or if the
/// supervisor stops on a spawn or recording failure.
pub async fn start_watching<I, S>(
    sandbox_root: &Path,
    config: &Config,
    agent: Option<String>,
    on_session_init: I,
    shutdown: S,
) -> Result<()>
where
    I: FnOnce(&Session),
    S: Future<Output = ()>,
{
    let root = fs::canonicalize(sandbox_root)?;

    let session = {
        let root = root.clone();
        let config = config.clone();
        tokio::task::spawn_blocking(move || Session::init(&root, &config, agent))
            .await
            .map_err(|e| {
                error!(error = %e, "Session setup panicked");
                SandwatchError::SupervisorStopped
            })??
    };
    on_session_init(&session);

    let mut handle = Supervisor::new(root.clone(), config)
        .with_recorder(Arc::new(session))
        .spawn();

    let (hint_tx, mut hint_rx) = mpsc::channel::<ChangeHint>(HINT_CHANNEL_CAPACITY);
    let debouncer = HintDebouncer::new(Duration::from_millis(config.debounce_ms), hint_tx);
    let watcher = SandboxWatcher::new(root.clone(), config, debouncer.sender())?;

    let requester = handle.requester();
    let forwarder = tokio::spawn(async move {
        while let Some(hint) = hint_rx.recv().await {
            debug!(paths = hint.paths.len(), full_scan = hint.full_scan, "Requesting run");
            if requester.request_run(hint).await.is_err() {
                break;
            }
        }
    });

    handle.request_run(ChangeHint::full()).await?;
    info!(
        sandbox = %root.display(),
        commands = config.commands.len(),
        "Watching for changes"
    );

    tokio::pin!(shutdown);
    let result = tokio::select! {
        () = &mut shutdown => {
            info!("Shutting down");
            Ok(())
        }
        result = handle.wait() => result,
    };

    drop(watcher);
    drop(debouncer);
    forwarder.abort();

    match result {
        Ok(()) => handle.shutdown().await,
        Err(err) => {
            error!(error = %err, "Supervisor stopped");
            Err(err)
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::CommandSpec;
    use crate::journal::Journal;
    use crate::types::JournalEvent;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;
    use tokio::sync::oneshot;
    use tokio::time::{sleep, timeout};

    async fn wait_for_runs(journal: &Journal, count: usize) {
        timeout(Duration::from_secs(10), async {
            loop {
                if journal.read_all().map(|e| e.len()).unwrap_or(0) >= count {
                    return;
                }
                sleep(Duration::from_millis(25)).await;
            }
        })
        .await
        .expect("runs recorded in time");
    }

    #[tokio::test]
    async fn initial_run_then_change_run() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "hello\n").unwrap();
        let config = Config {
            commands: vec![CommandSpec::new("check", "true")],
            debounce_ms: 30,
            ..Config::default()
        };

        let initialised = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&initialised);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let root = dir.path().to_path_buf();
        let service_config = config.clone();
        let service = tokio::spawn(async move {
            start_watching(
                &root,
                &service_config,
                None,
                move |_| flag.store(true, Ordering::SeqCst),
                async {
                    let _ = stop_rx.await;
                },
            )
            .await
        });

        let journal = Journal::new(&fs::canonicalize(dir.path()).unwrap());
        wait_for_runs(&journal, 1).await;
        assert!(initialised.load(Ordering::SeqCst));

        fs::write(dir.path().join("a.txt"), "hello world\n").unwrap();
        wait_for_runs(&journal, 2).await;

        let _ = stop_tx.send(());
        timeout(Duration::from_secs(10), service)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let recorded_edit = journal.read_all().unwrap().iter().any(|event| match event {
            JournalEvent::Run(run) => run.ok && run.changes.iter().any(|c| c.path == "a.txt"),
            _ => false,
        });
        assert!(recorded_edit);
    }

    #[tokio::test]
    async fn missing_sandbox_is_an_error() {
        let result = start_watching(
            Path::new("/nonexistent/sandwatch"),
            &Config::default(),
            None,
            |_| {},
            std::future::pending(),
        )
        .await;
        assert!(matches!(result, Err(SandwatchError::Io(_))));
    }
}
