//! Run scheduling and command supervision.
//!
//! The [`Supervisor`] is a single task that owns every piece of run state:
//! the run counter, the pending hint, the rerun flag and the children of the
//! active run. Callers talk to it through a [`SupervisorHandle`].
//!
//! # State machine
//!
//! ```text
//! Idle --request--> Running --all children exited--> post-processing
//!                      |                                   |
//!                      +--request: pending = true          +--pending? --> Running
//!                         (SIGTERM group if restart)       +--otherwise --> Idle
//! ```
//!
//! A request that arrives during a run never starts a second run; it only
//! marks a rerun as pending (and interrupts the active run when
//! `restartOnChange` is set). Post-processing (status write, baseline update,
//! journal append) always completes before the next run starts, and requests
//! that arrive while it is in progress fold into that single next run.
//!
//! Interrupted children receive `SIGTERM` on their process group, followed by
//! `SIGKILL` once [`KILL_GRACE`] has elapsed.
//!
//! # Example
//!
//! ```no_run
//! use std::path::PathBuf;
//! use sandwatch::config::Config;
//! use sandwatch::runner::Supervisor;
//! use sandwatch::types::ChangeHint;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), sandwatch::error::SandwatchError> {
//!     let handle = Supervisor::new(PathBuf::from("/tmp/sandbox"), &Config::default()).spawn();
//!     handle.request_run(ChangeHint::full()).await?;
//!     handle.shutdown().await
//! }
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::capture::{OutputCapture, Stream};
use crate::config::{CommandSpec, Config};
use crate::error::{Result, SandwatchError};
use crate::layout::SandboxLayout;
use crate::store::write_json;
use crate::types::{ChangeHint, CommandOutput, ExitRecord, RunStatus};
use crate::utils::text::format_duration;

/// Time between `SIGTERM` and `SIGKILL` for interrupted commands.
pub const KILL_GRACE: Duration = Duration::from_millis(2000);

/// How long to wait for trailing output after all commands exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Capacity of the per-run output line channel.
const LINE_CHANNEL_CAPACITY: usize = 1024;

/// Capacity of the request channel.
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Log target for forwarded command output.
const OUTPUT_TARGET: &str = "sandwatch::output";

/// Everything known about a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub run_id: u64,
    pub started_at: DateTime<Utc>,
    pub ok: bool,
    pub interrupted: bool,
    pub duration_ms: u64,
    pub exits: Vec<ExitRecord>,
    pub outputs: Option<BTreeMap<String, CommandOutput>>,
    /// Changes reported by the watcher before this run started.
    pub hint: ChangeHint,
}

/// Post-processing hook invoked after each run's status is written.
///
/// Called on a blocking thread; runs are not started again until it returns.
pub trait RunRecorder: Send + Sync + 'static {
    /// Records a finished run.
    ///
    /// # Errors
    ///
    /// Any error stops the supervisor and is surfaced to its owner.
    fn record_run(&self, outcome: &RunOutcome) -> Result<()>;
}

enum Request {
    Run(ChangeHint),
    Shutdown,
}

/// One line of child output.
struct OutputLine {
    name: String,
    stream: Stream,
    line: String,
}

/// A spawned child belonging to the active run.
struct RunningCommand {
    name: String,
    child: Child,
}

/// What happened while waiting on a batch of children.
#[derive(Default)]
struct RunFlags {
    interrupted: bool,
    shutdown: bool,
    kill_deadline: Option<Instant>,
}

/// Owner of run state. Build with [`Supervisor::new`], start with
/// [`Supervisor::spawn`].
pub struct Supervisor {
    sandbox_root: PathBuf,
    commands: Vec<CommandSpec>,
    parallel: bool,
    restart_on_change: bool,
    capture_limit: Option<usize>,
    recorder: Option<Arc<dyn RunRecorder>>,
    reports: Option<mpsc::UnboundedSender<RunOutcome>>,
    run_counter: u64,
    pending: Option<ChangeHint>,
}

impl Supervisor {
    /// Creates a supervisor for the configured commands.
    ///
    /// Output is captured when tracking and output capture are both enabled.
    #[must_use]
    pub fn new(sandbox_root: PathBuf, config: &Config) -> Self {
        let capture_limit = (config.tracking.enabled && config.tracking.include_outputs)
            .then_some(config.tracking.max_output_bytes);
        Self {
            sandbox_root,
            commands: config.commands.clone(),
            parallel: config.parallel,
            restart_on_change: config.restart_on_change,
            capture_limit,
            recorder: None,
            reports: None,
            run_counter: 0,
            pending: None,
        }
    }

    /// Sets the post-processing hook.
    #[must_use]
    pub fn with_recorder(mut self, recorder: Arc<dyn RunRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Sends a copy of every finished run's outcome to `reports`.
    #[must_use]
    pub fn with_reports(mut self, reports: mpsc::UnboundedSender<RunOutcome>) -> Self {
        self.reports = Some(reports);
        self
    }

    /// Starts the supervisor task.
    #[must_use]
    pub fn spawn(self) -> SupervisorHandle {
        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let task = tokio::spawn(self.run(rx));
        SupervisorHandle {
            tx,
            task: Some(task),
        }
    }

    fn queue(&mut self, hint: ChangeHint) {
        match self.pending.as_mut() {
            Some(pending) => pending.merge(hint),
            None => self.pending = Some(hint),
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Request>) -> Result<()> {
        'idle: loop {
            match rx.recv().await {
                Some(Request::Run(hint)) => self.queue(hint),
                Some(Request::Shutdown) | None => break 'idle,
            }
            if self.drain_requests(&mut rx) {
                break 'idle;
            }

            while let Some(hint) = self.pending.take() {
                let shutdown = self.run_once(hint, &mut rx).await?;
                if shutdown || self.drain_requests(&mut rx) {
                    break 'idle;
                }
                if self.pending.is_some() {
                    debug!("Changes arrived during run, running again");
                }
            }
        }

        debug!("Supervisor stopped");
        Ok(())
    }

    /// Folds requests queued up during post-processing into the pending
    /// hint. Returns true if a shutdown was among them.
    fn drain_requests(&mut self, rx: &mut mpsc::Receiver<Request>) -> bool {
        loop {
            match rx.try_recv() {
                Ok(Request::Run(hint)) => self.queue(hint),
                Ok(Request::Shutdown) | Err(TryRecvError::Disconnected) => return true,
                Err(TryRecvError::Empty) => return false,
            }
        }
    }

    /// Executes one run plus post-processing. Returns true on shutdown.
    async fn run_once(&mut self, hint: ChangeHint, rx: &mut mpsc::Receiver<Request>) -> Result<bool> {
        self.run_counter += 1;
        let run_id = self.run_counter;
        let started_at = Utc::now();
        let started = Instant::now();
        info!(run_id, "Run #{run_id} started");

        let mut capture = self.capture_limit.map(OutputCapture::new);
        let (line_tx, mut line_rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let mut flags = RunFlags::default();
        let mut exits = Vec::new();

        let batches: Vec<Vec<CommandSpec>> = if self.parallel {
            vec![self.commands.clone()]
        } else {
            self.commands.iter().cloned().map(|c| vec![c]).collect()
        };

        for batch in batches {
            let mut running = Vec::with_capacity(batch.len());
            for spec in &batch {
                match self.spawn_command(spec, &line_tx) {
                    Ok(cmd) => running.push(cmd),
                    Err(err) => {
                        for mut cmd in running {
                            let _ = cmd.child.start_kill();
                        }
                        return Err(err);
                    }
                }
            }

            let batch_exits = self
                .supervise(&mut running, &mut line_rx, capture.as_mut(), &mut flags, rx)
                .await;
            let failed = batch_exits.iter().any(|exit| !exit.succeeded());
            exits.extend(batch_exits);
            if failed || flags.interrupted || flags.shutdown {
                break;
            }
        }

        drop(line_tx);
        let drained = timeout(OUTPUT_DRAIN_TIMEOUT, async {
            while let Some(line) = line_rx.recv().await {
                forward_line(&line, capture.as_mut());
            }
        })
        .await;
        if drained.is_err() {
            debug!(run_id, "Gave up waiting for trailing output");
        }

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let ok = exits.len() == self.commands.len() && exits.iter().all(ExitRecord::succeeded);
        let interrupted = flags.interrupted;

        if ok {
            info!(run_id, duration_ms, "Run #{run_id} succeeded in {}", format_duration(duration_ms));
        } else {
            info!(
                run_id,
                duration_ms,
                interrupted,
                "Run #{run_id} failed in {}",
                format_duration(duration_ms)
            );
        }

        let status = RunStatus {
            last_run_at: Utc::now(),
            last_run_ok: ok,
            interrupted,
            duration_ms,
            exits: exits.clone(),
        };
        write_json(&SandboxLayout::new(&self.sandbox_root).status_file(), &status)?;

        let outcome = RunOutcome {
            run_id,
            started_at,
            ok,
            interrupted,
            duration_ms,
            exits,
            outputs: capture.map(OutputCapture::into_outputs),
            hint,
        };

        if let Some(recorder) = &self.recorder {
            let recorder = Arc::clone(recorder);
            let for_recorder = outcome.clone();
            tokio::task::spawn_blocking(move || recorder.record_run(&for_recorder))
                .await
                .map_err(|e| {
                    error!(error = %e, "Run recorder panicked");
                    SandwatchError::SupervisorStopped
                })??;
        }

        if let Some(reports) = &self.reports {
            let _ = reports.send(outcome);
        }

        Ok(flags.shutdown)
    }

    fn spawn_command(
        &self,
        spec: &CommandSpec,
        line_tx: &mpsc::Sender<OutputLine>,
    ) -> Result<RunningCommand> {
        let cwd = match &spec.cwd {
            Some(dir) => self.sandbox_root.join(dir),
            None => self.sandbox_root.clone(),
        };

        let mut command = shell_command(&spec.cmd);
        command
            .current_dir(&cwd)
            .env("SANDWATCH", "1")
            .env("SANDWATCH_SANDBOX", &self.sandbox_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| SandwatchError::Spawn {
            name: spec.name.clone(),
            source,
        })?;
        debug!(name = %spec.name, pid = ?child.id(), "Spawned command");

        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, spec.name.clone(), Stream::Stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, spec.name.clone(), Stream::Stderr, line_tx.clone());
        }

        Ok(RunningCommand {
            name: spec.name.clone(),
            child,
        })
    }

    /// Waits for a batch of children while servicing output and requests.
    async fn supervise(
        &mut self,
        running: &mut [RunningCommand],
        line_rx: &mut mpsc::Receiver<OutputLine>,
        mut capture: Option<&mut OutputCapture>,
        flags: &mut RunFlags,
        rx: &mut mpsc::Receiver<Request>,
    ) -> Vec<ExitRecord> {
        let names: Vec<String> = running.iter().map(|c| c.name.clone()).collect();
        let pids: Vec<u32> = running.iter().filter_map(|c| c.child.id()).collect();
        let mut requests_open = true;

        let waits = join_all(running.iter_mut().map(|c| c.child.wait()));
        tokio::pin!(waits);

        let results = loop {
            tokio::select! {
                results = &mut waits => break results,

                Some(line) = line_rx.recv() => {
                    forward_line(&line, capture.as_deref_mut());
                }

                request = rx.recv(), if requests_open => match request {
                    Some(Request::Run(hint)) => {
                        self.queue(hint);
                        if self.restart_on_change && !flags.interrupted {
                            info!("Change detected, interrupting active run");
                            interrupt(&pids, flags);
                        }
                    }
                    Some(Request::Shutdown) | None => {
                        requests_open = false;
                        flags.shutdown = true;
                        if !flags.interrupted {
                            interrupt(&pids, flags);
                        }
                    }
                },

                () = async {
                    match flags.kill_deadline {
                        Some(deadline) => sleep_until(deadline).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    warn!("Commands ignored SIGTERM, sending SIGKILL");
                    flags.kill_deadline = None;
                    signal_group(&pids, GroupSignal::Kill);
                }
            }
        };

        names
            .into_iter()
            .zip(results)
            .map(|(name, result)| match result {
                Ok(status) => exit_record(name, status),
                Err(e) => {
                    warn!(name = %name, error = %e, "Failed to wait for command");
                    ExitRecord {
                        name,
                        code: None,
                        signal: None,
                    }
                }
            })
            .collect()
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("sandbox_root", &self.sandbox_root)
            .field("commands", &self.commands)
            .field("parallel", &self.parallel)
            .field("restart_on_change", &self.restart_on_change)
            .field("run_counter", &self.run_counter)
            .finish_non_exhaustive()
    }
}

/// Handle to a running [`Supervisor`] task.
#[derive(Debug)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<Request>,
    task: Option<JoinHandle<Result<()>>>,
}

/// Cloneable sender of run requests, detached from the handle's lifetime.
#[derive(Debug, Clone)]
pub struct RunRequester {
    tx: mpsc::Sender<Request>,
}

impl RunRequester {
    /// Requests a run covering `hint`.
    ///
    /// # Errors
    ///
    /// Returns `SandwatchError::SupervisorStopped` if the task has exited.
    pub async fn request_run(&self, hint: ChangeHint) -> Result<()> {
        self.tx
            .send(Request::Run(hint))
            .await
            .map_err(|_| SandwatchError::SupervisorStopped)
    }
}

impl SupervisorHandle {
    /// Returns a requester that can be moved into another task.
    #[must_use]
    pub fn requester(&self) -> RunRequester {
        RunRequester {
            tx: self.tx.clone(),
        }
    }

    /// Requests a run covering `hint`.
    ///
    /// # Errors
    ///
    /// Returns `SandwatchError::SupervisorStopped` if the task has exited.
    pub async fn request_run(&self, hint: ChangeHint) -> Result<()> {
        self.tx
            .send(Request::Run(hint))
            .await
            .map_err(|_| SandwatchError::SupervisorStopped)
    }

    /// Waits for the supervisor task to exit and returns its result.
    ///
    /// Cancel-safe; once it has returned, later calls return `Ok(())`.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the supervisor.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let result = task.await;
        self.task = None;
        result.map_err(|_| SandwatchError::SupervisorStopped)?
    }

    /// Interrupts any active run and stops the supervisor.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the supervisor, if any.
    pub async fn shutdown(mut self) -> Result<()> {
        let _ = self.tx.send(Request::Shutdown).await;
        self.wait().await
    }
}

/// Logs one output line and appends it to the capture.
fn forward_line(line: &OutputLine, capture: Option<&mut OutputCapture>) {
    match line.stream {
        Stream::Stdout => info!(target: OUTPUT_TARGET, "[{}] {}", line.name, line.line),
        Stream::Stderr => warn!(target: OUTPUT_TARGET, "[{}] {}", line.name, line.line),
    }
    if let Some(capture) = capture {
        capture.append(&line.name, line.stream, &line.line);
    }
}

fn spawn_reader<R>(reader: R, name: String, stream: Stream, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf);
                    let line = text.trim_end_matches(['\n', '\r']);
                    if line.is_empty() {
                        continue;
                    }
                    let out = OutputLine {
                        name: name.clone(),
                        stream,
                        line: line.to_string(),
                    };
                    if tx.send(out).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(name = %name, error = %e, "Output stream closed with error");
                    break;
                }
            }
        }
    });
}

#[cfg(unix)]
fn shell_command(cmd: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(cmd);
    command
}

#[cfg(not(unix))]
fn shell_command(cmd: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(cmd);
    command
}

fn interrupt(pids: &[u32], flags: &mut RunFlags) {
    flags.interrupted = true;
    flags.kill_deadline = Some(Instant::now() + KILL_GRACE);
    signal_group(pids, GroupSignal::Terminate);
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pids: &[u32], signal: GroupSignal) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    for &pid in pids {
        let Ok(raw) = i32::try_from(pid) else {
            continue;
        };
        if let Err(e) = killpg(Pid::from_raw(raw), signal) {
            debug!(pid, signal = signal.as_str(), error = %e, "Failed to signal process group");
        }
    }
}

/// No graceful stop exists here, so both signals force-kill the process tree.
#[cfg(not(unix))]
fn signal_group(pids: &[u32], signal: GroupSignal) {
    for &pid in pids {
        let result = std::process::Command::new("taskkill")
            .args(["/T", "/F", "/PID", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = result {
            debug!(pid, ?signal, error = %e, "Failed to kill process tree");
        }
    }
}

#[cfg(unix)]
fn exit_record(name: String, status: ExitStatus) -> ExitRecord {
    use std::os::unix::process::ExitStatusExt;

    let signal = status.signal().map(|sig| {
        nix::sys::signal::Signal::try_from(sig)
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|_| sig.to_string())
    });
    ExitRecord {
        name,
        code: status.code(),
        signal,
    }
}

#[cfg(not(unix))]
fn exit_record(name: String, status: ExitStatus) -> ExitRecord {
    ExitRecord {
        name,
        code: status.code(),
        signal: None,
    }
}
