//! Sandwatch - sandboxed watch-and-run with change tracking.
//!
//! # Commands
//!
//! - `sandwatch start`: Create a sandbox and re-run commands on every change
//! - `sandwatch apply`: Copy the sandbox back onto the source tree
//! - `sandwatch export`: Print the session context
//! - `sandwatch diff`: Print the patch recorded for the last run
//! - `sandwatch note`: Record an intent note
//! - `sandwatch clean`: Delete sandboxes of the current source tree
//! - `sandwatch init`: Write a sample `sandwatch.json`
//!
//! # Environment Variables
//!
//! See the [`config`](sandwatch::config) module for available overrides.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sandwatch::config::{write_sample_config, Config};
use sandwatch::context::ContextFormat;
use sandwatch::error::SandwatchError;
use sandwatch::{
    append_intent_note, apply_sandbox, clean_sandboxes, create_sandbox, export_context,
    last_run_diff, record_apply, resolve_sandbox, start_watching, LastRunDiff,
};

/// Sandwatch - sandboxed watch-and-run with change tracking.
///
/// Edits happen in a sandbox copy of the source tree. Every change re-runs
/// the configured commands and is recorded against a baseline, so the
/// result can be reviewed and applied back once the build is green.
#[derive(Parser, Debug)]
#[command(name = "sandwatch")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    SANDWATCH_DEBOUNCE_MS        Quiet period before a run (default: 250)
    SANDWATCH_PARALLEL           Run commands concurrently (default: true)
    SANDWATCH_RESTART_ON_CHANGE  Interrupt active runs on change (default: true)
    SANDWATCH_AGENT              Agent name recorded on events
    RUST_LOG                     Log filter (default: info)

EXAMPLES:
    # Write a sample sandwatch.json
    sandwatch init

    # Create a sandbox and start watching it
    sandwatch start

    # Show what changed in the last run
    sandwatch diff
    sandwatch export --format compact

    # Copy the sandbox back after a green run
    sandwatch apply --prune
")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Options shared by every sandbox command.
#[derive(Args, Debug, Clone)]
struct Common {
    /// Configuration file, relative to the current directory.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Sandbox directory instead of the most recent one.
    #[arg(short, long)]
    sandbox: Option<PathBuf>,

    /// Agent name recorded on session events.
    #[arg(long)]
    agent: Option<String>,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Create (or reuse) a sandbox and re-run commands on every change.
    ///
    /// Runs until interrupted with Ctrl+C or SIGTERM.
    Start {
        #[command(flatten)]
        common: Common,

        /// Quiet period in milliseconds before a run.
        #[arg(long)]
        debounce: Option<u64>,

        /// Run commands one after another.
        #[arg(long)]
        no_parallel: bool,

        /// Let active runs finish instead of interrupting them.
        #[arg(long)]
        no_restart: bool,

        /// Copy the dependency directory instead of linking it.
        #[arg(long)]
        no_link_deps: bool,

        /// Disable baseline, journal and context tracking.
        #[arg(long)]
        no_tracking: bool,
    },

    /// Copy the sandbox back onto the source tree.
    Apply {
        #[command(flatten)]
        common: Common,

        /// Delete source files that no longer exist in the sandbox.
        #[arg(long)]
        prune: bool,

        /// Apply even if the last run failed or never happened.
        #[arg(short, long)]
        force: bool,
    },

    /// Print the session context of the sandbox.
    Export {
        #[command(flatten)]
        common: Common,

        /// Output format: full, compact or structured.
        #[arg(long, default_value = "full")]
        format: ContextFormat,

        /// Write to a file instead of stdout.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Print the unified patch recorded for the last run.
    Diff {
        #[command(flatten)]
        common: Common,
    },

    /// Record an intent note in the sandbox session.
    Note {
        #[command(flatten)]
        common: Common,

        /// Note text.
        #[arg(required = true, trailing_var_arg = true)]
        text: Vec<String>,
    },

    /// Delete every sandbox created for the current source tree.
    Clean,

    /// Write a sample sandwatch.json to the current directory.
    Init,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let source_root = env::current_dir().context("Failed to determine current directory")?;

    match cli.command {
        Command::Init => run_init(&source_root),
        Command::Clean => clean_sandboxes(&source_root).context("Failed to clean sandboxes"),
        Command::Diff { common } => run_diff(&source_root, &common),
        Command::Note { common, text } => run_note(&source_root, &common, &text.join(" ")),
        Command::Export {
            common,
            format,
            out,
        } => run_export(&source_root, &common, format, out.as_deref()),
        Command::Apply {
            common,
            prune,
            force,
        } => run_apply(&source_root, &common, prune, force),
        Command::Start {
            common,
            debounce,
            no_parallel,
            no_restart,
            no_link_deps,
            no_tracking,
        } => {
            let (mut config, _) = load_config(&source_root, &common)?;
            if let Some(ms) = debounce {
                config.debounce_ms = ms;
            }
            config.parallel &= !no_parallel;
            config.restart_on_change &= !no_restart;
            config.link_dependencies &= !no_link_deps;
            config.tracking.enabled &= !no_tracking;

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to create tokio runtime")?;
            runtime.block_on(run_start(source_root, common, config))
        }
    }
}

fn load_config(source_root: &Path, common: &Common) -> Result<(Config, Option<PathBuf>)> {
    let (config, path) =
        Config::load(source_root, common.config.as_deref()).context("Failed to load configuration")?;
    match &path {
        Some(path) => info!(path = %path.display(), "Loaded configuration"),
        None => info!("No sandwatch.json found, using defaults"),
    }
    Ok((config, path))
}

fn agent(common: &Common) -> Option<String> {
    common.agent.clone().or_else(Config::agent_from_env)
}

fn require_sandbox(source_root: &Path, common: &Common) -> Result<PathBuf> {
    Ok(resolve_sandbox(source_root, common.sandbox.as_deref()).ok_or(SandwatchError::NoSandbox)?)
}

async fn run_start(source_root: PathBuf, common: Common, config: Config) -> Result<()> {
    let sandbox = {
        let explicit = common.sandbox.clone();
        let config = config.clone();
        tokio::task::spawn_blocking(move || create_sandbox(&source_root, &config, explicit.as_deref()))
            .await
            .context("Sandbox creation panicked")?
            .context("Failed to create sandbox")?
    };
    info!(sandbox = %sandbox.display(), "Sandbox ready");

    start_watching(
        &sandbox,
        &config,
        agent(&common),
        |session| info!(sandbox = %session.sandbox_root().display(), "Session initialised"),
        wait_for_shutdown(),
    )
    .await
    .context("Watch loop failed")?;

    info!("Stopped");
    Ok(())
}

fn run_apply(source_root: &Path, common: &Common, prune: bool, force: bool) -> Result<()> {
    let (config, _) = load_config(source_root, common)?;
    let sandbox = require_sandbox(source_root, common)?;
    let require_success = config.apply_requires_success && !force;
    let prune = prune || config.prune_on_apply;

    let report = match apply_sandbox(&sandbox, source_root, &config, require_success, prune) {
        Ok(report) => report,
        Err(err @ SandwatchError::ApplyRefused { .. }) => {
            warn!("Re-run until the commands succeed, or pass --force to apply anyway");
            return Err(err.into());
        }
        Err(err) => return Err(err).context("Failed to apply sandbox"),
    };

    if let Err(e) = record_apply(&sandbox, &config, agent(common).as_deref(), &report.target_root) {
        warn!(error = %e, "Failed to journal apply");
    }

    println!(
        "Applied {} file(s) to {}{}",
        report.copied,
        report.target_root.display(),
        if prune {
            format!(", pruned {}", report.pruned)
        } else {
            String::new()
        }
    );
    Ok(())
}

fn run_export(
    source_root: &Path,
    common: &Common,
    format: ContextFormat,
    out: Option<&Path>,
) -> Result<()> {
    let (config, _) = load_config(source_root, common)?;
    let sandbox = require_sandbox(source_root, common)?;
    let text = export_context(&sandbox, &config, agent(common).as_deref(), format)
        .context("Failed to export context")?;

    match out {
        Some(path) => {
            fs::write(path, &text).with_context(|| format!("Failed to write {}", path.display()))?;
            info!(path = %path.display(), %format, "Context written");
        }
        None => println!("{text}"),
    }
    Ok(())
}

fn run_diff(source_root: &Path, common: &Common) -> Result<()> {
    let (config, _) = load_config(source_root, common)?;
    let sandbox = require_sandbox(source_root, common)?;
    match last_run_diff(&sandbox, &config) {
        LastRunDiff::Patch(patch) => print!("{patch}"),
        LastRunDiff::Unavailable(reason) => warn!("{reason}"),
    }
    Ok(())
}

fn run_note(source_root: &Path, common: &Common, note: &str) -> Result<()> {
    let note = note.trim();
    if note.is_empty() {
        anyhow::bail!("Note text is empty");
    }
    let (config, _) = load_config(source_root, common)?;
    let sandbox = require_sandbox(source_root, common)?;

    if append_intent_note(&sandbox, &config, agent(common).as_deref(), note)
        .context("Failed to record note")?
    {
        println!("Note recorded");
    } else {
        warn!("Intent notes are disabled in the configuration");
    }
    Ok(())
}

fn run_init(source_root: &Path) -> Result<()> {
    let (path, created) = write_sample_config(source_root).context("Failed to write sample config")?;
    if created {
        println!("Created {}", path.display());
    } else {
        println!("{} already exists, leaving it untouched", path.display());
    }
    Ok(())
}

/// Initializes the tracing subscriber with environment-based filtering.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .init();
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
