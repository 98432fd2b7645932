//! Configuration module for Sandwatch.
//!
//! Configuration comes from an optional JSON file (`sandwatch.json` in the
//! source root, or an explicit path) layered over built-in defaults, followed
//! by environment variable overrides. Every field is optional in the file;
//! missing fields keep their defaults.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SANDWATCH_DEBOUNCE_MS` | 250 | Quiet period before a run is requested |
//! | `SANDWATCH_PARALLEL` | true | Run commands concurrently |
//! | `SANDWATCH_RESTART_ON_CHANGE` | true | Interrupt an active run on change |
//! | `SANDWATCH_AGENT` | - | Agent name recorded on journal events |
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use sandwatch::config::Config;
//!
//! let (config, source) = Config::load(Path::new("."), None).expect("config");
//! println!("{} command(s), loaded from {:?}", config.commands.len(), source);
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the private control directory, in both source and sandbox roots.
pub const CONTROL_DIR: &str = ".sandwatch";

/// Default configuration file name looked up in the source root.
pub const CONFIG_FILE: &str = "sandwatch.json";

/// Default quiet period for coalescing file events.
const DEFAULT_DEBOUNCE_MS: u64 = 250;

/// Default per-file ceiling for reading content into memory for diffing.
const DEFAULT_MAX_FILE_BYTES: u64 = 512 * 1024;

/// Default ceiling for a single rendered patch.
const DEFAULT_MAX_DIFF_BYTES: usize = 128 * 1024;

/// Default ceiling for each captured output stream.
const DEFAULT_MAX_OUTPUT_BYTES: usize = 32 * 1024;

/// Default dependency directory linked into sandboxes.
const DEFAULT_DEPENDENCY_DIR: &str = "node_modules";

/// Command used when nothing is configured.
const NOOP_COMMAND: &str = "echo \"No build command configured. Add sandwatch.json\"";

/// Paths excluded from every walk, copy and diff unless overridden.
pub const DEFAULT_IGNORE: &[&str] = &[
    "node_modules",
    "node_modules/**",
    ".git",
    ".git/**",
    ".sandwatch",
    ".sandwatch/**",
    "dist",
    "dist/**",
    "build",
    "build/**",
    "coverage",
    "coverage/**",
    ".next",
    ".next/**",
    "out",
    "out/**",
    ".cache",
    ".cache/**",
    "tmp",
    "tmp/**",
    "temp",
    "temp/**",
    "target",
    "target/**",
];

/// Errors that can occur while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// An override has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// The configuration file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for this schema.
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// No runnable command remains after normalization.
    #[error("no commands configured")]
    NoCommands,
}

/// A configured command.
///
/// In the file, a command is either a bare shell string or an object with
/// `name`, `cmd` and an optional `cwd` relative to the sandbox root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "CommandEntry")]
pub struct CommandSpec {
    /// Display name, used as the `[name]` output prefix.
    pub name: String,
    /// Shell command line.
    pub cmd: String,
    /// Working directory relative to the sandbox root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

impl CommandSpec {
    /// Creates a named command without a working directory override.
    #[must_use]
    pub fn new(name: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cmd: cmd.into(),
            cwd: None,
        }
    }
}

/// Raw command entry as it appears in the configuration file.
#[derive(Deserialize)]
#[serde(untagged)]
enum CommandEntry {
    Bare(String),
    Full {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        cmd: Option<String>,
        #[serde(default)]
        cwd: Option<String>,
    },
}

impl From<CommandEntry> for CommandSpec {
    fn from(entry: CommandEntry) -> Self {
        match entry {
            CommandEntry::Bare(cmd) => Self {
                name: String::new(),
                cmd,
                cwd: None,
            },
            CommandEntry::Full { name, cmd, cwd } => Self {
                name: name.unwrap_or_default(),
                cmd: cmd.unwrap_or_default(),
                cwd,
            },
        }
    }
}

/// Line caps for the compact context rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompactConfig {
    /// Whether the compact context is written after each run.
    pub enabled: bool,
    /// Leading diff lines kept per change.
    pub max_diff_lines: usize,
    /// Trailing stdout lines kept per command (failed runs only).
    pub max_stdout_lines: usize,
    /// Trailing stderr lines kept per command.
    pub max_stderr_lines: usize,
}

impl Default for CompactConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_diff_lines: 80,
            max_stdout_lines: 20,
            max_stderr_lines: 60,
        }
    }
}

/// Change tracking, journaling and capture limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackingConfig {
    /// Master switch for sessions, baselines, journal and contexts.
    pub enabled: bool,
    /// Attach diffs to change records.
    pub verbose: bool,
    /// Append events to the journal.
    pub journal: bool,
    /// Capture command output into run records.
    pub include_outputs: bool,
    /// Maintain a baseline copy for change detection.
    pub baseline: bool,
    /// Accept intent notes.
    pub intent_notes: bool,
    /// Directory-level events force a full rescan.
    pub scan_all_on_dir_change: bool,
    /// Files above this size are not read for diffing.
    pub max_file_bytes: u64,
    /// Patches above this size are truncated.
    pub max_diff_bytes: usize,
    /// Per-stream output capture ceiling.
    pub max_output_bytes: usize,
    /// Compact rendering caps.
    pub compact: CompactConfig,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            verbose: true,
            journal: true,
            include_outputs: true,
            baseline: true,
            intent_notes: true,
            scan_all_on_dir_change: true,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            max_diff_bytes: DEFAULT_MAX_DIFF_BYTES,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            compact: CompactConfig::default(),
        }
    }
}

/// Configuration for Sandwatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Globs (sandbox-relative) whose changes trigger runs.
    pub watch: Vec<String>,
    /// Globs excluded from every walk, copy, diff and apply.
    pub ignore: Vec<String>,
    /// Commands executed on each run.
    pub commands: Vec<CommandSpec>,
    /// Quiet period in milliseconds before a run is requested.
    pub debounce_ms: u64,
    /// Run commands concurrently instead of in order.
    pub parallel: bool,
    /// Interrupt the active run when new changes arrive.
    pub restart_on_change: bool,
    /// Symlink the dependency directory instead of copying it.
    pub link_dependencies: bool,
    /// Dependency directory name relative to the source root.
    pub dependency_dir: String,
    /// Apply only after a successful run.
    pub apply_requires_success: bool,
    /// Delete target files that no longer exist in the sandbox on apply.
    pub prune_on_apply: bool,
    /// Change tracking settings.
    pub tracking: TrackingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            watch: vec!["**/*".to_string()],
            ignore: DEFAULT_IGNORE.iter().map(|s| (*s).to_string()).collect(),
            commands: vec![CommandSpec::new("noop", NOOP_COMMAND)],
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            parallel: true,
            restart_on_change: true,
            link_dependencies: true,
            dependency_dir: DEFAULT_DEPENDENCY_DIR.to_string(),
            apply_requires_success: true,
            prune_on_apply: false,
            tracking: TrackingConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration for a source tree.
    ///
    /// Uses `explicit` when given (resolved against `source_root`), otherwise
    /// `sandwatch.json` in `source_root` if it exists, otherwise defaults.
    /// Environment overrides are applied afterwards and commands normalized.
    ///
    /// Returns the configuration and the file it was read from, if any.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be read or parsed, an
    /// environment override is invalid, or no command remains.
    pub fn load(
        source_root: &Path,
        explicit: Option<&Path>,
    ) -> Result<(Self, Option<PathBuf>), ConfigError> {
        let path = match explicit {
            Some(p) => Some(source_root.join(p)),
            None => {
                let candidate = source_root.join(CONFIG_FILE);
                candidate.is_file().then_some(candidate)
            }
        };

        let mut config = match &path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };

        config.apply_env_overrides()?;
        config.normalize();
        config.validate()?;

        Ok((config, path))
    }

    /// Parses a configuration file, filling unspecified fields with defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Read` or `ConfigError::Parse`.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies `SANDWATCH_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` when a variable cannot be parsed.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = env::var("SANDWATCH_DEBOUNCE_MS") {
            self.debounce_ms = val.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                key: "SANDWATCH_DEBOUNCE_MS".to_string(),
                message: format!("expected non-negative integer, got '{val}'"),
            })?;
        }
        if let Some(parallel) = parse_bool_env("SANDWATCH_PARALLEL")? {
            self.parallel = parallel;
        }
        if let Some(restart) = parse_bool_env("SANDWATCH_RESTART_ON_CHANGE")? {
            self.restart_on_change = restart;
        }
        Ok(())
    }

    /// Names unnamed commands `cmd1..N` and drops entries without a command.
    pub fn normalize(&mut self) {
        self.commands = self
            .commands
            .drain(..)
            .enumerate()
            .filter_map(|(index, mut command)| {
                if command.cmd.trim().is_empty() {
                    return None;
                }
                if command.name.trim().is_empty() {
                    command.name = format!("cmd{}", index + 1);
                }
                Some(command)
            })
            .collect();
    }

    /// Checks that at least one command is runnable.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::NoCommands` if the command list is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.commands.is_empty() {
            return Err(ConfigError::NoCommands);
        }
        Ok(())
    }

    /// Returns the agent name from `SANDWATCH_AGENT`, if set and non-empty.
    #[must_use]
    pub fn agent_from_env() -> Option<String> {
        env::var("SANDWATCH_AGENT")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

/// Writes a sample configuration file unless one already exists.
///
/// Returns the path and whether it was created.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be written.
pub fn write_sample_config(source_root: &Path) -> std::io::Result<(PathBuf, bool)> {
    let target = source_root.join(CONFIG_FILE);
    if target.exists() {
        return Ok((target, false));
    }

    let sample = Config {
        commands: vec![CommandSpec::new("build", "cargo build")],
        ..Config::default()
    };
    let body = serde_json::to_string_pretty(&sample)?;
    fs::write(&target, body)?;
    Ok((target, true))
}

/// Parses a boolean environment variable (`1/0`, `true/false`, `yes/no`).
fn parse_bool_env(key: &str) -> Result<Option<bool>, ConfigError> {
    let Ok(val) = env::var(key) else {
        return Ok(None);
    };
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean, got '{val}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    /// Runs `f` with all SANDWATCH_* variables removed, restoring them after.
    fn with_clean_env<F, R>(f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let saved_vars: Vec<(String, String)> = env::vars()
            .filter(|(k, _)| k.starts_with("SANDWATCH_"))
            .collect();

        for (key, _) in &saved_vars {
            env::remove_var(key);
        }

        let result = f();

        for (key, _) in env::vars().filter(|(k, _)| k.starts_with("SANDWATCH_")) {
            env::remove_var(key);
        }
        for (key, value) in saved_vars {
            env::set_var(key, value);
        }

        result
    }

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.watch, vec!["**/*".to_string()]);
        assert!(config.ignore.iter().any(|p| p == ".sandwatch/**"));
        assert_eq!(config.debounce_ms, 250);
        assert!(config.parallel);
        assert!(config.restart_on_change);
        assert!(config.apply_requires_success);
        assert!(!config.prune_on_apply);
        assert_eq!(config.tracking.max_file_bytes, 512 * 1024);
        assert_eq!(config.tracking.compact.max_diff_lines, 80);
        assert_eq!(config.commands.len(), 1);
    }

    #[test]
    fn partial_file_merges_over_defaults() {
        let json = r#"{
            "debounceMs": 50,
            "parallel": false,
            "tracking": { "maxDiffBytes": 10, "compact": { "maxDiffLines": 5 } }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();

        assert_eq!(config.debounce_ms, 50);
        assert!(!config.parallel);
        assert!(config.restart_on_change);
        assert_eq!(config.tracking.max_diff_bytes, 10);
        assert_eq!(config.tracking.max_output_bytes, 32 * 1024);
        assert_eq!(config.tracking.compact.max_diff_lines, 5);
        assert_eq!(config.tracking.compact.max_stderr_lines, 60);
    }

    #[test]
    fn commands_accept_strings_and_objects() {
        let json = r#"{
            "commands": [
                "cargo check",
                { "name": "test", "cmd": "cargo test", "cwd": "crates/core" },
                { "name": "empty" },
                { "cmd": "make lint" }
            ]
        }"#;
        let mut config: Config = serde_json::from_str(json).unwrap();
        config.normalize();

        assert_eq!(config.commands.len(), 3);
        assert_eq!(config.commands[0].name, "cmd1");
        assert_eq!(config.commands[0].cmd, "cargo check");
        assert_eq!(config.commands[1].name, "test");
        assert_eq!(config.commands[1].cwd.as_deref(), Some("crates/core"));
        assert_eq!(config.commands[2].name, "cmd4");
    }

    #[test]
    fn validate_rejects_empty_commands() {
        let config = Config {
            commands: Vec::new(),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::NoCommands)));
    }

    #[test]
    #[serial]
    fn load_without_file_uses_defaults() {
        with_clean_env(|| {
            let dir = tempfile::tempdir().unwrap();
            let (config, source) = Config::load(dir.path(), None).unwrap();
            assert!(source.is_none());
            assert_eq!(config, Config::default());
        });
    }

    #[test]
    #[serial]
    fn load_reads_default_file() {
        with_clean_env(|| {
            let dir = tempfile::tempdir().unwrap();
            fs::write(
                dir.path().join(CONFIG_FILE),
                r#"{ "commands": [{ "name": "build", "cmd": "make" }] }"#,
            )
            .unwrap();

            let (config, source) = Config::load(dir.path(), None).unwrap();
            assert_eq!(source, Some(dir.path().join(CONFIG_FILE)));
            assert_eq!(config.commands, vec![CommandSpec::new("build", "make")]);
        });
    }

    #[test]
    #[serial]
    fn load_reports_parse_errors() {
        with_clean_env(|| {
            let dir = tempfile::tempdir().unwrap();
            fs::write(dir.path().join(CONFIG_FILE), "{ not json").unwrap();

            let err = Config::load(dir.path(), None).unwrap_err();
            assert!(matches!(err, ConfigError::Parse { .. }));
        });
    }

    #[test]
    #[serial]
    fn env_overrides_apply() {
        with_clean_env(|| {
            env::set_var("SANDWATCH_DEBOUNCE_MS", "10");
            env::set_var("SANDWATCH_PARALLEL", "false");
            env::set_var("SANDWATCH_RESTART_ON_CHANGE", "0");

            let dir = tempfile::tempdir().unwrap();
            let (config, _) = Config::load(dir.path(), None).unwrap();
            assert_eq!(config.debounce_ms, 10);
            assert!(!config.parallel);
            assert!(!config.restart_on_change);
        });
    }

    #[test]
    #[serial]
    fn invalid_env_override_is_an_error() {
        with_clean_env(|| {
            env::set_var("SANDWATCH_DEBOUNCE_MS", "soon");

            let dir = tempfile::tempdir().unwrap();
            let err = Config::load(dir.path(), None).unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "SANDWATCH_DEBOUNCE_MS")
            );
        });
    }

    #[test]
    #[serial]
    fn agent_from_env_ignores_blank() {
        with_clean_env(|| {
            assert_eq!(Config::agent_from_env(), None);
            env::set_var("SANDWATCH_AGENT", "  ");
            assert_eq!(Config::agent_from_env(), None);
            env::set_var("SANDWATCH_AGENT", "codex");
            assert_eq!(Config::agent_from_env().as_deref(), Some("codex"));
        });
    }

    #[test]
    fn sample_config_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let (path, created) = write_sample_config(dir.path()).unwrap();
        assert!(created);

        let parsed = Config::from_file(&path).unwrap();
        assert_eq!(parsed.commands[0].name, "build");

        let (_, created_again) = write_sample_config(dir.path()).unwrap();
        assert!(!created_again);
    }

    #[test]
    fn config_error_display() {
        let err = ConfigError::InvalidValue {
            key: "SANDWATCH_PARALLEL".to_string(),
            message: "expected boolean, got 'maybe'".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid value for SANDWATCH_PARALLEL: expected boolean, got 'maybe'"
        );
    }
}
