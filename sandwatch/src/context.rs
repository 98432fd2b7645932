//! Context renderers.
//!
//! Turns the last run, the intent notes and the configuration into text an
//! operator or an agent can read. Every renderer here is a pure function of
//! its arguments; reading the inputs from disk is the caller's job.
//!
//! - [`render_full`]: Markdown with complete diffs, captured output and the
//!   full configuration
//! - [`render_compact`]: bounded summary with head-truncated diffs and
//!   tail-truncated output, surfacing only the first failing command
//! - [`render_structured`]: pretty JSON bundle for machine consumers

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::SecondsFormat;
use serde_json::json;

use crate::config::Config;
use crate::error::Result;
use crate::types::{ChangeRecord, ExitRecord, RunRecord, SessionDescriptor};
use crate::utils::text::{head_lines, tail_lines};

const NO_RUNS: &str = "No runs recorded yet.";

/// Output format for exported contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextFormat {
    #[default]
    Full,
    Compact,
    Structured,
}

impl FromStr for ContextFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "compact" => Ok(Self::Compact),
            "structured" | "json" => Ok(Self::Structured),
            other => Err(format!(
                "unknown context format '{other}', expected full, compact or structured"
            )),
        }
    }
}

impl fmt::Display for ContextFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Full => "full",
            Self::Compact => "compact",
            Self::Structured => "structured",
        })
    }
}

/// Identity lines shown at the top of every text rendering.
#[derive(Debug, Clone, Copy)]
pub struct ContextHeader<'a> {
    pub sandbox_root: &'a Path,
    pub source_root: Option<&'a Path>,
    pub agent: Option<&'a str>,
}

impl ContextHeader<'_> {
    fn push_lines(&self, lines: &mut Vec<String>) {
        lines.push(format!("Sandbox: {}", self.sandbox_root.display()));
        if let Some(source) = self.source_root {
            lines.push(format!("Source: {}", source.display()));
        }
        if let Some(agent) = self.agent {
            lines.push(format!("Agent: {agent}"));
        }
    }
}

fn status_label(run: &RunRecord) -> &'static str {
    if run.ok {
        "ok"
    } else if run.interrupted {
        "interrupted"
    } else {
        "failed"
    }
}

fn exit_label(exit: &ExitRecord) -> String {
    match (&exit.code, &exit.signal) {
        (Some(0), _) => "ok".to_string(),
        (Some(code), _) => format!("exit {code}"),
        (None, Some(signal)) => format!("signal {signal}"),
        (None, None) => "unknown".to_string(),
    }
}

fn change_line(change: &ChangeRecord) -> String {
    let mut line = format!("- {}: {}", change.kind, change.path);
    if let Some(reason) = change.reason {
        line.push_str(&format!(" (no diff: {})", reason.as_str()));
    } else if change.truncated {
        line.push_str(" (diff truncated)");
    }
    line
}

fn push_fenced(lines: &mut Vec<String>, lang: &str, body: &str) {
    lines.push(format!("```{lang}"));
    lines.push(body.trim_end_matches('\n').to_string());
    lines.push("```".to_string());
}

/// Renders the full Markdown context.
#[must_use]
pub fn render_full(
    header: &ContextHeader<'_>,
    last_run: Option<&RunRecord>,
    intent: &str,
    config: &Config,
) -> String {
    let mut lines = vec!["# Sandwatch Context".to_string(), String::new()];
    header.push_lines(&mut lines);
    lines.push(String::new());
    lines.push("## Last Run".to_string());

    match last_run {
        None => lines.push(NO_RUNS.to_string()),
        Some(run) => {
            lines.push(format!("Run ID: {}", run.run_id));
            lines.push(format!("Status: {}", status_label(run)));
            lines.push(format!("Duration: {}ms", run.duration_ms));
            lines.push(format!(
                "Timestamp: {}",
                run.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
            ));
            lines.push(String::new());

            lines.push("Commands:".to_string());
            for exit in &run.exits {
                lines.push(format!("- {}: {}", exit.name, exit_label(exit)));
            }
            lines.push(String::new());

            if run.changes.is_empty() {
                lines.push("Changes: none".to_string());
            } else {
                lines.push("Changes:".to_string());
                for change in &run.changes {
                    lines.push(change_line(change));
                    if let Some(diff) = &change.diff {
                        push_fenced(&mut lines, "diff", diff);
                    }
                }
            }

            if let Some(outputs) = &run.outputs {
                let mut section = Vec::new();
                for (name, output) in outputs {
                    if !output.stdout.trim().is_empty() {
                        section.push(format!("### {name} stdout"));
                        push_fenced(&mut section, "", &output.stdout);
                    }
                    if !output.stderr.trim().is_empty() {
                        section.push(format!("### {name} stderr"));
                        push_fenced(&mut section, "", &output.stderr);
                    }
                }
                if !section.is_empty() {
                    lines.push(String::new());
                    lines.push("## Outputs".to_string());
                    lines.extend(section);
                }
            }
        }
    }

    let intent = intent.trim();
    if !intent.is_empty() {
        lines.push(String::new());
        lines.push("## Intent Notes".to_string());
        lines.push(intent.to_string());
    }

    lines.push(String::new());
    lines.push("## Config".to_string());
    lines.push(String::new());
    push_fenced(
        &mut lines,
        "json",
        &serde_json::to_string_pretty(config).unwrap_or_default(),
    );
    lines.push(String::new());

    lines.join("\n")
}

/// Renders the bounded compact context.
#[must_use]
pub fn render_compact(
    header: &ContextHeader<'_>,
    last_run: Option<&RunRecord>,
    intent: &str,
    config: &Config,
) -> String {
    let caps = &config.tracking.compact;
    let mut lines = vec!["# Sandwatch Compact Context".to_string(), String::new()];
    header.push_lines(&mut lines);
    lines.push(String::new());

    let Some(run) = last_run else {
        lines.push(NO_RUNS.to_string());
        return lines.join("\n");
    };

    lines.push(format!(
        "Last Run: {} ({}ms) @ {}",
        status_label(run),
        run.duration_ms,
        run.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    ));
    if let Some(failed) = run.exits.iter().find(|exit| !exit.succeeded()) {
        lines.push(format!("Failed Command: {} ({})", failed.name, exit_label(failed)));
    }
    lines.push(String::new());

    lines.push("Changes:".to_string());
    if run.changes.is_empty() {
        lines.push("- none".to_string());
    }
    for change in &run.changes {
        lines.push(change_line(change));
        if let Some(diff) = &change.diff {
            push_fenced(&mut lines, "diff", &head_lines(diff, caps.max_diff_lines));
        }
    }

    if let Some(outputs) = &run.outputs {
        let mut section = Vec::new();
        for (name, output) in outputs {
            if !output.stderr.trim().is_empty() {
                section.push(format!("- {name} stderr:"));
                push_fenced(&mut section, "", &tail_lines(&output.stderr, caps.max_stderr_lines));
            }
            if !run.ok && !output.stdout.trim().is_empty() {
                section.push(format!("- {name} stdout:"));
                push_fenced(&mut section, "", &tail_lines(&output.stdout, caps.max_stdout_lines));
            }
        }
        if !section.is_empty() {
            lines.push(String::new());
            lines.push("Outputs:".to_string());
            lines.extend(section);
        }
    }

    let intent = intent.trim();
    if !intent.is_empty() {
        lines.push(String::new());
        lines.push("Intent Notes:".to_string());
        lines.push(intent.to_string());
    }

    lines.push(String::new());
    lines.push("Config (summary):".to_string());
    lines.push(format!("- parallel: {}", config.parallel));
    lines.push(format!("- debounceMs: {}", config.debounce_ms));
    lines.push(format!("- restartOnChange: {}", config.restart_on_change));
    let names: Vec<&str> = config.commands.iter().map(|c| c.name.as_str()).collect();
    lines.push(format!(
        "- commands: {}",
        if names.is_empty() { "none".to_string() } else { names.join(", ") }
    ));

    lines.join("\n")
}

/// Renders the structured JSON bundle.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn render_structured(
    session: Option<&SessionDescriptor>,
    last_run: Option<&RunRecord>,
    intent: &str,
    agent: Option<&str>,
) -> Result<String> {
    let bundle = json!({
        "session": session,
        "lastRun": last_run,
        "intent": intent.trim(),
        "agent": agent,
    });
    Ok(serde_json::to_string_pretty(&bundle)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChangeKind, CommandOutput, SkipReason};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn header(root: &Path) -> ContextHeader<'_> {
        ContextHeader {
            sandbox_root: root,
            source_root: None,
            agent: Some("codex"),
        }
    }

    fn exit(name: &str, code: i32) -> ExitRecord {
        ExitRecord {
            name: name.to_string(),
            code: Some(code),
            signal: None,
        }
    }

    fn failed_run() -> RunRecord {
        let mut modified = ChangeRecord::new("a.txt", ChangeKind::Modified, None);
        modified.diff = Some("--- a.txt\n+++ a.txt\n@@ -1 +1 @@\n-hello\n+hello world\n".to_string());
        let mut binary = ChangeRecord::new("logo.png", ChangeKind::Added, None);
        binary.reason = Some(SkipReason::Binary);

        let mut outputs = BTreeMap::new();
        outputs.insert(
            "test".to_string(),
            CommandOutput {
                stdout: "running 3 tests\nok\nFAILED\n".to_string(),
                stderr: "panicked at src/lib.rs\n".to_string(),
                truncated: false,
            },
        );

        RunRecord {
            run_id: 4,
            timestamp: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
            agent: Some("codex".to_string()),
            ok: false,
            interrupted: false,
            duration_ms: 120,
            exits: vec![exit("build", 0), exit("test", 101)],
            changes: vec![modified, binary],
            outputs: Some(outputs),
        }
    }

    #[test]
    fn format_parses_case_insensitively() {
        assert_eq!("Compact".parse::<ContextFormat>(), Ok(ContextFormat::Compact));
        assert_eq!("json".parse::<ContextFormat>(), Ok(ContextFormat::Structured));
        assert!("yaml".parse::<ContextFormat>().is_err());
        assert_eq!(ContextFormat::Full.to_string(), "full");
    }

    #[test]
    fn full_without_runs() {
        let root = PathBuf::from("/sb");
        let text = render_full(&header(&root), None, "", &Config::default());

        assert!(text.starts_with("# Sandwatch Context\n\nSandbox: /sb\nAgent: codex\n\n## Last Run\nNo runs recorded yet.\n"));
        assert!(!text.contains("## Intent Notes"));
        assert!(text.contains("## Config\n\n```json\n{"));
    }

    #[test]
    fn full_lists_commands_changes_and_outputs() {
        let root = PathBuf::from("/sb");
        let run = failed_run();
        let text = render_full(&header(&root), Some(&run), "  fix parser\n", &Config::default());

        assert!(text.contains("Run ID: 4\nStatus: failed\nDuration: 120ms\n"));
        assert!(text.contains("Timestamp: 2026-01-02T03:04:05.000Z"));
        assert!(text.contains("Commands:\n- build: ok\n- test: exit 101\n"));
        assert!(text.contains("- modified: a.txt\n```diff\n--- a.txt"));
        assert!(text.contains("- added: logo.png (no diff: binary)"));
        assert!(text.contains("### test stdout\n```\nrunning 3 tests"));
        assert!(text.contains("## Intent Notes\nfix parser\n"));
    }

    #[test]
    fn full_is_deterministic() {
        let root = PathBuf::from("/sb");
        let run = failed_run();
        let config = Config::default();
        assert_eq!(
            render_full(&header(&root), Some(&run), "n", &config),
            render_full(&header(&root), Some(&run), "n", &config)
        );
    }

    #[test]
    fn compact_without_runs_stops_early() {
        let root = PathBuf::from("/sb");
        let text = render_compact(&header(&root), None, "note", &Config::default());
        assert_eq!(
            text,
            "# Sandwatch Compact Context\n\nSandbox: /sb\nAgent: codex\n\nNo runs recorded yet."
        );
    }

    #[test]
    fn compact_truncates_and_surfaces_first_failure() {
        let root = PathBuf::from("/sb");
        let mut config = Config::default();
        config.tracking.compact.max_diff_lines = 2;
        config.tracking.compact.max_stdout_lines = 1;

        let text = render_compact(&header(&root), Some(&failed_run()), "", &config);

        assert!(text.contains("Last Run: failed (120ms) @ 2026-01-02T03:04:05.000Z\n"));
        assert!(text.contains("Failed Command: test (exit 101)\n"));
        assert!(text.contains("```diff\n--- a.txt\n+++ a.txt\n```"));
        assert!(text.contains("- test stderr:\n```\npanicked at src/lib.rs\n```"));
        assert!(text.contains("- test stdout:\n```\nFAILED\n```"));
        assert!(text.ends_with("- parallel: true\n- debounceMs: 250\n- restartOnChange: true\n- commands: noop"));
    }

    #[test]
    fn compact_hides_stdout_of_successful_runs() {
        let root = PathBuf::from("/sb");
        let mut run = failed_run();
        run.ok = true;
        run.exits = vec![exit("test", 0)];
        run.changes.clear();

        let text = render_compact(&header(&root), Some(&run), "", &Config::default());
        assert!(text.contains("Changes:\n- none\n"));
        assert!(!text.contains("Failed Command"));
        assert!(!text.contains("stdout:"));
        assert!(text.contains("- test stderr:"));
    }

    #[test]
    fn structured_bundle_has_all_keys() {
        let run = failed_run();
        let text = render_structured(None, Some(&run), "\nnote\n", Some("codex")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();

        assert!(value["session"].is_null());
        assert_eq!(value["lastRun"]["runId"], 4);
        assert_eq!(value["intent"], "note");
        assert_eq!(value["agent"], "codex");
    }
}
