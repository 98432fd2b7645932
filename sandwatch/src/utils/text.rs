//! Small text helpers for logs and rendered contexts.

/// Formats a duration for humans: `850ms` below one second, `1.25s` above.
#[must_use]
pub fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        format!("{ms}ms")
    } else {
        format!("{:.2}s", ms as f64 / 1000.0)
    }
}

/// Keeps the first `max_lines` lines of `text`.
///
/// Text that already fits is returned unchanged, trailing newline included.
#[must_use]
pub fn head_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= max_lines {
        return text.to_string();
    }
    lines[..max_lines].join("\n")
}

/// Keeps the last `max_lines` lines of `text`.
#[must_use]
pub fn tail_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= max_lines {
        return text.to_string();
    }
    lines[lines.len() - max_lines..].join("\n")
}
