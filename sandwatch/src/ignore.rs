//! Glob predicates over tree-relative paths.
//!
//! Patterns are matched against forward-slash, root-relative paths. `*` does
//! not cross a `/`, `**` does, and dot-files match like any other name.
//! The control directory is always ignored regardless of configuration.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::config::CONTROL_DIR;

/// Compiles `patterns` into a set with `*` confined to one path segment.
///
/// # Errors
///
/// Returns `globset::Error` for a malformed pattern.
pub fn build_globset<I, S>(patterns: I) -> Result<GlobSet, globset::Error>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern.as_ref())
            .literal_separator(true)
            .build()?;
        builder.add(glob);
    }
    builder.build()
}

/// Ignore predicate used by every walk, copy, diff and apply.
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    set: GlobSet,
}

impl IgnoreRules {
    /// Builds rules from configured patterns plus the control directory.
    ///
    /// # Errors
    ///
    /// Returns `globset::Error` for a malformed pattern.
    pub fn new(patterns: &[String]) -> Result<Self, globset::Error> {
        Self::with_reserved(patterns, &[])
    }

    /// Builds rules that additionally ignore the given directory names
    /// (and everything below them) at the root.
    ///
    /// # Errors
    ///
    /// Returns `globset::Error` for a malformed pattern.
    pub fn with_reserved(patterns: &[String], reserved: &[&str]) -> Result<Self, globset::Error> {
        let mut all: Vec<String> = patterns.to_vec();
        for name in std::iter::once(CONTROL_DIR).chain(reserved.iter().copied()) {
            all.push(name.to_string());
            all.push(format!("{name}/**"));
        }
        Ok(Self {
            set: build_globset(&all)?,
        })
    }

    /// Returns true if `rel` is excluded. The root itself is never excluded.
    #[must_use]
    pub fn is_ignored(&self, rel: &str) -> bool {
        if rel.is_empty() || rel == "." {
            return false;
        }
        self.set.is_match(rel)
    }
}

/// Watch predicate: which changed paths are allowed to trigger a run.
#[derive(Debug, Clone)]
pub struct WatchRules {
    set: GlobSet,
}

impl WatchRules {
    /// Builds the predicate from the configured `watch` globs.
    ///
    /// # Errors
    ///
    /// Returns `globset::Error` for a malformed pattern.
    pub fn new(patterns: &[String]) -> Result<Self, globset::Error> {
        Ok(Self {
            set: build_globset(patterns)?,
        })
    }

    #[must_use]
    pub fn is_watched(&self, rel: &str) -> bool {
        self.set.is_match(rel)
    }
}
