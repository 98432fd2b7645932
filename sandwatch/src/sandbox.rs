//! Sandbox creation, lookup and cleanup.
//!
//! A sandbox is a copy of a source tree in which commands run and edits are
//! tracked. Each source tree keeps a registry (`.sandwatch/state.json`) of
//! the sandboxes created for it, the most recent of which is the default
//! target for later commands.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use sandwatch::config::Config;
//! use sandwatch::sandbox::{create_sandbox, resolve_sandbox};
//!
//! let source = Path::new(".");
//! let sandbox = create_sandbox(source, &Config::default(), None).expect("create");
//! assert_eq!(resolve_sandbox(source, None), Some(sandbox));
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::ignore::IgnoreRules;
use crate::layout::{SandboxLayout, SourceLayout};
use crate::store::{read_json, write_json};
use crate::tree::{copy_tree, create_symlink};
use crate::types::{Registry, SandboxMeta};

/// Length of the random suffix in sandbox identifiers.
const SANDBOX_ID_SUFFIX_LEN: usize = 6;

/// Base-36 alphabet used for the random suffix.
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generates a sandbox identifier: creation time in milliseconds followed by
/// a short random base-36 suffix, e.g. `1717000000000-k3x9qa`.
#[must_use]
pub fn generate_sandbox_id() -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..SANDBOX_ID_SUFFIX_LEN)
        .map(|_| BASE36[rng.random_range(0..BASE36.len())] as char)
        .collect();
    format!("{}-{suffix}", Utc::now().timestamp_millis())
}

/// Creates (or adopts) a sandbox for `source_root`.
///
/// An `explicit` path that already names a directory is reused as-is with no
/// copy. Otherwise the sandbox is allocated (at `explicit`, or under
/// `.sandwatch/sandboxes/` in the source tree), populated with every
/// non-ignored entry, optionally given a link to the dependency directory,
/// and stamped with metadata. Either way it becomes the registry's most
/// recent sandbox.
///
/// # Errors
///
/// Returns an error if the source cannot be read, the copy fails, or the
/// metadata or registry cannot be written.
pub fn create_sandbox(source_root: &Path, config: &Config, explicit: Option<&Path>) -> Result<PathBuf> {
    let source_root = fs::canonicalize(source_root)?;
    let source = SourceLayout::new(&source_root);
    fs::create_dir_all(source.control_dir())?;

    let sandbox_root = match explicit {
        Some(path) => source_root.join(path),
        None => source.sandboxes_dir().join(generate_sandbox_id()),
    };

    if sandbox_root.is_dir() && explicit.is_some() {
        info!(sandbox = %sandbox_root.display(), "Reusing existing sandbox directory");
        let layout = SandboxLayout::new(&sandbox_root);
        if !layout.meta_file().exists() {
            write_meta(&source_root, &sandbox_root, config)?;
        }
    } else {
        fs::create_dir_all(&sandbox_root)?;
        let sandbox_root = fs::canonicalize(&sandbox_root)?;
        let ignore = IgnoreRules::new(&config.ignore)?;
        let copied = copy_tree(&source_root, &sandbox_root, &ignore)?;
        info!(
            sandbox = %sandbox_root.display(),
            files = copied,
            "Created sandbox"
        );

        if config.link_dependencies {
            link_dependency_dir(&source_root, &sandbox_root, &config.dependency_dir);
        }
        write_meta(&source_root, &sandbox_root, config)?;
    }

    let sandbox_root = fs::canonicalize(&sandbox_root)?;
    register(&source, &sandbox_root)?;
    Ok(sandbox_root)
}

fn write_meta(source_root: &Path, sandbox_root: &Path, config: &Config) -> Result<()> {
    let meta = SandboxMeta {
        source_root: source_root.to_path_buf(),
        sandbox_root: sandbox_root.to_path_buf(),
        created_at: Utc::now(),
        config: config.clone(),
    };
    write_json(&SandboxLayout::new(sandbox_root).meta_file(), &meta)
}

/// Links `<source>/<dir>` into the sandbox. Failures are logged, not raised.
fn link_dependency_dir(source_root: &Path, sandbox_root: &Path, dir: &str) {
    let src = source_root.join(dir);
    let dest = sandbox_root.join(dir);
    if !src.is_dir() {
        debug!(dir = %dir, "No dependency directory to link");
        return;
    }
    if fs::symlink_metadata(&dest).is_ok() {
        return;
    }
    if let Err(e) = create_symlink(&src, &dest) {
        warn!(dir = %dir, error = %e, "Failed to link dependency directory");
    }
}

fn register(source: &SourceLayout, sandbox_root: &Path) -> Result<()> {
    let mut registry = read_registry(source.root());
    registry.register(sandbox_root.to_path_buf());
    write_json(&source.state_file(), &registry)
}

/// Reads the registry of `source_root`, or an empty one.
#[must_use]
pub fn read_registry(source_root: &Path) -> Registry {
    read_json(&SourceLayout::new(source_root).state_file()).unwrap_or_default()
}

/// Finds the sandbox to operate on.
///
/// An explicit path (resolved against `source_root`) always wins. Otherwise
/// the registry's most recent sandbox is returned if it still exists.
#[must_use]
pub fn resolve_sandbox(source_root: &Path, explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(source_root.join(path));
    }
    read_registry(source_root)
        .last_sandbox
        .filter(|path| path.is_dir())
}

/// Reads sandbox metadata, if present and valid.
#[must_use]
pub fn read_meta(sandbox_root: &Path) -> Option<SandboxMeta> {
    read_json(&SandboxLayout::new(sandbox_root).meta_file())
}

/// Deletes every default-location sandbox of `source_root`.
///
/// Registry entries pointing at removed sandboxes are dropped. Calling this
/// when nothing exists is a no-op.
///
/// # Errors
///
/// Returns an error if removal or the registry write fails.
pub fn clean_sandboxes(source_root: &Path) -> Result<()> {
    let source = SourceLayout::new(source_root);
    let dir = source.sandboxes_dir();
    if dir.exists() {
        fs::remove_dir_all(&dir)?;
        info!(dir = %dir.display(), "Removed sandboxes");
    }

    if source.state_file().exists() {
        let mut registry = read_registry(source_root);
        registry.sandboxes.retain(|path| path.is_dir());
        if registry.last_sandbox.as_ref().is_some_and(|p| !p.is_dir()) {
            registry.last_sandbox = registry.sandboxes.last().cloned();
        }
        write_json(&source.state_file(), &registry)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn source_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/main.rs"), "fn main() {}\n").unwrap();
        fs::create_dir_all(dir.path().join("node_modules/dep")).unwrap();
        fs::write(dir.path().join("node_modules/dep/index.js"), "x").unwrap();
        dir
    }

    #[test]
    fn sandbox_id_format() {
        let id = generate_sandbox_id();
        let (stamp, suffix) = id.split_once('-').unwrap();
        assert!(stamp.parse::<i64>().is_ok());
        assert_eq!(suffix.len(), SANDBOX_ID_SUFFIX_LEN);
        assert!(suffix.bytes().all(|b| BASE36.contains(&b)));
    }

    #[test]
    fn create_copies_tree_and_registers() {
        let source = source_tree();
        let sandbox = create_sandbox(source.path(), &Config::default(), None).unwrap();

        assert!(sandbox.starts_with(fs::canonicalize(source.path()).unwrap()));
        assert_eq!(
            fs::read_to_string(sandbox.join("src/main.rs")).unwrap(),
            "fn main() {}\n"
        );
        assert!(SandboxLayout::new(&sandbox).meta_file().exists());
        assert_eq!(resolve_sandbox(source.path(), None), Some(sandbox.clone()));

        let meta = read_meta(&sandbox).unwrap();
        assert_eq!(meta.sandbox_root, sandbox);
        assert_eq!(meta.source_root, fs::canonicalize(source.path()).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn dependency_dir_is_linked_not_copied() {
        let source = source_tree();
        let sandbox = create_sandbox(source.path(), &Config::default(), None).unwrap();

        let meta = fs::symlink_metadata(sandbox.join("node_modules")).unwrap();
        assert!(meta.file_type().is_symlink());
        assert!(sandbox.join("node_modules/dep/index.js").exists());
    }

    #[test]
    fn dependency_link_can_be_disabled() {
        let source = source_tree();
        let config = Config {
            link_dependencies: false,
            ..Config::default()
        };
        let sandbox = create_sandbox(source.path(), &config, None).unwrap();
        assert!(fs::symlink_metadata(sandbox.join("node_modules")).is_err());
    }

    #[test]
    fn explicit_existing_directory_is_reused_without_copy() {
        let source = source_tree();
        let existing = TempDir::new().unwrap();
        fs::write(existing.path().join("mine.txt"), "keep").unwrap();

        let sandbox =
            create_sandbox(source.path(), &Config::default(), Some(existing.path())).unwrap();

        assert_eq!(sandbox, fs::canonicalize(existing.path()).unwrap());
        assert!(!sandbox.join("src/main.rs").exists());
        assert_eq!(fs::read_to_string(sandbox.join("mine.txt")).unwrap(), "keep");
        assert_eq!(read_registry(source.path()).last_sandbox, Some(sandbox));
    }

    #[test]
    fn resolve_without_registry_is_none() {
        let source = source_tree();
        assert_eq!(resolve_sandbox(source.path(), None), None);
        assert_eq!(
            resolve_sandbox(source.path(), Some(Path::new("elsewhere"))),
            Some(source.path().join("elsewhere"))
        );
    }

    #[test]
    fn clean_is_idempotent_and_forgets_removed_sandboxes() {
        let source = source_tree();
        create_sandbox(source.path(), &Config::default(), None).unwrap();

        clean_sandboxes(source.path()).unwrap();
        assert!(!SourceLayout::new(source.path()).sandboxes_dir().exists());
        assert_eq!(resolve_sandbox(source.path(), None), None);
        assert!(read_registry(source.path()).sandboxes.is_empty());

        clean_sandboxes(source.path()).unwrap();
    }
}
