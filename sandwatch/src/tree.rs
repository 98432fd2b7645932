//! Tree walking, content hashing and copying.
//!
//! All paths handed out by this module are relative to the walked root and
//! use `/` as the separator on every platform. Symbolic links are never
//! followed: they are reported, hashed and copied as links. Sockets, FIFOs
//! and device nodes are skipped entirely.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{trace, warn};
use walkdir::WalkDir;

use crate::error::Result;
use crate::ignore::IgnoreRules;
use crate::types::FileRecord;

/// Kind of a walked entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
    Symlink,
}

/// One entry produced by [`walk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Root-relative, forward-slash path.
    pub rel: String,
    /// Absolute path on disk.
    pub path: PathBuf,
    pub kind: EntryKind,
}

/// Converts `path` under `root` into a forward-slash relative path.
///
/// Returns `None` if `path` is not below `root` or contains `..`.
#[must_use]
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(parts.join("/"))
}

/// Resolves a forward-slash relative path under `root`.
#[must_use]
pub fn join_rel(root: &Path, rel: &str) -> PathBuf {
    rel.split('/')
        .filter(|part| !part.is_empty())
        .fold(root.to_path_buf(), |acc, part| acc.join(part))
}

/// Walks `root`, skipping ignored paths and the optional `exclude` subtree.
///
/// Entries are yielded parents-first in file-name order. Entries that vanish
/// mid-walk are skipped.
///
/// # Errors
///
/// Returns an error if the root cannot be read or an entry fails for a
/// reason other than disappearing.
pub fn walk(root: &Path, ignore: &IgnoreRules, exclude: Option<&Path>) -> Result<Vec<TreeEntry>> {
    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            if exclude.is_some_and(|skip| e.path() == skip) {
                return false;
            }
            match relative_path(root, e.path()) {
                Some(rel) => !ignore.is_ignored(&rel),
                None => false,
            }
        });

    let mut entries = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if is_vanished(&err) => {
                trace!(error = %err, "Entry vanished during walk");
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        let file_type = entry.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Dir
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            continue;
        };

        let Some(rel) = relative_path(root, entry.path()) else {
            continue;
        };
        entries.push(TreeEntry {
            rel,
            path: entry.into_path(),
            kind,
        });
    }
    Ok(entries)
}

fn is_vanished(err: &walkdir::Error) -> bool {
    err.io_error()
        .is_some_and(|io| io.kind() == io::ErrorKind::NotFound)
}

/// Streams a file through SHA-256 and returns the lowercase hex digest.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be read.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Describes the entry at `path` without following links.
///
/// Returns `Ok(None)` when the path does not exist or is a directory or
/// other non-regular entry.
///
/// # Errors
///
/// Returns an I/O error for failures other than absence.
pub fn file_record(path: &Path) -> io::Result<Option<FileRecord>> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };

    let file_type = meta.file_type();
    if file_type.is_symlink() {
        let target = fs::read_link(path)?;
        return Ok(Some(FileRecord::Symlink {
            link_target: target.to_string_lossy().into_owned(),
        }));
    }
    if file_type.is_file() {
        return match hash_file(path) {
            Ok(hash) => Ok(Some(FileRecord::File {
                hash,
                size: meta.len(),
            })),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        };
    }
    Ok(None)
}

/// Creates a symbolic link at `link` pointing to `target`.
///
/// # Errors
///
/// Returns an I/O error if the link cannot be created.
#[cfg(unix)]
pub fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

/// Creates a symbolic link at `link` pointing to `target`.
///
/// # Errors
///
/// Returns an I/O error if the link cannot be created.
#[cfg(windows)]
pub fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    let resolved = link.parent().map_or_else(|| target.to_path_buf(), |p| p.join(target));
    if resolved.is_dir() {
        std::os::windows::fs::symlink_dir(target, link)
    } else {
        std::os::windows::fs::symlink_file(target, link)
    }
}

/// Removes a file, link or directory tree. Absence is not an error.
///
/// # Errors
///
/// Returns an I/O error if removal fails.
pub fn remove_path(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Copies one entry to `dest`, creating parent directories.
///
/// Links are recreated with the same target. Anything already at `dest` of a
/// different kind, or any link, is replaced rather than written through.
///
/// # Errors
///
/// Returns an I/O error if reading or writing fails.
pub fn copy_entry(src: &Path, dest: &Path, kind: EntryKind) -> io::Result<()> {
    if kind == EntryKind::Dir {
        if fs::symlink_metadata(dest).is_ok_and(|m| !m.is_dir()) {
            remove_path(dest)?;
        }
        return fs::create_dir_all(dest);
    }

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    if let Ok(existing) = fs::symlink_metadata(dest) {
        if existing.is_dir() || existing.file_type().is_symlink() || kind == EntryKind::Symlink {
            remove_path(dest)?;
        }
    }

    match kind {
        EntryKind::Symlink => {
            let target = fs::read_link(src)?;
            create_symlink(&target, dest)
        }
        _ => fs::copy(src, dest).map(|_| ()),
    }
}

/// Copies every non-ignored entry from `src` into `dest`.
///
/// If `dest` is nested inside `src` it is excluded from the walk. Returns
/// the number of files and links copied.
///
/// # Errors
///
/// Returns an error if walking or copying fails.
pub fn copy_tree(src: &Path, dest: &Path, ignore: &IgnoreRules) -> Result<usize> {
    fs::create_dir_all(dest)?;
    let exclude = dest.starts_with(src).then_some(dest);

    let mut copied = 0;
    for entry in walk(src, ignore, exclude)? {
        let target = join_rel(dest, &entry.rel);
        match copy_entry(&entry.path, &target, entry.kind) {
            Ok(()) => {
                if entry.kind != EntryKind::Dir {
                    copied += 1;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(path = %entry.rel, "Skipping entry that vanished during copy");
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(copied)
}
