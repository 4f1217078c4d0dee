//! Utility functions for docseal
//!
//! Hashing primitives, crash-safe file writes, exclusive publication of
//! new files, and path canonicalization.
//!
//! ## Hashing
//!
//! Two structurally unrelated primitives are used side by side:
//!
//! - **SHA-256** (Merkle–Damgård over a Davies–Meyer compression function)
//! - **BLAKE3** (tree hash over a ChaCha-derived compression function)
//!
//! A collision crafted for one gives no leverage against the other, and the
//! combined digest binds both into a single value.
//!
//! ## Atomic Writes
//!
//! [`atomic_write`] writes to a uniquely named sibling temp file, fsyncs it
//! and renames it over the target. [`create_exclusive`] does the same but
//! publishes with a hard link, which fails if the target already exists, so
//! the file appears complete or not at all and only one writer wins.

use crate::error::{DocsealError, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::trace;

/// Hex encoding of an all-zero 32-byte digest
pub const ZERO_DIGEST: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Hash arbitrary data using SHA-256, returning raw bytes
pub fn sha256_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hash arbitrary data using BLAKE3, returning raw bytes
pub fn blake3_bytes(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Hash arbitrary data using SHA-256
///
/// Returns the digest as a 64-character hexadecimal string.
///
/// # Example
///
/// ```rust,ignore
/// use crate::utils::hash_data;
///
/// let hash = hash_data(b"Hello, world!");
/// assert_eq!(hash.len(), 64);
/// assert_eq!(hash, hash_data(b"Hello, world!"));
/// ```
pub fn hash_data(data: &[u8]) -> String {
    hex::encode(sha256_bytes(data))
}

/// Read a whole file, mapping failures to [`DocsealError::ResourceUnavailable`]
pub fn read_file(path: &Path) -> Result<Vec<u8>> {
    let mut file =
        File::open(path).map_err(|e| DocsealError::unavailable(path.display().to_string(), e))?;
    let mut content = Vec::new();
    file.read_to_end(&mut content)
        .map_err(|e| DocsealError::unavailable(path.display().to_string(), e))?;
    Ok(content)
}

/// Read a file if it exists
///
/// Returns `Ok(None)` when the file is missing; any other failure is an error.
pub fn read_file_if_exists(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(DocsealError::unavailable(path.display().to_string(), e)),
    }
}

/// Sibling temp path with a unique name, e.g. `.doc.txt.<uuid>.tmp`
fn temp_sibling(path: &Path) -> PathBuf {
    let temp_name = format!(
        ".{}.{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        uuid::Uuid::new_v4().simple()
    );
    path.with_file_name(temp_name)
}

fn write_synced(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(content)?;
    file.sync_all()
}

#[cfg(unix)]
fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) {}

/// Atomic file write (write to temp file then rename)
///
/// The target is never observed half-written: readers see either the old
/// content or the new content. An existing target keeps its permissions.
///
/// # Errors
///
/// - [`DocsealError::ResourceUnavailable`] if the temp file cannot be
///   written or the rename fails
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let permissions = fs::metadata(path).ok().map(|m| m.permissions());
    let temp_path = temp_sibling(path);
    let outcome = write_synced(&temp_path, content)
        .and_then(|_| match permissions {
            Some(permissions) => fs::set_permissions(&temp_path, permissions),
            None => Ok(()),
        })
        .and_then(|_| fs::rename(&temp_path, path));
    if let Err(e) = outcome {
        let _ = fs::remove_file(&temp_path);
        return Err(DocsealError::unavailable(path.display().to_string(), e));
    }
    sync_parent(path);
    trace!("Atomically wrote {} bytes to {:?}", content.len(), path);
    Ok(())
}

/// Unix mode bits of a file, if it exists
#[cfg(unix)]
pub fn file_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).ok().map(|m| m.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
pub fn file_mode(_path: &Path) -> Option<u32> {
    None
}

/// Apply unix mode bits recorded by [`file_mode`]
#[cfg(unix)]
pub fn set_file_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| DocsealError::unavailable(path.display().to_string(), e))
}

#[cfg(not(unix))]
pub fn set_file_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Publish a new file only if nothing exists at `path`
///
/// Returns `Ok(false)` if another writer got there first.
pub fn create_exclusive(path: &Path, content: &[u8]) -> Result<bool> {
    let temp_path = temp_sibling(path);
    write_synced(&temp_path, content)
        .map_err(|e| DocsealError::unavailable(temp_path.display().to_string(), e))?;

    let linked = fs::hard_link(&temp_path, path);
    let _ = fs::remove_file(&temp_path);
    match linked {
        Ok(()) => {
            sync_parent(path);
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(DocsealError::unavailable(path.display().to_string(), e)),
    }
}

/// Remove a file, treating "already gone" as success
///
/// Returns whether a file was actually removed.
pub fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(DocsealError::unavailable(path.display().to_string(), e)),
    }
}

/// Lexically normalize `.` and `..` components
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolve `path` against `base` and canonicalize it
///
/// The file itself does not have to exist: the deepest existing ancestor is
/// canonicalized (resolving symlinks) and the remaining components are
/// appended. This gives tracked files a stable key even after a mutation
/// deletes them.
///
/// # Example
///
/// ```rust,ignore
/// use crate::utils::canonical_path;
/// use std::path::Path;
///
/// let base = Path::new("/srv/docs");
/// let p = canonical_path(base, Path::new("drafts/../doc.txt"))?;
/// assert_eq!(p, Path::new("/srv/docs/doc.txt"));
/// ```
pub fn canonical_path(base: &Path, path: &Path) -> Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };
    let normalized = normalize_lexically(&joined);

    let mut existing = normalized.as_path();
    let mut tail: Vec<&std::ffi::OsStr> = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(canon) => {
                let mut resolved = canon;
                for part in tail.iter().rev() {
                    resolved.push(part);
                }
                return Ok(resolved);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                match (existing.file_name(), existing.parent()) {
                    (Some(name), Some(parent)) => {
                        tail.push(name);
                        existing = parent;
                    }
                    _ => return Ok(normalized),
                }
            }
            Err(e) => return Err(DocsealError::unavailable(normalized.display().to_string(), e)),
        }
    }
}

/// Format bytes in human-readable form
///
/// ```rust,ignore
/// use crate::utils::format_bytes;
///
/// assert_eq!(format_bytes(1023), "1023 B");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
