//! Path normalization, mount lookup, and the symlink-resolution envelope.
//!
//! The combined open-with-symlink-handling primitive exists because testing
//! symlink-ness separately before opening is racy: another actor could
//! replace the file between the test and the open. Per-component symlink
//! races are tolerable — if a mid-path component is replaced by a symlink
//! after resolution passed it, the whole operation just fails atomically on
//! its next attempt.

use std::sync::Arc;

use crate::config::Limits;
use crate::error::{Errno, Result};

use super::mount::{FilesystemBackend, MountTable};

/// Produce an absolute, canonical path from `base` and `input`.
///
/// - A leading `/` in `input` discards `base` entirely.
/// - `..` pops one segment; at the root it is a no-op.
/// - A trailing single `.` is preserved (required for correct no-follow
///   semantics when the final component is a symlink naming a directory).
/// - A trailing `/` is stripped unless the result is exactly `/`.
pub fn normalize(base: &str, input: &str) -> String {
    let trailing_dot = input == "." || input.ends_with("/.");
    let combined = if input.starts_with('/') {
        input.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), input)
    };

    let mut segments: Vec<&str> = Vec::new();
    for segment in combined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }

    let mut output = String::from("/");
    output.push_str(&segments.join("/"));
    if trailing_dot {
        if output != "/" {
            output.push('/');
        }
        output.push('.');
    }
    output
}

/// Scan the mount table for the longest prefix match, returning the owning
/// backend and the filesystem-relative subpath (leading `/` stripped).
pub fn find_filesystem(
    mounts: &MountTable,
    path: &str,
) -> Result<(Arc<dyn FilesystemBackend>, String)> {
    mounts.longest_prefix(path).ok_or(Errno::NotFound)
}

/// Given that a prior operation on `subpath` (relative to `fs`) reported
/// "not found", scan right-to-left for a directory component that is
/// itself a symlink; splice its target in and re-normalize.
///
/// Returns the rewritten absolute path on success. `Errno::NotFound` means
/// no component resolved as a symlink (the caller's original error stands);
/// any other error propagates immediately.
pub fn resolve_symlink_component(
    fs: &dyn FilesystemBackend,
    full_path: &str,
    subpath: &str,
) -> Result<String> {
    let components: Vec<&str> = subpath.split('/').filter(|s| !s.is_empty()).collect();
    for i in (0..components.len()).rev() {
        let candidate = components[..=i].join("/");
        match fs.readlink(&candidate) {
            Ok(target) => {
                let tail = components[i + 1..].join("/");
                let mount_prefix = &full_path[..full_path.len() - subpath.len()];
                let rewritten = if tail.is_empty() {
                    target
                } else {
                    format!("{target}/{tail}")
                };
                return Ok(normalize(mount_prefix, &rewritten));
            }
            Err(Errno::NotFound) => continue,
            Err(other) => return Err(other),
        }
    }
    Err(Errno::NotFound)
}

/// Outcome of a backend's `open`: either the file opened, or the backend
/// discovered the target is itself a symlink and wrote its target into
/// `target_buf`.
pub enum OpenOutcome<F> {
    Opened(F),
    IsSymlink(String),
}

/// Retry loop shared by every pathname operation: attempt the operation
/// against the resolved path; on "not found", try splicing in a symlink
/// target and retry; bounded by `limits.max_symlink_level`.
pub fn resolve_and<T>(
    mounts: &MountTable,
    limits: &Limits,
    path: &str,
    mut attempt: impl FnMut(&dyn FilesystemBackend, &str) -> Result<T>,
) -> Result<T> {
    let mut current = path.to_string();
    for _ in 0..limits.max_symlink_level {
        let (fs, subpath) = find_filesystem(mounts, &current)?;
        match attempt(fs.as_ref(), &subpath) {
            Err(Errno::NotFound) => match resolve_symlink_component(fs.as_ref(), &current, &subpath) {
                Ok(rewritten) => {
                    current = rewritten;
                    continue;
                }
                Err(Errno::NotFound) => return Err(Errno::NotFound),
                Err(other) => return Err(other),
            },
            other => return other,
        }
    }
    Err(Errno::LoopLimit)
}

/// Open `path` with symlink handling: retries the backend's `open`,
/// following a reported symlink target (stripping the basename first) or
/// falling back to the generic not-found resolution envelope.
pub fn open_with_symlink_handling<F>(
    mounts: &MountTable,
    limits: &Limits,
    path: &str,
    mut open_attempt: impl FnMut(&dyn FilesystemBackend, &str) -> Result<OpenOutcome<F>>,
) -> Result<F> {
    let mut current = path.to_string();
    for _ in 0..limits.max_symlink_level {
        let (fs, subpath) = find_filesystem(mounts, &current)?;
        match open_attempt(fs.as_ref(), &subpath) {
            Ok(OpenOutcome::Opened(file)) => return Ok(file),
            Ok(OpenOutcome::IsSymlink(target)) => {
                let dir = match current.rfind('/') {
                    Some(0) => "/",
                    Some(idx) => &current[..idx],
                    None => "/",
                };
                current = normalize(dir, &target);
                continue;
            }
            Err(Errno::NotFound) => match resolve_symlink_component(fs.as_ref(), &current, &subpath) {
                Ok(rewritten) => {
                    current = rewritten;
                    continue;
                }
                Err(Errno::NotFound) => return Err(Errno::NotFound),
                Err(other) => return Err(other),
            },
            Err(other) => return Err(other),
        }
    }
    Err(Errno::LoopLimit)
}
