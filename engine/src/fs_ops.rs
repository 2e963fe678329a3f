//! Filesystem operations module.
//!
//! This module provides the low-level file handling the pipeline needs:
//! - Building and stripping the artifact suffix chain
//! - Opening an artifact's payload (everything before the header trailer)
//! - Removing intermediate artifacts
//! - Creating parent directories

use std::ffi::OsString;
use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use crate::model::Stage;

/// Append `suffix` to the final component of `path` (`out` -> `out.tar`).
pub fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

/// Remove `suffix` from the end of `path`, if it is there and something is
/// left of the file name afterwards.
pub fn strip_suffix(path: &Path, suffix: &str) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(suffix)?;
    if stem.is_empty() {
        return None;
    }
    Some(path.with_file_name(stem))
}

/// Concatenated suffixes of `stages`, in order.
pub fn suffix_chain(stages: &[Stage]) -> String {
    stages.iter().map(|s| s.suffix()).collect()
}

/// Base name restore derives intermediates from.
///
/// If the artifact still carries the full suffix chain of its mode, the chain
/// is stripped (`out.tar.zst.ept` -> `out`). A renamed artifact keeps its name
/// and intermediates get the remaining chain appended to it, so they never
/// collide with the artifact itself.
pub fn restore_base(artifact: &Path, stages: &[Stage]) -> PathBuf {
    strip_suffix(artifact, &suffix_chain(stages)).unwrap_or_else(|| artifact.to_path_buf())
}

/// Name of the intermediate that still has `remaining` stages applied.
pub fn intermediate_path(base: &Path, remaining: &[Stage]) -> PathBuf {
    append_suffix(base, &suffix_chain(remaining))
}

/// Like `intermediate_path`, but never names something that already exists:
/// when the plain name is taken a numbered variant is used
/// (`out.tar` -> `out.1.tar`).
pub fn unused_intermediate_path(base: &Path, remaining: &[Stage]) -> io::Result<PathBuf> {
    const MAX_ATTEMPTS: u32 = 1000;

    let chain = suffix_chain(remaining);
    let mut candidate = append_suffix(base, &chain);
    for n in 1..=MAX_ATTEMPTS {
        match fs::symlink_metadata(&candidate) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(candidate),
            Err(e) => return Err(e),
            Ok(_) => candidate = append_suffix(base, &format!(".{}{}", n, chain)),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free name for {}{}", base.display(), chain),
    ))
}

/// Create `path` for writing, failing if anything already exists there.
pub fn create_new(path: &Path) -> io::Result<fs::File> {
    fs::OpenOptions::new().write(true).create_new(true).open(path)
}

/// Open `path` for reading, excluding the last `trailer_len` bytes.
pub fn open_payload(path: &Path, trailer_len: u64) -> io::Result<io::Take<fs::File>> {
    let file = fs::File::open(path)?;
    let len = file.metadata()?.len();
    if len < trailer_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} is too short to hold a backup", path.display()),
        ));
    }
    Ok(file.take(len - trailer_len))
}

/// Delete an artifact whose successor has been written.
///
/// Failure is logged and otherwise ignored: the pipeline already holds a good
/// copy of the data in the next artifact.
pub fn remove_artifact(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed intermediate artifact"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not remove intermediate artifact"),
    }
}

/// Delete the partial output of a stage that failed.
pub fn discard_partial(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "discarded partial artifact"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not discard partial artifact"),
    }
}

/// Ensure the parent directory of a path exists, creating it if necessary.
///
/// # Errors
/// Fails if the parent exists but is not a directory, or cannot be created.
pub fn ensure_parent_dir_exists(path: &Path) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => return Ok(()),
    };

    match fs::metadata(parent) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} exists but is not a directory", parent.display()),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir_all(parent),
        Err(e) => Err(e),
    }
}

/// Join an archive-relative path onto `root`, refusing anything that would
/// leave it (absolute paths, `..`).
pub fn safe_join(root: &Path, relative: &Path) -> io::Result<PathBuf> {
    let mut out = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("refusing to unpack {} outside the target", relative.display()),
                ))
            }
        }
    }
    Ok(out)
}

/// Absolute form of `path` without touching the filesystem.
pub fn absolute(path: &Path) -> io::Result<PathBuf> {
    let path = if path.as_os_str().is_empty() {
        Path::new(".")
    } else {
        path
    };
    std::path::absolute(path)
}
