//! Error types for the backup engine.
//!
//! `EngineError` is what `Task::backup`, `Task::restore` and `Task::inspect`
//! hand back to the caller. The collaborators underneath (archiver,
//! compressor, encryptor) speak `std::io::Result`; the task turns their
//! failures into `StageFailed` at the stage boundary, so the caller always
//! learns which stage stopped the pipeline.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::model::Action;

/// Errors that stop a backup or restore.
///
/// Configuration errors are raised before any stage runs. `InvalidArchive`
/// and `WrongPassword` are kept apart from `StageFailed` because the caller
/// reports them differently.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Source tree to back up does not exist
    #[error("no such file or directory: {}", path.display())]
    SourceNotFound { path: PathBuf },

    /// Archive to restore or inspect does not exist
    #[error("no such archive: {}", path.display())]
    ArchiveNotFound { path: PathBuf },

    /// Destination base name does not follow the archive-name grammar
    #[error("invalid file name: {name}")]
    InvalidArchiveName { name: String },

    /// Path or name filter is not a valid regular expression
    #[error("invalid regular expression: {pattern}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// The mode calls for encryption but no password was supplied
    #[error("a password is required for encrypted archives")]
    PasswordRequired,

    /// Password below the minimum length
    #[error("password must be at least {min} characters in length")]
    PasswordTooShort { min: usize },

    /// Header checksum mismatch, unknown mode bits, or a file too short to
    /// carry a header
    #[error("invalid file: {}", path.display())]
    InvalidArchive { path: PathBuf },

    /// The password does not unlock the archive
    #[error("wrong password")]
    WrongPassword,

    /// A pipeline stage failed
    #[error("failed to {action} file: {source}")]
    StageFailed {
        action: Action,
        #[source]
        source: io::Error,
    },

    /// Filesystem error outside any stage (opening the archive for inspection)
    #[error("failed to open file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl EngineError {
    /// Shorthand used by the task when a collaborator fails.
    pub(crate) fn stage(action: Action, source: io::Error) -> Self {
        EngineError::StageFailed { action, source }
    }
}
