//! Task orchestration module.
//!
//! A `Task` drives one backup or one restore:
//! - Backup: validate, pack, optionally compress and encrypt, append the header
//! - Restore: read the header, undo its stages in reverse, unpack
//! - Inspect: read and validate a header without running any stage
//!
//! Every stage writes a new artifact and only then deletes its input, so a
//! failure at any point leaves the last good artifact on disk.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::archive;
use crate::compress;
use crate::crypto::{DecryptStatus, Encryptor, MIN_PASSWORD_LEN};
use crate::error::EngineError;
use crate::filter::Filter;
use crate::fs_ops;
use crate::header::{BackupInfo, HEADER_LEN};
use crate::model::{Action, BackupReport, Mode, RestoreReport, Stage, TaskConfig};
use crate::progress::ProgressCallback;

/// One backup or restore between a source tree and an archive artifact.
///
/// For a backup, `source_path` is the tree to save and `archive_path` the
/// destination base name; the stage suffixes are appended to it. For a
/// restore, `archive_path` is the artifact to read and `source_path` the
/// directory the tree is recreated in.
#[derive(Debug, Clone)]
pub struct Task {
    source_path: PathBuf,
    /// Advances along the suffix chain while a backup runs
    archive_path: PathBuf,
    info: BackupInfo,
    filter: Filter,
    config: TaskConfig,
}

/// Check a destination file name: letters, digits, underscore, hyphen and
/// dot, optionally led by dots, with a letter, digit or underscore first
/// after them.
fn is_valid_archive_name(name: &str) -> bool {
    let word = |c: char| c.is_ascii_alphanumeric() || c == '_';
    let rest = name.trim_start_matches('.');
    let mut chars = rest.chars();
    match chars.next() {
        Some(first) if word(first) => chars.all(|c| word(c) || c == '.' || c == '-'),
        _ => false,
    }
}

fn check_password(password: Option<&str>) -> Result<&str, EngineError> {
    let password = password.ok_or(EngineError::PasswordRequired)?;
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(EngineError::PasswordTooShort {
            min: MIN_PASSWORD_LEN,
        });
    }
    Ok(password)
}

/// Read and validate the header of the artifact at `path`.
///
/// Needs no password and runs no stage.
///
/// # Errors
/// - `ArchiveNotFound` if nothing exists at `path`
/// - `InvalidArchive` if the header does not validate or names unknown stages
/// - `Io` for any other read failure
pub fn inspect(path: &Path) -> Result<BackupInfo, EngineError> {
    let info = BackupInfo::read_from(path).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            EngineError::ArchiveNotFound {
                path: path.to_path_buf(),
            }
        } else {
            EngineError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;

    if !info.is_valid() || !info.mode.is_known() {
        tracing::debug!(path = %path.display(), "header failed validation");
        return Err(EngineError::InvalidArchive {
            path: path.to_path_buf(),
        });
    }
    Ok(info)
}

impl Task {
    /// Create a task. Both paths are made absolute; nothing is checked on
    /// disk until `backup` or `restore` runs.
    ///
    /// # Arguments
    /// * `source` - Tree to back up, or directory to restore into
    /// * `archive` - Destination base name, or artifact to restore from
    /// * `config` - Caller flags
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(
        source: P,
        archive: Q,
        config: TaskConfig,
    ) -> Result<Task, EngineError> {
        let source = source.as_ref();
        let archive = archive.as_ref();
        let source_path = fs_ops::absolute(source).map_err(|e| EngineError::Io {
            path: source.to_path_buf(),
            source: e,
        })?;
        let archive_path = fs_ops::absolute(archive).map_err(|e| EngineError::Io {
            path: archive.to_path_buf(),
            source: e,
        })?;

        Ok(Task {
            info: BackupInfo::new(&source_path.to_string_lossy()),
            source_path,
            archive_path,
            filter: Filter::new(),
            config,
        })
    }

    /// Choose the stages a backup runs.
    pub fn set_mode(&mut self, mode: Mode) {
        self.info.mode = mode;
    }

    /// Comment stored in the header, truncated to the header's capacity.
    pub fn set_comment(&mut self, comment: &str) {
        self.info.set_comment(comment);
    }

    pub fn set_filter(&mut self, filter: Filter) {
        self.filter = filter;
    }

    /// Current artifact: the base name before a backup, the final artifact
    /// after one.
    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    fn reporter<'a>(
        &self,
        progress: Option<&'a dyn ProgressCallback>,
    ) -> Option<&'a dyn ProgressCallback> {
        if self.config.verbose {
            progress
        } else {
            None
        }
    }

    fn validate_backup<'p>(&self, password: Option<&'p str>) -> Result<Option<&'p str>, EngineError> {
        match fs::symlink_metadata(&self.source_path) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(EngineError::SourceNotFound {
                    path: self.source_path.clone(),
                })
            }
            Err(e) => {
                return Err(EngineError::Io {
                    path: self.source_path.clone(),
                    source: e,
                })
            }
        }

        let name = self
            .archive_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !is_valid_archive_name(&name) {
            return Err(EngineError::InvalidArchiveName { name });
        }

        if self.info.mode.is_encrypted() {
            check_password(password).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Run the backup pipeline.
    ///
    /// On success `archive_path` names the final artifact,
    /// `<base>.tar[.zst][.ept]`, with the header appended.
    ///
    /// # Arguments
    /// * `password` - Required when the mode encrypts, ignored otherwise
    /// * `progress` - Receives stage and entry events in verbose mode
    ///
    /// # Errors
    /// Configuration errors are returned before anything is written. A
    /// failing stage yields `StageFailed`; its partial output is removed and
    /// the previous artifact is left in place.
    pub fn backup(
        &mut self,
        password: Option<&str>,
        progress: Option<&dyn ProgressCallback>,
    ) -> Result<BackupReport, EngineError> {
        let password = self.validate_backup(password)?;
        let progress = self.reporter(progress);
        let mode = self.info.mode;
        let stages = mode.stages();
        let base = self.archive_path.clone();

        fs_ops::ensure_parent_dir_exists(&base).map_err(|e| EngineError::stage(Action::Pack, e))?;

        tracing::info!(
            source = %self.source_path.display(),
            destination = %base.display(),
            mode = %mode,
            "backup started"
        );

        let mut previous: Option<PathBuf> = None;
        let mut entries = 0;
        for (i, stage) in stages.iter().enumerate() {
            let action = stage.forward();
            let output = fs_ops::intermediate_path(&base, &stages[..=i]);
            if let Some(cb) = progress {
                cb.on_stage_started(action);
            }
            tracing::info!(stage = %action, output = %output.display(), "stage started");

            let result = match (stage, &previous) {
                (Stage::Pack, _) => archive::pack(&self.source_path, &output, &self.filter, |path| {
                    if let Some(cb) = progress {
                        cb.on_entry(action, path);
                    }
                })
                .map(|stats| entries = stats.entries),
                (Stage::Compress, Some(input)) => fs_ops::open_payload(input, 0)
                    .and_then(|reader| compress::compress(reader, &output, self.config.compression_level))
                    .map(|_| ()),
                (Stage::Encrypt, Some(input)) => fs_ops::open_payload(input, 0).and_then(|reader| {
                    Encryptor::new(password.unwrap_or_default()).encrypt(reader, &output)
                }),
                (_, None) => Err(io::Error::new(io::ErrorKind::NotFound, "no input artifact")),
            };

            if let Err(e) = result {
                fs_ops::discard_partial(&output);
                tracing::info!(stage = %action, error = %e, "stage failed");
                return Err(EngineError::stage(action, e));
            }

            if let Some(input) = previous.take() {
                fs_ops::remove_artifact(&input);
            }
            self.archive_path = output.clone();
            if let Some(cb) = progress {
                cb.on_stage_completed(action, &output);
            }
            previous = Some(output);
        }

        let artifact = self.archive_path.clone();
        if let Some(cb) = progress {
            cb.on_stage_started(Action::WriteHeader);
        }
        self.info.seal();
        self.info
            .append_to(&artifact)
            .map_err(|e| EngineError::stage(Action::WriteHeader, e))?;
        if let Some(cb) = progress {
            cb.on_stage_completed(Action::WriteHeader, &artifact);
        }

        tracing::info!(artifact = %artifact.display(), entries, "backup finished");
        Ok(BackupReport {
            artifact,
            mode,
            entries,
        })
    }

    /// Run the restore pipeline.
    ///
    /// The header decides which stages are undone; `set_mode` has no effect
    /// here. Intermediates are deleted once consumed. The artifact itself is
    /// never touched.
    ///
    /// # Arguments
    /// * `password` - Required when the header says the artifact is encrypted
    /// * `progress` - Receives stage and entry events in verbose mode
    ///
    /// # Errors
    /// - `ArchiveNotFound` / `InvalidArchive` before any stage runs
    /// - `PasswordRequired` for an encrypted artifact without a password
    /// - `WrongPassword` if the password does not unlock the artifact; no
    ///   output is produced
    /// - `StageFailed` for anything else, naming the stage
    pub fn restore(
        &mut self,
        password: Option<&str>,
        progress: Option<&dyn ProgressCallback>,
    ) -> Result<RestoreReport, EngineError> {
        let artifact = self.archive_path.clone();
        self.info = inspect(&artifact)?;
        let mode = self.info.mode;
        let password = if mode.is_encrypted() {
            Some(password.ok_or(EngineError::PasswordRequired)?)
        } else {
            None
        };
        let progress = self.reporter(progress);
        let stages = mode.stages();
        let base = fs_ops::restore_base(&artifact, &stages);

        tracing::info!(
            archive = %artifact.display(),
            directory = %self.source_path.display(),
            mode = %mode,
            "restore started"
        );

        let mut current = artifact.clone();
        let mut intermediate = false;
        let mut entries = 0;
        for (i, stage) in stages.iter().enumerate().rev() {
            let action = stage.inverse();
            if let Some(cb) = progress {
                cb.on_stage_started(action);
            }
            tracing::info!(stage = %action, input = %current.display(), "stage started");

            let trailer = if intermediate { 0 } else { HEADER_LEN as u64 };
            let input = fs_ops::open_payload(&current, trailer).map_err(|e| EngineError::stage(action, e))?;

            let output = match stage {
                Stage::Pack => {
                    let stats = archive::unpack(input, &self.source_path, self.config.restore_metadata, |path| {
                        if let Some(cb) = progress {
                            cb.on_entry(action, path);
                        }
                    })
                    .map_err(|e| EngineError::stage(action, e))?;
                    entries = stats.entries;
                    self.source_path.clone()
                }
                Stage::Compress => {
                    let output = fs_ops::unused_intermediate_path(&base, &stages[..i])
                        .map_err(|e| EngineError::stage(action, e))?;
                    compress::decompress(input, &output).map_err(|e| EngineError::stage(action, e))?;
                    output
                }
                Stage::Encrypt => {
                    let output = fs_ops::unused_intermediate_path(&base, &stages[..i])
                        .map_err(|e| EngineError::stage(action, e))?;
                    let encryptor = Encryptor::new(password.unwrap_or_default());
                    match encryptor.decrypt(input, &output) {
                        DecryptStatus::Ok => {}
                        DecryptStatus::WrongPassword => {
                            tracing::info!(archive = %artifact.display(), "wrong password");
                            return Err(EngineError::WrongPassword);
                        }
                        DecryptStatus::FileError(e) => return Err(EngineError::stage(action, e)),
                    }
                    output
                }
            };

            if intermediate {
                fs_ops::remove_artifact(&current);
            }
            if let Some(cb) = progress {
                cb.on_stage_completed(action, &output);
            }
            current = output;
            intermediate = true;
        }

        tracing::info!(directory = %self.source_path.display(), entries, "restore finished");
        Ok(RestoreReport {
            target: self.source_path.clone(),
            mode,
            entries,
        })
    }
}
