//! Command-line arguments and their validation.
//!
//! Everything here runs before any file is touched: exactly one operation,
//! per-operation flag rules, time ranges and type letters.

use std::path::PathBuf;

use anyhow::{anyhow, bail};
use backup_engine::{FileTypeMask, Filter, Mode, TaskConfig, TimeRange, MIN_PASSWORD_LEN};
use chrono::{Local, NaiveDateTime, TimeZone};
use clap::Parser;

pub(crate) const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// BackUP - back up a directory tree into a single archive
#[derive(Parser, Debug, Default)]
#[command(name = "backup")]
#[command(version)]
#[command(about = "Pack, compress and encrypt a directory tree into one archive, and restore it")]
pub struct Args {
    /// Back up INPUT into an archive named OUTPUT
    #[arg(short = 'b', long)]
    pub backup: bool,

    /// Restore archive INPUT into directory OUTPUT
    #[arg(short = 'r', long)]
    pub restore: bool,

    /// Show the header of an archive
    #[arg(short = 'l', long, value_name = "FILE")]
    pub list: Option<PathBuf>,

    /// Source tree (backup) or archive (restore)
    #[arg(short = 'i', long, value_name = "PATH")]
    pub input: Option<PathBuf>,

    /// Archive base name (backup) or target directory (restore)
    #[arg(short = 'o', long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Password; prompted for when omitted
    #[arg(short = 'p', long)]
    pub password: Option<String>,

    /// Print stages and entries as they are processed
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Log filter when RUST_LOG is unset
    #[arg(long, value_name = "LEVEL", default_value = "warn")]
    pub log_level: String,

    /// Compress the archive (backup)
    #[arg(short = 'c', long)]
    pub compress: bool,

    /// Encrypt the archive (backup)
    #[arg(short = 'e', long)]
    pub encrypt: bool,

    /// Only back up entries whose relative path matches REGEX
    #[arg(long, value_name = "REGEX")]
    pub path: Option<String>,

    /// Only back up entries whose file name matches REGEX
    #[arg(long, value_name = "REGEX")]
    pub name: Option<String>,

    /// Only back up these types: n regular, d directory, l symlink, p fifo
    #[arg(long = "type", value_name = "TYPES")]
    pub types: Option<String>,

    /// Access time range, "YYYY-MM-DD HH:MM:SS YYYY-MM-DD HH:MM:SS"
    #[arg(long, value_name = "RANGE")]
    pub atime: Option<String>,

    /// Modification time range
    #[arg(long, value_name = "RANGE")]
    pub mtime: Option<String>,

    /// Status change time range
    #[arg(long, value_name = "RANGE")]
    pub ctime: Option<String>,

    /// Comment stored in the archive header
    #[arg(short = 'm', long)]
    pub message: Option<String>,

    /// zstd compression level (backup)
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(i32).range(1..=22))]
    pub level: Option<i32>,

    /// Restore ownership, permissions and timestamps (restore)
    #[arg(short = 'a', long)]
    pub metadata: bool,
}

/// What a validated command line asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Backup { input: PathBuf, output: PathBuf },
    Restore { input: PathBuf, output: PathBuf },
    List(PathBuf),
}

/// Parse one bound, local time.
fn parse_local_time(text: &str) -> anyhow::Result<i64> {
    let naive = NaiveDateTime::parse_from_str(text, TIME_FORMAT)?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|t| t.timestamp())
        .ok_or_else(|| anyhow!("nonexistent local time"))
}

/// Parse `"YYYY-MM-DD HH:MM:SS YYYY-MM-DD HH:MM:SS"` into an inclusive range.
pub fn parse_time_range(text: &str) -> anyhow::Result<TimeRange> {
    let parts: Vec<&str> = text.split_whitespace().collect();
    let invalid = || anyhow!("invalid time: {}", text);
    match parts.as_slice() {
        [d1, t1, d2, t2] => {
            let start = parse_local_time(&format!("{} {}", d1, t1)).map_err(|_| invalid())?;
            let end = parse_local_time(&format!("{} {}", d2, t2)).map_err(|_| invalid())?;
            Ok(TimeRange::new(start, end))
        }
        _ => Err(invalid()),
    }
}

/// Parse type letters into a mask.
pub fn parse_type_mask(text: &str) -> anyhow::Result<FileTypeMask> {
    if text.is_empty() {
        bail!("invalid file type: {}", text);
    }
    text.chars().try_fold(FileTypeMask::EMPTY, |mask, c| {
        let bit = match c {
            'n' => FileTypeMask::REGULAR,
            'd' => FileTypeMask::DIRECTORY,
            'l' => FileTypeMask::SYMLINK,
            'p' => FileTypeMask::FIFO,
            _ => bail!("invalid file type: {}", text),
        };
        Ok(mask | bit)
    })
}

impl Args {
    fn has_backup_only_flags(&self) -> bool {
        self.compress
            || self.encrypt
            || self.path.is_some()
            || self.name.is_some()
            || self.types.is_some()
            || self.atime.is_some()
            || self.mtime.is_some()
            || self.ctime.is_some()
            || self.message.is_some()
            || self.level.is_some()
    }

    fn input_output(&self) -> anyhow::Result<(PathBuf, PathBuf)> {
        match (&self.input, &self.output) {
            (Some(input), Some(output)) => Ok((input.clone(), output.clone())),
            _ => bail!("no input or output"),
        }
    }

    /// Check the flag combination and return the requested operation.
    pub fn validate(&self) -> anyhow::Result<Operation> {
        let selected = [self.backup, self.restore, self.list.is_some()]
            .iter()
            .filter(|&&on| on)
            .count();
        if selected != 1 {
            bail!("invalid parameter: choose exactly one of --backup, --restore, --list");
        }

        if let Some(file) = &self.list {
            if self.input.is_some()
                || self.output.is_some()
                || self.password.is_some()
                || self.verbose
                || self.metadata
                || self.has_backup_only_flags()
            {
                bail!("invalid parameter: --list takes no other options");
            }
            return Ok(Operation::List(file.clone()));
        }

        let (input, output) = self.input_output()?;

        if self.restore {
            if self.has_backup_only_flags() {
                bail!("invalid parameter: backup options given for --restore");
            }
            return Ok(Operation::Restore { input, output });
        }

        if self.metadata {
            bail!("invalid parameter: --metadata only applies to --restore");
        }
        if let Some(password) = &self.password {
            if !self.encrypt {
                bail!("invalid parameter (use -e to encrypt)");
            }
            if password.chars().count() < MIN_PASSWORD_LEN {
                bail!(
                    "password must be at least {} characters in length",
                    MIN_PASSWORD_LEN
                );
            }
        }
        self.build_filter()?;

        Ok(Operation::Backup { input, output })
    }

    /// Filter for a backup, from the selection flags.
    pub fn build_filter(&self) -> anyhow::Result<Filter> {
        let mut filter = Filter::new();
        if let Some(pattern) = &self.path {
            filter = filter.with_path_pattern(pattern)?;
        }
        if let Some(pattern) = &self.name {
            filter = filter.with_name_pattern(pattern)?;
        }
        if let Some(types) = &self.types {
            filter = filter.with_types(parse_type_mask(types)?);
        }
        if let Some(range) = &self.atime {
            filter = filter.with_access_time(parse_time_range(range)?);
        }
        if let Some(range) = &self.mtime {
            filter = filter.with_modify_time(parse_time_range(range)?);
        }
        if let Some(range) = &self.ctime {
            filter = filter.with_change_time(parse_time_range(range)?);
        }
        Ok(filter)
    }

    /// Stages selected for a backup.
    pub fn mode(&self) -> Mode {
        let mut mode = Mode::PACK_ONLY;
        if self.compress {
            mode = mode | Mode::COMPRESSED;
        }
        if self.encrypt {
            mode = mode | Mode::ENCRYPTED;
        }
        mode
    }

    pub fn task_config(&self) -> TaskConfig {
        let defaults = TaskConfig::default();
        TaskConfig {
            restore_metadata: self.metadata,
            verbose: self.verbose,
            compression_level: self.level.unwrap_or(defaults.compression_level),
        }
    }
}
