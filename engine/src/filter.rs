//! File selection predicates.
//!
//! A `Filter` is a conjunction of optional predicates. Unset predicates do not
//! constrain; an entry is archived iff every predicate that is set passes.
//! Regular expressions are compiled when they are attached, so a malformed
//! pattern is rejected before the tree walk starts.

use std::fs::Metadata;
use std::ops::BitOr;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::error::EngineError;

/// Kind of filesystem entry the archiver knows how to store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    Fifo,
}

impl FileType {
    /// Classify `metadata` (as returned by `symlink_metadata`). Sockets and
    /// device nodes have no counterpart and yield `None`.
    pub fn from_metadata(metadata: &Metadata) -> Option<Self> {
        let ft = metadata.file_type();
        if ft.is_symlink() {
            Some(FileType::Symlink)
        } else if ft.is_dir() {
            Some(FileType::Directory)
        } else if ft.is_file() {
            Some(FileType::Regular)
        } else if ft.is_fifo() {
            Some(FileType::Fifo)
        } else {
            None
        }
    }
}

/// Set of `FileType`s, one bit each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileTypeMask(u8);

impl FileTypeMask {
    pub const REGULAR: FileTypeMask = FileTypeMask(0b0001);
    pub const DIRECTORY: FileTypeMask = FileTypeMask(0b0010);
    pub const SYMLINK: FileTypeMask = FileTypeMask(0b0100);
    pub const FIFO: FileTypeMask = FileTypeMask(0b1000);
    pub const EMPTY: FileTypeMask = FileTypeMask(0);

    pub fn contains(&self, file_type: FileType) -> bool {
        self.0 & Self::of(file_type).0 != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    fn of(file_type: FileType) -> FileTypeMask {
        match file_type {
            FileType::Regular => Self::REGULAR,
            FileType::Directory => Self::DIRECTORY,
            FileType::Symlink => Self::SYMLINK,
            FileType::Fifo => Self::FIFO,
        }
    }
}

impl BitOr for FileTypeMask {
    type Output = FileTypeMask;

    fn bitor(self, rhs: FileTypeMask) -> FileTypeMask {
        FileTypeMask(self.0 | rhs.0)
    }
}

impl From<FileType> for FileTypeMask {
    fn from(file_type: FileType) -> Self {
        FileTypeMask::of(file_type)
    }
}

/// Inclusive range of Unix timestamps (seconds).
///
/// A range whose start is after its end contains nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    pub fn new(start: i64, end: i64) -> Self {
        TimeRange { start, end }
    }

    pub fn contains(&self, t: i64) -> bool {
        self.start <= t && t <= self.end
    }
}

/// Everything a filter can look at for one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// Path relative to the source root
    pub relative_path: PathBuf,
    /// Last component of `relative_path`
    pub name: String,
    pub file_type: FileType,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl EntryInfo {
    /// Build from `symlink_metadata` output. Returns `None` for entry kinds
    /// the archiver cannot store.
    pub fn from_metadata(relative_path: &Path, metadata: &Metadata) -> Option<Self> {
        let file_type = FileType::from_metadata(metadata)?;
        let name = relative_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Some(EntryInfo {
            relative_path: relative_path.to_path_buf(),
            name,
            file_type,
            atime: metadata.atime(),
            mtime: metadata.mtime(),
            ctime: metadata.ctime(),
        })
    }
}

/// Conjunction of optional predicates over `EntryInfo`.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    path: Option<Regex>,
    name: Option<Regex>,
    types: Option<FileTypeMask>,
    access_time: Option<TimeRange>,
    modify_time: Option<TimeRange>,
    change_time: Option<TimeRange>,
}

/// Compile `pattern` so that it must match the whole subject.
fn compile_anchored(pattern: &str) -> Result<Regex, EngineError> {
    Regex::new(&format!("^(?:{})$", pattern)).map_err(|source| EngineError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

impl Filter {
    /// A filter that passes everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require the whole relative path to match `pattern`.
    pub fn with_path_pattern(mut self, pattern: &str) -> Result<Self, EngineError> {
        self.path = Some(compile_anchored(pattern)?);
        Ok(self)
    }

    /// Require the base name to match `pattern`.
    pub fn with_name_pattern(mut self, pattern: &str) -> Result<Self, EngineError> {
        self.name = Some(compile_anchored(pattern)?);
        Ok(self)
    }

    pub fn with_types(mut self, types: FileTypeMask) -> Self {
        self.types = Some(types);
        self
    }

    pub fn with_access_time(mut self, range: TimeRange) -> Self {
        self.access_time = Some(range);
        self
    }

    pub fn with_modify_time(mut self, range: TimeRange) -> Self {
        self.modify_time = Some(range);
        self
    }

    pub fn with_change_time(mut self, range: TimeRange) -> Self {
        self.change_time = Some(range);
        self
    }

    /// True if no predicate is set.
    pub fn is_empty(&self) -> bool {
        self.path.is_none()
            && self.name.is_none()
            && self.types.is_none()
            && self.access_time.is_none()
            && self.modify_time.is_none()
            && self.change_time.is_none()
    }

    pub fn passes(&self, entry: &EntryInfo) -> bool {
        if let Some(re) = &self.path {
            if !re.is_match(&entry.relative_path.to_string_lossy()) {
                return false;
            }
        }
        if let Some(re) = &self.name {
            if !re.is_match(&entry.name) {
                return false;
            }
        }
        if let Some(types) = self.types {
            if !types.contains(entry.file_type) {
                return false;
            }
        }
        let ranges = [
            (self.access_time, entry.atime),
            (self.modify_time, entry.mtime),
            (self.change_time, entry.ctime),
        ];
        ranges
            .iter()
            .all(|(range, t)| range.map_or(true, |r| r.contains(*t)))
    }
}
