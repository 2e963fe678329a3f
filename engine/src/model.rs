//! Core data model for backup tasks.
//!
//! This module defines the small closed vocabulary the pipeline is built from:
//! - Mode: the COMPRESSED/ENCRYPTED bits stored in the archive header
//! - Stage: one reversible transformation, in backup order
//! - Action: a stage run forwards or backwards (what gets reported)
//! - TaskConfig: caller-supplied flags, fixed at task construction
//! - BackupReport / RestoreReport: what a finished task hands back

use std::fmt;
use std::ops::BitOr;
use std::path::PathBuf;

/// Suffix appended by the pack stage
pub const SUFFIX_PACK: &str = ".tar";
/// Suffix appended by the compress stage
pub const SUFFIX_COMPRESS: &str = ".zst";
/// Suffix appended by the encrypt stage
pub const SUFFIX_ENCRYPT: &str = ".ept";

/// Backup mode bits as persisted in the header.
///
/// Bits outside `COMPRESSED | ENCRYPTED` are retained so that a header read
/// from disk round-trips exactly; `is_known` tells the reader whether it can
/// trust them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mode {
    bits: u8,
}

impl Mode {
    const COMPRESSED_BIT: u8 = 0b0000_0001;
    const ENCRYPTED_BIT: u8 = 0b0000_0010;

    /// Pack only
    pub const PACK_ONLY: Mode = Mode { bits: 0 };
    /// Pack, then compress
    pub const COMPRESSED: Mode = Mode { bits: Self::COMPRESSED_BIT };
    /// Pack, then encrypt
    pub const ENCRYPTED: Mode = Mode { bits: Self::ENCRYPTED_BIT };
    /// Pack, compress, encrypt
    pub const ALL: Mode = Mode {
        bits: Self::COMPRESSED_BIT | Self::ENCRYPTED_BIT,
    };

    /// Keep every bit, known or not.
    pub fn from_bits_retain(bits: u8) -> Self {
        Mode { bits }
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    /// False if any bit outside COMPRESSED | ENCRYPTED is set.
    pub fn is_known(&self) -> bool {
        self.bits & !Self::ALL.bits == 0
    }

    pub fn contains(&self, other: Mode) -> bool {
        self.bits & other.bits == other.bits
    }

    pub fn is_compressed(&self) -> bool {
        self.contains(Mode::COMPRESSED)
    }

    pub fn is_encrypted(&self) -> bool {
        self.contains(Mode::ENCRYPTED)
    }

    /// The stages this mode runs, in backup order. Restore walks the same
    /// sequence backwards.
    pub fn stages(&self) -> Vec<Stage> {
        let mut stages = vec![Stage::Pack];
        if self.is_compressed() {
            stages.push(Stage::Compress);
        }
        if self.is_encrypted() {
            stages.push(Stage::Encrypt);
        }
        stages
    }
}

impl Default for Mode {
    fn default() -> Self {
        Mode::ALL
    }
}

impl BitOr for Mode {
    type Output = Mode;

    fn bitor(self, rhs: Mode) -> Mode {
        Mode {
            bits: self.bits | rhs.bits,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.stages().iter().map(|s| s.name()).collect();
        write!(f, "{}", names.join(" "))
    }
}

/// One reversible transformation of the working artifact.
///
/// Declaration order is backup order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    /// Tree to single archive file
    Pack,
    /// Archive to compressed stream
    Compress,
    /// Anything to ciphertext
    Encrypt,
}

impl Stage {
    /// File-name suffix this stage appends on backup and strips on restore.
    pub fn suffix(&self) -> &'static str {
        match self {
            Stage::Pack => SUFFIX_PACK,
            Stage::Compress => SUFFIX_COMPRESS,
            Stage::Encrypt => SUFFIX_ENCRYPT,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Pack => "pack",
            Stage::Compress => "compress",
            Stage::Encrypt => "encrypt",
        }
    }

    /// What running this stage during backup is called.
    pub fn forward(&self) -> Action {
        match self {
            Stage::Pack => Action::Pack,
            Stage::Compress => Action::Compress,
            Stage::Encrypt => Action::Encrypt,
        }
    }

    /// What undoing this stage during restore is called.
    pub fn inverse(&self) -> Action {
        match self {
            Stage::Pack => Action::Unpack,
            Stage::Compress => Action::Decompress,
            Stage::Encrypt => Action::Decrypt,
        }
    }
}

/// A unit of pipeline work as seen by progress reporting and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Pack,
    Compress,
    Encrypt,
    WriteHeader,
    Decrypt,
    Decompress,
    Unpack,
}

impl Action {
    /// Upper-case banner used by verbose output.
    pub fn banner(&self) -> &'static str {
        match self {
            Action::Pack => "PACKING...",
            Action::Compress => "COMPRESSING...",
            Action::Encrypt => "ENCRYPTING...",
            Action::WriteHeader => "WRITING HEADER...",
            Action::Decrypt => "DECRYPTING...",
            Action::Decompress => "DECOMPRESSING...",
            Action::Unpack => "UNPACKING...",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Pack => write!(f, "pack"),
            Action::Compress => write!(f, "compress"),
            Action::Encrypt => write!(f, "encrypt"),
            Action::WriteHeader => write!(f, "write header to"),
            Action::Decrypt => write!(f, "decrypt"),
            Action::Decompress => write!(f, "decompress"),
            Action::Unpack => write!(f, "unpack"),
        }
    }
}

/// Caller flags, handed to `Task::new` once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskConfig {
    /// Restore ownership, permissions and timestamps on unpack
    pub restore_metadata: bool,

    /// Report stage banners and per-entry names through the progress callback
    pub verbose: bool,

    /// zstd level used by the compress stage
    pub compression_level: i32,
}

impl Default for TaskConfig {
    fn default() -> Self {
        TaskConfig {
            restore_metadata: false,
            verbose: false,
            compression_level: 3,
        }
    }
}

/// Outcome of a successful backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupReport {
    /// Final artifact, header included
    pub artifact: PathBuf,
    pub mode: Mode,
    /// Entries written to the archive
    pub entries: usize,
}

/// Outcome of a successful restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    /// Directory the tree was unpacked into
    pub target: PathBuf,
    /// Mode read from the archive header
    pub mode: Mode,
    /// Entries recreated
    pub entries: usize,
}
