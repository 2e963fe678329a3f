//! Archive header (`BackupInfo`).
//!
//! The header is a fixed-size trailer appended to the final artifact after
//! every stage has run. It is never compressed or encrypted, so it can be read
//! without a password.
//!
//! Layout (little-endian, `HEADER_LEN` bytes):
//!
//! | offset | size | field                         |
//! |--------|------|-------------------------------|
//! | 0      | 1    | mode bits                     |
//! | 1      | 7    | reserved, zero                |
//! | 8      | 8    | created_at, Unix seconds      |
//! | 16     | 1024 | source path, NUL padded       |
//! | 1040   | 256  | comment, NUL padded           |
//! | 1296   | 8    | checksum                      |
//!
//! The checksum is the first eight bytes of SHA-256 over bytes `0..1296`. It
//! detects accidental damage; it does not authenticate the header.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use chrono::{DateTime, Local, TimeZone, Utc};
use sha2::{Digest, Sha256};

use crate::model::Mode;

/// Capacity of the source path field, in bytes
pub const SOURCE_PATH_CAPACITY: usize = 1024;
/// Capacity of the comment field, in bytes
pub const COMMENT_CAPACITY: usize = 256;

const MODE_OFFSET: usize = 0;
const CREATED_AT_OFFSET: usize = 8;
const SOURCE_PATH_OFFSET: usize = 16;
const COMMENT_OFFSET: usize = SOURCE_PATH_OFFSET + SOURCE_PATH_CAPACITY;
const CHECKSUM_OFFSET: usize = COMMENT_OFFSET + COMMENT_CAPACITY;

/// Serialized header size
pub const HEADER_LEN: usize = CHECKSUM_OFFSET + 8;

/// Text stored in a fixed number of bytes.
///
/// Writing silently truncates to the last UTF-8 character boundary that fits.
/// Reading stops at the first NUL or at capacity, whichever comes first, and
/// replaces invalid UTF-8.
#[derive(Clone, PartialEq, Eq)]
pub struct BoundedText<const N: usize> {
    bytes: [u8; N],
}

impl<const N: usize> BoundedText<N> {
    pub fn new(text: &str) -> Self {
        let mut end = text.len().min(N);
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        let mut bytes = [0u8; N];
        bytes[..end].copy_from_slice(&text.as_bytes()[..end]);
        BoundedText { bytes }
    }

    fn from_raw(raw: &[u8]) -> Self {
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(&raw[..N]);
        BoundedText { bytes }
    }

    /// Stored bytes up to the first NUL.
    pub fn as_bytes(&self) -> &[u8] {
        let end = self.bytes.iter().position(|&b| b == 0).unwrap_or(N);
        &self.bytes[..end]
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(self.as_bytes()).into_owned()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes[0] == 0
    }

    fn raw(&self) -> &[u8; N] {
        &self.bytes
    }
}

impl<const N: usize> Default for BoundedText<N> {
    fn default() -> Self {
        BoundedText { bytes: [0u8; N] }
    }
}

impl<const N: usize> fmt::Debug for BoundedText<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_string_lossy())
    }
}

impl<const N: usize> fmt::Display for BoundedText<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_lossy())
    }
}

/// Metadata record attached to every backup artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupInfo {
    pub mode: Mode,
    /// Unix seconds
    pub created_at: i64,
    pub source_path: BoundedText<SOURCE_PATH_CAPACITY>,
    pub comment: BoundedText<COMMENT_CAPACITY>,
    /// Value read from disk, or set by `seal`
    pub stored_checksum: u64,
}

impl Default for BackupInfo {
    fn default() -> Self {
        BackupInfo {
            mode: Mode::default(),
            created_at: 0,
            source_path: BoundedText::default(),
            comment: BoundedText::default(),
            stored_checksum: 0,
        }
    }
}

impl BackupInfo {
    /// Header for a backup starting now. Mode defaults to compress + encrypt
    /// until the caller picks the real stages.
    pub fn new(source_path: &str) -> Self {
        BackupInfo {
            created_at: Utc::now().timestamp(),
            source_path: BoundedText::new(source_path),
            ..Default::default()
        }
    }

    pub fn set_comment(&mut self, comment: &str) {
        self.comment = BoundedText::new(comment);
    }

    /// Checksum over every field except the checksum itself.
    pub fn checksum(&self) -> u64 {
        let bytes = self.serialize();
        checksum_of(&bytes[..CHECKSUM_OFFSET])
    }

    /// Store a freshly computed checksum.
    pub fn seal(&mut self) {
        self.stored_checksum = self.checksum();
    }

    /// True iff the stored checksum matches a recomputation.
    pub fn is_valid(&self) -> bool {
        self.stored_checksum == self.checksum()
    }

    pub fn serialize(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[MODE_OFFSET] = self.mode.bits();
        out[CREATED_AT_OFFSET..CREATED_AT_OFFSET + 8].copy_from_slice(&self.created_at.to_le_bytes());
        out[SOURCE_PATH_OFFSET..COMMENT_OFFSET].copy_from_slice(self.source_path.raw());
        out[COMMENT_OFFSET..CHECKSUM_OFFSET].copy_from_slice(self.comment.raw());
        out[CHECKSUM_OFFSET..].copy_from_slice(&self.stored_checksum.to_le_bytes());
        out
    }

    /// Parse a header. Never fails: input of the wrong length is zero-padded
    /// or cut to `HEADER_LEN`, and the resulting header simply does not
    /// validate. Reserved bytes are not kept, so a header with non-zero
    /// reserved bytes fails validation too.
    pub fn deserialize(bytes: &[u8]) -> Self {
        let mut buf = [0u8; HEADER_LEN];
        let n = bytes.len().min(HEADER_LEN);
        buf[..n].copy_from_slice(&bytes[..n]);

        let created_at = i64::from_le_bytes(
            buf[CREATED_AT_OFFSET..CREATED_AT_OFFSET + 8]
                .try_into()
                .unwrap_or([0u8; 8]),
        );
        let stored_checksum =
            u64::from_le_bytes(buf[CHECKSUM_OFFSET..].try_into().unwrap_or([0u8; 8]));
        let info = BackupInfo {
            mode: Mode::from_bits_retain(buf[MODE_OFFSET]),
            created_at,
            source_path: BoundedText::from_raw(&buf[SOURCE_PATH_OFFSET..COMMENT_OFFSET]),
            comment: BoundedText::from_raw(&buf[COMMENT_OFFSET..CHECKSUM_OFFSET]),
            stored_checksum,
        };

        if n < HEADER_LEN || buf[MODE_OFFSET + 1..CREATED_AT_OFFSET].iter().any(|&b| b != 0) {
            // Make sure a short or dirty block can never validate by accident.
            return BackupInfo {
                stored_checksum: !info.checksum(),
                ..info
            };
        }
        info
    }

    /// Creation time in the local time zone.
    pub fn created_at_local(&self) -> Option<DateTime<Local>> {
        Local.timestamp_opt(self.created_at, 0).single()
    }

    /// Read the trailing `HEADER_LEN` bytes of `path`. A file shorter than a
    /// header yields whatever bytes it has; validation decides the rest.
    pub fn read_from(path: &Path) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        file.seek(SeekFrom::Start(len.saturating_sub(HEADER_LEN as u64)))?;
        let mut bytes = Vec::with_capacity(HEADER_LEN);
        file.read_to_end(&mut bytes)?;
        Ok(Self::deserialize(&bytes))
    }

    /// Append the serialized header to `path`.
    pub fn append_to(&self, path: &Path) -> io::Result<()> {
        let mut file = OpenOptions::new().read(true).append(true).open(path)?;
        file.write_all(&self.serialize())?;
        file.sync_all()
    }
}

fn checksum_of(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head)
}
