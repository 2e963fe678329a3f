//! Encryption stage.
//!
//! The key is derived with Argon2id from the password and a random per-file
//! salt, so the same password and salt always give the same 32-byte key.
//! Content is sealed with AES-256-GCM in 64 KiB chunks.
//!
//! Encrypted file layout:
//!
//! ```text
//! magic "BKUPEPT1"      8
//! salt                 16
//! nonce prefix          7
//! key check            32   blake3 keyed hash of a fixed context string
//! chunk*                    [final u8][len u32 LE][ciphertext + tag]
//! ```
//!
//! Chunk nonce = prefix || counter (u32 BE) || final flag. The key check lets
//! `decrypt` tell a wrong password apart from a damaged file before any
//! output is written; after it passes, every authentication failure means the
//! ciphertext itself is broken.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::Argon2;
use zeroize::Zeroizing;

use crate::fs_ops;

/// Shortest password accepted when creating an encrypted backup
pub const MIN_PASSWORD_LEN: usize = 6;

/// Derived key size (AES-256)
pub const KEY_LEN: usize = 32;
/// Argon2 salt size
pub const SALT_LEN: usize = 16;

const MAGIC: &[u8; 8] = b"BKUPEPT1";
const NONCE_PREFIX_LEN: usize = 7;
const KEY_CHECK_LEN: usize = 32;
const KEY_CHECK_CONTEXT: &[u8] = b"backup-engine key check v1";
const CHUNK_SIZE: usize = 64 * 1024;
const TAG_LEN: usize = 16;

/// Result of `Encryptor::decrypt`.
#[derive(Debug)]
pub enum DecryptStatus {
    /// Plaintext written to the output file
    Ok,
    /// The file is intact but the password does not unlock it
    WrongPassword,
    /// The file is unreadable, truncated, or not produced by `encrypt`
    FileError(io::Error),
}

impl DecryptStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, DecryptStatus::Ok)
    }
}

/// Derive the file key for `password` and `salt`.
pub fn derive_key(password: &str, salt: &[u8; SALT_LEN]) -> io::Result<Zeroizing<[u8; KEY_LEN]>> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut key[..])
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("key derivation failed: {}", e)))?;
    Ok(key)
}

fn key_check(key: &[u8; KEY_LEN]) -> blake3::Hash {
    blake3::keyed_hash(key, KEY_CHECK_CONTEXT)
}

fn chunk_nonce(prefix: &[u8; NONCE_PREFIX_LEN], counter: u32, last: bool) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..11].copy_from_slice(&counter.to_be_bytes());
    nonce[11] = last as u8;
    nonce
}

fn corrupt(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

/// Read until `buf` is full or the reader is exhausted.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Password-based file encryptor.
pub struct Encryptor {
    password: Zeroizing<String>,
}

impl Encryptor {
    pub fn new(password: &str) -> Self {
        Encryptor {
            password: Zeroizing::new(password.to_string()),
        }
    }

    fn cipher(key: &[u8; KEY_LEN]) -> io::Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(key)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("failed to create cipher: {}", e)))
    }

    /// Encrypt everything `input` yields into a new file at `output`.
    ///
    /// Only I/O can make this fail.
    pub fn encrypt<R: Read>(&self, input: R, output: &Path) -> io::Result<()> {
        let mut salt = [0u8; SALT_LEN];
        let mut prefix = [0u8; NONCE_PREFIX_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut prefix);

        let key = derive_key(&self.password, &salt)?;
        let cipher = Self::cipher(&key)?;

        let mut reader = BufReader::new(input);
        let mut writer = BufWriter::new(File::create(output)?);
        writer.write_all(MAGIC)?;
        writer.write_all(&salt)?;
        writer.write_all(&prefix)?;
        writer.write_all(key_check(&key).as_bytes())?;

        let mut current = vec![0u8; CHUNK_SIZE];
        let mut next = vec![0u8; CHUNK_SIZE];
        let mut len = read_full(&mut reader, &mut current)?;
        let mut counter: u32 = 0;
        loop {
            // Look one chunk ahead so the final chunk can be flagged.
            let next_len = if len == CHUNK_SIZE {
                read_full(&mut reader, &mut next)?
            } else {
                0
            };
            let last = next_len == 0;

            let nonce = chunk_nonce(&prefix, counter, last);
            let sealed = cipher
                .encrypt(Nonce::from_slice(&nonce), &current[..len])
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "chunk encryption failed"))?;
            writer.write_all(&[last as u8])?;
            writer.write_all(&(sealed.len() as u32).to_le_bytes())?;
            writer.write_all(&sealed)?;

            if last {
                break;
            }
            std::mem::swap(&mut current, &mut next);
            len = next_len;
            counter = counter
                .checked_add(1)
                .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "input too large to encrypt"))?;
        }

        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()
    }

    /// Decrypt `input` into a new file at `output`.
    ///
    /// The output file is only created once the password has been verified,
    /// and never replaces an existing file. On `FileError` a partially
    /// written output is removed.
    pub fn decrypt<R: Read>(&self, input: R, output: &Path) -> DecryptStatus {
        let mut reader = BufReader::new(input);

        let mut preamble = [0u8; MAGIC.len() + SALT_LEN + NONCE_PREFIX_LEN + KEY_CHECK_LEN];
        match read_full(&mut reader, &mut preamble) {
            Ok(n) if n == preamble.len() => {}
            Ok(_) => return DecryptStatus::FileError(corrupt("encrypted file is truncated")),
            Err(e) => return DecryptStatus::FileError(e),
        }
        let (magic, rest) = preamble.split_at(MAGIC.len());
        if magic != MAGIC {
            return DecryptStatus::FileError(corrupt("not an encrypted backup"));
        }
        let (salt, rest) = rest.split_at(SALT_LEN);
        let (prefix, stored_check) = rest.split_at(NONCE_PREFIX_LEN);

        let mut salt_arr = [0u8; SALT_LEN];
        salt_arr.copy_from_slice(salt);
        let mut prefix_arr = [0u8; NONCE_PREFIX_LEN];
        prefix_arr.copy_from_slice(prefix);
        let mut check_arr = [0u8; KEY_CHECK_LEN];
        check_arr.copy_from_slice(stored_check);

        let key = match derive_key(&self.password, &salt_arr) {
            Ok(key) => key,
            Err(e) => return DecryptStatus::FileError(e),
        };
        // blake3::Hash compares in constant time
        if key_check(&key) != blake3::Hash::from(check_arr) {
            return DecryptStatus::WrongPassword;
        }

        let file = match fs_ops::create_new(output) {
            Ok(file) => file,
            Err(e) => return DecryptStatus::FileError(e),
        };
        match Self::decrypt_chunks(&key, &prefix_arr, &mut reader, file) {
            Ok(()) => DecryptStatus::Ok,
            Err(e) => {
                fs_ops::discard_partial(output);
                DecryptStatus::FileError(e)
            }
        }
    }

    fn decrypt_chunks<R: Read>(
        key: &[u8; KEY_LEN],
        prefix: &[u8; NONCE_PREFIX_LEN],
        reader: &mut R,
        output: File,
    ) -> io::Result<()> {
        let cipher = Self::cipher(key)?;
        let mut writer = BufWriter::new(output);
        let mut counter: u32 = 0;
        let mut frame = [0u8; 5];
        let mut sealed = vec![0u8; CHUNK_SIZE + TAG_LEN];

        loop {
            if read_full(reader, &mut frame)? != frame.len() {
                return Err(corrupt("encrypted file is truncated"));
            }
            let last = match frame[0] {
                0 => false,
                1 => true,
                _ => return Err(corrupt("malformed chunk")),
            };
            let len = u32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
            if !(TAG_LEN..=CHUNK_SIZE + TAG_LEN).contains(&len) {
                return Err(corrupt("malformed chunk"));
            }
            if read_full(reader, &mut sealed[..len])? != len {
                return Err(corrupt("encrypted file is truncated"));
            }

            let nonce = chunk_nonce(prefix, counter, last);
            let plain = cipher
                .decrypt(Nonce::from_slice(&nonce), &sealed[..len])
                .map_err(|_| corrupt("encrypted file is corrupted"))?;
            writer.write_all(&plain)?;

            if last {
                break;
            }
            counter = counter
                .checked_add(1)
                .ok_or_else(|| corrupt("too many chunks"))?;
        }

        let mut probe = [0u8; 1];
        if read_full(reader, &mut probe)? != 0 {
            return Err(corrupt("unexpected data after the final chunk"));
        }

        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()
    }
}
