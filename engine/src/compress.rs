//! Compression stage (zstd).

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

use crate::fs_ops;

/// Compress everything `input` yields into a new file at `output`.
///
/// Returns the compressed size.
pub fn compress<R: Read>(input: R, output: &Path, level: i32) -> io::Result<u64> {
    let mut writer = BufWriter::new(File::create(output)?);
    zstd::stream::copy_encode(input, &mut writer, level)?;
    finish(writer)
}

/// Inverse of `compress`. Fails on anything zstd did not produce.
///
/// `output` must not exist yet. If decoding fails the partial output is
/// removed.
///
/// Returns the decompressed size.
pub fn decompress<R: Read>(input: R, output: &Path) -> io::Result<u64> {
    let mut writer = BufWriter::new(fs_ops::create_new(output)?);
    let result = match zstd::stream::copy_decode(input, &mut writer) {
        Ok(()) => finish(writer),
        Err(e) => Err(e),
    };
    if result.is_err() {
        fs_ops::discard_partial(output);
    }
    result
}

fn finish(mut writer: BufWriter<File>) -> io::Result<u64> {
    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(file.metadata()?.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_compress_then_decompress() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let packed = dir.path().join("out.tar.zst");
        let unpacked = dir.path().join("out.tar");
        let data: Vec<u8> = b"abcabcabc".iter().cycle().take(100_000).copied().collect();

        let size = compress(&data[..], &packed, 3).expect("Failed to compress");
        assert!(size < data.len() as u64);

        let restored_size =
            decompress(File::open(&packed).unwrap(), &unpacked).expect("Failed to decompress");
        assert_eq!(restored_size, data.len() as u64);
        assert_eq!(fs::read(&unpacked).unwrap(), data);
    }

    #[test]
    fn test_decompress_rejects_garbage() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let output = dir.path().join("out.tar");
        let result = decompress(&b"definitely not a zstd frame"[..], &output);
        assert!(result.is_err());
    }

    #[test]
    fn test_decompress_never_overwrites() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let packed = dir.path().join("out.tar.zst");
        let existing = dir.path().join("out.tar");
        compress(&b"fresh"[..], &packed, 3).expect("Failed to compress");
        fs::write(&existing, b"older backup").unwrap();

        let err = decompress(File::open(&packed).unwrap(), &existing).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(fs::read(&existing).unwrap(), b"older backup");
    }

    #[test]
    fn test_decompress_rejects_truncated_frame() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let packed = dir.path().join("out.tar.zst");
        let data = vec![7u8; 50_000];
        compress(&data[..], &packed, 3).expect("Failed to compress");

        let mut bytes = fs::read(&packed).unwrap();
        bytes.truncate(bytes.len() / 2);
        let output = dir.path().join("out.tar");
        let result = decompress(&bytes[..], &output);
        assert!(result.is_err());
        assert!(!output.exists());
    }
}
