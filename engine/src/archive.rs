//! Archive stage: directory tree <-> single tar file.
//!
//! Entries are stored relative to the source root with GNU headers, which
//! carry mode, ownership, mtime, and also atime/ctime. Multiply-linked regular
//! files are stored once; later paths become hard-link entries pointing at the
//! first packed path.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use nix::sys::stat::Mode as NixMode;
use tar::{Archive, Builder, EntryType, Header, HeaderMode};
use walkdir::WalkDir;

use crate::filter::{EntryInfo, FileType, Filter};
use crate::fs_ops;

/// Counters for a finished pack or unpack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    /// Entries written or recreated
    pub entries: usize,
    /// Regular file content bytes
    pub bytes: u64,
}

/// Pack `source` into a tar file at `output`, keeping only entries that pass
/// `filter`. `on_entry` sees the relative path of every packed entry.
///
/// Directories that fail the filter are still walked.
pub fn pack<F>(source: &Path, output: &Path, filter: &Filter, mut on_entry: F) -> io::Result<ArchiveStats>
where
    F: FnMut(&Path),
{
    // A root that is a link to a directory is walked through; any other
    // link is stored as itself.
    let root_is_dir = match fs::metadata(source) {
        Ok(meta) => meta.is_dir(),
        Err(_) => false,
    };

    let file = File::create(output)?;
    let output_meta = file.metadata()?;
    let output_id = (output_meta.dev(), output_meta.ino());
    let mut builder = Builder::new(BufWriter::new(file));
    let mut stats = ArchiveStats::default();
    let mut links: HashMap<(u64, u64), PathBuf> = HashMap::new();

    let walker = WalkDir::new(source)
        .follow_links(false)
        .follow_root_links(root_is_dir)
        .sort_by_file_name()
        .min_depth(if root_is_dir { 1 } else { 0 });

    for entry in walker {
        let entry = entry.map_err(io::Error::from)?;
        let path = entry.path();
        let metadata = fs::symlink_metadata(path)?;
        if (metadata.dev(), metadata.ino()) == output_id {
            continue;
        }

        let relative = if root_is_dir {
            path.strip_prefix(source)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
                .to_path_buf()
        } else {
            PathBuf::from(path.file_name().unwrap_or(path.as_os_str()))
        };

        let info = match EntryInfo::from_metadata(&relative, &metadata) {
            Some(info) => info,
            None => {
                tracing::warn!(path = %path.display(), "skipping entry of unsupported type");
                continue;
            }
        };
        if !filter.passes(&info) {
            tracing::trace!(path = %relative.display(), "filtered out");
            continue;
        }

        let mut header = Header::new_gnu();
        header.set_metadata_in_mode(&metadata, HeaderMode::Complete);
        if let Some(gnu) = header.as_gnu_mut() {
            gnu.set_atime(metadata.atime().max(0) as u64);
            gnu.set_ctime(metadata.ctime().max(0) as u64);
        }

        match info.file_type {
            FileType::Regular => {
                let key = (metadata.dev(), metadata.ino());
                let first = if metadata.nlink() > 1 {
                    links.get(&key).cloned()
                } else {
                    None
                };
                if let Some(target) = first {
                    header.set_entry_type(EntryType::Link);
                    header.set_size(0);
                    builder.append_link(&mut header, &relative, &target)?;
                } else {
                    header.set_entry_type(EntryType::Regular);
                    header.set_size(metadata.len());
                    builder.append_data(&mut header, &relative, File::open(path)?)?;
                    stats.bytes += metadata.len();
                    if metadata.nlink() > 1 {
                        links.insert(key, relative.clone());
                    }
                }
            }
            FileType::Directory => {
                header.set_entry_type(EntryType::Directory);
                header.set_size(0);
                builder.append_data(&mut header, &relative, io::empty())?;
            }
            FileType::Symlink => {
                header.set_entry_type(EntryType::Symlink);
                header.set_size(0);
                let target = fs::read_link(path)?;
                builder.append_link(&mut header, &relative, &target)?;
            }
            FileType::Fifo => {
                header.set_entry_type(EntryType::Fifo);
                header.set_size(0);
                builder.append_data(&mut header, &relative, io::empty())?;
            }
        }

        tracing::debug!(path = %relative.display(), "packed");
        on_entry(&relative);
        stats.entries += 1;
    }

    let mut writer = builder.into_inner()?;
    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(stats)
}

/// Metadata to put back once every entry exists.
struct PendingMetadata {
    path: PathBuf,
    is_symlink: bool,
    mode: u32,
    uid: u32,
    gid: u32,
    atime: FileTime,
    mtime: FileTime,
}

impl PendingMetadata {
    fn from_header(path: PathBuf, header: &Header) -> io::Result<Self> {
        let mtime = header.mtime()?;
        let atime = header
            .as_gnu()
            .and_then(|gnu| gnu.atime().ok())
            .filter(|&t| t != 0)
            .unwrap_or(mtime);
        Ok(PendingMetadata {
            path,
            is_symlink: header.entry_type() == EntryType::Symlink,
            mode: header.mode()?,
            uid: header.uid()? as u32,
            gid: header.gid()? as u32,
            atime: FileTime::from_unix_time(atime as i64, 0),
            mtime: FileTime::from_unix_time(mtime as i64, 0),
        })
    }

    fn apply(&self) -> io::Result<()> {
        // Ownership first: chown clears set-id bits.
        if let Err(e) = std::os::unix::fs::lchown(&self.path, Some(self.uid), Some(self.gid)) {
            if e.kind() != io::ErrorKind::PermissionDenied {
                return Err(e);
            }
            tracing::debug!(path = %self.path.display(), "ownership not restored: permission denied");
        }
        if !self.is_symlink {
            fs::set_permissions(&self.path, fs::Permissions::from_mode(self.mode & 0o7777))?;
        }
        filetime::set_symlink_file_times(&self.path, self.atime, self.mtime)
    }
}

fn make_fifo(path: &Path, mode: u32) -> io::Result<()> {
    fs_ops::ensure_parent_dir_exists(path)?;
    match fs::symlink_metadata(path) {
        Ok(existing) if existing.is_dir() => {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} is a directory", path.display()),
            ))
        }
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    nix::unistd::mkfifo(path, NixMode::from_bits_truncate((mode & 0o777) as _))
        .map_err(io::Error::from)
}

/// Recreate the tree stored in `input` under `target`.
///
/// With `restore_metadata`, ownership (where permitted), permissions and
/// access/modify times are applied after all entries exist, deepest first, so
/// writing a child does not disturb its directory's times.
pub fn unpack<R, F>(input: R, target: &Path, restore_metadata: bool, mut on_entry: F) -> io::Result<ArchiveStats>
where
    R: Read,
    F: FnMut(&Path),
{
    fs::create_dir_all(target)?;
    let mut archive = Archive::new(input);
    let mut stats = ArchiveStats::default();
    let mut pending = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let relative = entry.path()?.into_owned();
        let dest = fs_ops::safe_join(target, &relative)?;
        let kind = entry.header().entry_type();

        entry.set_preserve_permissions(false);
        entry.set_preserve_mtime(false);

        if kind == EntryType::Fifo {
            make_fifo(&dest, entry.header().mode()?)?;
        } else if !entry.unpack_in(target)? {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("refusing to unpack {}", relative.display()),
            ));
        }

        if kind == EntryType::Regular {
            stats.bytes += entry.header().size()?;
        }
        if restore_metadata && kind != EntryType::Link {
            pending.push(PendingMetadata::from_header(dest, entry.header())?);
        }

        tracing::debug!(path = %relative.display(), "unpacked");
        on_entry(&relative);
        stats.entries += 1;
    }

    for meta in pending.iter().rev() {
        meta.apply()?;
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FileTypeMask, TimeRange};
    use std::os::unix::fs::symlink;

    fn sample_tree(root: &Path) {
        fs::create_dir_all(root.join("docs/deep")).unwrap();
        fs::write(root.join("a.txt"), b"alpha").unwrap();
        fs::write(root.join("docs/b.md"), b"bravo").unwrap();
        fs::write(root.join("docs/deep/c.log"), b"charlie").unwrap();
        symlink("a.txt", root.join("link")).unwrap();
    }

    fn pack_to_vec(source: &Path, filter: &Filter) -> (Vec<PathBuf>, PathBuf, tempfile::TempDir) {
        let out_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let archive = out_dir.path().join("out.tar");
        let mut seen = Vec::new();
        pack(source, &archive, filter, |p| seen.push(p.to_path_buf())).expect("Failed to pack");
        (seen, archive, out_dir)
    }

    #[test]
    fn test_pack_unpack_preserves_tree() {
        let src = tempfile::tempdir().expect("Failed to create temp dir");
        sample_tree(src.path());

        let (seen, archive, _keep) = pack_to_vec(src.path(), &Filter::new());
        assert_eq!(seen.len(), 6);

        let dst = tempfile::tempdir().expect("Failed to create temp dir");
        let stats = unpack(File::open(&archive).unwrap(), dst.path(), false, |_| {})
            .expect("Failed to unpack");
        assert_eq!(stats.entries, 6);
        assert_eq!(stats.bytes, 5 + 5 + 7);
        assert_eq!(fs::read(dst.path().join("docs/deep/c.log")).unwrap(), b"charlie");
        assert_eq!(
            fs::read_link(dst.path().join("link")).unwrap(),
            PathBuf::from("a.txt")
        );
    }

    #[test]
    fn test_filtered_directory_is_still_descended() {
        let src = tempfile::tempdir().expect("Failed to create temp dir");
        sample_tree(src.path());

        let filter = Filter::new().with_types(FileTypeMask::REGULAR);
        let (seen, archive, _keep) = pack_to_vec(src.path(), &filter);
        assert_eq!(
            seen,
            vec![
                PathBuf::from("a.txt"),
                PathBuf::from("docs/b.md"),
                PathBuf::from("docs/deep/c.log"),
            ]
        );

        let dst = tempfile::tempdir().expect("Failed to create temp dir");
        unpack(File::open(&archive).unwrap(), dst.path(), false, |_| {}).expect("Failed to unpack");
        assert_eq!(fs::read(dst.path().join("docs/deep/c.log")).unwrap(), b"charlie");
        assert!(!dst.path().join("link").exists());
    }

    #[test]
    fn test_single_file_source() {
        let src = tempfile::tempdir().expect("Failed to create temp dir");
        let file = src.path().join("only.bin");
        fs::write(&file, b"single").unwrap();

        let (seen, archive, _keep) = pack_to_vec(&file, &Filter::new());
        assert_eq!(seen, vec![PathBuf::from("only.bin")]);

        let dst = tempfile::tempdir().expect("Failed to create temp dir");
        unpack(File::open(&archive).unwrap(), dst.path(), false, |_| {}).expect("Failed to unpack");
        assert_eq!(fs::read(dst.path().join("only.bin")).unwrap(), b"single");
    }

    #[test]
    fn test_output_inside_source_is_not_packed() {
        let src = tempfile::tempdir().expect("Failed to create temp dir");
        fs::write(src.path().join("a.txt"), b"alpha").unwrap();
        let archive = src.path().join("self.tar");

        let mut seen = Vec::new();
        pack(src.path(), &archive, &Filter::new(), |p| seen.push(p.to_path_buf()))
            .expect("Failed to pack");
        assert_eq!(seen, vec![PathBuf::from("a.txt")]);
    }

    #[test]
    fn test_output_reached_through_dotdot_is_not_packed() {
        let src = tempfile::tempdir().expect("Failed to create temp dir");
        fs::create_dir(src.path().join("sub")).unwrap();
        fs::write(src.path().join("a.txt"), b"alpha").unwrap();
        let archive = src.path().join("sub/../self.tar");

        let mut seen = Vec::new();
        pack(src.path(), &archive, &Filter::new(), |p| seen.push(p.to_path_buf()))
            .expect("Failed to pack");
        assert_eq!(seen, vec![PathBuf::from("a.txt"), PathBuf::from("sub")]);
    }

    #[test]
    fn test_symlinked_source_root_keeps_structure() {
        let base = tempfile::tempdir().expect("Failed to create temp dir");
        let real = base.path().join("real");
        fs::create_dir_all(real.join("x")).unwrap();
        fs::create_dir_all(real.join("y")).unwrap();
        fs::write(real.join("x/same.txt"), b"from x").unwrap();
        fs::write(real.join("y/same.txt"), b"from y").unwrap();
        let link = base.path().join("link");
        symlink(&real, &link).unwrap();

        let (seen, archive, _keep) = pack_to_vec(&link, &Filter::new());
        assert_eq!(
            seen,
            vec![
                PathBuf::from("x"),
                PathBuf::from("x/same.txt"),
                PathBuf::from("y"),
                PathBuf::from("y/same.txt"),
            ]
        );

        let dst = tempfile::tempdir().expect("Failed to create temp dir");
        unpack(File::open(&archive).unwrap(), dst.path(), false, |_| {}).expect("Failed to unpack");
        assert_eq!(fs::read(dst.path().join("x/same.txt")).unwrap(), b"from x");
        assert_eq!(fs::read(dst.path().join("y/same.txt")).unwrap(), b"from y");
        assert!(!dst.path().join("link").exists());
    }

    #[test]
    fn test_symlinked_file_source_is_stored_as_link() {
        let base = tempfile::tempdir().expect("Failed to create temp dir");
        fs::write(base.path().join("target.txt"), b"t").unwrap();
        let link = base.path().join("pointer");
        symlink("target.txt", &link).unwrap();

        let (seen, archive, _keep) = pack_to_vec(&link, &Filter::new());
        assert_eq!(seen, vec![PathBuf::from("pointer")]);

        let dst = tempfile::tempdir().expect("Failed to create temp dir");
        unpack(File::open(&archive).unwrap(), dst.path(), false, |_| {}).expect("Failed to unpack");
        assert_eq!(
            fs::read_link(dst.path().join("pointer")).unwrap(),
            PathBuf::from("target.txt")
        );
    }

    #[test]
    fn test_hard_links_are_stored_once() {
        let src = tempfile::tempdir().expect("Failed to create temp dir");
        fs::write(src.path().join("first"), b"shared").unwrap();
        fs::hard_link(src.path().join("first"), src.path().join("second")).unwrap();

        let (_, archive, _keep) = pack_to_vec(src.path(), &Filter::new());
        let dst = tempfile::tempdir().expect("Failed to create temp dir");
        let stats = unpack(File::open(&archive).unwrap(), dst.path(), false, |_| {})
            .expect("Failed to unpack");
        assert_eq!(stats.bytes, 6);

        let a = fs::metadata(dst.path().join("first")).unwrap();
        let b = fs::metadata(dst.path().join("second")).unwrap();
        assert_eq!(a.ino(), b.ino());
    }

    #[test]
    fn test_fifo_round_trip() {
        let src = tempfile::tempdir().expect("Failed to create temp dir");
        let fifo = src.path().join("pipe");
        nix::unistd::mkfifo(&fifo, NixMode::from_bits_truncate(0o644)).expect("Failed to mkfifo");

        let filter = Filter::new().with_types(FileTypeMask::FIFO);
        let (seen, archive, _keep) = pack_to_vec(src.path(), &filter);
        assert_eq!(seen, vec![PathBuf::from("pipe")]);

        let dst = tempfile::tempdir().expect("Failed to create temp dir");
        unpack(File::open(&archive).unwrap(), dst.path(), false, |_| {}).expect("Failed to unpack");
        let meta = fs::symlink_metadata(dst.path().join("pipe")).unwrap();
        assert_eq!(FileType::from_metadata(&meta), Some(FileType::Fifo));
    }

    #[test]
    fn test_metadata_restored_on_request() {
        let src = tempfile::tempdir().expect("Failed to create temp dir");
        fs::create_dir(src.path().join("dir")).unwrap();
        let file = src.path().join("dir/old.txt");
        fs::write(&file, b"old").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o640)).unwrap();
        let stamp = FileTime::from_unix_time(1_000_000_000, 0);
        filetime::set_file_times(&file, stamp, stamp).unwrap();
        filetime::set_file_times(src.path().join("dir"), stamp, stamp).unwrap();

        let (_, archive, _keep) = pack_to_vec(src.path(), &Filter::new());

        let dst = tempfile::tempdir().expect("Failed to create temp dir");
        unpack(File::open(&archive).unwrap(), dst.path(), true, |_| {}).expect("Failed to unpack");
        let restored = fs::metadata(dst.path().join("dir/old.txt")).unwrap();
        assert_eq!(restored.mtime(), 1_000_000_000);
        assert_eq!(restored.atime(), 1_000_000_000);
        assert_eq!(restored.permissions().mode() & 0o777, 0o640);
        let dir = fs::metadata(dst.path().join("dir")).unwrap();
        assert_eq!(dir.mtime(), 1_000_000_000);
    }

    #[test]
    fn test_time_filter_uses_recorded_mtime() {
        let src = tempfile::tempdir().expect("Failed to create temp dir");
        fs::write(src.path().join("old"), b"1").unwrap();
        fs::write(src.path().join("new"), b"2").unwrap();
        let stamp = FileTime::from_unix_time(500, 0);
        filetime::set_file_times(src.path().join("old"), stamp, stamp).unwrap();

        let filter = Filter::new().with_modify_time(TimeRange::new(0, 1000));
        let (seen, _, _keep) = pack_to_vec(src.path(), &filter);
        assert_eq!(seen, vec![PathBuf::from("old")]);
    }

    #[test]
    fn test_unpack_rejects_garbage() {
        let dst = tempfile::tempdir().expect("Failed to create temp dir");
        let junk = vec![0x41u8; 2048];
        assert!(unpack(&junk[..], dst.path(), false, |_| {}).is_err());
    }
}
