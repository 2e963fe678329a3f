//! End-to-end backup and restore through the public API.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use backup_engine::{
    inspect, Action, EngineError, FileTypeMask, Filter, Mode, Task, TaskConfig, HEADER_LEN,
};
use filetime::FileTime;

/// Relative paths of everything under `root`, sorted.
fn tree_listing(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).expect("Failed to read dir") {
            let path = entry.expect("Failed to read entry").path();
            out.push(path.strip_prefix(root).unwrap().to_path_buf());
            if fs::symlink_metadata(&path).unwrap().is_dir() {
                stack.push(path);
            }
        }
    }
    out.sort();
    out
}

fn sample_tree(root: &Path) -> PathBuf {
    let src = root.join("src");
    fs::create_dir_all(src.join("nested/deeper")).expect("Failed to create src dir");
    fs::write(src.join("a.txt"), b"alpha").expect("Failed to write file");
    fs::write(src.join("nested/b.bin"), vec![0xABu8; 200_000]).expect("Failed to write file");
    fs::write(src.join("nested/deeper/c.txt"), b"charlie").expect("Failed to write file");
    std::os::unix::fs::symlink("../a.txt", src.join("nested/link")).expect("Failed to symlink");
    src
}

fn backup(src: &Path, dest: &Path, mode: Mode, password: Option<&str>) -> PathBuf {
    let mut task = Task::new(src, dest, TaskConfig::default()).expect("Failed to create task");
    task.set_mode(mode);
    task.backup(password, None).expect("Failed to back up").artifact
}

fn restore(artifact: &Path, target: &Path, password: Option<&str>) -> Result<(), EngineError> {
    let mut task = Task::new(target, artifact, TaskConfig::default()).expect("Failed to create task");
    task.restore(password, None).map(|_| ())
}

#[test]
fn test_end_to_end_filtered_encrypted_backup() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let src = temp_dir.path().join("data");
    fs::create_dir_all(src.join("dir")).expect("Failed to create src dir");
    fs::write(src.join("a.txt"), b"hello").expect("Failed to write file");
    let yesterday = chrono::Utc::now().timestamp() - 86_400;
    let stamp = FileTime::from_unix_time(yesterday, 0);
    filetime::set_file_times(src.join("a.txt"), stamp, stamp).expect("Failed to set times");

    let mut task = Task::new(&src, temp_dir.path().join("out"), TaskConfig::default())
        .expect("Failed to create task");
    task.set_mode(Mode::COMPRESSED | Mode::ENCRYPTED);
    task.set_filter(
        Filter::new()
            .with_name_pattern(r"a\.txt")
            .expect("Failed to build filter")
            .with_types(FileTypeMask::REGULAR),
    );
    let report = task.backup(Some("secret1"), None).expect("Failed to back up");
    assert_eq!(report.entries, 1);

    let wrong_target = temp_dir.path().join("wrong");
    let err = restore(&report.artifact, &wrong_target, Some("wrong12")).unwrap_err();
    assert!(matches!(err, EngineError::WrongPassword));
    assert!(!wrong_target.exists());
    assert!(!temp_dir.path().join("out.tar.zst").exists());

    let target = temp_dir.path().join("restored");
    restore(&report.artifact, &target, Some("secret1")).expect("Failed to restore");
    assert_eq!(tree_listing(&target), vec![PathBuf::from("a.txt")]);
    assert_eq!(fs::read(target.join("a.txt")).unwrap(), b"hello");
    assert!(report.artifact.exists());
}

#[test]
fn test_every_mode_round_trips() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let src = sample_tree(temp_dir.path());
    let expected = tree_listing(&src);

    let modes = [Mode::PACK_ONLY, Mode::COMPRESSED, Mode::ENCRYPTED, Mode::ALL];
    for (i, mode) in modes.iter().enumerate() {
        let password = if mode.is_encrypted() { Some("secret1") } else { None };
        let artifact = backup(&src, &temp_dir.path().join(format!("out{}", i)), *mode, password);
        assert_eq!(inspect(&artifact).expect("Failed to inspect").mode, *mode);

        let target = temp_dir.path().join(format!("restored{}", i));
        restore(&artifact, &target, password).expect("Failed to restore");
        assert_eq!(tree_listing(&target), expected, "mode {}", mode);
        assert_eq!(
            fs::read(target.join("nested/b.bin")).unwrap(),
            fs::read(src.join("nested/b.bin")).unwrap()
        );
        assert_eq!(
            fs::read_link(target.join("nested/link")).unwrap(),
            PathBuf::from("../a.txt")
        );
    }
}

#[test]
fn test_header_byte_flip_is_invalid_archive() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let src = sample_tree(temp_dir.path());
    let artifact = backup(&src, &temp_dir.path().join("out"), Mode::COMPRESSED, None);

    let mut bytes = fs::read(&artifact).unwrap();
    let at = bytes.len() - HEADER_LEN + 20;
    bytes[at] ^= 0x01;
    fs::write(&artifact, &bytes).unwrap();

    assert!(matches!(
        inspect(&artifact).unwrap_err(),
        EngineError::InvalidArchive { .. }
    ));
    let target = temp_dir.path().join("restored");
    assert!(matches!(
        restore(&artifact, &target, None).unwrap_err(),
        EngineError::InvalidArchive { .. }
    ));
    assert!(!target.exists());
}

#[test]
fn test_truncated_ciphertext_is_file_error() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let src = sample_tree(temp_dir.path());
    let artifact = backup(&src, &temp_dir.path().join("out"), Mode::ENCRYPTED, Some("secret1"));

    // Cut the payload but keep a valid header behind it.
    let bytes = fs::read(&artifact).unwrap();
    let (payload, header) = bytes.split_at(bytes.len() - HEADER_LEN);
    let mut damaged = payload[..payload.len() - 100].to_vec();
    damaged.extend_from_slice(header);
    fs::write(&artifact, &damaged).unwrap();

    let err = restore(&artifact, &temp_dir.path().join("restored"), Some("secret1")).unwrap_err();
    assert!(matches!(
        err,
        EngineError::StageFailed {
            action: Action::Decrypt,
            ..
        }
    ));
    assert!(!temp_dir.path().join("out.tar").exists());
}

#[test]
fn test_compress_only_restore_keeps_artifact() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let src = sample_tree(temp_dir.path());
    let artifact = backup(&src, &temp_dir.path().join("out"), Mode::COMPRESSED, None);
    assert_eq!(artifact, temp_dir.path().join("out.tar.zst"));

    restore(&artifact, &temp_dir.path().join("restored"), None).expect("Failed to restore");
    assert!(artifact.exists());
    assert!(!temp_dir.path().join("out.tar").exists());

    // A second restore from the same artifact still works.
    restore(&artifact, &temp_dir.path().join("again"), None).expect("Failed to restore");
}

#[test]
fn test_restore_leaves_unrelated_files_alone() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let src = sample_tree(temp_dir.path());
    let artifact = backup(&src, &temp_dir.path().join("x"), Mode::ALL, Some("secret1"));
    assert_eq!(artifact, temp_dir.path().join("x.tar.zst.ept"));

    // Files that merely share the intermediate names
    let tar = temp_dir.path().join("x.tar");
    let zst = temp_dir.path().join("x.tar.zst");
    fs::write(&tar, b"last week's tarball").expect("Failed to write file");
    fs::write(&zst, b"not ours either").expect("Failed to write file");

    let target = temp_dir.path().join("restored");
    restore(&artifact, &target, Some("secret1")).expect("Failed to restore");
    assert_eq!(tree_listing(&target), tree_listing(&src));
    assert_eq!(fs::read(&tar).unwrap(), b"last week's tarball");
    assert_eq!(fs::read(&zst).unwrap(), b"not ours either");

    let mut left: Vec<_> = fs::read_dir(temp_dir.path())
        .expect("Failed to read dir")
        .map(|entry| entry.expect("Failed to read entry").file_name().to_string_lossy().into_owned())
        .collect();
    left.sort();
    assert_eq!(left, ["restored", "src", "x.tar", "x.tar.zst", "x.tar.zst.ept"]);
}

#[test]
fn test_failed_compress_keeps_packed_archive() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let src = sample_tree(temp_dir.path());
    // A directory where the compressed file has to go
    fs::create_dir(temp_dir.path().join("out.tar.zst")).expect("Failed to create dir");

    let mut task = Task::new(&src, temp_dir.path().join("out"), TaskConfig::default())
        .expect("Failed to create task");
    task.set_mode(Mode::COMPRESSED);
    let err = task.backup(None, None).unwrap_err();
    assert!(matches!(
        err,
        EngineError::StageFailed {
            action: Action::Compress,
            ..
        }
    ));
    assert!(err.to_string().starts_with("failed to compress file"));

    let packed = temp_dir.path().join("out.tar");
    assert!(packed.is_file());
    assert!(temp_dir.path().join("out.tar.zst").is_dir());

    // The packed stage finished, so its archive is complete
    let mut listing = Vec::new();
    let file = fs::File::open(&packed).expect("Failed to open archive");
    for entry in tar::Archive::new(file).entries().expect("Failed to read archive") {
        let entry = entry.expect("Failed to read entry");
        listing.push(entry.path().expect("Failed to read path").into_owned());
    }
    assert!(listing.contains(&PathBuf::from("nested/deeper/c.txt")));
}

#[test]
fn test_metadata_restored_only_on_request() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let src = sample_tree(temp_dir.path());
    let stamp = FileTime::from_unix_time(1_234_567_890, 0);
    filetime::set_file_times(src.join("a.txt"), stamp, stamp).expect("Failed to set times");
    let artifact = backup(&src, &temp_dir.path().join("out"), Mode::PACK_ONLY, None);

    let plain = temp_dir.path().join("plain");
    restore(&artifact, &plain, None).expect("Failed to restore");
    assert_ne!(fs::metadata(plain.join("a.txt")).unwrap().mtime(), 1_234_567_890);

    let config = TaskConfig {
        restore_metadata: true,
        ..TaskConfig::default()
    };
    let full = temp_dir.path().join("full");
    let mut task = Task::new(&full, &artifact, config).expect("Failed to create task");
    task.restore(None, None).expect("Failed to restore");
    let meta = fs::metadata(full.join("a.txt")).unwrap();
    assert_eq!(meta.mtime(), 1_234_567_890);
    assert_eq!(meta.uid(), fs::metadata(src.join("a.txt")).unwrap().uid());
}

#[test]
fn test_backup_into_source_tree() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let src = sample_tree(temp_dir.path());
    let artifact = backup(&src, &src.join("self"), Mode::PACK_ONLY, None);

    let target = temp_dir.path().join("restored");
    restore(&artifact, &target, None).expect("Failed to restore");
    assert!(!target.join("self.tar").exists());
    assert!(target.join("a.txt").exists());
}
