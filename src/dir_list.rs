//! Non-recursive directory listing for the walker.
//!
//! Lists the immediate children of a directory with the metadata the visit
//! protocol needs. The listing is non-recursive: each directory carries its
//! own sidecar describing only its immediate files, so directories can be
//! moved as self-contained units. The sidecar itself is never listed.

use crate::sidecar::SIDECAR_NAME;
use std::collections::BTreeMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum DirListError {
    #[error("IO error: {0}")]
    Io(std::io::Error),
    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),
    #[error("non-UTF-8 path not supported: {0:?}")]
    NonUtf8Path(PathBuf),
}

#[derive(Debug)]
pub enum FsEntry {
    /// A regular file, with its stat result.
    File { metadata: Metadata },
    Dir,
    /// Symlinks, sockets, devices; skipped by the walker without error.
    Other,
}

pub fn list_directory(dir: &Path) -> Result<BTreeMap<String, FsEntry>, DirListError> {
    let read_dir = std::fs::read_dir(dir).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            DirListError::PermissionDenied(dir.to_path_buf())
        } else {
            DirListError::Io(e)
        }
    })?;

    let mut entries = BTreeMap::new();

    for entry in read_dir {
        let entry = entry.map_err(DirListError::Io)?;
        let path = entry.path();

        let filename = path
            .file_name()
            .ok_or_else(|| DirListError::Io(std::io::Error::other("failed to get filename")))?
            .to_str()
            .ok_or_else(|| DirListError::NonUtf8Path(path.clone()))?
            .to_string();

        if filename == SIDECAR_NAME {
            continue;
        }

        let metadata = std::fs::symlink_metadata(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                DirListError::PermissionDenied(path.clone())
            } else {
                DirListError::Io(e)
            }
        })?;

        let file_type = metadata.file_type();
        let fs_entry = if file_type.is_dir() {
            FsEntry::Dir
        } else if file_type.is_file() {
            FsEntry::File { metadata }
        } else {
            FsEntry::Other
        };

        entries.insert(filename, fs_entry);
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_list_simple_directory() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("file1.txt"), "content1").unwrap();
        fs::write(temp.path().join("file2.txt"), "content2").unwrap();
        fs::create_dir(temp.path().join("dir1")).unwrap();

        let entries = list_directory(temp.path()).unwrap();

        assert_eq!(entries.len(), 3);
        assert!(matches!(entries.get("dir1"), Some(FsEntry::Dir)));
        assert!(matches!(
            entries.get("file1.txt"),
            Some(FsEntry::File { .. })
        ));
        assert!(matches!(
            entries.get("file2.txt"),
            Some(FsEntry::File { .. })
        ));
    }

    #[test]
    fn test_list_excludes_sidecar() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("file1.txt"), "content").unwrap();
        fs::write(temp.path().join(SIDECAR_NAME), "<dr/>").unwrap();

        let entries = list_directory(temp.path()).unwrap();

        assert_eq!(entries.len(), 1);
        assert!(!entries.contains_key(SIDECAR_NAME));
    }

    #[test]
    fn test_list_empty_directory() {
        let temp = TempDir::new().unwrap();
        let entries = list_directory(temp.path()).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_file_metadata_captured() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("test.txt"), "content").unwrap();

        let entries = list_directory(temp.path()).unwrap();

        match entries.get("test.txt") {
            Some(FsEntry::File { metadata }) => assert_eq!(metadata.len(), 7),
            other => panic!("expected file entry, got {other:?}"),
        }
    }

    #[test]
    fn test_deterministic_sorted_order() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("zebra.txt"), "z").unwrap();
        fs::write(temp.path().join("apple.txt"), "a").unwrap();
        fs::write(temp.path().join("mango.txt"), "m").unwrap();

        let entries = list_directory(temp.path()).unwrap();

        let keys: Vec<&String> = entries.keys().collect();
        assert_eq!(keys, ["apple.txt", "mango.txt", "zebra.txt"]);
    }

    #[test]
    #[cfg(unix)]
    fn test_symlink_listed_as_other() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("target.txt"), "content").unwrap();
        std::os::unix::fs::symlink(temp.path().join("target.txt"), temp.path().join("link"))
            .unwrap();

        let entries = list_directory(temp.path()).unwrap();

        assert!(matches!(entries.get("link"), Some(FsEntry::Other)));
    }

    #[test]
    #[cfg(unix)]
    fn test_fifo_listed_as_other() {
        use nix::sys::stat;
        use nix::unistd;

        let temp = TempDir::new().unwrap();
        unistd::mkfifo(&temp.path().join("pipe"), stat::Mode::S_IRWXU).unwrap();

        let entries = list_directory(temp.path()).unwrap();
        assert!(matches!(entries.get("pipe"), Some(FsEntry::Other)));
    }

    #[test]
    #[cfg(unix)]
    fn test_permission_denied() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let restricted = temp.path().join("restricted");
        fs::create_dir(&restricted).unwrap();

        let mut perms = fs::metadata(&restricted).unwrap().permissions();
        perms.set_mode(0o000);
        fs::set_permissions(&restricted, perms.clone()).unwrap();

        let result = list_directory(&restricted);

        perms.set_mode(0o755);
        fs::set_permissions(&restricted, perms).unwrap();

        assert!(matches!(result, Err(DirListError::PermissionDenied(_))));
    }
}
