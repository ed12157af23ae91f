//! Durable-storage collaborator for downloaded files.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::StorageError;

#[async_trait]
pub trait FileStore: Send + Sync {
    /// Write `bytes` to `path`. Without `overwrite`, an existing file is
    /// left untouched and `AlreadyExists` is returned. A failed write leaves
    /// nothing behind at `path`.
    async fn write(&self, bytes: &[u8], path: &Path, overwrite: bool) -> Result<(), StorageError>;
}

/// Writes to the local file system.
///
/// Bytes are staged in a temporary file next to the target and renamed into
/// place once complete.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsFileStore;

#[async_trait]
impl FileStore for FsFileStore {
    async fn write(&self, bytes: &[u8], path: &Path, overwrite: bool) -> Result<(), StorageError> {
        let target = path.to_path_buf();
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || write_staged(&bytes, &target, overwrite))
            .await
            .map_err(|e| StorageError::Io { path: path.to_path_buf(), source: std::io::Error::other(e) })?
    }
}

fn write_staged(bytes: &[u8], path: &Path, overwrite: bool) -> Result<(), StorageError> {
    let io = |source: std::io::Error| StorageError::Io { path: path.to_path_buf(), source };

    if !overwrite && path.exists() {
        return Err(StorageError::AlreadyExists(path.to_path_buf()));
    }

    let dir = path.parent().filter(|dir| !dir.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let mut staged = tempfile::Builder::new().prefix(".download-").tempfile_in(dir).map_err(io)?;
    staged.write_all(bytes).map_err(io)?;
    staged.as_file().sync_all().map_err(io)?;

    let persisted = if overwrite { staged.persist(path) } else { staged.persist_noclobber(path) };
    match persisted {
        Ok(_) => Ok(()),
        Err(e) if !overwrite && e.error.kind() == ErrorKind::AlreadyExists => {
            Err(StorageError::AlreadyExists(path.to_path_buf()))
        }
        Err(e) => Err(io(e.error)),
    }
}

/// Target path for a server-suggested file name inside `dir`.
///
/// Only the final component of the suggestion is used, so a name such as
/// `../../etc/passwd` cannot escape `dir`.
pub fn target_path(dir: &Path, suggested: Option<&str>, fallback: &str) -> PathBuf {
    let name = suggested
        .and_then(|name| name.rsplit(['/', '\\']).next())
        .map(str::trim)
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .unwrap_or(fallback);
    dir.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_path_strips_directories() {
        let dir = Path::new("/data/downloads");
        assert_eq!(target_path(dir, Some("../../etc/passwd"), "x"), dir.join("passwd"));
        assert_eq!(target_path(dir, Some("C:\\temp\\scan.png"), "x"), dir.join("scan.png"));
        assert_eq!(target_path(dir, Some(".."), "record_1.bin"), dir.join("record_1.bin"));
        assert_eq!(target_path(dir, None, "record_1.bin"), dir.join("record_1.bin"));
    }

    #[tokio::test]
    async fn refuses_to_overwrite_unless_asked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("consent.pdf");

        FsFileStore.write(b"first", &path, false).await.unwrap();
        let err = FsFileStore.write(b"second", &path, false).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(p) if p == path));
        assert_eq!(std::fs::read(&path).unwrap(), b"first");

        FsFileStore.write(b"third", &path, true).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"third");
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn failed_write_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        // A directory in the way makes the final rename fail.
        let path = dir.path().join("consent.pdf");
        std::fs::create_dir(&path).unwrap();

        let err = FsFileStore.write(b"partial", &path, true).await.unwrap_err();
        assert!(matches!(err, StorageError::Io { .. }));
        assert_eq!(entries(dir.path()), vec!["consent.pdf".to_string()]);
        assert!(path.is_dir());

        let retry = dir.path().join("retry.pdf");
        FsFileStore.write(b"complete", &retry, false).await.unwrap();
        assert_eq!(std::fs::read(&retry).unwrap(), b"complete");
        assert_eq!(entries(dir.path()), vec!["consent.pdf".to_string(), "retry.pdf".to_string()]);
    }

    #[tokio::test]
    async fn missing_directory_is_an_io_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent").join("file.bin");
        let err = FsFileStore.write(b"x", &path, true).await.unwrap_err();
        assert!(matches!(err, StorageError::Io { .. }));
    }
}
