//! Backup handling for in-place file rewrites.
//!
//! When a file is rewritten at its original path the original is first
//! moved aside to a sibling backup file and reopened read-only as the data
//! source. Any failure after that point must restore the original before
//! the error is propagated.

use crate::error::{Error, Result};
use crate::notify::NotificationList;

use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// Moves the file at `original_path` to a sibling backup file and opens the
/// backup read-only.
///
/// The backup is named `<file>.bak`; when that name is taken, `<file>.bak.1`
/// and so on are tried. Returns the backup path together with the opened
/// backup file.
pub fn create_backup(original_path: &Path) -> Result<(PathBuf, File)> {
    let backup_path = free_backup_path(original_path)?;
    fs::rename(original_path, &backup_path)?;
    tracing::debug!(original = %original_path.display(), backup = %backup_path.display(),
        "moved original file to backup");
    let backup = File::open(&backup_path)?;
    Ok((backup_path, backup))
}

fn free_backup_path(original_path: &Path) -> Result<PathBuf> {
    let mut name = original_path.file_name().map(|n| n.to_os_string()).ok_or_else(|| {
        Error::InvalidData(format!(
            "path {} has no file name",
            original_path.display()
        ))
    })?;
    name.push(".bak");
    let candidate = original_path.with_file_name(&name);
    if !candidate.exists() {
        return Ok(candidate);
    }
    for n in 1..=255u32 {
        let mut numbered = name.clone();
        numbered.push(format!(".{}", n));
        let candidate = original_path.with_file_name(&numbered);
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(Error::InvalidData(format!(
        "no free backup path next to {}",
        original_path.display()
    )))
}

/// Restores the original file from its backup.
///
/// A partial output at `original_path` is removed first, then the backup is
/// renamed back.
pub fn restore_original(original_path: &Path, backup_path: &Path) -> Result<()> {
    if original_path.exists() {
        fs::remove_file(original_path)?;
    }
    fs::rename(backup_path, original_path)?;
    tracing::debug!(original = %original_path.display(), "restored original file from backup");
    Ok(())
}

/// Handles a failure that occurred after the output file was modified.
///
/// When a backup exists the original is restored from it; when the output
/// was a separate save-as target the partial target is removed; otherwise
/// the file was patched in place and only a notification can be recorded.
/// Returns the error to propagate (the original `cause`, unless the
/// restore itself failed).
pub fn handle_failure_after_file_modified(
    original_path: &Path,
    backup_path: Option<&Path>,
    save_as_path: Option<&Path>,
    cause: Error,
    notifications: &mut NotificationList,
) -> Error {
    const CONTEXT: &str = "restoring original file";
    match backup_path {
        Some(backup) => match restore_original(original_path, backup) {
            Ok(()) => {
                notifications.warning(
                    CONTEXT,
                    "the operation failed; the original file has been restored from backup",
                );
                cause
            }
            Err(restore_err) => {
                notifications.critical(
                    CONTEXT,
                    format!(
                        "the operation failed and restoring the original file failed as well \
                         (backup kept at {}): {}",
                        backup.display(),
                        restore_err
                    ),
                );
                cause
            }
        },
        None => {
            if let Some(save_as) = save_as_path {
                if let Err(remove_err) = fs::remove_file(save_as) {
                    notifications.warning(
                        CONTEXT,
                        format!(
                            "unable to remove partial output {}: {}",
                            save_as.display(),
                            remove_err
                        ),
                    );
                } else {
                    notifications.warning(CONTEXT, "partial output file removed");
                }
            } else {
                notifications.critical(
                    CONTEXT,
                    "the operation failed after the file was modified in place; \
                     the file may be corrupted",
                );
            }
            cause
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_create_and_restore_backup() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("movie.mkv");
        fs::write(&original, b"original content").unwrap();

        let (backup_path, mut backup) = create_backup(&original).unwrap();
        assert!(!original.exists());
        assert!(backup_path.exists());
        let mut content = String::new();
        backup.read_to_string(&mut content).unwrap();
        assert_eq!(content, "original content");

        // Simulate a partial rewrite, then restore.
        let mut partial = File::create(&original).unwrap();
        partial.write_all(b"partial").unwrap();
        drop(partial);

        restore_original(&original, &backup_path).unwrap();
        assert!(!backup_path.exists());
        assert_eq!(fs::read(&original).unwrap(), b"original content");
    }

    #[test]
    fn test_backup_path_collision() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("movie.mkv");
        fs::write(&original, b"a").unwrap();
        fs::write(dir.path().join("movie.mkv.bak"), b"taken").unwrap();

        let (backup_path, _) = create_backup(&original).unwrap();
        assert_eq!(
            backup_path.file_name().unwrap().to_str().unwrap(),
            "movie.mkv.bak.1"
        );
    }

    #[test]
    fn test_failure_handler_restores() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("movie.mkv");
        fs::write(&original, b"original content").unwrap();
        let (backup_path, _) = create_backup(&original).unwrap();
        fs::write(&original, b"broken").unwrap();

        let mut notifications = NotificationList::new();
        let err = handle_failure_after_file_modified(
            &original,
            Some(&backup_path),
            None,
            Error::OperationAborted,
            &mut notifications,
        );
        assert!(matches!(err, Error::OperationAborted));
        assert_eq!(fs::read(&original).unwrap(), b"original content");
        assert!(!notifications.is_empty());
    }

    #[test]
    fn test_failure_handler_removes_save_as_target() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("movie.mkv");
        let target = dir.path().join("out.mkv");
        fs::write(&original, b"original").unwrap();
        fs::write(&target, b"partial").unwrap();

        let mut notifications = NotificationList::new();
        let err = handle_failure_after_file_modified(
            &original,
            None,
            Some(&target),
            Error::InvalidData("boom".into()),
            &mut notifications,
        );
        assert!(matches!(err, Error::InvalidData(_)));
        assert!(original.exists());
        assert!(!target.exists());
    }
}
