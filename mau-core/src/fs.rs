//! Filesystem helpers: filename sanitisation and atomic writes.

use std::io::{self, Write};
use std::path::Path;
use std::time::SystemTime;

use thiserror::Error;

/// Longest file name accepted, in bytes.
pub const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilenameError {
    #[error("file name is empty")]
    Empty,
    #[error("file name `{0}` is reserved")]
    Reserved(String),
    #[error("file name `{0}` contains a path separator")]
    PathSeparator(String),
    #[error("file name contains a NUL byte")]
    Nul,
    #[error("file name is {0} bytes long (max {MAX_NAME_LEN})")]
    TooLong(usize),
}

/// Validates that `name` is a single, plain path component.
///
/// Names come from remote peers, so anything that could escape the target
/// directory is rejected rather than rewritten.
pub fn sanitize_filename(name: &str) -> Result<&str, FilenameError> {
    if name.is_empty() {
        return Err(FilenameError::Empty);
    }
    if name == "." || name == ".." {
        return Err(FilenameError::Reserved(name.to_owned()));
    }
    if name.contains(['/', '\\']) {
        return Err(FilenameError::PathSeparator(name.to_owned()));
    }
    if name.contains('\0') {
        return Err(FilenameError::Nul);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(FilenameError::TooLong(name.len()));
    }
    Ok(name)
}

/// Writes `bytes` to `path` so that readers see either the old file or the
/// complete new one.
///
/// The data goes to a temporary file in the destination directory, is synced,
/// gets `modified` applied when given, and is then renamed over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8], modified: Option<SystemTime>) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::Builder::new().prefix(".mau-").tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    if let Some(modified) = modified {
        tmp.as_file().set_modified(modified)?;
    }
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;

    #[test]
    fn given_plain_name_when_sanitized_then_accepted() {
        assert_eq!(sanitize_filename("hello world.txt"), Ok("hello world.txt"));
    }

    #[test]
    fn given_traversal_names_when_sanitized_then_rejected() {
        assert_eq!(sanitize_filename(""), Err(FilenameError::Empty));
        assert!(matches!(sanitize_filename(".."), Err(FilenameError::Reserved(_))));
        assert!(matches!(sanitize_filename("."), Err(FilenameError::Reserved(_))));
        assert!(matches!(
            sanitize_filename("../etc/passwd"),
            Err(FilenameError::PathSeparator(_))
        ));
        assert!(matches!(
            sanitize_filename("..\\boot.ini"),
            Err(FilenameError::PathSeparator(_))
        ));
        assert_eq!(sanitize_filename("a\0b"), Err(FilenameError::Nul));
    }

    #[test]
    fn given_overlong_name_when_sanitized_then_rejected() {
        let name = "x".repeat(MAX_NAME_LEN + 1);
        assert_eq!(
            sanitize_filename(&name),
            Err(FilenameError::TooLong(MAX_NAME_LEN + 1))
        );
        assert!(sanitize_filename(&name[1..]).is_ok());
    }

    #[test]
    fn given_missing_dir_when_writing_atomically_then_created_with_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("file.mau");
        write_atomic(&path, b"payload", None).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"payload");
    }

    #[test]
    fn given_existing_file_when_overwritten_then_no_temp_files_remain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.mau");
        write_atomic(&path, b"first", None).unwrap();
        write_atomic(&path, b"second", None).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn given_modification_time_when_writing_then_applied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.mau");
        let when = UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        write_atomic(&path, b"x", Some(when)).unwrap();
        let modified = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(modified, when);
    }
}
