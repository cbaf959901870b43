//! Utility functions for reading local files named by configuration.

use std::io;

use camino::Utf8Path;
use cap_std::ambient_authority;
use cap_std::fs_utf8::{Dir, Metadata};

/// Expands a leading `~/` prefix to the user's home directory.
///
/// If `HOME` is not set the input is returned unchanged.
///
/// # Examples
///
/// ```
/// # use cirrus::paths::expand_tilde;
/// assert_eq!(expand_tilde("/absolute/path"), "/absolute/path");
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

fn open_parent(path: &Utf8Path) -> io::Result<(Dir, &Utf8Path)> {
    let (dir_path, file_path) = if path.is_absolute() {
        let parent = path.parent().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("path has no parent directory: {path}"),
            )
        })?;
        let file_name = path.file_name().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("path has no file name: {path}"),
            )
        })?;
        (parent, Utf8Path::new(file_name))
    } else {
        (Utf8Path::new("."), path)
    };
    let dir = Dir::open_ambient_dir(dir_path, ambient_authority())?;
    Ok((dir, file_path))
}

/// Reads `path` through a capability handle on its parent directory.
///
/// Relative paths resolve against the working directory.
///
/// # Errors
///
/// Returns a message describing why the file could not be read.
pub fn read_to_string_ambient(path: &str) -> Result<String, String> {
    let expanded = expand_tilde(path);
    let (dir, file) = open_parent(Utf8Path::new(&expanded)).map_err(|err| err.to_string())?;
    dir.read_to_string(file).map_err(|err| err.to_string())
}

/// Metadata of `path`, read through a capability handle on its parent.
///
/// # Errors
///
/// Returns the underlying I/O error, so callers can tell a missing file
/// from an unreadable one.
pub fn metadata_ambient(path: &str) -> io::Result<Metadata> {
    let expanded = expand_tilde(path);
    let (dir, file) = open_parent(Utf8Path::new(&expanded))?;
    dir.metadata(file)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn reads_absolute_paths() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("payload.txt");
        std::fs::write(&path, "hello").expect("write file");

        let body = read_to_string_ambient(path.to_str().expect("utf8 path")).expect("readable");
        assert_eq!(body, "hello");
    }

    #[test]
    fn missing_files_report_an_error() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("absent.txt");
        assert!(read_to_string_ambient(path.to_str().expect("utf8 path")).is_err());
    }

    #[test]
    fn metadata_reports_missing_files_as_not_found() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("absent.pem");
        let err = metadata_ambient(path.to_str().expect("utf8 path")).expect_err("absent");
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn metadata_describes_existing_files() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("deploy.pem");
        std::fs::write(&path, "key").expect("write file");
        let metadata = metadata_ambient(path.to_str().expect("utf8 path")).expect("present");
        assert!(metadata.is_file());
        assert_eq!(metadata.len(), 3);
    }

    #[test]
    fn non_tilde_paths_are_unchanged() {
        assert_eq!(expand_tilde("relative/key.pem"), "relative/key.pem");
    }
}
