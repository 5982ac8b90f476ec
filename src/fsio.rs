//! Ambient filesystem helpers.
//!
//! Capability-style directory handles keep file access anchored to the
//! specific paths the operator configured (startup scripts, metadata files,
//! debug key dumps) instead of handing the whole filesystem around.

use camino::Utf8Path;
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;

fn split(path: &str) -> Result<(&Utf8Path, &Utf8Path), String> {
    let path_buf = Utf8Path::new(path);
    if path_buf.is_absolute() {
        let parent = path_buf
            .parent()
            .ok_or_else(|| format!("path has no parent directory: {path_buf}"))?;
        let file_name = path_buf
            .file_name()
            .ok_or_else(|| format!("path has no file name: {path_buf}"))?;
        Ok((parent, Utf8Path::new(file_name)))
    } else {
        Ok((Utf8Path::new("."), path_buf))
    }
}

/// Reads a UTF-8 file through an ambient directory handle.
pub(crate) fn read_to_string_ambient(path: &str) -> Result<String, String> {
    let (dir_path, file_path) = split(path)?;
    let dir =
        Dir::open_ambient_dir(dir_path, ambient_authority()).map_err(|err| err.to_string())?;
    dir.read_to_string(file_path).map_err(|err| err.to_string())
}

/// Writes a UTF-8 file through an ambient directory handle.
pub(crate) fn write_string_ambient(path: &str, contents: &str) -> Result<(), String> {
    let (dir_path, file_path) = split(path)?;
    let dir =
        Dir::open_ambient_dir(dir_path, ambient_authority()).map_err(|err| err.to_string())?;
    dir.write(file_path, contents).map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_an_absolute_path() {
        let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = dir.path().join("note.txt");
        let path_str = path.to_string_lossy().into_owned();

        write_string_ambient(&path_str, "contents")
            .unwrap_or_else(|err| panic!("write: {err}"));
        let read = read_to_string_ambient(&path_str).unwrap_or_else(|err| panic!("read: {err}"));
        assert_eq!(read, "contents");
    }

    #[test]
    fn missing_file_reports_an_error() {
        let result = read_to_string_ambient("/definitely/not/a/real/file.txt");
        assert!(result.is_err());
    }
}
