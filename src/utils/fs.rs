use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::path::Path;

/// Create the parent directory of `path` if it does not exist yet.
///
/// Returns the raw I/O error so callers with typed errors can wrap it themselves.
pub fn create_parent_dir(path: &Path) -> io::Result<()> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
        && !dir.is_dir()
    {
        fs::create_dir_all(dir)?;
        tracing::debug!(dir = %dir.display(), "Created directory");
    }
    Ok(())
}

/// [`create_parent_dir`] with the directory named in the error.
pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    create_parent_dir(path).with_context(|| {
        format!(
            "Failed to create directory {}",
            path.parent().unwrap_or(path).display()
        )
    })
}

/// Write `data` to `path`, creating parent directories as needed.
pub fn write_creating_dirs(path: &Path, data: &[u8]) -> Result<()> {
    ensure_parent_dir(path)?;
    fs::write(path, data).with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_into_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("out.png");

        write_creating_dirs(&path, b"data").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"data");
    }

    #[test]
    fn bare_file_name_has_no_parent_to_create() {
        assert!(ensure_parent_dir(Path::new("out.png")).is_ok());
    }

    #[test]
    fn parent_that_is_a_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"").unwrap();

        let err = ensure_parent_dir(&blocker.join("out.png")).unwrap_err();
        assert!(err.to_string().contains("Failed to create directory"));
    }
}
