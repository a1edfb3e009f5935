use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Result, RhizomeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Added,
    Modified,
    Unchanged,
}

/// Writes artifacts under the output directory. Each file is written to a
/// hidden sibling, synced, then renamed over the target, so readers only ever
/// see a complete old or a complete new file.
#[derive(Debug, Clone)]
pub struct OutputWriter {
    output_dir: PathBuf,
}

impl OutputWriter {
    pub fn new(output_dir: impl AsRef<Path>) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn exists(&self, relative: &Path) -> bool {
        self.output_dir.join(relative).is_file()
    }

    pub fn write(&self, relative: &Path, content: &[u8]) -> Result<WriteStatus> {
        let target = self.output_dir.join(relative);
        let write_error = |source: std::io::Error| RhizomeError::Write {
            path: target.clone(),
            source,
        };

        let status = match fs::read(&target) {
            Ok(existing) if existing == content => return Ok(WriteStatus::Unchanged),
            Ok(_) => WriteStatus::Modified,
            Err(_) => WriteStatus::Added,
        };

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(write_error)?;
        }

        let staging = staging_path(&target);
        let result = (|| {
            let mut file = File::create(&staging)?;
            file.write_all(content)?;
            file.sync_all()?;
            fs::rename(&staging, &target)
        })();

        if let Err(error) = result {
            let _ = fs::remove_file(&staging);
            return Err(write_error(error));
        }

        Ok(status)
    }

    /// Removes an artifact and any directories it leaves empty. Returns whether
    /// a file was actually removed.
    pub fn remove(&self, relative: &Path) -> Result<bool> {
        let target = self.output_dir.join(relative);
        match fs::remove_file(&target) {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(source) => return Err(RhizomeError::Write { path: target, source }),
        }

        let mut directory = target.parent();
        while let Some(current) = directory {
            if current == self.output_dir || !current.starts_with(&self.output_dir) {
                break;
            }
            if fs::remove_dir(current).is_err() {
                break;
            }
            directory = current.parent();
        }

        Ok(true)
    }
}

fn staging_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.rhizome-tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_reports_status() {
        let dir = TempDir::new().unwrap();
        let writer = OutputWriter::new(dir.path());
        let path = Path::new("docs/intro/index.html");

        assert_eq!(writer.write(path, b"one").unwrap(), WriteStatus::Added);
        assert_eq!(writer.write(path, b"one").unwrap(), WriteStatus::Unchanged);
        assert_eq!(writer.write(path, b"two").unwrap(), WriteStatus::Modified);
        assert_eq!(fs::read_to_string(dir.path().join(path)).unwrap(), "two");
    }

    #[test]
    fn test_no_staging_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let writer = OutputWriter::new(dir.path());
        writer.write(Path::new("a/index.html"), b"content").unwrap();

        let names: Vec<String> = fs::read_dir(dir.path().join("a"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["index.html".to_string()]);
    }

    #[test]
    fn test_failed_write_keeps_previous_file() {
        let dir = TempDir::new().unwrap();
        let writer = OutputWriter::new(dir.path());
        writer.write(Path::new("a/index.html"), b"old").unwrap();

        // A directory where the file should go makes the rename fail.
        fs::create_dir_all(dir.path().join("b/index.html")).unwrap();
        let error = writer.write(Path::new("b/index.html"), b"new").unwrap_err();
        assert!(matches!(error, RhizomeError::Write { .. }));
        assert!(!dir.path().join("b/.index.html.rhizome-tmp").exists());
        assert_eq!(fs::read_to_string(dir.path().join("a/index.html")).unwrap(), "old");
    }

    #[test]
    fn test_remove_prunes_empty_directories() {
        let dir = TempDir::new().unwrap();
        let writer = OutputWriter::new(dir.path());
        writer.write(Path::new("docs/a/index.html"), b"a").unwrap();
        writer.write(Path::new("docs/b/index.html"), b"b").unwrap();

        assert!(writer.remove(Path::new("docs/a/index.html")).unwrap());
        assert!(!dir.path().join("docs/a").exists());
        assert!(dir.path().join("docs/b/index.html").exists());
        assert!(!writer.remove(Path::new("docs/a/index.html")).unwrap());
        assert!(dir.path().exists());
    }
}
