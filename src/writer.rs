use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{SaveError, SaveResult};

const TEMP_SUFFIX: &str = ".tmp";

/// How hard a commit pushes data to stable storage before returning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    /// Leave it to the page cache.
    Buffer,
    /// `fsync` the file and its directory.
    #[default]
    Fsync,
    /// `fdatasync` the file, `fsync` the directory.
    Fdatasync,
}

impl FromStr for Durability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "buffer" => Ok(Durability::Buffer),
            "fsync" => Ok(Durability::Fsync),
            "fdatasync" => Ok(Durability::Fdatasync),
            _ => Err(format!("Unknown durability option: {}", s)),
        }
    }
}

/// Whether a file name belongs to an in-flight (or abandoned) temp file.
pub fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(TEMP_SUFFIX)
}

/// Writes files through a temp file in the destination directory and a
/// rename, so a file under its final name is always complete.
#[derive(Debug, Clone, Copy, Default)]
pub struct AtomicWriter {
    durability: Durability,
}

impl AtomicWriter {
    pub fn new(durability: Durability) -> Self {
        Self { durability }
    }

    pub fn durability(&self) -> Durability {
        self.durability
    }

    /// Writes `bytes` to `path`, which must not exist yet.
    pub fn commit(&self, path: &Path, bytes: &[u8]) -> SaveResult<u64> {
        let mut reader = bytes;
        self.commit_from(path, &mut reader, bytes.len() as u64)
    }

    /// Streams `reader` into `path`. Fails unless exactly `expected_len`
    /// bytes arrive.
    pub fn commit_from<R: Read>(&self, path: &Path, reader: &mut R, expected_len: u64) -> SaveResult<u64> {
        self.stage(path, reader, expected_len)?.persist()
    }

    /// Writes the data to a temp file next to `path` without making it
    /// visible. Dropping the returned [`StagedFile`] discards it.
    pub fn stage<R: Read>(&self, path: &Path, reader: &mut R, expected_len: u64) -> SaveResult<StagedFile> {
        if expected_len == 0 {
            return Err(SaveError::write(
                path,
                io::Error::new(io::ErrorKind::InvalidInput, "refusing to commit an empty file"),
            ));
        }
        let (dir, name) = split_target(path)?;
        fs::create_dir_all(dir).map_err(|e| SaveError::write(path, e))?;

        let mut temp = tempfile::Builder::new()
            .prefix(&format!(".{}.", name))
            .suffix(TEMP_SUFFIX)
            .tempfile_in(dir)
            .map_err(|e| SaveError::write(path, e))?;

        // On any error below `temp` is dropped, which unlinks it.
        let written = io::copy(reader, temp.as_file_mut()).map_err(|e| SaveError::write(path, e))?;
        if written != expected_len {
            return Err(SaveError::write(
                path,
                io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short write: {} of {} bytes", written, expected_len),
                ),
            ));
        }
        match self.durability {
            Durability::Buffer => Ok(()),
            Durability::Fsync => temp.as_file().sync_all(),
            Durability::Fdatasync => temp.as_file().sync_data(),
        }
        .map_err(|e| SaveError::write(path, e))?;

        debug!(path = %path.display(), temp = %temp.path().display(), bytes = written, "staged file");
        Ok(StagedFile {
            temp,
            target: path.to_path_buf(),
            len: written,
            durability: self.durability,
        })
    }

    /// Materializes `path` as a hard link to `existing`. Link creation is the
    /// commit point; it fails if `path` already exists.
    pub fn link(&self, existing: &Path, path: &Path) -> SaveResult<()> {
        let (dir, _) = split_target(path)?;
        fs::create_dir_all(dir).map_err(|e| SaveError::write(path, e))?;
        fs::hard_link(existing, path).map_err(|e| SaveError::write(path, e))?;
        self.sync_dir(dir);
        Ok(())
    }

    fn sync_dir(&self, dir: &Path) {
        if self.durability != Durability::Buffer {
            sync_dir(dir);
        }
    }
}

/// A fully written temp file waiting for its rename.
#[derive(Debug)]
pub struct StagedFile {
    temp: NamedTempFile,
    target: PathBuf,
    len: u64,
    durability: Durability,
}

impl StagedFile {
    pub fn temp_path(&self) -> &Path {
        self.temp.path()
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Moves the temp file onto the target. Once this returns `Ok` the file
    /// is visible with its full length. An existing file at the target is
    /// never replaced; that case fails with `AlreadyExists`.
    pub fn persist(self) -> SaveResult<u64> {
        let StagedFile {
            temp,
            target,
            len,
            durability,
        } = self;
        // A failed persist hands the temp file back inside the error; it is
        // unlinked when the error is dropped.
        temp.persist_noclobber(&target)
            .map_err(|e| SaveError::write(&target, e.error))?;

        if durability != Durability::Buffer {
            if let Some(dir) = target.parent() {
                sync_dir(dir);
            }
        }
        debug!(path = %target.display(), bytes = len, "committed file");
        Ok(len)
    }
}

fn split_target(path: &Path) -> SaveResult<(&Path, &str)> {
    let invalid = || {
        SaveError::write(
            path,
            io::Error::new(io::ErrorKind::InvalidInput, "target has no parent directory or file name"),
        )
    };
    let dir = path.parent().filter(|d| !d.as_os_str().is_empty()).ok_or_else(invalid)?;
    let name = path.file_name().and_then(|n| n.to_str()).ok_or_else(invalid)?;
    Ok((dir, name))
}

// The rename is already done when this runs; failing to sync the directory
// only weakens durability, so it is logged rather than returned.
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Err(e) = fs::File::open(dir).and_then(|d| d.sync_all()) {
            warn!(dir = %dir.display(), error = %e, "failed to sync directory");
        }
    }
    #[cfg(not(unix))]
    let _ = dir;
}

/// Removes a file, treating "already gone" as success.
pub(crate) fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingReader {
        remaining: usize,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.remaining == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "No space left on device"));
            }
            let n = buf.len().min(self.remaining);
            buf[..n].fill(0xAB);
            self.remaining -= n;
            Ok(n)
        }
    }

    fn dir_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_commit_creates_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("a/b/out.png");
        let writer = AtomicWriter::new(Durability::Fsync);
        assert_eq!(writer.commit(&target, b"hello").unwrap(), 5);
        assert_eq!(fs::read(&target).unwrap(), b"hello");
        assert_eq!(dir_names(&tmp.path().join("a/b")), vec!["out.png"]);
    }

    #[test]
    fn test_failed_write_leaves_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("out_0007.png");
        let writer = AtomicWriter::default();

        let mut reader = FailingReader { remaining: 100 };
        let err = writer.commit_from(&target, &mut reader, 1000).unwrap_err();
        assert!(matches!(err, SaveError::WriteFailure { .. }));
        assert!(!target.exists());
        assert!(dir_names(tmp.path()).is_empty());
    }

    #[test]
    fn test_short_input_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("out.png");
        let writer = AtomicWriter::new(Durability::Buffer);
        let mut reader: &[u8] = b"abc";
        assert!(writer.commit_from(&target, &mut reader, 10).is_err());
        assert!(dir_names(tmp.path()).is_empty());
        assert!(writer.commit(&target, b"").is_err());
    }

    #[test]
    fn test_failure_keeps_previous_content() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("out.png");
        let writer = AtomicWriter::default();
        writer.commit(&target, b"old").unwrap();

        let mut reader = FailingReader { remaining: 2 };
        assert!(writer.commit_from(&target, &mut reader, 3).is_err());
        assert_eq!(fs::read(&target).unwrap(), b"old");
        assert_eq!(dir_names(tmp.path()), vec!["out.png"]);
    }

    #[test]
    fn test_staged_file_is_invisible_until_persist() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("out.png");
        let writer = AtomicWriter::default();

        let mut data: &[u8] = b"pixels";
        let staged = writer.stage(&target, &mut data, 6).unwrap();
        assert!(!target.exists());
        let temp_name = staged.temp_path().file_name().unwrap().to_str().unwrap().to_string();
        assert!(is_temp_name(&temp_name));

        drop(staged);
        assert!(dir_names(tmp.path()).is_empty());

        let mut data: &[u8] = b"pixels";
        let staged = writer.stage(&target, &mut data, 6).unwrap();
        assert_eq!(staged.persist().unwrap(), 6);
        assert_eq!(fs::read(&target).unwrap(), b"pixels");
    }

    #[test]
    fn test_commit_never_replaces_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("x.png");
        let writer = AtomicWriter::new(Durability::Buffer);
        writer.commit(&target, b"first").unwrap();

        let err = writer.commit(&target, b"second").unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(fs::read(&target).unwrap(), b"first");
        assert_eq!(dir_names(tmp.path()), vec!["x.png"]);
    }

    #[test]
    fn test_link_refuses_existing_target() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = AtomicWriter::default();
        let a = tmp.path().join("a.png");
        let b = tmp.path().join("sub/b.png");
        writer.commit(&a, b"same").unwrap();
        writer.link(&a, &b).unwrap();
        assert_eq!(fs::read(&b).unwrap(), b"same");
        assert!(writer.link(&a, &b).is_err());
    }

    #[test]
    fn test_durability_from_str() {
        assert_eq!("FSYNC".parse::<Durability>().unwrap(), Durability::Fsync);
        assert_eq!("buffer".parse::<Durability>().unwrap(), Durability::Buffer);
        assert!("sometimes".parse::<Durability>().is_err());
    }
}
