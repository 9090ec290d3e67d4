//! Filesystem-stable identity for tailed files.
//!
//! A file keeps its inode across renames, so the inode (not the path) decides
//! whether a file has been seen before. Replacing a file with a new one under
//! the same name produces a new inode and therefore a fresh identity.

use std::fmt;
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};

/// Suffix appended to a fully drained source file and its side-car.
pub const FINISHED_SUFFIX: &str = ".end";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(u64);

impl FileId {
    pub fn new(ino: u64) -> Self {
        Self(ino)
    }

    #[cfg(unix)]
    pub fn from_metadata(metadata: &Metadata) -> io::Result<Self> {
        use std::os::unix::fs::MetadataExt;

        Ok(Self(metadata.ino()))
    }

    #[cfg(not(unix))]
    pub fn from_metadata(_metadata: &Metadata) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "inode-based file identity requires a unix platform",
        ))
    }

    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        Self::from_metadata(&metadata)
    }

    pub fn ino(&self) -> u64 {
        self.0
    }

    /// Location of this file's offset side-car inside `offset_dir`.
    pub fn side_car_path(&self, offset_dir: &Path) -> PathBuf {
        offset_dir.join(self.to_string())
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn is_finished(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().ends_with(FINISHED_SUFFIX))
        .unwrap_or(false)
}

pub fn finished_path(path: &Path) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(FINISHED_SUFFIX);
    PathBuf::from(raw)
}
