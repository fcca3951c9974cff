//! Pluggable filesystem interface used by volumes.

use std::fs::{self, File, FileTimes, Metadata, OpenOptions, Permissions};
use std::io;
use std::path::Path;

/// Filesystem operations a volume needs.
///
/// The transactional tracker wraps an implementation of this trait so that
/// mutations inside a unit of work can be undone.
pub trait Fs: Send + Sync {
    /// Creates (or truncates) a file for writing.
    fn create(&self, path: &Path) -> io::Result<File>;

    /// Opens a file read-only.
    fn open(&self, path: &Path) -> io::Result<File>;

    /// Opens a file with explicit options.
    fn open_file(&self, path: &Path, options: &OpenOptions) -> io::Result<File>;

    /// Renames `from` to `to`, replacing `to` if it exists.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Removes a file.
    fn remove(&self, path: &Path) -> io::Result<()>;

    /// Creates one directory.
    fn mkdir(&self, path: &Path) -> io::Result<()>;

    /// Creates a directory and all missing parents.
    fn mkdir_all(&self, path: &Path) -> io::Result<()>;

    /// Reads metadata of a path.
    fn stat(&self, path: &Path) -> io::Result<Metadata>;

    /// Changes permissions of a path.
    fn chmod(&self, path: &Path, permissions: Permissions) -> io::Result<()>;

    /// Changes access and modification times of a file.
    fn chtimes(&self, path: &Path, times: FileTimes) -> io::Result<()>;
}

/// [`Fs`] backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFs;

impl Fs for OsFs {
    fn create(&self, path: &Path) -> io::Result<File> {
        File::create(path)
    }

    fn open(&self, path: &Path) -> io::Result<File> {
        File::open(path)
    }

    fn open_file(&self, path: &Path, options: &OpenOptions) -> io::Result<File> {
        options.open(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn mkdir(&self, path: &Path) -> io::Result<()> {
        fs::create_dir(path)
    }

    fn mkdir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn stat(&self, path: &Path) -> io::Result<Metadata> {
        fs::metadata(path)
    }

    fn chmod(&self, path: &Path, permissions: Permissions) -> io::Result<()> {
        fs::set_permissions(path, permissions)
    }

    fn chtimes(&self, path: &Path, times: FileTimes) -> io::Result<()> {
        OpenOptions::new().write(true).open(path)?.set_times(times)
    }
}
