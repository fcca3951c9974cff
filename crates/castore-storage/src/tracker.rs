//! Transactional filesystem tracker.
//!
//! Records the inverse of every mutating filesystem call made inside a unit
//! of work. Commit actions run in insertion order after the database commits;
//! rollback actions run in reverse order when the unit of work fails.
//!
//! Removal is deferred: `remove(p)` renames `p` to `p.tmp` and only deletes
//! `p.tmp` on commit, so a rolled back removal restores the original file.

use std::cell::RefCell;
use std::ffi::OsString;
use std::fs::{File, FileTimes, Metadata, OpenOptions, Permissions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error};

use crate::error::{StoreError, StoreResult};
use crate::fs::Fs;

/// Suffix appended to files whose removal is pending commit.
pub const PENDING_REMOVAL_SUFFIX: &str = ".tmp";

/// A deferred filesystem action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsAction {
    /// Remove a file.
    Remove(PathBuf),
    /// Rename a file.
    Rename {
        /// Current path.
        from: PathBuf,
        /// Target path.
        to: PathBuf,
    },
}

impl FsAction {
    fn apply(&self, fs: &dyn Fs) -> io::Result<()> {
        match self {
            FsAction::Remove(path) => fs.remove(path),
            FsAction::Rename { from, to } => fs.rename(from, to),
        }
    }
}

/// Path used to park a file whose removal is pending commit.
pub fn pending_removal_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(PENDING_REMOVAL_SUFFIX);
    PathBuf::from(name)
}

/// Filesystem handle enrolled in one unit of work.
pub struct FsTracker {
    fs: Arc<dyn Fs>,
    writable: bool,
    commit_actions: RefCell<Vec<FsAction>>,
    rollback_actions: RefCell<Vec<FsAction>>,
}

impl FsTracker {
    /// Wraps `fs`; a non-writable tracker rejects every mutation.
    pub fn new(fs: Arc<dyn Fs>, writable: bool) -> Self {
        Self {
            fs,
            writable,
            commit_actions: RefCell::new(Vec::new()),
            rollback_actions: RefCell::new(Vec::new()),
        }
    }

    fn ensure_writable(&self, op: &str) -> StoreResult<()> {
        if self.writable {
            Ok(())
        } else {
            Err(StoreError::InvalidState(format!(
                "{} is not allowed in a read unit of work",
                op
            )))
        }
    }

    /// Creates a file; rollback removes it.
    pub fn create(&self, path: &Path) -> StoreResult<File> {
        self.ensure_writable("create")?;
        let file = self.fs.create(path)?;
        self.rollback_actions
            .borrow_mut()
            .push(FsAction::Remove(path.to_path_buf()));
        Ok(file)
    }

    /// Renames `from` to `to`; rollback renames it back.
    pub fn rename(&self, from: &Path, to: &Path) -> StoreResult<()> {
        self.ensure_writable("rename")?;
        self.fs.rename(from, to)?;
        self.rollback_actions.borrow_mut().push(FsAction::Rename {
            from: to.to_path_buf(),
            to: from.to_path_buf(),
        });
        Ok(())
    }

    /// Parks `path` for removal; the file is deleted on commit.
    pub fn remove(&self, path: &Path) -> StoreResult<()> {
        self.ensure_writable("remove")?;
        let parked = pending_removal_path(path);
        self.fs.rename(path, &parked)?;
        self.commit_actions
            .borrow_mut()
            .push(FsAction::Remove(parked.clone()));
        self.rollback_actions.borrow_mut().push(FsAction::Rename {
            from: parked,
            to: path.to_path_buf(),
        });
        Ok(())
    }

    /// Creates one directory. Not tracked.
    pub fn mkdir(&self, path: &Path) -> StoreResult<()> {
        self.ensure_writable("mkdir")?;
        Ok(self.fs.mkdir(path)?)
    }

    /// Creates a directory tree. Not tracked.
    pub fn mkdir_all(&self, path: &Path) -> StoreResult<()> {
        self.ensure_writable("mkdir_all")?;
        Ok(self.fs.mkdir_all(path)?)
    }

    /// Changes permissions. Not tracked.
    pub fn chmod(&self, path: &Path, permissions: Permissions) -> StoreResult<()> {
        self.ensure_writable("chmod")?;
        Ok(self.fs.chmod(path, permissions)?)
    }

    /// Changes file times. Not tracked.
    pub fn chtimes(&self, path: &Path, times: FileTimes) -> StoreResult<()> {
        self.ensure_writable("chtimes")?;
        Ok(self.fs.chtimes(path, times)?)
    }

    /// Opens a file read-only.
    pub fn open(&self, path: &Path) -> StoreResult<File> {
        Ok(self.fs.open(path)?)
    }

    /// Opens a file with explicit options; write-capable options need a
    /// writable tracker.
    pub fn open_file(&self, path: &Path, options: &OpenOptions, writes: bool) -> StoreResult<File> {
        if writes {
            self.ensure_writable("open_file")?;
        }
        Ok(self.fs.open_file(path, options)?)
    }

    /// Reads metadata.
    pub fn stat(&self, path: &Path) -> StoreResult<Metadata> {
        Ok(self.fs.stat(path)?)
    }

    /// Returns true if `path` exists.
    pub fn exists(&self, path: &Path) -> StoreResult<bool> {
        match self.fs.stat(path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Pending commit actions, oldest first.
    pub fn commit_actions(&self) -> Vec<FsAction> {
        self.commit_actions.borrow().clone()
    }

    /// Pending rollback actions, oldest first.
    pub fn rollback_actions(&self) -> Vec<FsAction> {
        self.rollback_actions.borrow().clone()
    }

    /// Runs commit actions in order, stopping at the first failure.
    pub fn commit(self) -> io::Result<()> {
        for action in self.commit_actions.into_inner() {
            debug!(?action, "fs commit");
            action.apply(self.fs.as_ref())?;
        }
        Ok(())
    }

    /// Runs rollback actions in reverse order; failures are logged and skipped.
    pub fn rollback(self) {
        for action in self.rollback_actions.into_inner().into_iter().rev() {
            debug!(?action, "fs rollback");
            if let Err(e) = action.apply(self.fs.as_ref()) {
                error!(?action, error = %e, "fs rollback action failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::OsFs;
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    fn tracker(writable: bool) -> FsTracker {
        FsTracker::new(Arc::new(OsFs), writable)
    }

    fn write(path: &Path, content: &[u8]) {
        std::fs::File::create(path).unwrap().write_all(content).unwrap();
    }

    #[test]
    fn test_pending_removal_path() {
        assert_eq!(
            pending_removal_path(Path::new("/a/b/cd")),
            PathBuf::from("/a/b/cd.tmp")
        );
    }

    #[test]
    fn test_create_rolls_back_to_absent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("new");
        let t = tracker(true);
        t.create(&path).unwrap();
        assert!(path.exists());
        t.rollback();
        assert!(!path.exists());
    }

    #[test]
    fn test_rename_rolls_back() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        write(&a, b"x");

        let t = tracker(true);
        t.rename(&a, &b).unwrap();
        assert!(b.exists() && !a.exists());
        t.rollback();
        assert!(a.exists() && !b.exists());
    }

    #[test]
    fn test_remove_is_deferred_until_commit() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        write(&a, b"x");

        let t = tracker(true);
        t.remove(&a).unwrap();
        assert!(!a.exists());
        assert!(pending_removal_path(&a).exists());
        assert_eq!(t.commit_actions(), vec![FsAction::Remove(pending_removal_path(&a))]);

        t.commit().unwrap();
        assert!(!a.exists());
        assert!(!pending_removal_path(&a).exists());
    }

    #[test]
    fn test_remove_rollback_restores_file() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        write(&a, b"keep me");

        let t = tracker(true);
        t.remove(&a).unwrap();
        t.rollback();
        assert_eq!(std::fs::read(&a).unwrap(), b"keep me");
        assert!(!pending_removal_path(&a).exists());
    }

    #[test]
    fn test_commit_and_rollback_lists_are_separate() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        write(&a, b"x");

        let t = tracker(true);
        t.rename(&a, &b).unwrap();
        assert!(t.commit_actions().is_empty());
        assert_eq!(t.rollback_actions().len(), 1);
    }

    #[test]
    fn test_rollback_runs_in_reverse_order() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let c = dir.path().join("c");
        write(&a, b"x");

        let t = tracker(true);
        t.rename(&a, &b).unwrap();
        t.rename(&b, &c).unwrap();
        t.rollback();
        assert!(a.exists());
        assert!(!b.exists());
        assert!(!c.exists());
    }

    #[test]
    fn test_read_tracker_rejects_mutations() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        write(&a, b"x");

        let t = tracker(false);
        assert!(matches!(t.remove(&a), Err(StoreError::InvalidState(_))));
        assert!(matches!(
            t.mkdir_all(&dir.path().join("d")),
            Err(StoreError::InvalidState(_))
        ));
        assert!(t.open(&a).is_ok());
        assert!(t.exists(&a).unwrap());
    }

    struct FlakyFs {
        fail_remove: AtomicBool,
    }

    impl Fs for FlakyFs {
        fn create(&self, path: &Path) -> io::Result<File> {
            OsFs.create(path)
        }
        fn open(&self, path: &Path) -> io::Result<File> {
            OsFs.open(path)
        }
        fn open_file(&self, path: &Path, options: &OpenOptions) -> io::Result<File> {
            OsFs.open_file(path, options)
        }
        fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
            OsFs.rename(from, to)
        }
        fn remove(&self, path: &Path) -> io::Result<()> {
            if self.fail_remove.load(Ordering::SeqCst) {
                return Err(io::Error::other("injected remove failure"));
            }
            OsFs.remove(path)
        }
        fn mkdir(&self, path: &Path) -> io::Result<()> {
            OsFs.mkdir(path)
        }
        fn mkdir_all(&self, path: &Path) -> io::Result<()> {
            OsFs.mkdir_all(path)
        }
        fn stat(&self, path: &Path) -> io::Result<Metadata> {
            OsFs.stat(path)
        }
        fn chmod(&self, path: &Path, permissions: Permissions) -> io::Result<()> {
            OsFs.chmod(path, permissions)
        }
        fn chtimes(&self, path: &Path, times: FileTimes) -> io::Result<()> {
            OsFs.chtimes(path, times)
        }
    }

    #[test]
    fn test_commit_failure_propagates_and_skips_rest() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        write(&a, b"x");
        write(&b, b"y");

        let fs = Arc::new(FlakyFs {
            fail_remove: AtomicBool::new(false),
        });
        let t = FsTracker::new(fs.clone(), true);
        t.remove(&a).unwrap();
        t.remove(&b).unwrap();
        fs.fail_remove.store(true, Ordering::SeqCst);

        assert!(t.commit().is_err());
        assert!(pending_removal_path(&a).exists());
        assert!(pending_removal_path(&b).exists());
    }

    #[test]
    fn test_rollback_continues_after_failure() {
        let dir = TempDir::new().unwrap();
        let created = dir.path().join("created");
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        write(&a, b"x");

        let fs = Arc::new(FlakyFs {
            fail_remove: AtomicBool::new(false),
        });
        let t = FsTracker::new(fs.clone(), true);
        t.create(&created).unwrap();
        t.rename(&a, &b).unwrap();
        fs.fail_remove.store(true, Ordering::SeqCst);

        t.rollback();
        // the rename is undone even though removing `created` failed
        assert!(a.exists());
        assert!(created.exists());
    }
}
