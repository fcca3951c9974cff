//! Volume state record and filesystem usage probe.

use std::io;
use std::path::Path;

use crate::bucket::{Bucket, Txn, STATE};
use crate::error::StoreResult;
use crate::model::State;

const STATE_KEY: &[u8] = b"state";
const VOLUME_ID_KEY: &[u8] = b"volume-id";

/// Repository for the single [`State`] record and the volume identity.
pub struct States<'t> {
    bucket: Bucket<'t>,
}

impl<'t> States<'t> {
    pub(crate) fn bind(txn: &'t Txn) -> Self {
        Self {
            bucket: Bucket::new(txn, STATE),
        }
    }

    /// Current state, `None` before the volume was initialised.
    pub fn get(&self) -> StoreResult<Option<State>> {
        self.bucket.get(STATE_KEY)
    }

    /// Replaces the state record.
    pub fn put(&self, state: &State) -> StoreResult<()> {
        self.bucket.put(STATE_KEY, state)
    }

    /// Persisted volume id.
    pub fn volume_id(&self) -> StoreResult<Option<String>> {
        self.bucket.get(VOLUME_ID_KEY)
    }

    /// Persists the volume id.
    pub fn set_volume_id(&self, id: &str) -> StoreResult<()> {
        self.bucket.put(VOLUME_ID_KEY, &id)
    }
}

/// Total and used bytes of the filesystem holding `path`.
#[cfg(unix)]
pub fn filesystem_usage(path: &Path) -> io::Result<(u64, u64)> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: `stat` is plain old data and `c_path` is NUL terminated.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    let frsize = stat.f_frsize as u64;
    let total = (stat.f_blocks as u64).saturating_mul(frsize);
    let free = (stat.f_bfree as u64).saturating_mul(frsize);
    Ok((total, total.saturating_sub(free)))
}

/// Total and used bytes of the filesystem holding `path`.
#[cfg(not(unix))]
pub fn filesystem_usage(_path: &Path) -> io::Result<(u64, u64)> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "filesystem usage is only available on unix",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::create_buckets;
    use redb::Database;
    use tempfile::TempDir;

    #[test]
    fn test_state_and_volume_id_persist() {
        let dir = TempDir::new().unwrap();
        let db = Database::create(dir.path().join("state.db")).unwrap();
        create_buckets(&db).unwrap();

        let txn = Txn::Write(db.begin_write().unwrap());
        let states = States::bind(&txn);
        assert!(states.get().unwrap().is_none());
        assert!(states.volume_id().unwrap().is_none());
        states.put(&State::new("/v", 100)).unwrap();
        states.set_volume_id("vol-1").unwrap();
        txn.commit().unwrap();

        let txn = Txn::Read(db.begin_read().unwrap());
        let states = States::bind(&txn);
        assert_eq!(states.get().unwrap().unwrap().volume_total, 100);
        assert_eq!(states.volume_id().unwrap().as_deref(), Some("vol-1"));
    }

    #[cfg(unix)]
    #[test]
    fn test_filesystem_usage_reports_sizes() {
        let dir = TempDir::new().unwrap();
        let (total, used) = filesystem_usage(dir.path()).unwrap();
        assert!(total > 0);
        assert!(used <= total);
        assert!(filesystem_usage(&dir.path().join("missing")).is_err());
    }
}
