//! Unit of work: one redb transaction plus one filesystem tracker.
//!
//! The body runs against a [`Scope`] exposing only the enrolled resources.
//! On success the database commits first and the tracker's commit actions
//! run afterwards; on error or panic both are rolled back.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use redb::Database;
use tracing::{error, trace};

use crate::bucket::Txn;
use crate::error::{StoreError, StoreResult};
use crate::fs::Fs;
use crate::index::{Files, IdxKeys, IdxTtls, IdxVolumes};
use crate::keygen::KeyGenerator;
use crate::queue::{ReplicaPendents, ReplicaRetries, Replicas};
use crate::state::States;
use crate::tracker::FsTracker;

/// Transaction kind of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UowKind {
    /// Shared, non-mutating.
    Read,
    /// Exclusive, mutating.
    Write,
}

/// Resources a unit of work may enroll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// [`Files`] repository.
    Files,
    /// [`IdxKeys`] repository.
    IdxKeys,
    /// [`IdxTtls`] repository.
    IdxTtls,
    /// [`IdxVolumes`] repository.
    IdxVolumes,
    /// [`Replicas`] queue.
    Replicas,
    /// [`ReplicaPendents`] queue.
    ReplicaPendent,
    /// [`ReplicaRetries`] queue.
    ReplicaRetry,
    /// [`States`] record.
    State,
    /// Tracked filesystem.
    Fs,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resource::Files => "files",
            Resource::IdxKeys => "idxkeys",
            Resource::IdxTtls => "idxttls",
            Resource::IdxVolumes => "idxvolumes",
            Resource::Replicas => "replica",
            Resource::ReplicaPendent => "replica-pendent",
            Resource::ReplicaRetry => "replica-retry",
            Resource::State => "state",
            Resource::Fs => "fs",
        };
        f.write_str(name)
    }
}

/// Handles available to a unit of work body.
pub struct Scope {
    txn: Txn,
    tracker: FsTracker,
    keygen: Arc<KeyGenerator>,
    resources: Vec<Resource>,
}

impl Scope {
    fn require(&self, resource: Resource) -> StoreResult<()> {
        if self.resources.contains(&resource) {
            Ok(())
        } else {
            Err(StoreError::InvalidState(format!(
                "resource {} is not enrolled in this unit of work",
                resource
            )))
        }
    }

    /// Kind of the enclosing unit of work.
    pub fn kind(&self) -> UowKind {
        if self.txn.is_write() {
            UowKind::Write
        } else {
            UowKind::Read
        }
    }

    /// File records.
    pub fn files(&self) -> StoreResult<Files<'_>> {
        self.require(Resource::Files)?;
        Ok(Files::bind(&self.txn))
    }

    /// Key index.
    pub fn idx_keys(&self) -> StoreResult<IdxKeys<'_>> {
        self.require(Resource::IdxKeys)?;
        Ok(IdxKeys::bind(&self.txn))
    }

    /// Expiry index.
    pub fn idx_ttls(&self) -> StoreResult<IdxTtls<'_>> {
        self.require(Resource::IdxTtls)?;
        Ok(IdxTtls::bind(&self.txn))
    }

    /// Peer volume index.
    pub fn idx_volumes(&self) -> StoreResult<IdxVolumes<'_>> {
        self.require(Resource::IdxVolumes)?;
        Ok(IdxVolumes::bind(&self.txn))
    }

    /// Accepted replica queue.
    pub fn replicas(&self) -> StoreResult<Replicas<'_>> {
        self.require(Resource::Replicas)?;
        Ok(Replicas::bind(&self.txn, &self.keygen))
    }

    /// Pendent queue.
    pub fn replica_pendents(&self) -> StoreResult<ReplicaPendents<'_>> {
        self.require(Resource::ReplicaPendent)?;
        Ok(ReplicaPendents::bind(&self.txn, &self.keygen))
    }

    /// Retry queue.
    pub fn replica_retries(&self) -> StoreResult<ReplicaRetries<'_>> {
        self.require(Resource::ReplicaRetry)?;
        Ok(ReplicaRetries::bind(&self.txn, &self.keygen))
    }

    /// Volume state.
    pub fn states(&self) -> StoreResult<States<'_>> {
        self.require(Resource::State)?;
        Ok(States::bind(&self.txn))
    }

    /// Tracked filesystem.
    pub fn fs(&self) -> StoreResult<&FsTracker> {
        self.require(Resource::Fs)?;
        Ok(&self.tracker)
    }
}

/// Coordinator that opens units of work against one volume database.
#[derive(Clone)]
pub struct UnitOfWork {
    db: Arc<Database>,
    fs: Arc<dyn Fs>,
    keygen: Arc<KeyGenerator>,
}

impl UnitOfWork {
    /// Creates a coordinator over `db` and `fs`.
    pub fn new(db: Arc<Database>, fs: Arc<dyn Fs>, keygen: Arc<KeyGenerator>) -> Self {
        Self { db, fs, keygen }
    }

    /// Runs `body` inside a unit of work enrolling `resources`.
    ///
    /// A panic inside `body` rolls everything back and is then resumed.
    pub fn start<T, F>(&self, kind: UowKind, resources: &[Resource], body: F) -> StoreResult<T>
    where
        F: FnOnce(&Scope) -> StoreResult<T>,
    {
        let txn = match kind {
            UowKind::Read => Txn::Read(self.db.begin_read()?),
            UowKind::Write => Txn::Write(self.db.begin_write()?),
        };
        let scope = Scope {
            txn,
            tracker: FsTracker::new(self.fs.clone(), kind == UowKind::Write),
            keygen: self.keygen.clone(),
            resources: resources.to_vec(),
        };
        trace!(?kind, ?resources, "unit of work started");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(&scope)));
        let Scope { txn, tracker, .. } = scope;

        match outcome {
            Ok(Ok(value)) => {
                if let Err(e) = txn.commit() {
                    tracker.rollback();
                    return Err(e);
                }
                tracker.commit()?;
                Ok(value)
            }
            Ok(Err(e)) => {
                if let Err(abort_err) = txn.abort() {
                    error!(error = %abort_err, "unit of work abort failed");
                }
                tracker.rollback();
                Err(e)
            }
            Err(payload) => {
                if let Err(abort_err) = txn.abort() {
                    error!(error = %abort_err, "unit of work abort failed");
                }
                tracker.rollback();
                panic::resume_unwind(payload)
            }
        }
    }
}
