//! Local volume: one root directory and one embedded database.
//!
//! Every mutating operation runs in a single write unit of work covering the
//! indexes, the queues and the tracked filesystem, so a failure leaves both
//! the database and the content directory as they were.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::Database;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bucket::create_buckets;
use crate::error::{StoreError, StoreResult};
use crate::fs::{Fs, OsFs};
use crate::keygen::KeyGenerator;
use crate::layout::VolumeLayout;
use crate::model::{File, IdxKey, Replica, ReplicaPendent, ReplicaRetry, State};
use crate::state::filesystem_usage;
use crate::stream::{reader_stream, ByteStream, CreateOptions, HashingReader};
use crate::tracker::FsTracker;
use crate::uow::{Resource, Scope, UnitOfWork, UowKind};

/// Attempts after which a replica retry is dropped.
pub const MAX_RETRY_ATTEMPTS: u32 = 10;

const FILE_WRITE: &[Resource] = &[
    Resource::Files,
    Resource::IdxKeys,
    Resource::IdxTtls,
    Resource::IdxVolumes,
    Resource::ReplicaPendent,
    Resource::State,
    Resource::Fs,
];

/// Where a volume lives and how big it may grow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeConfig {
    /// Volume root directory.
    pub root: PathBuf,
    /// Size bound in bytes; `None` follows the underlying filesystem.
    pub capacity: Option<u64>,
}

impl VolumeConfig {
    /// Unbounded volume rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            capacity: None,
        }
    }

    /// Bounds the volume to `bytes`.
    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity = Some(bytes);
        self
    }
}

/// Process-wide collaborators shared by every volume of a node.
#[derive(Clone)]
pub struct VolumeContext {
    /// Queue key source.
    pub keygen: Arc<KeyGenerator>,
    /// Woken whenever a volume queues an accepted replica.
    pub replica_signal: Arc<Notify>,
    /// Filesystem backing content files.
    pub fs: Arc<dyn Fs>,
}

impl Default for VolumeContext {
    fn default() -> Self {
        Self {
            keygen: Arc::new(KeyGenerator::new()),
            replica_signal: Arc::new(Notify::new()),
            fs: Arc::new(OsFs),
        }
    }
}

/// Files and key mappings of a volume at one instant.
#[derive(Debug, Clone, Default)]
pub struct IndexSnapshot {
    /// Every file record.
    pub files: Vec<File>,
    /// Every key mapping.
    pub keys: Vec<IdxKey>,
}

struct VolumeInner {
    id: String,
    layout: VolumeLayout,
    uow: UnitOfWork,
    replica_signal: Arc<Notify>,
    pendent_signal: Notify,
}

/// A content-addressed volume on the local filesystem.
#[derive(Clone)]
pub struct LocalVolume {
    inner: Arc<VolumeInner>,
}

impl std::fmt::Debug for LocalVolume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalVolume")
            .field("id", &self.inner.id)
            .field("root", &self.inner.layout.root())
            .finish()
    }
}

fn clear_tmp_dir(dir: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::fs::create_dir_all(dir)
}

async fn write_tmp<R>(path: &Path, reader: R) -> io::Result<(String, u64)>
where
    R: AsyncRead + Unpin,
{
    let mut hashing = HashingReader::new(reader);
    let mut out = tokio::fs::File::create(path).await?;
    tokio::io::copy(&mut hashing, &mut out).await?;
    out.flush().await?;
    Ok(hashing.finish())
}

async fn discard_tmp(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to discard temp file"),
    }
}

/// Moves `tmp` to its final content path unless identical content is there.
fn publish(fs: &FsTracker, tmp: &Path, path: &Path) -> StoreResult<()> {
    if fs.exists(path)? {
        return fs.remove(tmp);
    }
    if let Some(parent) = path.parent() {
        fs.mkdir_all(parent)?;
    }
    fs.rename(tmp, path)
}

impl LocalVolume {
    /// Opens or initialises the volume at `config.root`.
    ///
    /// Leftover in-flight writes are discarded, every bucket is created and
    /// the volume id is minted on first open.
    pub fn open(config: VolumeConfig, ctx: VolumeContext) -> StoreResult<Self> {
        let layout = VolumeLayout::new(&config.root);
        std::fs::create_dir_all(layout.file_dir())?;
        clear_tmp_dir(layout.tmp_dir())?;

        let db = Database::create(layout.db_path())?;
        create_buckets(&db)?;
        let uow = UnitOfWork::new(Arc::new(db), ctx.fs.clone(), ctx.keygen.clone());

        let mountpoint = layout.root().display().to_string();
        let volume_total = match config.capacity {
            Some(bytes) => i64::try_from(bytes).unwrap_or(i64::MAX),
            None => State::UNBOUNDED,
        };
        let id = uow.start(UowKind::Write, &[Resource::State], |scope| {
            let states = scope.states()?;
            let id = match states.volume_id()? {
                Some(id) => id,
                None => {
                    let id = Uuid::new_v4().to_string();
                    states.set_volume_id(&id)?;
                    id
                }
            };
            let mut state = states
                .get()?
                .unwrap_or_else(|| State::new(mountpoint.clone(), volume_total));
            state.mountpoint = mountpoint.clone();
            state.volume_total = volume_total;
            states.put(&state)?;
            Ok(id)
        })?;

        let volume = Self {
            inner: Arc::new(VolumeInner {
                id,
                layout,
                uow,
                replica_signal: ctx.replica_signal,
                pendent_signal: Notify::new(),
            }),
        };
        if let Err(e) = volume.inner.refresh_state() {
            warn!(volume = %volume.id(), error = %e, "initial state refresh failed");
        }
        info!(volume = %volume.id(), root = %config.root.display(), "volume opened");
        Ok(volume)
    }

    /// Volume id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Volume root.
    pub fn root(&self) -> &Path {
        self.inner.layout.root()
    }

    /// Final content path of `signature`.
    pub fn file_path(&self, signature: &str) -> PathBuf {
        self.inner.layout.file_path(signature)
    }

    async fn blocking<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&VolumeInner) -> StoreResult<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| StoreError::InvalidState(format!("volume task failed: {}", e)))?
    }

    /// Stores the content of `reader` under `key`.
    ///
    /// Identical content is stored once; `(key, content)` pairs already
    /// present return the existing record unchanged.
    pub async fn create_file<R>(&self, key: &str, reader: R, opts: CreateOptions) -> StoreResult<File>
    where
        R: AsyncRead + Unpin + Send,
    {
        let tmp = self.inner.layout.tmp_path();
        let (signature, size) = match write_tmp(&tmp, reader).await {
            Ok(written) => written,
            Err(e) => {
                discard_tmp(&tmp).await;
                return Err(e.into());
            }
        };
        debug!(volume = %self.id(), key, signature = %signature, size, "content staged");

        let key_owned = key.to_string();
        let staged = tmp.clone();
        let replica = opts.replica;
        let result = self
            .blocking(move |inner| inner.commit_create(&key_owned, &staged, &signature, size, &opts))
            .await;
        if result.is_err() {
            discard_tmp(&tmp).await;
        }
        let file = result?;
        if replica > 0 {
            self.inner.pendent_signal.notify_one();
        }
        Ok(file)
    }

    /// Opens the content stored under `key`.
    pub async fn get_file(&self, key: &str) -> StoreResult<ByteStream> {
        let key = key.to_string();
        let file = self
            .blocking(move |inner| {
                inner
                    .uow
                    .start(UowKind::Read, &[Resource::IdxKeys, Resource::Fs], |scope| {
                        let idx = scope.idx_keys()?.find_by_key(&key)?;
                        scope.fs()?.open(&inner.layout.file_path(&idx.signature))
                    })
            })
            .await?;
        Ok(reader_stream(tokio::fs::File::from_std(file)))
    }

    /// Signature stored under `key`, if any.
    pub async fn has_file(&self, key: &str) -> StoreResult<Option<String>> {
        let key = key.to_string();
        self.blocking(move |inner| {
            inner.uow.start(UowKind::Read, &[Resource::IdxKeys], |scope| {
                Ok(scope.idx_keys()?.find(&key)?.map(|idx| idx.signature))
            })
        })
        .await
    }

    /// File record stored under `key`.
    pub async fn find_file(&self, key: &str) -> StoreResult<File> {
        let key = key.to_string();
        self.blocking(move |inner| {
            inner
                .uow
                .start(UowKind::Read, &[Resource::IdxKeys, Resource::Files], |scope| {
                    let idx = scope.idx_keys()?.find_by_key(&key)?;
                    scope.files()?.find_by_signature(&idx.signature)
                })
        })
        .await
    }

    /// Peer volumes known to hold the content of `key`.
    pub async fn volume_ids_of(&self, key: &str) -> StoreResult<Vec<String>> {
        Ok(self.find_file(key).await?.volume_ids)
    }

    /// Drops `key`; the content goes with its last key.
    pub async fn delete_file(&self, key: &str) -> StoreResult<()> {
        let key = key.to_string();
        self.blocking(move |inner| {
            inner.uow.start(UowKind::Write, FILE_WRITE, |scope| {
                let idx = scope.idx_keys()?.find_by_key(&key)?;
                inner.detach_key(scope, &key, &idx.signature)
            })
        })
        .await?;
        debug!(volume = %self.id(), "key deleted");
        Ok(())
    }

    /// Oldest accepted replica waiting for placement.
    pub async fn next_replica(&self) -> StoreResult<Option<Replica>> {
        self.blocking(|inner| {
            inner
                .uow
                .start(UowKind::Read, &[Resource::Replicas], |scope| {
                    scope.replicas()?.first()
                })
        })
        .await
    }

    /// Every queued accepted replica, oldest first.
    pub async fn queued_replicas(&self) -> StoreResult<Vec<Replica>> {
        self.blocking(|inner| {
            inner
                .uow
                .start(UowKind::Read, &[Resource::Replicas], |scope| scope.replicas()?.all())
        })
        .await
    }

    /// Records that `added_volume_id` now holds `replica` and counts it down.
    ///
    /// The record leaves the queue when its count reaches zero. The owner's
    /// file learns the new holder too.
    pub async fn update_replica(&self, replica: &Replica, added_volume_id: &str) -> StoreResult<Replica> {
        let replica = replica.clone();
        let added = added_volume_id.to_string();
        self.blocking(move |inner| {
            inner.uow.start(
                UowKind::Write,
                &[Resource::Replicas, Resource::Files, Resource::IdxVolumes],
                |scope| {
                    let mut updated = replica;
                    updated.add_volume_id(&added);
                    updated.count = updated.count.saturating_sub(1);
                    let replicas = scope.replicas()?;
                    if updated.count == 0 {
                        replicas.delete(updated.volume_replica_id)?;
                    } else {
                        replicas.create_or_replace(&updated)?;
                    }

                    if added != inner.id {
                        let files = scope.files()?;
                        if let Some(mut file) = files.find(&updated.signature)? {
                            if file.add_volume_id(&added) {
                                files.create_or_replace(&file)?;
                                scope.idx_volumes()?.add_signature(&added, &file.signature)?;
                            }
                        }
                    }
                    Ok(updated)
                },
            )
        })
        .await
    }

    /// Moves `replica` behind every other queued record.
    pub async fn requeue_replica(&self, replica: &Replica) -> StoreResult<Replica> {
        let replica = replica.clone();
        self.blocking(move |inner| {
            inner.uow.start(UowKind::Write, &[Resource::Replicas], |scope| {
                scope.replicas()?.requeue(&replica)
            })
        })
        .await
    }

    /// Drops `replica` from the queue.
    pub async fn discard_replica(&self, replica: &Replica) -> StoreResult<()> {
        let seq = replica.volume_replica_id;
        self.blocking(move |inner| {
            inner.uow.start(UowKind::Write, &[Resource::Replicas], |scope| {
                scope.replicas()?.delete(seq)
            })
        })
        .await
    }

    /// Replaces the holder list and replica target of the file under `key`.
    ///
    /// This volume's own id is never stored in the holder list.
    pub async fn update_file_replica(
        &self,
        key: &str,
        volume_ids: &[String],
        original_count: u32,
    ) -> StoreResult<File> {
        let key = key.to_string();
        let volume_ids = volume_ids.to_vec();
        self.blocking(move |inner| {
            inner.uow.start(
                UowKind::Write,
                &[Resource::IdxKeys, Resource::Files, Resource::IdxVolumes],
                |scope| {
                    let idx = scope.idx_keys()?.find_by_key(&key)?;
                    let files = scope.files()?;
                    let idx_volumes = scope.idx_volumes()?;
                    let mut file = files.find_by_signature(&idx.signature)?;

                    let mut wanted: Vec<String> = Vec::with_capacity(volume_ids.len());
                    for id in volume_ids {
                        if id != inner.id && !wanted.contains(&id) {
                            wanted.push(id);
                        }
                    }
                    for old in &file.volume_ids {
                        if !wanted.contains(old) {
                            idx_volumes.remove_signature(old, &file.signature)?;
                        }
                    }
                    for id in &wanted {
                        idx_volumes.add_signature(id, &file.signature)?;
                    }
                    file.volume_ids = wanted;
                    file.replica = original_count;
                    files.create_or_replace(&file)?;
                    Ok(file)
                },
            )
        })
        .await
    }

    /// Forgets `departed_volume_id` and queues rebuilds for lost copies.
    ///
    /// Among the surviving holders of a file only the one with the smallest
    /// volume id queues the rebuild. Returns the number of records queued.
    pub async fn synchronize_replicas(&self, departed_volume_id: &str) -> StoreResult<usize> {
        let departed = departed_volume_id.to_string();
        let queued = self
            .blocking(move |inner| inner.synchronize_replicas(&departed))
            .await?;
        if queued > 0 {
            self.inner.replica_signal.notify_one();
        }
        Ok(queued)
    }

    /// Forgets that `holder` stores `key` and queues a rebuild when the file
    /// falls below its replica target.
    ///
    /// Returns the queued record, or `None` when `holder` was not listed or
    /// the target is still met.
    pub async fn release_holder(&self, key: &str, holder: &str) -> StoreResult<Option<Replica>> {
        let key = key.to_string();
        let holder = holder.to_string();
        let rebuild = self
            .blocking(move |inner| inner.release_holder(&key, &holder))
            .await?;
        if rebuild.is_some() {
            self.inner.replica_signal.notify_one();
        }
        Ok(rebuild)
    }

    /// Turns the oldest pendent into an accepted replica.
    ///
    /// Returns the popped pendent, or `None` when the queue is empty.
    pub async fn pop_pendent(&self) -> StoreResult<Option<ReplicaPendent>> {
        let popped = self
            .blocking(|inner| {
                inner.uow.start(
                    UowKind::Write,
                    &[Resource::ReplicaPendent, Resource::Replicas],
                    |scope| {
                        let pendents = scope.replica_pendents()?;
                        let Some(pendent) = pendents.first()? else {
                            return Ok(None);
                        };
                        pendents.delete(pendent.seq)?;
                        if pendent.replica > 1 {
                            scope.replicas()?.create(&Replica::from_pendent(&pendent))?;
                        }
                        Ok(Some(pendent))
                    },
                )
            })
            .await?;
        if let Some(pendent) = &popped {
            debug!(volume = %self.id(), key = %pendent.key, replica = pendent.replica, "pendent accepted");
            if pendent.replica > 1 {
                self.inner.replica_signal.notify_one();
            }
        }
        Ok(popped)
    }

    /// Waits until a write queues a pendent.
    pub async fn pendent_queued(&self) {
        self.inner.pendent_signal.notified().await
    }

    /// Removes every file whose expiry bucket falls in the sweep window.
    ///
    /// Each signature is expired in its own unit of work; failures are logged
    /// and the signature stays queued for the next sweep. Returns the number
    /// of files removed.
    pub async fn sweep_expired(&self, as_of: DateTime<Utc>) -> StoreResult<usize> {
        self.blocking(move |inner| inner.sweep_expired(as_of)).await
    }

    /// Queues a fetch of `pendent` for this volume.
    pub async fn enqueue_retry(&self, pendent: &ReplicaPendent) -> StoreResult<ReplicaRetry> {
        let retry = ReplicaRetry {
            pendent: pendent.clone(),
            volume_id: self.id().to_string(),
            attempts: 0,
            seq: 0,
        };
        self.blocking(move |inner| {
            inner.uow.start(UowKind::Write, &[Resource::ReplicaRetry], |scope| {
                scope.replica_retries()?.create(&retry)
            })
        })
        .await
    }

    /// Oldest queued retry.
    pub async fn next_retry(&self) -> StoreResult<Option<ReplicaRetry>> {
        self.blocking(|inner| {
            inner
                .uow
                .start(UowKind::Read, &[Resource::ReplicaRetry], |scope| {
                    scope.replica_retries()?.first()
                })
        })
        .await
    }

    /// Drops a satisfied retry.
    pub async fn complete_retry(&self, retry: &ReplicaRetry) -> StoreResult<()> {
        let seq = retry.seq;
        self.blocking(move |inner| {
            inner.uow.start(UowKind::Write, &[Resource::ReplicaRetry], |scope| {
                scope.replica_retries()?.delete(seq)
            })
        })
        .await
    }

    /// Records a failed attempt and requeues `retry` at the tail.
    ///
    /// Returns false when the retry ran out of attempts and was dropped.
    pub async fn fail_retry(&self, retry: &ReplicaRetry) -> StoreResult<bool> {
        let mut retry = retry.clone();
        retry.attempts += 1;
        self.blocking(move |inner| {
            inner.uow.start(UowKind::Write, &[Resource::ReplicaRetry], |scope| {
                let retries = scope.replica_retries()?;
                if retry.attempts >= MAX_RETRY_ATTEMPTS {
                    retries.delete(retry.seq)?;
                    Ok(false)
                } else {
                    retries.requeue(&retry)?;
                    Ok(true)
                }
            })
        })
        .await
    }

    /// Current capacity snapshot.
    pub async fn get_state(&self) -> StoreResult<State> {
        self.blocking(|inner| {
            inner.uow.start(UowKind::Read, &[Resource::State], |scope| {
                scope
                    .states()?
                    .get()?
                    .ok_or_else(|| StoreError::not_found("volume state"))
            })
        })
        .await
    }

    /// Re-reads filesystem usage into the state record.
    pub async fn refresh_state(&self) -> StoreResult<State> {
        self.blocking(|inner| inner.refresh_state()).await
    }

    /// Every file record and key mapping.
    pub async fn index_snapshot(&self) -> StoreResult<IndexSnapshot> {
        self.blocking(|inner| {
            inner
                .uow
                .start(UowKind::Read, &[Resource::Files, Resource::IdxKeys], |scope| {
                    Ok(IndexSnapshot {
                        files: scope.files()?.all()?,
                        keys: scope.idx_keys()?.all()?,
                    })
                })
        })
        .await
    }
}

impl VolumeInner {
    fn commit_create(
        &self,
        key: &str,
        tmp: &Path,
        signature: &str,
        size: u64,
        opts: &CreateOptions,
    ) -> StoreResult<File> {
        let path = self.layout.file_path(signature);
        self.uow.start(UowKind::Write, FILE_WRITE, |scope| {
            let files = scope.files()?;
            let idx_keys = scope.idx_keys()?;
            let fs = scope.fs()?;

            let existing = files.find(signature)?;
            if let Some(file) = &existing {
                if file.has_key(key) {
                    fs.remove(tmp)?;
                    return Ok(file.clone());
                }
            }
            publish(fs, tmp, &path)?;

            let created = existing.is_none();
            let mut file = match existing {
                Some(file) => file,
                None => File::new(
                    signature,
                    key,
                    size,
                    opts.replica,
                    opts.ttl,
                    opts.created_at.unwrap_or_else(Utc::now),
                ),
            };
            file.add_key(key);
            files.create_or_replace(&file)?;

            if let Some(old) = idx_keys.find(key)? {
                if old.signature != signature {
                    debug!(key, from = %old.signature, to = %signature, "key rebound");
                    self.detach_key(scope, key, &old.signature)?;
                }
            }
            idx_keys.create_or_replace(&IdxKey::new(key, signature))?;

            if created {
                if let Some(expires_at) = file.expires_at() {
                    scope.idx_ttls()?.add_signature(expires_at, signature)?;
                }
                let states = scope.states()?;
                let mut state = states
                    .get()?
                    .unwrap_or_else(|| State::new(self.layout.root().display().to_string(), State::UNBOUNDED));
                state.reserve(size)?;
                states.put(&state)?;
            }

            if opts.replica > 0 {
                scope
                    .replica_pendents()?
                    .create(&ReplicaPendent::for_file(&file, key, &self.id, opts.replica))?;
            }
            Ok(file)
        })
    }

    /// Removes `key` from the file at `signature`, destroying it when unreferenced.
    fn detach_key(&self, scope: &Scope, key: &str, signature: &str) -> StoreResult<()> {
        let files = scope.files()?;
        if let Some(mut file) = files.find(signature)? {
            file.remove_key(key);
            if file.keys.is_empty() {
                self.destroy_file(scope, &file)?;
            } else {
                files.create_or_replace(&file)?;
            }
        }
        scope.idx_keys()?.delete(key)
    }

    fn destroy_file(&self, scope: &Scope, file: &File) -> StoreResult<()> {
        scope.files()?.delete(&file.signature)?;

        let fs = scope.fs()?;
        let path = self.layout.file_path(&file.signature);
        if fs.exists(&path)? {
            fs.remove(&path)?;
        } else {
            warn!(signature = %file.signature, "content file already missing");
        }

        if let Some(expires_at) = file.expires_at() {
            scope.idx_ttls()?.remove_signature(expires_at, &file.signature)?;
        }
        let idx_volumes = scope.idx_volumes()?;
        for volume_id in &file.volume_ids {
            idx_volumes.remove_signature(volume_id, &file.signature)?;
        }

        let states = scope.states()?;
        if let Some(mut state) = states.get()? {
            state.release(file.size);
            states.put(&state)?;
        }
        debug!(signature = %file.signature, "file destroyed");
        Ok(())
    }

    fn synchronize_replicas(&self, departed: &str) -> StoreResult<usize> {
        self.uow.start(
            UowKind::Write,
            &[Resource::Files, Resource::IdxVolumes, Resource::Replicas],
            |scope| {
                let idx_volumes = scope.idx_volumes()?;
                let Some(entry) = idx_volumes.find_by_volume_id(departed)? else {
                    return Ok(0);
                };
                let files = scope.files()?;
                let replicas = scope.replicas()?;
                let mut queued = 0;

                for signature in &entry.signatures {
                    let Some(mut file) = files.find(signature)? else {
                        continue;
                    };
                    if !file.remove_volume_id(departed) {
                        continue;
                    }
                    files.create_or_replace(&file)?;

                    let holders = file.volume_ids.len() as u32 + 1;
                    if file.replica <= holders {
                        continue;
                    }
                    let leader = file
                        .volume_ids
                        .iter()
                        .map(String::as_str)
                        .chain(std::iter::once(self.id.as_str()))
                        .min()
                        .unwrap_or(self.id.as_str());
                    if leader != self.id {
                        continue;
                    }
                    let Some(key) = file.keys.first() else {
                        continue;
                    };

                    let rebuild = self.rebuild_replica(&file, key);
                    replicas.create(&rebuild)?;
                    queued += 1;
                    info!(
                        volume = %self.id,
                        departed,
                        key = %rebuild.key,
                        missing = rebuild.count,
                        "rebuild queued for departed volume"
                    );
                }
                idx_volumes.delete(departed)?;
                Ok(queued)
            },
        )
    }

    /// Replica record restoring the copies `file` is missing, owned by this volume.
    fn rebuild_replica(&self, file: &File, key: &str) -> Replica {
        let mut volume_ids = vec![self.id.clone()];
        volume_ids.extend(file.volume_ids.iter().cloned());
        Replica {
            id: Uuid::new_v4(),
            key: key.to_string(),
            signature: file.signature.clone(),
            volume_id: self.id.clone(),
            ttl: file.ttl,
            created_at: file.created_at,
            original_count: file.replica,
            count: file.replica.saturating_sub(volume_ids.len() as u32),
            volume_ids,
            volume_replica_id: 0,
        }
    }

    fn release_holder(&self, key: &str, holder: &str) -> StoreResult<Option<Replica>> {
        self.uow.start(
            UowKind::Write,
            &[Resource::IdxKeys, Resource::Files, Resource::IdxVolumes, Resource::Replicas],
            |scope| {
                let idx = scope.idx_keys()?.find_by_key(key)?;
                let files = scope.files()?;
                let mut file = files.find_by_signature(&idx.signature)?;
                if !file.remove_volume_id(holder) {
                    return Ok(None);
                }
                files.create_or_replace(&file)?;
                scope.idx_volumes()?.remove_signature(holder, &file.signature)?;

                let rebuild = self.rebuild_replica(&file, key);
                if rebuild.count == 0 {
                    return Ok(None);
                }
                scope.replicas()?.create(&rebuild)?;
                info!(volume = %self.id, holder, key, missing = rebuild.count, "rebuild queued for released holder");
                Ok(Some(rebuild))
            },
        )
    }

    fn sweep_expired(&self, as_of: DateTime<Utc>) -> StoreResult<usize> {
        let buckets = self
            .uow
            .start(UowKind::Read, &[Resource::IdxTtls], |scope| {
                scope.idx_ttls()?.filter(as_of)
            })?;

        let mut removed = 0;
        for bucket in buckets {
            for signature in &bucket.signatures {
                let outcome = self.uow.start(UowKind::Write, FILE_WRITE, |scope| {
                    let idx_ttls = scope.idx_ttls()?;
                    let Some(file) = scope.files()?.find(signature)? else {
                        idx_ttls.remove_signature(bucket.expires_at, signature)?;
                        return Ok(false);
                    };
                    for key in &file.keys {
                        self.detach_key(scope, key, signature)?;
                    }
                    idx_ttls.remove_signature(bucket.expires_at, signature)?;
                    Ok(true)
                });
                match outcome {
                    Ok(true) => removed += 1,
                    Ok(false) => {}
                    Err(e) => warn!(
                        volume = %self.id,
                        signature = %signature,
                        error = %e,
                        "failed to expire file"
                    ),
                }
            }
        }
        if removed > 0 {
            info!(volume = %self.id, removed, "expired files removed");
        }
        Ok(removed)
    }

    fn refresh_state(&self) -> StoreResult<State> {
        let usage = filesystem_usage(self.layout.root());
        self.uow.start(UowKind::Write, &[Resource::State], |scope| {
            let states = scope.states()?;
            let mut state = states
                .get()?
                .unwrap_or_else(|| State::new(self.layout.root().display().to_string(), State::UNBOUNDED));
            match &usage {
                Ok((total, used)) => {
                    state.system_total = *total;
                    state.system_used = *used;
                }
                Err(e) => warn!(volume = %self.id, error = %e, "filesystem usage unavailable"),
            }
            state.updated_at = Utc::now();
            states.put(&state)?;
            Ok(state)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{collect_bytes, signature_of};
    use std::io::Cursor;
    use std::time::Duration;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> LocalVolume {
        LocalVolume::open(VolumeConfig::new(dir.path()), VolumeContext::default()).unwrap()
    }

    async fn put(volume: &LocalVolume, key: &str, body: &[u8], replica: u32) -> File {
        volume
            .create_file(key, Cursor::new(body.to_vec()), CreateOptions::with_replica(replica))
            .await
            .unwrap()
    }

    async fn read(volume: &LocalVolume, key: &str) -> Vec<u8> {
        collect_bytes(volume.get_file(key).await.unwrap()).await.unwrap()
    }

    fn tmp_is_empty(volume: &LocalVolume) -> bool {
        std::fs::read_dir(volume.root().join("tmps")).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn test_create_get_delete() {
        let dir = TempDir::new().unwrap();
        let volume = open(&dir);

        let file = put(&volume, "a", b"hello", 0).await;
        assert_eq!(file.signature, signature_of(b"hello"));
        assert_eq!(file.size, 5);
        assert_eq!(read(&volume, "a").await, b"hello");
        assert_eq!(volume.has_file("a").await.unwrap(), Some(file.signature.clone()));
        assert_eq!(volume.has_file("b").await.unwrap(), None);
        assert!(volume.file_path(&file.signature).exists());
        assert!(tmp_is_empty(&volume));

        volume.delete_file("a").await.unwrap();
        assert!(volume.get_file("a").await.err().unwrap().is_not_found());
        assert!(!volume.file_path(&file.signature).exists());
        assert!(volume.delete_file("a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_same_key_same_content_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let volume = open(&dir);

        let first = put(&volume, "a", b"same", 0).await;
        let second = put(&volume, "a", b"same", 0).await;
        assert_eq!(first, second);
        assert_eq!(second.keys, vec!["a"]);
        assert!(tmp_is_empty(&volume));
    }

    #[tokio::test]
    async fn test_dedup_shares_one_file() {
        let dir = TempDir::new().unwrap();
        let volume = open(&dir);

        put(&volume, "a", b"same", 0).await;
        let file = put(&volume, "b", b"same", 0).await;
        assert_eq!(file.keys, vec!["a", "b"]);
        assert!(volume.file_path(&file.signature).starts_with(dir.path().join("file/ff/33/90")));

        let snapshot = volume.index_snapshot().await.unwrap();
        assert_eq!(snapshot.files.len(), 1);
        assert_eq!(snapshot.keys.len(), 2);

        volume.delete_file("a").await.unwrap();
        assert!(volume.file_path(&file.signature).exists());
        assert_eq!(volume.find_file("b").await.unwrap().keys, vec!["b"]);
    }

    #[tokio::test]
    async fn test_rebind_drops_old_content() {
        let dir = TempDir::new().unwrap();
        let volume = open(&dir);

        let v1 = put(&volume, "a", b"v1", 0).await;
        let v2 = put(&volume, "a", b"v2", 0).await;
        assert!(!volume.file_path(&v1.signature).exists());
        assert!(volume.file_path(&v2.signature).exists());

        let snapshot = volume.index_snapshot().await.unwrap();
        assert_eq!(snapshot.files.len(), 1);
        assert_eq!(snapshot.files[0].signature, v2.signature);
        assert_eq!(snapshot.files[0].keys, vec!["a"]);
        assert_eq!(read(&volume, "a").await, b"v2");
    }

    #[tokio::test]
    async fn test_existing_content_keeps_first_metadata() {
        let dir = TempDir::new().unwrap();
        let volume = open(&dir);

        let opts = CreateOptions::default().ttl(Duration::from_secs(3600));
        let first = volume
            .create_file("a", Cursor::new(b"x".to_vec()), opts)
            .await
            .unwrap();
        let second = put(&volume, "b", b"x", 0).await;
        assert_eq!(second.ttl, first.ttl);
        assert_eq!(second.created_at, first.created_at);
    }

    #[tokio::test]
    async fn test_capacity_exhausted_rolls_back() {
        let dir = TempDir::new().unwrap();
        let volume = LocalVolume::open(
            VolumeConfig::new(dir.path()).with_capacity(8),
            VolumeContext::default(),
        )
        .unwrap();

        put(&volume, "a", b"12345", 0).await;
        let err = volume
            .create_file("b", Cursor::new(b"6789ab".to_vec()), CreateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CapacityExhausted { .. }));
        assert_eq!(volume.has_file("b").await.unwrap(), None);
        assert!(!volume.file_path(&signature_of(b"6789ab")).exists());
        assert!(tmp_is_empty(&volume));
        assert_eq!(volume.get_state().await.unwrap().volume_used, 5);

        volume.delete_file("a").await.unwrap();
        assert_eq!(volume.get_state().await.unwrap().volume_used, 0);
    }

    #[tokio::test]
    async fn test_volume_id_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let id = open(&dir).id().to_string();
        std::fs::write(dir.path().join("tmps/leftover"), b"junk").unwrap();
        let reopened = open(&dir);
        assert_eq!(reopened.id(), id);
        assert!(tmp_is_empty(&reopened));
    }

    #[tokio::test]
    async fn test_pendent_becomes_replica() {
        let dir = TempDir::new().unwrap();
        let volume = open(&dir);

        put(&volume, "a", b"payload", 3).await;
        put(&volume, "b", b"other", 1).await;

        let popped = volume.pop_pendent().await.unwrap().unwrap();
        assert_eq!(popped.key, "a");
        let replica = volume.next_replica().await.unwrap().unwrap();
        assert_eq!(replica.key, "a");
        assert_eq!(replica.original_count, 3);
        assert_eq!(replica.count, 2);
        assert_eq!(replica.volume_ids, vec![volume.id().to_string()]);

        // replica=1 means the owner alone satisfies the target
        assert_eq!(volume.pop_pendent().await.unwrap().unwrap().key, "b");
        assert_eq!(volume.queued_replicas().await.unwrap().len(), 1);
        assert!(volume.pop_pendent().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_replica_counts_down() {
        let dir = TempDir::new().unwrap();
        let volume = open(&dir);

        put(&volume, "a", b"payload", 3).await;
        volume.pop_pendent().await.unwrap();
        let replica = volume.next_replica().await.unwrap().unwrap();

        let replica = volume.update_replica(&replica, "peer-1").await.unwrap();
        assert_eq!(replica.count, 1);
        assert_eq!(volume.next_replica().await.unwrap().unwrap().count, 1);
        assert_eq!(volume.volume_ids_of("a").await.unwrap(), vec!["peer-1"]);

        volume.update_replica(&replica, "peer-2").await.unwrap();
        assert!(volume.next_replica().await.unwrap().is_none());
        assert_eq!(volume.volume_ids_of("a").await.unwrap(), vec!["peer-1", "peer-2"]);
    }

    #[tokio::test]
    async fn test_requeue_replica_moves_to_tail() {
        let dir = TempDir::new().unwrap();
        let volume = open(&dir);

        put(&volume, "a", b"one", 2).await;
        put(&volume, "b", b"two", 2).await;
        volume.pop_pendent().await.unwrap();
        volume.pop_pendent().await.unwrap();

        let head = volume.next_replica().await.unwrap().unwrap();
        assert_eq!(head.key, "a");
        volume.requeue_replica(&head).await.unwrap();
        assert_eq!(volume.next_replica().await.unwrap().unwrap().key, "b");

        let head = volume.next_replica().await.unwrap().unwrap();
        volume.discard_replica(&head).await.unwrap();
        assert_eq!(volume.next_replica().await.unwrap().unwrap().key, "a");
    }

    #[tokio::test]
    async fn test_update_file_replica_excludes_self() {
        let dir = TempDir::new().unwrap();
        let volume = open(&dir);
        put(&volume, "a", b"payload", 0).await;

        let ids = vec![volume.id().to_string(), "p1".to_string(), "p1".to_string()];
        let file = volume.update_file_replica("a", &ids, 3).await.unwrap();
        assert_eq!(file.volume_ids, vec!["p1"]);
        assert_eq!(file.replica, 3);

        assert!(volume
            .update_file_replica("missing", &ids, 3)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_release_holder_queues_rebuild() {
        let dir = TempDir::new().unwrap();
        let volume = open(&dir);
        put(&volume, "a", b"payload", 0).await;
        let ids = vec!["p1".to_string(), "p2".to_string()];
        volume.update_file_replica("a", &ids, 3).await.unwrap();

        assert!(volume.release_holder("a", "unknown").await.unwrap().is_none());
        let rebuild = volume.release_holder("a", "p2").await.unwrap().unwrap();
        assert_eq!(rebuild.count, 1);
        assert_eq!(rebuild.original_count, 3);
        assert_eq!(rebuild.volume_ids, vec![volume.id().to_string(), "p1".to_string()]);
        assert_eq!(volume.volume_ids_of("a").await.unwrap(), vec!["p1"]);
        assert_eq!(volume.next_replica().await.unwrap().unwrap().id, rebuild.id);

        assert!(volume.release_holder("a", "p2").await.unwrap().is_none());
        assert!(volume.release_holder("missing", "p1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_synchronize_replicas_rebuilds_lost_copy() {
        let dir = TempDir::new().unwrap();
        let volume = open(&dir);
        put(&volume, "a", b"payload", 0).await;

        // smallest id among survivors leads; "~" sorts after any uuid
        let ids = vec!["~peer-1".to_string(), "~peer-2".to_string()];
        volume.update_file_replica("a", &ids, 3).await.unwrap();

        assert_eq!(volume.synchronize_replicas("unrelated").await.unwrap(), 0);
        assert_eq!(volume.synchronize_replicas("~peer-2").await.unwrap(), 1);
        let rebuild = volume.next_replica().await.unwrap().unwrap();
        assert_eq!(rebuild.count, 1);
        assert_eq!(rebuild.original_count, 3);
        assert_eq!(rebuild.volume_ids, vec![volume.id().to_string(), "~peer-1".to_string()]);
        assert_eq!(volume.volume_ids_of("a").await.unwrap(), vec!["~peer-1"]);

        // a second drain of the same id is a no-op
        assert_eq!(volume.synchronize_replicas("~peer-2").await.unwrap(), 0);
        assert_eq!(volume.find_file("a").await.unwrap().replica, 3);
    }

    #[tokio::test]
    async fn test_synchronize_replicas_defers_to_smaller_survivor() {
        let dir = TempDir::new().unwrap();
        let volume = open(&dir);
        put(&volume, "a", b"payload", 0).await;

        // "0-" sorts before any uuid, so that survivor leads
        let ids = vec!["0-peer".to_string(), "~gone".to_string()];
        volume.update_file_replica("a", &ids, 3).await.unwrap();
        assert_eq!(volume.synchronize_replicas("~gone").await.unwrap(), 0);
        assert!(volume.next_replica().await.unwrap().is_none());
        assert_eq!(volume.volume_ids_of("a").await.unwrap(), vec!["0-peer"]);
    }

    #[tokio::test]
    async fn test_sweep_expired_removes_every_key() {
        let dir = TempDir::new().unwrap();
        let volume = open(&dir);

        let created = Utc::now() - chrono::Duration::seconds(120);
        let opts = CreateOptions::default()
            .ttl(Duration::from_secs(60))
            .created_at(created);
        let file = volume
            .create_file("a", Cursor::new(b"ephemeral".to_vec()), opts)
            .await
            .unwrap();
        put(&volume, "b", b"ephemeral", 0).await;
        put(&volume, "keep", b"durable", 0).await;

        assert_eq!(volume.sweep_expired(created).await.unwrap(), 0);
        assert_eq!(volume.sweep_expired(Utc::now()).await.unwrap(), 1);
        assert_eq!(volume.has_file("a").await.unwrap(), None);
        assert_eq!(volume.has_file("b").await.unwrap(), None);
        assert!(!volume.file_path(&file.signature).exists());
        assert!(volume.has_file("keep").await.unwrap().is_some());
        assert_eq!(volume.sweep_expired(Utc::now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retry_queue_gives_up() {
        let dir = TempDir::new().unwrap();
        let volume = open(&dir);
        let file = File::new("sig", "k", 1, 2, Duration::ZERO, Utc::now());
        let pendent = ReplicaPendent::for_file(&file, "k", "owner", 2);

        let mut retry = volume.enqueue_retry(&pendent).await.unwrap();
        assert_eq!(retry.volume_id, volume.id());
        for _ in 1..MAX_RETRY_ATTEMPTS {
            assert!(volume.fail_retry(&retry).await.unwrap());
            retry = volume.next_retry().await.unwrap().unwrap();
        }
        assert_eq!(retry.attempts, MAX_RETRY_ATTEMPTS - 1);
        assert!(!volume.fail_retry(&retry).await.unwrap());
        assert!(volume.next_retry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_state_refresh() {
        let dir = TempDir::new().unwrap();
        let volume = open(&dir);
        let state = volume.refresh_state().await.unwrap();
        assert_eq!(state.volume_total, State::UNBOUNDED);
        assert_eq!(state.mountpoint, dir.path().display().to_string());
        #[cfg(unix)]
        assert!(state.system_total > 0);
    }
}
