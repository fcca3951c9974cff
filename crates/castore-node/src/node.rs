//! Request routing across local volumes and peer nodes.

use std::sync::Arc;

use castore_storage::{ByteStream, CreateOptions, File, LocalVolume, Replica, ReplicaPendent};
use rand::seq::SliceRandom;
use tokio::io::AsyncRead;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{NodeError, NodeResult};
use crate::membership::Membership;
use crate::peer::{PeerClient, ReplicaAccepted, ReplicaPush, ReplicaVolumes};

/// Where a key currently lives.
#[derive(Debug, Clone)]
pub enum Holder {
    /// A volume of this node; supports every operation.
    Local(LocalVolume),
    /// A peer node reached over HTTP; supports the file surface only.
    Remote(Arc<PeerClient>),
}

/// The storing service of one node.
pub struct Node {
    name: String,
    volumes: Vec<LocalVolume>,
    membership: Arc<dyn Membership>,
    default_replica: u32,
    replica_signal: Arc<Notify>,
}

impl Node {
    /// Creates a node over already opened volumes.
    ///
    /// `replica_signal` must be the notifier the volumes were opened with.
    pub fn new(
        name: impl Into<String>,
        volumes: Vec<LocalVolume>,
        membership: Arc<dyn Membership>,
        default_replica: u32,
        replica_signal: Arc<Notify>,
    ) -> NodeResult<Self> {
        if volumes.is_empty() {
            return Err(NodeError::Config("a node needs at least one volume".into()));
        }
        Ok(Self {
            name: name.into(),
            volumes,
            membership,
            default_replica,
            replica_signal,
        })
    }

    /// Node name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Local volumes in configuration order.
    pub fn volumes(&self) -> &[LocalVolume] {
        &self.volumes
    }

    /// Local volume with id `volume_id`.
    pub fn volume(&self, volume_id: &str) -> Option<&LocalVolume> {
        self.volumes.iter().find(|v| v.id() == volume_id)
    }

    /// Membership view used for peer lookups.
    pub fn membership(&self) -> &Arc<dyn Membership> {
        &self.membership
    }

    /// Replica count applied when a write does not ask for one.
    pub fn default_replica(&self) -> u32 {
        self.default_replica
    }

    /// Fires whenever a local volume queues replica work.
    pub fn replica_signal(&self) -> &Arc<Notify> {
        &self.replica_signal
    }

    /// The local volume `volume_id`, else the peer that owns it.
    pub fn owner_of(&self, volume_id: &str) -> Option<Holder> {
        self.volume(volume_id)
            .cloned()
            .map(Holder::Local)
            .or_else(|| self.membership.node_with_volume_id(volume_id).map(Holder::Remote))
    }

    async fn local_holder(&self, key: &str) -> NodeResult<Option<&LocalVolume>> {
        for volume in &self.volumes {
            if volume.has_file(key).await?.is_some() {
                return Ok(Some(volume));
            }
        }
        Ok(None)
    }

    /// Finds the volume or peer currently holding `key`.
    ///
    /// Local volumes are checked first, then peers in membership order.
    /// Unreachable peers are skipped.
    pub async fn locate(&self, key: &str) -> NodeResult<Option<Holder>> {
        if let Some(volume) = self.local_holder(key).await? {
            return Ok(Some(Holder::Local(volume.clone())));
        }
        for peer in self.membership.nodes() {
            match peer.has_file(key).await {
                Ok(Some(_)) => return Ok(Some(Holder::Remote(peer))),
                Ok(None) => {}
                Err(e) => warn!(peer = %peer.name(), key = %key, error = %e, "peer lookup failed"),
            }
        }
        Ok(None)
    }

    /// Volume a write of `key` goes to: the one already holding it, else a random one.
    async fn target_volume(&self, key: &str) -> NodeResult<&LocalVolume> {
        if let Some(volume) = self.local_holder(key).await? {
            return Ok(volume);
        }
        self.volumes
            .choose(&mut rand::thread_rng())
            .ok_or_else(|| NodeError::Config("no local volume".into()))
    }

    /// Stores `reader` under `key` on a local volume.
    pub async fn create_file<R>(&self, key: &str, reader: R, opts: CreateOptions) -> NodeResult<File>
    where
        R: AsyncRead + Unpin + Send,
    {
        let volume = self.target_volume(key).await?;
        let file = volume.create_file(key, reader, opts).await?;
        info!(node = %self.name, volume = %volume.id(), key = %key, signature = %file.signature, "file stored");
        Ok(file)
    }

    /// Streams `key` from whichever volume or peer holds it.
    pub async fn get_file(&self, key: &str) -> NodeResult<ByteStream> {
        match self.locate(key).await? {
            Some(Holder::Local(volume)) => Ok(volume.get_file(key).await?),
            Some(Holder::Remote(peer)) => {
                debug!(node = %self.name, peer = %peer.name(), key = %key, "read forwarded");
                peer.get_file(key).await
            }
            None => Err(NodeError::not_found(key)),
        }
    }

    /// Deletes `key` on whichever volume or peer holds it.
    pub async fn delete_file(&self, key: &str) -> NodeResult<()> {
        match self.locate(key).await? {
            Some(Holder::Local(volume)) => Ok(volume.delete_file(key).await?),
            Some(Holder::Remote(peer)) => {
                debug!(node = %self.name, peer = %peer.name(), key = %key, "delete forwarded");
                peer.delete_file(key).await
            }
            None => Err(NodeError::not_found(key)),
        }
    }

    /// Signature of `key` if a local volume holds it. Peers are not asked.
    pub async fn has_file(&self, key: &str) -> NodeResult<Option<String>> {
        for volume in &self.volumes {
            if let Some(signature) = volume.has_file(key).await? {
                return Ok(Some(signature));
            }
        }
        Ok(None)
    }

    /// Accepts a replica pushed by its owner.
    ///
    /// A failed local write is queued as a retry that fetches the bytes from
    /// the owner later; the answer is then marked deferred.
    pub async fn create_replica<R>(&self, key: &str, reader: R, push: &ReplicaPush) -> NodeResult<ReplicaAccepted>
    where
        R: AsyncRead + Unpin + Send,
    {
        let volume = self.target_volume(key).await?;
        let opts = CreateOptions::default()
            .ttl(push.ttl)
            .created_at(push.created_at);
        match volume.create_file(key, reader, opts).await {
            Ok(file) => {
                debug!(node = %self.name, volume = %volume.id(), key = %key, signature = %file.signature, "replica stored");
                Ok(ReplicaAccepted {
                    volume_id: volume.id().to_string(),
                    deferred: false,
                })
            }
            Err(e) if !push.owner.is_empty() => {
                warn!(node = %self.name, key = %key, owner = %push.owner, error = %e, "replica write failed, queued for retry");
                let pendent = ReplicaPendent {
                    id: Uuid::new_v4(),
                    replica: push.replica,
                    key: key.to_string(),
                    signature: push.signature.clone(),
                    volume_id: push.owner.clone(),
                    ttl: push.ttl,
                    created_at: push.created_at,
                    seq: 0,
                };
                volume.enqueue_retry(&pendent).await?;
                Ok(ReplicaAccepted {
                    volume_id: volume.id().to_string(),
                    deferred: true,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replaces the holder list of the local file under `key`.
    pub async fn update_file_replica(&self, key: &str, volume_ids: &[String], original_count: u32) -> NodeResult<File> {
        let volume = self
            .local_holder(key)
            .await?
            .ok_or_else(|| NodeError::not_found(key))?;
        Ok(volume.update_file_replica(key, volume_ids, original_count).await?)
    }

    /// Holders of the local file under `key`, the local volume first.
    pub async fn replica_volumes(&self, key: &str) -> NodeResult<ReplicaVolumes> {
        let volume = self
            .local_holder(key)
            .await?
            .ok_or_else(|| NodeError::not_found(key))?;
        let file = volume.find_file(key).await?;
        let mut volume_ids = vec![volume.id().to_string()];
        volume_ids.extend(file.volume_ids);
        Ok(ReplicaVolumes {
            volume_ids,
            original_count: file.replica,
        })
    }

    /// Drops `holder` from the local file under `key`, queueing a rebuild
    /// when the file falls below its target.
    pub async fn release_holder(&self, key: &str, holder: &str) -> NodeResult<Option<Replica>> {
        let volume = self
            .local_holder(key)
            .await?
            .ok_or_else(|| NodeError::not_found(key))?;
        Ok(volume.release_holder(key, holder).await?)
    }
}
