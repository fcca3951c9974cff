//! Node-level replication loops: placement, recovery and retry.
//!
//! None of the loops keeps a unit of work open across a network call: work
//! items are read from a volume, the peer is contacted, and the result is
//! acknowledged in a fresh unit of work.

use std::sync::Arc;
use std::time::Duration;

use castore_storage::{is_shutting_down, stream_reader, CreateOptions, LocalVolume, Replica, ReplicaRetry};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{NodeError, NodeResult};
use crate::node::{Holder, Node};
use crate::peer::ReplicaPush;

/// Sleep of the placement loop when no copy could be placed.
pub const PLACEMENT_IDLE: Duration = Duration::from_secs(1);
/// Interval between drains of departed volume ids.
pub const RECOVERY_INTERVAL: Duration = Duration::from_secs(1);
/// Interval between retry rounds.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Drives replica work for every local volume of a node.
pub struct Replicator {
    node: Arc<Node>,
}

impl Replicator {
    /// Creates a replicator for `node`.
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }

    /// Places at most one copy, scanning volumes in order.
    ///
    /// Returns true when a peer accepted a copy.
    pub async fn place_next(&self) -> bool {
        for volume in self.node.volumes() {
            let replica = match volume.next_replica().await {
                Ok(Some(replica)) => replica,
                Ok(None) => continue,
                Err(e) => {
                    warn!(volume = %volume.id(), error = %e, "replica queue read failed");
                    continue;
                }
            };
            match self.place(volume, replica).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => warn!(volume = %volume.id(), error = %e, "replica placement failed"),
            }
        }
        false
    }

    async fn place(&self, volume: &LocalVolume, replica: Replica) -> NodeResult<bool> {
        if volume.has_file(&replica.key).await?.is_none() {
            debug!(volume = %volume.id(), key = %replica.key, "replica source gone, discarding");
            volume.discard_replica(&replica).await?;
            return Ok(false);
        }

        let membership = self.node.membership();
        for peer in membership.nodes_without_volume_ids(&replica.volume_ids) {
            match peer.has_file(&replica.key).await {
                Ok(None) => {}
                Ok(Some(_)) => {
                    debug!(peer = %peer.name(), key = %replica.key, "peer already holds key");
                    continue;
                }
                Err(e) => {
                    warn!(peer = %peer.name(), error = %e, "peer lookup failed");
                    continue;
                }
            }

            let push = ReplicaPush {
                ttl: replica.ttl,
                created_at: replica.created_at,
                owner: volume.id().to_string(),
                signature: replica.signature.clone(),
                replica: replica.original_count,
            };
            let stream = volume.get_file(&replica.key).await?;
            let accepted = match peer.create_replica(&replica.key, stream, &push).await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(peer = %peer.name(), key = %replica.key, error = %e, "replica push failed");
                    continue;
                }
            };

            let mut holders = replica.volume_ids.clone();
            if !holders.contains(&accepted.volume_id) {
                holders.push(accepted.volume_id.clone());
            }
            self.announce_holders(volume, &replica, &holders).await;
            volume.update_replica(&replica, &accepted.volume_id).await?;
            info!(
                volume = %volume.id(),
                peer = %peer.name(),
                key = %replica.key,
                remaining = replica.count.saturating_sub(1),
                "replica placed"
            );
            return Ok(true);
        }

        volume.requeue_replica(&replica).await?;
        Ok(false)
    }

    async fn announce_holders(&self, owner: &LocalVolume, replica: &Replica, holders: &[String]) {
        for volume_id in holders.iter().filter(|id| id.as_str() != owner.id()) {
            let result = match self.node.volume(volume_id) {
                Some(local) => local
                    .update_file_replica(&replica.key, holders, replica.original_count)
                    .await
                    .map(|_| ())
                    .map_err(NodeError::from),
                None => match self.node.membership().node_with_volume_id(volume_id) {
                    Some(peer) => {
                        peer.update_file_replica(&replica.key, holders, replica.original_count)
                            .await
                    }
                    None => {
                        debug!(volume = %volume_id, "holder has no member");
                        continue;
                    }
                },
            };
            if let Err(e) = result {
                warn!(volume = %volume_id, key = %replica.key, error = %e, "holder update failed");
            }
        }
    }

    /// Reconciles every local volume with the volumes departed since the
    /// last call. Returns the number of rebuild records queued.
    pub async fn recover_removed(&self) -> usize {
        let removed = self.node.membership().removed_volume_ids();
        if removed.is_empty() {
            return 0;
        }
        let mut queued = 0;
        for departed in &removed {
            for volume in self.node.volumes() {
                match volume.synchronize_replicas(departed).await {
                    Ok(n) => queued += n,
                    Err(e) => warn!(volume = %volume.id(), departed = %departed, error = %e, "replica sync failed"),
                }
            }
        }
        info!(departed = ?removed, queued, "departed volumes reconciled");
        queued
    }

    /// Runs the oldest retry of every volume. Returns the number satisfied.
    pub async fn retry_next(&self) -> usize {
        let mut satisfied = 0;
        for volume in self.node.volumes() {
            let retry = match volume.next_retry().await {
                Ok(Some(retry)) => retry,
                Ok(None) => continue,
                Err(e) => {
                    warn!(volume = %volume.id(), error = %e, "retry queue read failed");
                    continue;
                }
            };
            match self.fetch_from_owner(volume, &retry).await {
                Ok(()) => match volume.complete_retry(&retry).await {
                    Ok(()) => satisfied += 1,
                    Err(e) => warn!(volume = %volume.id(), error = %e, "retry ack failed"),
                },
                Err(e) => {
                    debug!(volume = %volume.id(), key = %retry.pendent.key, error = %e, "replica retry failed");
                    match volume.fail_retry(&retry).await {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!(
                                volume = %volume.id(),
                                key = %retry.pendent.key,
                                attempts = retry.attempts + 1,
                                "replica retry abandoned"
                            );
                            self.release_to_owner(volume, &retry).await;
                        }
                        Err(e) => warn!(volume = %volume.id(), error = %e, "retry requeue failed"),
                    }
                }
            }
        }
        satisfied
    }

    fn owner(&self, retry: &ReplicaRetry) -> NodeResult<Holder> {
        let owner = &retry.pendent.volume_id;
        self.node.owner_of(owner).ok_or_else(|| NodeError::PeerUnreachable {
            peer: owner.clone(),
            msg: "no member owns the volume".into(),
        })
    }

    async fn fetch_from_owner(&self, volume: &LocalVolume, retry: &ReplicaRetry) -> NodeResult<()> {
        let pendent = &retry.pendent;
        let owner = self.owner(retry)?;
        let stream = match &owner {
            Holder::Local(local) => local.get_file(&pendent.key).await?,
            Holder::Remote(peer) => peer.get_file(&pendent.key).await?,
        };
        let opts = CreateOptions::default()
            .ttl(pendent.ttl)
            .created_at(pendent.created_at);
        volume
            .create_file(&pendent.key, stream_reader(stream), opts)
            .await?;

        // copies placed since the push are only known to the owner
        let known = match &owner {
            Holder::Local(local) => local.volume_ids_of(&pendent.key).await.map_err(NodeError::from),
            Holder::Remote(peer) => peer.replica_volumes(&pendent.key).await.map(|r| r.volume_ids),
        };
        let mut holders = vec![pendent.volume_id.clone()];
        match known {
            Ok(ids) => {
                for id in ids {
                    if !holders.contains(&id) {
                        holders.push(id);
                    }
                }
            }
            Err(e) => warn!(volume = %volume.id(), key = %pendent.key, error = %e, "owner holder list unavailable"),
        }
        volume
            .update_file_replica(&pendent.key, &holders, pendent.replica)
            .await?;
        info!(volume = %volume.id(), key = %pendent.key, owner = %pendent.volume_id, "deferred replica fetched");
        Ok(())
    }

    /// Tells the owner this volume will not hold the copy it accepted.
    async fn release_to_owner(&self, volume: &LocalVolume, retry: &ReplicaRetry) {
        let key = &retry.pendent.key;
        let result = match self.owner(retry) {
            Ok(Holder::Local(owner)) => owner
                .release_holder(key, volume.id())
                .await
                .map(|_| ())
                .map_err(NodeError::from),
            Ok(Holder::Remote(peer)) => peer.release_holder(key, volume.id()).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(volume = %volume.id(), key = %key, error = %e, "owner not told of abandoned replica");
        }
    }
}

/// Places copies until shutdown, idling [`PLACEMENT_IDLE`] when nothing moved.
pub async fn run_placement_loop(replicator: Arc<Replicator>, mut shutdown: watch::Receiver<bool>) {
    let signal = replicator.node.replica_signal().clone();
    loop {
        if is_shutting_down(&shutdown) {
            break;
        }
        if replicator.place_next().await {
            continue;
        }
        tokio::select! {
            _ = tokio::time::sleep(PLACEMENT_IDLE) => {}
            _ = signal.notified() => {}
            _ = shutdown.changed() => {}
        }
    }
    debug!("placement loop stopped");
}

/// Drains departed volume ids every [`RECOVERY_INTERVAL`].
pub async fn run_recovery_loop(replicator: Arc<Replicator>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(RECOVERY_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {}
        }
        if is_shutting_down(&shutdown) {
            break;
        }
        replicator.recover_removed().await;
    }
    debug!("recovery loop stopped");
}

/// Runs retries every [`RETRY_INTERVAL`].
pub async fn run_retry_loop(replicator: Arc<Replicator>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(RETRY_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {}
        }
        if is_shutting_down(&shutdown) {
            break;
        }
        replicator.retry_next().await;
    }
    debug!("retry loop stopped");
}

/// Spawns the placement, recovery and retry loops.
pub fn spawn_replication_loops(replicator: &Arc<Replicator>, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(run_placement_loop(replicator.clone(), shutdown.clone())),
        tokio::spawn(run_recovery_loop(replicator.clone(), shutdown.clone())),
        tokio::spawn(run_retry_loop(replicator.clone(), shutdown.clone())),
    ]
}
