//! Wires volumes, membership, loops and listeners into a running node.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use castore_storage::background::STATE_INTERVAL;
use castore_storage::{is_shutting_down, spawn_volume_loops, LocalVolume, State, VolumeConfig, VolumeContext};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::StoreApi;
use crate::config::NodeConfig;
use crate::error::NodeResult;
use crate::gossip::{gossip_router, run_gossip_loop};
use crate::membership::{ClusterMembership, NodeMeta};
use crate::node::Node;
use crate::replication::{spawn_replication_loops, Replicator};

/// Grace period for background tasks after shutdown was requested.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A started node with its listeners and background tasks.
pub struct NodeRuntime {
    node: Arc<Node>,
    membership: Arc<ClusterMembership>,
    replicator: Arc<Replicator>,
    http_addr: SocketAddr,
    memberlist_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

async fn volume_states(volumes: &[LocalVolume]) -> BTreeMap<String, State> {
    let mut states = BTreeMap::new();
    for volume in volumes {
        match volume.get_state().await {
            Ok(state) => {
                states.insert(volume.id().to_string(), state);
            }
            Err(e) => warn!(volume = %volume.id(), error = %e, "volume state unavailable"),
        }
    }
    states
}

/// Republishes the local volume states every [`STATE_INTERVAL`].
async fn run_announce_loop(node: Arc<Node>, membership: Arc<ClusterMembership>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(STATE_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {}
        }
        if is_shutting_down(&shutdown) {
            break;
        }
        membership.set_local_volumes(volume_states(node.volumes()).await);
    }
    debug!("announce loop stopped");
}

fn serve(listener: TcpListener, router: axum::Router, mut shutdown: watch::Receiver<bool>, what: &'static str) -> JoinHandle<()> {
    tokio::spawn(async move {
        let stop = async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        };
        if let Err(e) = axum::serve(listener, router).with_graceful_shutdown(stop).await {
            error!(listener = what, error = %e, "server failed");
        }
        debug!(listener = what, "server stopped");
    })
}

impl NodeRuntime {
    /// Opens every volume, binds both listeners and spawns all loops.
    ///
    /// Ports set to 0 bind ephemeral ports; the bound ones are announced.
    pub async fn start(config: NodeConfig) -> NodeResult<Self> {
        config.validate()?;

        let ctx = VolumeContext::default();
        let mut volumes = Vec::with_capacity(config.volumes.len());
        for root in &config.volumes {
            let mut volume_config = VolumeConfig::new(root);
            if let Some(size) = config.volume_size {
                volume_config = volume_config.with_capacity(size);
            }
            volumes.push(LocalVolume::open(volume_config, ctx.clone())?);
        }

        let http_listener = TcpListener::bind(config.http_addr()).await?;
        let memberlist_listener = TcpListener::bind(config.memberlist_addr()).await?;
        let http_addr = http_listener.local_addr()?;
        let memberlist_addr = memberlist_listener.local_addr()?;

        let meta = NodeMeta {
            node: config.name.clone(),
            host: config.host.clone(),
            port: http_addr.port(),
            memberlist_port: memberlist_addr.port(),
            volumes: volume_states(&volumes).await,
        };
        let membership = Arc::new(ClusterMembership::new(meta, &config.memberlist));
        let node = Arc::new(Node::new(
            config.name.clone(),
            volumes,
            membership.clone(),
            config.default_replica(),
            ctx.replica_signal.clone(),
        )?);
        let replicator = Arc::new(Replicator::new(node.clone()));

        let (shutdown, rx) = watch::channel(false);
        let mut handles = Vec::new();
        for volume in node.volumes() {
            handles.extend(spawn_volume_loops(volume, &rx));
        }
        handles.extend(spawn_replication_loops(&replicator, &rx));
        handles.push(tokio::spawn(run_gossip_loop(
            membership.clone(),
            config.remote.clone(),
            config.memberlist.interval(),
            rx.clone(),
        )));
        handles.push(tokio::spawn(run_announce_loop(node.clone(), membership.clone(), rx.clone())));

        let api = Arc::new(StoreApi::new(node.clone(), Arc::new(config.clone())));
        handles.push(serve(http_listener, api.router(), rx.clone(), "http"));
        handles.push(serve(memberlist_listener, gossip_router(membership.clone()), rx, "memberlist"));

        info!(
            node = %config.name,
            http = %http_addr,
            memberlist = %memberlist_addr,
            volumes = node.volumes().len(),
            "node started"
        );
        Ok(Self {
            node,
            membership,
            replicator,
            http_addr,
            memberlist_addr,
            shutdown,
            handles,
        })
    }

    /// Storing service of this node.
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Member table of this node.
    pub fn membership(&self) -> &Arc<ClusterMembership> {
        &self.membership
    }

    /// Replication driver of this node.
    pub fn replicator(&self) -> &Arc<Replicator> {
        &self.replicator
    }

    /// Bound address of the storing service.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Bound address of the gossip listener.
    pub fn memberlist_addr(&self) -> SocketAddr {
        self.memberlist_addr
    }

    /// Base URL of the storing service.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.http_addr)
    }

    /// Stops every loop and listener, waiting up to [`SHUTDOWN_GRACE`] for each.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let abort = handle.abort_handle();
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                warn!("background task did not stop in time");
                abort.abort();
            }
        }
        info!(node = %self.node.name(), "node stopped");
    }
}
