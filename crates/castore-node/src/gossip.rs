//! HTTP gossip on the memberlist port.
//!
//! Every round a node POSTs its own [`NodeMeta`] to each known member and to
//! the seed; the answer is the receiver's digest, which is merged locally.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use castore_storage::is_shutting_down;

use crate::membership::{ClusterMembership, MemberInfo, NodeMeta};

/// Deadline of one gossip exchange.
pub const GOSSIP_TIMEOUT: Duration = Duration::from_secs(2);

/// Reply to a gossip exchange.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GossipDigest {
    /// Metadata of the answering node first, then every member it knows.
    pub members: Vec<NodeMeta>,
}

/// Routes served on the memberlist listener.
pub fn gossip_router(membership: Arc<ClusterMembership>) -> Router {
    Router::new()
        .route("/members", post(exchange_handler).get(members_handler))
        .with_state(membership)
}

async fn exchange_handler(
    State(membership): State<Arc<ClusterMembership>>,
    Json(meta): Json<NodeMeta>,
) -> Json<GossipDigest> {
    membership.merge(meta, true);
    Json(GossipDigest {
        members: membership.digest(),
    })
}

async fn members_handler(State(membership): State<Arc<ClusterMembership>>) -> Json<Vec<MemberInfo>> {
    Json(membership.members())
}

async fn exchange(membership: &ClusterMembership, addr: &str, local: &NodeMeta) -> Result<GossipDigest, reqwest::Error> {
    membership
        .client()
        .post(format!("http://{}/members", addr))
        .timeout(GOSSIP_TIMEOUT)
        .json(local)
        .send()
        .await?
        .error_for_status()?
        .json::<GossipDigest>()
        .await
}

fn absorb(membership: &ClusterMembership, digest: GossipDigest) -> Option<String> {
    let mut metas = digest.members.into_iter();
    let sender = metas.next()?;
    let name = sender.node.clone();
    membership.merge(sender, true);
    for meta in metas {
        membership.merge(meta, false);
    }
    Some(name)
}

/// Runs one exchange with every member and the seed. Returns the number of
/// peers that answered.
pub async fn gossip_round(membership: &ClusterMembership, seed: Option<&str>) -> usize {
    let local = membership.local_meta();
    let mut targets: Vec<(Option<String>, String)> = membership
        .members()
        .into_iter()
        .map(|m| (Some(m.meta.node.clone()), m.meta.memberlist_addr()))
        .collect();
    if let Some(seed) = seed {
        let known = targets.iter().any(|(_, addr)| addr == seed);
        if !known && seed != local.memberlist_addr() {
            targets.push((None, seed.to_string()));
        }
    }

    let exchanges = targets.iter().map(|(_, addr)| exchange(membership, addr, &local));
    let replies = join_all(exchanges).await;

    let mut answered = 0;
    for ((name, addr), reply) in targets.into_iter().zip(replies) {
        match reply {
            Ok(digest) => {
                answered += 1;
                if let Some(sender) = absorb(membership, digest) {
                    membership.heartbeat(&sender);
                }
            }
            Err(e) => {
                debug!(addr = %addr, error = %e, "gossip exchange failed");
                match name {
                    Some(name) => {
                        membership.record_failure(&name);
                    }
                    None => warn!(seed = %addr, error = %e, "seed unreachable"),
                }
            }
        }
    }
    answered
}

/// Gossips every `interval` until shutdown.
pub async fn run_gossip_loop(
    membership: Arc<ClusterMembership>,
    seed: Option<String>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {}
        }
        if is_shutting_down(&shutdown) {
            break;
        }
        gossip_round(&membership, seed.as_deref()).await;
        for event in membership.drain_events() {
            debug!(?event, "membership event");
        }
    }
    debug!("gossip loop stopped");
}
