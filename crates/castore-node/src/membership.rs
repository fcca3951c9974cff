//! Cluster membership tracking.
//!
//! Tracks peer nodes and the volumes they announce, moving them through
//! Alive -> Suspect -> Dead as gossip probes fail. Volume ids of members
//! that leave or die are collected so the recovery loop can rebuild the
//! copies they held.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use castore_storage::State;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::MemberlistConfig;
use crate::peer::{PeerClient, PEER_TIMEOUT};

/// Events kept until drained. Older events are dropped first.
pub const MAX_PENDING_EVENTS: usize = 256;

/// Peer lookups consumed by node routing and the replication loops.
pub trait Membership: Send + Sync {
    /// Every reachable peer, in stable order. Excludes the local node.
    fn nodes(&self) -> Vec<Arc<PeerClient>>;

    /// Volume ids of the local node.
    fn local_volumes(&self) -> Vec<String>;

    /// Peers owning none of `volume_ids`.
    fn nodes_without_volume_ids(&self, volume_ids: &[String]) -> Vec<Arc<PeerClient>>;

    /// Peer owning `volume_id`, if any.
    fn node_with_volume_id(&self, volume_id: &str) -> Option<Arc<PeerClient>>;

    /// Volume ids of departed peers since the last call. Drains the list.
    fn removed_volume_ids(&self) -> Vec<String>;
}

/// Metadata a node announces to the cluster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeMeta {
    /// Node name.
    pub node: String,
    /// Advertised host.
    pub host: String,
    /// Port of the storing service.
    pub port: u16,
    /// Port of the gossip listener.
    pub memberlist_port: u16,
    /// Local volumes and their latest state.
    #[serde(default)]
    pub volumes: BTreeMap<String, State>,
}

impl NodeMeta {
    /// Base URL of the storing service.
    pub fn http_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Address of the gossip listener.
    pub fn memberlist_addr(&self) -> String {
        format!("{}:{}", self.host, self.memberlist_port)
    }

    fn owns_any(&self, volume_ids: &[String]) -> bool {
        volume_ids.iter().any(|id| self.volumes.contains_key(id))
    }
}

/// Liveness of a member.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberState {
    /// Answering probes.
    Alive,
    /// Missed at least `suspect_after` consecutive probes.
    Suspect,
    /// Missed `dead_after` probes; removed from the table.
    Dead,
}

/// Information about a cluster member.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemberInfo {
    /// Announced metadata.
    pub meta: NodeMeta,
    /// Current liveness.
    pub state: MemberState,
    /// Consecutive failed probes.
    pub failures: u32,
    /// Last successful contact.
    pub last_heartbeat: DateTime<Utc>,
    /// First contact.
    pub joined_at: DateTime<Utc>,
}

/// Events emitted by membership changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MembershipEvent {
    /// A node joined the cluster.
    NodeJoined {
        /// Name of the node.
        node: String,
    },
    /// A node stopped answering probes.
    NodeSuspected {
        /// Name of the node.
        node: String,
    },
    /// A suspected node answered again.
    NodeRecovered {
        /// Name of the node.
        node: String,
    },
    /// A node left on purpose.
    NodeLeft {
        /// Name of the node.
        node: String,
    },
    /// A node was declared dead.
    NodeDead {
        /// Name of the node.
        node: String,
    },
}

struct Member {
    info: MemberInfo,
    peer: Arc<PeerClient>,
}

/// Member table shared by gossip, routing and the replication loops.
pub struct ClusterMembership {
    local: RwLock<NodeMeta>,
    members: RwLock<BTreeMap<String, Member>>,
    tombstones: RwLock<HashSet<String>>,
    removed: Mutex<Vec<String>>,
    events: Mutex<VecDeque<MembershipEvent>>,
    client: Client,
    suspect_after: u32,
    dead_after: u32,
}

impl ClusterMembership {
    /// Creates a table that only knows the local node.
    pub fn new(local: NodeMeta, config: &MemberlistConfig) -> Self {
        let client = Client::builder()
            .timeout(PEER_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            local: RwLock::new(local),
            members: RwLock::new(BTreeMap::new()),
            tombstones: RwLock::new(HashSet::new()),
            removed: Mutex::new(Vec::new()),
            events: Mutex::new(VecDeque::new()),
            client,
            suspect_after: config.suspect_after.max(1),
            dead_after: config.dead_after.max(config.suspect_after.max(1)),
        }
    }

    /// Name of the local node.
    pub fn local_name(&self) -> String {
        self.local.read().node.clone()
    }

    /// Metadata announced by the local node.
    pub fn local_meta(&self) -> NodeMeta {
        self.local.read().clone()
    }

    /// Replaces the announced state of the local volumes.
    pub fn set_local_volumes(&self, volumes: BTreeMap<String, State>) {
        self.local.write().volumes = volumes;
    }

    /// HTTP client shared with peer handles.
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn push_event(&self, event: MembershipEvent) {
        let mut events = self.events.lock();
        if events.len() == MAX_PENDING_EVENTS {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Adds or refreshes a member as Alive. Returns true if it was unknown.
    ///
    /// Volumes a known member no longer announces count as removed.
    pub fn join(&self, meta: NodeMeta) -> bool {
        if meta.node == self.local_name() {
            return false;
        }
        self.tombstones.write().remove(&meta.node);
        let now = Utc::now();
        let name = meta.node.clone();

        let mut members = self.members.write();
        let (joined, dropped, recovered) = match members.get_mut(&name) {
            Some(member) => {
                let dropped: Vec<String> = member
                    .info
                    .meta
                    .volumes
                    .keys()
                    .filter(|id| !meta.volumes.contains_key(*id))
                    .cloned()
                    .collect();
                if member.info.meta.http_url() != meta.http_url() {
                    member.peer = Arc::new(PeerClient::with_client(&name, meta.http_url(), self.client.clone()));
                }
                let recovered = member.info.state != MemberState::Alive;
                member.info.meta = meta;
                member.info.state = MemberState::Alive;
                member.info.failures = 0;
                member.info.last_heartbeat = now;
                (false, dropped, recovered)
            }
            None => {
                let peer = Arc::new(PeerClient::with_client(&name, meta.http_url(), self.client.clone()));
                members.insert(
                    name.clone(),
                    Member {
                        info: MemberInfo {
                            meta,
                            state: MemberState::Alive,
                            failures: 0,
                            last_heartbeat: now,
                            joined_at: now,
                        },
                        peer,
                    },
                );
                (true, Vec::new(), false)
            }
        };
        drop(members);

        if !dropped.is_empty() {
            info!(node = %name, volumes = ?dropped, "member dropped volumes");
            self.removed.lock().extend(dropped);
        }
        if joined {
            info!(node = %name, "member joined");
            self.push_event(MembershipEvent::NodeJoined { node: name });
        } else if recovered {
            self.push_event(MembershipEvent::NodeRecovered { node: name });
        }
        joined
    }

    fn remove(&self, name: &str) -> Option<MemberInfo> {
        let member = self.members.write().remove(name)?;
        self.tombstones.write().insert(name.to_string());
        self.removed
            .lock()
            .extend(member.info.meta.volumes.keys().cloned());
        Some(member.info)
    }

    /// Removes a member that left. Returns true if it was known.
    pub fn leave(&self, name: &str) -> bool {
        let existed = self.remove(name).is_some();
        if existed {
            info!(node = %name, "member left");
            self.push_event(MembershipEvent::NodeLeft { node: name.to_string() });
        }
        existed
    }

    /// Removes a member that stopped answering. Returns true if it was known.
    pub fn mark_dead(&self, name: &str) -> bool {
        let existed = self.remove(name).is_some();
        if existed {
            warn!(node = %name, "member declared dead");
            self.push_event(MembershipEvent::NodeDead { node: name.to_string() });
        }
        existed
    }

    /// Marks an Alive member as Suspect. Returns true on transition.
    pub fn suspect(&self, name: &str) -> bool {
        let mut members = self.members.write();
        let Some(member) = members.get_mut(name) else {
            return false;
        };
        if member.info.state != MemberState::Alive {
            return false;
        }
        member.info.state = MemberState::Suspect;
        drop(members);
        warn!(node = %name, "member suspected");
        self.push_event(MembershipEvent::NodeSuspected { node: name.to_string() });
        true
    }

    /// Records a successful probe. Returns false for unknown members.
    pub fn heartbeat(&self, name: &str) -> bool {
        let mut members = self.members.write();
        let Some(member) = members.get_mut(name) else {
            return false;
        };
        let recovered = member.info.state == MemberState::Suspect;
        member.info.state = MemberState::Alive;
        member.info.failures = 0;
        member.info.last_heartbeat = Utc::now();
        drop(members);
        if recovered {
            self.push_event(MembershipEvent::NodeRecovered { node: name.to_string() });
        }
        true
    }

    /// Records a failed probe and returns the resulting state.
    pub fn record_failure(&self, name: &str) -> Option<MemberState> {
        let failures = {
            let mut members = self.members.write();
            let member = members.get_mut(name)?;
            member.info.failures += 1;
            member.info.failures
        };
        if failures >= self.dead_after {
            self.mark_dead(name);
            Some(MemberState::Dead)
        } else if failures >= self.suspect_after {
            self.suspect(name);
            Some(MemberState::Suspect)
        } else {
            self.members.read().get(name).map(|m| m.info.state)
        }
    }

    /// Merges metadata learnt through gossip. Returns true if a member was added.
    ///
    /// `direct` is true when the node announced itself; only then may a
    /// tombstoned name come back or a known member be refreshed.
    pub fn merge(&self, meta: NodeMeta, direct: bool) -> bool {
        if meta.node == self.local_name() {
            return false;
        }
        if !direct {
            if self.tombstones.read().contains(&meta.node) {
                return false;
            }
            if self.members.read().contains_key(&meta.node) {
                return false;
            }
        }
        self.join(meta)
    }

    /// Snapshot of the member table.
    pub fn members(&self) -> Vec<MemberInfo> {
        self.members.read().values().map(|m| m.info.clone()).collect()
    }

    /// Looks up one member.
    pub fn member(&self, name: &str) -> Option<MemberInfo> {
        self.members.read().get(name).map(|m| m.info.clone())
    }

    /// Metadata of the local node followed by every member.
    pub fn digest(&self) -> Vec<NodeMeta> {
        let mut metas = vec![self.local_meta()];
        metas.extend(self.members.read().values().map(|m| m.info.meta.clone()));
        metas
    }

    /// Returns and clears pending events.
    pub fn drain_events(&self) -> Vec<MembershipEvent> {
        self.events.lock().drain(..).collect()
    }
}

impl Membership for ClusterMembership {
    fn nodes(&self) -> Vec<Arc<PeerClient>> {
        self.members
            .read()
            .values()
            .filter(|m| m.info.state != MemberState::Dead)
            .map(|m| m.peer.clone())
            .collect()
    }

    fn local_volumes(&self) -> Vec<String> {
        self.local.read().volumes.keys().cloned().collect()
    }

    fn nodes_without_volume_ids(&self, volume_ids: &[String]) -> Vec<Arc<PeerClient>> {
        self.members
            .read()
            .values()
            .filter(|m| m.info.state != MemberState::Dead)
            .filter(|m| !m.info.meta.volumes.is_empty() && !m.info.meta.owns_any(volume_ids))
            .map(|m| m.peer.clone())
            .collect()
    }

    fn node_with_volume_id(&self, volume_id: &str) -> Option<Arc<PeerClient>> {
        self.members
            .read()
            .values()
            .find(|m| m.info.meta.volumes.contains_key(volume_id))
            .map(|m| m.peer.clone())
    }

    fn removed_volume_ids(&self) -> Vec<String> {
        std::mem::take(&mut *self.removed.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(node: &str, volumes: &[&str]) -> NodeMeta {
        NodeMeta {
            node: node.to_string(),
            host: "127.0.0.1".to_string(),
            port: 9000,
            memberlist_port: 9001,
            volumes: volumes
                .iter()
                .map(|v| (v.to_string(), State::new("/", State::UNBOUNDED)))
                .collect(),
        }
    }

    fn membership() -> ClusterMembership {
        let config = MemberlistConfig {
            suspect_after: 2,
            dead_after: 3,
            ..MemberlistConfig::default()
        };
        ClusterMembership::new(meta("local", &["lv"]), &config)
    }

    #[test]
    fn test_join_and_nodes_order() {
        let m = membership();
        assert!(m.join(meta("n3", &["v3"])));
        assert!(m.join(meta("n2", &["v2"])));
        assert!(!m.join(meta("n2", &["v2"])));
        let names: Vec<_> = m.nodes().iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, vec!["n2", "n3"]);
        assert_eq!(m.local_volumes(), vec!["lv".to_string()]);
    }

    #[test]
    fn test_join_ignores_local_node() {
        let m = membership();
        assert!(!m.join(meta("local", &["lv"])));
        assert!(m.nodes().is_empty());
    }

    #[test]
    fn test_volume_lookups() {
        let m = membership();
        m.join(meta("n2", &["v2a", "v2b"]));
        m.join(meta("n3", &["v3"]));
        m.join(meta("empty", &[]));

        assert_eq!(m.node_with_volume_id("v2b").unwrap().name(), "n2");
        assert!(m.node_with_volume_id("lv").is_none());

        let without: Vec<_> = m
            .nodes_without_volume_ids(&["v2a".to_string()])
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(without, vec!["n3"]);
    }

    #[test]
    fn test_leave_records_removed_volumes_once() {
        let m = membership();
        m.join(meta("n2", &["v2"]));
        assert!(m.leave("n2"));
        assert!(!m.leave("n2"));
        assert_eq!(m.removed_volume_ids(), vec!["v2".to_string()]);
        assert!(m.removed_volume_ids().is_empty());
        assert!(m.nodes().is_empty());
    }

    #[test]
    fn test_rejoin_with_fewer_volumes() {
        let m = membership();
        m.join(meta("n2", &["a", "b"]));
        m.join(meta("n2", &["a"]));
        assert_eq!(m.removed_volume_ids(), vec!["b".to_string()]);
    }

    #[test]
    fn test_failures_escalate() {
        let m = membership();
        m.join(meta("n2", &["v2"]));
        assert_eq!(m.record_failure("n2"), Some(MemberState::Alive));
        assert_eq!(m.record_failure("n2"), Some(MemberState::Suspect));
        assert_eq!(m.member("n2").unwrap().state, MemberState::Suspect);
        assert_eq!(m.record_failure("n2"), Some(MemberState::Dead));
        assert!(m.member("n2").is_none());
        assert_eq!(m.removed_volume_ids(), vec!["v2".to_string()]);
        assert_eq!(m.record_failure("n2"), None);
    }

    #[test]
    fn test_heartbeat_recovers_suspect() {
        let m = membership();
        m.join(meta("n2", &["v2"]));
        m.drain_events();
        assert!(m.suspect("n2"));
        assert!(m.heartbeat("n2"));
        assert_eq!(m.member("n2").unwrap().state, MemberState::Alive);
        assert_eq!(
            m.drain_events(),
            vec![
                MembershipEvent::NodeSuspected { node: "n2".into() },
                MembershipEvent::NodeRecovered { node: "n2".into() },
            ]
        );
    }

    #[test]
    fn test_pending_events_stay_bounded() {
        let m = membership();
        m.join(meta("n2", &["v2"]));
        for _ in 0..MAX_PENDING_EVENTS {
            m.suspect("n2");
            m.heartbeat("n2");
        }
        let events = m.drain_events();
        assert_eq!(events.len(), MAX_PENDING_EVENTS);
        assert_eq!(events.last(), Some(&MembershipEvent::NodeRecovered { node: "n2".into() }));
        assert!(m.drain_events().is_empty());
    }

    #[test]
    fn test_merge_respects_tombstones() {
        let m = membership();
        m.join(meta("n2", &["v2"]));
        m.leave("n2");
        assert!(!m.merge(meta("n2", &["v2"]), false));
        assert!(m.member("n2").is_none());
        assert!(m.merge(meta("n2", &["v2"]), true));
        assert!(m.member("n2").is_some());
    }

    #[test]
    fn test_indirect_merge_does_not_overwrite() {
        let m = membership();
        m.join(meta("n2", &["v2"]));
        assert!(!m.merge(meta("n2", &[]), false));
        assert!(m.removed_volume_ids().is_empty());
        assert!(m.node_with_volume_id("v2").is_some());
    }

    #[test]
    fn test_digest_starts_with_local() {
        let m = membership();
        m.join(meta("n2", &["v2"]));
        let digest = m.digest();
        assert_eq!(digest.len(), 2);
        assert_eq!(digest[0].node, "local");
    }
}
