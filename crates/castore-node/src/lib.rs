#![warn(missing_docs)]

//! castore node subsystem: routing, replication, membership and HTTP surface
//!
//! A node fans client requests across its local volumes and forwards the
//! rest to peers found through gossip. Background loops place replica copies
//! on peers, rebuild copies lost with departed volumes and retry replica
//! writes that could not be completed on arrival.

pub mod api;
#[allow(missing_docs)]
pub mod cli;
pub mod config;
pub mod error;
pub mod gossip;
pub mod membership;
pub mod node;
pub mod peer;
pub mod replication;
pub mod runtime;

pub use api::StoreApi;
pub use config::{DashboardConfig, MemberlistConfig, NodeConfig};
pub use error::{NodeError, NodeResult};
pub use gossip::{gossip_round, gossip_router, GossipDigest};
pub use membership::{ClusterMembership, MemberInfo, MemberState, Membership, MembershipEvent, NodeMeta};
pub use node::{Holder, Node};
pub use peer::{PeerClient, ReplicaAccepted, ReplicaPush, ReplicaVolumes};
pub use replication::Replicator;
pub use runtime::NodeRuntime;
