//! Leader identity as seen by this node.
//!
//! The voting component is the only writer; the worker reads snapshots when it
//! evaluates a leader change.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::config::{ClusterConfig, NodeConfig};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteData {
    pub node_id: u64,
    pub host: String,
    pub port: u16,
}

impl VoteData {
    pub fn new(node_id: u64, host: impl Into<String>, port: u16) -> Self {
        Self {
            node_id,
            host: host.into(),
            port,
        }
    }

    /// A vote can be dialed only with a host and a non-zero port.
    pub fn is_routable(&self) -> bool {
        !self.host.trim().is_empty() && self.port != 0
    }

    /// Hosts must be IP literals; name resolution would block the reactor.
    pub fn socket_addr(&self) -> io::Result<SocketAddr> {
        let ip = self.host.trim().parse::<IpAddr>().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{self} does not use an IP address literal"),
            )
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for VoteData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {} at {}:{}", self.node_id, self.host, self.port)
    }
}

impl From<&NodeConfig> for VoteData {
    fn from(value: &NodeConfig) -> Self {
        Self::new(value.node_id, value.host.clone(), value.port)
    }
}

#[derive(Debug, Default)]
struct ClusterState {
    leader: Option<VoteData>,
    term: u64,
}

/// Shared view of "self" and "current leader".
#[derive(Clone, Debug)]
pub struct ClusterContext {
    self_identity: Arc<VoteData>,
    state: Arc<RwLock<ClusterState>>,
}

impl ClusterContext {
    pub fn new(self_identity: VoteData) -> Self {
        Self {
            self_identity: Arc::new(self_identity),
            state: Arc::new(RwLock::new(ClusterState::default())),
        }
    }

    pub fn self_identity(&self) -> &VoteData {
        &self.self_identity
    }

    pub fn leader_identity(&self) -> Option<VoteData> {
        match self.state.read() {
            Ok(state) => state.leader.clone(),
            Err(poisoned) => poisoned.into_inner().leader.clone(),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.leader_identity()
            .is_some_and(|leader| leader.node_id == self.self_identity.node_id)
    }

    /// Number of leader decisions applied so far.
    pub fn term(&self) -> u64 {
        match self.state.read() {
            Ok(state) => state.term,
            Err(poisoned) => poisoned.into_inner().term,
        }
    }

    /// Records a new leader decision. Returns whether the leader changed.
    pub fn apply_vote(&self, leader: Option<VoteData>) -> bool {
        let mut state = match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.term += 1;
        let changed = state.leader != leader;
        state.leader = leader;
        changed
    }
}

/// Voting stand-in that reads the leader from the `[cluster]` table.
#[derive(Clone, Debug)]
pub struct StaticVoting {
    self_identity: VoteData,
}

impl StaticVoting {
    pub fn new(self_identity: VoteData) -> Self {
        Self { self_identity }
    }

    pub fn elect(&self, cluster: &ClusterConfig) -> Option<VoteData> {
        if cluster.leader_id == 0 {
            return None;
        }
        if cluster.leader_id == self.self_identity.node_id {
            return Some(self.self_identity.clone());
        }
        cluster
            .member(cluster.leader_id)
            .map(|member| VoteData::new(member.node_id, member.host.clone(), member.port))
    }
}
