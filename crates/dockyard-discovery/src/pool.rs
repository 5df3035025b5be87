//! Label-indexed node pool.
//!
//! Dynamically provisioned engine hosts show up here as nodes carrying a
//! discovery label. A node is a candidate only while it is online and
//! advertises an externally reachable address.
//!
//! [`NodeRegistry`] is the in-process pool: nodes declared in config are
//! static and stay online until they leave; nodes registered at runtime
//! must keep heartbeating or they are treated as offline.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{debug, info, warn};

use dockyard_core::NodeConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
}

/// A node as seen by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolNode {
    pub name: String,
    pub address: Option<String>,
    pub labels: Vec<String>,
    pub status: NodeStatus,
    /// Last heartbeat in epoch seconds; `None` for static nodes.
    pub last_heartbeat: Option<u64>,
}

impl PoolNode {
    pub fn is_online(&self) -> bool {
        self.status == NodeStatus::Online
    }
}

/// Source of nodes for a discovery label.
pub trait NodePool: Send + Sync {
    /// Nodes carrying `label`, in discovery order.
    fn nodes_with_label(&self, label: &str) -> Vec<PoolNode>;
}

#[derive(Debug, Clone)]
struct Entry {
    address: Option<String>,
    labels: Vec<String>,
    last_heartbeat: Option<u64>,
    registered_at: u64,
}

/// In-memory node pool with heartbeat-based liveness.
pub struct NodeRegistry {
    nodes: RwLock<BTreeMap<String, Entry>>,
    dead_after: Duration,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(BTreeMap::new()),
            dead_after: Duration::from_secs(30),
        }
    }

    /// Nodes silent for longer than this are offline.
    pub fn with_dead_after(mut self, dead_after: Duration) -> Self {
        self.dead_after = dead_after;
        self
    }

    /// Seed static nodes from configuration.
    pub fn from_config(nodes: &[NodeConfig]) -> Self {
        let registry = Self::new();
        for node in nodes {
            registry.add_static(&node.name, node.address.clone(), node.labels.clone());
        }
        registry
    }

    /// Add a node that never needs to heartbeat.
    pub fn add_static(&self, name: &str, address: Option<String>, labels: Vec<String>) {
        self.insert(name, address, labels, None);
    }

    /// Register (or re-register) a heartbeating node.
    pub fn register(&self, name: &str, address: Option<String>, labels: Vec<String>) {
        self.insert(name, address, labels, Some(epoch_secs()));
        info!(node = %name, "node registered");
    }

    /// Record a heartbeat. Returns `false` for unknown nodes.
    pub fn heartbeat(&self, name: &str) -> bool {
        self.heartbeat_at(name, epoch_secs())
    }

    pub(crate) fn heartbeat_at(&self, name: &str, at: u64) -> bool {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        match nodes.get_mut(name) {
            Some(entry) => {
                entry.last_heartbeat = Some(at);
                debug!(node = %name, "heartbeat received");
                true
            }
            None => {
                warn!(node = %name, "heartbeat from unknown node");
                false
            }
        }
    }

    /// Remove a node. Returns whether it existed.
    pub fn leave(&self, name: &str) -> bool {
        let existed = self
            .nodes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_some();
        if existed {
            info!(node = %name, "node left");
        }
        existed
    }

    /// Every node with its current status.
    pub fn list(&self) -> Vec<PoolNode> {
        let now = epoch_secs();
        self.nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, entry)| self.view(name, entry, now))
            .collect()
    }

    fn insert(&self, name: &str, address: Option<String>, labels: Vec<String>, heartbeat: Option<u64>) {
        let entry = Entry {
            address: address.filter(|a| !a.trim().is_empty()),
            labels,
            last_heartbeat: heartbeat,
            registered_at: epoch_secs(),
        };
        self.nodes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), entry);
    }

    fn view(&self, name: &str, entry: &Entry, now: u64) -> PoolNode {
        let status = match entry.last_heartbeat {
            Some(last) if now.saturating_sub(last) > self.dead_after.as_secs() => NodeStatus::Offline,
            _ => NodeStatus::Online,
        };
        PoolNode {
            name: name.to_string(),
            address: entry.address.clone(),
            labels: entry.labels.clone(),
            status,
            last_heartbeat: entry.last_heartbeat,
        }
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodePool for NodeRegistry {
    fn nodes_with_label(&self, label: &str) -> Vec<PoolNode> {
        let now = epoch_secs();
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());

        let mut matching: Vec<(&String, &Entry)> = nodes
            .iter()
            .filter(|(_, entry)| entry.labels.iter().any(|l| l == label))
            .collect();
        // Oldest registration first, then name.
        matching.sort_by(|a, b| a.1.registered_at.cmp(&b.1.registered_at).then(a.0.cmp(b.0)));

        matching
            .into_iter()
            .map(|(name, entry)| self.view(name, entry, now))
            .collect()
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
