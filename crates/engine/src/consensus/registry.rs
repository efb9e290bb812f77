//! Server-scoped registry of consensus nodes
//!
//! Assignments carry group names only; the runtime node handle for a group
//! lives here. This breaks the assignment/group/node reference cycle and
//! gives teardown one place to stop every node.

use std::sync::Arc;

use dashmap::DashMap;

use super::node::RaftNode;

/// Registry of running consensus nodes, keyed by group name.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: DashMap<String, Arc<dyn RaftNode>>,
}

impl NodeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the node for `group`.
    pub fn lookup(&self, group: &str) -> Option<Arc<dyn RaftNode>> {
        self.nodes.get(group).map(|entry| entry.value().clone())
    }

    /// Register the node for its group. Returns the previously registered
    /// node, if any.
    pub fn insert(&self, node: Arc<dyn RaftNode>) -> Option<Arc<dyn RaftNode>> {
        self.nodes.insert(node.group(), node)
    }

    /// Remove and return the node for `group`.
    pub fn remove(&self, group: &str) -> Option<Arc<dyn RaftNode>> {
        self.nodes.remove(group).map(|(_, node)| node)
    }

    /// Shut down every registered node and clear the registry.
    pub fn shutdown_all(&self) {
        for entry in self.nodes.iter() {
            entry.value().shutdown();
        }
        self.nodes.clear();
    }
}
