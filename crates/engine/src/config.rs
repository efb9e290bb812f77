//! Engine configuration

use serde::{Deserialize, Serialize};

use crate::error::{EngineResult, Error};
use crate::foundation::PeerId;

/// Configuration for a clustered engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Stable name of this server, doubles as its peer ID
    pub server_name: String,
    /// Name of the cluster this server belongs to
    pub cluster_name: String,
    /// Peers reachable via configured routes, not including this server
    pub routes: Vec<PeerId>,
    /// Name of the meta replication group
    #[serde(default = "default_meta_group")]
    pub meta_group_name: String,
}

fn default_meta_group() -> String {
    "_meta_".to_string()
}

impl ClusterConfig {
    /// Create a config for `server_name` with the given routed peers.
    pub fn new(server_name: impl Into<String>, cluster_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            cluster_name: cluster_name.into(),
            routes: Vec::new(),
            meta_group_name: default_meta_group(),
        }
    }

    /// Add a routed peer.
    pub fn with_route(mut self, peer: impl Into<PeerId>) -> Self {
        self.routes.push(peer.into());
        self
    }

    /// The peer ID this server participates under.
    pub fn peer_id(&self) -> PeerId {
        PeerId::from(self.server_name.as_str())
    }

    /// All meta-group peers: this server plus every routed peer.
    pub fn meta_peers(&self) -> Vec<PeerId> {
        let mut peers = Vec::with_capacity(self.routes.len() + 1);
        peers.push(self.peer_id());
        peers.extend(self.routes.iter().cloned());
        peers
    }

    /// Validate the prerequisites for clustered operation.
    pub fn validate(&self) -> EngineResult<()> {
        if self.server_name.is_empty() {
            return Err(Error::configuration(
                "clustered streaming requires `server_name` to be set",
            ));
        }
        if self.cluster_name.is_empty() {
            return Err(Error::configuration(
                "clustered streaming requires `cluster_name` to be set",
            ));
        }
        if self.routes.is_empty() {
            return Err(Error::configuration(
                "clustered streaming requires at least one configured route",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_requires_names_and_routes() {
        let cfg = ClusterConfig::new("", "c1").with_route("n2");
        assert!(cfg.validate().is_err());

        let cfg = ClusterConfig::new("n1", "").with_route("n2");
        assert!(cfg.validate().is_err());

        let cfg = ClusterConfig::new("n1", "c1");
        assert!(cfg.validate().is_err());

        let cfg = ClusterConfig::new("n1", "c1").with_route("n2");
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.meta_peers().len(), 2);
    }
}
