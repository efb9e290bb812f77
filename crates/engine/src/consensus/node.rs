//! The consensus node capability interface

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::EngineResult;
use crate::foundation::{CommittedEntry, PeerId, RaftGroup};

/// Information about a peer of a replication group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Peer ID
    pub id: PeerId,
}

/// Channels a monitor task consumes. Exactly one monitor runs per node;
/// the receivers are handed out once.
pub struct NodeChannels {
    /// Committed entries, in commit order
    pub apply: mpsc::UnboundedReceiver<CommittedEntry>,
    /// Leadership transitions for this node
    pub leadership: mpsc::UnboundedReceiver<bool>,
}

/// A replicated log node for one replication group.
///
/// Implementations serialize proposals internally; `propose` is a bounded
/// enqueue that fails under pressure rather than blocking the caller.
pub trait RaftNode: Send + Sync {
    /// This node's peer ID.
    fn id(&self) -> PeerId;

    /// Name of the group this node replicates.
    fn group(&self) -> String;

    /// Whether this node is currently the group leader.
    fn is_leader(&self) -> bool;

    /// Whether this node is the leader or an up-to-date follower.
    fn is_current(&self) -> bool;

    /// Configured peers of the group.
    fn peers(&self) -> Vec<PeerInfo>;

    /// Submit an entry for consensus.
    fn propose(&self, data: Bytes) -> EngineResult<()>;

    /// Install a snapshot of the replicated state, letting the node
    /// truncate its log up to it.
    fn snapshot(&self, data: Bytes) -> EngineResult<()>;

    /// Acknowledge that entries up to `index` have been applied.
    fn applied(&self, index: u64);

    /// Hand out the apply/leadership receivers. Returns `None` after the
    /// first call; a node supports exactly one monitor.
    fn take_channels(&self) -> Option<NodeChannels>;

    /// Token cancelled when the node shuts down.
    fn quit(&self) -> CancellationToken;

    /// Stop the node, cancelling its quit token.
    fn shutdown(&self);
}

/// Creates consensus nodes for replication groups this server joins.
pub trait NodeFactory: Send + Sync {
    /// Create (or re-open) the node for `group` on this server.
    fn create(&self, group: &RaftGroup) -> EngineResult<Arc<dyn RaftNode>>;
}
