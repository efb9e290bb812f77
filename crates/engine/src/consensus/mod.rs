//! Consensus node contract and in-process implementation
//!
//! The engine never implements the consensus protocol itself; it drives
//! replication through the narrow [`RaftNode`] capability interface. One
//! node exists per replication group this server is a member of, tracked
//! in the server-scoped [`NodeRegistry`].

pub mod memory;
mod node;
mod registry;

pub use node::{NodeChannels, NodeFactory, PeerInfo, RaftNode};
pub use registry::NodeRegistry;
