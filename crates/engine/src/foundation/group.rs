//! Replication groups
//!
//! A replication group names a peer set that hosts one replicated log: the
//! meta group, one group per stream, one per consumer. Groups are plain
//! data; the runtime node handle lives in the server's node registry keyed
//! by group name, never inside the group itself.

use serde::{Deserialize, Serialize};

use super::types::PeerId;

/// Storage class of a replication group's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageClass {
    /// Memory-backed
    Memory,
    /// File-backed
    File,
}

impl StorageClass {
    /// First character of the class name, used in group names.
    pub fn initial(&self) -> char {
        match self {
            StorageClass::Memory => 'M',
            StorageClass::File => 'F',
        }
    }
}

impl Default for StorageClass {
    fn default() -> Self {
        StorageClass::File
    }
}

/// A replication group: a named, ordered peer set with a storage class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftGroup {
    /// Stable group name
    pub name: String,
    /// Member peer IDs
    pub peers: Vec<PeerId>,
    /// Storage class for the group's log
    #[serde(rename = "store")]
    pub storage: StorageClass,
    /// Preferred leader, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred: Option<PeerId>,
}

impl RaftGroup {
    /// Whether `id` is a member of this group.
    pub fn is_member(&self, id: &PeerId) -> bool {
        self.peers.iter().any(|peer| peer == id)
    }
}
