//! Post-snapshot catch-up protocol
//!
//! When a follower's consensus node delivers a stream snapshot, the
//! follower reconciles tombstones, then asks the leader to replay the
//! sequence range it is missing over a dedicated reply inbox. The leader
//! streams messages in ascending order under a byte-based flow-control
//! window; each delivery is acked on a subject carrying its payload size.

mod receiver;
mod sender;

use serde::{Deserialize, Serialize};

pub(crate) use sender::run_catchup;

/// Request to replay `[first_seq, last_seq]` to a lagging replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// First sequence the follower is missing
    pub first_seq: u64,
    /// Last sequence of the leader's snapshot
    pub last_seq: u64,
}
