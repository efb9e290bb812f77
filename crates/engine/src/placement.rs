//! Placement planner
//!
//! Pure peer-set selection for new replication groups. Candidates are the
//! meta peers currently reachable through the relay (this server always
//! counts); the chosen subset is shuffled so repeated creates do not pile
//! onto the same peers.

use std::hash::{Hash, Hasher};

use rand::seq::SliceRandom;
use tracing::debug;

use crate::consensus::RaftNode;
use crate::foundation::subjects::encode_token;
use crate::foundation::{PeerId, RaftGroup, StorageClass, StreamConfig};
use crate::relay::Relay;

/// Select `r` distinct peers for a new group. Returns an empty vector when
/// fewer than `r` meta peers are reachable.
pub fn select_peer_group(r: usize, meta: &dyn RaftNode, relay: &dyn Relay) -> Vec<PeerId> {
    let our_id = meta.id();
    let mut candidates: Vec<PeerId> = meta
        .peers()
        .into_iter()
        .map(|peer| peer.id)
        .filter(|id| *id == our_id || relay.is_peer_online(id))
        .collect();

    if candidates.len() < r {
        debug!(
            needed = r,
            reachable = candidates.len(),
            "not enough reachable peers for placement"
        );
        return Vec::new();
    }

    candidates.shuffle(&mut rand::thread_rng());
    candidates.truncate(r);
    candidates
}

/// Group name for a stream's replication group.
pub fn group_name_for_stream(peers: &[PeerId], storage: StorageClass) -> String {
    group_name("S", peers, storage)
}

/// Group name for a consumer's replication group.
pub fn group_name_for_consumer(peers: &[PeerId], storage: StorageClass) -> String {
    group_name("C", peers, storage)
}

fn group_name(prefix: &str, peers: &[PeerId], storage: StorageClass) -> String {
    let token = if peers.len() == 1 {
        peers[0].as_str().to_string()
    } else {
        // Hash of a fresh unique identifier, base-62 encoded.
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        uuid::Uuid::new_v4().hash(&mut hasher);
        encode_token(hasher.finish() >> 1)
    };
    format!("{}-R{}{}-{}", prefix, peers.len(), storage.initial(), token)
}

/// Build the replication group for a new stream, or `None` when placement
/// cannot find enough reachable peers.
pub fn create_group_for_stream(
    config: &StreamConfig,
    meta: &dyn RaftNode,
    relay: &dyn Relay,
) -> Option<RaftGroup> {
    let replicas = config.replication_factor();
    let peers = select_peer_group(replicas, meta, relay);
    if peers.is_empty() {
        return None;
    }
    Some(RaftGroup {
        name: group_name_for_stream(&peers, config.storage),
        peers,
        storage: config.storage,
        preferred: None,
    })
}

/// Build the replication group for a new consumer: the parent stream's
/// peer set under a fresh consumer group name.
pub fn create_group_for_consumer(
    stream_group: &RaftGroup,
    storage: StorageClass,
) -> Option<RaftGroup> {
    if stream_group.peers.is_empty() {
        return None;
    }
    Some(RaftGroup {
        name: group_name_for_consumer(&stream_group.peers, storage),
        peers: stream_group.peers.clone(),
        storage,
        preferred: None,
    })
}
