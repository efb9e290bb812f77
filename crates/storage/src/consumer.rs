//! Consumer store contract
//!
//! Holds the replicated delivery and acknowledgement state of a single
//! consumer. The replication layer applies committed delivered/ack updates
//! through this interface; a full-state write replaces everything at once.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::StorageResult;

/// A consumer-sequence / stream-sequence pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencePair {
    /// Consumer-local delivery sequence
    pub consumer_seq: u64,
    /// Underlying stream sequence
    pub stream_seq: u64,
}

/// Complete consumer state, replaceable as a unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerState {
    /// Highest delivered pair
    pub delivered: SequencePair,
    /// Highest contiguously acknowledged pair
    pub ack_floor: SequencePair,
    /// Outstanding deliveries: stream sequence to consumer sequence
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pending: BTreeMap<u64, u64>,
    /// Redelivery counts for messages delivered more than once
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub redelivered: BTreeMap<u64, u64>,
}

impl ConsumerState {
    /// Number of deliveries awaiting acknowledgement.
    pub fn num_ack_pending(&self) -> usize {
        self.pending.len()
    }
}

/// Store contract for a single consumer's replicated state.
#[async_trait]
pub trait ConsumerStore: Send + Sync {
    /// Current state.
    async fn state(&self) -> ConsumerState;

    /// Record a delivery. `delivery_count` of 1 is a first delivery;
    /// higher counts are redeliveries.
    async fn update_delivered(
        &self,
        dseq: u64,
        sseq: u64,
        delivery_count: u64,
        timestamp: i64,
    ) -> StorageResult<()>;

    /// Record an acknowledgement, advancing the ack floor when the pending
    /// set allows.
    async fn update_acks(&self, dseq: u64, sseq: u64) -> StorageResult<()>;

    /// Replace the full state.
    async fn replace(&self, state: ConsumerState) -> StorageResult<()>;
}
