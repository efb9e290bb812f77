//! Append-only message store contract
//!
//! Streams write through this interface from their apply loops. Sequences
//! are dense and assigned by the store; erased messages leave tombstones so
//! replicas can reconcile deletes out of band.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::StorageResult;

/// A message held by a stream store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Subject the message was published on
    pub subject: String,
    /// Raw header block, empty when none
    pub headers: Bytes,
    /// Message payload
    pub payload: Bytes,
    /// Sequence assigned by the store
    pub sequence: u64,
    /// Receive timestamp, nanoseconds since the epoch
    pub timestamp: i64,
}

/// Point-in-time state of a stream store.
///
/// This is also the wire shape replicated to followers inside consensus
/// snapshot entries, so field names are part of the sync protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamState {
    /// Lowest sequence still held (one past the last purge/compaction)
    pub first_seq: u64,
    /// Highest sequence ever assigned
    pub last_seq: u64,
    /// Number of live messages
    pub messages: u64,
    /// Total payload bytes of live messages
    pub bytes: u64,
    /// Sequences erased from within `[first_seq, last_seq]`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted: Vec<u64>,
}

/// Message store contract for a single stream.
///
/// One writer per store: the stream's apply loop. Readers (catch-up senders,
/// info requests) may call concurrently.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Current store state.
    async fn state(&self) -> StreamState;

    /// Append a message, assigning the next sequence. Returns the assigned
    /// sequence.
    async fn append(
        &self,
        subject: &str,
        headers: &[u8],
        payload: &[u8],
        timestamp: i64,
    ) -> StorageResult<u64>;

    /// Load the message at `seq`. Fails with [`StorageError::NoMessage`]
    /// when the sequence was erased, compacted away, or never assigned.
    ///
    /// [`StorageError::NoMessage`]: crate::StorageError::NoMessage
    async fn load(&self, seq: u64) -> StorageResult<StoredMessage>;

    /// Erase the message at `seq`, leaving a tombstone. Returns whether a
    /// message was actually removed.
    async fn remove(&self, seq: u64) -> StorageResult<bool>;

    /// Record `seq` as skipped: a tombstone with the last sequence advanced
    /// past it. Used when replaying a range that has holes.
    async fn skip(&self, seq: u64) -> StorageResult<()>;

    /// Drop all messages below `first_seq` and raise the floor to it.
    async fn compact(&self, first_seq: u64) -> StorageResult<u64>;

    /// Remove every message. Returns the number purged.
    async fn purge(&self) -> StorageResult<u64>;
}
