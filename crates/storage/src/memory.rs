//! In-memory reference stores
//!
//! Back memory-class streams and the test suites. Both stores keep their
//! data under short-lived parking_lot locks; the async trait methods never
//! hold a lock across an await point.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::consumer::{ConsumerState, ConsumerStore};
use crate::message::{MessageStore, StoredMessage, StreamState};
use crate::{StorageError, StorageResult};

#[derive(Debug, Default)]
struct MemoryLog {
    messages: BTreeMap<u64, StoredMessage>,
    first_seq: u64,
    last_seq: u64,
    bytes: u64,
    deleted: BTreeSet<u64>,
}

impl MemoryLog {
    fn new() -> Self {
        Self {
            first_seq: 1,
            ..Self::default()
        }
    }

    fn state(&self) -> StreamState {
        StreamState {
            first_seq: self.first_seq,
            last_seq: self.last_seq,
            messages: self.messages.len() as u64,
            bytes: self.bytes,
            deleted: self.deleted.iter().copied().collect(),
        }
    }
}

/// In-memory [`MessageStore`].
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    log: RwLock<MemoryLog>,
}

impl MemoryMessageStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            log: RwLock::new(MemoryLog::new()),
        }
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn state(&self) -> StreamState {
        self.log.read().state()
    }

    async fn append(
        &self,
        subject: &str,
        headers: &[u8],
        payload: &[u8],
        timestamp: i64,
    ) -> StorageResult<u64> {
        let mut log = self.log.write();
        let seq = log.last_seq + 1;
        log.bytes += payload.len() as u64;
        log.messages.insert(
            seq,
            StoredMessage {
                subject: subject.to_string(),
                headers: Bytes::copy_from_slice(headers),
                payload: Bytes::copy_from_slice(payload),
                sequence: seq,
                timestamp,
            },
        );
        log.last_seq = seq;
        Ok(seq)
    }

    async fn load(&self, seq: u64) -> StorageResult<StoredMessage> {
        self.log
            .read()
            .messages
            .get(&seq)
            .cloned()
            .ok_or(StorageError::NoMessage(seq))
    }

    async fn remove(&self, seq: u64) -> StorageResult<bool> {
        let mut log = self.log.write();
        match log.messages.remove(&seq) {
            Some(msg) => {
                log.bytes -= msg.payload.len() as u64;
                log.deleted.insert(seq);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn skip(&self, seq: u64) -> StorageResult<()> {
        let mut log = self.log.write();
        if log.messages.remove(&seq).is_some() {
            log.deleted.insert(seq);
        } else if seq > log.last_seq {
            log.deleted.insert(seq);
        }
        if seq > log.last_seq {
            log.last_seq = seq;
        }
        Ok(())
    }

    async fn compact(&self, first_seq: u64) -> StorageResult<u64> {
        let mut log = self.log.write();
        if first_seq <= log.first_seq {
            return Ok(0);
        }
        let keep = log.messages.split_off(&first_seq);
        let dropped = std::mem::replace(&mut log.messages, keep);
        let mut removed = 0;
        for msg in dropped.values() {
            log.bytes -= msg.payload.len() as u64;
            removed += 1;
        }
        log.deleted = log.deleted.split_off(&first_seq);
        log.first_seq = first_seq;
        if log.last_seq + 1 < first_seq {
            log.last_seq = first_seq - 1;
        }
        Ok(removed)
    }

    async fn purge(&self) -> StorageResult<u64> {
        let mut log = self.log.write();
        let purged = log.messages.len() as u64;
        log.messages.clear();
        log.deleted.clear();
        log.bytes = 0;
        log.first_seq = log.last_seq + 1;
        Ok(purged)
    }
}

/// In-memory [`ConsumerStore`].
#[derive(Debug, Default)]
pub struct MemoryConsumerStore {
    state: RwLock<ConsumerState>,
}

impl MemoryConsumerStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConsumerStore for MemoryConsumerStore {
    async fn state(&self) -> ConsumerState {
        self.state.read().clone()
    }

    async fn update_delivered(
        &self,
        dseq: u64,
        sseq: u64,
        delivery_count: u64,
        _timestamp: i64,
    ) -> StorageResult<()> {
        let mut state = self.state.write();
        if dseq > state.delivered.consumer_seq {
            state.delivered.consumer_seq = dseq;
        }
        if sseq > state.delivered.stream_seq {
            state.delivered.stream_seq = sseq;
        }
        state.pending.insert(sseq, dseq);
        if delivery_count > 1 {
            state.redelivered.insert(sseq, delivery_count);
        }
        Ok(())
    }

    async fn update_acks(&self, _dseq: u64, sseq: u64) -> StorageResult<()> {
        let mut state = self.state.write();
        state.pending.remove(&sseq);
        state.redelivered.remove(&sseq);
        if state.pending.is_empty() {
            // Nothing outstanding, the floor catches up to delivered.
            state.ack_floor = state.delivered;
        } else {
            // Floor sits just below the oldest outstanding delivery.
            let (&min_sseq, &min_dseq) = state.pending.iter().next().unwrap();
            state.ack_floor.consumer_seq = min_dseq.saturating_sub(1);
            state.ack_floor.stream_seq = min_sseq.saturating_sub(1);
        }
        Ok(())
    }

    async fn replace(&self, state: ConsumerState) -> StorageResult<()> {
        *self.state.write() = state;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_assigns_dense_sequences() {
        let store = MemoryMessageStore::new();
        for i in 1..=5u64 {
            let seq = store.append("foo", b"", b"data", 0).await.unwrap();
            assert_eq!(seq, i);
        }
        let state = store.state().await;
        assert_eq!(state.first_seq, 1);
        assert_eq!(state.last_seq, 5);
        assert_eq!(state.messages, 5);
    }

    #[tokio::test]
    async fn remove_leaves_tombstone() {
        let store = MemoryMessageStore::new();
        for _ in 0..3 {
            store.append("foo", b"", b"x", 0).await.unwrap();
        }
        assert!(store.remove(2).await.unwrap());
        assert!(!store.remove(2).await.unwrap());
        let state = store.state().await;
        assert_eq!(state.messages, 2);
        assert_eq!(state.deleted, vec![2]);
        assert!(matches!(
            store.load(2).await,
            Err(StorageError::NoMessage(2))
        ));
    }

    #[tokio::test]
    async fn compact_raises_floor_past_empty_tail() {
        let store = MemoryMessageStore::new();
        for _ in 0..4 {
            store.append("foo", b"", b"x", 0).await.unwrap();
        }
        store.compact(3).await.unwrap();
        let state = store.state().await;
        assert_eq!(state.first_seq, 3);
        assert_eq!(state.last_seq, 4);
        assert_eq!(state.messages, 2);

        // Compacting past the end leaves an empty store with a raised floor.
        store.compact(10).await.unwrap();
        let state = store.state().await;
        assert_eq!(state.first_seq, 10);
        assert_eq!(state.last_seq, 9);
        assert_eq!(state.messages, 0);
    }

    #[tokio::test]
    async fn purge_resets_to_empty_after_last() {
        let store = MemoryMessageStore::new();
        for _ in 0..10 {
            store.append("foo", b"", b"x", 0).await.unwrap();
        }
        assert_eq!(store.purge().await.unwrap(), 10);
        let state = store.state().await;
        assert_eq!(state.first_seq, 11);
        assert_eq!(state.last_seq, 10);
        assert_eq!(state.messages, 0);
    }

    #[tokio::test]
    async fn ack_floor_tracks_pending() {
        let store = MemoryConsumerStore::new();
        for i in 1..=3u64 {
            store.update_delivered(i, i, 1, 0).await.unwrap();
        }
        store.update_acks(2, 2).await.unwrap();
        let state = store.state().await;
        // Seq 1 still pending, floor stays below it.
        assert_eq!(state.ack_floor.stream_seq, 0);
        store.update_acks(1, 1).await.unwrap();
        store.update_acks(3, 3).await.unwrap();
        let state = store.state().await;
        assert_eq!(state.ack_floor, state.delivered);
        assert_eq!(state.num_ack_pending(), 0);
    }
}
