//! Storage contracts for the weir engine
//!
//! This crate defines the narrow storage interfaces the replication layer
//! writes through: an append-only message store with sequence numbers and
//! tombstones, and a consumer store holding replicated delivery/ack state.
//! In-memory reference implementations back tests and memory-class streams;
//! durable backends implement the same traits elsewhere.

mod consumer;
mod memory;
mod message;

pub use consumer::{ConsumerState, ConsumerStore, SequencePair};
pub use memory::{MemoryConsumerStore, MemoryMessageStore};
pub use message::{MessageStore, StoredMessage, StreamState};

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Storage backend error
    #[error("storage backend error: {0}")]
    Backend(String),

    /// No message at the requested sequence
    #[error("no message found for sequence {0}")]
    NoMessage(u64),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
