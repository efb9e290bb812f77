//! Clustered stream-and-consumer coordination core
//!
//! This crate coordinates a replicated publish/subscribe cluster:
//! - a per-server meta controller holding the authoritative assignment of
//!   streams and consumers to peer groups;
//! - per-stream and per-consumer replicators applying committed log
//!   entries to local stores;
//! - a flow-controlled catch-up protocol bringing lagging replicas back up
//!   to date after snapshot-driven log truncation.
//!
//! Consensus, storage, and transport are narrow capability contracts;
//! in-process implementations back tests and single-process clusters.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Post-snapshot catch-up protocol
pub mod catchup;

/// Engine configuration
pub mod config;

/// Consensus node contract and in-process implementation
pub mod consensus;

/// Consumer replicator
pub mod consumer;

/// Engine lifecycle
pub(crate) mod engine;

/// Error types
pub mod error;

/// Foundation types: assignments, groups, entries, wire codecs
pub mod foundation;

/// Request gateway and API envelopes
pub mod gateway;

/// Meta controller
pub mod meta;

/// Placement planner
pub mod placement;

/// Transport relay contract
pub mod relay;

/// Stream replicator
pub mod stream;

pub use {
    config::ClusterConfig,
    engine::Engine,
    error::{EngineResult, Error, ErrorKind},
    foundation::{
        ClientInfo, ConsumerAssignment, ConsumerConfig, PeerId, RaftGroup, StorageClass,
        StreamAssignment, StreamConfig,
    },
    gateway::RequestGateway,
};
