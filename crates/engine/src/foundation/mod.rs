//! Foundation types shared across the coordination core

mod entry;
mod group;
mod models;
mod types;

pub mod message;
pub mod subjects;

pub use entry::{encode_json_entry, CommittedEntry, Entry, EntryOp, EntryType};
pub use group::{RaftGroup, StorageClass};
pub use models::{
    ClientInfo, ConsumerAssignment, ConsumerConfig, MsgDeleteProposal, PurgeProposal,
    StreamAssignment, StreamConfig, WritableStreamAssignment,
};
pub use types::PeerId;
