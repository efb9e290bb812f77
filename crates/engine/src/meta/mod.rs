//! Meta controller
//!
//! The per-server singleton holding the authoritative assignment of
//! streams and consumers to replication groups, backed by the meta
//! consensus group. Every peer applies the same committed assignment
//! stream; members of an assigned group additionally run the resource
//! locally.

mod controller;
mod snapshot;

pub use controller::MetaController;
pub(crate) use snapshot::{decode_meta_snapshot, encode_meta_snapshot};
