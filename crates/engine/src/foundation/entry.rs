//! Replicated log entry types
//!
//! Every normal entry starts with a one-byte op tag; the rest of the
//! payload is opcode-specific. Snapshot entries carry serialized state
//! installed out of band by the consensus layer.

use bytes::Bytes;

/// Operation tag of a normal log entry.
///
/// Tags are a wire contract shared by every peer; renumbering is a
/// protocol break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryOp {
    /// Meta: assign a stream to a peer group (JSON stream assignment)
    AssignStream = 0,
    /// Meta: assign a consumer (JSON consumer assignment)
    AssignConsumer = 1,
    /// Meta: remove a stream assignment
    RemoveStream = 2,
    /// Meta: remove a consumer assignment
    RemoveConsumer = 3,
    /// Stream: a published message (binary framing)
    StreamMsg = 4,
    /// Stream: purge all messages (JSON)
    PurgeStream = 5,
    /// Stream: erase one message by sequence (JSON)
    DeleteMsg = 6,
    /// Consumer: delivered update (varints)
    UpdateDelivered = 7,
    /// Consumer: ack update (varints)
    UpdateAcks = 8,
    /// Consumer: full state replacement
    UpdateFullState = 9,
}

impl EntryOp {
    /// Decode an op tag. Returns `None` for tags this build does not know,
    /// which callers must treat as a protocol incompatibility.
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::AssignStream),
            1 => Some(Self::AssignConsumer),
            2 => Some(Self::RemoveStream),
            3 => Some(Self::RemoveConsumer),
            4 => Some(Self::StreamMsg),
            5 => Some(Self::PurgeStream),
            6 => Some(Self::DeleteMsg),
            7 => Some(Self::UpdateDelivered),
            8 => Some(Self::UpdateAcks),
            9 => Some(Self::UpdateFullState),
            _ => None,
        }
    }
}

/// Kind of a committed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    /// Normal op-tagged entry
    Normal,
    /// Consensus-level snapshot of replicated state
    Snapshot,
}

/// A single committed entry.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Entry kind
    pub entry_type: EntryType,
    /// Raw entry data; for normal entries byte 0 is the op tag
    pub data: Bytes,
}

impl Entry {
    /// A normal entry wrapping already-encoded data.
    pub fn normal(data: impl Into<Bytes>) -> Self {
        Self {
            entry_type: EntryType::Normal,
            data: data.into(),
        }
    }

    /// A snapshot entry.
    pub fn snapshot(data: impl Into<Bytes>) -> Self {
        Self {
            entry_type: EntryType::Snapshot,
            data: data.into(),
        }
    }
}

/// Encode an op-tagged entry whose body is the JSON of `value`.
pub fn encode_json_entry<T: serde::Serialize>(
    op: EntryOp,
    value: &T,
) -> crate::error::EngineResult<Bytes> {
    let mut buf = vec![op as u8];
    serde_json::to_writer(&mut buf, value)?;
    Ok(Bytes::from(buf))
}

/// A batch of entries committed at a consensus index.
#[derive(Debug, Clone)]
pub struct CommittedEntry {
    /// Commit index to acknowledge back to the node after applying
    pub index: u64,
    /// Entries committed at this index
    pub entries: Vec<Entry>,
}
