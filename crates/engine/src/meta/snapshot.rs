//! Meta snapshot codec
//!
//! The full assignment map serializes as a JSON array of writable stream
//! assignments, gzip-compressed. Empty state produces no snapshot at all.

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::{EngineResult, Error};
use crate::foundation::WritableStreamAssignment;

/// Encode assignments into the compressed snapshot blob.
pub(crate) fn encode_meta_snapshot(
    assignments: &[WritableStreamAssignment],
) -> EngineResult<Bytes> {
    let json = serde_json::to_vec(assignments)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|err| Error::storage(format!("snapshot compression failed: {err}")))?;
    let compressed = encoder
        .finish()
        .map_err(|err| Error::storage(format!("snapshot compression failed: {err}")))?;
    Ok(Bytes::from(compressed))
}

/// Decode a snapshot blob. Zero bytes decode as empty state.
pub(crate) fn decode_meta_snapshot(buf: &[u8]) -> EngineResult<Vec<WritableStreamAssignment>> {
    if buf.is_empty() {
        return Ok(Vec::new());
    }
    let mut decoder = GzDecoder::new(buf);
    let mut json = Vec::new();
    decoder
        .read_to_end(&mut json)
        .map_err(|err| Error::decode(format!("snapshot decompression failed: {err}")))?;
    Ok(serde_json::from_slice(&json)?)
}
