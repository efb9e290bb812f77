//! Wire codecs for replicated stream and consumer entries
//!
//! Stream messages are framed in little-endian binary because they dominate
//! log volume; consumer delivery/ack updates use varints. Both framings are
//! wire contracts shared with the catch-up protocol.

use bytes::Bytes;

use crate::error::{EngineResult, Error};

use super::entry::EntryOp;

/// Fixed framing overhead of a stream message entry, excluding the op tag:
/// `u64 lseq + u64 ts + u16 sl + u16 rl + u16 hl + u32 ml`.
const STREAM_MSG_OVERHEAD: usize = 8 + 8 + 2 + 2 + 2 + 4;

/// A decoded replicated stream message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMsg {
    /// Publish subject
    pub subject: String,
    /// Reply subject, empty when none
    pub reply: String,
    /// Raw header block, empty when none
    pub headers: Bytes,
    /// Message payload
    pub payload: Bytes,
    /// Stream sequence at propose time; the message lands at `lseq + 1`
    pub lseq: u64,
    /// Publish timestamp, nanoseconds since the epoch
    pub timestamp: i64,
}

/// Encode a stream message entry, including the leading op tag.
pub fn encode_stream_msg(
    subject: &str,
    reply: &str,
    headers: &[u8],
    payload: &[u8],
    lseq: u64,
    timestamp: i64,
) -> EngineResult<Bytes> {
    if subject.len() > u16::MAX as usize
        || reply.len() > u16::MAX as usize
        || headers.len() > u16::MAX as usize
    {
        return Err(Error::decode("stream msg field exceeds u16 length"));
    }
    if payload.len() > u32::MAX as usize {
        return Err(Error::decode("stream msg payload exceeds u32 length"));
    }

    let mut buf = Vec::with_capacity(
        1 + STREAM_MSG_OVERHEAD + subject.len() + reply.len() + headers.len() + payload.len(),
    );
    buf.push(EntryOp::StreamMsg as u8);
    buf.extend_from_slice(&lseq.to_le_bytes());
    buf.extend_from_slice(&(timestamp as u64).to_le_bytes());
    buf.extend_from_slice(&(subject.len() as u16).to_le_bytes());
    buf.extend_from_slice(subject.as_bytes());
    buf.extend_from_slice(&(reply.len() as u16).to_le_bytes());
    buf.extend_from_slice(reply.as_bytes());
    buf.extend_from_slice(&(headers.len() as u16).to_le_bytes());
    buf.extend_from_slice(headers);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(Bytes::from(buf))
}

/// Decode a stream message entry body (the buffer after the op tag).
pub fn decode_stream_msg(buf: &[u8]) -> EngineResult<StreamMsg> {
    let bad = || Error::decode("bad replicated stream msg");

    if buf.len() < STREAM_MSG_OVERHEAD {
        return Err(bad());
    }
    let lseq = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let timestamp = u64::from_le_bytes(buf[8..16].try_into().unwrap()) as i64;
    let mut buf = &buf[16..];

    fn take_u16<'a>(buf: &mut &'a [u8]) -> Option<&'a [u8]> {
        if buf.len() < 2 {
            return None;
        }
        let len = u16::from_le_bytes(buf[..2].try_into().unwrap()) as usize;
        *buf = &buf[2..];
        if buf.len() < len {
            return None;
        }
        let field = &buf[..len];
        *buf = &buf[len..];
        Some(field)
    }

    let subject = std::str::from_utf8(take_u16(&mut buf).ok_or_else(bad)?)
        .map_err(|_| bad())?
        .to_string();
    let reply = std::str::from_utf8(take_u16(&mut buf).ok_or_else(bad)?)
        .map_err(|_| bad())?
        .to_string();
    let headers = Bytes::copy_from_slice(take_u16(&mut buf).ok_or_else(bad)?);

    if buf.len() < 4 {
        return Err(bad());
    }
    let ml = u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize;
    let buf = &buf[4..];
    if buf.len() < ml {
        return Err(bad());
    }
    let payload = Bytes::copy_from_slice(&buf[..ml]);

    Ok(StreamMsg {
        subject,
        reply,
        headers,
        payload,
        lseq,
        timestamp,
    })
}

/// Append `v` to `buf` as an unsigned LEB128 varint.
pub fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

/// Read an unsigned varint, returning the value and bytes consumed.
pub fn uvarint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in buf.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
    }
    None
}

/// Append `v` to `buf` as a zig-zag signed varint.
pub fn put_varint(buf: &mut Vec<u8>, v: i64) {
    put_uvarint(buf, ((v << 1) ^ (v >> 63)) as u64);
}

/// Read a zig-zag signed varint, returning the value and bytes consumed.
pub fn varint(buf: &[u8]) -> Option<(i64, usize)> {
    let (uv, n) = uvarint(buf)?;
    Some((((uv >> 1) as i64) ^ -((uv & 1) as i64), n))
}

/// Encode a delivered update entry, including the op tag.
pub fn encode_delivered_update(dseq: u64, sseq: u64, delivery_count: u64, timestamp: i64) -> Bytes {
    let mut buf = Vec::with_capacity(1 + 4 * 10);
    buf.push(EntryOp::UpdateDelivered as u8);
    put_uvarint(&mut buf, dseq);
    put_uvarint(&mut buf, sseq);
    put_uvarint(&mut buf, delivery_count);
    put_varint(&mut buf, timestamp);
    Bytes::from(buf)
}

/// Decode a delivered update body as `(dseq, sseq, delivery_count, ts)`.
pub fn decode_delivered_update(buf: &[u8]) -> EngineResult<(u64, u64, u64, i64)> {
    let bad = || Error::decode("bad replicated delivered update");
    let (dseq, n) = uvarint(buf).ok_or_else(bad)?;
    let buf = &buf[n..];
    let (sseq, n) = uvarint(buf).ok_or_else(bad)?;
    let buf = &buf[n..];
    let (dc, n) = uvarint(buf).ok_or_else(bad)?;
    let buf = &buf[n..];
    let (ts, _) = varint(buf).ok_or_else(bad)?;
    Ok((dseq, sseq, dc, ts))
}

/// Encode an ack update entry, including the op tag.
pub fn encode_ack_update(dseq: u64, sseq: u64) -> Bytes {
    let mut buf = Vec::with_capacity(1 + 2 * 10);
    buf.push(EntryOp::UpdateAcks as u8);
    put_uvarint(&mut buf, dseq);
    put_uvarint(&mut buf, sseq);
    Bytes::from(buf)
}

/// Decode an ack update body as `(dseq, sseq)`.
pub fn decode_ack_update(buf: &[u8]) -> EngineResult<(u64, u64)> {
    let bad = || Error::decode("bad replicated ack update");
    let (dseq, n) = uvarint(buf).ok_or_else(bad)?;
    let (sseq, _) = uvarint(&buf[n..]).ok_or_else(bad)?;
    Ok((dseq, sseq))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_msg_round_trip() {
        let encoded = encode_stream_msg(
            "orders.created",
            "_INBOX.reply.1",
            b"X-Trace-Id: 7f3a\r\n",
            b"hello world",
            42,
            1_700_000_000_000_000_000,
        )
        .unwrap();
        assert_eq!(encoded[0], EntryOp::StreamMsg as u8);

        let decoded = decode_stream_msg(&encoded[1..]).unwrap();
        assert_eq!(decoded.subject, "orders.created");
        assert_eq!(decoded.reply, "_INBOX.reply.1");
        assert_eq!(&decoded.headers[..], b"X-Trace-Id: 7f3a\r\n");
        assert_eq!(&decoded.payload[..], b"hello world");
        assert_eq!(decoded.lseq, 42);
        assert_eq!(decoded.timestamp, 1_700_000_000_000_000_000);
    }

    #[test]
    fn stream_msg_empty_fields_round_trip() {
        let encoded = encode_stream_msg("a", "", b"", b"", 0, 0).unwrap();
        let decoded = decode_stream_msg(&encoded[1..]).unwrap();
        assert_eq!(decoded.subject, "a");
        assert!(decoded.reply.is_empty());
        assert!(decoded.headers.is_empty());
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn stream_msg_short_buffer_is_rejected() {
        assert!(decode_stream_msg(&[0u8; 10]).is_err());

        // Truncate a valid encoding mid-payload.
        let encoded = encode_stream_msg("foo", "", b"", b"payload", 1, 1).unwrap();
        assert!(decode_stream_msg(&encoded[1..encoded.len() - 3]).is_err());
    }

    #[test]
    fn stream_msg_oversize_subject_is_rejected() {
        let subject = "s".repeat(u16::MAX as usize + 1);
        assert!(encode_stream_msg(&subject, "", b"", b"", 0, 0).is_err());
    }

    #[test]
    fn delivered_update_round_trip() {
        let encoded = encode_delivered_update(7, 19, 2, -5);
        assert_eq!(encoded[0], EntryOp::UpdateDelivered as u8);
        let (dseq, sseq, dc, ts) = decode_delivered_update(&encoded[1..]).unwrap();
        assert_eq!((dseq, sseq, dc, ts), (7, 19, 2, -5));
    }

    #[test]
    fn ack_update_round_trip() {
        let encoded = encode_ack_update(u64::MAX, 1);
        let (dseq, sseq) = decode_ack_update(&encoded[1..]).unwrap();
        assert_eq!((dseq, sseq), (u64::MAX, 1));
    }

    #[test]
    fn truncated_varints_are_rejected() {
        assert!(decode_delivered_update(&[0x80]).is_err());
        assert!(decode_ack_update(&[0x80, 0x80]).is_err());
    }
}
