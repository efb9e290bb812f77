//! Leader-side catch-up sender

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::EngineResult;
use crate::foundation::message::encode_stream_msg;
use crate::foundation::{EntryOp, MsgDeleteProposal, encode_json_entry, subjects};
use crate::relay::Relay;
use crate::stream::ReplicatedStream;

use super::SyncRequest;

/// Ceiling on bytes in flight before the sender parks for acks.
const MAX_OUT: u64 = 48 * 1024 * 1024;

/// Abort when no ack arrives for this long.
const ACTIVITY_INTERVAL: Duration = Duration::from_millis(500);

/// Stream the requested range to a follower's reply inbox, strictly in
/// ascending sequence order, parking whenever the flow-control window
/// fills. Runs as its own task per sync request.
pub(crate) async fn run_catchup(
    stream: Arc<ReplicatedStream>,
    send_subject: String,
    sreq: SyncRequest,
) {
    let relay = stream.relay().clone();
    let ack_subject = subjects::sync_ack_subject();
    let mut ack_sub = match relay.subscribe(&ack_subject) {
        Ok(sub) => sub,
        Err(err) => {
            warn!(stream = %stream.name(), %err, "cannot subscribe for catch-up acks");
            return;
        }
    };

    let mut seq = sreq.first_seq;
    let last = sreq.last_seq;
    let mut out: u64 = 0;

    if let Err(err) =
        send_next_batch(&stream, &send_subject, &ack_subject, &mut seq, last, &mut out).await
    {
        warn!(stream = %stream.name(), %err, "catch-up sender failed");
        relay.unsubscribe(ack_sub.id);
        return;
    }

    loop {
        tokio::select! {
            _ = stream.quit().cancelled() => break,
            _ = tokio::time::sleep(ACTIVITY_INTERVAL) => {
                warn!(stream = %stream.name(), at = seq, "catch-up stalled, aborting");
                break;
            }
            maybe = ack_sub.rx.recv() => match maybe {
                None => break,
                Some(ack) => {
                    let size = subjects::parse_ack_size(&ack.subject).unwrap_or(0);
                    out = out.saturating_sub(size);
                    if seq > last {
                        info!(stream = %stream.name(), last, "catch-up complete");
                        break;
                    }
                    if let Err(err) =
                        send_next_batch(&stream, &send_subject, &ack_subject, &mut seq, last, &mut out)
                            .await
                    {
                        warn!(stream = %stream.name(), %err, "catch-up sender failed");
                        break;
                    }
                }
            }
        }
    }

    relay.unsubscribe(ack_sub.id);
}

/// Send messages until the range is exhausted or the window fills. A store
/// miss inside the range becomes an explicit delete marker so the follower
/// still advances past it.
async fn send_next_batch(
    stream: &ReplicatedStream,
    send_subject: &str,
    ack_subject: &str,
    seq: &mut u64,
    last: u64,
    out: &mut u64,
) -> EngineResult<()> {
    while *seq <= last && *out <= MAX_OUT {
        let encoded = match stream.store().load(*seq).await {
            Ok(msg) => encode_stream_msg(
                &msg.subject,
                "",
                &msg.headers,
                &msg.payload,
                *seq - 1,
                msg.timestamp,
            )?,
            Err(weir_storage::StorageError::NoMessage(_)) => encode_json_entry(
                EntryOp::DeleteMsg,
                &MsgDeleteProposal {
                    client: None,
                    stream: stream.name().to_string(),
                    seq: *seq,
                    reply: String::new(),
                },
            )?,
            Err(err) => return Err(err.into()),
        };

        // Size rides in the ack subject for flow control.
        let reply = subjects::ack_reply_with_size(ack_subject, encoded.len());
        *out += encoded.len() as u64;
        stream.sendq().send(send_subject, reply, encoded);
        *seq += 1;
    }
    Ok(())
}
