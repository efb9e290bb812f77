//! Follower-side catch-up receiver

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use weir_storage::StreamState;

use crate::foundation::message::decode_stream_msg;
use crate::foundation::{EntryOp, MsgDeleteProposal, subjects};
use crate::relay::{Delivery, Relay, Subscription};
use crate::stream::ReplicatedStream;

use super::SyncRequest;

impl ReplicatedStream {
    /// Handle a consensus-level stream snapshot: align the store with the
    /// snapshot's floor and tombstones, then, if the local log is behind,
    /// kick off a catch-up install against the stream's sync inbox.
    pub(crate) async fn process_replication_snapshot(self: &Arc<Self>, buf: &[u8]) {
        let snap: StreamState = match serde_json::from_slice(buf) {
            Ok(snap) => snap,
            Err(err) => {
                warn!(stream = %self.name(), %err, "bad stream snapshot entry");
                return;
            }
        };

        // Deletes and floor moves first, against our current state.
        let state = self.store().state().await;
        if snap.first_seq > state.first_seq {
            if let Err(err) = self.store().compact(snap.first_seq).await {
                warn!(stream = %self.name(), %err, "snapshot compaction failed");
            }
        }
        for &seq in &snap.deleted {
            if seq <= state.last_seq {
                let _ = self.store().remove(seq).await;
            }
        }

        let state = self.store().state().await;
        self.set_lseq(state.last_seq);

        if state.last_seq >= snap.last_seq {
            debug!(stream = %self.name(), "already caught up with snapshot");
            return;
        }

        let sreq = SyncRequest {
            first_seq: state.last_seq + 1,
            last_seq: snap.last_seq,
        };
        info!(
            stream = %self.name(),
            first = sreq.first_seq,
            last = sreq.last_seq,
            "requesting catch-up"
        );

        let reply = subjects::sync_reply_subject();
        let sub = match self.relay().subscribe(&reply) {
            Ok(sub) => sub,
            Err(err) => {
                warn!(stream = %self.name(), %err, "cannot subscribe for catch-up replies");
                return;
            }
        };

        let request = match serde_json::to_vec(&sreq) {
            Ok(json) => Bytes::from(json),
            Err(err) => {
                warn!(stream = %self.name(), %err, "cannot encode catch-up request");
                self.relay().unsubscribe(sub.id);
                return;
            }
        };

        // One install at a time; a newer snapshot supersedes the old run.
        let handle = tokio::spawn(run_catchup_receiver(self.clone(), sub, snap.last_seq));
        if let Some(previous) = self.catchup.lock().replace(handle) {
            previous.abort();
        }

        self.sendq().send(self.sync_subject().to_string(), reply, request);
    }
}

/// Apply replayed messages from the leader until the target sequence is
/// reached, acking each delivery for flow control.
async fn run_catchup_receiver(
    stream: Arc<ReplicatedStream>,
    mut sub: Subscription,
    target_last: u64,
) {
    loop {
        tokio::select! {
            _ = stream.quit().cancelled() => break,
            maybe = sub.rx.recv() => match maybe {
                None => break,
                Some(delivery) => {
                    handle_sync_response(&stream, &delivery).await;
                    if stream.lseq() >= target_last {
                        info!(stream = %stream.name(), last = target_last, "catch-up installed");
                        break;
                    }
                }
            }
        }
    }
    stream.relay().unsubscribe(sub.id);
}

async fn handle_sync_response(stream: &Arc<ReplicatedStream>, delivery: &Delivery) {
    let Some((&tag, body)) = delivery.payload.split_first() else {
        warn!(stream = %stream.name(), "empty catch-up response");
        return;
    };

    match EntryOp::from_u8(tag) {
        Some(EntryOp::StreamMsg) => match decode_stream_msg(body) {
            Ok(msg) => match stream.ingest(&msg).await {
                Ok(_) => {}
                Err(err) if err.is_last_seq_mismatch() => {
                    warn!(stream = %stream.name(), lseq = msg.lseq, "out-of-order replay, skipping");
                }
                Err(err) => {
                    warn!(stream = %stream.name(), %err, "failed to apply replayed message");
                }
            },
            Err(err) => {
                warn!(stream = %stream.name(), %err, "bad replayed message");
            }
        },
        Some(EntryOp::DeleteMsg) => match serde_json::from_slice::<MsgDeleteProposal>(body) {
            Ok(md) => {
                // A hole in the leader's store; record the tombstone and
                // move past it.
                if let Err(err) = stream.store().skip(md.seq).await {
                    warn!(stream = %stream.name(), %err, "failed to skip sequence");
                }
                let state = stream.store().state().await;
                stream.set_lseq(state.last_seq);
            }
            Err(err) => {
                warn!(stream = %stream.name(), %err, "bad delete marker");
            }
        },
        _ => {
            warn!(stream = %stream.name(), tag, "unexpected catch-up response op");
        }
    }

    // Ack for flow control; the payload size rides in the reply subject.
    if !delivery.reply.is_empty() {
        stream.sendq().send(delivery.reply.clone(), "", Bytes::new());
    }
}
