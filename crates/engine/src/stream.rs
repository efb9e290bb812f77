//! Stream replicator
//!
//! One `ReplicatedStream` exists per stream assignment whose group includes
//! this server. The leader turns inbound publishes into log proposals; the
//! apply path commits entries to the local store on every member. A monitor
//! task per stream drives the apply and leadership channels and services
//! the stream's catch-up sync inbox.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weir_storage::{MessageStore, StreamState};

use crate::consensus::{NodeChannels, RaftNode};
use crate::consumer::ReplicatedConsumer;
use crate::error::{EngineResult, Error, ErrorKind};
use crate::foundation::message::{StreamMsg, decode_stream_msg, encode_stream_msg};
use crate::foundation::{
    CommittedEntry, EntryOp, EntryType, MsgDeleteProposal, PurgeProposal, StreamConfig,
    encode_json_entry,
};
use crate::gateway::{ApiError, MsgDeleteResponse, PubAck, StreamPurgeResponse};
use crate::meta::MetaController;
use crate::relay::{Delivery, Relay, SendQueue};

/// Proposed-but-not-applied sequence tracking on the leader.
#[derive(Debug, Default)]
pub(crate) struct SeqState {
    /// Last applied stream sequence
    pub lseq: u64,
    /// Next sequence to propose; `nlseq >= lseq` on a leader
    pub nlseq: u64,
}

/// A locally running replicated stream.
pub struct ReplicatedStream {
    account: String,
    name: String,
    config: Mutex<StreamConfig>,
    sync_subject: String,
    store: Arc<dyn MessageStore>,
    node: Option<Arc<dyn RaftNode>>,
    seq: Mutex<SeqState>,
    leader: AtomicBool,
    sendq: SendQueue,
    relay: Arc<dyn Relay>,
    quit: CancellationToken,
    /// Consumers running under this stream
    pub(crate) consumers: DashMap<String, Arc<ReplicatedConsumer>>,
    /// In-progress catch-up install, aborted when a newer snapshot arrives
    pub(crate) catchup: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ReplicatedStream {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        account: String,
        config: StreamConfig,
        sync_subject: String,
        store: Arc<dyn MessageStore>,
        node: Option<Arc<dyn RaftNode>>,
        sendq: SendQueue,
        relay: Arc<dyn Relay>,
        parent_quit: &CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            account,
            name: config.name.clone(),
            config: Mutex::new(config),
            sync_subject,
            store,
            node,
            seq: Mutex::new(SeqState::default()),
            leader: AtomicBool::new(false),
            sendq,
            relay,
            quit: parent_quit.child_token(),
            consumers: DashMap::new(),
            catchup: Mutex::new(None),
        })
    }

    /// Stream name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning account.
    pub fn account(&self) -> &str {
        &self.account
    }

    /// Whether this member currently leads the stream group.
    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Acquire)
    }

    pub(crate) fn set_leader(&self, is_leader: bool) {
        self.leader.store(is_leader, Ordering::Release);
    }

    /// Current configuration.
    pub fn config(&self) -> StreamConfig {
        self.config.lock().clone()
    }

    pub(crate) fn update_config(&self, config: StreamConfig) {
        *self.config.lock() = config;
    }

    /// Current store state.
    pub async fn state(&self) -> StreamState {
        self.store.state().await
    }

    pub(crate) fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    pub(crate) fn node(&self) -> Option<Arc<dyn RaftNode>> {
        self.node.clone()
    }

    pub(crate) fn relay(&self) -> &Arc<dyn Relay> {
        &self.relay
    }

    pub(crate) fn sendq(&self) -> &SendQueue {
        &self.sendq
    }

    pub(crate) fn sync_subject(&self) -> &str {
        &self.sync_subject
    }

    pub(crate) fn quit(&self) -> &CancellationToken {
        &self.quit
    }

    /// Align the runtime sequence state to `seq` (catch-up restored it).
    pub(crate) fn set_lseq(&self, lseq: u64) {
        let mut seq = self.seq.lock();
        seq.lseq = lseq;
        if seq.nlseq < lseq {
            seq.nlseq = lseq;
        }
    }

    pub(crate) fn lseq(&self) -> u64 {
        self.seq.lock().lseq
    }

    /// Stop this stream: cancel its tasks and shut down its node.
    pub(crate) fn stop(&self) {
        self.quit.cancel();
        if let Some(handle) = self.catchup.lock().take() {
            handle.abort();
        }
        for consumer in self.consumers.iter() {
            consumer.value().stop();
        }
        if let Some(node) = &self.node {
            node.shutdown();
        }
    }

    /// Leader path for an inbound publish: assign the next proposal
    /// sequence and submit the framed message for consensus. Single-replica
    /// streams ingest directly.
    pub(crate) async fn propose_inbound(
        &self,
        subject: &str,
        reply: &str,
        headers: &[u8],
        payload: &[u8],
    ) -> EngineResult<()> {
        let timestamp = now_nanos();

        let node = match &self.node {
            Some(node) => node.clone(),
            None => {
                // Single replica: no group, commit straight to the store.
                let lseq = self.seq.lock().lseq;
                let msg = StreamMsg {
                    subject: subject.to_string(),
                    reply: reply.to_string(),
                    headers: Bytes::copy_from_slice(headers),
                    payload: Bytes::copy_from_slice(payload),
                    lseq,
                    timestamp,
                };
                let seq = self.ingest(&msg).await?;
                self.maybe_pub_ack(reply, Some(seq), None);
                return Ok(());
            }
        };

        let can_respond = !self.config.lock().no_ack && !reply.is_empty() && self.is_leader();

        let result = {
            let mut seq = self.seq.lock();
            // Recover after a crash or truncation left nlseq behind.
            if seq.nlseq < seq.lseq {
                seq.nlseq = seq.lseq;
            }
            let encoded =
                encode_stream_msg(subject, reply, headers, payload, seq.nlseq, timestamp)?;
            match node.propose(encoded) {
                Ok(()) => {
                    seq.nlseq += 1;
                    Ok(())
                }
                Err(err) => Err(err),
            }
        };

        if let Err(err) = result {
            if can_respond {
                self.maybe_pub_ack(reply, None, Some(ApiError::new(503, err.to_string())));
            }
            return Err(err);
        }
        Ok(())
    }

    /// Propose a purge of this stream through its group.
    pub(crate) fn propose_purge(&self, proposal: &PurgeProposal) -> EngineResult<()> {
        match &self.node {
            Some(node) => node.propose(encode_json_entry(EntryOp::PurgeStream, proposal)?),
            None => Err(Error::invalid_state("purge on non-replicated stream")),
        }
    }

    /// Propose erasing one message through the group.
    pub(crate) fn propose_msg_delete(&self, proposal: &MsgDeleteProposal) -> EngineResult<()> {
        match &self.node {
            Some(node) => node.propose(encode_json_entry(EntryOp::DeleteMsg, proposal)?),
            None => Err(Error::invalid_state("msg delete on non-replicated stream")),
        }
    }

    /// Apply a batch of committed entries. Returns an error only for
    /// conditions the monitor must treat as fatal (decode failures, store
    /// divergence).
    pub(crate) async fn apply_committed(
        self: &Arc<Self>,
        ce: &CommittedEntry,
    ) -> EngineResult<()> {
        for entry in &ce.entries {
            if entry.entry_type == EntryType::Snapshot {
                self.process_replication_snapshot(&entry.data).await;
                continue;
            }
            let Some((&tag, body)) = entry.data.split_first() else {
                return Err(Error::decode("empty stream entry"));
            };
            match EntryOp::from_u8(tag) {
                Some(EntryOp::StreamMsg) => {
                    let msg = decode_stream_msg(body)?;
                    match self.ingest(&msg).await {
                        Ok(seq) => {
                            if self.is_leader() {
                                self.maybe_pub_ack(&msg.reply, Some(seq), None);
                            }
                        }
                        Err(err) if err.is_last_seq_mismatch() => {
                            // Catch-up already supplied this message.
                            warn!(
                                stream = %self.name,
                                lseq = msg.lseq,
                                "skipping already applied message"
                            );
                        }
                        Err(err) => return Err(err),
                    }
                }
                Some(EntryOp::DeleteMsg) => {
                    let md: MsgDeleteProposal = serde_json::from_slice(body)?;
                    self.apply_msg_delete(&md).await?;
                }
                Some(EntryOp::PurgeStream) => {
                    let sp: PurgeProposal = serde_json::from_slice(body)?;
                    self.apply_purge(&sp).await?;
                }
                _ => {
                    return Err(Error::decode(format!(
                        "unknown stream entry op {tag} for {}",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Commit a replicated message to the local store. The framed `lseq`
    /// must equal the current applied sequence; anything lower means
    /// catch-up got there first.
    pub(crate) async fn ingest(&self, msg: &StreamMsg) -> EngineResult<u64> {
        {
            let seq = self.seq.lock();
            if msg.lseq != seq.lseq {
                return Err(Error::with_context(
                    ErrorKind::LastSeqMismatch,
                    format!("expected lseq {}, entry has {}", seq.lseq, msg.lseq),
                ));
            }
        }
        let seq = self
            .store
            .append(&msg.subject, &msg.headers, &msg.payload, msg.timestamp)
            .await?;
        self.set_lseq(seq);
        Ok(seq)
    }

    async fn apply_msg_delete(&self, md: &MsgDeleteProposal) -> EngineResult<()> {
        let removed = self.store.remove(md.seq).await?;
        if self.is_leader() && !md.reply.is_empty() {
            let resp = if removed {
                MsgDeleteResponse {
                    success: true,
                    error: None,
                }
            } else {
                MsgDeleteResponse {
                    success: false,
                    error: Some(ApiError::new(
                        400,
                        format!("sequence [{}] not found", md.seq),
                    )),
                }
            };
            self.respond(&md.reply, &resp);
        }
        Ok(())
    }

    async fn apply_purge(&self, sp: &PurgeProposal) -> EngineResult<()> {
        let purged = self.store.purge().await?;
        info!(stream = %self.name, purged, "purged stream");
        if self.is_leader() && !sp.reply.is_empty() {
            let resp = StreamPurgeResponse {
                success: true,
                purged,
                error: None,
            };
            self.respond(&sp.reply, &resp);
        }
        Ok(())
    }

    fn maybe_pub_ack(&self, reply: &str, seq: Option<u64>, error: Option<ApiError>) {
        if reply.is_empty() || self.config.lock().no_ack {
            return;
        }
        let ack = PubAck {
            stream: self.name.clone(),
            seq,
            error,
        };
        self.respond(reply, &ack);
    }

    pub(crate) fn respond<T: serde::Serialize>(&self, reply: &str, value: &T) {
        match serde_json::to_vec(value) {
            Ok(json) => self.sendq.send(reply, "", Bytes::from(json)),
            Err(err) => error!(stream = %self.name, %err, "failed to encode response"),
        }
    }
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Monitor loop for a replicated stream: applies committed entries, reacts
/// to leadership changes, and services catch-up requests on the stream's
/// sync inbox.
pub(crate) async fn monitor_stream(
    meta: Arc<MetaController>,
    stream: Arc<ReplicatedStream>,
    mut channels: NodeChannels,
) {
    let Some(node) = stream.node() else {
        return;
    };
    let node_quit = node.quit();
    let server_quit = meta.shutdown_token();
    let stream_quit = stream.quit().clone();

    let mut sync_sub = match stream.relay().subscribe(stream.sync_subject()) {
        Ok(sub) => sub,
        Err(err) => {
            error!(stream = %stream.name(), %err, "cannot subscribe to sync subject");
            return;
        }
    };

    debug!(stream = %stream.name(), group = %node.group(), "stream monitor started");

    loop {
        tokio::select! {
            _ = server_quit.cancelled() => break,
            _ = node_quit.cancelled() => break,
            _ = stream_quit.cancelled() => break,
            maybe = channels.apply.recv() => match maybe {
                Some(ce) => {
                    let index = ce.index;
                    if let Err(err) = stream.apply_committed(&ce).await {
                        // The log is the authoritative order; a replica
                        // that cannot apply it must stop rather than
                        // diverge.
                        error!(stream = %stream.name(), %err, "fatal stream apply error");
                        break;
                    }
                    node.applied(index);
                }
                None => break,
            },
            maybe = channels.leadership.recv() => match maybe {
                Some(is_leader) => {
                    meta.process_stream_leader_change(&stream, is_leader).await;
                }
                None => break,
            },
            maybe = sync_sub.rx.recv() => match maybe {
                Some(delivery) => stream.handle_sync_request(delivery),
                None => break,
            },
        }
    }

    stream.relay().unsubscribe(sync_sub.id);
    debug!(stream = %stream.name(), "stream monitor exited");
}

impl ReplicatedStream {
    /// Handle a catch-up request received on the sync inbox. Only the
    /// leader serves them; each request gets its own sender task.
    pub(crate) fn handle_sync_request(self: &Arc<Self>, delivery: Delivery) {
        if !self.is_leader() {
            return;
        }
        let sreq: crate::catchup::SyncRequest = match serde_json::from_slice(&delivery.payload) {
            Ok(sreq) => sreq,
            Err(err) => {
                warn!(stream = %self.name, %err, "bad catch-up request");
                return;
            }
        };
        if delivery.reply.is_empty() {
            warn!(stream = %self.name, "catch-up request without reply subject");
            return;
        }
        info!(
            stream = %self.name,
            first = sreq.first_seq,
            last = sreq.last_seq,
            "starting catch-up sender"
        );
        let stream = self.clone();
        tokio::spawn(crate::catchup::run_catchup(stream, delivery.reply, sreq));
    }
}
