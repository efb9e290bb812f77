//! Consumer replicator
//!
//! One `ReplicatedConsumer` per consumer assignment whose group includes
//! this server. Delivery and acknowledgement state changes are proposed by
//! the consumer leader and applied to the consumer store on every member,
//! so a failover resumes from replicated state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use weir_storage::{ConsumerState, ConsumerStore, StoredMessage};

use crate::consensus::{NodeChannels, RaftNode};
use crate::error::{EngineResult, Error};
use crate::foundation::message::{
    decode_ack_update, decode_delivered_update, encode_ack_update, encode_delivered_update,
};
use crate::foundation::{CommittedEntry, ConsumerConfig, EntryOp, EntryType};
use crate::gateway::ConsumerInfo;
use crate::meta::MetaController;
use crate::stream::ReplicatedStream;

#[derive(Debug, Default)]
struct DeliveryCursor {
    dseq: u64,
    sseq: u64,
}

/// A locally running replicated consumer.
pub struct ReplicatedConsumer {
    account: String,
    stream_name: String,
    name: String,
    config: ConsumerConfig,
    store: Arc<dyn ConsumerStore>,
    node: Option<Arc<dyn RaftNode>>,
    stream: Weak<ReplicatedStream>,
    leader: AtomicBool,
    /// Leader-local delivery cursor, re-seeded from the store on election
    cursor: tokio::sync::Mutex<DeliveryCursor>,
    quit: CancellationToken,
}

impl ReplicatedConsumer {
    pub(crate) fn new(
        account: String,
        stream: &Arc<ReplicatedStream>,
        name: String,
        config: ConsumerConfig,
        store: Arc<dyn ConsumerStore>,
        node: Option<Arc<dyn RaftNode>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            account,
            stream_name: stream.name().to_string(),
            name,
            config,
            store,
            node,
            stream: Arc::downgrade(stream),
            leader: AtomicBool::new(false),
            cursor: tokio::sync::Mutex::new(DeliveryCursor::default()),
            quit: stream.quit().child_token(),
        })
    }

    /// Consumer name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning account.
    pub fn account(&self) -> &str {
        &self.account
    }

    /// Parent stream name.
    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Whether this member currently leads the consumer group.
    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Acquire)
    }

    pub(crate) fn node(&self) -> Option<Arc<dyn RaftNode>> {
        self.node.clone()
    }

    pub(crate) fn quit(&self) -> &CancellationToken {
        &self.quit
    }

    pub(crate) fn stop(&self) {
        self.quit.cancel();
        if let Some(node) = &self.node {
            node.shutdown();
        }
    }

    /// Current info, from replicated state.
    pub async fn info(&self) -> ConsumerInfo {
        let state = self.store.state().await;
        ConsumerInfo {
            name: self.name.clone(),
            stream_name: self.stream_name.clone(),
            config: self.config.clone(),
            delivered: state.delivered,
            ack_floor: state.ack_floor,
            num_ack_pending: state.num_ack_pending(),
        }
    }

    /// Transition leadership, re-seeding the delivery cursor from the
    /// replicated store state on election.
    pub(crate) async fn set_leader(&self, is_leader: bool) {
        if is_leader {
            let state = self.store.state().await;
            let mut cursor = self.cursor.lock().await;
            cursor.dseq = state.delivered.consumer_seq;
            cursor.sseq = state.delivered.stream_seq;
        }
        self.leader.store(is_leader, Ordering::Release);
    }

    /// Leader operation: deliver the next available stream message,
    /// replicating the delivered update. Returns the delivery sequence and
    /// the message.
    pub async fn deliver_next(&self) -> EngineResult<(u64, StoredMessage)> {
        if !self.is_leader() {
            return Err(Error::not_leader("consumer delivery requires the leader", None));
        }
        let stream = self
            .stream
            .upgrade()
            .ok_or_else(|| Error::invalid_state("parent stream is gone"))?;

        let mut cursor = self.cursor.lock().await;
        let state = stream.state().await;
        let mut seq = (cursor.sseq + 1).max(state.first_seq);

        let msg = loop {
            if seq > state.last_seq {
                return Err(Error::not_found(format!(
                    "no messages for consumer {}",
                    self.name
                )));
            }
            match stream.store().load(seq).await {
                Ok(msg) => break msg,
                Err(weir_storage::StorageError::NoMessage(_)) => {
                    // Erased; skip over the tombstone.
                    seq += 1;
                }
                Err(err) => return Err(err.into()),
            }
        };

        cursor.dseq += 1;
        cursor.sseq = msg.sequence;
        let dseq = cursor.dseq;
        let update = encode_delivered_update(dseq, msg.sequence, 1, now_nanos());
        drop(cursor);

        match &self.node {
            Some(node) => node.propose(update)?,
            None => {
                let (dseq, sseq, dc, ts) = decode_delivered_update(&update[1..])?;
                self.store.update_delivered(dseq, sseq, dc, ts).await?;
            }
        }
        Ok((dseq, msg))
    }

    /// Leader operation: acknowledge a delivery, replicating the ack
    /// update.
    pub async fn ack(&self, dseq: u64, sseq: u64) -> EngineResult<()> {
        if !self.is_leader() {
            return Err(Error::not_leader("consumer ack requires the leader", None));
        }
        let update = encode_ack_update(dseq, sseq);
        match &self.node {
            Some(node) => node.propose(update)?,
            None => self.store.update_acks(dseq, sseq).await?,
        }
        Ok(())
    }

    /// Apply a batch of committed consumer entries. Every decode failure
    /// is fatal: the log is the authoritative order of this consumer's
    /// state.
    pub(crate) async fn apply_committed(&self, ce: &CommittedEntry) -> EngineResult<()> {
        for entry in &ce.entries {
            if entry.entry_type == EntryType::Snapshot {
                debug!(consumer = %self.name, "ignoring consumer snapshot entry");
                continue;
            }
            let Some((&tag, body)) = entry.data.split_first() else {
                return Err(Error::decode("empty consumer entry"));
            };
            match EntryOp::from_u8(tag) {
                Some(EntryOp::UpdateDelivered) => {
                    let (dseq, sseq, dc, ts) = decode_delivered_update(body)?;
                    self.store.update_delivered(dseq, sseq, dc, ts).await?;
                }
                Some(EntryOp::UpdateAcks) => {
                    let (dseq, sseq) = decode_ack_update(body)?;
                    self.store.update_acks(dseq, sseq).await?;
                }
                Some(EntryOp::UpdateFullState) => {
                    let state: ConsumerState = serde_json::from_slice(body)?;
                    self.store.replace(state).await?;
                }
                _ => {
                    return Err(Error::decode(format!(
                        "unknown consumer entry op {tag} for {}",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Monitor loop for a replicated consumer.
pub(crate) async fn monitor_consumer(
    meta: Arc<MetaController>,
    consumer: Arc<ReplicatedConsumer>,
    mut channels: NodeChannels,
) {
    let Some(node) = consumer.node() else {
        return;
    };
    let node_quit = node.quit();
    let server_quit = meta.shutdown_token();
    let consumer_quit = consumer.quit().clone();

    debug!(consumer = %consumer.name(), group = %node.group(), "consumer monitor started");

    loop {
        tokio::select! {
            _ = server_quit.cancelled() => break,
            _ = node_quit.cancelled() => break,
            _ = consumer_quit.cancelled() => break,
            maybe = channels.apply.recv() => match maybe {
                Some(ce) => {
                    let index = ce.index;
                    if let Err(err) = consumer.apply_committed(&ce).await {
                        error!(consumer = %consumer.name(), %err, "fatal consumer apply error");
                        break;
                    }
                    node.applied(index);
                }
                None => break,
            },
            maybe = channels.leadership.recv() => match maybe {
                Some(is_leader) => {
                    meta.process_consumer_leader_change(&consumer, is_leader).await;
                }
                None => break,
            },
        }
    }

    debug!(consumer = %consumer.name(), "consumer monitor exited");
}
