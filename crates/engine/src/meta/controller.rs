//! The meta controller and its monitor loop

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weir_storage::{MemoryConsumerStore, MemoryMessageStore, MessageStore};

use crate::consensus::RaftNode;
use crate::consumer::{ReplicatedConsumer, monitor_consumer};
use crate::engine::ClusterCtx;
use crate::error::{EngineResult, Error};
use crate::foundation::{
    CommittedEntry, ConsumerAssignment, Entry, EntryOp, EntryType, RaftGroup, StorageClass,
    StreamAssignment, WritableStreamAssignment, encode_json_entry,
};
use crate::gateway::{
    ApiError, ConsumerCreateResponse, ConsumerDeleteResponse, ConsumerInfo, StreamCreateResponse,
    StreamDeleteResponse, StreamInfo,
};
use crate::relay::{Relay, subject_matches};
use crate::stream::{ReplicatedStream, monitor_stream};

use super::{decode_meta_snapshot, encode_meta_snapshot};

type StreamKey = (String, String);

/// The cluster-wide assignment map: account to stream name to assignment.
type AssignmentMap = HashMap<String, HashMap<String, StreamAssignment>>;

/// Per-server meta controller.
pub struct MetaController {
    ctx: Arc<ClusterCtx>,
    node: Arc<dyn RaftNode>,
    /// Assignment map; the writer is the meta monitor, readers take the
    /// shared side. Never held across collaborator I/O.
    state: RwLock<AssignmentMap>,
    /// Streams running locally, keyed by (account, stream)
    streams: DashMap<StreamKey, Arc<ReplicatedStream>>,
}

impl MetaController {
    /// Create the controller and its meta consensus node.
    pub(crate) fn new(ctx: Arc<ClusterCtx>) -> EngineResult<Arc<Self>> {
        let group = RaftGroup {
            name: ctx.config.meta_group_name.clone(),
            peers: ctx.config.meta_peers(),
            storage: StorageClass::File,
            preferred: None,
        };
        let node = ctx.factory.create(&group)?;
        ctx.registry.insert(node.clone());
        Ok(Arc::new(Self {
            ctx,
            node,
            state: RwLock::new(HashMap::new()),
            streams: DashMap::new(),
        }))
    }

    /// Spawn the meta monitor.
    pub(crate) fn start(self: &Arc<Self>) -> EngineResult<()> {
        let channels = self
            .node
            .take_channels()
            .ok_or_else(|| Error::invalid_state("meta node already monitored"))?;
        let controller = self.clone();
        self.ctx.tasks.spawn(async move {
            controller.monitor(channels).await;
        });
        Ok(())
    }

    async fn monitor(self: Arc<Self>, mut channels: crate::consensus::NodeChannels) {
        info!(server = %self.ctx.id, "meta monitor started");
        let node_quit = self.node.quit();
        loop {
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                _ = node_quit.cancelled() => break,
                maybe = channels.apply.recv() => match maybe {
                    Some(ce) => {
                        let index = ce.index;
                        if let Err(err) = self.apply_meta_entries(&ce).await {
                            // Unknown op tags mean the log was written by an
                            // incompatible build; applying further entries
                            // could corrupt the assignment map.
                            error!(%err, "fatal meta apply error");
                            break;
                        }
                        self.node.applied(index);
                    }
                    None => break,
                },
                maybe = channels.leadership.recv() => match maybe {
                    Some(is_leader) => self.process_leader_change(is_leader),
                    None => break,
                },
            }
        }
        info!(server = %self.ctx.id, "meta monitor exited");
    }

    async fn apply_meta_entries(self: &Arc<Self>, ce: &CommittedEntry) -> EngineResult<()> {
        for entry in &ce.entries {
            if entry.entry_type == EntryType::Snapshot {
                if let Err(err) = self.apply_meta_snapshot(&entry.data).await {
                    error!(%err, "failed to apply meta snapshot");
                }
                continue;
            }
            self.apply_meta_entry(entry).await?;
        }
        Ok(())
    }

    async fn apply_meta_entry(self: &Arc<Self>, entry: &Entry) -> EngineResult<()> {
        let Some((&tag, body)) = entry.data.split_first() else {
            return Err(Error::decode("empty meta entry"));
        };
        match EntryOp::from_u8(tag) {
            Some(EntryOp::AssignStream) => match serde_json::from_slice::<StreamAssignment>(body) {
                Ok(sa) => self.process_stream_assignment(sa).await,
                Err(err) => error!(%err, "failed to decode stream assignment"),
            },
            Some(EntryOp::RemoveStream) => match serde_json::from_slice::<StreamAssignment>(body) {
                Ok(sa) => self.process_stream_removal(&sa).await,
                Err(err) => error!(%err, "failed to decode stream assignment"),
            },
            Some(EntryOp::AssignConsumer) => {
                match serde_json::from_slice::<ConsumerAssignment>(body) {
                    Ok(ca) => self.process_consumer_assignment(ca).await,
                    Err(err) => error!(%err, "failed to decode consumer assignment"),
                }
            }
            Some(EntryOp::RemoveConsumer) => {
                match serde_json::from_slice::<ConsumerAssignment>(body) {
                    Ok(ca) => self.process_consumer_removal(&ca).await,
                    Err(err) => error!(%err, "failed to decode consumer assignment"),
                }
            }
            _ => {
                return Err(Error::decode(format!("unknown meta entry op {tag}")));
            }
        }
        Ok(())
    }

    fn process_leader_change(&self, is_leader: bool) {
        // Gaining meta leadership needs no immediate work (bootstrap is
        // idempotent against the log); stepdown work is likewise a no-op.
        info!(server = %self.ctx.id, is_leader, "meta leadership change");
    }

    // ---- assignment application -------------------------------------

    /// Apply a committed stream assignment: record it (first writer wins)
    /// and start the stream locally when this server is in the group.
    pub(crate) async fn process_stream_assignment(self: &Arc<Self>, sa: StreamAssignment) {
        let account = sa.account().to_string();
        let name = sa.config.name.clone();
        debug!(%account, stream = %name, "stream assignment");

        let is_member = {
            let mut state = self.state.write();
            let account_streams = state.entry(account.clone()).or_default();
            if account_streams.contains_key(&name) {
                // Already assigned; never overwrite.
                return;
            }
            account_streams.insert(name.clone(), sa.clone());
            sa.group.is_member(&self.ctx.id)
        };

        if is_member {
            self.process_cluster_create_stream(sa).await;
        }
    }

    /// Apply a committed stream removal, remembering whether this server
    /// led the stream before the map changed.
    pub(crate) async fn process_stream_removal(self: &Arc<Self>, sa: &StreamAssignment) {
        let account = sa.account().to_string();
        let name = sa.config.name.clone();
        debug!(%account, stream = %name, "stream removal");

        let (needs_delete, was_leader) = {
            let mut state = self.state.write();
            let was_leader = state
                .get(&account)
                .and_then(|streams| streams.get(&name))
                .map(|existing| self.group_leader(&existing.group))
                .unwrap_or(false);
            let removed = match state.get_mut(&account) {
                Some(streams) => streams.remove(&name).is_some(),
                None => false,
            };
            if removed && state.get(&account).is_some_and(|s| s.is_empty()) {
                state.remove(&account);
            }
            (removed, was_leader)
        };

        if needs_delete {
            self.process_cluster_delete_stream(sa, was_leader).await;
        }
    }

    /// Apply a committed consumer assignment under its parent stream.
    pub(crate) async fn process_consumer_assignment(self: &Arc<Self>, ca: ConsumerAssignment) {
        let account = ca.account().to_string();
        debug!(%account, stream = %ca.stream, consumer = %ca.name, "consumer assignment");

        let is_member = {
            let mut state = self.state.write();
            let Some(sa) = state
                .get_mut(&account)
                .and_then(|streams| streams.get_mut(&ca.stream))
            else {
                warn!(
                    %account,
                    stream = %ca.stream,
                    consumer = %ca.name,
                    "consumer assignment for unknown stream, dropping"
                );
                return;
            };
            // Replacing an existing entry is fine; the create path below
            // checks for a running consumer.
            sa.consumers.insert(ca.name.clone(), ca.clone());
            ca.group.is_member(&self.ctx.id)
        };

        if is_member {
            self.process_cluster_create_consumer(ca).await;
        }
    }

    /// Apply a committed consumer removal.
    pub(crate) async fn process_consumer_removal(self: &Arc<Self>, ca: &ConsumerAssignment) {
        let account = ca.account().to_string();
        debug!(%account, stream = %ca.stream, consumer = %ca.name, "consumer removal");

        let was_leader = {
            let mut state = self.state.write();
            let was_leader = state
                .get(&account)
                .and_then(|streams| streams.get(&ca.stream))
                .and_then(|sa| sa.consumers.get(&ca.name))
                .map(|existing| self.group_leader(&existing.group))
                .unwrap_or(false);
            if let Some(sa) = state
                .get_mut(&account)
                .and_then(|streams| streams.get_mut(&ca.stream))
            {
                sa.consumers.remove(&ca.name);
            }
            was_leader
        };

        self.process_cluster_delete_consumer(ca, was_leader).await;
    }

    // ---- local resource lifecycle -----------------------------------

    async fn process_cluster_create_stream(self: &Arc<Self>, sa: StreamAssignment) {
        let account = sa.account().to_string();
        let key = (account.clone(), sa.config.name.clone());

        if let Some(existing) = self.streams.get(&key) {
            // Update path: the stream already runs here.
            existing.update_config(sa.config.clone());
            info!(stream = %sa.config.name, "updated running stream from assignment");
            return;
        }

        let node = if sa.group.peers.len() > 1 {
            match self.create_raft_group(&sa.group) {
                Ok(node) => Some(node),
                Err(err) => {
                    warn!(stream = %sa.config.name, %err, "failed to create stream group");
                    self.record_stream_error(&account, &sa.config.name, err.to_string());
                    return;
                }
            }
        } else {
            None
        };

        let store: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::new());
        let stream = ReplicatedStream::new(
            account,
            sa.config.clone(),
            sa.sync.clone(),
            store,
            node.clone(),
            self.ctx.sendq.clone(),
            self.ctx.relay.clone(),
            &self.ctx.shutdown,
        );
        self.streams.insert(key, stream.clone());
        info!(stream = %sa.config.name, group = %sa.group.name, "created stream");

        match node {
            Some(node) => match node.take_channels() {
                Some(channels) => {
                    let meta = self.clone();
                    self.ctx.tasks.spawn(monitor_stream(meta, stream, channels));
                }
                None => warn!(stream = %stream.name(), "stream node already monitored"),
            },
            None => {
                // Single replica: sole member leads immediately.
                self.process_stream_leader_change(&stream, true).await;
            }
        }
    }

    async fn process_cluster_delete_stream(&self, sa: &StreamAssignment, was_leader: bool) {
        let key = (sa.account().to_string(), sa.config.name.clone());
        if let Some((_, stream)) = self.streams.remove(&key) {
            for consumer in stream.consumers.iter() {
                if let Some(node) = consumer.value().node() {
                    self.ctx.registry.remove(&node.group());
                }
            }
            stream.stop();
            self.ctx.registry.remove(&sa.group.name);
            info!(stream = %sa.config.name, "deleted stream");
        }

        if was_leader && !sa.reply.is_empty() {
            self.respond(
                &sa.reply,
                &StreamDeleteResponse {
                    success: true,
                    error: None,
                },
            );
        }
    }

    async fn process_cluster_create_consumer(self: &Arc<Self>, ca: ConsumerAssignment) {
        let account = ca.account().to_string();
        let key = (account.clone(), ca.stream.clone());
        let Some(stream) = self.streams.get(&key).map(|entry| entry.value().clone()) else {
            warn!(
                stream = %ca.stream,
                consumer = %ca.name,
                "consumer assignment but stream not running here"
            );
            return;
        };

        if stream.consumers.contains_key(&ca.name) {
            debug!(consumer = %ca.name, "consumer already running");
            return;
        }

        let node = if ca.group.peers.len() > 1 {
            match self.create_raft_group(&ca.group) {
                Ok(node) => Some(node),
                Err(err) => {
                    warn!(consumer = %ca.name, %err, "failed to create consumer group");
                    self.record_consumer_error(&account, &ca.stream, &ca.name, err.to_string());
                    return;
                }
            }
        } else {
            None
        };

        let consumer = ReplicatedConsumer::new(
            account,
            &stream,
            ca.name.clone(),
            ca.config.clone(),
            Arc::new(MemoryConsumerStore::new()),
            node.clone(),
        );
        stream.consumers.insert(ca.name.clone(), consumer.clone());
        info!(consumer = %ca.name, stream = %ca.stream, "created consumer");

        match node {
            Some(node) => match node.take_channels() {
                Some(channels) => {
                    let meta = self.clone();
                    self.ctx
                        .tasks
                        .spawn(monitor_consumer(meta, consumer, channels));
                }
                None => warn!(consumer = %ca.name, "consumer node already monitored"),
            },
            None => {
                self.process_consumer_leader_change(&consumer, true).await;
            }
        }
    }

    async fn process_cluster_delete_consumer(&self, ca: &ConsumerAssignment, was_leader: bool) {
        let key = (ca.account().to_string(), ca.stream.clone());
        if let Some(stream) = self.streams.get(&key) {
            if let Some((_, consumer)) = stream.consumers.remove(&ca.name) {
                if let Some(node) = consumer.node() {
                    self.ctx.registry.remove(&node.group());
                }
                consumer.stop();
                info!(consumer = %ca.name, stream = %ca.stream, "deleted consumer");
            }
        }

        if was_leader && !ca.reply.is_empty() {
            self.respond(
                &ca.reply,
                &ConsumerDeleteResponse {
                    success: true,
                    error: None,
                },
            );
        }
    }

    fn create_raft_group(&self, group: &RaftGroup) -> EngineResult<Arc<dyn RaftNode>> {
        if let Some(existing) = self.ctx.registry.lookup(&group.name) {
            debug!(group = %group.name, "group already running");
            return Ok(existing);
        }
        let node = self.ctx.factory.create(group)?;
        self.ctx.registry.insert(node.clone());
        Ok(node)
    }

    fn record_stream_error(&self, account: &str, stream: &str, error: String) {
        let mut state = self.state.write();
        if let Some(sa) = state
            .get_mut(account)
            .and_then(|streams| streams.get_mut(stream))
        {
            sa.last_error = Some(error);
        }
    }

    fn record_consumer_error(&self, account: &str, stream: &str, consumer: &str, error: String) {
        let mut state = self.state.write();
        if let Some(ca) = state
            .get_mut(account)
            .and_then(|streams| streams.get_mut(stream))
            .and_then(|sa| sa.consumers.get_mut(consumer))
        {
            ca.last_error = Some(error);
        }
    }

    // ---- leadership transitions -------------------------------------

    /// Transition a stream's leadership, emitting the create response the
    /// first time this assignment gains a leader.
    pub(crate) async fn process_stream_leader_change(
        &self,
        stream: &Arc<ReplicatedStream>,
        is_leader: bool,
    ) {
        info!(stream = %stream.name(), is_leader, "stream leadership change");
        stream.set_leader(is_leader);
        if !is_leader {
            return;
        }

        let pending = {
            let mut state = self.state.write();
            match state
                .get_mut(stream.account())
                .and_then(|streams| streams.get_mut(stream.name()))
            {
                Some(sa) if !sa.responded => {
                    sa.responded = true;
                    Some((sa.reply.clone(), sa.last_error.clone()))
                }
                _ => None,
            }
        };

        if let Some((reply, last_error)) = pending {
            if reply.is_empty() {
                return;
            }
            let resp = match last_error {
                Some(desc) => StreamCreateResponse {
                    stream_info: None,
                    error: Some(ApiError::new(500, desc)),
                },
                None => StreamCreateResponse {
                    stream_info: Some(StreamInfo {
                        config: stream.config(),
                        state: stream.state().await,
                    }),
                    error: None,
                },
            };
            self.respond(&reply, &resp);
        }
    }

    /// Transition a consumer's leadership, emitting the create response
    /// once.
    pub(crate) async fn process_consumer_leader_change(
        &self,
        consumer: &Arc<ReplicatedConsumer>,
        is_leader: bool,
    ) {
        info!(consumer = %consumer.name(), is_leader, "consumer leadership change");
        consumer.set_leader(is_leader).await;
        if !is_leader {
            return;
        }

        let pending = {
            let mut state = self.state.write();
            match state
                .get_mut(consumer.account())
                .and_then(|streams| streams.get_mut(consumer.stream_name()))
                .and_then(|sa| sa.consumers.get_mut(consumer.name()))
            {
                Some(ca) if !ca.responded => {
                    ca.responded = true;
                    Some((ca.reply.clone(), ca.last_error.clone()))
                }
                _ => None,
            }
        };

        if let Some((reply, last_error)) = pending {
            if reply.is_empty() {
                return;
            }
            let resp = match last_error {
                Some(desc) => ConsumerCreateResponse {
                    consumer_info: None,
                    error: Some(ApiError::new(500, desc)),
                },
                None => ConsumerCreateResponse {
                    consumer_info: Some(consumer.info().await),
                    error: None,
                },
            };
            self.respond(&reply, &resp);
        }
    }

    // ---- snapshots ---------------------------------------------------

    /// Serialize the assignment map. Empty state yields `None`.
    pub fn meta_snapshot(&self) -> EngineResult<Option<Bytes>> {
        let assignments: Vec<WritableStreamAssignment> = {
            let state = self.state.read();
            state
                .values()
                .flat_map(|streams| streams.values())
                .map(WritableStreamAssignment::from)
                .collect()
        };
        if assignments.is_empty() {
            return Ok(None);
        }
        encode_meta_snapshot(&assignments).map(Some)
    }

    /// Snapshot the meta state into the meta consensus node. Leader only.
    pub fn snapshot_meta(&self) -> EngineResult<()> {
        if !self.is_leader() {
            return Err(Error::not_leader("meta snapshot requires the leader", None));
        }
        match self.meta_snapshot()? {
            Some(blob) => self.node.snapshot(blob),
            None => Ok(()),
        }
    }

    /// Reconcile the local assignment map with a decoded snapshot,
    /// producing removal and addition sets and applying them in order:
    /// removals before adds, streams before consumers within adds.
    pub async fn apply_meta_snapshot(self: &Arc<Self>, buf: &[u8]) -> EngineResult<()> {
        let incoming = decode_meta_snapshot(buf)?;

        let mut new_map: AssignmentMap = HashMap::new();
        for wsa in incoming {
            let sa = StreamAssignment::from(wsa);
            new_map
                .entry(sa.account().to_string())
                .or_default()
                .insert(sa.config.name.clone(), sa);
        }

        let mut sa_del: Vec<StreamAssignment> = Vec::new();
        let mut sa_add: Vec<StreamAssignment> = Vec::new();
        let mut ca_del: Vec<ConsumerAssignment> = Vec::new();
        let mut ca_add: Vec<ConsumerAssignment> = Vec::new();

        {
            let state = self.state.read();

            // Old entries missing from the snapshot get removed; pairs
            // present on both sides diff at the consumer level.
            for (account, streams) in state.iter() {
                for (name, old_sa) in streams {
                    match new_map.get(account).and_then(|m| m.get(name)) {
                        None => sa_del.push(old_sa.clone()),
                        Some(new_sa) => {
                            for (consumer, old_ca) in &old_sa.consumers {
                                if !new_sa.consumers.contains_key(consumer) {
                                    ca_del.push(old_ca.clone());
                                }
                            }
                            // Adds are idempotent, offer every consumer the
                            // snapshot knows about.
                            ca_add.extend(new_sa.consumers.values().cloned());
                        }
                    }
                }
            }

            // Snapshot entries we have never seen get added.
            for (account, streams) in &new_map {
                for (name, new_sa) in streams {
                    let known = state
                        .get(account)
                        .map(|m| m.contains_key(name))
                        .unwrap_or(false);
                    if !known {
                        sa_add.push(new_sa.clone());
                    }
                }
            }
        }

        debug!(
            removals = sa_del.len(),
            additions = sa_add.len(),
            consumer_removals = ca_del.len(),
            consumer_additions = ca_add.len(),
            "meta snapshot reconcile"
        );

        for sa in sa_del {
            self.process_stream_removal(&sa).await;
        }
        for sa in sa_add {
            let consumers: Vec<ConsumerAssignment> = sa.consumers.values().cloned().collect();
            self.process_stream_assignment(sa).await;
            for ca in consumers {
                self.process_consumer_assignment(ca).await;
            }
        }
        for ca in ca_del {
            self.process_consumer_removal(&ca).await;
        }
        for ca in ca_add {
            self.process_consumer_assignment(ca).await;
        }

        Ok(())
    }

    // ---- proposals (meta leader only) -------------------------------

    /// Propose a stream assignment.
    pub fn propose_add_stream(&self, sa: &StreamAssignment) -> EngineResult<()> {
        self.propose_meta(EntryOp::AssignStream, sa)
    }

    /// Propose a stream removal.
    pub fn propose_delete_stream(&self, sa: &StreamAssignment) -> EngineResult<()> {
        self.propose_meta(EntryOp::RemoveStream, sa)
    }

    /// Propose a consumer assignment.
    pub fn propose_add_consumer(&self, ca: &ConsumerAssignment) -> EngineResult<()> {
        self.propose_meta(EntryOp::AssignConsumer, ca)
    }

    /// Propose a consumer removal.
    pub fn propose_delete_consumer(&self, ca: &ConsumerAssignment) -> EngineResult<()> {
        self.propose_meta(EntryOp::RemoveConsumer, ca)
    }

    fn propose_meta<T: serde::Serialize>(&self, op: EntryOp, value: &T) -> EngineResult<()> {
        if !self.is_leader() {
            return Err(Error::not_leader("meta proposals require the leader", None));
        }
        self.node.propose(encode_json_entry(op, value)?)
    }

    // ---- predicates and lookups -------------------------------------

    /// Whether this server leads the meta group.
    pub fn is_leader(&self) -> bool {
        self.node.is_leader()
    }

    /// Whether this server is the meta leader or an up-to-date follower.
    pub fn is_current(&self) -> bool {
        self.node.is_current()
    }

    /// Whether `stream` is assigned to this server.
    pub fn is_stream_assigned(&self, account: &str, stream: &str) -> bool {
        let state = self.state.read();
        state
            .get(account)
            .and_then(|streams| streams.get(stream))
            .map(|sa| sa.group.is_member(&self.ctx.id))
            .unwrap_or(false)
    }

    /// Whether this server leads `stream`'s group.
    pub fn is_stream_leader(&self, account: &str, stream: &str) -> bool {
        let state = self.state.read();
        state
            .get(account)
            .and_then(|streams| streams.get(stream))
            .map(|sa| self.group_leader(&sa.group))
            .unwrap_or(false)
    }

    /// Whether `consumer` is assigned to this server.
    pub fn is_consumer_assigned(&self, account: &str, stream: &str, consumer: &str) -> bool {
        let state = self.state.read();
        state
            .get(account)
            .and_then(|streams| streams.get(stream))
            .and_then(|sa| sa.consumers.get(consumer))
            .map(|ca| ca.group.is_member(&self.ctx.id))
            .unwrap_or(false)
    }

    /// Whether this server leads `consumer`'s group.
    pub fn is_consumer_leader(&self, account: &str, stream: &str, consumer: &str) -> bool {
        let state = self.state.read();
        state
            .get(account)
            .and_then(|streams| streams.get(stream))
            .and_then(|sa| sa.consumers.get(consumer))
            .map(|ca| self.group_leader(&ca.group))
            .unwrap_or(false)
    }

    fn group_leader(&self, group: &RaftGroup) -> bool {
        if !group.is_member(&self.ctx.id) {
            return false;
        }
        if group.peers.len() == 1 {
            return true;
        }
        self.ctx
            .registry
            .lookup(&group.name)
            .map(|node| node.is_leader())
            .unwrap_or(false)
    }

    /// Copy of the assignment for `stream`, if any.
    pub fn stream_assignment(&self, account: &str, stream: &str) -> Option<StreamAssignment> {
        let state = self.state.read();
        state
            .get(account)
            .and_then(|streams| streams.get(stream))
            .cloned()
    }

    /// Copy of the assignment for `consumer`, if any.
    pub fn consumer_assignment(
        &self,
        account: &str,
        stream: &str,
        consumer: &str,
    ) -> Option<ConsumerAssignment> {
        let state = self.state.read();
        state
            .get(account)
            .and_then(|streams| streams.get(stream))
            .and_then(|sa| sa.consumers.get(consumer))
            .cloned()
    }

    /// Names of streams assigned under `account`.
    pub fn assigned_stream_names(&self, account: &str) -> Vec<String> {
        let state = self.state.read();
        state
            .get(account)
            .map(|streams| streams.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Names of consumers assigned under `stream`.
    pub fn assigned_consumer_names(&self, account: &str, stream: &str) -> Vec<String> {
        let state = self.state.read();
        state
            .get(account)
            .and_then(|streams| streams.get(stream))
            .map(|sa| sa.consumers.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Name of the assigned stream capturing `subject`, if any.
    pub fn stream_for_subject(&self, account: &str, subject: &str) -> Option<String> {
        let state = self.state.read();
        state.get(account).and_then(|streams| {
            streams
                .values()
                .find(|sa| {
                    sa.config
                        .subjects
                        .iter()
                        .any(|pattern| subject_matches(pattern, subject))
                })
                .map(|sa| sa.config.name.clone())
        })
    }

    /// The locally running stream for `stream`, if this server hosts it.
    pub fn lookup_stream(&self, account: &str, stream: &str) -> Option<Arc<ReplicatedStream>> {
        self.streams
            .get(&(account.to_string(), stream.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// The locally running consumer, if this server hosts it.
    pub fn lookup_consumer(
        &self,
        account: &str,
        stream: &str,
        consumer: &str,
    ) -> Option<Arc<ReplicatedConsumer>> {
        self.lookup_stream(account, stream)
            .and_then(|stream| stream.consumers.get(consumer).map(|c| c.value().clone()))
    }

    /// Info for a locally running consumer.
    pub async fn consumer_info(
        &self,
        account: &str,
        stream: &str,
        consumer: &str,
    ) -> Option<ConsumerInfo> {
        match self.lookup_consumer(account, stream, consumer) {
            Some(consumer) => Some(consumer.info().await),
            None => None,
        }
    }

    // ---- plumbing ----------------------------------------------------

    pub(crate) fn node(&self) -> &Arc<dyn RaftNode> {
        &self.node
    }

    pub(crate) fn relay(&self) -> &Arc<dyn Relay> {
        &self.ctx.relay
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.ctx.shutdown.clone()
    }

    /// Emit a JSON response envelope to `reply` via the send queue.
    pub(crate) fn respond<T: serde::Serialize>(&self, reply: &str, value: &T) {
        match serde_json::to_vec(value) {
            Ok(json) => self.ctx.sendq.send(reply, "", Bytes::from(json)),
            Err(err) => error!(%err, "failed to encode api response"),
        }
    }
}
