//! Engine: per-server lifecycle of the clustered streaming core

use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use weir_storage::StreamState;

use crate::config::ClusterConfig;
use crate::consensus::{NodeFactory, NodeRegistry};
use crate::error::{EngineResult, Error};
use crate::foundation::PeerId;
use crate::gateway::{ConsumerInfo, RequestGateway};
use crate::meta::MetaController;
use crate::relay::{Relay, SendQueue};

/// Per-server shared context: the collaborators and registries every
/// component reaches through.
pub(crate) struct ClusterCtx {
    /// Cluster configuration
    pub config: ClusterConfig,
    /// This server's peer ID
    pub id: PeerId,
    /// Transport relay
    pub relay: Arc<dyn Relay>,
    /// Consensus node factory
    pub factory: Arc<dyn NodeFactory>,
    /// Running consensus nodes by group name
    pub registry: NodeRegistry,
    /// Outbound send queue
    pub sendq: SendQueue,
    /// Server-wide shutdown signal
    pub shutdown: CancellationToken,
    /// Long-lived monitor tasks
    pub tasks: TaskTracker,
}

/// A clustered streaming engine instance for one server.
pub struct Engine {
    ctx: Arc<ClusterCtx>,
    meta: Arc<MetaController>,
}

impl Engine {
    /// Create an engine. Validates the clustering prerequisites and
    /// creates the meta consensus node; call [`Engine::start`] to begin
    /// processing.
    pub fn new(
        config: ClusterConfig,
        relay: Arc<dyn Relay>,
        factory: Arc<dyn NodeFactory>,
    ) -> EngineResult<Self> {
        config.validate()?;

        let shutdown = CancellationToken::new();
        let sendq = SendQueue::start(relay.clone(), shutdown.clone());
        let ctx = Arc::new(ClusterCtx {
            id: config.peer_id(),
            config,
            relay,
            factory,
            registry: NodeRegistry::new(),
            sendq,
            shutdown,
            tasks: TaskTracker::new(),
        });
        let meta = MetaController::new(ctx.clone())?;
        Ok(Self { ctx, meta })
    }

    /// Start the meta monitor.
    pub async fn start(&self) -> EngineResult<()> {
        info!(server = %self.ctx.id, cluster = %self.ctx.config.cluster_name, "starting clustered streaming");
        self.meta.start()
    }

    /// Stop all monitors and shut down every consensus node.
    pub async fn stop(&self) {
        info!(server = %self.ctx.id, "stopping clustered streaming");
        self.ctx.shutdown.cancel();
        self.ctx.registry.shutdown_all();
        self.ctx.tasks.close();
        self.ctx.tasks.wait().await;
    }

    /// This server's peer ID.
    pub fn peer_id(&self) -> PeerId {
        self.ctx.id.clone()
    }

    /// The request gateway for this server.
    pub fn gateway(&self) -> RequestGateway {
        RequestGateway::new(self.meta.clone())
    }

    /// The meta controller (predicates, assignments, snapshots).
    pub fn meta(&self) -> &Arc<MetaController> {
        &self.meta
    }

    /// Whether this server leads the meta group.
    pub fn is_meta_leader(&self) -> bool {
        self.meta.is_leader()
    }

    /// Store state of a locally running stream.
    pub async fn stream_state(&self, account: &str, stream: &str) -> Option<StreamState> {
        match self.meta.lookup_stream(account, stream) {
            Some(stream) => Some(stream.state().await),
            None => None,
        }
    }

    /// Info for a locally running consumer.
    pub async fn consumer_info(
        &self,
        account: &str,
        stream: &str,
        consumer: &str,
    ) -> Option<ConsumerInfo> {
        self.meta.consumer_info(account, stream, consumer).await
    }

    /// Snapshot the meta assignment map into the meta node. Leader only.
    pub fn snapshot_meta(&self) -> EngineResult<()> {
        self.meta.snapshot_meta()
    }

    /// Snapshot a stream's store state into its consensus node, letting
    /// the node truncate its log. Stream leader only.
    pub async fn snapshot_stream(&self, account: &str, stream: &str) -> EngineResult<()> {
        let running = self
            .meta
            .lookup_stream(account, stream)
            .ok_or_else(|| Error::not_found(format!("stream {stream} not running here")))?;
        if !running.is_leader() {
            return Err(Error::not_leader("stream snapshot requires the leader", None));
        }
        let node = running
            .node()
            .ok_or_else(|| Error::invalid_state("stream has no consensus node"))?;
        let state = running.state().await;
        let blob = serde_json::to_vec(&state)?;
        node.snapshot(Bytes::from(blob))
    }
}
