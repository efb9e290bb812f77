//! Request gateway
//!
//! Thin routing layer between client administrative requests and the
//! replication core: create/delete requests become meta leader proposals,
//! purge/msg-delete/publish become stream leader proposals. Responses are
//! JSON envelopes emitted to the request's reply subject by whichever peer
//! is leader when the mutation commits.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use weir_storage::{SequencePair, StreamState};

use crate::error::{EngineResult, Error, ErrorKind};
use crate::foundation::{
    ClientInfo, ConsumerAssignment, ConsumerConfig, MsgDeleteProposal, PurgeProposal,
    StreamAssignment, StreamConfig, subjects,
};
use crate::meta::MetaController;
use crate::placement;

/// A user-visible failure, carried inside response envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    /// HTTP-flavored status code
    pub code: u16,
    /// Human-readable description
    pub description: String,
}

impl ApiError {
    /// Create an error envelope.
    pub fn new(code: u16, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }

    /// The envelope for an engine error.
    pub fn from_engine(err: &Error) -> Self {
        let code = match err.kind() {
            ErrorKind::NotFound => 404,
            ErrorKind::NotLeader => 503,
            ErrorKind::Propose => 503,
            ErrorKind::InsufficientResources => 503,
            ErrorKind::Configuration => 400,
            _ => 500,
        };
        Self::new(code, err.to_string())
    }
}

/// Current information about a stream, returned on create.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamInfo {
    /// Stream configuration
    pub config: StreamConfig,
    /// Store state at response time
    pub state: StreamState,
}

/// Current information about a consumer, returned on create.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerInfo {
    /// Consumer name
    pub name: String,
    /// Parent stream name
    pub stream_name: String,
    /// Consumer configuration
    pub config: ConsumerConfig,
    /// Highest delivered pair
    pub delivered: SequencePair,
    /// Ack floor pair
    pub ack_floor: SequencePair,
    /// Deliveries awaiting acknowledgement
    pub num_ack_pending: usize,
}

/// Publish acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubAck {
    /// Stream that stored the message
    pub stream: String,
    /// Assigned sequence, absent on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Failure, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

/// Response to a stream create request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamCreateResponse {
    /// Stream info on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_info: Option<StreamInfo>,
    /// Failure, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

/// Response to a stream delete request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamDeleteResponse {
    /// Whether the stream was deleted
    pub success: bool,
    /// Failure, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

/// Response to a purge request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamPurgeResponse {
    /// Whether the purge ran
    pub success: bool,
    /// Number of messages purged
    pub purged: u64,
    /// Failure, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

/// Response to a message delete request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MsgDeleteResponse {
    /// Whether the message was erased
    pub success: bool,
    /// Failure, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

/// Response to a consumer create request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsumerCreateResponse {
    /// Consumer info on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_info: Option<ConsumerInfo>,
    /// Failure, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

/// Response to a consumer delete request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsumerDeleteResponse {
    /// Whether the consumer was deleted
    pub success: bool,
    /// Failure, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

/// Routes client administrative requests into the replication core.
#[derive(Clone)]
pub struct RequestGateway {
    meta: Arc<MetaController>,
}

impl RequestGateway {
    pub(crate) fn new(meta: Arc<MetaController>) -> Self {
        Self { meta }
    }

    /// Handle a stream create request: place a group, build the
    /// assignment, propose it through the meta leader. The create response
    /// is emitted later, by the stream leader on its first leadership
    /// transition.
    pub fn create_stream(
        &self,
        client: ClientInfo,
        config: StreamConfig,
        reply: &str,
    ) -> EngineResult<()> {
        let meta = &self.meta;
        if !meta.is_leader() {
            return Err(Error::not_leader("stream create requires the meta leader", None));
        }

        let group =
            placement::create_group_for_stream(&config, meta.node().as_ref(), meta.relay().as_ref());
        let group = match group {
            Some(group) => group,
            None => {
                let resp = StreamCreateResponse {
                    stream_info: None,
                    error: Some(ApiError::new(503, "insufficient resources")),
                };
                meta.respond(reply, &resp);
                return Err(Error::insufficient_resources(format!(
                    "no peers available for {} replicas",
                    config.replication_factor()
                )));
            }
        };

        let sa = StreamAssignment {
            client: Some(client),
            config,
            group,
            sync: subjects::sync_subject(),
            reply: reply.to_string(),
            consumers: Default::default(),
            responded: false,
            last_error: None,
        };
        meta.propose_add_stream(&sa)
    }

    /// Handle a stream delete request.
    pub fn delete_stream(&self, client: ClientInfo, stream: &str, reply: &str) -> EngineResult<()> {
        let meta = &self.meta;
        if !meta.is_leader() {
            return Err(Error::not_leader("stream delete requires the meta leader", None));
        }
        let mut sa = meta
            .stream_assignment(&client.account, stream)
            .ok_or_else(|| Error::not_found(format!("stream {stream} not found")))?;
        sa.client = Some(client);
        sa.reply = reply.to_string();
        meta.propose_delete_stream(&sa)
    }

    /// Handle a consumer create request, assigning an ephemeral name when
    /// the config has no durable name.
    pub fn create_consumer(
        &self,
        client: ClientInfo,
        stream: &str,
        config: ConsumerConfig,
        reply: &str,
    ) -> EngineResult<()> {
        let meta = &self.meta;
        if !meta.is_leader() {
            return Err(Error::not_leader("consumer create requires the meta leader", None));
        }
        let sa = match meta.stream_assignment(&client.account, stream) {
            Some(sa) => sa,
            None => {
                let resp = ConsumerCreateResponse {
                    consumer_info: None,
                    error: Some(ApiError::new(404, format!("stream {stream} not found"))),
                };
                meta.respond(reply, &resp);
                return Err(Error::not_found(format!("stream {stream} not found")));
            }
        };

        let group = placement::create_group_for_consumer(&sa.group, sa.config.storage)
            .ok_or_else(|| Error::insufficient_resources("stream group has no peers"))?;

        let name = match &config.durable_name {
            Some(durable) => durable.clone(),
            None => {
                // Pick an ephemeral name not already taken on this stream.
                let mut name = ephemeral_consumer_name();
                while sa.consumers.contains_key(&name) {
                    name = ephemeral_consumer_name();
                }
                name
            }
        };

        let ca = ConsumerAssignment {
            client: Some(client),
            name,
            stream: stream.to_string(),
            config,
            group,
            reply: reply.to_string(),
            responded: false,
            last_error: None,
        };
        meta.propose_add_consumer(&ca)
    }

    /// Handle a consumer delete request.
    pub fn delete_consumer(
        &self,
        client: ClientInfo,
        stream: &str,
        consumer: &str,
        reply: &str,
    ) -> EngineResult<()> {
        let meta = &self.meta;
        if !meta.is_leader() {
            return Err(Error::not_leader("consumer delete requires the meta leader", None));
        }
        let mut ca = meta
            .consumer_assignment(&client.account, stream, consumer)
            .ok_or_else(|| Error::not_found(format!("consumer {consumer} not found")))?;
        ca.client = Some(client);
        ca.reply = reply.to_string();
        meta.propose_delete_consumer(&ca)
    }

    /// Handle a purge request: proposed through the stream's own group,
    /// the purge count response comes from the stream leader at apply time.
    pub fn purge_stream(&self, client: ClientInfo, stream: &str, reply: &str) -> EngineResult<()> {
        let running = self
            .meta
            .lookup_stream(&client.account, stream)
            .ok_or_else(|| Error::not_found(format!("stream {stream} not found")))?;
        let proposal = PurgeProposal {
            stream: stream.to_string(),
            reply: reply.to_string(),
            client: Some(client),
        };
        running.propose_purge(&proposal)
    }

    /// Handle a message delete request.
    pub fn delete_msg(
        &self,
        client: ClientInfo,
        stream: &str,
        seq: u64,
        reply: &str,
    ) -> EngineResult<()> {
        let running = self
            .meta
            .lookup_stream(&client.account, stream)
            .ok_or_else(|| Error::not_found(format!("stream {stream} not found")))?;
        let proposal = MsgDeleteProposal {
            stream: stream.to_string(),
            seq,
            reply: reply.to_string(),
            client: Some(client),
        };
        debug!(stream, seq, "proposing message delete");
        running.propose_msg_delete(&proposal)
    }

    /// Route an inbound publish to the local stream capturing `subject`.
    pub async fn publish(
        &self,
        account: &str,
        subject: &str,
        reply: &str,
        headers: &[u8],
        payload: Bytes,
    ) -> EngineResult<()> {
        let stream = self
            .meta
            .stream_for_subject(account, subject)
            .ok_or_else(|| Error::not_found(format!("no stream captures subject {subject}")))?;
        let running = self
            .meta
            .lookup_stream(account, &stream)
            .ok_or_else(|| Error::not_found(format!("stream {stream} not running here")))?;
        running.propose_inbound(subject, reply, headers, &payload).await
    }
}

fn ephemeral_consumer_name() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}
