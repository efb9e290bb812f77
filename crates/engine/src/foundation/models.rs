//! Assignment and configuration models
//!
//! These are the JSON payloads of meta log entries and the meta snapshot.
//! Runtime-only fields (`consumers`, `responded`, `last_error`) never cross
//! the wire; serde skips them and every peer rebuilds them locally.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::group::{RaftGroup, StorageClass};

/// Identity of the client a request originated from, kept on assignments
/// so the eventual leader can route the API response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Account the request was made under
    pub account: String,
    /// Client connection identity, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl ClientInfo {
    /// A client info for `account` with no connection identity.
    pub fn for_account(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            id: None,
        }
    }
}

/// Configuration of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Stream name, unique within its account
    pub name: String,
    /// Subjects the stream captures
    #[serde(default)]
    pub subjects: Vec<String>,
    /// Requested replication factor; zero means the default of one
    #[serde(default)]
    pub replicas: usize,
    /// Storage class
    #[serde(default)]
    pub storage: StorageClass,
    /// Retention limit on message count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_msgs: Option<u64>,
    /// Retention limit on total bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<u64>,
    /// Retention limit on message age, seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_secs: Option<u64>,
    /// Suppress publish acknowledgements
    #[serde(default)]
    pub no_ack: bool,
}

impl StreamConfig {
    /// A config for `name` capturing `subjects`, single replica, file
    /// storage.
    pub fn new(name: impl Into<String>, subjects: Vec<String>) -> Self {
        Self {
            name: name.into(),
            subjects,
            replicas: 0,
            storage: StorageClass::default(),
            max_msgs: None,
            max_bytes: None,
            max_age_secs: None,
            no_ack: false,
        }
    }

    /// Effective replication factor (the configured value, or one).
    pub fn replication_factor(&self) -> usize {
        if self.replicas == 0 { 1 } else { self.replicas }
    }
}

/// Configuration of a consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Durable name; absent for ephemeral consumers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durable_name: Option<String>,
    /// Push delivery subject; absent for pull consumers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver_subject: Option<String>,
    /// Maximum delivery attempts per message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_deliver: Option<u64>,
}

impl ConsumerConfig {
    /// A durable pull consumer config.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            durable_name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Whether this config names a durable consumer.
    pub fn is_durable(&self) -> bool {
        self.durable_name.is_some()
    }
}

/// Assignment of a stream to a replication group, committed through the
/// meta log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamAssignment {
    /// Requesting client, for response routing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientInfo>,
    /// Stream configuration
    #[serde(rename = "stream")]
    pub config: StreamConfig,
    /// Replication group hosting the stream
    pub group: RaftGroup,
    /// Stable inbox for catch-up requests
    #[serde(default)]
    pub sync: String,
    /// One-shot reply subject for the original create request
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reply: String,

    /// Consumers assigned under this stream (runtime only)
    #[serde(skip)]
    pub consumers: HashMap<String, ConsumerAssignment>,
    /// Whether the create response has been emitted (runtime only)
    #[serde(skip)]
    pub responded: bool,
    /// Last error from applying this assignment locally (runtime only)
    #[serde(skip)]
    pub last_error: Option<String>,
}

impl StreamAssignment {
    /// Account this assignment belongs to; assignments committed through
    /// the gateway always carry a client.
    pub fn account(&self) -> &str {
        self.client.as_ref().map(|c| c.account.as_str()).unwrap_or("")
    }
}

/// Assignment of a consumer to a replication group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerAssignment {
    /// Requesting client, for response routing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientInfo>,
    /// Consumer name (durable name or generated)
    pub name: String,
    /// Parent stream name
    pub stream: String,
    /// Consumer configuration
    #[serde(rename = "consumer")]
    pub config: ConsumerConfig,
    /// Replication group hosting the consumer
    pub group: RaftGroup,
    /// One-shot reply subject for the original create request
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reply: String,

    /// Whether the create response has been emitted (runtime only)
    #[serde(skip)]
    pub responded: bool,
    /// Last error from applying this assignment locally (runtime only)
    #[serde(skip)]
    pub last_error: Option<String>,
}

impl ConsumerAssignment {
    /// Account this assignment belongs to.
    pub fn account(&self) -> &str {
        self.client.as_ref().map(|c| c.account.as_str()).unwrap_or("")
    }
}

/// Snapshot projection of a stream assignment: the stable fields plus the
/// consumer list, flattened for the meta snapshot blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WritableStreamAssignment {
    /// Requesting client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientInfo>,
    /// Stream configuration
    #[serde(rename = "stream")]
    pub config: StreamConfig,
    /// Replication group
    pub group: RaftGroup,
    /// Catch-up sync subject
    #[serde(default)]
    pub sync: String,
    /// Consumers assigned under the stream
    #[serde(default)]
    pub consumers: Vec<ConsumerAssignment>,
}

impl From<&StreamAssignment> for WritableStreamAssignment {
    fn from(sa: &StreamAssignment) -> Self {
        Self {
            client: sa.client.clone(),
            config: sa.config.clone(),
            group: sa.group.clone(),
            sync: sa.sync.clone(),
            consumers: sa.consumers.values().cloned().collect(),
        }
    }
}

impl From<WritableStreamAssignment> for StreamAssignment {
    fn from(wsa: WritableStreamAssignment) -> Self {
        let consumers = wsa
            .consumers
            .into_iter()
            .map(|ca| (ca.name.clone(), ca))
            .collect();
        Self {
            client: wsa.client,
            config: wsa.config,
            group: wsa.group,
            sync: wsa.sync,
            reply: String::new(),
            consumers,
            responded: false,
            last_error: None,
        }
    }
}

/// Payload of a replicated purge entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeProposal {
    /// Requesting client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientInfo>,
    /// Stream to purge
    pub stream: String,
    /// Reply subject for the purge response
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reply: String,
}

/// Payload of a replicated message delete entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgDeleteProposal {
    /// Requesting client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientInfo>,
    /// Stream to delete from
    pub stream: String,
    /// Sequence to erase
    pub seq: u64,
    /// Reply subject for the delete response
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reply: String,
}
