//! Error types for the coordination core

use std::fmt;

use thiserror::Error;

use crate::foundation::PeerId;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, Error>;

/// Main error type for the coordination core
#[derive(Debug, Error)]
pub struct Error {
    /// Error kind
    kind: ErrorKind,
    /// Error context
    context: ErrorContext,
}

impl Error {
    /// Create a new error
    pub fn new(kind: ErrorKind, context: ErrorContext) -> Self {
        Self { kind, context }
    }

    /// Create error with string context
    pub fn with_context(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: ErrorContext::Message(context.into()),
        }
    }

    /// Get error kind
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::NotFound, what)
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Decode, msg)
    }

    /// Create a propose error
    pub fn propose(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Propose, msg)
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Storage, msg)
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Configuration, msg)
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::InvalidState, msg)
    }

    /// Create an insufficient resources error
    pub fn insufficient_resources(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::InsufficientResources, msg)
    }

    /// Create a not leader error
    pub fn not_leader(msg: impl Into<String>, current_leader: Option<PeerId>) -> Self {
        Self {
            kind: ErrorKind::NotLeader,
            context: ErrorContext::Leadership {
                message: msg.into(),
                current_leader,
            },
        }
    }

    /// Check if this is a not-leader error
    pub fn is_not_leader(&self) -> bool {
        matches!(self.kind, ErrorKind::NotLeader)
    }

    /// Check if this is a benign last-sequence mismatch
    pub fn is_last_seq_mismatch(&self) -> bool {
        matches!(self.kind, ErrorKind::LastSeqMismatch)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            ErrorContext::Message(msg) => write!(f, "{}: {}", self.kind, msg),
            ErrorContext::Chain { message, source } => {
                write!(f, "{}: {} (caused by: {})", self.kind, message, source)
            }
            ErrorContext::Leadership {
                message,
                current_leader,
            } => {
                if let Some(leader) = current_leader {
                    write!(f, "{}: {} (current leader: {})", self.kind, message, leader)
                } else {
                    write!(f, "{}: {} (no known leader)", self.kind, message)
                }
            }
        }
    }
}

/// Error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Refusing a write on a non-leader
    NotLeader,
    /// Clustered streaming is not enabled on this server
    NotEnabled,
    /// This server is not part of a cluster
    NotClustered,
    /// Placement could not find enough peers
    InsufficientResources,
    /// Stream, consumer, or sequence absent
    NotFound,
    /// Corrupt log entry or protocol mismatch
    Decode,
    /// Consensus node refused the proposal
    Propose,
    /// Benign apply-time sequence mismatch, skip the entry
    LastSeqMismatch,
    /// Storage error
    Storage,
    /// Configuration error
    Configuration,
    /// Invalid state for operation
    InvalidState,
    /// Internal error
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::NotLeader => write!(f, "not the leader"),
            ErrorKind::NotEnabled => write!(f, "clustered streaming not enabled"),
            ErrorKind::NotClustered => write!(f, "server not clustered"),
            ErrorKind::InsufficientResources => write!(f, "insufficient resources"),
            ErrorKind::NotFound => write!(f, "not found"),
            ErrorKind::Decode => write!(f, "decode error"),
            ErrorKind::Propose => write!(f, "propose error"),
            ErrorKind::LastSeqMismatch => write!(f, "last sequence mismatch"),
            ErrorKind::Storage => write!(f, "storage error"),
            ErrorKind::Configuration => write!(f, "configuration error"),
            ErrorKind::InvalidState => write!(f, "invalid state"),
            ErrorKind::Internal => write!(f, "internal error"),
        }
    }
}

/// Error context
#[derive(Debug)]
pub enum ErrorContext {
    /// Simple message
    Message(String),
    /// Error chain with source
    Chain {
        /// Error message
        message: String,
        /// Source error
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// Leadership error with info
    Leadership {
        /// Error message
        message: String,
        /// Current leader if known
        current_leader: Option<PeerId>,
    },
}

impl From<weir_storage::StorageError> for Error {
    fn from(err: weir_storage::StorageError) -> Self {
        match err {
            weir_storage::StorageError::NoMessage(seq) => {
                Self::not_found(format!("no message for sequence {seq}"))
            }
            other => Self {
                kind: ErrorKind::Storage,
                context: ErrorContext::Chain {
                    message: "store operation failed".to_string(),
                    source: Box::new(other),
                },
            },
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self {
            kind: ErrorKind::Decode,
            context: ErrorContext::Chain {
                message: "serialization error".to_string(),
                source: Box::new(err),
            },
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self {
            kind: ErrorKind::Internal,
            context: ErrorContext::Chain {
                message: "io error".to_string(),
                source: Box::new(err),
            },
        }
    }
}
