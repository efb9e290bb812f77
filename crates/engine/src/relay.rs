//! Transport relay contract
//!
//! The engine talks to the outside world through a subject-addressed relay:
//! API responses, catch-up traffic, and flow-control acks are all published
//! to subjects. The relay also supplies the point-in-time peer reachability
//! predicate the placement planner consults. An in-memory implementation
//! serves tests and single-process clusters.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{EngineResult, Error};
use crate::foundation::PeerId;

/// A message delivered to a subscription.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Subject the message was published on
    pub subject: String,
    /// Reply subject, empty when none
    pub reply: String,
    /// Payload
    pub payload: Bytes,
}

/// An active subscription. Dropping the receiver ends delivery.
pub struct Subscription {
    /// Subscription ID, for unsubscribing
    pub id: u64,
    /// Delivered messages
    pub rx: mpsc::UnboundedReceiver<Delivery>,
}

/// Subject-addressed message relay.
///
/// `publish` is a non-blocking enqueue. Subscription patterns support a
/// single-token `*` wildcard per position.
pub trait Relay: Send + Sync {
    /// Publish `payload` on `subject` with an optional reply subject.
    fn publish(&self, subject: &str, reply: &str, payload: Bytes) -> EngineResult<()>;

    /// Subscribe to `pattern`.
    fn subscribe(&self, pattern: &str) -> EngineResult<Subscription>;

    /// Drop the subscription with `id`.
    fn unsubscribe(&self, id: u64);

    /// Whether `peer` is currently reachable through the routing layer.
    fn is_peer_online(&self, peer: &PeerId) -> bool;
}

/// Whether `subject` matches `pattern` (token-wise, `*` matches exactly
/// one token).
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (None, None) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            _ => return false,
        }
    }
}

struct SubEntry {
    id: u64,
    pattern: String,
    tx: mpsc::UnboundedSender<Delivery>,
}

/// In-memory [`Relay`] connecting the servers of one process.
#[derive(Default)]
pub struct MemoryRelay {
    subs: Mutex<Vec<SubEntry>>,
    next_id: AtomicU64,
    offline: Mutex<HashSet<PeerId>>,
}

impl MemoryRelay {
    /// Create an empty relay.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark `peer` reachable or not for placement decisions.
    pub fn set_peer_online(&self, peer: &PeerId, online: bool) {
        let mut offline = self.offline.lock();
        if online {
            offline.remove(peer);
        } else {
            offline.insert(peer.clone());
        }
    }
}

impl Relay for MemoryRelay {
    fn publish(&self, subject: &str, reply: &str, payload: Bytes) -> EngineResult<()> {
        let delivery = Delivery {
            subject: subject.to_string(),
            reply: reply.to_string(),
            payload,
        };
        let mut subs = self.subs.lock();
        subs.retain(|sub| !sub.tx.is_closed());
        for sub in subs.iter() {
            if subject_matches(&sub.pattern, subject) {
                trace!(subject, pattern = %sub.pattern, "relay delivery");
                let _ = sub.tx.send(delivery.clone());
            }
        }
        Ok(())
    }

    fn subscribe(&self, pattern: &str) -> EngineResult<Subscription> {
        if pattern.is_empty() {
            return Err(Error::invalid_state("cannot subscribe to empty subject"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subs.lock().push(SubEntry {
            id,
            pattern: pattern.to_string(),
            tx,
        });
        Ok(Subscription { id, rx })
    }

    fn unsubscribe(&self, id: u64) {
        self.subs.lock().retain(|sub| sub.id != id);
    }

    fn is_peer_online(&self, peer: &PeerId) -> bool {
        !self.offline.lock().contains(peer)
    }
}

/// Non-blocking outbound send queue.
///
/// Producers enqueue without blocking; one forwarder task drains to the
/// relay until the engine shuts down.
#[derive(Clone)]
pub struct SendQueue {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl SendQueue {
    /// Start the forwarder task and return the queue handle.
    pub fn start(relay: Arc<dyn Relay>, shutdown: CancellationToken) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(delivery) => {
                            let _ = relay.publish(&delivery.subject, &delivery.reply, delivery.payload);
                        }
                        None => return,
                    },
                    _ = shutdown.cancelled() => return,
                }
            }
        });
        Self { tx }
    }

    /// Enqueue a message for publishing.
    pub fn send(&self, subject: impl Into<String>, reply: impl Into<String>, payload: Bytes) {
        let _ = self.tx.send(Delivery {
            subject: subject.into(),
            reply: reply.into(),
            payload,
        });
    }
}
