//! In-process consensus
//!
//! A deterministic, single-process implementation of the [`RaftNode`]
//! contract. All nodes of a group share one committed log inside a
//! [`MemoryConsensus`] hub; proposals commit immediately and fan out to
//! every online member in order. Leadership follows a simple rule: the
//! oldest online member leads while a majority of the configured peer set
//! is online. Offline members replay the latest snapshot plus the log tail
//! when they rejoin.
//!
//! This backs the integration test clusters and single-process
//! deployments; production clusters plug a real consensus implementation
//! into the same contract.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{EngineResult, Error};
use crate::foundation::{CommittedEntry, Entry, PeerId, RaftGroup};

use super::node::{NodeChannels, NodeFactory, PeerInfo, RaftNode};

struct MemberSlot {
    id: PeerId,
    online: bool,
    apply_tx: mpsc::UnboundedSender<CommittedEntry>,
    lead_tx: mpsc::UnboundedSender<bool>,
}

struct GroupInner {
    configured: Vec<PeerId>,
    members: Vec<MemberSlot>,
    leader: Option<PeerId>,
    next_index: u64,
    snapshot: Option<Bytes>,
    snapshot_index: u64,
    log: Vec<(u64, Entry)>,
}

impl GroupInner {
    fn member_mut(&mut self, id: &PeerId) -> Option<&mut MemberSlot> {
        self.members.iter_mut().find(|m| &m.id == id)
    }

    fn online_count(&self) -> usize {
        self.members.iter().filter(|m| m.online).count()
    }

    /// Elect the oldest online member while a majority of the configured
    /// peer set is online; otherwise the group goes leaderless.
    fn maybe_elect(&mut self) {
        if self.leader.is_some() {
            return;
        }
        if self.online_count() * 2 <= self.configured.len() {
            return;
        }
        if let Some(next) = self.members.iter().find(|m| m.online) {
            self.leader = Some(next.id.clone());
            let _ = next.lead_tx.send(true);
        }
    }
}

struct SharedGroup {
    name: String,
    inner: Mutex<GroupInner>,
}

/// Hub connecting the in-process nodes of one logical cluster.
#[derive(Default)]
pub struct MemoryConsensus {
    groups: DashMap<String, Arc<SharedGroup>>,
}

impl MemoryConsensus {
    /// Create an empty hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create (or re-open after a shutdown) the node for `id` in `group`.
    pub fn create_node(&self, group: &RaftGroup, id: &PeerId) -> Arc<MemoryNode> {
        let shared = self
            .groups
            .entry(group.name.clone())
            .or_insert_with(|| {
                Arc::new(SharedGroup {
                    name: group.name.clone(),
                    inner: Mutex::new(GroupInner {
                        configured: group.peers.clone(),
                        members: Vec::new(),
                        leader: None,
                        next_index: 1,
                        snapshot: None,
                        snapshot_index: 0,
                        log: Vec::new(),
                    }),
                })
            })
            .clone();

        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let (lead_tx, lead_rx) = mpsc::unbounded_channel();

        {
            let mut inner = shared.inner.lock();

            // Replay state the member missed while away: the latest
            // snapshot, then every entry committed after it.
            if let Some(snapshot) = &inner.snapshot {
                let _ = apply_tx.send(CommittedEntry {
                    index: inner.snapshot_index,
                    entries: vec![Entry::snapshot(snapshot.clone())],
                });
            }
            for (index, entry) in &inner.log {
                let _ = apply_tx.send(CommittedEntry {
                    index: *index,
                    entries: vec![entry.clone()],
                });
            }

            let slot = MemberSlot {
                id: id.clone(),
                online: true,
                apply_tx,
                lead_tx,
            };
            match inner.member_mut(id) {
                Some(existing) => *existing = slot,
                None => inner.members.push(slot),
            }
            inner.maybe_elect();
        }

        Arc::new(MemoryNode {
            id: id.clone(),
            shared,
            channels: Mutex::new(Some(NodeChannels {
                apply: apply_rx,
                leadership: lead_rx,
            })),
            quit: CancellationToken::new(),
            last_applied: AtomicU64::new(0),
        })
    }

    /// Current leader of `group`, if any.
    pub fn leader_of(&self, group: &str) -> Option<PeerId> {
        self.groups
            .get(group)
            .and_then(|shared| shared.inner.lock().leader.clone())
    }
}

/// A node of a [`MemoryConsensus`] group.
pub struct MemoryNode {
    id: PeerId,
    shared: Arc<SharedGroup>,
    channels: Mutex<Option<NodeChannels>>,
    quit: CancellationToken,
    last_applied: AtomicU64,
}

impl RaftNode for MemoryNode {
    fn id(&self) -> PeerId {
        self.id.clone()
    }

    fn group(&self) -> String {
        self.shared.name.clone()
    }

    fn is_leader(&self) -> bool {
        !self.quit.is_cancelled() && self.shared.inner.lock().leader.as_ref() == Some(&self.id)
    }

    fn is_current(&self) -> bool {
        !self.quit.is_cancelled() && self.shared.inner.lock().leader.is_some()
    }

    fn peers(&self) -> Vec<PeerInfo> {
        self.shared
            .inner
            .lock()
            .configured
            .iter()
            .map(|id| PeerInfo { id: id.clone() })
            .collect()
    }

    fn propose(&self, data: Bytes) -> EngineResult<()> {
        if self.quit.is_cancelled() {
            return Err(Error::propose(format!(
                "node for group {} is closed",
                self.shared.name
            )));
        }
        let mut inner = self.shared.inner.lock();
        if inner.leader.is_none() {
            return Err(Error::propose(format!(
                "no leader for group {}",
                self.shared.name
            )));
        }
        let index = inner.next_index;
        inner.next_index += 1;
        let entry = Entry::normal(data);
        inner.log.push((index, entry.clone()));
        for member in inner.members.iter().filter(|m| m.online) {
            let _ = member.apply_tx.send(CommittedEntry {
                index,
                entries: vec![entry.clone()],
            });
        }
        Ok(())
    }

    fn snapshot(&self, data: Bytes) -> EngineResult<()> {
        let mut inner = self.shared.inner.lock();
        inner.snapshot_index = inner.next_index.saturating_sub(1);
        inner.snapshot = Some(data);
        inner.log.clear();
        debug!(group = %self.shared.name, index = inner.snapshot_index, "installed snapshot");
        Ok(())
    }

    fn applied(&self, index: u64) {
        self.last_applied.store(index, Ordering::Release);
    }

    fn take_channels(&self) -> Option<NodeChannels> {
        self.channels.lock().take()
    }

    fn quit(&self) -> CancellationToken {
        self.quit.clone()
    }

    fn shutdown(&self) {
        if self.quit.is_cancelled() {
            return;
        }
        self.quit.cancel();
        let mut inner = self.shared.inner.lock();
        if let Some(member) = inner.member_mut(&self.id) {
            member.online = false;
        }
        if inner.leader.as_ref() == Some(&self.id) {
            inner.leader = None;
            inner.maybe_elect();
        } else if inner.online_count() * 2 <= inner.configured.len() {
            // A surviving leader cannot hold the group without a majority.
            if let Some(deposed) = inner.leader.take() {
                if let Some(member) = inner.member_mut(&deposed) {
                    if member.online {
                        let _ = member.lead_tx.send(false);
                    }
                }
            }
        }
    }
}

/// [`NodeFactory`] backed by a [`MemoryConsensus`] hub.
pub struct MemoryNodeFactory {
    hub: Arc<MemoryConsensus>,
    id: PeerId,
}

impl MemoryNodeFactory {
    /// A factory creating nodes for `id` on `hub`.
    pub fn new(hub: Arc<MemoryConsensus>, id: PeerId) -> Self {
        Self { hub, id }
    }
}

impl NodeFactory for MemoryNodeFactory {
    fn create(&self, group: &RaftGroup) -> EngineResult<Arc<dyn RaftNode>> {
        Ok(self.hub.create_node(group, &self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::StorageClass;

    fn group(name: &str, peers: &[&str]) -> RaftGroup {
        RaftGroup {
            name: name.to_string(),
            peers: peers.iter().map(|p| PeerId::from(*p)).collect(),
            storage: StorageClass::File,
            preferred: None,
        }
    }

    #[tokio::test]
    async fn first_member_of_majority_leads() {
        let hub = MemoryConsensus::new();
        let g = group("test", &["n1", "n2", "n3"]);
        let n1 = hub.create_node(&g, &PeerId::from("n1"));
        assert!(!n1.is_leader(), "no majority yet");

        let n2 = hub.create_node(&g, &PeerId::from("n2"));
        assert!(n1.is_leader());
        assert!(!n2.is_leader());
        assert_eq!(hub.leader_of("test"), Some(PeerId::from("n1")));

        let mut channels = n1.take_channels().unwrap();
        assert_eq!(channels.leadership.recv().await, Some(true));
        assert!(n1.take_channels().is_none());
    }

    #[tokio::test]
    async fn commits_fan_out_in_order() {
        let hub = MemoryConsensus::new();
        let g = group("test", &["n1", "n2"]);
        let n1 = hub.create_node(&g, &PeerId::from("n1"));
        let n2 = hub.create_node(&g, &PeerId::from("n2"));

        n1.propose(Bytes::from_static(b"a")).unwrap();
        n1.propose(Bytes::from_static(b"b")).unwrap();

        let mut channels = n2.take_channels().unwrap();
        let first = channels.apply.recv().await.unwrap();
        let second = channels.apply.recv().await.unwrap();
        assert_eq!(first.index, 1);
        assert_eq!(&first.entries[0].data[..], b"a");
        assert_eq!(second.index, 2);
        assert_eq!(&second.entries[0].data[..], b"b");
    }

    #[tokio::test]
    async fn losing_majority_goes_leaderless() {
        let hub = MemoryConsensus::new();
        let g = group("test", &["n1", "n2", "n3"]);
        let n1 = hub.create_node(&g, &PeerId::from("n1"));
        let n2 = hub.create_node(&g, &PeerId::from("n2"));
        let n3 = hub.create_node(&g, &PeerId::from("n3"));

        n1.shutdown();
        assert_eq!(hub.leader_of("test"), Some(PeerId::from("n2")));
        n2.shutdown();
        assert_eq!(hub.leader_of("test"), None);
        assert!(n3.propose(Bytes::from_static(b"x")).is_err());
    }

    #[tokio::test]
    async fn rejoin_replays_snapshot_then_tail() {
        let hub = MemoryConsensus::new();
        let g = group("test", &["n1", "n2", "n3"]);
        let n1 = hub.create_node(&g, &PeerId::from("n1"));
        let _n2 = hub.create_node(&g, &PeerId::from("n2"));
        let n3 = hub.create_node(&g, &PeerId::from("n3"));

        n1.propose(Bytes::from_static(b"a")).unwrap();
        n3.shutdown();
        n1.snapshot(Bytes::from_static(b"snap")).unwrap();
        n1.propose(Bytes::from_static(b"b")).unwrap();

        let n3 = hub.create_node(&g, &PeerId::from("n3"));
        let mut channels = n3.take_channels().unwrap();
        let snap = channels.apply.recv().await.unwrap();
        assert!(matches!(
            snap.entries[0].entry_type,
            crate::foundation::EntryType::Snapshot
        ));
        assert_eq!(&snap.entries[0].data[..], b"snap");
        let tail = channels.apply.recv().await.unwrap();
        assert_eq!(&tail.entries[0].data[..], b"b");
    }
}
