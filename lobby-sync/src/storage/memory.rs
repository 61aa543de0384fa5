//! In-process log replication and transport.
//!
//! Architecture:
//! ```text
//!  MemoryNode (process A)            MemoryNode (process B)
//!  ┌──────────────────────┐          ┌──────────────────────┐
//!  │ MemoryLog (key K)    │◄────────►│ MemoryLog (key K)    │
//!  └──────────┬───────────┘  pull /  └──────────┬───────────┘
//!             │             messages            │
//!             └──────────► MemoryNetwork ◄──────┘
//!                          topic K → [peer A, peer B]
//! ```
//!
//! Every node joined to a topic is connected to every other. On join, and
//! after every append, replicas pull the entries they are missing and keep
//! only the verified, gapless run. Extension messages are stamped with the
//! sending peer's key by the network, so a receiver can trust `from`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use lobby_core::{LobbyId, PublicKey, SecretKey};
use tokio::sync::broadcast;

use super::append_log::{AppendLog, LogEntry, LogEvent, LogOptions, LogProvider};
use crate::error::{LobbyError, Result};
use crate::lock;
use crate::transport::Transport;

/// Events buffered per log subscriber before it starts lagging.
const EVENT_CAPACITY: usize = 256;

#[derive(Clone)]
struct TopicMember {
    peer: PublicKey,
    log: Arc<MemoryLog>,
}

/// The simulated network: topic membership shared by all nodes.
#[derive(Default)]
pub struct MemoryNetwork {
    topics: Mutex<HashMap<LobbyId, Vec<TopicMember>>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A new node (one per simulated process).
    pub fn node(self: &Arc<Self>) -> Arc<MemoryNode> {
        Arc::new(MemoryNode::new(self.clone()))
    }

    /// Peers currently joined to `topic`.
    pub fn topic_peers(&self, topic: &LobbyId) -> Vec<PublicKey> {
        lock(&self.topics)
            .get(topic)
            .map(|members| members.iter().map(|m| m.peer).collect())
            .unwrap_or_default()
    }

    fn join(&self, topic: &LobbyId, peer: PublicKey, log: Arc<MemoryLog>) {
        let others = {
            let mut topics = lock(&self.topics);
            let members = topics.entry(*topic).or_default();
            if members.iter().any(|m| m.peer == peer) {
                return;
            }
            let others = members.clone();
            members.push(TopicMember {
                peer,
                log: log.clone(),
            });
            others
        };

        log.set_local_peer(Some(peer));
        for other in others.iter().filter(|m| !Arc::ptr_eq(&m.log, &log)) {
            log.connect_peer(other.peer, &other.log);
            other.log.connect_peer(peer, &log);
        }
        for other in others.iter().filter(|m| !Arc::ptr_eq(&m.log, &log)) {
            log.pull_from(&other.log);
            other.log.pull_from(&log);
        }
        log::debug!(
            "peer {} joined topic {topic:?} ({} others)",
            peer.fmt_short(),
            others.len()
        );
    }

    fn leave(&self, topic: &LobbyId, peer: &PublicKey) {
        let (left, others) = {
            let mut topics = lock(&self.topics);
            let Some(members) = topics.get_mut(topic) else {
                return;
            };
            let Some(pos) = members.iter().position(|m| &m.peer == peer) else {
                return;
            };
            let left = members.remove(pos);
            let others = members.clone();
            if members.is_empty() {
                topics.remove(topic);
            }
            (left, others)
        };

        for other in &others {
            other.log.disconnect_peer(peer);
            left.log.disconnect_peer(&other.peer);
        }
        left.log.set_local_peer(None);
        log::debug!("peer {} left topic {topic:?}", peer.fmt_short());
    }
}

/// A replica of one log held by one node.
pub struct MemoryLog {
    key: PublicKey,
    secret: Option<SecretKey>,
    entries: RwLock<Vec<LogEntry>>,
    peers: Mutex<HashMap<PublicKey, Weak<MemoryLog>>>,
    local_peer: Mutex<Option<PublicKey>>,
    events: broadcast::Sender<LogEvent>,
    closed: AtomicBool,
}

impl MemoryLog {
    fn new(key: PublicKey, secret: Option<SecretKey>, entries: Vec<LogEntry>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            key,
            secret,
            entries: RwLock::new(entries),
            peers: Mutex::new(HashMap::new()),
            local_peer: Mutex::new(None),
            events,
            closed: AtomicBool::new(false),
        }
    }

    fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_local_peer(&self, peer: Option<PublicKey>) {
        *lock(&self.local_peer) = peer;
    }

    fn connect_peer(&self, peer: PublicKey, log: &Arc<MemoryLog>) {
        let fresh = lock(&self.peers)
            .insert(peer, Arc::downgrade(log))
            .is_none();
        if fresh {
            let _ = self.events.send(LogEvent::PeerOpen(peer));
        }
    }

    fn disconnect_peer(&self, peer: &PublicKey) {
        if lock(&self.peers).remove(peer).is_some() {
            let _ = self.events.send(LogEvent::PeerRemove(*peer));
        }
    }

    fn deliver(&self, from: PublicKey, data: Vec<u8>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let _ = self.events.send(LogEvent::Message { from, data });
    }

    fn connected_peers(&self) -> Vec<(PublicKey, Arc<MemoryLog>)> {
        lock(&self.peers)
            .iter()
            .filter_map(|(key, weak)| weak.upgrade().map(|log| (*key, log)))
            .collect()
    }

    /// Copy the entries `source` has beyond our length.
    fn pull_from(&self, source: &MemoryLog) -> usize {
        let start = self.len() as usize;
        let available: Vec<LogEntry> = {
            let theirs = source.entries.read().unwrap_or_else(PoisonError::into_inner);
            theirs.get(start..).map(<[LogEntry]>::to_vec).unwrap_or_default()
        };
        if available.is_empty() {
            return 0;
        }
        self.ingest(available)
    }

    /// Accept replicated entries, keeping the verified gapless run that
    /// extends the local log. Returns how many were appended.
    pub fn ingest(&self, entries: Vec<LogEntry>) -> usize {
        let (added, len) = {
            let mut ours = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            let start = ours.len() as u64;
            let (accepted, rejected) = LogEntry::verified_run(&self.key, start, entries);
            if rejected > 0 {
                log::debug!(
                    "log {}: ignored {rejected} entries not extending seq {start}",
                    self.key.fmt_short()
                );
            }
            let added = accepted.len();
            ours.extend(accepted);
            (added, ours.len() as u64)
        };
        if added > 0 {
            let _ = self.events.send(LogEvent::Appended { len });
        }
        added
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl AppendLog for MemoryLog {
    fn key(&self) -> PublicKey {
        self.key
    }

    fn writable(&self) -> bool {
        self.secret.is_some()
    }

    fn len(&self) -> u64 {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len() as u64
    }

    async fn append(&self, data: Vec<u8>) -> Result<u64> {
        let Some(secret) = &self.secret else {
            return Err(LobbyError::NotWritable);
        };
        if self.is_closed() {
            return Err(LobbyError::Destroyed);
        }
        let (seq, len) = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            let seq = entries.len() as u64;
            entries.push(LogEntry::sign(secret, seq, data));
            (seq, seq + 1)
        };
        let _ = self.events.send(LogEvent::Appended { len });

        for (_, peer) in self.connected_peers() {
            peer.pull_from(self);
        }
        Ok(seq)
    }

    async fn read_range(&self, start: u64, end: u64) -> Result<Vec<LogEntry>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let end = end.min(entries.len() as u64);
        if start >= end {
            return Ok(Vec::new());
        }
        Ok(entries[start as usize..end as usize].to_vec())
    }

    fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.events.subscribe()
    }

    fn peers(&self) -> Vec<PublicKey> {
        self.connected_peers().into_iter().map(|(key, _)| key).collect()
    }

    fn send(&self, data: Vec<u8>, peer: &PublicKey) -> Result<()> {
        let from = (*lock(&self.local_peer)).ok_or(LobbyError::NotConnected)?;
        let target = lock(&self.peers)
            .get(peer)
            .and_then(Weak::upgrade)
            .ok_or(LobbyError::UnknownPeer(*peer))?;
        target.deliver(from, data);
        Ok(())
    }

    fn broadcast(&self, data: Vec<u8>) -> usize {
        let Some(from) = *lock(&self.local_peer) else {
            return 0;
        };
        let peers = self.connected_peers();
        for (_, peer) in &peers {
            peer.deliver(from, data.clone());
        }
        peers.len()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Counters for a node, mostly for tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStats {
    pub connects: u64,
    pub closes: u64,
    pub joins: u64,
    pub leaves: u64,
    pub opens: u64,
}

#[derive(Default)]
struct AtomicNodeStats {
    connects: AtomicU64,
    closes: AtomicU64,
    joins: AtomicU64,
    leaves: AtomicU64,
    opens: AtomicU64,
}

/// One simulated process: local log storage plus a transport endpoint.
pub struct MemoryNode {
    network: Arc<MemoryNetwork>,
    logs: Mutex<HashMap<PublicKey, Arc<MemoryLog>>>,
    connected: AtomicBool,
    stats: AtomicNodeStats,
}

impl MemoryNode {
    fn new(network: Arc<MemoryNetwork>) -> Self {
        Self {
            network,
            logs: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            stats: AtomicNodeStats::default(),
        }
    }

    /// The open replica of `key` on this node, if any.
    pub fn log(&self, key: &PublicKey) -> Option<Arc<MemoryLog>> {
        lock(&self.logs)
            .get(key)
            .filter(|log| !log.is_closed())
            .cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> NodeStats {
        NodeStats {
            connects: self.stats.connects.load(Ordering::Relaxed),
            closes: self.stats.closes.load(Ordering::Relaxed),
            joins: self.stats.joins.load(Ordering::Relaxed),
            leaves: self.stats.leaves.load(Ordering::Relaxed),
            opens: self.stats.opens.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl LogProvider for MemoryNode {
    async fn open(&self, key: PublicKey, options: LogOptions) -> Result<Arc<dyn AppendLog>> {
        let secret = if options.writable {
            match options.secret {
                Some(secret) if secret.public() == key => Some(secret),
                Some(_) => {
                    return Err(LobbyError::LogOpen(
                        "secret does not match the log key".into(),
                    ))
                }
                None => {
                    return Err(LobbyError::LogOpen(
                        "writable log requested without its secret".into(),
                    ))
                }
            }
        } else {
            None
        };

        let mut logs = lock(&self.logs);
        if let Some(existing) = logs.get(&key).filter(|log| !log.is_closed()) {
            if secret.is_some() && !existing.writable() {
                return Err(LobbyError::LogOpen("log already open read-only".into()));
            }
            return Ok(existing.clone() as Arc<dyn AppendLog>);
        }

        // Local storage survives close; a reopen starts from it.
        let stored = logs.get(&key).map(|log| log.entries()).unwrap_or_default();
        let log = Arc::new(MemoryLog::new(key, secret, stored));
        logs.insert(key, log.clone());
        self.stats.opens.fetch_add(1, Ordering::Relaxed);
        Ok(log as Arc<dyn AppendLog>)
    }
}

#[async_trait]
impl Transport for MemoryNode {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::Release);
        self.stats.connects.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn join(&self, topic: &LobbyId, peer: PublicKey, log: Arc<dyn AppendLog>) -> Result<()> {
        if !self.is_connected() {
            return Err(LobbyError::NotConnected);
        }
        let replica = self
            .log(&log.key())
            .ok_or_else(|| LobbyError::LogOpen("log is not open on this node".into()))?;
        self.network.join(topic, peer, replica);
        self.stats.joins.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn leave(&self, topic: &LobbyId, peer: &PublicKey) {
        self.network.leave(topic, peer);
        self.stats.leaves.fetch_add(1, Ordering::Relaxed);
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::Release);
        self.stats.closes.fetch_add(1, Ordering::Relaxed);
    }
}
