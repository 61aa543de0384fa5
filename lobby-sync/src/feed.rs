//! ReplicatedFeed: one lobby's log plus its peer channel, as event streams.
//!
//! Lifecycle:
//! ```text
//!  create ──► Idle ──connect──► Connecting ──► Connected ◄──┐
//!                                  │              │         │ connect
//!                                  │ destroy      │ disconnect (resume)
//!                                  ▼              ▼         │
//!                              Destroyed ◄──── Disconnected ┘
//! ```
//!
//! `create` never touches the network. `connect` opens the log (writable only
//! for the server role), takes a reference on the shared transport and joins
//! the lobby topic with the participant's identity key as peer key. A
//! `disconnect` only detaches listeners; the next `connect` resumes without
//! reopening or rejoining.
//!
//! Every subscriber gets its own channel. New subscribers first receive a
//! `PeerJoin` for each peer currently connected.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lobby_core::{Identity, LobbyId, PublicKey, SecretKey, SessionRecord};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{AbortHandle, JoinHandle};

use crate::error::{LobbyError, Result};
use crate::lock;
use crate::protocol::{PeerMessage, SignedMessage};
use crate::storage::{AppendLog, LogEvent, LogOptions, LogProvider};
use crate::transport::SharedTransport;

/// Which side of a lobby this participant plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Log owner and single structural writer
    Server,
    Client,
}

/// Feed tuning.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Entries per reverse batch when scanning the log
    pub read_batch_size: u64,
    /// Records buffered per tail reader before the reader applies backpressure
    pub event_capacity: usize,
    /// Upper bound on opening the log
    pub ready_timeout: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            read_batch_size: 5,
            event_capacity: 256,
            ready_timeout: Duration::from_secs(10),
        }
    }
}

impl FeedConfig {
    pub fn for_testing() -> Self {
        Self {
            read_batch_size: 2,
            event_capacity: 64,
            ready_timeout: Duration::from_secs(1),
        }
    }
}

/// Process-wide collaborators shared by every feed.
#[derive(Clone)]
pub struct FeedContext {
    pub logs: Arc<dyn LogProvider>,
    pub transport: SharedTransport,
    pub config: FeedConfig,
}

impl FeedContext {
    pub fn new(logs: Arc<dyn LogProvider>, transport: SharedTransport) -> Self {
        Self {
            logs,
            transport,
            config: FeedConfig::default(),
        }
    }

    pub fn with_config(mut self, config: FeedConfig) -> Self {
        self.config = config;
        self
    }
}

/// Peer-level notifications delivered to feed subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    PeerJoin(PublicKey),
    PeerLeave(PublicKey),
    /// Raw extension bytes; `from` is the transport-level sender.
    Message { from: PublicKey, bytes: Vec<u8> },
}

/// A subscriber's event stream.
pub struct FeedEvents {
    rx: mpsc::UnboundedReceiver<FeedEvent>,
}

impl FeedEvents {
    /// Next event, or `None` once the feed detached this subscriber.
    pub async fn recv(&mut self) -> Option<FeedEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<FeedEvent> {
        self.rx.try_recv().ok()
    }
}

/// A decoded log record and its position.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedRecord {
    pub seq: u64,
    pub record: SessionRecord,
}

/// Forward reader delivering records in strict sequence order.
pub struct TailReader {
    rx: mpsc::Receiver<FeedRecord>,
}

impl TailReader {
    pub async fn recv(&mut self) -> Option<FeedRecord> {
        self.rx.recv().await
    }
}

/// Lazy newest-first reader over the records present when it was created.
pub struct RangeReader {
    log: Arc<dyn AppendLog>,
    batch: u64,
    cursor: u64,
}

impl RangeReader {
    /// The next-older batch, newest first. `None` once the start is reached.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<FeedRecord>>> {
        if self.cursor == 0 {
            return Ok(None);
        }
        let start = self.cursor.saturating_sub(self.batch);
        let entries = self.log.read_range(start, self.cursor).await?;
        self.cursor = start;

        let mut records: Vec<FeedRecord> = entries
            .into_iter()
            .filter_map(|entry| match SessionRecord::decode(&entry.data) {
                Ok(record) => Some(FeedRecord {
                    seq: entry.seq,
                    record,
                }),
                Err(e) => {
                    log::warn!("skipping undecodable record at seq {}: {e}", entry.seq);
                    None
                }
            })
            .collect();
        records.reverse();
        Ok(Some(records))
    }

    /// Start over from the current end of the log.
    pub fn restart(&mut self) {
        self.cursor = self.log.len();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Destroyed,
}

struct FeedInner {
    phase: Phase,
    log: Option<Arc<dyn AppendLog>>,
    joined: bool,
    holds_transport: bool,
    pump: Option<JoinHandle<()>>,
    tails: Vec<AbortHandle>,
    subscribers: Vec<mpsc::UnboundedSender<FeedEvent>>,
    peers: BTreeSet<PublicKey>,
}

impl FeedInner {
    fn emit(&mut self, event: FeedEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn peer_joined(&mut self, peer: PublicKey) {
        if self.peers.insert(peer) {
            self.emit(FeedEvent::PeerJoin(peer));
        }
    }

    fn peer_left(&mut self, peer: PublicKey) {
        if self.peers.remove(&peer) {
            self.emit(FeedEvent::PeerLeave(peer));
        }
    }

    /// Replace the peer set, firing one event per difference.
    fn resync_peers(&mut self, current: BTreeSet<PublicKey>) {
        let gone: Vec<_> = self.peers.difference(&current).copied().collect();
        let new: Vec<_> = current.difference(&self.peers).copied().collect();
        for peer in gone {
            self.peer_left(peer);
        }
        for peer in new {
            self.peer_joined(peer);
        }
    }

    fn detach(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        for tail in self.tails.drain(..) {
            tail.abort();
        }
        self.subscribers.clear();
    }
}

/// The replicated log and peer channel of one lobby.
pub struct ReplicatedFeed {
    role: Role,
    id: LobbyId,
    identity: Identity,
    secret: Option<SecretKey>,
    ctx: FeedContext,
    inner: Arc<Mutex<FeedInner>>,
    /// Held for the whole of a connect so concurrent callers wait for it
    connecting: tokio::sync::Mutex<()>,
}

impl ReplicatedFeed {
    /// Build a feed without touching the network.
    ///
    /// A client needs an id. A server without an id starts a new log under a
    /// fresh keypair (or under `server_secret` when given).
    pub fn create(
        role: Role,
        id: Option<&str>,
        identity: Identity,
        server_secret: Option<SecretKey>,
        ctx: FeedContext,
    ) -> Result<Self> {
        let (id, secret) = match (role, id) {
            (Role::Client, id) => (LobbyId::decode(id.unwrap_or_default())?, None),
            (Role::Server, Some(id)) => (LobbyId::decode(id)?, server_secret),
            (Role::Server, None) => {
                let secret = server_secret.unwrap_or_else(SecretKey::generate);
                (LobbyId::from_public_key(secret.public()), Some(secret))
            }
        };
        Ok(Self {
            role,
            id,
            identity,
            secret,
            ctx,
            connecting: tokio::sync::Mutex::new(()),
            inner: Arc::new(Mutex::new(FeedInner {
                phase: Phase::Idle,
                log: None,
                joined: false,
                holds_transport: false,
                pump: None,
                tails: Vec::new(),
                subscribers: Vec::new(),
                peers: BTreeSet::new(),
            })),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn id(&self) -> LobbyId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The log secret, held only by a server.
    pub fn secret(&self) -> Option<&SecretKey> {
        self.secret.as_ref()
    }

    pub fn config(&self) -> &FeedConfig {
        &self.ctx.config
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner).phase == Phase::Connected
    }

    pub fn is_destroyed(&self) -> bool {
        lock(&self.inner).phase == Phase::Destroyed
    }

    /// Peers currently connected on this lobby's topic.
    pub fn peers(&self) -> Vec<PublicKey> {
        lock(&self.inner).peers.iter().copied().collect()
    }

    /// Number of log entries held locally.
    pub fn len(&self) -> u64 {
        lock(&self.inner).log.as_ref().map_or(0, |log| log.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_destroyed_now(&self) -> bool {
        lock(&self.inner).phase == Phase::Destroyed
    }

    /// Open the log, join the topic and start the event pump.
    ///
    /// A second call while one is in flight waits for it and then observes
    /// its outcome.
    pub async fn connect(&self) -> Result<()> {
        let _connecting = self.connecting.lock().await;
        {
            let mut inner = lock(&self.inner);
            match inner.phase {
                Phase::Destroyed => return Err(LobbyError::Destroyed),
                Phase::Connected => return Ok(()),
                Phase::Disconnected => {
                    if let Some(log) = inner.log.clone() {
                        let current: BTreeSet<_> = log.peers().into_iter().collect();
                        inner.resync_peers(current);
                        inner.pump = Some(self.spawn_pump(log));
                        inner.phase = Phase::Connected;
                        log::debug!("feed {} resumed", self.id.public_key().fmt_short());
                        return Ok(());
                    }
                    inner.phase = Phase::Connecting;
                }
                Phase::Idle | Phase::Connecting => inner.phase = Phase::Connecting,
            }
        }

        let result = self.open_and_join().await;
        if result.is_err() {
            let mut inner = lock(&self.inner);
            if inner.phase == Phase::Connecting {
                inner.phase = Phase::Idle;
            }
        }
        result
    }

    async fn open_and_join(&self) -> Result<()> {
        let options = match self.role {
            Role::Client => LogOptions::read_only(),
            Role::Server => LogOptions::owner(self.secret.clone().ok_or_else(|| {
                LobbyError::LogOpen("server does not hold the secret for this lobby".into())
            })?),
        };
        let opened = tokio::time::timeout(
            self.ctx.config.ready_timeout,
            self.ctx.logs.open(*self.id.public_key(), options),
        )
        .await
        .map_err(|_| LobbyError::LogOpen("timed out waiting for the log".into()))??;
        if self.is_destroyed_now() {
            opened.close().await;
            return Err(LobbyError::Destroyed);
        }

        if let Err(e) = self.ctx.transport.acquire().await {
            opened.close().await;
            return Err(e);
        }
        if self.is_destroyed_now() {
            opened.close().await;
            self.ctx.transport.release().await;
            return Err(LobbyError::Destroyed);
        }

        // Subscribe before joining so the peers found by the join are seen.
        let events = opened.subscribe();
        let transport = self.ctx.transport.transport();
        if let Err(e) = transport
            .join(&self.id, self.identity.public, opened.clone())
            .await
        {
            opened.close().await;
            self.ctx.transport.release().await;
            return Err(e);
        }

        let destroyed = {
            let mut inner = lock(&self.inner);
            if inner.phase == Phase::Destroyed {
                true
            } else {
                let current: BTreeSet<_> = opened.peers().into_iter().collect();
                inner.resync_peers(current);
                inner.pump = Some(self.spawn_pump_with(opened.clone(), events));
                inner.log = Some(opened.clone());
                inner.joined = true;
                inner.holds_transport = true;
                inner.phase = Phase::Connected;
                false
            }
        };
        if destroyed {
            transport.leave(&self.id, &self.identity.public).await;
            opened.close().await;
            self.ctx.transport.release().await;
            return Err(LobbyError::Destroyed);
        }
        log::info!(
            "feed {} connected as {:?} (peer {})",
            self.id.public_key().fmt_short(),
            self.role,
            self.identity.public.fmt_short()
        );
        Ok(())
    }

    fn spawn_pump(&self, log: Arc<dyn AppendLog>) -> JoinHandle<()> {
        let events = log.subscribe();
        self.spawn_pump_with(log, events)
    }

    fn spawn_pump_with(
        &self,
        log: Arc<dyn AppendLog>,
        mut events: broadcast::Receiver<LogEvent>,
    ) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(LogEvent::PeerOpen(peer)) => lock(&inner).peer_joined(peer),
                    Ok(LogEvent::PeerRemove(peer)) => lock(&inner).peer_left(peer),
                    Ok(LogEvent::Message { from, data }) => {
                        lock(&inner).emit(FeedEvent::Message { from, bytes: data })
                    }
                    Ok(LogEvent::Appended { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        log::warn!("feed pump lagged by {missed} events, resyncing peers");
                        let current: BTreeSet<_> = log.peers().into_iter().collect();
                        lock(&inner).resync_peers(current);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Detach the event pump, tail readers and subscribers. The log stays
    /// open and the topic stays joined.
    pub fn disconnect(&self) {
        let mut inner = lock(&self.inner);
        if inner.phase == Phase::Connected {
            inner.detach();
            inner.phase = Phase::Disconnected;
            log::debug!("feed {} disconnected", self.id.public_key().fmt_short());
        }
    }

    /// Tear everything down. Idempotent; a `connect` still in flight cleans
    /// up after itself and returns [`LobbyError::Destroyed`].
    pub async fn destroy(&self) {
        let (log, joined, holds_transport) = {
            let mut inner = lock(&self.inner);
            let previous = inner.phase;
            if previous == Phase::Destroyed {
                return;
            }
            inner.phase = Phase::Destroyed;
            inner.detach();
            inner.peers.clear();
            if previous == Phase::Connecting && inner.log.is_none() {
                return;
            }
            (
                inner.log.take(),
                std::mem::take(&mut inner.joined),
                std::mem::take(&mut inner.holds_transport),
            )
        };

        if joined {
            self.ctx
                .transport
                .transport()
                .leave(&self.id, &self.identity.public)
                .await;
        }
        if let Some(log) = log {
            log.close().await;
        }
        if holds_transport {
            self.ctx.transport.release().await;
        }
        log::info!("feed {} destroyed", self.id.public_key().fmt_short());
    }

    fn open_log(&self) -> Result<Arc<dyn AppendLog>> {
        let inner = lock(&self.inner);
        match (inner.phase, &inner.log) {
            (Phase::Destroyed, _) => Err(LobbyError::Destroyed),
            (_, Some(log)) => Ok(log.clone()),
            (_, None) => Err(LobbyError::NotConnected),
        }
    }

    /// Append a record. Only the server can write.
    pub async fn append(&self, record: &SessionRecord) -> Result<u64> {
        if self.role != Role::Server {
            return Err(LobbyError::NotWritable);
        }
        let log = self.open_log()?;
        if !log.writable() {
            return Err(LobbyError::NotWritable);
        }
        let seq = log.append(record.encode()?).await?;
        log::debug!("appended record {seq} to {}", self.id.public_key().fmt_short());
        Ok(seq)
    }

    /// Records from `from` onwards, including ones appended later, in strict
    /// order.
    pub fn read_tail(&self, from: u64) -> Result<TailReader> {
        let log = self.open_log()?;
        let (tx, rx) = mpsc::channel(self.ctx.config.event_capacity.max(1));
        let mut events = log.subscribe();

        let task = tokio::spawn(async move {
            let mut next = from;
            loop {
                let len = log.len();
                if next < len {
                    let entries = match log.read_range(next, len).await {
                        Ok(entries) => entries,
                        Err(e) => {
                            log::error!("tail read failed at seq {next}: {e}");
                            break;
                        }
                    };
                    for entry in entries {
                        next = entry.seq + 1;
                        match SessionRecord::decode(&entry.data) {
                            Ok(record) => {
                                let item = FeedRecord {
                                    seq: entry.seq,
                                    record,
                                };
                                if tx.send(item).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => log::warn!("skipping undecodable record at seq {}: {e}", entry.seq),
                        }
                    }
                    continue;
                }
                match events.recv().await {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        lock(&self.inner).tails.push(task.abort_handle());
        Ok(TailReader { rx })
    }

    /// Reverse-chronological batches over the current log.
    pub fn read_range(&self) -> Result<RangeReader> {
        let log = self.open_log()?;
        let cursor = log.len();
        Ok(RangeReader {
            log,
            batch: self.ctx.config.read_batch_size.max(1),
            cursor,
        })
    }

    /// Sign and send a message to one peer. Best-effort.
    pub fn send_to_peer(&self, peer: &PublicKey, message: &PeerMessage) -> Result<()> {
        let bytes = SignedMessage::seal(&self.identity, message)?;
        self.open_log()?.send(bytes, peer)
    }

    /// Sign and send a message to every connected peer. Returns the fan-out.
    pub fn broadcast(&self, message: &PeerMessage) -> Result<usize> {
        let bytes = SignedMessage::seal(&self.identity, message)?;
        Ok(self.open_log()?.broadcast(bytes))
    }

    /// A new event stream, primed with the current peer set.
    pub fn subscribe(&self) -> FeedEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = lock(&self.inner);
        for peer in &inner.peers {
            let _ = tx.send(FeedEvent::PeerJoin(*peer));
        }
        if inner.phase != Phase::Destroyed {
            inner.subscribers.push(tx);
        }
        FeedEvents { rx }
    }
}

impl std::fmt::Debug for ReplicatedFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedFeed")
            .field("role", &self.role)
            .field("id", &self.id)
            .field("peer", &self.identity.public)
            .finish_non_exhaustive()
    }
}
