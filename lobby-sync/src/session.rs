//! Lobby sessions: bootstrap, single-writer authority and join negotiation.
//!
//! ```text
//!            ┌──────────── ReplicatedFeed ────────────┐
//!            │  log (ordered)        peers (unordered) │
//!            └─────┬─────────────────────────┬─────────┘
//!     Server:      │ append SetState/Patch   │ Join ─► verify ─► admit
//!     Client:      │ tail ─► apply           │ PrivateState ─► store
//!                  ▼                         ▼
//!            SessionSnapshot ── watch ──► UI / owner
//! ```
//!
//! Only the server writes structural changes. It stages mutations on a copy
//! of the document and appends one `StatePatch` per commit. Clients rebuild
//! the document from the log and never write to it; their only lever is a
//! signed join request addressed to the owner, sent once per entry into
//! `WaitingForJoin`.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use lobby_core::{
    apply_to_state, derive_connection_state, diff_state, Bootstrap, BootstrapResult,
    ClientPrivateState, ConnectionInputs, ConnectionState, Identity, JoinTrigger, LobbyId,
    PublicKey, SessionRecord, SharedState, User,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{LobbyError, Result};
use crate::feed::{FeedEvent, FeedEvents, FeedRecord, ReplicatedFeed, Role, TailReader};
use crate::lock;
use crate::protocol::{PeerMessage, SignedMessage, VerifiedMessage};

/// Names used when building a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// This participant's display name
    pub display_name: String,
    /// Name given to a new lobby document (server only)
    pub lobby_name: String,
}

impl SessionOptions {
    pub fn new(display_name: impl Into<String>) -> Self {
        let display_name = display_name.into();
        Self {
            lobby_name: format!("{display_name}'s lobby"),
            display_name,
        }
    }

    pub fn with_lobby_name(mut self, name: impl Into<String>) -> Self {
        self.lobby_name = name.into();
        self
    }
}

/// Everything observers need about a session, published on every change.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub id: LobbyId,
    pub role: Role,
    pub local_user: Option<PublicKey>,
    pub shared: Option<SharedState>,
    /// Peers connected right now, including this participant once connected
    pub online: BTreeSet<PublicKey>,
    /// Latest private state per member, keyed by sender
    pub private: HashMap<PublicKey, ClientPrivateState>,
    pub error: Option<String>,
    pub latest_seq: Option<u64>,
    pub connection: ConnectionState,
}

impl SessionSnapshot {
    fn new(id: LobbyId, role: Role) -> Self {
        Self {
            id,
            role,
            local_user: None,
            shared: None,
            online: BTreeSet::new(),
            private: HashMap::new(),
            error: None,
            latest_seq: None,
            connection: ConnectionState::Disconnected,
        }
    }

    fn recompute(&mut self) {
        self.connection = derive_connection_state(&ConnectionInputs {
            local_user: self.local_user.as_ref(),
            error: self.error.as_deref(),
            shared: self.shared.as_ref(),
            online: &self.online,
        });
    }

    pub fn is_owner_online(&self) -> bool {
        self.shared
            .as_ref()
            .is_some_and(|s| self.online.contains(&s.owner_public_key))
    }
}

/// Rebuild the shared document by scanning the log newest first.
///
/// Patches are collected until a `SetState` is reached, then applied
/// forward on top of it. `latest` is `None` only for an empty log.
pub async fn build_initial_state(feed: &ReplicatedFeed) -> Result<BootstrapResult> {
    let mut reader = feed.read_range()?;
    let mut bootstrap = Bootstrap::new();
    'scan: while let Some(batch) = reader.next_batch().await? {
        for FeedRecord { seq, record } in batch {
            if bootstrap.push(seq, record) {
                break 'scan;
            }
        }
    }
    Ok(bootstrap.finish()?)
}

/// State and plumbing common to both roles.
struct SessionCore {
    feed: Arc<ReplicatedFeed>,
    display_name: String,
    state: watch::Sender<SessionSnapshot>,
    join_trigger: Mutex<JoinTrigger>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SessionCore {
    fn new(feed: Arc<ReplicatedFeed>, display_name: String) -> Self {
        let (state, _) = watch::channel(SessionSnapshot::new(feed.id(), feed.role()));
        Self {
            feed,
            display_name,
            state,
            join_trigger: Mutex::new(JoinTrigger::new()),
            pump: Mutex::new(None),
        }
    }

    fn me(&self) -> PublicKey {
        self.feed.identity().public
    }

    /// Mutate the snapshot, rederive the connection state and react to it.
    fn update(&self, f: impl FnOnce(&mut SessionSnapshot)) {
        let is_client = self.feed.role() == Role::Client;
        let mut join_owner = None;
        self.state.send_modify(|snapshot| {
            f(snapshot);
            snapshot.recompute();
            // Observed under the channel lock so transitions arrive in order.
            if is_client && lock(&self.join_trigger).observe(snapshot.connection) {
                join_owner = snapshot.shared.as_ref().map(|s| s.owner_public_key);
            }
        });

        if let Some(owner) = join_owner {
            self.send_join(&owner);
        }
    }

    fn send_join(&self, owner: &PublicKey) {
        let request = PeerMessage::join(self.feed.id(), self.me(), self.display_name.clone());
        match self.feed.send_to_peer(owner, &request) {
            Ok(()) => log::info!("sent join request to owner {}", owner.fmt_short()),
            Err(e) => log::warn!("join request to {} failed: {e}", owner.fmt_short()),
        }
    }

    fn record_error(&self, error: &LobbyError) {
        let message = error.to_string();
        self.update(|s| s.error = Some(message));
    }

    fn own_private_state(&self) -> ClientPrivateState {
        self.state
            .borrow()
            .private
            .get(&self.me())
            .cloned()
            .unwrap_or_default()
    }

    /// Handle the role-independent part of a feed event. Join requests are
    /// handed back for the role to decide on.
    fn on_event(&self, event: FeedEvent) -> Option<(PublicKey, VerifiedMessage)> {
        match event {
            FeedEvent::PeerJoin(peer) => {
                self.update(|s| {
                    s.online.insert(peer);
                });
                let own = PeerMessage::PrivateState(self.own_private_state());
                if let Err(e) = self.feed.send_to_peer(&peer, &own) {
                    log::debug!("could not send private state to {}: {e}", peer.fmt_short());
                }
                None
            }
            FeedEvent::PeerLeave(peer) => {
                self.update(|s| {
                    s.online.remove(&peer);
                    s.private.remove(&peer);
                });
                None
            }
            FeedEvent::Message { from, bytes } => {
                let verified = match SignedMessage::open(&bytes) {
                    Ok(verified) => verified,
                    Err(e) => {
                        log::warn!("dropping message from {}: {e}", from.fmt_short());
                        return None;
                    }
                };
                match &verified.message {
                    PeerMessage::PrivateState(state) => {
                        if verified.signer != from {
                            log::warn!(
                                "dropping private state signed by {} but sent by {}",
                                verified.signer.fmt_short(),
                                from.fmt_short()
                            );
                            return None;
                        }
                        let state = state.clone();
                        self.update(|s| {
                            s.private.insert(from, state);
                        });
                        None
                    }
                    PeerMessage::Join(_) => Some((from, verified)),
                }
            }
        }
    }

    fn set_private_state(&self, state: ClientPrivateState) -> Result<usize> {
        let me = self.me();
        let message = PeerMessage::PrivateState(state.clone());
        self.update(|s| {
            s.private.insert(me, state);
        });
        self.feed.broadcast(&message)
    }

    fn install_pump(&self, handle: JoinHandle<()>) {
        if let Some(old) = lock(&self.pump).replace(handle) {
            old.abort();
        }
    }

    fn stop_pump(&self) {
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
    }

    /// Mark this participant present after a (re)connect.
    fn mark_online(&self) {
        let me = self.me();
        self.update(|s| {
            s.local_user = Some(me);
            s.online.insert(me);
            s.error = None;
        });
    }

    fn suspend(&self) {
        self.stop_pump();
        self.feed.disconnect();
        let me = self.me();
        self.update(|s| {
            s.online.clear();
            s.online.insert(me);
            s.private.retain(|key, _| key == &me);
        });
        log::debug!("session {} suspended", self.feed.id().public_key().fmt_short());
    }

    async fn destroy(&self) {
        self.stop_pump();
        self.feed.destroy().await;
        self.update(|s| {
            s.local_user = None;
            s.online.clear();
        });
    }
}

/// The server's working copies of the document.
struct ServerDoc {
    committed: SharedState,
    staged: SharedState,
}

/// The log owner: sole writer of the shared document.
#[derive(Clone)]
pub struct ServerSession {
    core: Arc<SessionCore>,
    lobby_name: String,
    doc: Arc<tokio::sync::Mutex<Option<ServerDoc>>>,
}

impl ServerSession {
    /// Connect, then load or create the document and take ownership of it.
    pub async fn connect(&self) -> Result<()> {
        let result = self.connect_inner().await;
        if let Err(e) = &result {
            self.core.record_error(e);
        }
        result
    }

    async fn connect_inner(&self) -> Result<()> {
        let feed = &self.core.feed;
        feed.connect().await?;
        let me = self.core.me();
        let owner = User::new(me, self.core.display_name.clone());

        let bootstrap = build_initial_state(feed).await?;
        let (state, latest) = match bootstrap.state {
            Some(state) => (state, bootstrap.latest),
            None => {
                let state = SharedState::new(self.lobby_name.clone(), owner.clone());
                let seq = feed.append(&SessionRecord::SetState(state.clone())).await?;
                log::info!("created lobby {} at seq {seq}", feed.id());
                (state, Some(seq))
            }
        };
        let previous_owner = state.owner_public_key;

        *self.doc.lock().await = Some(ServerDoc {
            committed: state.clone(),
            staged: state.clone(),
        });
        self.core.mark_online();
        self.core.update(|s| {
            s.shared = Some(state);
            s.latest_seq = latest;
        });

        // A rebuilt document may name an earlier identity as owner.
        if previous_owner != me {
            log::info!(
                "taking over lobby {} from {}",
                feed.id(),
                previous_owner.fmt_short()
            );
            self.update(|s| {
                s.owner_public_key = me;
                s.add_user(owner);
            })
            .await?;
        }

        self.start_pump();
        Ok(())
    }

    fn start_pump(&self) {
        let events = self.core.feed.subscribe();
        let session = self.clone();
        self.core
            .install_pump(tokio::spawn(run_server_pump(session, events)));
    }

    /// Apply a mutation to the staged document without publishing it.
    pub async fn stage(&self, f: impl FnOnce(&mut SharedState)) -> Result<()> {
        let mut doc = self.doc.lock().await;
        let doc = doc.as_mut().ok_or(LobbyError::NotConnected)?;
        f(&mut doc.staged);
        Ok(())
    }

    /// Append the staged changes as one patch. Returns the new sequence
    /// number, or `None` when nothing changed.
    pub async fn commit(&self) -> Result<Option<u64>> {
        let mut doc = self.doc.lock().await;
        let doc = doc.as_mut().ok_or(LobbyError::NotConnected)?;
        self.commit_locked(doc).await
    }

    /// Stage and commit in one step.
    pub async fn update(&self, f: impl FnOnce(&mut SharedState)) -> Result<Option<u64>> {
        let mut doc = self.doc.lock().await;
        let doc = doc.as_mut().ok_or(LobbyError::NotConnected)?;
        f(&mut doc.staged);
        self.commit_locked(doc).await
    }

    async fn commit_locked(&self, doc: &mut ServerDoc) -> Result<Option<u64>> {
        let ops = diff_state(&doc.committed, &doc.staged)?;
        if ops.is_empty() {
            return Ok(None);
        }
        let seq = self
            .core
            .feed
            .append(&SessionRecord::StatePatch(ops))
            .await
            .inspect_err(|e| log::error!("failed to append patch: {e}"))?;
        doc.committed = doc.staged.clone();
        let shared = doc.committed.clone();
        self.core.update(|s| {
            s.shared = Some(shared);
            s.latest_seq = Some(seq);
        });
        Ok(Some(seq))
    }

    /// Admit the sender of a verified join request.
    async fn admit(&self, from: PublicKey, verified: VerifiedMessage) -> Result<Option<u64>> {
        let PeerMessage::Join(request) = verified.message else {
            return Ok(None);
        };
        if request.public_key != verified.signer || verified.signer != from {
            return Err(LobbyError::SpoofedJoin {
                sender: from,
                claimed: request.public_key,
            });
        }
        if request.id != self.core.feed.id() {
            return Err(LobbyError::InvalidPeerMessage(format!(
                "join addressed to lobby {}",
                request.id
            )));
        }

        let mut doc = self.doc.lock().await;
        let doc = doc.as_mut().ok_or(LobbyError::NotConnected)?;
        if doc.committed.has_user(&request.public_key) {
            log::debug!("{} is already a member", request.public_key.fmt_short());
            return Ok(None);
        }
        doc.staged
            .add_user(User::new(request.public_key, request.name.clone()));
        let seq = self.commit_locked(doc).await?;
        log::info!(
            "admitted {} ({}) to lobby {}",
            request.name,
            request.public_key.fmt_short(),
            request.id
        );
        Ok(seq)
    }
}

async fn run_server_pump(session: ServerSession, mut events: FeedEvents) {
    while let Some(event) = events.recv().await {
        let Some((from, verified)) = session.core.on_event(event) else {
            continue;
        };
        match session.admit(from, verified).await {
            Ok(_) => {}
            Err(e @ LobbyError::SpoofedJoin { .. }) => log::warn!("rejected join: {e}"),
            Err(e) => log::warn!("join from {} not admitted: {e}", from.fmt_short()),
        }
    }
}

/// A read-only participant.
#[derive(Clone)]
pub struct ClientSession {
    core: Arc<SessionCore>,
}

impl ClientSession {
    /// Connect, bootstrap from the log and follow it from there.
    pub async fn connect(&self) -> Result<()> {
        let result = self.connect_inner().await;
        if let Err(e) = &result {
            self.core.record_error(e);
        }
        result
    }

    async fn connect_inner(&self) -> Result<()> {
        let feed = &self.core.feed;
        feed.connect().await?;
        let bootstrap = build_initial_state(feed).await?;
        let next = bootstrap.next_seq();
        self.core.mark_online();
        self.core.update(|s| {
            s.shared = bootstrap.state;
            s.latest_seq = bootstrap.latest;
        });
        self.start_pump(next)
    }

    fn start_pump(&self, from: u64) -> Result<()> {
        let tail = self.core.feed.read_tail(from)?;
        let events = self.core.feed.subscribe();
        let session = self.clone();
        self.core
            .install_pump(tokio::spawn(run_client_pump(session, events, tail)));
        Ok(())
    }

    fn apply_record(&self, FeedRecord { seq, record }: FeedRecord) {
        self.core.update(|s| {
            match record {
                SessionRecord::SetState(state) => s.shared = Some(state),
                SessionRecord::StatePatch(ops) => match &s.shared {
                    None => log::warn!("patch at seq {seq} has no base state, skipping"),
                    Some(current) => match apply_to_state(current, &ops) {
                        Ok(next) => s.shared = Some(next),
                        Err(e) => {
                            log::error!("patch at seq {seq} failed: {e}");
                            s.error = Some(e.to_string());
                        }
                    },
                },
            }
            s.latest_seq = Some(seq);
        });
    }

    /// Resend the join request to the owner.
    pub fn send_join(&self) -> Result<()> {
        let owner = self
            .core
            .state
            .borrow()
            .shared
            .as_ref()
            .map(|s| s.owner_public_key)
            .ok_or(LobbyError::NotConnected)?;
        self.core.send_join(&owner);
        Ok(())
    }
}

async fn run_client_pump(session: ClientSession, mut events: FeedEvents, mut tail: TailReader) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if let Some((from, _)) = session.core.on_event(event) {
                        log::debug!("ignoring join request from {}", from.fmt_short());
                    }
                }
                None => break,
            },
            Some(record) = tail.recv() => session.apply_record(record),
        }
    }
}

/// A participant in one lobby, either role.
#[derive(Clone)]
pub enum LobbySession {
    Server(ServerSession),
    Client(ClientSession),
}

impl LobbySession {
    /// Wrap a feed; the role follows the feed's.
    pub fn init(feed: Arc<ReplicatedFeed>, options: SessionOptions) -> Self {
        let role = feed.role();
        let core = Arc::new(SessionCore::new(feed, options.display_name));
        match role {
            Role::Server => LobbySession::Server(ServerSession {
                core,
                lobby_name: options.lobby_name,
                doc: Arc::new(tokio::sync::Mutex::new(None)),
            }),
            Role::Client => LobbySession::Client(ClientSession { core }),
        }
    }

    fn core(&self) -> &Arc<SessionCore> {
        match self {
            LobbySession::Server(s) => &s.core,
            LobbySession::Client(c) => &c.core,
        }
    }

    pub fn id(&self) -> LobbyId {
        self.core().feed.id()
    }

    pub fn role(&self) -> Role {
        self.core().feed.role()
    }

    pub fn identity(&self) -> &Identity {
        self.core().feed.identity()
    }

    pub fn feed(&self) -> &Arc<ReplicatedFeed> {
        &self.core().feed
    }

    pub fn as_server(&self) -> Option<&ServerSession> {
        match self {
            LobbySession::Server(s) => Some(s),
            LobbySession::Client(_) => None,
        }
    }

    pub async fn connect(&self) -> Result<()> {
        match self {
            LobbySession::Server(s) => s.connect().await,
            LobbySession::Client(c) => c.connect().await,
        }
    }

    /// Detach from the feed without tearing it down.
    pub fn suspend(&self) {
        self.core().suspend();
    }

    /// Reattach after [`suspend`](Self::suspend), reusing the open feed.
    pub async fn resume(&self) -> Result<()> {
        let core = self.core();
        core.feed.connect().await?;
        core.mark_online();
        match self {
            LobbySession::Server(s) => s.start_pump(),
            LobbySession::Client(c) => {
                let next = core.state.borrow().latest_seq.map_or(0, |seq| seq + 1);
                c.start_pump(next)?;
            }
        }
        log::debug!("session {} resumed", self.id().public_key().fmt_short());
        Ok(())
    }

    pub async fn destroy(&self) {
        self.core().destroy().await;
    }

    /// Store and broadcast this participant's private state. Returns the
    /// number of peers it was sent to.
    pub fn set_private_state(&self, state: ClientPrivateState) -> Result<usize> {
        self.core().set_private_state(state)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.core().state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.core().state.subscribe()
    }

    pub fn connection(&self) -> ConnectionState {
        self.core().state.borrow().connection
    }
}

impl std::fmt::Debug for LobbySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LobbySession")
            .field("role", &self.role())
            .field("id", &self.id())
            .field("connection", &self.connection())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{FeedConfig, FeedContext};
    use crate::storage::{MemoryNetwork, MemoryNode};
    use crate::transport::SharedTransport;
    use lobby_core::SecretKey;
    use std::time::Duration;

    fn context(node: &Arc<MemoryNode>) -> FeedContext {
        FeedContext::new(node.clone(), SharedTransport::new(node.clone()))
            .with_config(FeedConfig::for_testing())
    }

    async fn wait_for(
        session: &LobbySession,
        pred: impl Fn(&SessionSnapshot) -> bool,
    ) -> SessionSnapshot {
        let mut rx = session.watch();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let current = rx.borrow_and_update().clone();
                if pred(&current) {
                    return current;
                }
                rx.changed().await.expect("session dropped");
            }
        })
        .await
        .expect("timed out waiting for session state")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_join_trigger_tracks_published_state() {
        let network = MemoryNetwork::new();
        let host = SecretKey::generate();
        let id = LobbyId::from_public_key(host.public()).encode();
        let me = Identity::generate();
        let feed = ReplicatedFeed::create(Role::Client, Some(&id), me.clone(), None, context(&network.node())).unwrap();
        let core = Arc::new(SessionCore::new(Arc::new(feed), "guest".into()));
        let owner = User::new(host.public(), "host");
        core.update(|s| {
            s.local_user = Some(me.public);
            s.online.insert(me.public);
            s.shared = Some(SharedState::new("lobby", owner.clone()));
        });

        // Owner presence flips between WaitingForHost and WaitingForJoin.
        let tasks: Vec<_> = (0..8)
            .map(|worker| {
                let core = core.clone();
                let owner_key = owner.public_key;
                tokio::spawn(async move {
                    for i in 0..200 {
                        core.update(|s| {
                            if (i + worker) % 2 == 0 {
                                s.online.insert(owner_key);
                            } else {
                                s.online.remove(&owner_key);
                            }
                        });
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let published = core.state.borrow().connection;
        assert_eq!(lock(&core.join_trigger).last(), Some(published));
    }

    #[tokio::test]
    async fn test_build_initial_state_empty_log() {
        let network = MemoryNetwork::new();
        let node = network.node();
        let feed = ReplicatedFeed::create(Role::Server, None, Identity::generate(), None, context(&node)).unwrap();
        feed.connect().await.unwrap();

        let result = build_initial_state(&feed).await.unwrap();
        assert_eq!(result.state, None);
        assert_eq!(result.latest, None);
        assert_eq!(result.next_seq(), 0);
    }

    #[tokio::test]
    async fn test_build_initial_state_stops_at_latest_set_state() {
        let network = MemoryNetwork::new();
        let node = network.node();
        let host = Identity::generate();
        let feed = ReplicatedFeed::create(Role::Server, None, host.clone(), None, context(&node)).unwrap();
        feed.connect().await.unwrap();

        let first = SharedState::new("old", User::new(host.public, "host"));
        feed.append(&SessionRecord::SetState(first.clone())).await.unwrap();
        let mut renamed = first.clone();
        renamed.name = "new".into();
        feed.append(&SessionRecord::SetState(renamed.clone())).await.unwrap();
        let mut patched = renamed.clone();
        patched.users.push(User::new(Identity::generate().public, "guest"));
        feed.append(&SessionRecord::StatePatch(diff_state(&renamed, &patched).unwrap()))
            .await
            .unwrap();

        let result = build_initial_state(&feed).await.unwrap();
        assert_eq!(result.state, Some(patched));
        assert_eq!(result.latest, Some(2));
        assert_eq!(result.next_seq(), 3);
    }

    #[tokio::test]
    async fn test_server_creates_genesis_and_commits() {
        let network = MemoryNetwork::new();
        let node = network.node();
        let feed = Arc::new(
            ReplicatedFeed::create(Role::Server, None, Identity::generate(), None, context(&node)).unwrap(),
        );
        let session = LobbySession::init(feed.clone(), SessionOptions::new("host").with_lobby_name("games"));
        session.connect().await.unwrap();

        let snapshot = session.snapshot();
        let shared = snapshot.shared.clone().unwrap();
        assert_eq!(shared.name, "games");
        assert_eq!(shared.users.len(), 1);
        assert_eq!(snapshot.latest_seq, Some(0));
        assert_eq!(snapshot.connection, ConnectionState::Connected);

        let server = session.as_server().unwrap();
        assert_eq!(server.commit().await.unwrap(), None);
        server.stage(|s| s.name = "renamed".into()).await.unwrap();
        server.stage(|s| s.activity = None).await.unwrap();
        assert_eq!(server.commit().await.unwrap(), Some(1));
        assert_eq!(feed.len(), 2);
        assert_eq!(session.snapshot().shared.unwrap().name, "renamed");
    }

    #[tokio::test]
    async fn test_server_reowns_rebuilt_state() {
        let network = MemoryNetwork::new();
        let node = network.node();
        let secret = lobby_core::SecretKey::generate();
        let id = LobbyId::from_public_key(secret.public()).encode();

        let first = Arc::new(
            ReplicatedFeed::create(Role::Server, Some(&id), Identity::generate(), Some(secret.clone()), context(&node))
                .unwrap(),
        );
        let original = LobbySession::init(first, SessionOptions::new("host"));
        original.connect().await.unwrap();
        original.destroy().await;

        let second_identity = Identity::generate();
        let second = Arc::new(
            ReplicatedFeed::create(Role::Server, Some(&id), second_identity.clone(), Some(secret), context(&node))
                .unwrap(),
        );
        let session = LobbySession::init(second, SessionOptions::new("host again"));
        session.connect().await.unwrap();

        let snapshot = session.snapshot();
        let shared = snapshot.shared.unwrap();
        assert_eq!(shared.owner_public_key, second_identity.public);
        assert!(shared.has_user(&second_identity.public));
        assert_eq!(snapshot.latest_seq, Some(1));
        assert_eq!(snapshot.connection, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_client_joins_and_follows_patches() {
        let network = MemoryNetwork::new();
        let (host_node, guest_node) = (network.node(), network.node());
        let server_feed = Arc::new(
            ReplicatedFeed::create(Role::Server, None, Identity::generate(), None, context(&host_node)).unwrap(),
        );
        let server = LobbySession::init(server_feed.clone(), SessionOptions::new("host"));
        server.connect().await.unwrap();

        let guest = Identity::generate();
        let client_feed = Arc::new(
            ReplicatedFeed::create(
                Role::Client,
                Some(&server_feed.id().encode()),
                guest.clone(),
                None,
                context(&guest_node),
            )
            .unwrap(),
        );
        let client = LobbySession::init(client_feed, SessionOptions::new("guest"));
        client.connect().await.unwrap();

        let joined = wait_for(&client, |s| s.connection == ConnectionState::Connected).await;
        assert!(joined.shared.unwrap().has_user(&guest.public));

        server
            .as_server()
            .unwrap()
            .update(|s| s.name = "after join".into())
            .await
            .unwrap();
        wait_for(&client, |s| {
            s.shared.as_ref().is_some_and(|shared| shared.name == "after join")
        })
        .await;
    }

    #[tokio::test]
    async fn test_private_state_reaches_peers() {
        let network = MemoryNetwork::new();
        let (host_node, guest_node) = (network.node(), network.node());
        let host = Identity::generate();
        let server_feed = Arc::new(
            ReplicatedFeed::create(Role::Server, None, host.clone(), None, context(&host_node)).unwrap(),
        );
        let server = LobbySession::init(server_feed.clone(), SessionOptions::new("host"));
        server.connect().await.unwrap();
        server
            .set_private_state(ClientPrivateState { ready: true, status: None })
            .unwrap();

        let guest = Identity::generate();
        let client = LobbySession::init(
            Arc::new(
                ReplicatedFeed::create(
                    Role::Client,
                    Some(&server_feed.id().encode()),
                    guest.clone(),
                    None,
                    context(&guest_node),
                )
                .unwrap(),
            ),
            SessionOptions::new("guest"),
        );
        client.connect().await.unwrap();

        // The host re-sends its state when the guest appears.
        let seen = wait_for(&client, |s| s.private.contains_key(&host.public)).await;
        assert!(seen.private[&host.public].ready);

        client
            .set_private_state(ClientPrivateState { ready: false, status: Some("afk".into()) })
            .unwrap();
        let seen = wait_for(&server, |s| {
            s.private.get(&guest.public).is_some_and(|p| p.status.is_some())
        })
        .await;
        assert_eq!(seen.private[&guest.public].status.as_deref(), Some("afk"));
    }

    #[tokio::test]
    async fn test_suspend_and_resume_keep_feed() {
        let network = MemoryNetwork::new();
        let node = network.node();
        let session = LobbySession::init(
            Arc::new(ReplicatedFeed::create(Role::Server, None, Identity::generate(), None, context(&node)).unwrap()),
            SessionOptions::new("host"),
        );
        session.connect().await.unwrap();

        session.suspend();
        assert!(!session.feed().is_connected());
        session.resume().await.unwrap();
        assert!(session.feed().is_connected());
        assert_eq!(node.stats().joins, 1);
        assert_eq!(session.connection(), ConnectionState::Connected);

        session.destroy().await;
        assert_eq!(session.connection(), ConnectionState::Disconnected);
    }
}
