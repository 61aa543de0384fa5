//! The owner: one task holding every live lobby session of the process.
//!
//! ```text
//!  TabStore ─┐                         ┌─► LobbySession (A) ─► ReplicatedFeed
//!  TabStore ─┼─► OwnerClient ─► inbox ─┤
//!  TabStore ─┘      (mpsc)       │     └─► LobbySession (B) ─► ReplicatedFeed
//!                                │                 │
//!            grace timers ───────┤     session watchers (SessionChanged)
//!                                ▼
//!                       TabClaimCoordinator ─► lobbies.json
//! ```
//!
//! Requests are handled strictly one at a time in arrival order, connects
//! included, so claim bookkeeping never interleaves. Timers and session
//! watchers post back into the same inbox through a weak sender.
//!
//! Closing a tab suspends its session and starts a grace timer. Reopening
//! inside the window resumes the same session; when the timer fires first the
//! claim is released and the session destroyed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use lobby_core::{Activity, ClientPrivateState, Identity, LobbyId, SharedState};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bridge::{LobbyView, OwnerClient, StoreSubscription, StoreView};
use crate::claim::{
    ClaimOutcome, LobbyStore, PersistMode, RejectedLobby, SavedLobby, TabClaimCoordinator, TabId,
};
use crate::error::{LobbyError, Result};
use crate::feed::{FeedContext, ReplicatedFeed, Role};
use crate::session::{LobbySession, SessionOptions};

/// Owner configuration.
#[derive(Debug, Clone)]
pub struct OwnerConfig {
    /// How long a closed tab keeps its claim
    pub grace_period: Duration,
    /// Request queue depth
    pub inbox_capacity: usize,
    pub persist_mode: PersistMode,
    /// Where saved lobbies live (None = not persisted)
    pub store_path: Option<PathBuf>,
}

impl Default for OwnerConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(20),
            inbox_capacity: 64,
            persist_mode: PersistMode::Production,
            store_path: None,
        }
    }
}

impl OwnerConfig {
    pub fn for_testing() -> Self {
        Self {
            inbox_capacity: 16,
            persist_mode: PersistMode::Development,
            ..Self::default()
        }
    }
}

/// The host site's login session.
#[async_trait]
pub trait HostAuth: Send + Sync {
    async fn is_logged_in(&self) -> bool;
}

/// Fixed answer, switchable at runtime.
#[derive(Debug)]
pub struct StaticAuth {
    logged_in: AtomicBool,
}

impl StaticAuth {
    pub fn new(logged_in: bool) -> Self {
        Self {
            logged_in: AtomicBool::new(logged_in),
        }
    }

    pub fn set_logged_in(&self, logged_in: bool) {
        self.logged_in.store(logged_in, Ordering::Release);
    }
}

#[async_trait]
impl HostAuth for StaticAuth {
    async fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::Acquire)
    }
}

/// A mutation of the shared document.
pub type SharedUpdate = Box<dyn FnOnce(&mut SharedState) + Send>;

/// How a tab gets a feed.
#[derive(Debug, Clone)]
pub enum CreateFeed {
    /// Host a new lobby
    Create { name: String, display_name: String },
    /// Join an existing lobby by its encoded id
    Join { id: String, display_name: String },
}

/// What `create_feed` produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedHandle {
    pub id: LobbyId,
    pub outcome: ClaimOutcome,
}

pub enum OwnerRequest {
    CreateLobby {
        tab: TabId,
        name: String,
        display_name: String,
        reply: oneshot::Sender<Result<FeedHandle>>,
    },
    JoinLobby {
        tab: TabId,
        id: String,
        display_name: String,
        reply: oneshot::Sender<Result<FeedHandle>>,
    },
    Claim {
        tab: TabId,
        id: LobbyId,
        reply: oneshot::Sender<Result<ClaimOutcome>>,
    },
    Release {
        tab: TabId,
        reply: oneshot::Sender<Option<LobbyId>>,
    },
    TabClosed {
        tab: TabId,
    },
    TabReopened {
        tab: TabId,
        reply: oneshot::Sender<bool>,
    },
    Leave {
        id: LobbyId,
        reply: oneshot::Sender<bool>,
    },
    Dismiss {
        id: LobbyId,
        reply: oneshot::Sender<bool>,
    },
    DismissRejected {
        raw_id: String,
        reply: oneshot::Sender<bool>,
    },
    UpdateShared {
        tab: TabId,
        update: SharedUpdate,
        reply: oneshot::Sender<Result<Option<u64>>>,
    },
    SetPrivateState {
        tab: TabId,
        state: ClientPrivateState,
        reply: oneshot::Sender<Result<()>>,
    },
    UrlChanged {
        tab: TabId,
        activity: Activity,
        reply: oneshot::Sender<Result<()>>,
    },
    GetStore {
        reply: oneshot::Sender<StoreView>,
    },
    Subscribe {
        reply: oneshot::Sender<StoreSubscription>,
    },
    Unsubscribe {
        id: Uuid,
        reply: oneshot::Sender<bool>,
    },
    SubscriptionCount {
        reply: oneshot::Sender<usize>,
    },
    Persist {
        reply: oneshot::Sender<Result<()>>,
    },
    SessionChanged {
        id: LobbyId,
    },
    GraceExpired {
        tab: TabId,
        generation: u64,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct LiveSession {
    session: LobbySession,
    watcher: JoinHandle<()>,
}

struct GraceTimer {
    generation: u64,
    task: JoinHandle<()>,
}

/// The single task that owns lobby sessions.
pub struct LobbyOwner {
    config: OwnerConfig,
    ctx: FeedContext,
    auth: Arc<dyn HostAuth>,
    coordinator: TabClaimCoordinator,
    sessions: HashMap<LobbyId, LiveSession>,
    subscribers: HashMap<Uuid, mpsc::UnboundedSender<StoreView>>,
    grace: HashMap<TabId, GraceTimer>,
    next_generation: u64,
    inbox: mpsc::Receiver<OwnerRequest>,
    handle: mpsc::WeakSender<OwnerRequest>,
}

impl LobbyOwner {
    /// Load saved lobbies and start the owner task.
    pub fn spawn(
        config: OwnerConfig,
        ctx: FeedContext,
        auth: Arc<dyn HostAuth>,
    ) -> Result<(OwnerClient, JoinHandle<()>)> {
        let store = match &config.store_path {
            Some(path) => LobbyStore::load(path)?,
            None => LobbyStore::new(),
        };
        let (tx, inbox) = mpsc::channel(config.inbox_capacity.max(1));
        log::info!("lobby owner starting with {} saved lobbies", store.len());
        let owner = LobbyOwner {
            config,
            ctx,
            auth,
            coordinator: TabClaimCoordinator::new(store),
            sessions: HashMap::new(),
            subscribers: HashMap::new(),
            grace: HashMap::new(),
            next_generation: 0,
            inbox,
            handle: tx.downgrade(),
        };
        let task = tokio::spawn(owner.run());
        Ok((OwnerClient::new(tx), task))
    }

    async fn run(mut self) {
        while let Some(request) = self.inbox.recv().await {
            if let Flow::Stop(reply) = self.handle_request(request).await {
                self.shutdown().await;
                let _ = reply.send(());
                return;
            }
        }
        // Every client handle is gone.
        self.shutdown().await;
    }

    async fn handle_request(&mut self, request: OwnerRequest) -> Flow {
        match request {
            OwnerRequest::CreateLobby {
                tab,
                name,
                display_name,
                reply,
            } => {
                let result = self.create_lobby(tab, name, display_name).await;
                let _ = reply.send(result);
                self.store_changed();
            }
            OwnerRequest::JoinLobby {
                tab,
                id,
                display_name,
                reply,
            } => {
                let result = self.join_lobby(tab, &id, display_name).await;
                let _ = reply.send(result);
                self.store_changed();
            }
            OwnerRequest::Claim { tab, id, reply } => {
                let result = self.activate(tab, id).await;
                let _ = reply.send(result);
                self.store_changed();
            }
            OwnerRequest::Release { tab, reply } => {
                let released = self.release(tab).await;
                let _ = reply.send(released);
                self.store_changed();
            }
            OwnerRequest::TabClosed { tab } => {
                self.tab_closed(tab);
                self.notify_subscribers();
            }
            OwnerRequest::TabReopened { tab, reply } => {
                let resumed = self.tab_reopened(tab).await;
                let _ = reply.send(resumed);
                self.notify_subscribers();
            }
            OwnerRequest::Leave { id, reply } => {
                let left = self.leave(id).await;
                let _ = reply.send(left);
                self.store_changed();
            }
            OwnerRequest::Dismiss { id, reply } => {
                let _ = reply.send(self.coordinator.dismiss(&id));
                self.store_changed();
            }
            OwnerRequest::DismissRejected { raw_id, reply } => {
                let _ = reply.send(self.coordinator.dismiss_rejected(&raw_id));
                self.notify_subscribers();
            }
            OwnerRequest::UpdateShared { tab, update, reply } => {
                let result = self.update_shared(tab, update).await;
                let _ = reply.send(result);
            }
            OwnerRequest::SetPrivateState { tab, state, reply } => {
                let result = self
                    .session_for(tab)
                    .and_then(|session| session.set_private_state(state).map(|_| ()));
                let _ = reply.send(result);
            }
            OwnerRequest::UrlChanged {
                tab,
                activity,
                reply,
            } => {
                let result = self.url_changed(tab, activity).await;
                let _ = reply.send(result);
            }
            OwnerRequest::GetStore { reply } => {
                let _ = reply.send(self.view());
            }
            OwnerRequest::Subscribe { reply } => {
                let (tx, rx) = mpsc::unbounded_channel();
                let id = Uuid::new_v4();
                let _ = tx.send(self.view());
                self.subscribers.insert(id, tx);
                log::debug!("store subscription {id} opened ({} open)", self.subscribers.len());
                let _ = reply.send(StoreSubscription::new(id, rx));
            }
            OwnerRequest::Unsubscribe { id, reply } => {
                let _ = reply.send(self.subscribers.remove(&id).is_some());
            }
            OwnerRequest::SubscriptionCount { reply } => {
                let _ = reply.send(self.subscribers.len());
            }
            OwnerRequest::Persist { reply } => {
                let _ = reply.send(self.persist());
            }
            OwnerRequest::SessionChanged { id } => {
                if self.sessions.contains_key(&id) {
                    self.notify_subscribers();
                }
            }
            OwnerRequest::GraceExpired { tab, generation } => {
                self.grace_expired(tab, generation).await;
                self.store_changed();
            }
            OwnerRequest::Shutdown { reply } => return Flow::Stop(reply),
        }
        Flow::Continue
    }

    async fn create_lobby(
        &mut self,
        tab: TabId,
        name: String,
        display_name: String,
    ) -> Result<FeedHandle> {
        let identity = Identity::generate();
        let feed = ReplicatedFeed::create(Role::Server, None, identity.clone(), None, self.ctx.clone())?;
        let id = feed.id();

        let mut saved = SavedLobby::new(id, Role::Server).with_display_name(display_name.clone());
        saved.server_secret = feed.secret().cloned();
        saved.identity = Some(identity);
        self.coordinator.upsert(saved);
        log::info!("{tab} created lobby {id}");

        let options = SessionOptions::new(display_name).with_lobby_name(name);
        let outcome = self.claim(tab, id).await;
        self.start_session(id, feed, options).await?;
        Ok(FeedHandle { id, outcome })
    }

    async fn join_lobby(&mut self, tab: TabId, raw_id: &str, display_name: String) -> Result<FeedHandle> {
        let id = match LobbyId::decode(raw_id) {
            Ok(id) => id,
            Err(e) => {
                let error = LobbyError::from(e);
                log::warn!("{tab} tried to join with an invalid id");
                self.coordinator.reject(RejectedLobby {
                    raw_id: raw_id.to_string(),
                    display_name: Some(display_name),
                    error: error.to_string(),
                });
                return Err(error);
            }
        };
        match self.coordinator.store().get(&id).cloned() {
            Some(saved) if saved.display_name.as_deref() != Some(display_name.as_str()) => {
                self.coordinator.upsert(SavedLobby {
                    display_name: Some(display_name),
                    ..saved
                });
            }
            Some(_) => {}
            None => {
                let mut saved = SavedLobby::new(id, Role::Client).with_display_name(display_name);
                saved.identity = Some(Identity::generate());
                self.coordinator.upsert(saved);
            }
        }
        let outcome = self.activate(tab, id).await?;
        Ok(FeedHandle { id, outcome })
    }

    /// Claim a saved lobby for `tab` and make sure its session is live.
    async fn activate(&mut self, tab: TabId, id: LobbyId) -> Result<ClaimOutcome> {
        let outcome = self.claim(tab, id).await;
        if !outcome.is_held() {
            return Ok(outcome);
        }

        if let Some(live) = self.sessions.get(&id) {
            if !live.session.feed().is_connected() {
                live.session.resume().await?;
            }
            return Ok(outcome);
        }

        let Some(saved) = self.coordinator.store().get(&id).cloned() else {
            return Ok(ClaimOutcome::UnknownLobby);
        };
        self.coordinator.clear_error(&id);
        let identity = saved.identity.clone().unwrap_or_else(Identity::generate);
        let encoded = id.encode();
        let feed = ReplicatedFeed::create(
            saved.role,
            Some(&encoded),
            identity,
            saved.server_secret.clone(),
            self.ctx.clone(),
        )?;
        let display_name = saved.display_name.unwrap_or_else(|| "guest".to_string());
        self.start_session(id, feed, SessionOptions::new(display_name))
            .await?;
        Ok(outcome)
    }

    /// Claim bookkeeping: retire whatever the tab held before and stop the
    /// grace timer of a tab being taken over.
    async fn claim(&mut self, tab: TabId, id: LobbyId) -> ClaimOutcome {
        // A tab that claims is open again.
        if self.cancel_grace(tab) {
            self.coordinator.mark_reopened(tab);
        }
        let previous = self.coordinator.claimed_by(tab);
        let outcome = self.coordinator.claim(tab, id);
        if !outcome.is_held() {
            return outcome;
        }
        if let Some(previous) = previous.filter(|p| *p != id) {
            if !self.coordinator.is_claimed(&previous) {
                self.retire(previous).await;
            }
        }
        if let ClaimOutcome::TakenOver { from } = outcome {
            self.cancel_grace(from);
        }
        outcome
    }

    /// Connect a new session. On failure the error lands on the saved entry
    /// and the partial session is destroyed.
    async fn start_session(
        &mut self,
        id: LobbyId,
        feed: ReplicatedFeed,
        options: SessionOptions,
    ) -> Result<()> {
        let session = LobbySession::init(Arc::new(feed), options);
        match self.connect_checked(&session).await {
            Ok(()) => {
                let watcher = self.watch_session(&session);
                self.sessions.insert(id, LiveSession { session, watcher });
                Ok(())
            }
            Err(e) => {
                log::error!("lobby {id} failed to connect: {e}");
                session.destroy().await;
                self.coordinator.record_error(&id, e.to_string());
                Err(e)
            }
        }
    }

    async fn connect_checked(&self, session: &LobbySession) -> Result<()> {
        if !self.auth.is_logged_in().await {
            return Err(LobbyError::UserLoggedOut);
        }
        session.connect().await?;
        if !self.auth.is_logged_in().await {
            return Err(LobbyError::UserLoggedOut);
        }
        Ok(())
    }

    fn watch_session(&self, session: &LobbySession) -> JoinHandle<()> {
        let mut rx = session.watch();
        let handle = self.handle.clone();
        let id = session.id();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let Some(tx) = handle.upgrade() else {
                    break;
                };
                if tx.send(OwnerRequest::SessionChanged { id }).await.is_err() {
                    break;
                }
            }
        })
    }

    async fn retire(&mut self, id: LobbyId) {
        if let Some(live) = self.sessions.remove(&id) {
            live.watcher.abort();
            live.session.destroy().await;
            log::info!("lobby {id} session closed");
        }
    }

    async fn release(&mut self, tab: TabId) -> Option<LobbyId> {
        self.cancel_grace(tab);
        let id = self.coordinator.release(tab)?;
        self.retire(id).await;
        Some(id)
    }

    fn tab_closed(&mut self, tab: TabId) {
        let Some(id) = self.coordinator.mark_closing(tab) else {
            return;
        };
        if let Some(live) = self.sessions.get(&id) {
            live.session.suspend();
        }

        self.cancel_grace(tab);
        self.next_generation += 1;
        let generation = self.next_generation;
        let handle = self.handle.clone();
        let period = self.config.grace_period;
        let task = tokio::spawn(async move {
            tokio::time::sleep(period).await;
            if let Some(tx) = handle.upgrade() {
                let _ = tx.send(OwnerRequest::GraceExpired { tab, generation }).await;
            }
        });
        self.grace.insert(tab, GraceTimer { generation, task });
        log::info!("{tab} closed, holding lobby {id} for {period:?}");
    }

    async fn tab_reopened(&mut self, tab: TabId) -> bool {
        if !self.cancel_grace(tab) {
            return false;
        }
        self.coordinator.mark_reopened(tab);
        let Some(id) = self.coordinator.claimed_by(tab) else {
            return false;
        };
        if let Some(live) = self.sessions.get(&id) {
            if let Err(e) = live.session.resume().await {
                log::error!("lobby {id} failed to resume: {e}");
                return false;
            }
        }
        log::info!("{tab} reopened, lobby {id} resumed");
        true
    }

    fn cancel_grace(&mut self, tab: TabId) -> bool {
        match self.grace.remove(&tab) {
            Some(timer) => {
                timer.task.abort();
                true
            }
            None => false,
        }
    }

    async fn grace_expired(&mut self, tab: TabId, generation: u64) {
        match self.grace.get(&tab) {
            Some(timer) if timer.generation == generation => {
                self.grace.remove(&tab);
            }
            _ => {
                log::debug!("ignoring stale grace expiry for {tab}");
                return;
            }
        }
        log::info!("grace period for {tab} expired");
        if let Some(id) = self.coordinator.release(tab) {
            self.retire(id).await;
        }
    }

    async fn leave(&mut self, id: LobbyId) -> bool {
        let Some(removed) = self.coordinator.remove(&id) else {
            return false;
        };
        if let Some(tab) = removed.claiming_tab_id {
            self.cancel_grace(tab);
        }
        self.retire(id).await;
        true
    }

    fn session_for(&self, tab: TabId) -> Result<&LobbySession> {
        self.coordinator
            .claimed_by(tab)
            .and_then(|id| self.sessions.get(&id))
            .map(|live| &live.session)
            .ok_or(LobbyError::NotConnected)
    }

    async fn update_shared(&self, tab: TabId, update: SharedUpdate) -> Result<Option<u64>> {
        let server = self.session_for(tab)?.as_server().ok_or(LobbyError::NotServer)?;
        server.update(update).await
    }

    async fn url_changed(&self, tab: TabId, activity: Activity) -> Result<()> {
        let session = self.session_for(tab)?;
        let Some(server) = session.as_server() else {
            return Ok(());
        };
        server
            .update(move |state| state.activity = Some(activity))
            .await?;
        Ok(())
    }

    fn view(&self) -> StoreView {
        StoreView {
            lobbies: self
                .coordinator
                .store()
                .iter()
                .map(|saved| LobbyView {
                    id: saved.id,
                    role: saved.role,
                    display_name: saved.display_name.clone(),
                    claiming_tab_id: saved.claiming_tab_id,
                    error: saved.error.clone(),
                    session: self.sessions.get(&saved.id).map(|live| live.session.snapshot()),
                })
                .collect(),
            rejected: self.coordinator.rejected().cloned().collect(),
        }
    }

    fn notify_subscribers(&self) {
        if self.subscribers.is_empty() {
            return;
        }
        let view = self.view();
        for (id, tx) in &self.subscribers {
            if tx.send(view.clone()).is_err() {
                log::debug!("store subscription {id} has no receiver");
            }
        }
    }

    fn persist(&self) -> Result<()> {
        match &self.config.store_path {
            Some(path) => self.coordinator.store().save(path, self.config.persist_mode),
            None => Ok(()),
        }
    }

    fn store_changed(&self) {
        self.notify_subscribers();
        if let Err(e) = self.persist() {
            log::error!("failed to persist lobbies: {e}");
        }
    }

    async fn shutdown(&mut self) {
        for (_, timer) in self.grace.drain() {
            timer.task.abort();
        }
        let sessions: Vec<LiveSession> = self.sessions.drain().map(|(_, live)| live).collect();
        for live in &sessions {
            live.watcher.abort();
        }
        join_all(sessions.iter().map(|live| live.session.destroy())).await;
        if let Err(e) = self.persist() {
            log::error!("failed to persist lobbies on shutdown: {e}");
        }
        self.subscribers.clear();
        log::info!("lobby owner stopped ({} sessions closed)", sessions.len());
    }
}

enum Flow {
    Continue,
    Stop(oneshot::Sender<()>),
}
