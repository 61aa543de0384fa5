//! Cross-context access to the owner.
//!
//! UI contexts never hold sessions. They talk to the owner task through an
//! [`OwnerClient`] (request over mpsc, reply over oneshot) and watch a
//! mirrored [`StoreView`]. A [`TabStore`] pins the tab id so every call is
//! dispatched on behalf of that tab.
//!
//! Store subscriptions stay registered with the owner until explicitly
//! unsubscribed; dropping the receiver does not release them.

use std::collections::HashSet;

use async_trait::async_trait;
use lobby_core::{Activity, ClientPrivateState, LobbyId, SharedState};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::claim::{ClaimOutcome, RejectedLobby, TabId};
use crate::error::{LobbyError, Result};
use crate::feed::Role;
use crate::owner::{CreateFeed, FeedHandle, OwnerRequest, SharedUpdate};
use crate::session::SessionSnapshot;

/// A saved lobby as seen from a UI context. Secrets stay in the owner.
#[derive(Debug, Clone, PartialEq)]
pub struct LobbyView {
    pub id: LobbyId,
    pub role: Role,
    pub display_name: Option<String>,
    pub claiming_tab_id: Option<TabId>,
    pub error: Option<String>,
    /// Present while the lobby has a live session
    pub session: Option<SessionSnapshot>,
}

/// Mirror of the owner's store, most recently used first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreView {
    pub lobbies: Vec<LobbyView>,
    /// Join attempts with ids that did not decode
    pub rejected: Vec<RejectedLobby>,
}

impl StoreView {
    pub fn get(&self, id: &LobbyId) -> Option<&LobbyView> {
        self.lobbies.iter().find(|lobby| &lobby.id == id)
    }

    pub fn claimed_by(&self, tab: TabId) -> Option<&LobbyView> {
        self.lobbies
            .iter()
            .find(|lobby| lobby.claiming_tab_id == Some(tab))
    }
}

/// A registered store subscription.
pub struct StoreSubscription {
    pub id: Uuid,
    rx: mpsc::UnboundedReceiver<StoreView>,
}

impl StoreSubscription {
    pub(crate) fn new(id: Uuid, rx: mpsc::UnboundedReceiver<StoreView>) -> Self {
        Self { id, rx }
    }

    /// Next store view. The first one is the state at subscription time.
    pub async fn recv(&mut self) -> Option<StoreView> {
        self.rx.recv().await
    }

    /// The most recent view already delivered, skipping older ones.
    pub fn latest(&mut self) -> Option<StoreView> {
        let mut latest = None;
        while let Ok(view) = self.rx.try_recv() {
            latest = Some(view);
        }
        latest
    }
}

/// Handle for sending requests to the owner task.
#[derive(Clone)]
pub struct OwnerClient {
    tx: mpsc::Sender<OwnerRequest>,
}

impl OwnerClient {
    pub(crate) fn new(tx: mpsc::Sender<OwnerRequest>) -> Self {
        Self { tx }
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> OwnerRequest) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| LobbyError::OwnerGone)?;
        rx.await.map_err(|_| LobbyError::OwnerGone)
    }

    /// Host a new lobby or join one by id, claiming it for `tab`.
    pub async fn create_feed(&self, tab: TabId, request: CreateFeed) -> Result<FeedHandle> {
        match request {
            CreateFeed::Create { name, display_name } => {
                self.call(|reply| OwnerRequest::CreateLobby {
                    tab,
                    name,
                    display_name,
                    reply,
                })
                .await?
            }
            CreateFeed::Join { id, display_name } => {
                self.call(|reply| OwnerRequest::JoinLobby {
                    tab,
                    id,
                    display_name,
                    reply,
                })
                .await?
            }
        }
    }

    pub async fn claim(&self, tab: TabId, id: LobbyId) -> Result<ClaimOutcome> {
        self.call(|reply| OwnerRequest::Claim { tab, id, reply })
            .await?
    }

    pub async fn release(&self, tab: TabId) -> Result<Option<LobbyId>> {
        self.call(|reply| OwnerRequest::Release { tab, reply }).await
    }

    /// Report a closed tab. Fire and forget.
    pub async fn tab_closed(&self, tab: TabId) -> Result<()> {
        self.tx
            .send(OwnerRequest::TabClosed { tab })
            .await
            .map_err(|_| LobbyError::OwnerGone)
    }

    /// Report a reopened tab. Returns whether a suspended session resumed.
    pub async fn tab_reopened(&self, tab: TabId) -> Result<bool> {
        self.call(|reply| OwnerRequest::TabReopened { tab, reply })
            .await
    }

    /// Forget a lobby entirely.
    pub async fn leave(&self, id: LobbyId) -> Result<bool> {
        self.call(|reply| OwnerRequest::Leave { id, reply }).await
    }

    /// Remove an errored lobby entry.
    pub async fn dismiss(&self, id: LobbyId) -> Result<bool> {
        self.call(|reply| OwnerRequest::Dismiss { id, reply }).await
    }

    /// Forget a rejected join attempt.
    pub async fn dismiss_rejected(&self, raw_id: impl Into<String>) -> Result<bool> {
        let raw_id = raw_id.into();
        self.call(|reply| OwnerRequest::DismissRejected { raw_id, reply })
            .await
    }

    pub async fn update_shared(&self, tab: TabId, update: SharedUpdate) -> Result<Option<u64>> {
        self.call(|reply| OwnerRequest::UpdateShared { tab, update, reply })
            .await?
    }

    pub async fn set_private_state(&self, tab: TabId, state: ClientPrivateState) -> Result<()> {
        self.call(|reply| OwnerRequest::SetPrivateState { tab, state, reply })
            .await?
    }

    /// The tab navigated; a hosted lobby advertises the new page.
    pub async fn on_url_change(
        &self,
        tab: TabId,
        url: impl Into<String>,
        title: impl Into<String>,
    ) -> Result<()> {
        let activity = Activity {
            title: title.into(),
            url: url.into(),
        };
        self.call(|reply| OwnerRequest::UrlChanged {
            tab,
            activity,
            reply,
        })
        .await?
    }

    pub async fn get_store(&self) -> Result<StoreView> {
        self.call(|reply| OwnerRequest::GetStore { reply }).await
    }

    pub async fn subscribe(&self) -> Result<StoreSubscription> {
        self.call(|reply| OwnerRequest::Subscribe { reply }).await
    }

    pub async fn unsubscribe(&self, id: Uuid) -> Result<bool> {
        self.call(|reply| OwnerRequest::Unsubscribe { id, reply })
            .await
    }

    /// Subscriptions the owner still holds, released or not by their callers.
    pub async fn subscription_count(&self) -> Result<usize> {
        self.call(|reply| OwnerRequest::SubscriptionCount { reply })
            .await
    }

    pub async fn persist(&self) -> Result<()> {
        self.call(|reply| OwnerRequest::Persist { reply }).await?
    }

    /// Stop the owner, destroying every session.
    pub async fn shutdown(&self) -> Result<()> {
        self.call(|reply| OwnerRequest::Shutdown { reply }).await
    }
}

/// Store operations available to one UI context.
#[async_trait]
pub trait LobbyStoreAccess: Send + Sync {
    fn tab_id(&self) -> TabId;

    async fn get_store(&self) -> Result<StoreView>;

    async fn create_feed(&self, request: CreateFeed) -> Result<FeedHandle>;

    async fn claim(&self, id: LobbyId) -> Result<ClaimOutcome>;

    async fn update_shared(&self, update: SharedUpdate) -> Result<Option<u64>>;

    async fn set_private_state(&self, state: ClientPrivateState) -> Result<()>;

    async fn on_url_change(&self, url: String, title: String) -> Result<()>;

    async fn subscribe(&mut self) -> Result<StoreSubscription>;

    async fn unsubscribe(&mut self, id: Uuid) -> Result<bool>;

    /// The context is going away.
    async fn close(&mut self) -> Result<()>;
}

/// An [`OwnerClient`] bound to one tab.
pub struct TabStore {
    client: OwnerClient,
    tab: TabId,
    subscriptions: HashSet<Uuid>,
}

impl TabStore {
    pub fn new(client: OwnerClient, tab: TabId) -> Self {
        Self {
            client,
            tab,
            subscriptions: HashSet::new(),
        }
    }

    pub fn client(&self) -> &OwnerClient {
        &self.client
    }

    /// Subscriptions opened through this store and not yet released.
    pub fn open_subscriptions(&self) -> usize {
        self.subscriptions.len()
    }

    /// Shortcut for an update closure.
    pub async fn update(&self, f: impl FnOnce(&mut SharedState) + Send + 'static) -> Result<Option<u64>> {
        self.update_shared(Box::new(f)).await
    }
}

#[async_trait]
impl LobbyStoreAccess for TabStore {
    fn tab_id(&self) -> TabId {
        self.tab
    }

    async fn get_store(&self) -> Result<StoreView> {
        self.client.get_store().await
    }

    async fn create_feed(&self, request: CreateFeed) -> Result<FeedHandle> {
        self.client.create_feed(self.tab, request).await
    }

    async fn claim(&self, id: LobbyId) -> Result<ClaimOutcome> {
        self.client.claim(self.tab, id).await
    }

    async fn update_shared(&self, update: SharedUpdate) -> Result<Option<u64>> {
        self.client.update_shared(self.tab, update).await
    }

    async fn set_private_state(&self, state: ClientPrivateState) -> Result<()> {
        self.client.set_private_state(self.tab, state).await
    }

    async fn on_url_change(&self, url: String, title: String) -> Result<()> {
        self.client.on_url_change(self.tab, url, title).await
    }

    async fn subscribe(&mut self) -> Result<StoreSubscription> {
        let subscription = self.client.subscribe().await?;
        self.subscriptions.insert(subscription.id);
        Ok(subscription)
    }

    async fn unsubscribe(&mut self, id: Uuid) -> Result<bool> {
        if !self.subscriptions.remove(&id) {
            return Ok(false);
        }
        self.client.unsubscribe(id).await
    }

    async fn close(&mut self) -> Result<()> {
        for id in std::mem::take(&mut self.subscriptions) {
            self.client.unsubscribe(id).await?;
        }
        self.client.tab_closed(self.tab).await
    }
}
