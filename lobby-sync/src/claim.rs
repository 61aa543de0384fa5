//! Saved lobbies and tab claims.
//!
//! Each saved lobby is live in at most one tab. A lobby claimed elsewhere
//! answers with the tab to switch to instead of opening a second connection,
//! and the claiming tab keeps what it had. A successful claim gives up the
//! tab's previous lobby.
//!
//! ```text
//!  tab 7 ──claim(A)──► A: claimed by 7
//!  tab 9 ──claim(A)──► SwitchToTab(7)
//!  tab 7 ──claim(B)──► A released, B: claimed by 7
//!  tab 7 closes ─────► grace window ─► tab 9 may take A over
//! ```
//!
//! The store is kept most-recently-used first and persists to JSON. In
//! production the persisted copy carries neither claims nor errored entries.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use indexmap::IndexMap;
use lobby_core::{Identity, LobbyId, SecretKey};
use serde::{Deserialize, Serialize};

use crate::error::{LobbyError, Result};
use crate::feed::Role;

/// A UI context (browser tab) id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub u64);

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tab#{}", self.0)
    }
}

/// A lobby remembered across tabs and restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedLobby {
    pub id: LobbyId,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claiming_tab_id: Option<TabId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Log secret of a lobby this process hosts. Never persisted.
    #[serde(skip)]
    pub server_secret: Option<SecretKey>,
    /// Participant identity for this lobby. Never persisted.
    #[serde(skip)]
    pub identity: Option<Identity>,
}

impl SavedLobby {
    pub fn new(id: LobbyId, role: Role) -> Self {
        Self {
            id,
            role,
            display_name: None,
            claiming_tab_id: None,
            error: None,
            server_secret: None,
            identity: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn is_errored(&self) -> bool {
        self.error.is_some()
    }
}

/// Which persisted view to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistMode {
    /// Drop claims and errored entries
    #[default]
    Production,
    /// Keep everything, for debugging
    Development,
}

/// Saved lobbies, most recently used first.
#[derive(Debug, Clone, Default)]
pub struct LobbyStore {
    lobbies: IndexMap<LobbyId, SavedLobby>,
}

impl LobbyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lobbies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lobbies.is_empty()
    }

    pub fn get(&self, id: &LobbyId) -> Option<&SavedLobby> {
        self.lobbies.get(id)
    }

    pub fn get_mut(&mut self, id: &LobbyId) -> Option<&mut SavedLobby> {
        self.lobbies.get_mut(id)
    }

    pub fn contains(&self, id: &LobbyId) -> bool {
        self.lobbies.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SavedLobby> {
        self.lobbies.values()
    }

    /// Insert or replace, moving the entry to the front.
    pub fn upsert(&mut self, lobby: SavedLobby) {
        self.lobbies.shift_remove(&lobby.id);
        self.lobbies.shift_insert(0, lobby.id, lobby);
    }

    /// Move an entry to the front.
    pub fn touch(&mut self, id: &LobbyId) {
        if let Some(index) = self.lobbies.get_index_of(id) {
            self.lobbies.move_index(index, 0);
        }
    }

    pub fn remove(&mut self, id: &LobbyId) -> Option<SavedLobby> {
        self.lobbies.shift_remove(id)
    }

    /// The copy that goes to disk.
    pub fn persisted(&self, mode: PersistMode) -> Vec<SavedLobby> {
        match mode {
            PersistMode::Development => self.lobbies.values().cloned().collect(),
            PersistMode::Production => self
                .lobbies
                .values()
                .filter(|lobby| !lobby.is_errored())
                .map(|lobby| SavedLobby {
                    claiming_tab_id: None,
                    ..lobby.clone()
                })
                .collect(),
        }
    }

    pub fn save(&self, path: &Path, mode: PersistMode) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.persisted(mode))
            .map_err(|e| LobbyError::Persist(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| LobbyError::Persist(e.to_string()))?;
        log::debug!("saved {} lobbies to {}", self.len(), path.display());
        Ok(())
    }

    /// Load a saved store. A missing file is an empty store.
    pub fn load(path: &Path) -> Result<Self> {
        let json = match std::fs::read_to_string(path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(LobbyError::Persist(e.to_string())),
        };
        let saved: Vec<SavedLobby> =
            serde_json::from_str(&json).map_err(|e| LobbyError::Persist(e.to_string()))?;
        Ok(Self {
            lobbies: saved.into_iter().map(|lobby| (lobby.id, lobby)).collect(),
        })
    }
}

/// Result of a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// The tab already holds this lobby
    AlreadyClaimed,
    /// Another tab holds it; focus that one instead
    SwitchToTab(TabId),
    /// Claimed from a tab that closed and is still inside its grace window
    TakenOver { from: TabId },
    UnknownLobby,
}

impl ClaimOutcome {
    /// Whether the claiming tab now holds the lobby.
    pub fn is_held(&self) -> bool {
        matches!(
            self,
            ClaimOutcome::Claimed | ClaimOutcome::AlreadyClaimed | ClaimOutcome::TakenOver { .. }
        )
    }
}

/// A join attempt whose id did not decode. Kept for display until dismissed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedLobby {
    /// The id as the user entered it
    pub raw_id: String,
    pub display_name: Option<String>,
    pub error: String,
}

/// Arbitrates which tab owns the live connection of each saved lobby.
#[derive(Debug, Default)]
pub struct TabClaimCoordinator {
    store: LobbyStore,
    /// Tabs that closed but whose claims have not expired yet
    closing: HashSet<TabId>,
    /// Undecodable join attempts, newest first, keyed by raw id
    rejected: IndexMap<String, RejectedLobby>,
}

impl TabClaimCoordinator {
    pub fn new(store: LobbyStore) -> Self {
        Self {
            store,
            ..Self::default()
        }
    }

    pub fn store(&self) -> &LobbyStore {
        &self.store
    }

    /// Remember a join attempt with an unusable id.
    pub fn reject(&mut self, entry: RejectedLobby) {
        log::info!("rejected lobby id {:?}: {}", entry.raw_id, entry.error);
        self.rejected.shift_remove(&entry.raw_id);
        self.rejected.shift_insert(0, entry.raw_id.clone(), entry);
    }

    pub fn rejected(&self) -> impl Iterator<Item = &RejectedLobby> {
        self.rejected.values()
    }

    pub fn dismiss_rejected(&mut self, raw_id: &str) -> bool {
        self.rejected.shift_remove(raw_id).is_some()
    }

    pub fn upsert(&mut self, lobby: SavedLobby) {
        self.store.upsert(lobby);
    }

    /// The lobby `tab` holds, if any.
    pub fn claimed_by(&self, tab: TabId) -> Option<LobbyId> {
        self.store
            .iter()
            .find(|lobby| lobby.claiming_tab_id == Some(tab))
            .map(|lobby| lobby.id)
    }

    pub fn is_claimed(&self, id: &LobbyId) -> bool {
        self.store
            .get(id)
            .is_some_and(|lobby| lobby.claiming_tab_id.is_some())
    }

    pub fn claim(&mut self, tab: TabId, id: LobbyId) -> ClaimOutcome {
        let Some(holder) = self.store.get(&id).map(|lobby| lobby.claiming_tab_id) else {
            return ClaimOutcome::UnknownLobby;
        };
        // A refused claim leaves the tab's current lobby alone.
        let outcome = match holder {
            Some(other) if other == tab => return ClaimOutcome::AlreadyClaimed,
            Some(other) if !self.closing.contains(&other) => {
                return ClaimOutcome::SwitchToTab(other)
            }
            Some(other) => ClaimOutcome::TakenOver { from: other },
            None => ClaimOutcome::Claimed,
        };

        if self.claimed_by(tab).is_some() {
            self.release(tab);
        }
        let Some(lobby) = self.store.get_mut(&id) else {
            return ClaimOutcome::UnknownLobby;
        };
        lobby.claiming_tab_id = Some(tab);
        if let ClaimOutcome::TakenOver { from } = outcome {
            self.closing.remove(&from);
            log::info!("{tab} took over lobby {id} from closing {from}");
        } else {
            log::info!("{tab} claimed lobby {id}");
        }
        self.store.touch(&id);
        outcome
    }

    /// Give up the tab's claim. An errored entry goes away with it.
    pub fn release(&mut self, tab: TabId) -> Option<LobbyId> {
        self.closing.remove(&tab);
        let id = self.claimed_by(tab)?;
        let errored = self.store.get(&id).is_some_and(SavedLobby::is_errored);
        if errored {
            self.store.remove(&id);
            log::info!("{tab} released errored lobby {id}, removed");
        } else if let Some(lobby) = self.store.get_mut(&id) {
            lobby.claiming_tab_id = None;
            log::info!("{tab} released lobby {id}");
        }
        Some(id)
    }

    /// The tab went away; its claim stays until the grace window ends.
    pub fn mark_closing(&mut self, tab: TabId) -> Option<LobbyId> {
        let id = self.claimed_by(tab)?;
        self.closing.insert(tab);
        Some(id)
    }

    pub fn mark_reopened(&mut self, tab: TabId) -> bool {
        self.closing.remove(&tab)
    }

    pub fn is_closing(&self, tab: TabId) -> bool {
        self.closing.contains(&tab)
    }

    pub fn record_error(&mut self, id: &LobbyId, error: impl Into<String>) {
        if let Some(lobby) = self.store.get_mut(id) {
            lobby.error = Some(error.into());
        }
    }

    pub fn clear_error(&mut self, id: &LobbyId) {
        if let Some(lobby) = self.store.get_mut(id) {
            lobby.error = None;
        }
    }

    /// Delete an errored entry. Healthy entries are left alone.
    pub fn dismiss(&mut self, id: &LobbyId) -> bool {
        if self.store.get(id).is_some_and(SavedLobby::is_errored) {
            self.store.remove(id);
            return true;
        }
        false
    }

    pub fn remove(&mut self, id: &LobbyId) -> Option<SavedLobby> {
        let removed = self.store.remove(id)?;
        if let Some(tab) = removed.claiming_tab_id {
            self.closing.remove(&tab);
        }
        Some(removed)
    }
}
