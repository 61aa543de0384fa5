//! # lobby-core — shared session document model
//!
//! Synchronous building blocks for the lobby replication layer:
//!
//! - [`identity`] — ed25519 identities and checksummed [`LobbyId`]s
//! - [`patch`] — structural diff/apply over the JSON form of [`SharedState`]
//! - [`record`] — log records and deterministic replay
//! - [`connection`] — derived connection state and the join edge trigger
//!
//! Nothing here touches the network or an async runtime; `lobby-sync` drives
//! these types from its feed and session tasks.

use serde::{Deserialize, Serialize};

pub mod connection;
pub mod identity;
pub mod patch;
pub mod record;

pub use connection::{derive_connection_state, ConnectionInputs, ConnectionState, JoinTrigger};
pub use identity::{IdError, Identity, LobbyId, PublicKey, SecretKey, Signature, SignatureError};
pub use patch::{apply_to_state, diff_state, PatchError, PatchOp};
pub use record::{replay, Bootstrap, BootstrapResult, RecordError, SessionRecord};

/// A lobby member as recorded in the shared document.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct User {
    pub public_key: PublicKey,
    pub name: String,
}

impl User {
    pub fn new(public_key: PublicKey, name: impl Into<String>) -> Self {
        Self {
            public_key,
            name: name.into(),
        }
    }
}

/// What the lobby is currently doing on the host site.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Activity {
    pub title: String,
    pub url: String,
}

/// The single authoritative session document.
///
/// Owned and mutated only by the server role; clients apply records.
/// `users` lists everyone ever admitted, which is not the same as who is
/// online right now.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct SharedState {
    pub name: String,
    pub owner_public_key: PublicKey,
    pub users: Vec<User>,
    pub activity: Option<Activity>,
}

impl SharedState {
    /// Genesis document: the owner is the only member.
    pub fn new(name: impl Into<String>, owner: User) -> Self {
        Self {
            name: name.into(),
            owner_public_key: owner.public_key,
            users: vec![owner],
            activity: None,
        }
    }

    pub fn has_user(&self, key: &PublicKey) -> bool {
        self.users.iter().any(|u| &u.public_key == key)
    }

    pub fn user(&self, key: &PublicKey) -> Option<&User> {
        self.users.iter().find(|u| &u.public_key == key)
    }

    /// Add a member unless one with the same key exists. Returns whether the
    /// list changed.
    pub fn add_user(&mut self, user: User) -> bool {
        if self.has_user(&user.public_key) {
            return false;
        }
        self.users.push(user);
        true
    }

    pub fn remove_user(&mut self, key: &PublicKey) -> bool {
        let before = self.users.len();
        self.users.retain(|u| &u.public_key != key);
        self.users.len() != before
    }
}

/// Per-member payload broadcast over the unordered channel.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
pub struct ClientPrivateState {
    pub ready: bool,
    pub status: Option<String>,
}
