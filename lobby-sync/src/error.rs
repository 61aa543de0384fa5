//! Error taxonomy for feeds, sessions and the owner process.

use lobby_core::{IdError, PatchError, PublicKey, RecordError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LobbyError {
    /// User-correctable: the lobby id was corrupted or mistyped.
    #[error("invalid lobby id: {0}")]
    InvalidLobbyId(#[from] IdError),

    /// Opening the log failed, e.g. joining as server without owning the log.
    #[error("failed to open log: {0}")]
    LogOpen(String),

    /// Append attempted by a participant that does not own the log.
    #[error("log is not writable by this participant")]
    NotWritable,

    /// A peer message failed schema or signature validation.
    #[error("invalid peer message: {0}")]
    InvalidPeerMessage(String),

    /// A join request claimed a key other than its cryptographic sender.
    #[error("join from {sender:?} claimed key {claimed:?}")]
    SpoofedJoin { sender: PublicKey, claimed: PublicKey },

    /// The host-site session ended while a lobby connection was being set up.
    #[error("host user logged out")]
    UserLoggedOut,

    #[error("feed has been destroyed")]
    Destroyed,

    #[error("feed is not connected")]
    NotConnected,

    #[error("peer {0:?} is not connected")]
    UnknownPeer(PublicKey),

    #[error("codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error("only the server role may do this")]
    NotServer,

    #[error("persistence error: {0}")]
    Persist(String),

    #[error("lobby owner has shut down")]
    OwnerGone,
}

impl LobbyError {
    /// Whether this error belongs on the saved lobby entry shown to the user.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            LobbyError::InvalidLobbyId(_) | LobbyError::LogOpen(_) | LobbyError::UserLoggedOut
        )
    }
}

pub type Result<T, E = LobbyError> = std::result::Result<T, E>;
