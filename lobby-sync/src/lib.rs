//! # lobby-sync — peer replication for shared lobby sessions
//!
//! Keeps a small group's session document in sync over a peer transport,
//! with one owner process per browser profile arbitrating which tab holds
//! each live connection.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  RPC (mpsc/oneshot)  ┌──────────────────────────┐
//! │ TabStore     │ ───────────────────► │ LobbyOwner (one task)    │
//! │ (per tab)    │ ◄─── StoreView ───── │  TabClaimCoordinator     │
//! └──────────────┘                      │  LobbySession × N        │
//!                                       └────────────┬─────────────┘
//!                                                    │
//!                                       ┌────────────▼─────────────┐
//!                                       │ ReplicatedFeed           │
//!                                       │  AppendLog  (ordered)    │
//!                                       │  peer msgs  (unordered)  │
//!                                       └────────────┬─────────────┘
//!                                                    │ SharedTransport
//!                                                    ▼
//!                                              other peers
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — signed peer messages (bincode envelope)
//! - [`storage`] — the append-only log interface and the in-memory network
//! - [`transport`] — transport interface and the ref-counted shared connection
//! - [`feed`] — log + peer channel as ordered and unordered event streams
//! - [`session`] — bootstrap, server authority, client join negotiation
//! - [`claim`] — saved lobbies, tab claims, persistence
//! - [`owner`] — the owner task and grace-period handling
//! - [`bridge`] — RPC handles and the tab-scoped store

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod bridge;
pub mod claim;
pub mod error;
pub mod feed;
pub mod owner;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod transport;

pub use bridge::{LobbyStoreAccess, LobbyView, OwnerClient, StoreSubscription, StoreView, TabStore};
pub use claim::{
    ClaimOutcome, LobbyStore, PersistMode, RejectedLobby, SavedLobby, TabClaimCoordinator, TabId,
};
pub use error::{LobbyError, Result};
pub use feed::{
    FeedConfig, FeedContext, FeedEvent, FeedEvents, FeedRecord, RangeReader, ReplicatedFeed, Role,
    TailReader,
};
pub use owner::{
    CreateFeed, FeedHandle, HostAuth, LobbyOwner, OwnerConfig, OwnerRequest, SharedUpdate,
    StaticAuth,
};
pub use protocol::{JoinRequest, MessageType, PeerMessage, SignedMessage, VerifiedMessage};
pub use session::{
    build_initial_state, ClientSession, LobbySession, ServerSession, SessionOptions,
    SessionSnapshot,
};
pub use storage::{
    AppendLog, LogEntry, LogEvent, LogOptions, LogProvider, MemoryLog, MemoryNetwork, MemoryNode,
    NodeStats,
};
pub use transport::{SharedTransport, Transport};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
