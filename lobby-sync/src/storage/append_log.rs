//! The authenticated append-only log interface.
//!
//! A log is named by an ed25519 public key. Only the holder of the matching
//! secret can append; every entry carries a signature over its sequence
//! number and payload, so replicas can verify what they receive.
//!
//! ```text
//! ┌──────────┬──────────────────────┬────────────┐
//! │ seq (BE) │ data                 │ signature  │
//! │ 8 bytes  │ variable             │ 64 bytes   │
//! └──────────┴──────────────────────┴────────────┘
//!   signed bytes = seq ‖ data
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use lobby_core::{PublicKey, SecretKey, Signature};
use tokio::sync::broadcast;

use crate::error::Result;

/// A single log entry.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Zero-based, strictly increasing, gapless
    pub seq: u64,
    pub data: Vec<u8>,
    /// Signature by the log key over `seq ‖ data`
    pub signature: Signature,
}

impl LogEntry {
    /// Create and sign an entry.
    pub fn sign(secret: &SecretKey, seq: u64, data: Vec<u8>) -> Self {
        let signature = secret.sign(&Self::signed_bytes(seq, &data));
        Self {
            seq,
            data,
            signature,
        }
    }

    /// Verify the entry against the log key.
    pub fn verify(&self, key: &PublicKey) -> bool {
        key.verify(&Self::signed_bytes(self.seq, &self.data), &self.signature)
            .is_ok()
    }

    fn signed_bytes(seq: u64, data: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8 + data.len());
        bytes.extend_from_slice(&seq.to_be_bytes());
        bytes.extend_from_slice(data);
        bytes
    }

    /// Keep the longest verified, gapless prefix starting at `start`.
    ///
    /// Entries failing verification are dropped before duplicates are, so a
    /// forged entry never shadows the genuine one at the same sequence number.
    /// Returns the accepted entries and the number rejected.
    pub fn verified_run(key: &PublicKey, start: u64, mut entries: Vec<LogEntry>) -> (Vec<LogEntry>, usize) {
        let received = entries.len();
        entries.retain(|e| e.verify(key));
        let forged = received - entries.len();
        entries.sort_by_key(|e| e.seq);
        entries.dedup_by_key(|e| e.seq);
        let total = entries.len() + forged;

        let mut accepted = Vec::with_capacity(entries.len());
        let mut next = start;
        for entry in entries {
            if entry.seq < next {
                continue;
            }
            if entry.seq > next {
                break;
            }
            next += 1;
            accepted.push(entry);
        }
        let skipped = total - accepted.len();
        (accepted, skipped)
    }
}

/// Notifications from a log.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEvent {
    /// The log grew to `len` entries
    Appended { len: u64 },
    /// A replica of this log connected
    PeerOpen(PublicKey),
    /// A replica of this log went away
    PeerRemove(PublicKey),
    /// Extension-channel bytes from a connected peer
    Message { from: PublicKey, data: Vec<u8> },
}

/// How to open a log.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub writable: bool,
    pub secret: Option<SecretKey>,
}

impl LogOptions {
    pub fn read_only() -> Self {
        Self::default()
    }

    pub fn owner(secret: SecretKey) -> Self {
        Self {
            writable: true,
            secret: Some(secret),
        }
    }
}

/// An opened log replica.
#[async_trait]
pub trait AppendLog: Send + Sync {
    /// The public key naming this log.
    fn key(&self) -> PublicKey;

    fn writable(&self) -> bool;

    /// Number of entries held locally.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append an entry, returning its sequence number.
    async fn append(&self, data: Vec<u8>) -> Result<u64>;

    /// Entries in `start..end` (end exclusive), clamped to what is held.
    async fn read_range(&self, start: u64, end: u64) -> Result<Vec<LogEntry>>;

    fn subscribe(&self) -> broadcast::Receiver<LogEvent>;

    /// Peer keys of the replicas currently connected.
    fn peers(&self) -> Vec<PublicKey>;

    /// Send extension bytes to one connected peer.
    fn send(&self, data: Vec<u8>, peer: &PublicKey) -> Result<()>;

    /// Send extension bytes to every connected peer. Returns the fan-out.
    fn broadcast(&self, data: Vec<u8>) -> usize;

    async fn close(&self);
}

/// Opens logs by key.
#[async_trait]
pub trait LogProvider: Send + Sync {
    async fn open(&self, key: PublicKey, options: LogOptions) -> Result<Arc<dyn AppendLog>>;
}
