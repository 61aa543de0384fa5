//! Peer transport interface and the process-wide shared connection.
//!
//! A transport connects this process to the peers of a topic (a lobby id)
//! and carries log replication plus extension-channel bytes for the logs
//! joined to that topic.
//!
//! All live feeds in the owner process share one transport connection. The
//! connection opens with the first [`SharedTransport::acquire`] and closes
//! when the last holder calls [`SharedTransport::release`].

use std::sync::Arc;

use async_trait::async_trait;
use lobby_core::{LobbyId, PublicKey};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::storage::AppendLog;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the underlying connection (e.g. to the signaling relay).
    async fn connect(&self) -> Result<()>;

    /// Announce `peer` on `topic` and start replicating `log` with the
    /// other peers there.
    async fn join(&self, topic: &LobbyId, peer: PublicKey, log: Arc<dyn AppendLog>) -> Result<()>;

    async fn leave(&self, topic: &LobbyId, peer: &PublicKey);

    async fn close(&self);
}

/// Reference-counted handle to the process transport.
#[derive(Clone)]
pub struct SharedTransport {
    inner: Arc<dyn Transport>,
    refs: Arc<Mutex<usize>>,
}

impl SharedTransport {
    pub fn new(inner: Arc<dyn Transport>) -> Self {
        Self {
            inner,
            refs: Arc::new(Mutex::new(0)),
        }
    }

    /// Take a reference, connecting on the first one.
    pub async fn acquire(&self) -> Result<()> {
        let mut refs = self.refs.lock().await;
        if *refs == 0 {
            self.inner.connect().await?;
            log::info!("transport connected");
        }
        *refs += 1;
        Ok(())
    }

    /// Drop a reference, closing the connection at zero.
    pub async fn release(&self) {
        let mut refs = self.refs.lock().await;
        match *refs {
            0 => log::warn!("transport released more often than acquired"),
            1 => {
                *refs = 0;
                self.inner.close().await;
                log::info!("transport closed");
            }
            _ => *refs -= 1,
        }
    }

    pub async fn ref_count(&self) -> usize {
        *self.refs.lock().await
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner
    }
}
