//! Session log records and replay.
//!
//! The log of a lobby is `SetState` at genesis followed by `StatePatch`
//! entries. Replaying them in sequence order reproduces the server's live
//! state at every point.
//!
//! Bootstrapping scans the log backwards in batches ([`Bootstrap`]): patch
//! payloads are prepended until a `SetState` is reached, then applied forward
//! onto it.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::patch::{apply_to_state, PatchError, PatchOp};
use crate::SharedState;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record encode failed: {0}")]
    Encode(String),

    #[error("record decode failed: {0}")]
    Decode(String),
}

/// One entry of the session log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum SessionRecord {
    SetState(SharedState),
    StatePatch(Vec<PatchOp>),
}

impl SessionRecord {
    pub fn encode(&self) -> Result<Vec<u8>, RecordError> {
        serde_json::to_vec(self).map_err(|e| RecordError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        serde_json::from_slice(bytes).map_err(|e| RecordError::Decode(e.to_string()))
    }
}

/// Forward replay of records in sequence order.
///
/// Patches before the first `SetState` have nothing to apply to and are
/// skipped. A `SetState` later in the log replaces the state wholesale.
pub fn replay<I>(records: I) -> Result<Option<SharedState>, PatchError>
where
    I: IntoIterator<Item = SessionRecord>,
{
    let mut state: Option<SharedState> = None;
    for record in records {
        match record {
            SessionRecord::SetState(s) => state = Some(s),
            SessionRecord::StatePatch(ops) => {
                if let Some(current) = &state {
                    state = Some(apply_to_state(current, &ops)?);
                }
            }
        }
    }
    Ok(state)
}

/// Outcome of a reverse bootstrap scan.
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapResult {
    pub state: Option<SharedState>,
    /// Highest sequence number seen; `None` for an empty log.
    pub latest: Option<u64>,
}

impl BootstrapResult {
    /// First sequence number a tail reader should ask for.
    pub fn next_seq(&self) -> u64 {
        self.latest.map_or(0, |seq| seq + 1)
    }
}

/// Accumulator for a newest-first scan of the log.
#[derive(Debug, Default)]
pub struct Bootstrap {
    /// Patch payloads, oldest at the front.
    pending: VecDeque<Vec<PatchOp>>,
    base: Option<SharedState>,
    latest: Option<u64>,
}

impl Bootstrap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next-older record. Returns `true` once a `SetState` has been
    /// reached and the scan can stop.
    pub fn push(&mut self, seq: u64, record: SessionRecord) -> bool {
        if self.base.is_some() {
            return true;
        }
        self.latest = Some(self.latest.map_or(seq, |l| l.max(seq)));
        match record {
            SessionRecord::StatePatch(ops) => {
                self.pending.push_front(ops);
                false
            }
            SessionRecord::SetState(state) => {
                self.base = Some(state);
                true
            }
        }
    }

    /// Note a sequence number whose record could not be decoded.
    pub fn skip(&mut self, seq: u64) {
        self.latest = Some(self.latest.map_or(seq, |l| l.max(seq)));
    }

    pub fn is_complete(&self) -> bool {
        self.base.is_some()
    }

    pub fn finish(self) -> Result<BootstrapResult, PatchError> {
        let Some(mut state) = self.base else {
            if !self.pending.is_empty() {
                log::warn!(
                    "bootstrap found {} patches but no SetState",
                    self.pending.len()
                );
            }
            return Ok(BootstrapResult {
                state: None,
                latest: self.latest,
            });
        };
        for ops in &self.pending {
            state = apply_to_state(&state, ops)?;
        }
        Ok(BootstrapResult {
            state: Some(state),
            latest: self.latest,
        })
    }
}
