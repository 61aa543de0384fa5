//! Derived connection state.
//!
//! The connection state is never stored. It is recomputed from the local
//! user, any recorded error, the shared document and the set of peers online
//! right now:
//!
//! ```text
//! no local user ─────────────► Disconnected
//! recorded error ────────────► Error
//! no SharedState ────────────► GettingInitialData
//! owner not online ──────────► WaitingForHost
//! local user not a member ───► WaitingForJoin
//! otherwise ─────────────────► Connected
//! ```

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{PublicKey, SharedState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Error,
    GettingInitialData,
    WaitingForHost,
    WaitingForJoin,
    Connected,
}

/// Everything the connection state depends on.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionInputs<'a> {
    pub local_user: Option<&'a PublicKey>,
    pub error: Option<&'a str>,
    pub shared: Option<&'a SharedState>,
    pub online: &'a BTreeSet<PublicKey>,
}

pub fn derive_connection_state(inputs: &ConnectionInputs<'_>) -> ConnectionState {
    let Some(local) = inputs.local_user else {
        return ConnectionState::Disconnected;
    };
    if inputs.error.is_some() {
        return ConnectionState::Error;
    }
    let Some(shared) = inputs.shared else {
        return ConnectionState::GettingInitialData;
    };
    if !inputs.online.contains(&shared.owner_public_key) {
        return ConnectionState::WaitingForHost;
    }
    if !shared.has_user(local) {
        return ConnectionState::WaitingForJoin;
    }
    ConnectionState::Connected
}

/// Edge detector for entering [`ConnectionState::WaitingForJoin`].
///
/// A client sends its join request once per entry into that state, never on
/// repeated recomputation of the same state.
#[derive(Debug, Default)]
pub struct JoinTrigger {
    last: Option<ConnectionState>,
}

impl JoinTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the latest state. Returns `true` when a join should be sent.
    pub fn observe(&mut self, state: ConnectionState) -> bool {
        let previous = self.last.replace(state);
        state == ConnectionState::WaitingForJoin && previous != Some(ConnectionState::WaitingForJoin)
    }

    pub fn last(&self) -> Option<ConnectionState> {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Identity, User};

    struct Fixture {
        owner: PublicKey,
        guest: PublicKey,
        state: SharedState,
    }

    fn fixture() -> Fixture {
        let owner = Identity::generate().public;
        let guest = Identity::generate().public;
        Fixture {
            owner,
            guest,
            state: SharedState::new("lobby", User::new(owner, "host")),
        }
    }

    fn derive(
        local: Option<&PublicKey>,
        error: Option<&str>,
        shared: Option<&SharedState>,
        online: &BTreeSet<PublicKey>,
    ) -> ConnectionState {
        derive_connection_state(&ConnectionInputs {
            local_user: local,
            error,
            shared,
            online,
        })
    }

    #[test]
    fn test_state_precedence() {
        let f = fixture();
        let none = BTreeSet::new();
        let owner_online: BTreeSet<_> = [f.owner].into_iter().collect();

        assert_eq!(
            derive(None, Some("boom"), Some(&f.state), &owner_online),
            ConnectionState::Disconnected
        );
        assert_eq!(
            derive(Some(&f.guest), Some("boom"), None, &none),
            ConnectionState::Error
        );
        assert_eq!(
            derive(Some(&f.guest), None, None, &owner_online),
            ConnectionState::GettingInitialData
        );
        assert_eq!(
            derive(Some(&f.guest), None, Some(&f.state), &none),
            ConnectionState::WaitingForHost
        );
        assert_eq!(
            derive(Some(&f.guest), None, Some(&f.state), &owner_online),
            ConnectionState::WaitingForJoin
        );
        assert_eq!(
            derive(Some(&f.owner), None, Some(&f.state), &owner_online),
            ConnectionState::Connected
        );
    }

    #[test]
    fn test_derivation_is_pure() {
        let f = fixture();
        let online: BTreeSet<_> = [f.owner].into_iter().collect();
        let first = derive(Some(&f.guest), None, Some(&f.state), &online);
        for _ in 0..10 {
            assert_eq!(derive(Some(&f.guest), None, Some(&f.state), &online), first);
        }
    }

    #[test]
    fn test_join_trigger_fires_once_per_entry() {
        use ConnectionState::*;

        let mut trigger = JoinTrigger::new();
        let sequence = [
            GettingInitialData,
            WaitingForHost,
            WaitingForJoin,
            WaitingForJoin,
            WaitingForJoin,
            Connected,
            Connected,
        ];
        let fired = sequence.iter().filter(|s| trigger.observe(**s)).count();
        assert_eq!(fired, 1);
        assert_eq!(trigger.last(), Some(Connected));
    }

    #[test]
    fn test_join_trigger_refires_after_leaving_state() {
        use ConnectionState::*;

        let mut trigger = JoinTrigger::new();
        assert!(trigger.observe(WaitingForJoin));
        assert!(!trigger.observe(WaitingForJoin));
        assert!(!trigger.observe(WaitingForHost));
        assert!(trigger.observe(WaitingForJoin));
    }
}
