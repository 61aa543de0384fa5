//! Patch-batch fuzzing: for any interleaving of server mutations grouped into
//! commits, replaying `SetState` + the committed patches reproduces the
//! server's in-memory state after every commit.

use lobby_core::{
    diff_state, replay, Activity, Bootstrap, SecretKey, SessionRecord, SharedState, User,
};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Mutation {
    Rename(String),
    AddUser(u8, String),
    RemoveUser(usize),
    RenameUser(usize, String),
    SetActivity(Option<(String, String)>),
    Commit,
}

fn user_from_seed(seed: u8, name: &str) -> User {
    User::new(SecretKey::from_bytes(&[seed; 32]).public(), name)
}

fn mutation() -> impl Strategy<Value = Mutation> {
    prop_oneof![
        "[a-z ]{0,12}".prop_map(Mutation::Rename),
        (any::<u8>(), "[a-z]{1,8}").prop_map(|(s, n)| Mutation::AddUser(s, n)),
        (0usize..8).prop_map(Mutation::RemoveUser),
        (0usize..8, "[a-z/~]{1,8}").prop_map(|(i, n)| Mutation::RenameUser(i, n)),
        proptest::option::of(("[a-z]{1,6}", "https://[a-z]{1,6}\\.test/[a-z]{0,4}"))
            .prop_map(Mutation::SetActivity),
        Just(Mutation::Commit),
    ]
}

fn mutate(state: &mut SharedState, m: &Mutation) {
    match m {
        Mutation::Rename(name) => state.name = name.clone(),
        Mutation::AddUser(seed, name) => {
            state.add_user(user_from_seed(*seed, name));
        }
        Mutation::RemoveUser(i) => {
            // The owner stays a member.
            if *i > 0 && *i < state.users.len() {
                state.users.remove(*i);
            }
        }
        Mutation::RenameUser(i, name) => {
            if let Some(user) = state.users.get_mut(*i) {
                user.name = name.clone();
            }
        }
        Mutation::SetActivity(activity) => {
            state.activity = activity
                .clone()
                .map(|(title, url)| Activity { title, url });
        }
        Mutation::Commit => {}
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_replay_matches_live_state(mutations in proptest::collection::vec(mutation(), 0..60)) {
        let genesis = SharedState::new("lobby", user_from_seed(0, "host"));
        let mut log = vec![SessionRecord::SetState(genesis.clone())];
        let mut committed = genesis.clone();
        let mut live = genesis;

        let final_commit = Mutation::Commit;
        for m in mutations.iter().chain(std::iter::once(&final_commit)) {
            mutate(&mut live, m);
            if matches!(m, Mutation::Commit) {
                let ops = diff_state(&committed, &live).unwrap();
                if !ops.is_empty() {
                    log.push(SessionRecord::StatePatch(ops));
                }
                committed = live.clone();

                let replayed = replay(log.clone()).unwrap();
                prop_assert_eq!(replayed.as_ref(), Some(&live));

                let mut boot = Bootstrap::new();
                for (seq, record) in log.iter().cloned().enumerate().rev() {
                    if boot.push(seq as u64, record) {
                        break;
                    }
                }
                let result = boot.finish().unwrap();
                prop_assert_eq!(result.state.as_ref(), Some(&live));
                prop_assert_eq!(result.latest, Some(log.len() as u64 - 1));
            }
        }
    }
}
