//! Integration tests for feeds and sessions over the in-memory network.
//!
//! Each test wires two or more simulated processes (one `MemoryNode` each)
//! onto a shared `MemoryNetwork` and drives real sessions end to end.

use std::sync::Arc;

use lobby_core::{
    diff_state, ConnectionState, Identity, SessionRecord, SharedState, User,
};
use lobby_sync::{
    build_initial_state, AppendLog, FeedConfig, FeedContext, FeedEvent, LobbyError, LobbySession,
    LogOptions, LogProvider, MemoryNetwork, MemoryNode, PeerMessage, ReplicatedFeed, Role,
    SessionOptions, SessionSnapshot, SharedTransport, SignedMessage, Transport,
};
use tokio::time::{timeout, Duration};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn context(node: &Arc<MemoryNode>) -> FeedContext {
    FeedContext::new(node.clone(), SharedTransport::new(node.clone()))
        .with_config(FeedConfig::for_testing())
}

async fn host(node: &Arc<MemoryNode>, name: &str) -> (LobbySession, Identity) {
    let identity = Identity::generate();
    let feed = ReplicatedFeed::create(Role::Server, None, identity.clone(), None, context(node)).unwrap();
    let session = LobbySession::init(Arc::new(feed), SessionOptions::new(name));
    session.connect().await.unwrap();
    (session, identity)
}

fn guest(node: &Arc<MemoryNode>, id: &str, name: &str) -> (LobbySession, Identity) {
    let identity = Identity::generate();
    let feed = ReplicatedFeed::create(Role::Client, Some(id), identity.clone(), None, context(node)).unwrap();
    (LobbySession::init(Arc::new(feed), SessionOptions::new(name)), identity)
}

async fn wait_for(session: &LobbySession, pred: impl Fn(&SessionSnapshot) -> bool) -> SessionSnapshot {
    let mut rx = session.watch();
    timeout(Duration::from_secs(2), async {
        loop {
            let current = rx.borrow_and_update().clone();
            if pred(&current) {
                return current;
            }
            rx.changed().await.expect("session dropped");
        }
    })
    .await
    .expect("timed out waiting for session state")
}

#[tokio::test]
async fn test_server_on_empty_log_writes_genesis() {
    init_logging();
    let network = MemoryNetwork::new();
    let (session, identity) = host(&network.node(), "Alice").await;

    let snapshot = session.snapshot();
    assert_eq!(snapshot.latest_seq, Some(0));
    let shared = snapshot.shared.unwrap();
    assert_eq!(shared.users, vec![User::new(identity.public, "Alice")]);
    assert_eq!(shared.owner_public_key, identity.public);
    assert_eq!(snapshot.connection, ConnectionState::Connected);

    let mut reader = session.feed().read_range().unwrap();
    let batch = reader.next_batch().await.unwrap().unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].seq, 0);
    assert!(matches!(batch[0].record, SessionRecord::SetState(_)));
}

#[tokio::test]
async fn test_client_bootstraps_and_tails_from_next_seq() {
    init_logging();
    let network = MemoryNetwork::new();
    let (host_node, guest_node) = (network.node(), network.node());

    // A raw server feed with [SetState, patch, patch].
    let owner = Identity::generate();
    let server = ReplicatedFeed::create(Role::Server, None, owner.clone(), None, context(&host_node)).unwrap();
    server.connect().await.unwrap();
    let s0 = SharedState::new("lobby", User::new(owner.public, "owner"));
    let mut s1 = s0.clone();
    s1.name = "renamed".into();
    let mut s2 = s1.clone();
    s2.users.push(User::new(Identity::generate().public, "early"));
    server.append(&SessionRecord::SetState(s0.clone())).await.unwrap();
    server.append(&SessionRecord::StatePatch(diff_state(&s0, &s1).unwrap())).await.unwrap();
    server.append(&SessionRecord::StatePatch(diff_state(&s1, &s2).unwrap())).await.unwrap();

    let id = server.id().encode();
    let client_feed = ReplicatedFeed::create(Role::Client, Some(&id), Identity::generate(), None, context(&guest_node)).unwrap();
    client_feed.connect().await.unwrap();
    let bootstrap = build_initial_state(&client_feed).await.unwrap();
    assert_eq!(bootstrap.state.as_ref(), Some(&s2));
    assert_eq!(bootstrap.latest, Some(2));
    assert_eq!(bootstrap.next_seq(), 3);

    let mut tail = client_feed.read_tail(bootstrap.next_seq()).unwrap();
    let mut s3 = s2.clone();
    s3.name = "live".into();
    server.append(&SessionRecord::StatePatch(diff_state(&s2, &s3).unwrap())).await.unwrap();
    let next = timeout(Duration::from_secs(1), tail.recv()).await.unwrap().unwrap();
    assert_eq!(next.seq, 3);

    // A session on a second guest ends at the same document.
    let (session, _) = guest(&network.node(), &id, "Bob");
    session.connect().await.unwrap();
    let snapshot = wait_for(&session, |s| s.latest_seq == Some(3)).await;
    assert_eq!(snapshot.shared, Some(s3));
}

#[tokio::test]
async fn test_duplicate_join_admits_once() {
    init_logging();
    let network = MemoryNetwork::new();
    let (server, _) = host(&network.node(), "host").await;
    let id = server.id().encode();

    let (bob, bob_id) = guest(&network.node(), &id, "Bob");
    bob.connect().await.unwrap();
    wait_for(&bob, |s| s.connection == ConnectionState::Connected).await;

    let LobbySession::Client(bob_client) = &bob else {
        panic!("expected client session");
    };
    bob_client.send_join().unwrap();
    bob_client.send_join().unwrap();

    let (carol, carol_id) = guest(&network.node(), &id, "Carol");
    carol.connect().await.unwrap();
    wait_for(&carol, |s| s.connection == ConnectionState::Connected).await;

    let shared = server.snapshot().shared.unwrap();
    assert_eq!(shared.users.len(), 3);
    assert_eq!(shared.users.iter().filter(|u| u.public_key == bob_id.public).count(), 1);
    assert!(shared.has_user(&carol_id.public));
    // genesis + two admissions
    assert_eq!(server.feed().len(), 3);
}

#[tokio::test]
async fn test_spoofed_joins_are_rejected() {
    init_logging();
    let network = MemoryNetwork::new();
    let (server, host_id) = host(&network.node(), "host").await;
    let lobby = server.id();

    // An attacker process joined to the topic with its own peer key.
    let attacker_node = network.node();
    attacker_node.connect().await.unwrap();
    let attacker = Identity::generate();
    let victim = Identity::generate();
    let raw = attacker_node.open(*lobby.public_key(), LogOptions::read_only()).await.unwrap();
    attacker_node.join(&lobby, attacker.public, raw.clone()).await.unwrap();

    // Signed by the attacker, claiming the victim's key.
    let claimed = SignedMessage::seal(&attacker, &PeerMessage::join(lobby, victim.public, "victim")).unwrap();
    raw.send(claimed, &host_id.public).unwrap();
    // Genuinely signed by the victim but relayed by the attacker.
    let relayed = SignedMessage::seal(&victim, &PeerMessage::join(lobby, victim.public, "victim")).unwrap();
    raw.send(relayed, &host_id.public).unwrap();
    // Garbage is dropped too.
    raw.send(vec![1, 2, 3], &host_id.public).unwrap();

    let (bob, bob_id) = guest(&network.node(), &lobby.encode(), "Bob");
    bob.connect().await.unwrap();
    wait_for(&bob, |s| s.connection == ConnectionState::Connected).await;

    let shared = server.snapshot().shared.unwrap();
    assert!(!shared.has_user(&victim.public));
    assert!(!shared.has_user(&attacker.public));
    assert!(shared.has_user(&bob_id.public));
    assert_eq!(shared.users.len(), 2);
}

#[tokio::test]
async fn test_join_request_sent_once_per_entry() {
    init_logging();
    let network = MemoryNetwork::new();

    // A raw owner that never admits anyone.
    let owner = Identity::generate();
    let server = ReplicatedFeed::create(Role::Server, None, owner.clone(), None, context(&network.node())).unwrap();
    server.connect().await.unwrap();
    let genesis = SharedState::new("lobby", User::new(owner.public, "owner"));
    server.append(&SessionRecord::SetState(genesis.clone())).await.unwrap();
    let mut events = server.subscribe();

    let (bob, bob_id) = guest(&network.node(), &server.id().encode(), "Bob");
    bob.connect().await.unwrap();
    wait_for(&bob, |s| s.connection == ConnectionState::WaitingForJoin).await;

    // Recomputations that stay in WaitingForJoin do not resend.
    let mut renamed = genesis.clone();
    renamed.name = "still waiting".into();
    server
        .append(&SessionRecord::StatePatch(diff_state(&genesis, &renamed).unwrap()))
        .await
        .unwrap();
    wait_for(&bob, |s| s.latest_seq == Some(1)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut joins = 0;
    while let Some(event) = events.try_recv() {
        if let FeedEvent::Message { from, bytes } = event {
            let verified = SignedMessage::open(&bytes).unwrap();
            if let PeerMessage::Join(request) = verified.message {
                assert_eq!(from, bob_id.public);
                assert_eq!(request.name, "Bob");
                joins += 1;
            }
        }
    }
    assert_eq!(joins, 1);
    assert_eq!(bob.connection(), ConnectionState::WaitingForJoin);
}

#[tokio::test]
async fn test_client_waits_for_host() {
    init_logging();
    let network = MemoryNetwork::new();
    let (server, host_id) = host(&network.node(), "host").await;
    let id = server.id().encode();

    let (bob, _) = guest(&network.node(), &id, "Bob");
    bob.connect().await.unwrap();
    wait_for(&bob, |s| s.connection == ConnectionState::Connected).await;

    server.destroy().await;
    let snapshot = wait_for(&bob, |s| s.connection == ConnectionState::WaitingForHost).await;
    assert!(!snapshot.online.contains(&host_id.public));
    assert!(snapshot.shared.is_some());
}

#[tokio::test]
async fn test_server_without_secret_records_log_open_error() {
    init_logging();
    let network = MemoryNetwork::new();
    let (server, _) = host(&network.node(), "host").await;
    let id = server.id().encode();

    let feed = ReplicatedFeed::create(Role::Server, Some(&id), Identity::generate(), None, context(&network.node())).unwrap();
    let impostor = LobbySession::init(Arc::new(feed), SessionOptions::new("impostor"));
    let result = impostor.connect().await;
    assert!(matches!(result, Err(LobbyError::LogOpen(_))));
    let snapshot = impostor.snapshot();
    assert!(snapshot.error.is_some());
}

#[tokio::test]
async fn test_client_feed_is_not_writable() {
    init_logging();
    let network = MemoryNetwork::new();
    let (server, _) = host(&network.node(), "host").await;
    let (bob, _) = guest(&network.node(), &server.id().encode(), "Bob");
    bob.connect().await.unwrap();

    let result = bob.feed().append(&SessionRecord::StatePatch(vec![])).await;
    assert!(matches!(result, Err(LobbyError::NotWritable)));
    assert!(bob.as_server().is_none());
}

#[tokio::test]
async fn test_forged_log_entries_never_apply() {
    init_logging();
    let network = MemoryNetwork::new();
    let (server, _) = host(&network.node(), "host").await;
    let guest_node = network.node();
    let (bob, _) = guest(&guest_node, &server.id().encode(), "Bob");
    bob.connect().await.unwrap();
    wait_for(&bob, |s| s.connection == ConnectionState::Connected).await;

    let replica = guest_node.log(server.id().public_key()).unwrap();
    let forger = lobby_core::SecretKey::generate();
    let forged_state = SharedState::new("hijacked", User::new(forger.public(), "mallory"));
    let forged = lobby_sync::LogEntry::sign(
        &forger,
        replica.len(),
        SessionRecord::SetState(forged_state).encode().unwrap(),
    );
    assert_eq!(replica.ingest(vec![forged]), 0);

    server
        .as_server()
        .unwrap()
        .update(|s| s.name = "legit".into())
        .await
        .unwrap();
    let snapshot = wait_for(&bob, |s| s.shared.as_ref().is_some_and(|x| x.name == "legit")).await;
    assert_ne!(snapshot.shared.unwrap().owner_public_key, forger.public());
}
