//! Outbound sends and inbound dispatch between two nodes on one network.

mod common;

use std::time::Duration;

use common::{Node, TEST_TIMEOUT, listener, message};
use peer_registry::memory::MemoryTransport;
use peer_registry::{Addressing, ConnectionStatus, ContactId, ProfileId, RegistryError};
use tokio::time::{Instant, timeout};

/// Alice (node A, profile 1) and bob (node B, profile 1) know each other as
/// contact 9.
async fn connected_pair(net: &MemoryTransport) -> (Node, Node) {
    let a = Node::new(net);
    let b = Node::new(net);
    a.add(1, "alice", 9, "bob").await;
    b.add(1, "bob", 9, "alice").await;
    a.wait_for_status(1, 9, ConnectionStatus::Open).await;
    b.wait_for_status(1, 9, ConnectionStatus::Open).await;
    (a, b)
}

#[tokio::test(start_paused = true)]
async fn addressing_is_mirrored_between_send_and_notify() {
    let net = MemoryTransport::new();
    let (a, mut b) = connected_pair(&net).await;

    let sent = message("hello bob");
    a.orchestrator
        .router()
        .send_message(Addressing::outbound(ProfileId(1), ContactId(9)), &sent)
        .await
        .unwrap();

    let envelope = timeout(TEST_TIMEOUT, b.inbox.recv())
        .await
        .expect("no delivery")
        .expect("inbox closed");
    assert_eq!(envelope.message, sent);
    assert_eq!(envelope.addressing.sender_db_id, 9);
    assert_eq!(envelope.addressing.receiver_db_id, 1);
}

#[tokio::test(start_paused = true)]
async fn frames_arrive_in_write_order() {
    let net = MemoryTransport::new();
    let (a, mut b) = connected_pair(&net).await;

    let router = a.orchestrator.router();
    for text in ["one", "two", "three"] {
        router
            .send_message(Addressing::outbound(ProfileId(1), ContactId(9)), &message(text))
            .await
            .unwrap();
    }

    let mut received = Vec::new();
    for _ in 0..3 {
        let envelope = timeout(TEST_TIMEOUT, b.inbox.recv()).await.unwrap().unwrap();
        received.push(envelope.message.text);
    }
    assert_eq!(received, vec!["one", "two", "three"]);
}

#[tokio::test(start_paused = true)]
async fn pending_send_completes_within_one_interval_of_open() {
    let net = MemoryTransport::new();
    let (_bob, _accepted) = listener(&net, "bob").await;
    let node = Node::new(&net);
    let interval = node.orchestrator.settings().retry_interval;

    net.pause_dials();
    node.add(1, "alice", 9, "bob").await;

    let router = node.orchestrator.router().clone();
    let send = tokio::spawn(async move {
        router
            .send_message(
                Addressing::outbound(ProfileId(1), ContactId(9)),
                &message("queued"),
            )
            .await
    });

    tokio::time::sleep(interval * 3).await;
    assert!(!send.is_finished());

    let opened_at = Instant::now();
    net.release_dials();
    node.wait_for_status(1, 9, ConnectionStatus::Open).await;

    send.await.unwrap().unwrap();
    assert!(opened_at.elapsed() <= interval);
}

#[tokio::test(start_paused = true)]
async fn pending_send_observes_removal() {
    let net = MemoryTransport::new();
    let node = Node::new(&net);
    node.add(1, "alice", 9, "bob").await;
    node.add(1, "alice", 10, "carol").await;

    let router = node.orchestrator.router().clone();
    let send = tokio::spawn(async move {
        router
            .send_message(
                Addressing::outbound(ProfileId(1), ContactId(9)),
                &message("never delivered"),
            )
            .await
    });
    tokio::time::sleep(Duration::from_secs(1)).await;

    node.orchestrator
        .remove_connection(ProfileId(1), ContactId(9))
        .await
        .unwrap();
    let err = timeout(TEST_TIMEOUT, send).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, RegistryError::ContactNotFound { .. }));
}

#[tokio::test(start_paused = true)]
async fn send_to_unknown_pair_is_not_found() {
    let net = MemoryTransport::new();
    let node = Node::new(&net);
    node.add(1, "alice", 9, "bob").await;

    let router = node.orchestrator.router();
    let err = router
        .send_message(Addressing::outbound(ProfileId(2), ContactId(9)), &message("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::ProfileNotFound(ProfileId(2))));

    let err = router
        .send_message(Addressing::outbound(ProfileId(1), ContactId(3)), &message("x"))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test(start_paused = true)]
async fn send_on_closed_stream_is_internal_error() {
    let net = MemoryTransport::new();
    let (_bob, mut accepted) = listener(&net, "bob").await;
    let node = Node::new(&net);

    node.add(1, "alice", 9, "bob").await;
    node.wait_for_status(1, 9, ConnectionStatus::Open).await;

    // Bob hangs up.
    let far = accepted.recv().await.unwrap();
    far.close().await.unwrap();
    node.wait_for_status(1, 9, ConnectionStatus::Closed).await;

    let err = node
        .orchestrator
        .router()
        .send_message(Addressing::outbound(ProfileId(1), ContactId(9)), &message("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Internal(_)));
}

#[tokio::test(start_paused = true)]
async fn stream_from_unknown_remote_is_refused() {
    let net = MemoryTransport::new();
    let a = Node::new(&net);
    let mut b = Node::new(&net);

    // Bob's only contact is carol, so nothing maps alice's stream to a contact.
    b.add(1, "bob", 9, "carol").await;
    a.add(1, "alice", 9, "bob").await;

    // Bob hangs up on the stream instead of keeping a reader for it.
    a.wait_for_status(1, 9, ConnectionStatus::Closed).await;
    let err = a
        .orchestrator
        .router()
        .send_message(Addressing::outbound(ProfileId(1), ContactId(9)), &message("hi?"))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Internal(_)));

    assert!(
        timeout(Duration::from_secs(10), b.inbox.recv())
            .await
            .is_err()
    );
}

#[tokio::test(start_paused = true)]
async fn removal_is_not_blocked_by_a_stalled_write() {
    let net = MemoryTransport::new();
    // Bob accepts alice's stream but never reads from it.
    let (_bob, _accepted) = listener(&net, "bob").await;
    let node = Node::new(&net);
    node.add(1, "alice", 9, "bob").await;
    node.wait_for_status(1, 9, ConnectionStatus::Open).await;

    let router = node.orchestrator.router().clone();
    let send = tokio::spawn(async move {
        router
            .send_message(
                Addressing::outbound(ProfileId(1), ContactId(9)),
                &message(&"x".repeat(200 * 1024)),
            )
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!send.is_finished());

    timeout(
        Duration::from_secs(5),
        node.orchestrator.remove_connection(ProfileId(1), ContactId(9)),
    )
    .await
    .expect("removal hung behind the write")
    .unwrap();
    assert!(!net.is_listening("alice").await);

    let err = timeout(Duration::from_secs(5), send)
        .await
        .expect("send never finished")
        .unwrap()
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test(start_paused = true)]
async fn notifier_failure_does_not_stop_the_reader() {
    let net = MemoryTransport::new();
    let (a, mut b) = connected_pair(&net).await;
    let router = a.orchestrator.router();
    let to_bob = Addressing::outbound(ProfileId(1), ContactId(9));

    b.notifier.set_failing(true);
    router.send_message(to_bob, &message("lost")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    b.notifier.set_failing(false);
    router.send_message(to_bob, &message("kept")).await.unwrap();

    let envelope = timeout(TEST_TIMEOUT, b.inbox.recv()).await.unwrap().unwrap();
    assert_eq!(envelope.message.text, "kept");
}

#[tokio::test(start_paused = true)]
async fn removal_on_receiver_stops_delivery() {
    let net = MemoryTransport::new();
    let (a, mut b) = connected_pair(&net).await;

    // Bob keeps the profile alive with a second contact.
    b.add(1, "bob", 10, "carol").await;
    b.orchestrator
        .remove_connection(ProfileId(1), ContactId(9))
        .await
        .unwrap();

    // Alice's stream to bob was cut when bob's inbound reader stopped.
    a.wait_for_status(1, 9, ConnectionStatus::Closed).await;
    let err = a
        .orchestrator
        .router()
        .send_message(Addressing::outbound(ProfileId(1), ContactId(9)), &message("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Internal(_)));
    assert!(
        timeout(Duration::from_secs(10), b.inbox.recv())
            .await
            .is_err()
    );
}
