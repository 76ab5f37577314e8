//! Integration tests for the Node public API.
//!
//! These tests exercise the lifecycle state machine, the error surface and
//! the read-only snapshots exposed through the Node facade, including raw
//! protocol peers that speak the wire format directly.

use std::collections::HashSet;
use std::time::Duration;

use floodsub::{
    decode_rpc, encode_rpc, read_frame, write_frame, FloodSubConfig, FloodSubError, MemoryNetwork,
    MemoryTransport, Node, NodeState, PeerId, Rpc, SubOpts, Transport, PROTOCOL_ID,
};
use tokio::time::{sleep, timeout, Instant};

type TestNode = Node<MemoryTransport>;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const SHORT_TIMEOUT: Duration = Duration::from_secs(2);
const POLL: Duration = Duration::from_millis(10);
const MAX: usize = floodsub::DEFAULT_MAX_TRANSMIT_SIZE;

async fn started_node(network: &MemoryNetwork) -> TestNode {
    let node = Node::new(network.transport(PeerId::random()));
    node.start().await.expect("start failed");
    node
}

async fn wait_for_peers(node: &TestNode, expected: &[PeerId]) {
    let expected: HashSet<PeerId> = expected.iter().copied().collect();
    let deadline = Instant::now() + TEST_TIMEOUT;
    loop {
        let current: HashSet<PeerId> = node.peers().await.into_iter().collect();
        if current == expected {
            return;
        }
        assert!(Instant::now() < deadline, "peers {:?} never became {:?}", current, expected);
        sleep(POLL).await;
    }
}

async fn wait_for_subscriber(node: &TestNode, topic: &str, peer: PeerId) {
    let deadline = Instant::now() + TEST_TIMEOUT;
    while !node.subscribers(topic).await.contains(&peer) {
        assert!(Instant::now() < deadline, "timed out waiting for subscriber");
        sleep(POLL).await;
    }
}

fn floodsub_error(err: &anyhow::Error) -> Option<&FloodSubError> {
    err.downcast_ref::<FloodSubError>()
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn node_identity_comes_from_transport() {
    let network = MemoryNetwork::new();
    let id = PeerId::random();
    let node = Node::new(network.transport(id));

    assert_eq!(node.peer_id(), id);
    assert_eq!(node.transport().local_peer_id(), id);
    assert_eq!(node.state(), NodeState::Stopped);
}

#[tokio::test]
async fn operations_fail_with_not_started() {
    let network = MemoryNetwork::new();
    let node = Node::new(network.transport(PeerId::random()));

    let errors = vec![
        node.subscribe("Z").await.unwrap_err(),
        node.subscribe_many(&["a", "b"]).await.unwrap_err(),
        node.unsubscribe("Z").await.unwrap_err(),
        node.unsubscribe_many(&["a"]).await.unwrap_err(),
        node.publish("Z", b"x".to_vec()).await.unwrap_err(),
        node.publish_many(&["a", "b"], b"x".to_vec()).await.unwrap_err(),
        node.connect(&PeerId::random()).await.unwrap_err(),
        node.disconnect(&PeerId::random()).await.unwrap_err(),
    ];
    for err in &errors {
        assert_eq!(floodsub_error(err), Some(&FloodSubError::NotStarted), "{}", err);
    }
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let network = MemoryNetwork::new();
    let node = Node::new(network.transport(PeerId::random()));

    node.stop().await.expect("stop while stopped");
    node.start().await.expect("first start");
    node.start().await.expect("second start");
    assert_eq!(node.state(), NodeState::Started);

    node.stop().await.expect("first stop");
    node.stop().await.expect("second stop");
    assert_eq!(node.state(), NodeState::Stopped);

    assert_eq!(
        floodsub_error(&node.subscribe("Z").await.unwrap_err()),
        Some(&FloodSubError::NotStarted)
    );
}

#[tokio::test]
async fn stop_clears_all_protocol_state() {
    let network = MemoryNetwork::new();
    let a = started_node(&network).await;
    let b = started_node(&network).await;
    a.connect(&b.peer_id()).await.unwrap();
    wait_for_peers(&a, &[b.peer_id()]).await;

    a.subscribe("mine").await.unwrap();
    b.subscribe("theirs").await.unwrap();
    wait_for_subscriber(&a, "theirs", b.peer_id()).await;

    a.stop().await.unwrap();

    assert!(a.peers().await.is_empty());
    assert!(a.subscriptions().await.is_empty());
    assert!(a.topics().await.is_empty());
    assert!(a.subscribers("theirs").await.is_empty());

    // Local subscriptions do not survive into the next run.
    a.start().await.unwrap();
    assert!(a.subscriptions().await.is_empty());
}

#[tokio::test]
async fn restart_renegotiates_with_known_peers() {
    let network = MemoryNetwork::new();
    let a = started_node(&network).await;
    let b = started_node(&network).await;
    b.connect(&a.peer_id()).await.unwrap();
    wait_for_peers(&a, &[b.peer_id()]).await;

    b.stop().await.unwrap();
    wait_for_peers(&a, &[]).await;

    b.start().await.unwrap();
    wait_for_peers(&a, &[b.peer_id()]).await;
    wait_for_peers(&b, &[a.peer_id()]).await;

    let mut a_rx = a.messages("after-restart");
    a.subscribe("after-restart").await.unwrap();
    wait_for_subscriber(&b, "after-restart", a.peer_id()).await;
    b.publish("after-restart", b"welcome back".to_vec()).await.unwrap();

    let msg = timeout(TEST_TIMEOUT, a_rx.recv()).await.unwrap().unwrap();
    assert_eq!(msg.data, b"welcome back");
}

#[tokio::test]
async fn event_receivers_survive_restart() {
    let network = MemoryNetwork::new();
    let node = Node::new(network.transport(PeerId::random()));
    let mut rx = node.messages("Z");

    node.start().await.unwrap();
    node.subscribe("Z").await.unwrap();
    node.publish("Z", b"first".to_vec()).await.unwrap();
    assert_eq!(timeout(SHORT_TIMEOUT, rx.recv()).await.unwrap().unwrap().data, b"first");

    node.stop().await.unwrap();
    node.start().await.unwrap();
    node.subscribe("Z").await.unwrap();
    node.publish("Z", b"second".to_vec()).await.unwrap();
    assert_eq!(timeout(SHORT_TIMEOUT, rx.recv()).await.unwrap().unwrap().data, b"second");
}

#[tokio::test]
async fn seqnos_stay_distinct_across_restarts() {
    let network = MemoryNetwork::new();
    let node = Node::new(network.transport(PeerId::random()));

    let mut ids = HashSet::new();
    for _ in 0..3 {
        node.start().await.unwrap();
        for _ in 0..5 {
            ids.insert(node.publish("nobody", b"x".to_vec()).await.unwrap());
        }
        node.stop().await.unwrap();
    }
    assert_eq!(ids.len(), 15);
}

// ============================================================================
// Connections
// ============================================================================

#[tokio::test]
async fn connect_to_unknown_peer_is_unreachable() {
    let network = MemoryNetwork::new();
    let node = started_node(&network).await;
    let stranger = PeerId::random();

    let err = node.connect(&stranger).await.unwrap_err();
    assert_eq!(floodsub_error(&err), Some(&FloodSubError::PeerUnreachable(stranger)));
}

#[tokio::test]
async fn connect_to_stopped_peer_is_not_supported() {
    let network = MemoryNetwork::new();
    let a = started_node(&network).await;
    let b = Node::new(network.transport(PeerId::random()));

    let err = a.connect(&b.peer_id()).await.unwrap_err();
    assert!(matches!(
        floodsub_error(&err),
        Some(FloodSubError::ProtocolNotSupported { .. })
    ));
    assert!(a.peers().await.is_empty());
}

#[tokio::test]
async fn simultaneous_connects_both_succeed() {
    for _ in 0..20 {
        let network = MemoryNetwork::new();
        let a = started_node(&network).await;
        let b = started_node(&network).await;

        let (b_id, a_id) = (b.peer_id(), a.peer_id());
        let (ra, rb) = tokio::join!(a.connect(&b_id), b.connect(&a_id));
        ra.expect("a -> b");
        rb.expect("b -> a");

        wait_for_peers(&a, &[b.peer_id()]).await;
        wait_for_peers(&b, &[a.peer_id()]).await;

        let mut b_rx = b.messages("Z");
        b.subscribe("Z").await.unwrap();
        wait_for_subscriber(&a, "Z", b.peer_id()).await;
        a.publish("Z", b"converged".to_vec()).await.unwrap();
        assert_eq!(timeout(SHORT_TIMEOUT, b_rx.recv()).await.unwrap().unwrap().data, b"converged");
    }
}

#[tokio::test]
async fn connecting_twice_keeps_one_stream() {
    let network = MemoryNetwork::new();
    let a = started_node(&network).await;
    let b = started_node(&network).await;

    a.connect(&b.peer_id()).await.unwrap();
    a.connect(&b.peer_id()).await.unwrap();
    wait_for_peers(&a, &[b.peer_id()]).await;
    wait_for_peers(&b, &[a.peer_id()]).await;
}

#[tokio::test]
async fn disconnect_reports_whether_peer_was_connected() {
    let network = MemoryNetwork::new();
    let a = started_node(&network).await;
    let b = started_node(&network).await;
    a.connect(&b.peer_id()).await.unwrap();
    wait_for_peers(&b, &[a.peer_id()]).await;

    assert!(a.disconnect(&b.peer_id()).await.unwrap());
    assert!(!a.disconnect(&b.peer_id()).await.unwrap());
    wait_for_peers(&b, &[]).await;
}

// ============================================================================
// Raw protocol peers
// ============================================================================

#[tokio::test]
async fn raw_peer_receives_subscription_announcement() {
    let network = MemoryNetwork::new();
    let node = started_node(&network).await;
    node.subscribe_many(&["b", "a"]).await.unwrap();

    let raw = network.transport(PeerId::random());
    let mut stream = raw.dial_protocol(&node.peer_id(), PROTOCOL_ID).await.unwrap();

    let frame = timeout(SHORT_TIMEOUT, read_frame(&mut stream, MAX))
        .await
        .unwrap()
        .unwrap()
        .expect("stream closed before announcement");
    let rpc = decode_rpc(&frame, MAX).unwrap();
    assert_eq!(rpc.subscriptions, vec![SubOpts::subscribe("a"), SubOpts::subscribe("b")]);
    assert!(rpc.messages.is_empty());
}

#[tokio::test]
async fn malformed_envelope_drops_only_the_offender() {
    let network = MemoryNetwork::new();
    let node = started_node(&network).await;
    let friend = started_node(&network).await;
    friend.connect(&node.peer_id()).await.unwrap();

    let raw_id = PeerId::random();
    let raw = network.transport(raw_id);
    let mut stream = raw.dial_protocol(&node.peer_id(), PROTOCOL_ID).await.unwrap();
    let sub = encode_rpc(&Rpc::with_subscriptions(vec![SubOpts::subscribe("Z")]), MAX).unwrap();
    write_frame(&mut stream, &sub).await.unwrap();
    wait_for_subscriber(&node, "Z", raw_id).await;
    wait_for_peers(&node, &[raw_id, friend.peer_id()]).await;

    write_frame(&mut stream, b"definitely not an envelope").await.unwrap();

    wait_for_peers(&node, &[friend.peer_id()]).await;
    assert_eq!(node.topics().await.get("Z"), Some(&HashSet::new()));
    assert_eq!(node.state(), NodeState::Started);

    let eof = timeout(SHORT_TIMEOUT, read_frame(&mut stream, MAX)).await.unwrap();
    assert!(matches!(eof, Ok(None)));
}

#[tokio::test]
async fn oversized_publish_is_rejected() {
    let network = MemoryNetwork::new();
    let config = FloodSubConfig {
        max_transmit_size: 1024,
        ..Default::default()
    };
    let node = Node::with_config(network.transport(PeerId::random()), config);
    node.start().await.unwrap();

    let err = node.publish("Z", vec![0u8; 4096]).await.unwrap_err();
    assert!(matches!(
        floodsub_error(&err),
        Some(FloodSubError::MessageTooLarge { max: 1024, .. })
    ));
    node.publish("Z", vec![0u8; 128]).await.expect("small publish");
}

#[tokio::test]
async fn publisher_can_opt_out_of_own_messages() {
    let network = MemoryNetwork::new();
    let config = FloodSubConfig {
        deliver_own_messages: false,
        ..Default::default()
    };
    let a = Node::with_config(network.transport(PeerId::random()), config);
    a.start().await.unwrap();
    let b = started_node(&network).await;
    a.connect(&b.peer_id()).await.unwrap();

    let mut a_rx = a.messages("Z");
    let mut b_rx = b.messages("Z");
    a.subscribe("Z").await.unwrap();
    b.subscribe("Z").await.unwrap();
    wait_for_subscriber(&a, "Z", b.peer_id()).await;

    a.publish("Z", b"only for b".to_vec()).await.unwrap();

    assert_eq!(timeout(SHORT_TIMEOUT, b_rx.recv()).await.unwrap().unwrap().data, b"only for b");
    assert!(timeout(Duration::from_millis(300), a_rx.recv()).await.is_err());
}
