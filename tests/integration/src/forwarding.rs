//! Message traffic through a running forwarder.

use std::time::Duration;

use bytes::Bytes;
use relay_core::{ErrorType, MessageType, Outcome, RelayMessage};

use crate::helpers::{
    find_free_port, single_group_config, ClientReply, ClientRequest, FakeNode, TestServer,
};

#[tokio::test]
async fn get_is_answered_by_a_node() {
    let node = FakeNode::start().await;
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path(), &single_group_config(&[node.port()]));
    let mut c = server.connect().await;

    let reply = c.get(1, 42).await;
    assert_eq!(reply.error, ErrorType::None);
    assert_eq!(reply.outcome, Some(Outcome::Sent));
    assert_eq!(reply.payload, Some(Bytes::from_static(b"value-42")));
    assert_eq!(node.ids(), vec![42]);
}

#[tokio::test]
async fn save_is_copied_to_every_replica() {
    let a = FakeNode::start().await;
    let b = FakeNode::start().await;
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path(), &single_group_config(&[a.port(), b.port()]));
    let mut c = server.connect().await;

    let save = RelayMessage::new(MessageType::Save, 1, 7).with_payload(Bytes::from_static(b"x"));
    let reply = c.send(save).await;
    assert_eq!(reply.outcome, Some(Outcome::Queued));

    let at_a = a.wait_for(7, Duration::from_secs(5)).await;
    let at_b = b.wait_for(7, Duration::from_secs(5)).await;
    assert_eq!(at_a.payload, Some(Bytes::from_static(b"x")));
    assert_eq!(at_b.relay_ttl, at_a.relay_ttl);
}

#[tokio::test]
async fn failed_get_is_retried_on_a_sibling() {
    let dead = find_free_port();
    let live = FakeNode::start().await;
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path(), &single_group_config(&[dead, live.port()]));
    let mut c = server.connect().await;

    // the dead node comes first, so it's chosen until it fails
    let reply = c.get(1, 5).await;
    assert_eq!(reply.error, ErrorType::None);
    assert_eq!(reply.payload, Some(Bytes::from_static(b"value-5")));
}

#[tokio::test]
async fn unknown_type_has_no_nodes() {
    let node = FakeNode::start().await;
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path(), &single_group_config(&[node.port()]));
    let mut c = server.connect().await;

    let reply = c.get(99, 1).await;
    assert_eq!(reply.error, ErrorType::NoNodesAvailable);
    assert!(node.ids().is_empty());
}

#[tokio::test]
async fn bulk_gets_come_back_in_order() {
    let node = FakeNode::start().await;
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path(), &single_group_config(&[node.port()]));
    let mut c = server.connect().await;

    let gets: Vec<RelayMessage> = (1..=4)
        .map(|id| RelayMessage::new(MessageType::Get, 1, id))
        .collect();
    let ClientReply::Messages(replies) = c.request(&ClientRequest::Messages(gets)).await else {
        panic!("expected Messages");
    };
    let payloads: Vec<Option<Bytes>> = replies.into_iter().map(|m| m.payload).collect();
    let expected: Vec<Option<Bytes>> = (1..=4)
        .map(|id| Some(Bytes::from(format!("value-{id}"))))
        .collect();
    assert_eq!(payloads, expected);
}

#[tokio::test]
async fn confirmed_writes_replicate_as_plain_writes() {
    let node = FakeNode::start().await;
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path(), &single_group_config(&[node.port()]));
    let mut c = server.connect().await;

    let writes = vec![
        RelayMessage::new(MessageType::UpdateWithConfirm, 1, 11),
        RelayMessage::new(MessageType::Get, 1, 12),
    ];
    let reply = c.request(&ClientRequest::Replicate(writes)).await;
    assert!(matches!(reply, ClientReply::Replicated(1)), "{reply:?}");

    let seen = node.wait_for(11, Duration::from_secs(5)).await;
    assert_eq!(seen.message_type, MessageType::Update);
    assert!(!node.ids().contains(&12));
}

#[tokio::test]
async fn saves_for_a_down_node_are_delivered_when_it_returns() {
    let port = find_free_port();
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path(), &single_group_config(&[port]));
    let mut c = server.connect().await;

    c.send(RelayMessage::new(MessageType::Save, 1, 21)).await;
    c.wait_for_queue_depth(1).await;

    let node = FakeNode::start_on(port).await;
    node.wait_for(21, Duration::from_secs(10)).await;
    c.wait_for_queue_depth(0).await;
}
