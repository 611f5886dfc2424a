//! Startup, shutdown and restart behavior.

use std::time::Duration;

use relay_core::{MessageType, RelayMessage};

use crate::helpers::{find_free_port, single_group_config, FakeNode, TestServer};

#[tokio::test]
async fn status_lists_configured_nodes() {
    let node = FakeNode::start().await;
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path(), &single_group_config(&[node.port()]));
    let mut c = server.connect().await;

    let status = c.status().await;
    assert!(status.contains("name = \"users\""), "{status}");
    assert!(status.contains(&format!("port = {}", node.port())), "{status}");
    assert!(status.contains("chosen = true"), "{status}");
}

#[cfg(unix)]
#[tokio::test]
async fn queued_messages_survive_a_restart() {
    let port = find_free_port();
    let dir = tempfile::tempdir().unwrap();
    let run_state = dir.path().join("run-state.bin");
    // keep the queue from draining into a dead node while it's down
    let config = single_group_config(&[port]).replace(
        "dequeue_interval_secs = 1",
        "dequeue_interval_secs = 3600",
    );

    {
        let server = TestServer::start_with(dir.path(), &config, Some(&run_state));
        let mut c = server.connect().await;
        c.send(RelayMessage::new(MessageType::Save, 1, 31)).await;
        c.send(RelayMessage::new(MessageType::Delete, 1, 32)).await;
        c.wait_for_queue_depth(2).await;
        drop(c);
        server.interrupt();
    }
    assert!(run_state.exists(), "run state was not written");

    let config = config.replace("dequeue_interval_secs = 3600", "dequeue_interval_secs = 1");
    let server = TestServer::start_with(dir.path(), &config, Some(&run_state));
    let mut c = server.connect().await;
    c.wait_for_queue_depth(2).await;

    let node = FakeNode::start_on(port).await;
    node.wait_for(31, Duration::from_secs(10)).await;
    node.wait_for(32, Duration::from_secs(10)).await;
    assert_eq!(node.ids(), vec![31, 32]);
}
