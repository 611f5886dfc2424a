//! Test helpers for spawning a relay-forwarder and fake cache nodes.
//!
//! The wire enums below mirror the server's frame protocol variant for
//! variant; bincode encodes enums by variant index, so order matters.

use std::net::{SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use relay_core::{MessageType, RelayMessage, SerializedMessage};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const MAX_FRAME: usize = 10 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
pub enum ClientRequest {
    Message(RelayMessage),
    Messages(Vec<RelayMessage>),
    Replicate(Vec<RelayMessage>),
    Status,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum ClientReply {
    Message(RelayMessage),
    Messages(Vec<RelayMessage>),
    Replicated(usize),
    Status(String),
    Failed(String),
}

#[derive(Debug, Serialize, Deserialize)]
enum NodeRequest {
    In(SerializedMessage),
    InList(Vec<SerializedMessage>),
    Out(RelayMessage),
    OutList(Vec<RelayMessage>),
}

#[derive(Debug, Serialize, Deserialize)]
enum NodeReply {
    Ack,
    Message(RelayMessage),
    Messages(Vec<RelayMessage>),
    Error(String),
}

async fn write_frame<T: Serialize>(stream: &mut TcpStream, msg: &T) -> std::io::Result<()> {
    let data = bincode::serialize(msg).unwrap();
    stream.write_all(&(data.len() as u32).to_be_bytes()).await?;
    stream.write_all(&data).await
}

async fn read_frame<T: for<'de> Deserialize<'de>>(stream: &mut TcpStream) -> std::io::Result<T> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len) as usize;
    assert!(len <= MAX_FRAME, "frame of {len} bytes");
    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await?;
    Ok(bincode::deserialize(&data).unwrap())
}

/// A cache node running inside the test process.
///
/// Records every message it receives and answers two-way messages with
/// a payload of `value-<id>`.
pub struct FakeNode {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<RelayMessage>>>,
}

impl FakeNode {
    pub async fn start() -> Self {
        Self::start_on(0).await
    }

    /// Starts a node on a specific port, e.g. one a forwarder already
    /// failed to reach.
    pub async fn start_on(port: u16) -> Self {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .unwrap_or_else(|e| panic!("failed to bind fake node on port {port}: {e}"));
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&received);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let seen = Arc::clone(&seen);
                tokio::spawn(async move {
                    while let Ok(request) = read_frame::<NodeRequest>(&mut stream).await {
                        let reply = answer(request, &seen);
                        if write_frame(&mut stream, &reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        Self { addr, received }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn ids(&self) -> Vec<i32> {
        self.received.lock().unwrap().iter().map(|m| m.id).collect()
    }

    pub fn messages(&self) -> Vec<RelayMessage> {
        self.received.lock().unwrap().clone()
    }

    /// Waits up to `timeout` for a message with `id` to arrive.
    pub async fn wait_for(&self, id: i32, timeout: Duration) -> RelayMessage {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(m) = self.messages().into_iter().find(|m| m.id == id) {
                return m;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("message {id} never reached {}; saw {:?}", self.addr, self.ids());
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

fn answer(request: NodeRequest, seen: &Mutex<Vec<RelayMessage>>) -> NodeReply {
    let mut seen = seen.lock().unwrap();
    let reply_to = |mut m: RelayMessage| {
        m.payload = Some(Bytes::from(format!("value-{}", m.id)));
        m
    };
    match request {
        NodeRequest::In(m) => {
            seen.push(m.decode().unwrap());
            NodeReply::Ack
        }
        NodeRequest::InList(list) => {
            seen.extend(list.iter().map(|m| m.decode().unwrap()));
            NodeReply::Ack
        }
        NodeRequest::Out(m) => {
            seen.push(m.clone());
            NodeReply::Message(reply_to(m))
        }
        NodeRequest::OutList(list) => {
            seen.extend(list.iter().cloned());
            NodeReply::Messages(list.into_iter().map(reply_to).collect())
        }
    }
}

/// Renders an inline TOML node list for the given ports on localhost.
pub fn node_list(ports: &[u16]) -> String {
    let nodes: Vec<String> = ports
        .iter()
        .map(|p| format!("{{ host = \"127.0.0.1\", port = {p} }}"))
        .collect();
    format!("[{}]", nodes.join(", "))
}

/// A config with one group, `users`, owning type 1 and holding one
/// cluster of the given node ports.
pub fn single_group_config(ports: &[u16]) -> String {
    format!(
        r#"
[topology]

[[topology.groups]]
name = "users"
retry_count = 1

[[topology.groups.clusters]]
nodes = {}

[[topology.type_settings]]
type_id = 1
group = "users"

[forwarding.queue]
dequeue_interval_secs = 1
"#,
        node_list(ports)
    )
}

/// A relay-forwarder subprocess managed by the test harness.
pub struct TestServer {
    child: Child,
    pub port: u16,
}

impl TestServer {
    /// Starts a relay-forwarder on a random port with `config` appended
    /// to the generated listener settings.
    ///
    /// Blocks until the server is accepting connections (up to 5 seconds).
    pub fn start(dir: &Path, config: &str) -> Self {
        Self::start_with(dir, config, None)
    }

    /// Like [`TestServer::start`], saving and restoring error queues at
    /// `run_state`.
    pub fn start_with(dir: &Path, config: &str, run_state: Option<&Path>) -> Self {
        let port = find_free_port();
        let mut text = format!("bind = \"127.0.0.1\"\nport = {port}\nnode_timeout_ms = 500\n");
        if let Some(path) = run_state {
            text.push_str(&format!("run_state_path = {:?}\n", path.display().to_string()));
        }
        text.push_str(config);
        let config_path = dir.join(format!("relay-{port}.toml"));
        std::fs::write(&config_path, text).unwrap();

        let binary = server_binary();
        let child = Command::new(&binary)
            .arg("--config")
            .arg(&config_path)
            // suppress tracing output in tests
            .env("RUST_LOG", "error")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .unwrap_or_else(|e| {
                panic!("failed to spawn relay-forwarder at {}: {e}", binary.display())
            });

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if std::time::Instant::now() > deadline {
                panic!("relay-forwarder failed to start within 5 seconds on port {port}");
            }
            if std::net::TcpStream::connect(("127.0.0.1", port)).is_ok() {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        Self { child, port }
    }

    pub async fn connect(&self) -> TestClient {
        let stream = TcpStream::connect(("127.0.0.1", self.port))
            .await
            .unwrap_or_else(|e| panic!("failed to connect to 127.0.0.1:{}: {e}", self.port));
        TestClient { stream }
    }

    /// Sends SIGINT and waits for a clean exit.
    #[cfg(unix)]
    pub fn interrupt(mut self) {
        let status = Command::new("kill")
            .arg("-INT")
            .arg(self.child.id().to_string())
            .status()
            .unwrap();
        assert!(status.success(), "kill -INT failed");

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(exit) = self.child.try_wait().unwrap() {
                assert!(exit.success(), "relay-forwarder exited with {exit}");
                return;
            }
            if std::time::Instant::now() > deadline {
                panic!("relay-forwarder did not exit after SIGINT");
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// A client speaking the forwarder's frame protocol.
pub struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    pub async fn request(&mut self, request: &ClientRequest) -> ClientReply {
        write_frame(&mut self.stream, request).await.unwrap();
        read_frame(&mut self.stream).await.unwrap()
    }

    /// Forwards one message and returns it as the forwarder left it.
    pub async fn send(&mut self, message: RelayMessage) -> RelayMessage {
        match self.request(&ClientRequest::Message(message)).await {
            ClientReply::Message(m) => m,
            other => panic!("expected Message, got {other:?}"),
        }
    }

    pub async fn get(&mut self, type_id: i16, id: i32) -> RelayMessage {
        self.send(RelayMessage::new(MessageType::Get, type_id, id)).await
    }

    pub async fn status(&mut self) -> String {
        match self.request(&ClientRequest::Status).await {
            ClientReply::Status(text) => text,
            other => panic!("expected Status, got {other:?}"),
        }
    }

    /// Polls the status until the total queue depth is `depth`.
    pub async fn wait_for_queue_depth(&mut self, depth: usize) {
        let needle = format!("queue_depth = {depth}");
        for _ in 0..100 {
            let status = self.status().await;
            // top-level keys come before the first table header
            if status
                .lines()
                .take_while(|l| !l.starts_with('['))
                .any(|l| l.trim() == needle)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("queue depth never reached {depth}: {}", self.status().await);
    }
}

/// Finds a free TCP port by binding to port 0.
pub fn find_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Locates the relay-forwarder binary in the cargo target directory,
/// building it if it isn't there yet.
fn server_binary() -> PathBuf {
    // test binary is in target/<profile>/deps/
    let mut dir = std::env::current_exe().unwrap();
    dir.pop();
    if dir.ends_with("deps") {
        dir.pop();
    }
    let path = dir.join("relay-forwarder");
    if path.exists() {
        return path;
    }

    let status = Command::new(env!("CARGO"))
        .args(["build", "--bin", "relay-forwarder"])
        .status()
        .unwrap();
    assert!(status.success(), "failed to build relay-forwarder");
    assert!(
        path.exists(),
        "relay-forwarder binary not found.\nlooked at: {}",
        path.display()
    );
    path
}
