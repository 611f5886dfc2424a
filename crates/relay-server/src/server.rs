//! The client listener in front of the forwarder.
//!
//! [`serve`] owns the whole life of a running relay: it accepts clients
//! until told to stop, then tears down in a fixed order. Client
//! connections finish the request they're in and close; the forwarder
//! stops its maintenance loops and flushes node buffers; the error queues
//! are written to the run-state file; the drop logger goes last so drops
//! raised during teardown still reach the log.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use relay_forwarding::Forwarder;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::codec::{self, ClientReply, ClientRequest};

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How [`serve`] runs.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// Clients beyond this many are disconnected on arrival.
    pub max_connections: usize,
    pub max_frame: usize,
    /// Where the error queues are saved once the forwarder has stopped.
    pub run_state: Option<PathBuf>,
}

/// Serves clients on `listener` until `stop` completes, then shuts the
/// relay down. Fails only if the run state can't be saved.
pub async fn serve(
    listener: TcpListener,
    forwarder: Arc<Forwarder>,
    options: ServeOptions,
    stop: impl Future<Output = ()>,
) -> io::Result<()> {
    let drop_log = spawn_drop_logger(&forwarder);
    let (closing, closed) = watch::channel(false);
    let mut clients = JoinSet::new();
    tokio::pin!(stop);

    info!(
        addr = %listener.local_addr()?,
        max_connections = options.max_connections,
        "relay accepting clients"
    );

    loop {
        tokio::select! {
            () = &mut stop => break,
            Some(done) = clients.join_next(), if !clients.is_empty() => log_client_exit(done),
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                };
                if clients.len() >= options.max_connections {
                    warn!(%peer, open = clients.len(), "client refused, relay is at its connection cap");
                    continue;
                }
                let forwarder = Arc::clone(&forwarder);
                let closed = closed.clone();
                let max_frame = options.max_frame;
                clients.spawn(async move {
                    if let Err(e) = handle_connection(stream, forwarder, max_frame, closed).await {
                        debug!(%peer, "client dropped: {e}");
                    }
                });
            }
        }
    }

    drop(listener);
    closing.send_replace(true);
    info!(open = clients.len(), "stop requested, finishing client requests");
    while let Some(done) = clients.join_next().await {
        log_client_exit(done);
    }

    let saved = shutdown(Arc::clone(&forwarder), options.run_state.as_deref()).await;
    drop_log.abort();
    saved
}

fn log_client_exit(done: Result<(), tokio::task::JoinError>) {
    if let Err(e) = done {
        if e.is_panic() {
            error!("client task panicked: {e}");
        }
    }
}

/// Serves one client until it disconnects or the relay starts closing.
/// A request that was already read is always answered.
async fn handle_connection(
    mut stream: TcpStream,
    forwarder: Arc<Forwarder>,
    max_frame: usize,
    mut closed: watch::Receiver<bool>,
) -> io::Result<()> {
    stream.set_nodelay(true)?;
    loop {
        let request = tokio::select! {
            read = codec::read_frame::<_, ClientRequest>(&mut stream, max_frame) => read?,
            _ = closed.changed() => return Ok(()),
        };
        let Some(request) = request else {
            return Ok(());
        };
        let reply = dispatch(&forwarder, request).await;
        codec::write_frame(&mut stream, &reply).await?;
    }
}

/// Runs one client request against the forwarder.
pub(crate) async fn dispatch(forwarder: &Forwarder, request: ClientRequest) -> ClientReply {
    match request {
        ClientRequest::Message(mut message) => match forwarder.handle_message(&mut message).await {
            Ok(()) => ClientReply::Message(message),
            Err(e) => ClientReply::Failed(e.to_string()),
        },
        ClientRequest::Messages(mut messages) => {
            match forwarder.handle_messages(&mut messages).await {
                Ok(()) => ClientReply::Messages(messages),
                Err(e) => ClientReply::Failed(e.to_string()),
            }
        }
        ClientRequest::Replicate(messages) => match forwarder.replicate_all(&messages).await {
            Ok(count) => ClientReply::Replicated(count),
            Err(e) => ClientReply::Failed(e.to_string()),
        },
        ClientRequest::Status => match toml::to_string(&forwarder.status()) {
            Ok(text) => ClientReply::Status(text),
            Err(e) => ClientReply::Failed(e.to_string()),
        },
    }
}

/// Logs every message the forwarder gives up on. Runs until aborted.
pub fn spawn_drop_logger(forwarder: &Forwarder) -> JoinHandle<()> {
    let mut dropped = forwarder.subscribe_dropped();
    tokio::spawn(async move {
        loop {
            match dropped.recv().await {
                Ok(message) => debug!(
                    type_id = message.type_id,
                    id = message.id,
                    message_type = ?message.message_type,
                    "message dropped"
                ),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("drop log fell behind, skipped {n} notifications")
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

/// Reads a saved run state. A missing file is not an error.
pub fn load_run_state(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(blob) => Ok(Some(blob)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Writes the run state to a temp file and renames it into place.
pub fn save_run_state(path: &Path, blob: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, blob)?;
    std::fs::rename(&tmp, path)
}

/// Stops the forwarder and, if `path` is set, saves its error queues.
async fn shutdown(forwarder: Arc<Forwarder>, path: Option<&Path>) -> io::Result<()> {
    forwarder.shutdown().await;
    info!(queued = forwarder.queue_depth(), "forwarder stopped");
    let Some(path) = path else {
        return Ok(());
    };
    let saver = Arc::clone(&forwarder);
    let blob = tokio::task::spawn_blocking(move || saver.run_state())
        .await
        .map_err(io::Error::other)?
        .map_err(io::Error::other)?;
    save_run_state(path, &blob)?;
    info!(path = %path.display(), bytes = blob.len(), "run state saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use bytes::Bytes;
    use relay_core::{ErrorType, MessageType, Outcome, RelayMessage};
    use relay_forwarding::{
        ClusterDefinition, ForwardingConfig, GroupDefinition, NodeDefinition, TopologyConfig,
        TypeSetting,
    };
    use tokio::sync::oneshot;

    use super::*;
    use crate::transport::{fake, TcpTransportFactory};

    fn topology(nodes: &[SocketAddr]) -> TopologyConfig {
        TopologyConfig {
            groups: vec![GroupDefinition {
                name: "users".into(),
                retry_count: 1,
                clusters: vec![ClusterDefinition {
                    nodes: nodes
                        .iter()
                        .map(|a| NodeDefinition {
                            host: a.ip().to_string(),
                            port: a.port(),
                            ..NodeDefinition::default()
                        })
                        .collect(),
                }],
                ..GroupDefinition::default()
            }],
            type_settings: vec![TypeSetting {
                type_id: 1,
                group: "users".into(),
                ..TypeSetting::default()
            }],
            ..TopologyConfig::default()
        }
    }

    fn forwarder(nodes: &[SocketAddr]) -> Forwarder {
        let factory = TcpTransportFactory {
            timeout: Duration::from_secs(2),
            max_frame: 1 << 20,
        };
        Forwarder::new(&topology(nodes), ForwardingConfig::default(), Arc::new(factory), None)
            .unwrap()
    }

    async fn wait_for(received: &fake::Received, count: usize) {
        for _ in 0..200 {
            if received.ids().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("node saw {:?}, wanted {count} messages", received.ids());
    }

    #[tokio::test]
    async fn get_returns_the_node_reply() {
        let (addr, _) = fake::spawn().await;
        let fwd = forwarder(&[addr]);

        let reply = dispatch(&fwd, ClientRequest::Message(RelayMessage::new(MessageType::Get, 1, 9))).await;
        let ClientReply::Message(msg) = reply else {
            panic!("expected a message, got {reply:?}");
        };
        assert_eq!(msg.payload.as_deref(), Some(&b"value-9"[..]));
        assert_eq!(msg.outcome, Some(Outcome::Sent));
    }

    #[tokio::test]
    async fn saves_reach_every_replica() {
        let (a, seen_a) = fake::spawn().await;
        let (b, seen_b) = fake::spawn().await;
        let fwd = forwarder(&[a, b]);

        let save = RelayMessage::new(MessageType::Save, 1, 3).with_payload(Bytes::from_static(b"x"));
        let reply = dispatch(&fwd, ClientRequest::Message(save)).await;
        assert!(matches!(reply, ClientReply::Message(ref m) if m.outcome == Some(Outcome::Queued)));

        wait_for(&seen_a, 1).await;
        wait_for(&seen_b, 1).await;
        assert_eq!(seen_a.messages()[0].payload.as_deref(), Some(&b"x"[..]));
    }

    #[tokio::test]
    async fn unknown_type_comes_back_with_no_nodes() {
        let (addr, _) = fake::spawn().await;
        let fwd = forwarder(&[addr]);

        let reply = dispatch(&fwd, ClientRequest::Message(RelayMessage::new(MessageType::Get, 77, 1))).await;
        let ClientReply::Message(msg) = reply else {
            panic!("expected a message, got {reply:?}");
        };
        assert_eq!(msg.error, ErrorType::NoNodesAvailable);
    }

    #[tokio::test]
    async fn bulk_gets_and_replication() {
        let (addr, seen) = fake::spawn().await;
        let fwd = forwarder(&[addr]);

        let gets = vec![
            RelayMessage::new(MessageType::Get, 1, 1),
            RelayMessage::new(MessageType::Get, 1, 2),
        ];
        let ClientReply::Messages(replies) = dispatch(&fwd, ClientRequest::Messages(gets)).await else {
            panic!("expected messages");
        };
        assert_eq!(replies[1].payload.as_deref(), Some(&b"value-2"[..]));

        let writes = vec![
            RelayMessage::new(MessageType::SaveWithConfirm, 1, 5),
            RelayMessage::new(MessageType::Get, 1, 6),
        ];
        let reply = dispatch(&fwd, ClientRequest::Replicate(writes)).await;
        assert_eq!(reply, ClientReply::Replicated(1));
        wait_for(&seen, 3).await;
        let replicated = seen.messages().into_iter().find(|m| m.id == 5).unwrap();
        assert_eq!(replicated.message_type, MessageType::Save);
    }

    #[tokio::test]
    async fn status_is_toml() {
        let (addr, _) = fake::spawn().await;
        let fwd = forwarder(&[addr]);
        let ClientReply::Status(text) = dispatch(&fwd, ClientRequest::Status).await else {
            panic!("expected status");
        };
        assert!(text.contains("users"));
        assert!(text.contains("queue_depth"));
    }

    /// Runs `serve` on a local port. Completing the returned sender stops it.
    async fn start(
        fwd: &Arc<Forwarder>,
        options: ServeOptions,
    ) -> (SocketAddr, oneshot::Sender<()>, JoinHandle<io::Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, Arc::clone(fwd), options, async move {
            let _ = stopped.await;
        }));
        (addr, stop, server)
    }

    fn options(max_connections: usize) -> ServeOptions {
        ServeOptions {
            max_connections,
            max_frame: 1 << 20,
            run_state: None,
        }
    }

    async fn get(client: &mut TcpStream, id: i32) -> RelayMessage {
        let request = ClientRequest::Message(RelayMessage::new(MessageType::Get, 1, id));
        codec::write_frame(client, &request).await.unwrap();
        match codec::read_frame(client, 1 << 20).await.unwrap() {
            Some(ClientReply::Message(msg)) => msg,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn serves_clients_over_tcp() {
        let (node, _) = fake::spawn().await;
        let fwd = Arc::new(forwarder(&[node]));
        let (addr, stop, server) = start(&fwd, options(8)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        for id in [1, 2] {
            let msg = get(&mut client, id).await;
            assert_eq!(msg.payload, Some(Bytes::from(format!("value-{id}"))));
        }

        stop.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn clients_over_the_cap_are_disconnected() {
        let (node, _) = fake::spawn().await;
        let fwd = Arc::new(forwarder(&[node]));
        let (addr, stop, server) = start(&fwd, options(1)).await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        get(&mut first, 1).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        let refused = codec::read_frame::<_, ClientReply>(&mut second, 1 << 20).await;
        assert!(!matches!(refused, Ok(Some(_))), "{refused:?}");

        // the first client is unaffected
        get(&mut first, 2).await;
        stop.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn idle_clients_do_not_hold_up_shutdown() {
        let (node, _) = fake::spawn().await;
        let fwd = Arc::new(forwarder(&[node]));
        let (addr, stop, server) = start(&fwd, options(8)).await;

        let mut idle = TcpStream::connect(addr).await.unwrap();
        get(&mut idle, 1).await;

        stop.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("serve kept waiting on an idle client")
            .unwrap()
            .unwrap();
        let closed = codec::read_frame::<_, ClientReply>(&mut idle, 1 << 20).await;
        assert!(matches!(closed, Ok(None) | Err(_)), "{closed:?}");
    }

    #[test]
    fn run_state_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("run.bin");

        assert_eq!(load_run_state(&path).unwrap(), None);
        save_run_state(&path, b"blob").unwrap();
        assert_eq!(load_run_state(&path).unwrap(), Some(b"blob".to_vec()));
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stopping_saves_queued_messages() {
        // nothing listens here, so saves land in the error queue
        let dead = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.bin");
        let fwd = Arc::new(forwarder(&[dead]));
        let (addr, stop, server) = start(
            &fwd,
            ServeOptions {
                run_state: Some(path.clone()),
                ..options(8)
            },
        )
        .await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let save = ClientRequest::Message(RelayMessage::new(MessageType::Save, 1, 4));
        codec::write_frame(&mut client, &save).await.unwrap();
        let reply: Option<ClientReply> = codec::read_frame(&mut client, 1 << 20).await.unwrap();
        assert!(matches!(reply, Some(ClientReply::Message(_))), "{reply:?}");
        for _ in 0..200 {
            if fwd.queue_depth() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fwd.queue_depth(), 1);

        stop.send(()).unwrap();
        server.await.unwrap().unwrap();

        let blob = load_run_state(&path).unwrap().unwrap();
        let factory = TcpTransportFactory {
            timeout: Duration::from_secs(2),
            max_frame: 1 << 20,
        };
        let restored = Forwarder::new(
            &topology(&[dead]),
            ForwardingConfig::default(),
            Arc::new(factory),
            Some(&blob),
        )
        .unwrap();
        assert_eq!(restored.queue_depth(), 1);
    }
}
