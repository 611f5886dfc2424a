//! TCP transport to cache nodes.
//!
//! Each node gets one connection that is opened lazily, reused across
//! requests and dropped after any failure. Requests to the same node are
//! serialized on that connection.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_core::{FaultKind, Outcome, RelayMessage, SerializedMessage, TransportFault};
use relay_forwarding::{NodeDefinition, Transport, TransportFactory};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::codec::{self, NodeReply, NodeRequest};

pub struct TcpTransport {
    host: String,
    port: u16,
    timeout: Duration,
    max_frame: usize,
    conn: Mutex<Option<TcpStream>>,
}

impl TcpTransport {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration, max_frame: usize) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
            max_frame,
            conn: Mutex::new(None),
        }
    }

    /// Sends one request and waits for its reply within the timeout.
    async fn round_trip(&self, request: &NodeRequest) -> Result<NodeReply, TransportFault> {
        let mut conn = self.conn.lock().await;
        let attempt = tokio::time::timeout(self.timeout, async {
            let mut stream = match conn.take() {
                Some(stream) => stream,
                None => {
                    let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
                    stream.set_nodelay(true)?;
                    stream
                }
            };
            codec::write_frame(&mut stream, request).await?;
            let reply = codec::read_frame::<_, NodeReply>(&mut stream, self.max_frame)
                .await?
                .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionReset))?;
            Ok::<_, io::Error>((stream, reply))
        })
        .await;

        match attempt {
            Ok(Ok((stream, reply))) => {
                *conn = Some(stream);
                match reply {
                    NodeReply::Error(detail) => Err(TransportFault::new(FaultKind::ServerDown, detail)),
                    reply => Ok(reply),
                }
            }
            Ok(Err(e)) => {
                debug!(host = %self.host, port = self.port, "send failed: {e}");
                Err(TransportFault::from(e))
            }
            Err(_) => {
                debug!(host = %self.host, port = self.port, "send timed out");
                Err(TransportFault::new(
                    FaultKind::TimedOut,
                    format!("no reply within {:?}", self.timeout),
                ))
            }
        }
    }
}

fn unexpected(reply: &NodeReply) -> TransportFault {
    TransportFault::new(FaultKind::Other, format!("unexpected reply {reply:?}"))
}

/// Copies a node's answer onto the message that was sent.
fn apply_reply(message: &mut RelayMessage, reply: RelayMessage) {
    message.payload = reply.payload;
    message.result_detail = reply.result_detail;
    message.error = reply.error;
    message.outcome = if message.error_occurred() {
        Some(Outcome::Error)
    } else {
        Some(Outcome::Sent)
    };
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send_in(&self, message: &SerializedMessage) -> Result<(), TransportFault> {
        match self.round_trip(&NodeRequest::In(message.clone())).await? {
            NodeReply::Ack => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn send_in_list(&self, messages: &[SerializedMessage]) -> Result<(), TransportFault> {
        match self.round_trip(&NodeRequest::InList(messages.to_vec())).await? {
            NodeReply::Ack => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn send_message(&self, message: &mut RelayMessage) -> Result<(), TransportFault> {
        match self.round_trip(&NodeRequest::Out(message.clone())).await? {
            NodeReply::Message(reply) => {
                apply_reply(message, reply);
                Ok(())
            }
            NodeReply::Ack => {
                message.outcome = Some(Outcome::Sent);
                Ok(())
            }
            other => Err(unexpected(&other)),
        }
    }

    async fn send_out_list(&self, messages: &mut [RelayMessage]) -> Result<(), TransportFault> {
        match self.round_trip(&NodeRequest::OutList(messages.to_vec())).await? {
            NodeReply::Messages(replies) if replies.len() == messages.len() => {
                for (message, reply) in messages.iter_mut().zip(replies) {
                    apply_reply(message, reply);
                }
                Ok(())
            }
            other => Err(unexpected(&other)),
        }
    }
}

/// Creates a [`TcpTransport`] per node with shared limits.
#[derive(Debug, Clone, Copy)]
pub struct TcpTransportFactory {
    pub timeout: Duration,
    pub max_frame: usize,
}

impl TransportFactory for TcpTransportFactory {
    fn create(&self, node: &NodeDefinition) -> Arc<dyn Transport> {
        Arc::new(TcpTransport::new(
            node.host.clone(),
            node.port,
            self.timeout,
            self.max_frame,
        ))
    }
}


#[cfg(test)]
mod tests {
    use relay_core::{ErrorType, MessageType};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use super::*;

    const MAX: usize = 1 << 20;

    fn transport(addr: std::net::SocketAddr, timeout: Duration) -> TcpTransport {
        TcpTransport::new(addr.ip().to_string(), addr.port(), timeout, MAX)
    }

    #[tokio::test]
    async fn delivers_in_messages_and_lists() {
        let (addr, received) = fake::spawn().await;
        let t = transport(addr, Duration::from_secs(2));

        let one = RelayMessage::new(MessageType::Save, 1, 10);
        t.send_in(&SerializedMessage::encode(&one).unwrap()).await.unwrap();
        let list: Vec<SerializedMessage> = [11, 12]
            .into_iter()
            .map(|id| SerializedMessage::encode(&RelayMessage::new(MessageType::Save, 1, id)).unwrap())
            .collect();
        t.send_in_list(&list).await.unwrap();

        assert_eq!(received.ids(), vec![10, 11, 12]);
    }

    #[tokio::test]
    async fn copies_replies_onto_out_messages() {
        let (addr, _) = fake::spawn().await;
        let t = transport(addr, Duration::from_secs(2));

        let mut get = RelayMessage::new(MessageType::Get, 1, 5);
        t.send_message(&mut get).await.unwrap();
        assert_eq!(get.payload.as_deref(), Some(&b"value-5"[..]));
        assert_eq!(get.outcome, Some(Outcome::Sent));
        assert_eq!(get.error, ErrorType::None);

        let mut gets = vec![
            RelayMessage::new(MessageType::Get, 1, 6),
            RelayMessage::new(MessageType::Query, 1, 7),
        ];
        t.send_out_list(&mut gets).await.unwrap();
        assert_eq!(gets[0].payload.as_deref(), Some(&b"value-6"[..]));
        assert_eq!(gets[1].payload.as_deref(), Some(&b"value-7"[..]));
    }

    #[tokio::test]
    async fn refused_connection_is_unreachable() {
        // bind then drop to get a port nobody listens on
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let t = transport(addr, Duration::from_secs(2));
        let msg = SerializedMessage::encode(&RelayMessage::new(MessageType::Save, 1, 1)).unwrap();
        let fault = t.send_in(&msg).await.unwrap_err();
        assert!(fault.kind.is_unreachable(), "{fault}");
    }

    #[tokio::test]
    async fn silent_node_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut sink = Vec::new();
            let _ = stream.read_to_end(&mut sink).await;
        });

        let t = transport(addr, Duration::from_millis(100));
        let mut get = RelayMessage::new(MessageType::Get, 1, 1);
        let fault = t.send_message(&mut get).await.unwrap_err();
        assert_eq!(fault.kind, FaultKind::TimedOut);
        assert!(fault.kind.is_server_down());
    }

    #[tokio::test]
    async fn node_errors_count_as_server_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            while let Ok(Some(_)) = codec::read_frame::<_, NodeRequest>(&mut stream, MAX).await {
                let reply = NodeReply::Error("disk full".into());
                if codec::write_frame(&mut stream, &reply).await.is_err() {
                    return;
                }
            }
        });

        let t = transport(addr, Duration::from_secs(2));
        let msg = SerializedMessage::encode(&RelayMessage::new(MessageType::Save, 1, 1)).unwrap();
        let fault = t.send_in(&msg).await.unwrap_err();
        assert_eq!(fault.kind, FaultKind::ServerDown);
        assert_eq!(fault.detail, "disk full");
    }
}
