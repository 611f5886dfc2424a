//! Wire protocol between clients, the forwarder and cache nodes.
//!
//! Every frame is a 4-byte big-endian length followed by a bincode
//! payload. Clients send [`ClientRequest`]s to the forwarder; the
//! forwarder sends [`NodeRequest`]s to nodes. Both sides answer every
//! request with exactly one reply frame.

use std::io;

use relay_core::{RelayMessage, SerializedMessage};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// A request from a client to the forwarder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientRequest {
    Message(RelayMessage),
    Messages(Vec<RelayMessage>),
    /// Forward the one-way form of each message.
    Replicate(Vec<RelayMessage>),
    Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientReply {
    /// The message after forwarding, with its outcome and any reply.
    Message(RelayMessage),
    Messages(Vec<RelayMessage>),
    Replicated(usize),
    /// The forwarder status rendered as TOML.
    Status(String),
    Failed(String),
}

/// A request from the forwarder to a cache node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeRequest {
    In(SerializedMessage),
    InList(Vec<SerializedMessage>),
    Out(RelayMessage),
    OutList(Vec<RelayMessage>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeReply {
    Ack,
    Message(RelayMessage),
    Messages(Vec<RelayMessage>),
    Error(String),
}

/// Writes a length-prefixed bincode frame to `w`.
pub async fn write_frame<W, T>(w: &mut W, msg: &T) -> io::Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let data =
        bincode::serialize(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(data.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes is too large to send", data.len()),
        )
    })?;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(&data).await?;
    w.flush().await
}

/// Reads a length-prefixed bincode frame from `r`, rejecting frames
/// larger than `max_len`.
///
/// Returns `None` when the peer closed the stream between frames.
pub async fn read_frame<R, T>(r: &mut R, max_len: usize) -> io::Result<Option<T>>
where
    R: AsyncReadExt + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame size {len} exceeds limit {max_len}"),
        ));
    }
    let mut data = vec![0u8; len];
    r.read_exact(&mut data).await?;
    bincode::deserialize(&data)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
