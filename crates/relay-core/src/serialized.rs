//! Wire-ready form of a relay message.
//!
//! Error queues and spill files hold messages in this form so a backlog
//! never pins live message objects. The routing fields are lifted out of
//! the encoded stream so callers can make queueing decisions without
//! decoding it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::message::{MessageType, RelayMessage};

/// An already-encoded [`RelayMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedMessage {
    pub type_id: i16,
    pub id: i32,
    pub message_type: MessageType,
    pub relay_ttl: i16,
    stream: Bytes,
}

impl SerializedMessage {
    /// Encodes a message.
    pub fn encode(message: &RelayMessage) -> Result<Self, CodecError> {
        let stream = bincode::serialize(message).map_err(CodecError::encode)?;
        Ok(Self {
            type_id: message.type_id,
            id: message.id,
            message_type: message.message_type,
            relay_ttl: message.relay_ttl,
            stream: Bytes::from(stream),
        })
    }

    /// Decodes the stream back into a live message.
    pub fn decode(&self) -> Result<RelayMessage, CodecError> {
        bincode::deserialize(&self.stream).map_err(CodecError::decode)
    }

    pub fn is_two_way(&self) -> bool {
        self.message_type.is_two_way()
    }

    /// The encoded stream.
    pub fn stream(&self) -> &Bytes {
        &self.stream
    }

    /// Size of the encoded stream in bytes.
    pub fn len(&self) -> usize {
        self.stream.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stream.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifts_routing_fields() {
        let msg = RelayMessage::new(MessageType::Save, 5, 77).with_payload("hello");
        let ser = SerializedMessage::encode(&msg).unwrap();
        assert_eq!(ser.type_id, 5);
        assert_eq!(ser.id, 77);
        assert_eq!(ser.message_type, MessageType::Save);
        assert!(!ser.is_two_way());
        assert!(!ser.is_empty());
        assert_eq!(ser.decode().unwrap(), msg);
    }

    #[test]
    fn garbage_stream_fails_to_decode() {
        let msg = RelayMessage::new(MessageType::Save, 5, 77);
        let mut ser = SerializedMessage::encode(&msg).unwrap();
        ser.stream = Bytes::from_static(&[0xff]);
        assert!(matches!(ser.decode(), Err(CodecError::Decode(_))));
    }
}
