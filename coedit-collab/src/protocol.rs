//! Binary wire envelope for operation and presence synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ kind     │ sender    │ doc_id   │ version  │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ 8 bytes  │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! The logical schema of an operation on the wire is fixed (kind, position,
//! content/length, author, local_seq, doc_version); the framing around it is
//! the transport collaborator's business, and this envelope is merely the
//! in-process rendering of it.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use coedit_core::Operation;

use crate::presence::PresenceDelta;

/// Envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// An authority-ordered (or client-submitted) document operation
    Operation = 1,
    /// Cursor/selection/join/leave presence delta
    Presence = 2,
    /// Heartbeat ping
    Ping = 3,
    /// Heartbeat pong
    Pong = 4,
}

/// Top-level wire message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: MessageType,
    pub sender: Uuid,
    pub doc_id: Uuid,
    /// For operations: the document version the payload is based on.
    pub version: u64,
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Wrap a document operation.
    pub fn operation(sender: Uuid, doc_id: Uuid, op: &Operation) -> Self {
        let payload = bincode::serde::encode_to_vec(op, bincode::config::standard())
            .unwrap_or_default();
        Self {
            kind: MessageType::Operation,
            sender,
            doc_id,
            version: op.doc_version,
            payload,
        }
    }

    /// Wrap a presence delta.
    pub fn presence(sender: Uuid, doc_id: Uuid, delta: &PresenceDelta) -> Self {
        let payload = bincode::serde::encode_to_vec(delta, bincode::config::standard())
            .unwrap_or_default();
        Self {
            kind: MessageType::Presence,
            sender,
            doc_id,
            version: 0,
            payload,
        }
    }

    /// Heartbeat ping.
    pub fn ping(sender: Uuid, doc_id: Uuid) -> Self {
        Self {
            kind: MessageType::Ping,
            sender,
            doc_id,
            version: 0,
            payload: Vec::new(),
        }
    }

    /// Heartbeat pong.
    pub fn pong(sender: Uuid, doc_id: Uuid) -> Self {
        Self {
            kind: MessageType::Pong,
            sender,
            doc_id,
            version: 0,
            payload: Vec::new(),
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse an operation payload.
    pub fn operation_payload(&self) -> Result<Operation, ProtocolError> {
        if self.kind != MessageType::Operation {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (op, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(op)
    }

    /// Parse a presence payload.
    pub fn presence_payload(&self) -> Result<PresenceDelta, ProtocolError> {
        if self.kind != MessageType::Presence {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (delta, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(delta)
    }

    /// Encoded size in bytes, for transport byte accounting.
    pub fn wire_len(&self) -> u64 {
        self.encode().map(|b| b.len() as u64).unwrap_or(0)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "invalid message type"),
        }
    }
}

impl std::error::Error for ProtocolError {}
