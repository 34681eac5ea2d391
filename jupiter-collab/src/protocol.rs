//! Binary protocol for Jupiter request relaying.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ doc_id   │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ variable │
//! └──────────┴───────────┴──────────┴──────────┘
//! ```
//!
//! Payloads are themselves bincode-encoded: a [`Request`] for `Request`
//! messages, a [`StampedChecksum`] for `Checksum`, and so on. Causality is
//! carried by the Jupiter timestamp inside each request, so the envelope has
//! no clock of its own.

use jupiter_core::{OtError, Request, StampedChecksum};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Message types for the relay protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client asks to join a document session (payload: PeerInfo)
    Join = 1,
    /// Authoritative content a client (re)starts from (payload: String)
    Snapshot = 2,
    /// Jupiter request in either direction (payload: Request)
    Request = 3,
    /// Count of the receiver's operations the sender incorporated (payload: u64)
    Ack = 4,
    /// Authoritative checksum stamped for the receiving link (payload: StampedChecksum)
    Checksum = 5,
    /// Client asks for a fresh snapshot after detecting divergence
    ResyncRequest = 6,
    /// Relay tells a client its link is broken and must be resynchronized
    ResyncRequired = 7,
    /// Peer joined notification (payload: PeerInfo)
    PeerJoined = 8,
    /// Peer left notification
    PeerLeft = 9,
    /// Heartbeat ping
    Ping = 10,
    /// Heartbeat pong
    Pong = 11,
}

/// Peer identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with explicit peer_id (for testing)
    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Sender for client messages, subject peer for notifications,
    /// nil for relay-originated state.
    pub peer_id: Uuid,
    pub doc_id: Uuid,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, doc_id: Uuid, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            doc_id,
            payload,
        }
    }

    /// Create a join request.
    pub fn join(doc_id: Uuid, info: &PeerInfo) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Join, info.peer_id, doc_id, encode_payload(info)?))
    }

    /// Create a snapshot carrying the authoritative content.
    pub fn snapshot(doc_id: Uuid, content: &str) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            MessageType::Snapshot,
            Uuid::nil(),
            doc_id,
            encode_payload(&content)?,
        ))
    }

    /// Create a Jupiter request message.
    pub fn request(peer_id: Uuid, doc_id: Uuid, request: &Request) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Request, peer_id, doc_id, encode_payload(request)?))
    }

    /// Create an acknowledgment of `count` operations.
    pub fn ack(peer_id: Uuid, doc_id: Uuid, count: u64) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Ack, peer_id, doc_id, encode_payload(&count)?))
    }

    /// Create a checksum message.
    pub fn checksum(doc_id: Uuid, stamped: &StampedChecksum) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            MessageType::Checksum,
            Uuid::nil(),
            doc_id,
            encode_payload(stamped)?,
        ))
    }

    /// Create a resync request.
    pub fn resync_request(peer_id: Uuid, doc_id: Uuid) -> Self {
        Self::new(MessageType::ResyncRequest, peer_id, doc_id, Vec::new())
    }

    /// Create a resync-required notice.
    pub fn resync_required(doc_id: Uuid) -> Self {
        Self::new(MessageType::ResyncRequired, Uuid::nil(), doc_id, Vec::new())
    }

    /// Create a peer joined notification.
    pub fn peer_joined(doc_id: Uuid, info: &PeerInfo) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            MessageType::PeerJoined,
            info.peer_id,
            doc_id,
            encode_payload(info)?,
        ))
    }

    /// Create a peer left notification.
    pub fn peer_left(peer_id: Uuid, doc_id: Uuid) -> Self {
        Self::new(MessageType::PeerLeft, peer_id, doc_id, Vec::new())
    }

    /// Create a ping message.
    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, Uuid::nil(), Vec::new())
    }

    /// Create a pong message.
    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, Uuid::nil(), Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse a Jupiter request payload.
    pub fn jupiter_request(&self) -> Result<Request, ProtocolError> {
        self.payload_as(MessageType::Request)
    }

    /// Parse an acknowledgment count.
    pub fn ack_count(&self) -> Result<u64, ProtocolError> {
        self.payload_as(MessageType::Ack)
    }

    /// Parse a stamped checksum.
    pub fn stamped_checksum(&self) -> Result<StampedChecksum, ProtocolError> {
        self.payload_as(MessageType::Checksum)
    }

    /// Parse snapshot content.
    pub fn snapshot_content(&self) -> Result<String, ProtocolError> {
        self.payload_as(MessageType::Snapshot)
    }

    /// Parse peer info from a join or peer-joined message.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        match self.msg_type {
            MessageType::Join | MessageType::PeerJoined => decode_payload(&self.payload),
            found => Err(ProtocolError::InvalidMessageType {
                expected: MessageType::PeerJoined,
                found,
            }),
        }
    }

    fn payload_as<T: DeserializeOwned>(&self, expected: MessageType) -> Result<T, ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::InvalidMessageType {
                expected,
                found: self.msg_type,
            });
        }
        decode_payload(&self.payload)
    }
}

fn encode_payload<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid message type: expected {expected:?}, found {found:?}")]
    InvalidMessageType {
        expected: MessageType,
        found: MessageType,
    },
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
    #[error("Not joined to a document")]
    NotJoined,
    #[error(transparent)]
    Engine(#[from] OtError),
}
