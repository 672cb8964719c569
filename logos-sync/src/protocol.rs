//! Binary protocol for the multiplexed sync connection.
//!
//! One physical WebSocket carries three logical sub-channels. Every binary
//! message is a bincode-encoded [`Envelope`]:
//!
//! ```text
//! ┌──────────┬──────────────────────────────────────────┐
//! │ channel  │ frame (ClientFrame or ServerFrame)       │
//! │ 1 byte   │ variant tag + fields, variable length    │
//! └──────────┴──────────────────────────────────────────┘
//! ```
//!
//! Frames are decoded once at the transport boundary into tagged enums, so
//! everything above the transport matches exhaustively on known kinds.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a replicated document.
pub type DocumentId = Uuid;

/// Logical sub-channel multiplexed over the physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Channel {
    /// Chat rooms attached to a document
    Chat = 0,
    /// CRDT join/sync/update traffic; also carries health pings
    Collaboration = 1,
    /// Presence join/leave/list
    Presence = 2,
}

impl Channel {
    /// All sub-channels, in connect order.
    pub const ALL: [Channel; 3] = [Channel::Chat, Channel::Collaboration, Channel::Presence];

    /// The sub-channel used for health checks.
    pub const PRIMARY: Channel = Channel::Collaboration;

    pub fn name(&self) -> &'static str {
        match self {
            Channel::Chat => "chat",
            Channel::Collaboration => "collaboration",
            Channel::Presence => "presence",
        }
    }

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Peer identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
    /// RGBA color for cursor/selection rendering
    pub color: [f32; 4],
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with explicit peer_id (stable color per id)
    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        let hash = peer_id.as_u128();
        let r = (hash & 0xFF) as f32 / 255.0;
        let g = ((hash >> 8) & 0xFF) as f32 / 255.0;
        let b = ((hash >> 16) & 0xFF) as f32 / 255.0;
        Self {
            peer_id,
            name: name.into(),
            color: [r, g, b, 1.0],
        }
    }
}

/// Category of a structured error frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Credential rejected; see [`AUTH_INVALID`] and [`AUTH_EXPIRED`]
    Auth,
    /// Peer could not parse or accept a frame
    Protocol,
    /// Server-side failure
    Server,
}

/// Credential is malformed or revoked.
pub const AUTH_INVALID: u16 = 4001;
/// Credential was valid but has expired.
pub const AUTH_EXPIRED: u16 = 4002;

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientFrame {
    /// Open the sub-channel, authenticating with the shared credential
    Open { credential: Option<String> },
    /// Close the sub-channel
    Close,
    /// Replace the credential on an open sub-channel
    Credential { token: String },
    /// Join a document, carrying what this replica has already seen
    Join {
        document_id: DocumentId,
        state_vector: Vec<u8>,
    },
    /// Stop receiving updates for a document
    Leave { document_id: DocumentId },
    /// Incremental CRDT update produced locally
    Update {
        document_id: DocumentId,
        update: Vec<u8>,
    },
    /// Health check; timestamp is echoed back unmodified
    Ping { timestamp: u64 },
    PresenceAnnounce { document_id: DocumentId, peer: PeerInfo },
    PresenceLeave { document_id: DocumentId },
    Chat { room: String, body: String },
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    /// Sub-channel accepted the `Open`
    Opened,
    /// Answer to `Join`: full state or delta against the joined state vector
    SyncResponse {
        document_id: DocumentId,
        update: Vec<u8>,
    },
    /// Incremental update from another replica
    Update {
        document_id: DocumentId,
        update: Vec<u8>,
    },
    PresenceJoined { document_id: DocumentId, peer: PeerInfo },
    PresenceLeft { document_id: DocumentId, peer_id: Uuid },
    PresenceList {
        document_id: DocumentId,
        peers: Vec<PeerInfo>,
    },
    Chat {
        room: String,
        author: Uuid,
        body: String,
    },
    Error { category: ErrorCategory, code: u16 },
    Pong { timestamp: u64 },
}

impl ServerFrame {
    /// Whether this frame reports a rejected credential.
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            ServerFrame::Error {
                category: ErrorCategory::Auth,
                ..
            }
        )
    }
}

/// A frame tagged with its sub-channel. `F` is [`ClientFrame`] or [`ServerFrame`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<F> {
    pub channel: Channel,
    pub frame: F,
}

impl<F> Envelope<F>
where
    F: Serialize + serde::de::DeserializeOwned,
{
    pub fn new(channel: Channel, frame: F) -> Self {
        Self { channel, frame }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (envelope, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(envelope)
    }
}

/// Wire format errors. Malformed frames are logged and dropped by callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
}
