use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SharedError;
use crate::types::{PeerStatus, ResourceId, UserId};

/// Every frame exchanged over a session's WebSocket, tagged by `type`.
///
/// Chat traffic and P2P control traffic share one connection; the tag is the
/// only thing that tells them apart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Text chat message
    Chat(ChatFrame),

    /// Chat message referencing an uploaded file
    File(FileFrame),

    /// Peer joins (and optionally reports progress for) a resource swarm
    PeerAnnounce(PeerAnnounce),

    /// Peer leaves a resource swarm
    PeerLeave(PeerLeave),

    /// Request one verified piece of a resource
    PieceRequest(PieceRequest),

    /// Verified piece bytes
    PieceResponse(PieceResponse),

    /// Swarm counters changed for a resource
    SwarmUpdate(SwarmUpdate),

    /// Current peers of a resource, sent to an announcing peer
    PeerList(PeerList),

    /// Another user came online
    PeerConnect(PeerPresence),

    /// Another user went offline
    PeerDisconnect(PeerPresence),

    /// A request on this session failed
    Error(ErrorFrame),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
    /// Overwritten with the session's user on receipt.
    #[serde(default)]
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
    #[serde(default)]
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub file_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerAnnounce {
    pub resource_id: ResourceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PeerStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerLeave {
    pub resource_id: ResourceId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PieceRequest {
    pub resource_id: ResourceId,
    pub piece_index: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PieceResponse {
    pub resource_id: ResourceId,
    pub piece_index: u32,
    /// Base64 on the wire.
    #[serde(with = "base64_bytes")]
    pub piece_data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmUpdate {
    pub resource_id: ResourceId,
    pub swarm_stats: SwarmStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerList {
    pub resource_id: ResourceId,
    pub peers: Vec<PeerInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerPresence {
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub code: String,
    pub message: String,
}

/// Aggregated participation counters for one resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwarmStats {
    pub resource_id: ResourceId,
    pub seeders: u32,
    pub leechers: u32,
    pub completed: u32,
    pub total_size: i64,
}

/// One participant of a swarm, joined with its display name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub user_id: UserId,
    pub display_name: Option<String>,
    pub status: PeerStatus,
    pub progress: f64,
    pub last_seen: DateTime<Utc>,
}

impl Frame {
    pub fn to_text(&self) -> Result<String, SharedError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> Result<Self, SharedError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Chat(_) => "chat",
            Self::File(_) => "file",
            Self::PeerAnnounce(_) => "peer_announce",
            Self::PeerLeave(_) => "peer_leave",
            Self::PieceRequest(_) => "piece_request",
            Self::PieceResponse(_) => "piece_response",
            Self::SwarmUpdate(_) => "swarm_update",
            Self::PeerList(_) => "peer_list",
            Self::PeerConnect(_) => "peer_connect",
            Self::PeerDisconnect(_) => "peer_disconnect",
            Self::Error(_) => "error",
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error(ErrorFrame {
            code: code.to_string(),
            message: message.into(),
        })
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
